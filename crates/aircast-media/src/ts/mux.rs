// crates/aircast-media/src/ts/mux.rs
//
// Single-program MPEG-TS muxer.
//
// Control-plane cadence: the PAT+PMT pair is resent before every video access
// unit, so as long as frames keep flowing (and the tick engine guarantees
// they do) a late joiner sees the stream structure inside any 500 ms window.
// During the boot window, before media exists, the sink interleaves PSI with
// null packets on the same guarantee.
//
// PCR: carried on the audio PID until the first video key frame has been
// muxed, then on the configured carrier. Both halves stamp PCR from the
// access unit's transport PTS (ext = 0) — the emission pacing upstream keeps
// wall clock and PTS aligned, which is what makes that legal.

use bytes::BytesMut;

use super::types::*;
use crate::encoder::{EncodedPacket, StreamKind};

/// Offset subtracted from nothing: PTS lead over PCR, in 90 kHz ticks.
/// Decoders need the clock to run slightly behind presentation.
const PCR_LEAD_90K: u64 = 9_000; // 100 ms

pub struct TsMuxer {
    pcr_carrier: StreamKind,
    /// False until the first video key frame; PCR rides audio meanwhile.
    video_bootstrapped: bool,
    psi_version: u8,
    cc_pat:   u8,
    cc_pmt:   u8,
    cc_video: u8,
    cc_audio: u8,
    pat_section: Vec<u8>,
    pmt_section: Vec<u8>,
}

impl TsMuxer {
    pub fn new(pcr_carrier: StreamKind) -> Self {
        let psi_version = 0;
        Self {
            pcr_carrier,
            video_bootstrapped: false,
            psi_version,
            cc_pat: 0,
            cc_pmt: 0,
            cc_video: 0,
            cc_audio: 0,
            pat_section: psi_section(TABLE_ID_PAT, 1, psi_version, &pat_body(1, PID_PMT)),
            pmt_section: psi_section(
                TABLE_ID_PMT,
                1,
                psi_version,
                &pmt_body(
                    PID_VIDEO,
                    &[(STREAM_TYPE_H264, PID_VIDEO), (STREAM_TYPE_AAC, PID_AUDIO)],
                ),
            ),
        }
    }

    /// Emit the PAT+PMT pair (one packet each).
    pub fn write_psi(&mut self, out: &mut BytesMut) {
        let pat = std::mem::take(&mut self.pat_section);
        self.write_section(out, PID_PAT, &pat);
        self.pat_section = pat;
        let pmt = std::mem::take(&mut self.pmt_section);
        self.write_section(out, PID_PMT, &pmt);
        self.pmt_section = pmt;
    }

    fn write_section(&mut self, out: &mut BytesMut, pid: u16, section: &[u8]) {
        let cc = self.bump_cc(pid);
        write_ts_header(out, pid, true, false, true, cc);
        out.extend_from_slice(&[0x00]); // pointer_field
        out.extend_from_slice(section);
        let used = 4 + 1 + section.len();
        debug_assert!(used <= TS_PACKET_SIZE);
        out.extend_from_slice(&vec![0xffu8; TS_PACKET_SIZE - used]);
    }

    /// Mux one encoded access unit into TS packets. Video AUs are preceded by
    /// a fresh PSI pair; key frames are flagged random-access.
    pub fn write_access_unit(&mut self, out: &mut BytesMut, pkt: &EncodedPacket) {
        let (pid, stream_id) = match pkt.kind {
            StreamKind::Video => (PID_VIDEO, STREAM_ID_VIDEO),
            StreamKind::Audio => (PID_AUDIO, STREAM_ID_AUDIO),
        };
        if pkt.kind == StreamKind::Video {
            self.write_psi(out);
            if pkt.key {
                self.video_bootstrapped = true;
            }
        }

        let dts = (pkt.dts_90k != pkt.pts_90k).then_some(pkt.dts_90k as u64);
        let pes = pes_header(stream_id, pkt.data.len(), pkt.pts_90k as u64, dts);
        let pcr = self
            .carries_pcr(pkt.kind)
            .then(|| (pkt.pts_90k as u64).saturating_sub(PCR_LEAD_90K));

        self.write_pes_packets(out, pid, &pes, &pkt.data, pkt.key, pcr);
    }

    fn carries_pcr(&self, kind: StreamKind) -> bool {
        if self.video_bootstrapped {
            kind == self.pcr_carrier
        } else {
            // audio carries the clock until video is decodable
            kind == StreamKind::Audio
        }
    }

    /// One null packet (boot-window gap fill).
    pub fn write_null(&mut self, out: &mut BytesMut) {
        write_ts_header(out, PID_NULL, false, false, true, 0);
        out.extend_from_slice(&[0xffu8; TS_PAYLOAD_SIZE]);
    }

    fn bump_cc(&mut self, pid: u16) -> u8 {
        let cc = match pid {
            PID_PAT   => &mut self.cc_pat,
            PID_PMT   => &mut self.cc_pmt,
            PID_VIDEO => &mut self.cc_video,
            PID_AUDIO => &mut self.cc_audio,
            _ => unreachable!("unmanaged pid {pid:#06x}"),
        };
        let out = *cc;
        *cc = (*cc + 1) & 0x0f;
        out
    }

    fn write_pes_packets(
        &mut self,
        out: &mut BytesMut,
        pid: u16,
        pes_header: &[u8],
        payload: &[u8],
        random_access: bool,
        pcr: Option<u64>,
    ) {
        let mut first = true;
        let mut offset = 0usize; // consumed bytes of header+payload
        let total = pes_header.len() + payload.len();

        while first || offset < total {
            let cc = self.bump_cc(pid);
            let remaining = total - offset;

            // First packet carries flags (PCR / random access); any packet
            // whose remainder underfills 184 bytes stuffs via the AF.
            let flags_af = if first && (pcr.is_some() || random_access) {
                2 + if pcr.is_some() { 6 } else { 0 }
            } else {
                0
            };
            let af_len = if remaining < TS_PAYLOAD_SIZE - flags_af {
                TS_PAYLOAD_SIZE - remaining // stuffing makes up the slack
            } else {
                flags_af
            };
            let has_af = af_len > 0;

            write_ts_header(out, pid, first, has_af, true, cc);
            if has_af {
                write_adaptation_field(
                    out,
                    af_len,
                    first && random_access,
                    if first { pcr } else { None },
                );
            }

            let take = TS_PAYLOAD_SIZE - af_len;
            let mut written = 0;
            while written < take {
                if offset < pes_header.len() {
                    let n = (pes_header.len() - offset).min(take - written);
                    out.extend_from_slice(&pes_header[offset..offset + n]);
                    offset += n;
                    written += n;
                } else {
                    let p = offset - pes_header.len();
                    let n = (payload.len() - p).min(take - written);
                    out.extend_from_slice(&payload[p..p + n]);
                    offset += n;
                    written += n;
                }
            }
            first = false;
        }
    }
}
