// crates/aircast-media/src/ts/types.rs
//
// MPEG-TS wire-format primitives: packet header, PSI section framing,
// PES header, adaptation field with PCR. Bit layouts per ISO 13818-1;
// everything is written into BytesMut, 188 bytes at a time.

use bytes::{BufMut, BytesMut};

/// Size of a transport stream packet in bytes.
pub const TS_PACKET_SIZE: usize = 188;
/// Sync byte opening every TS packet.
pub const SYNC_BYTE: u8 = 0x47;
/// TS packet payload capacity after the 4-byte header.
pub const TS_PAYLOAD_SIZE: usize = 184;

/// PID carrying the Program Association Table.
pub const PID_PAT: u16 = 0x0000;
/// PID carrying the Program Map Table.
pub const PID_PMT: u16 = 0x1000;
/// Elementary PID of the single video stream.
pub const PID_VIDEO: u16 = 0x0100;
/// Elementary PID of the single audio stream.
pub const PID_AUDIO: u16 = 0x0101;
/// Null-packet PID (boot-window gap fill).
pub const PID_NULL: u16 = 0x1fff;

/// Table id for the PAT.
pub const TABLE_ID_PAT: u8 = 0x00;
/// Table id for the PMT.
pub const TABLE_ID_PMT: u8 = 0x02;

/// Stream type for H.264 video.
pub const STREAM_TYPE_H264: u8 = 0x1b;
/// Stream type for ADTS AAC audio.
pub const STREAM_TYPE_AAC: u8 = 0x0f;

/// PES stream id for the first video stream.
pub const STREAM_ID_VIDEO: u8 = 0xe0;
/// PES stream id for the first audio stream.
pub const STREAM_ID_AUDIO: u8 = 0xc0;

/// 90 kHz transport timestamp clock.
pub const PTS_HZ: u64 = 90_000;

/// MPEG-2 CRC32 (poly 0x04c11db7, init all-ones, no reflection, no final
/// xor) — the PSI section checksum.
pub fn crc32_mpeg2(data: &[u8]) -> u32 {
    let mut crc = 0xffff_ffffu32;
    for &b in data {
        crc ^= (b as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04c1_1db7
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Write one 4-byte TS packet header.
pub fn write_ts_header(
    buf: &mut BytesMut,
    pid: u16,
    payload_unit_start: bool,
    adaptation: bool,
    payload: bool,
    continuity_counter: u8,
) {
    buf.put_u8(SYNC_BYTE);
    let mut b1 = ((pid >> 8) & 0x1f) as u8;
    if payload_unit_start {
        b1 |= 0x40;
    }
    buf.put_u8(b1);
    buf.put_u8((pid & 0xff) as u8);
    let mut b3 = continuity_counter & 0x0f;
    if adaptation {
        b3 |= 0x20;
    }
    if payload {
        b3 |= 0x10;
    }
    buf.put_u8(b3);
}

/// Frame a PSI table body into a complete section: header, body, CRC32.
pub fn psi_section(table_id: u8, table_ext: u16, version: u8, body: &[u8]) -> Vec<u8> {
    // section_length counts everything after its own field, CRC included
    let section_length = body.len() + 5 + 4;
    debug_assert!(section_length <= 0x3fd);

    let mut s = Vec::with_capacity(3 + section_length);
    s.push(table_id);
    // section_syntax_indicator=1, '0', reserved '11'
    s.push(0xb0 | ((section_length >> 8) & 0x0f) as u8);
    s.push((section_length & 0xff) as u8);
    s.push((table_ext >> 8) as u8);
    s.push((table_ext & 0xff) as u8);
    // reserved '11', version, current_next_indicator=1
    s.push(0xc1 | ((version & 0x1f) << 1));
    s.push(0x00); // section_number
    s.push(0x00); // last_section_number
    s.extend_from_slice(body);
    let crc = crc32_mpeg2(&s);
    s.extend_from_slice(&crc.to_be_bytes());
    s
}

/// PAT body: single program 1 → PMT PID.
pub fn pat_body(program_number: u16, pmt_pid: u16) -> Vec<u8> {
    let mut b = Vec::with_capacity(4);
    b.extend_from_slice(&program_number.to_be_bytes());
    b.extend_from_slice(&(0xe000 | (pmt_pid & 0x1fff)).to_be_bytes());
    b
}

/// PMT body: PCR PID plus the two elementary streams, no descriptors.
pub fn pmt_body(pcr_pid: u16, streams: &[(u8, u16)]) -> Vec<u8> {
    let mut b = Vec::new();
    b.extend_from_slice(&(0xe000 | (pcr_pid & 0x1fff)).to_be_bytes());
    b.extend_from_slice(&0xf000u16.to_be_bytes()); // program_info_length = 0
    for &(stream_type, pid) in streams {
        b.push(stream_type);
        b.extend_from_slice(&(0xe000 | (pid & 0x1fff)).to_be_bytes());
        b.extend_from_slice(&0xf000u16.to_be_bytes()); // es_info_length = 0
    }
    b
}

fn put_timestamp(out: &mut Vec<u8>, marker: u8, ts: u64) {
    let ts = ts & 0x1_ffff_ffff; // 33 bits
    out.push((marker << 4) | (((ts >> 30) as u8) << 1) | 0x01);
    out.push((ts >> 22) as u8);
    out.push((((ts >> 14) as u8) & 0xfe) | 0x01);
    out.push((ts >> 7) as u8);
    out.push((((ts << 1) as u8) & 0xfe) | 0x01);
}

/// Build a PES header for one access unit.
///
/// Video uses an unbounded packet length (0) when the payload would overflow
/// the 16-bit field; audio always fits.
pub fn pes_header(stream_id: u8, payload_len: usize, pts_90k: u64, dts_90k: Option<u64>) -> Vec<u8> {
    let header_data_len: u8 = if dts_90k.is_some() { 10 } else { 5 };
    let tail_len = payload_len + 3 + header_data_len as usize;

    let mut h = Vec::with_capacity(9 + header_data_len as usize);
    h.extend_from_slice(&[0x00, 0x00, 0x01, stream_id]);
    if tail_len > 0xffff {
        h.extend_from_slice(&[0x00, 0x00]);
    } else {
        h.extend_from_slice(&(tail_len as u16).to_be_bytes());
    }
    h.push(0x80); // marker '10', no scrambling, no priority
    h.push(if dts_90k.is_some() { 0xc0 } else { 0x80 });
    h.push(header_data_len);
    match dts_90k {
        Some(dts) => {
            put_timestamp(&mut h, 0x03, pts_90k);
            put_timestamp(&mut h, 0x01, dts);
        }
        None => put_timestamp(&mut h, 0x02, pts_90k),
    }
    h
}

/// Write an adaptation field of exactly `total_len` bytes (length byte
/// included). Carries the PCR and/or random-access flag, stuffed with 0xff.
pub fn write_adaptation_field(
    buf: &mut BytesMut,
    total_len: usize,
    random_access: bool,
    pcr_base_90k: Option<u64>,
) {
    debug_assert!(total_len >= 1);
    buf.put_u8((total_len - 1) as u8);
    if total_len == 1 {
        return;
    }
    let mut flags = 0u8;
    if random_access {
        flags |= 0x40;
    }
    if pcr_base_90k.is_some() {
        flags |= 0x10;
    }
    buf.put_u8(flags);
    let mut written = 2;
    if let Some(base) = pcr_base_90k {
        let base = base & 0x1_ffff_ffff;
        buf.put_u8((base >> 25) as u8);
        buf.put_u8((base >> 17) as u8);
        buf.put_u8((base >> 9) as u8);
        buf.put_u8((base >> 1) as u8);
        buf.put_u8((((base & 1) as u8) << 7) | 0x7e); // reserved bits + ext hi
        buf.put_u8(0x00); // pcr extension = 0
        written += 6;
    }
    for _ in written..total_len {
        buf.put_u8(0xff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_mpeg2_known_vector() {
        // all-zero PAT-sized input; value pinned so an implementation change
        // is caught rather than silently accepted by round-trip tests
        assert_eq!(crc32_mpeg2(&[]), 0xffff_ffff);
        assert_eq!(crc32_mpeg2(b"123456789"), 0x0376_e6e8);
    }

    #[test]
    fn psi_section_crc_covers_header_and_body() {
        let s = psi_section(TABLE_ID_PAT, 1, 0, &pat_body(1, PID_PMT));
        // section_length field consistent with the byte count
        let len = (((s[1] & 0x0f) as usize) << 8) | s[2] as usize;
        assert_eq!(len, s.len() - 3);
        let crc = crc32_mpeg2(&s[..s.len() - 4]);
        assert_eq!(&s[s.len() - 4..], crc.to_be_bytes());
    }

    #[test]
    fn pes_header_pts_round_trips() {
        let pts: u64 = 161_997_000;
        let h = pes_header(STREAM_ID_VIDEO, 100, pts, None);
        assert_eq!(&h[..4], &[0x00, 0x00, 0x01, 0xe0]);
        // decode the 33-bit PTS back out
        let b = &h[9..14];
        let got = (((b[0] as u64 >> 1) & 0x07) << 30)
            | ((b[1] as u64) << 22)
            | (((b[2] as u64) >> 1) << 15)
            | ((b[3] as u64) << 7)
            | ((b[4] as u64) >> 1);
        assert_eq!(got, pts);
    }

    #[test]
    fn pes_header_with_dts_is_ten_bytes_of_timestamps() {
        let h = pes_header(STREAM_ID_VIDEO, 10, 9000, Some(6000));
        assert_eq!(h[7], 0xc0);
        assert_eq!(h[8], 10);
        assert_eq!(h.len(), 9 + 10);
    }

    #[test]
    fn oversize_video_pes_uses_unbounded_length() {
        let h = pes_header(STREAM_ID_VIDEO, 200_000, 0, None);
        assert_eq!(&h[4..6], &[0x00, 0x00]);
        let a = pes_header(STREAM_ID_AUDIO, 512, 0, None);
        assert_eq!(u16::from_be_bytes([a[4], a[5]]), 512 + 8);
    }

    #[test]
    fn adaptation_field_stuffs_to_requested_length() {
        let mut buf = BytesMut::new();
        write_adaptation_field(&mut buf, 10, true, Some(90_000));
        assert_eq!(buf.len(), 10);
        assert_eq!(buf[0], 9);
        assert_eq!(buf[1] & 0x50, 0x50); // random_access + pcr flags
        assert!(buf[8..].iter().all(|&b| b == 0xff));
    }
}
