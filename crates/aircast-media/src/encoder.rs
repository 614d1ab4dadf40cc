// crates/aircast-media/src/encoder.rs
//
// House-format encode pipeline: packed YUV ticks in, access-unit-aligned
// H.264/AAC packets out, timestamps already on the 90 kHz transport clock.
//
// Video: no B-frames (encode order == presentation order, so DTS == PTS on
// the wire), fixed GOP with scene-cut disabled, bitrate held to the target
// via maxrate/bufsize. Forced keyframes are IDR and the encoder runs without
// GLOBAL_HEADER, so SPS/PPS repeat in-band before every IDR — what a raw TS
// joiner needs.
//
// Audio: AAC wants exactly frame_size (1024) samples per input frame, while
// ticks deliver arbitrary counts, so decoded PCM drains through a planar
// FIFO. Output PTS derives from the running sample counter rescaled to
// 90 kHz — the house sample clock, origin at session epoch. Content PTS
// never reaches transport timing.
//
// IDR gate: after `begin_segment()` no video packet leaves until the encoder
// has produced a key frame, so the first emitted packet of any segment is an
// IDR by construction.

use anyhow::{anyhow, Result};

use ffmpeg_the_third as ffmpeg;
use ffmpeg::codec::{self, Id as CodecId};
use ffmpeg::encoder;
use ffmpeg::format::sample::Type as SampleType;
use ffmpeg::format::{Pixel, Sample};
use ffmpeg::util::channel_layout::{ChannelLayout, ChannelLayoutMask};
use ffmpeg::util::frame::audio::Audio as AudioFrame;
use ffmpeg::util::frame::video::Video as VideoFrame;
use ffmpeg::util::rational::Rational;
use ffmpeg::Packet;

use aircast_core::config::{AudioParams, VideoParams};
use aircast_core::error::DataContractError;

use crate::frame::{HouseAudioFrame, HouseVideoFrame};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
}

/// One access-unit-aligned encoded packet on the transport clock.
#[derive(Clone, Debug)]
pub struct EncodedPacket {
    pub kind:    StreamKind,
    pub data:    Vec<u8>,
    pub pts_90k: i64,
    pub dts_90k: i64,
    pub key:     bool,
}

// ── Audio FIFO ────────────────────────────────────────────────────────────────

/// Planar stereo f32 ring buffer bridging tick-sized audio to AAC frames.
struct AudioFifo {
    left:  Vec<f32>,
    right: Vec<f32>,
}

impl AudioFifo {
    fn new() -> Self {
        Self { left: Vec::new(), right: Vec::new() }
    }

    fn len(&self) -> usize {
        self.left.len()
    }

    fn push(&mut self, frame: &HouseAudioFrame) {
        self.left.extend_from_slice(&frame.left);
        self.right.extend_from_slice(&frame.right);
    }

    /// Pop one encoder-sized frame. `pad_tail` zero-fills a short final frame
    /// (flush only); otherwise callers must check `len() >= n` first.
    fn pop_frame(&mut self, n: usize, sample_idx: i64, rate: u32) -> AudioFrame {
        let available = self.left.len().min(n);

        let mut frame = AudioFrame::new(Sample::F32(SampleType::Planar), n, ChannelLayoutMask::STEREO);
        frame.set_rate(rate);
        frame.set_pts(Some(sample_idx));

        unsafe {
            let ldata = frame.data_mut(0);
            let ldst = std::slice::from_raw_parts_mut(ldata.as_mut_ptr() as *mut f32, n);
            ldst[..available].copy_from_slice(&self.left[..available]);
            if available < n {
                ldst[available..].fill(0.0);
            }

            let rdata = frame.data_mut(1);
            let rdst = std::slice::from_raw_parts_mut(rdata.as_mut_ptr() as *mut f32, n);
            rdst[..available].copy_from_slice(&self.right[..available]);
            if available < n {
                rdst[available..].fill(0.0);
            }
        }

        self.left.drain(..available);
        self.right.drain(..available);
        frame
    }
}

// ── House encoder ─────────────────────────────────────────────────────────────

pub struct HouseEncoder {
    video_enc: encoder::video::Video,
    audio_enc: encoder::Audio,

    video_params: VideoParams,
    audio_params: AudioParams,

    fifo:            AudioFifo,
    audio_frame_size: usize,
    /// Next AAC input frame's PTS in samples since session epoch.
    samples_in:      i64,
    last_audio_pts_90k: i64,

    /// Force the next video frame to be an IDR.
    force_idr: bool,
    /// Closed until the current segment's first key frame appears.
    idr_gate_open: bool,
}

impl HouseEncoder {
    pub fn new(video: &VideoParams, audio: &AudioParams) -> Result<Self> {
        // ── Video: H.264, no B-frames, fixed GOP ─────────────────────────────
        let h264 = encoder::find(CodecId::H264)
            .ok_or_else(|| anyhow!("H.264 encoder not found — is libx264 available?"))?;

        let ctx = codec::context::Context::new_with_codec(h264);
        let mut venc = ctx
            .encoder()
            .video()
            .map_err(|e| anyhow!("create video encoder context: {e}"))?;

        venc.set_width(video.width);
        venc.set_height(video.height);
        venc.set_format(Pixel::YUV420P);
        // transport clock straight through: frames arrive with 90 kHz PTS
        venc.set_time_base(Rational::new(1, 90_000));
        venc.set_frame_rate(Some(Rational::new(video.rate.num() as i32, video.rate.den() as i32)));
        venc.set_bit_rate(video.bitrate as usize);
        venc.set_max_bit_rate((video.bitrate + video.bitrate / 10) as usize);
        venc.set_gop(video.gop_size);
        venc.set_max_b_frames(0);

        let mut opts = ffmpeg::Dictionary::new();
        opts.set("preset", "veryfast");
        opts.set("tune", "zerolatency");
        opts.set("forced-idr", "1");
        // fixed GOP: no scene-cut insertions; VBV bounds hold the ±10% band
        opts.set(
            "x264-params",
            &format!(
                "scenecut=0:vbv-maxrate={}:vbv-bufsize={}",
                video.bitrate / 1000 * 11 / 10,
                video.bitrate / 1000
            ),
        );

        let video_enc = venc
            .open_as_with(h264, opts)
            .map_err(|e| anyhow!("open H.264 encoder: {e}"))?;

        // ── Audio: AAC at house rate/layout ──────────────────────────────────
        let aac = encoder::find(CodecId::AAC).ok_or_else(|| anyhow!("AAC encoder not found"))?;

        let ctx = codec::context::Context::new_with_codec(aac);
        let mut aenc = ctx
            .encoder()
            .audio()
            .map_err(|e| anyhow!("create audio encoder context: {e}"))?;

        aenc.set_rate(audio.sample_rate as i32);
        aenc.set_ch_layout(ChannelLayout::STEREO);
        aenc.set_format(Sample::F32(SampleType::Planar));
        aenc.set_bit_rate(audio.bitrate as usize);
        aenc.set_time_base(Rational::new(1, audio.sample_rate as i32));

        let audio_enc = aenc
            .open_as_with(aac, ffmpeg::Dictionary::new())
            .map_err(|e| anyhow!("open AAC encoder: {e}"))?;

        let audio_frame_size = (audio_enc.frame_size() as usize).max(1024);

        Ok(Self {
            video_enc,
            audio_enc,
            video_params: *video,
            audio_params: *audio,
            fifo: AudioFifo::new(),
            audio_frame_size,
            samples_in: 0,
            last_audio_pts_90k: -1,
            force_idr: true,
            idr_gate_open: false,
        })
    }

    /// Reset the IDR gate: the next video frame is forced IDR and no video
    /// packet escapes until it materialises. Called at every segment start.
    pub fn begin_segment(&mut self) {
        self.force_idr = true;
        self.idr_gate_open = false;
    }

    /// Encode one packed house video frame stamped with its tick PTS.
    pub fn encode_video(&mut self, yuv: &[u8], pts_90k: i64) -> Result<Vec<EncodedPacket>> {
        let (w, h) = (self.video_params.width as usize, self.video_params.height as usize);
        let want = HouseVideoFrame::packed_len(self.video_params.width, self.video_params.height);
        if yuv.len() != want {
            return Err(DataContractError::BadFrameSize { got: yuv.len(), want }.into());
        }

        let mut av = VideoFrame::new(Pixel::YUV420P, w as u32, h as u32);
        write_packed_yuv(yuv, &mut av, w, h);
        av.set_pts(Some(pts_90k));
        if self.force_idr {
            av.set_kind(ffmpeg::picture::Type::I);
            self.force_idr = false;
        }

        self.video_enc
            .send_frame(&av)
            .map_err(|e| anyhow!("send video frame to encoder: {e}"))?;
        Ok(self.drain_video())
    }

    fn drain_video(&mut self) -> Vec<EncodedPacket> {
        let mut out = Vec::new();
        let mut pkt = Packet::empty();
        while self.video_enc.receive_packet(&mut pkt).is_ok() {
            if !self.idr_gate_open {
                if pkt.is_key() {
                    self.idr_gate_open = true;
                } else {
                    // pre-IDR output of a fresh segment: suppressed by contract
                    log::debug!("video packet gated awaiting segment IDR");
                    continue;
                }
            }
            let pts = pkt.pts().unwrap_or(0);
            out.push(EncodedPacket {
                kind:    StreamKind::Video,
                data:    pkt.data().map(|d| d.to_vec()).unwrap_or_default(),
                pts_90k: pts,
                dts_90k: pkt.dts().unwrap_or(pts),
                key:     pkt.is_key(),
            });
        }
        out
    }

    /// Queue audio for encoding. The frame carries the rate/layout its
    /// samples are actually in; anything that is not the house format is a
    /// data-contract violation — rejected here with the detected values,
    /// logged by the caller, dropped. No negotiation.
    pub fn push_audio(&mut self, frame: &HouseAudioFrame) -> Result<(), DataContractError> {
        check_house_format(frame, &self.audio_params)?;
        self.fifo.push(frame);
        Ok(())
    }

    /// Engine-generated silence on the house sample clock. Built in-house at
    /// the house format, so it bypasses the boundary check by construction.
    pub fn push_silence(&mut self, samples: usize) {
        if samples == 0 {
            return;
        }
        self.fifo
            .push(&HouseAudioFrame::silence(samples, self.audio_params.sample_rate, 0));
    }

    /// Samples queued but not yet encoded.
    pub fn fifo_depth(&self) -> usize {
        self.fifo.len()
    }

    /// Encode every full AAC frame currently in the FIFO.
    pub fn drain_audio(&mut self) -> Result<Vec<EncodedPacket>> {
        let mut out = Vec::new();
        while self.fifo.len() >= self.audio_frame_size {
            let frame = self
                .fifo
                .pop_frame(self.audio_frame_size, self.samples_in, self.audio_params.sample_rate);
            self.samples_in += self.audio_frame_size as i64;
            self.audio_enc
                .send_frame(&frame)
                .map_err(|e| anyhow!("send audio frame to encoder: {e}"))?;
            self.receive_audio(&mut out);
        }
        Ok(out)
    }

    fn receive_audio(&mut self, out: &mut Vec<EncodedPacket>) {
        let mut pkt = Packet::empty();
        while self.audio_enc.receive_packet(&mut pkt).is_ok() {
            let data = pkt.data().map(|d| d.to_vec()).unwrap_or_default();
            if data.is_empty() {
                continue;
            }
            // house sample clock → 90 kHz: floor(samples · 90000 / rate)
            let sample_pts = pkt.pts().unwrap_or(0);
            let pts_90k = (sample_pts as i128 * 90_000 / self.audio_params.sample_rate as i128) as i64;
            // strictly increasing across non-empty frames, by construction of
            // the sample counter; assert the contract anyway
            debug_assert!(pts_90k > self.last_audio_pts_90k);
            self.last_audio_pts_90k = pts_90k;
            out.push(EncodedPacket {
                kind:    StreamKind::Audio,
                data,
                pts_90k,
                dts_90k: pts_90k,
                key:     false,
            });
        }
    }

    /// Flush both encoders at session end. The audio tail is zero-padded to a
    /// full frame so no PCM is lost.
    pub fn finish(&mut self) -> Result<Vec<EncodedPacket>> {
        let mut out = Vec::new();

        if self.fifo.len() > 0 {
            let frame = self
                .fifo
                .pop_frame(self.audio_frame_size, self.samples_in, self.audio_params.sample_rate);
            self.samples_in += self.audio_frame_size as i64;
            self.audio_enc
                .send_frame(&frame)
                .map_err(|e| anyhow!("send tail audio frame: {e}"))?;
        }

        self.video_enc
            .send_eof()
            .map_err(|e| anyhow!("send EOF to video encoder: {e}"))?;
        out.extend(self.drain_video());

        self.audio_enc
            .send_eof()
            .map_err(|e| anyhow!("send EOF to audio encoder: {e}"))?;
        self.receive_audio(&mut out);
        Ok(out)
    }
}

/// The audio boundary check: the frame's carried format against the house
/// format. Pure so the rejection path is testable without opening codecs.
fn check_house_format(frame: &HouseAudioFrame, house: &AudioParams) -> Result<(), DataContractError> {
    if frame.samples() == 0 {
        return Err(DataContractError::ZeroSampleAudio);
    }
    if frame.sample_rate != house.sample_rate || frame.channels != house.channels {
        return Err(DataContractError::NonHouseAudio {
            rate:           frame.sample_rate,
            channels:       frame.channels,
            house_rate:     house.sample_rate,
            house_channels: house.channels,
        });
    }
    debug_assert_eq!(frame.left.len(), frame.right.len());
    Ok(())
}

/// Write packed YUV420P bytes into an allocated VideoFrame, respecting the
/// frame's per-plane strides.
fn write_packed_yuv(packed: &[u8], frame: &mut VideoFrame, w: usize, h: usize) {
    let (uv_w, uv_h) = (w / 2, h / 2);

    let y_stride = frame.stride(0);
    let y_dst = frame.data_mut(0);
    for row in 0..h {
        y_dst[row * y_stride..row * y_stride + w].copy_from_slice(&packed[row * w..row * w + w]);
    }

    let u_off = w * h;
    let u_stride = frame.stride(1);
    let u_dst = frame.data_mut(1);
    for row in 0..uv_h {
        let src = u_off + row * uv_w;
        u_dst[row * u_stride..row * u_stride + uv_w].copy_from_slice(&packed[src..src + uv_w]);
    }

    let v_off = u_off + uv_w * uv_h;
    let v_stride = frame.stride(2);
    let v_dst = frame.data_mut(2);
    for row in 0..uv_h {
        let src = v_off + row * uv_w;
        v_dst[row * v_stride..row * v_stride + uv_w].copy_from_slice(&packed[src..src + uv_w]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_reframes_arbitrary_chunks() {
        let mut fifo = AudioFifo::new();
        for _ in 0..3 {
            fifo.push(&HouseAudioFrame::silence(700, 44_100, 0));
        }
        assert_eq!(fifo.len(), 2100);
        let f = fifo.pop_frame(1024, 0, 44_100);
        assert_eq!(f.samples(), 1024);
        assert_eq!(fifo.len(), 2100 - 1024);
    }

    #[test]
    fn fifo_zero_pads_short_tail() {
        let mut fifo = AudioFifo::new();
        fifo.push(&HouseAudioFrame::silence(100, 44_100, 0));
        let f = fifo.pop_frame(1024, 0, 44_100);
        assert_eq!(f.samples(), 1024);
        assert_eq!(fifo.len(), 0);
    }

    #[test]
    fn non_house_audio_is_rejected_with_detected_values() {
        // a 48 kHz duplicated-mono pair that skipped conform must bounce,
        // and the error must carry the detected 48000/1 — not the target
        let house = AudioParams { sample_rate: 44_100, channels: 2, bitrate: 128_000 };
        let frame = HouseAudioFrame {
            left:  vec![0.0; 512],
            right: vec![0.0; 512],
            sample_rate: 48_000,
            channels: 1,
            media_ct_ms: 0,
        };
        assert_eq!(
            check_house_format(&frame, &house),
            Err(DataContractError::NonHouseAudio {
                rate:           48_000,
                channels:       1,
                house_rate:     44_100,
                house_channels: 2,
            })
        );
    }

    #[test]
    fn house_audio_and_zero_samples_at_the_boundary() {
        let house = AudioParams { sample_rate: 44_100, channels: 2, bitrate: 128_000 };
        let ok = HouseAudioFrame::silence(1470, 44_100, 0);
        assert_eq!(check_house_format(&ok, &house), Ok(()));
        let empty = HouseAudioFrame::silence(0, 44_100, 0);
        assert_eq!(check_house_format(&empty, &house), Err(DataContractError::ZeroSampleAudio));
    }

    #[test]
    fn sample_clock_rescale_is_floor_to_90k() {
        // floor(samples · 90000 / 44100): 1024 samples → 2089
        assert_eq!(1024i128 * 90_000 / 44_100, 2089);
        assert_eq!(2048i128 * 90_000 / 44_100, 4179);
        // strictly increasing per 1024-sample step at every house rate
        for rate in [32_000i128, 44_100, 48_000] {
            let a = 1024 * 90_000 / rate;
            let b = 2048 * 90_000 / rate;
            assert!(b > a);
        }
    }
}
