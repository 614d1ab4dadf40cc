// crates/aircast-media/src/producer.rs
//
// FileProducer: demux and decode one asset into house-format frames, pushed
// through the look-ahead slot gate. Runs on the fill thread — the tick
// thread never calls decode APIs once filling has started.
//
// Time discipline ("time-blind after lock"): the producer tracks progress by
// output frame index and carries media timestamps for diagnostics only.
// Output CT is assigned by the tick grid at emit time; nothing decoded here
// ever becomes a transport timestamp.
//
// Rate conversion: the input→house relationship is classified once at open
// (OFF / DROP / CADENCE). The cadence target is the integer cross-product
// `target_out(k) = k·out·in_den / (in·out_den)` — frames whose target count
// has not advanced are decoded but neither scaled nor pushed, which is the
// cheap path through a DROP source.

use std::path::PathBuf;

use anyhow::{anyhow, Result};

use ffmpeg_the_third as ffmpeg;
use ffmpeg::codec;
use ffmpeg::format::input;
use ffmpeg::format::sample::Type as SampleType;
use ffmpeg::format::{Pixel, Sample};
use ffmpeg::media::Type as MediaType;
use ffmpeg::software::resampling;
use ffmpeg::software::scaling::{context::Context as SwsContext, flag::Flags as ScaleFlags};
use ffmpeg::util::channel_layout::ChannelLayout;
use ffmpeg::util::frame::audio::Audio as AudioFrame;
use ffmpeg::util::frame::video::Video as VideoFrame;

use aircast_core::clock::{FrameRate, RateMode};
use aircast_core::config::{AudioParams, VideoParams};

use crate::frame::{HouseAudioFrame, HouseVideoFrame};
use crate::lookahead::{FillQueues, FrameProducer};

/// Fraction of the probed duration that must be covered by media time at EOF
/// before the exit is considered clean. Below this, something mis-derived
/// media time (e.g. a 60 fps source advanced at half rate).
const MEDIA_TIME_FLOOR: f64 = 0.8;

enum Pump {
    Continue,
    Eof,
    Stopped,
}

pub struct FileProducer {
    path:      PathBuf,
    ictx:      ffmpeg::format::context::Input,
    video_idx: usize,
    audio_idx: Option<usize>,

    vdec: ffmpeg::decoder::video::Video,
    adec: Option<ffmpeg::decoder::audio::Audio>,

    scaler:    Option<SwsContext>,
    resampler: Option<resampling::Context>,

    house_video: VideoParams,
    house_audio: AudioParams,

    // source display dimensions (codecpar, not coded/padded dims)
    src_w: u32,
    src_h: u32,

    in_video_tb: (i32, i32),
    in_audio_tb: (i32, i32),
    rate_mode:   RateMode,
    // cadence cross products: target_out(k) = k·cad_a / cad_b
    cad_a: u64,
    cad_b: u64,

    start_offset_ms:    i64,
    probed_duration_ms: Option<i64>,

    media_origin_ms: Option<i64>,
    media_ct_ms:     i64,

    in_frames:  u64,
    out_frames: u64,
    audio_frames_pushed: u64,
    eof_sent:   bool,
}

impl FileProducer {
    pub fn open(
        path: PathBuf,
        house_video: VideoParams,
        house_audio: AudioParams,
        start_offset_ms: i64,
        probed_duration_ms: Option<i64>,
    ) -> Result<Self> {
        let ictx = input(&path).map_err(|e| anyhow!("open '{}': {e}", path.display()))?;

        let video_idx = ictx
            .streams()
            .best(MediaType::Video)
            .ok_or_else(|| anyhow!("no video stream in '{}'", path.display()))?
            .index();
        // Audio is optional — silent assets produce house silence downstream.
        let audio_idx = ictx.streams().best(MediaType::Audio).map(|s| s.index());

        let (in_video_tb, src_w, src_h, input_rate) = {
            let stream = ictx.stream(video_idx).unwrap();
            let tb = stream.time_base();
            let (w, h) = unsafe {
                let p = stream.parameters().as_ptr();
                ((*p).width as u32, (*p).height as u32)
            };
            let fr = stream.avg_frame_rate();
            let rate = if fr.numerator() > 0 && fr.denominator() > 0 {
                FrameRate::new(fr.numerator() as u32, fr.denominator() as u32)
                    .unwrap_or(house_video.rate)
            } else {
                log::warn!("'{}' reports no frame rate; assuming house rate", path.display());
                house_video.rate
            };
            ((tb.numerator(), tb.denominator()), w, h, rate)
        };

        let mut in_audio_tb = (1, house_audio.sample_rate as i32);

        // Second context for decoder construction — Parameters borrows from
        // the stream and would pin `ictx` across the later seek.
        let ictx2 = input(&path)?;
        let vdec = codec::context::Context::from_parameters(
            ictx2.stream(video_idx).unwrap().parameters(),
        )?
        .decoder()
        .video()?;

        let mut adec = None;
        if let Some(asi) = audio_idx {
            let ast = ictx2.stream(asi).unwrap();
            in_audio_tb = (ast.time_base().numerator(), ast.time_base().denominator());
            // Soft-fail: a broken audio stream must not kill the block; video
            // still plays and the emit path covers audio with silence.
            match codec::context::Context::from_parameters(ast.parameters())
                .and_then(|c| c.decoder().audio())
            {
                Ok(dec) => adec = Some(dec),
                Err(e) => log::warn!("audio decoder open failed for '{}': {e}", path.display()),
            }
        }

        let rate_mode = RateMode::classify(input_rate, house_video.rate);
        log::debug!(
            "producer '{}': {}x{} @ {}/{} -> house, mode {:?}",
            path.display(),
            src_w,
            src_h,
            input_rate.num(),
            input_rate.den(),
            rate_mode
        );

        let mut producer = Self {
            path,
            ictx,
            video_idx,
            audio_idx,
            vdec,
            adec,
            scaler: None,
            resampler: None,
            house_video,
            house_audio,
            src_w,
            src_h,
            in_video_tb,
            in_audio_tb,
            rate_mode,
            cad_a: house_video.rate.num() as u64 * input_rate.den() as u64,
            cad_b: input_rate.num() as u64 * house_video.rate.den() as u64,
            start_offset_ms,
            probed_duration_ms,
            media_origin_ms: None,
            media_ct_ms: 0,
            in_frames: 0,
            out_frames: 0,
            audio_frames_pushed: 0,
            eof_sent: false,
        };
        producer.seek_to_offset()?;
        Ok(producer)
    }

    pub fn media_ct_ms(&self) -> i64 {
        self.media_ct_ms
    }

    pub fn frames_pushed(&self) -> u64 {
        self.out_frames
    }

    /// Backward seek to the keyframe at or before the start offset. The
    /// PTS filter in the decode loop discards the pre-roll, so the first
    /// pushed frame sits at the offset, not at the keyframe.
    ///
    /// Skipped entirely at offset 0: a fresh demuxer already sits at the
    /// start, and seeking a fresh context to 0 fails with EPERM on some
    /// platforms.
    fn seek_to_offset(&mut self) -> Result<()> {
        if self.start_offset_ms <= 0 {
            return Ok(());
        }
        let seek_ts = self.start_offset_ms * (ffmpeg::ffi::AV_TIME_BASE as i64) / 1000;
        if let Err(e) = self.ictx.seek(seek_ts, ..=seek_ts) {
            // soft-fail: decode from wherever we are, filter will skip pre-roll
            log::warn!(
                "seek to {} ms in '{}' failed ({e}); decoding from current position",
                self.start_offset_ms,
                self.path.display()
            );
        }
        Ok(())
    }

    fn video_pts_to_ms(&self, pts: i64) -> i64 {
        (pts as i128 * 1000 * self.in_video_tb.0 as i128 / self.in_video_tb.1 as i128) as i64
    }

    /// Output frames owed after `k` input frames, per the cadence cross
    /// product. OFF and DROP fall out of the same arithmetic.
    fn target_out(&self, k: u64) -> u64 {
        (k as u128 * self.cad_a as u128 / self.cad_b as u128) as u64
    }

    fn pump_once(&mut self, queues: &FillQueues) -> Result<Pump> {
        let (is_video, is_audio, packet) = {
            match self.ictx.packets().next() {
                Some(Ok((stream, packet))) => {
                    let idx = stream.index();
                    (idx == self.video_idx, Some(idx) == self.audio_idx, packet)
                }
                Some(Err(e)) => {
                    log::warn!("read packet from '{}': {e}", self.path.display());
                    return Ok(Pump::Continue);
                }
                None => return Ok(Pump::Eof),
            }
        };

        if is_video {
            if self.vdec.send_packet(&packet).is_err() {
                return Ok(Pump::Continue);
            }
            return self.drain_video_frames(queues);
        }
        if is_audio {
            if let Some(adec) = self.adec.as_mut() {
                if adec.send_packet(&packet).is_err() {
                    return Ok(Pump::Continue);
                }
                self.drain_audio_frames(queues);
            }
        }
        Ok(Pump::Continue)
    }

    fn drain_video_frames(&mut self, queues: &FillQueues) -> Result<Pump> {
        let mut decoded = VideoFrame::empty();
        while self.vdec.receive_frame(&mut decoded).is_ok() {
            let pts_ms = decoded.pts().map(|p| self.video_pts_to_ms(p)).unwrap_or(self.media_ct_ms);

            // discard keyframe-alignment pre-roll before the start offset
            if pts_ms + 1 < self.start_offset_ms {
                continue;
            }

            let origin = *self.media_origin_ms.get_or_insert(pts_ms);
            self.media_ct_ms = pts_ms - origin;

            self.in_frames += 1;
            let due = self.target_out(self.in_frames).saturating_sub(self.out_frames);
            if due == 0 {
                continue; // decode-only skip: no scale, no alloc
            }

            let packed = self.scale_to_house(&decoded)?;
            for _ in 0..due {
                let frame = HouseVideoFrame { yuv: packed.clone(), media_ct_ms: self.media_ct_ms };
                if !queues.video.push(frame) {
                    return Ok(Pump::Stopped);
                }
                self.out_frames += 1;
            }
        }
        Ok(Pump::Continue)
    }

    fn scale_to_house(&mut self, decoded: &VideoFrame) -> Result<Vec<u8>> {
        let (src_w, src_h) = if self.src_w > 0 && self.src_h > 0 {
            (self.src_w, self.src_h)
        } else {
            (decoded.width(), decoded.height())
        };
        let (out_w, out_h) = (self.house_video.width, self.house_video.height);
        let scaler = match self.scaler.as_mut() {
            Some(s) => s,
            None => {
                let s = SwsContext::get(
                    decoded.format(),
                    src_w,
                    src_h,
                    Pixel::YUV420P,
                    out_w,
                    out_h,
                    ScaleFlags::BILINEAR,
                )
                .map_err(|e| anyhow!("create swscale context: {e}"))?;
                self.scaler.insert(s)
            }
        };

        let mut yuv = VideoFrame::empty();
        scaler.run(decoded, &mut yuv).map_err(|e| anyhow!("scale video frame: {e}"))?;
        Ok(extract_packed_yuv(&yuv, out_w as usize, out_h as usize))
    }

    fn drain_audio_frames(&mut self, queues: &FillQueues) {
        let Some(adec) = self.adec.as_mut() else { return };
        let mut raw = AudioFrame::empty();
        while adec.receive_frame(&mut raw).is_ok() {
            let pts_ms = raw.pts().map(|p| {
                (p as i128 * 1000 * self.in_audio_tb.0 as i128 / self.in_audio_tb.1 as i128) as i64
            });
            // generous pre-roll window so audio spanning the trim point survives
            if let Some(ms) = pts_ms {
                if ms + 50 < self.start_offset_ms {
                    continue;
                }
            }
            let media_ct = pts_ms
                .map(|ms| ms - self.media_origin_ms.unwrap_or(ms))
                .unwrap_or(self.media_ct_ms);

            let target_fmt = Sample::F32(SampleType::Planar);
            let needs_resample = raw.format() != target_fmt
                || raw.rate() != self.house_audio.sample_rate
                || raw.ch_layout().channels() != 2;

            let house = if needs_resample {
                if self.resampler.is_none() {
                    // mono sources must be declared MONO or swr misreads the layout
                    let src_layout = if raw.ch_layout().channels() >= 2 {
                        raw.ch_layout()
                    } else {
                        ChannelLayout::MONO
                    };
                    match resampling::Context::get2(
                        raw.format(),
                        src_layout,
                        raw.rate(),
                        target_fmt,
                        ChannelLayout::STEREO,
                        self.house_audio.sample_rate,
                    ) {
                        Ok(rs) => self.resampler = Some(rs),
                        Err(e) => log::warn!(
                            "audio resampler unavailable for '{}': {e}",
                            self.path.display()
                        ),
                    }
                }
                match self.resampler.as_mut() {
                    Some(rs) => {
                        let mut resampled = AudioFrame::empty();
                        if rs.run(&raw, &mut resampled).is_err() || resampled.samples() == 0 {
                            continue;
                        }
                        planar_to_house(&resampled, media_ct)
                    }
                    // conform unavailable but the planes are readable: hand
                    // the frame on stamped with its true rate/layout so the
                    // encoder boundary rejects it with the detected values
                    None if raw.format() == target_fmt => planar_to_house(&raw, media_ct),
                    // samples not representable as f32 planes at all
                    None => continue,
                }
            } else {
                planar_to_house(&raw, media_ct)
            };

            if house.samples() > 0 {
                queues.audio.push(house);
                self.audio_frames_pushed += 1;
            }
        }
    }

    /// Flush both decoders, push the tail, signal EOF exactly once.
    fn finish(&mut self, queues: &FillQueues) {
        if self.eof_sent {
            return;
        }
        let _ = self.vdec.send_eof();
        if let Err(e) = self.drain_video_frames(queues) {
            log::warn!("video flush for '{}': {e}", self.path.display());
        }
        if let Some(adec) = self.adec.as_mut() {
            let _ = adec.send_eof();
        }
        self.drain_audio_frames(queues);

        self.eof_sent = true;
        queues.video.mark_eof();

        if let Some(probed) = self.probed_duration_ms {
            if probed > 0 && (self.media_ct_ms as f64) < MEDIA_TIME_FLOOR * probed as f64 {
                log::warn!(
                    "media-time violation in '{}': EOF at {} ms of {} ms probed",
                    self.path.display(),
                    self.media_ct_ms,
                    probed
                );
            }
        }
        log::debug!(
            "producer '{}' EOF: {} in / {} out frames, media ct {} ms",
            self.path.display(),
            self.in_frames,
            self.out_frames,
            self.media_ct_ms
        );
    }
}

impl FrameProducer for FileProducer {
    fn prime(&mut self, queues: &FillQueues) -> Result<()> {
        // first video frame AND its audio (when an audio stream exists) must
        // be buffered before the block counts as primed
        loop {
            if self.out_frames >= 1 && (self.audio_idx.is_none() || self.audio_frames_pushed >= 1) {
                return Ok(());
            }
            match self.pump_once(queues)? {
                Pump::Continue => continue,
                Pump::Eof => {
                    self.finish(queues);
                    if self.out_frames == 0 {
                        return Err(anyhow!("'{}' produced no frames", self.path.display()));
                    }
                    return Ok(());
                }
                Pump::Stopped => return Ok(()),
            }
        }
    }

    fn run(&mut self, queues: &FillQueues) {
        loop {
            if queues.video.stopped() {
                return;
            }
            match self.pump_once(queues) {
                Ok(Pump::Continue) => continue,
                Ok(Pump::Eof) => {
                    self.finish(queues);
                    return;
                }
                Ok(Pump::Stopped) => return,
                Err(e) => {
                    log::warn!("decode error in '{}': {e}", self.path.display());
                }
            }
        }
    }
}

/// Strip strides from a scaled YUV420P frame into the packed layout.
fn extract_packed_yuv(yuv: &VideoFrame, w: usize, h: usize) -> Vec<u8> {
    let (uv_w, uv_h) = (w / 2, h / 2);
    let mut raw = vec![0u8; w * h + uv_w * uv_h * 2];

    let y_stride = yuv.stride(0);
    let y_src = yuv.data(0);
    for row in 0..h {
        raw[row * w..row * w + w].copy_from_slice(&y_src[row * y_stride..row * y_stride + w]);
    }

    let u_off = w * h;
    let u_stride = yuv.stride(1);
    let u_src = yuv.data(1);
    for row in 0..uv_h {
        let dst = u_off + row * uv_w;
        raw[dst..dst + uv_w].copy_from_slice(&u_src[row * u_stride..row * u_stride + uv_w]);
    }

    let v_off = u_off + uv_w * uv_h;
    let v_stride = yuv.stride(2);
    let v_src = yuv.data(2);
    for row in 0..uv_h {
        let dst = v_off + row * uv_w;
        raw[dst..dst + uv_w].copy_from_slice(&v_src[row * v_stride..row * v_stride + uv_w]);
    }

    raw
}

/// Copy an FLTP frame's planes out, stamped with the rate and channel count
/// the samples are actually in. Mono duplicates plane 0 into both output
/// planes but still reports one channel — conform is the resampler's job,
/// and the encoder boundary decides what a non-house stamp means.
fn planar_to_house(frame: &AudioFrame, media_ct_ms: i64) -> HouseAudioFrame {
    let n = frame.samples();
    let channels = frame.ch_layout().channels() as u32;
    if n == 0 {
        return HouseAudioFrame::silence(0, frame.rate(), media_ct_ms);
    }
    unsafe {
        let l = std::slice::from_raw_parts(frame.data(0).as_ptr() as *const f32, n);
        let r_plane = if channels >= 2 { frame.data(1) } else { frame.data(0) };
        let r = std::slice::from_raw_parts(r_plane.as_ptr() as *const f32, n);
        HouseAudioFrame {
            left:  l.to_vec(),
            right: r.to_vec(),
            sample_rate: frame.rate(),
            channels,
            media_ct_ms,
        }
    }
}
