//! Deterministic generated media.
//!
//! [`SyntheticBackend`] behaves like a container with one video stream
//! (index 0, 90 kHz time base, keyframe every `gop` frames) and one audio
//! stream (index 1, time base of one sample). Packets come out interleaved in
//! presentation order. Every packet and frame holds a token on a shared
//! counter so tests can check that nothing leaks across seeks and shutdown.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::source::{
    DecodeStatus, Demuxer, MediaBackend, MediaError, MediaFrame, MediaPacket, OpenedMedia, Resampler,
    SendStatus, StreamDecoder,
};
use super::stream::{AudioStreamInfo, MediaInfo, StreamInfo, StreamKind, VideoStreamInfo};
use crate::time::{pts_to_ms, samples_to_ms, Millis, TimeBase};

pub const VIDEO_STREAM: usize = 0;
pub const AUDIO_STREAM: usize = 1;
/// Stream index used for packets no decoder is interested in.
pub const UNKNOWN_STREAM: usize = 2;

const VIDEO_TIME_BASE: TimeBase = TimeBase::new(1, 90_000);
/// Frames a decoder buffers before asking for them to be drained.
const PENDING_LIMIT: usize = 8;
/// Sample value written by the resampler, distinguishable from silence.
pub const SAMPLE_VALUE: f32 = 0.25;

/// Shape of the generated media.
#[derive(Debug, Clone)]
pub struct SyntheticSpec {
    pub duration_ms: Millis,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    /// Keyframe interval in frames
    pub gop: u32,
    pub sample_rate: u32,
    pub channels: u16,
    pub samples_per_packet: u32,
    pub video: bool,
    pub audio: bool,
    /// Audio stream length when it ends before the video.
    pub audio_duration_ms: Option<Millis>,
    /// Emit a packet on [`UNKNOWN_STREAM`] every n reads.
    pub unknown_stream_every: Option<u32>,
    pub fail_open: bool,
    /// Extra latency per decoded frame.
    pub decode_delay: Option<Duration>,
}

impl Default for SyntheticSpec {
    fn default() -> Self {
        Self {
            duration_ms: 10_000,
            fps: 30,
            width: 320,
            height: 240,
            gop: 15,
            sample_rate: 48_000,
            channels: 2,
            samples_per_packet: 1_024,
            video: true,
            audio: true,
            audio_duration_ms: None,
            unknown_stream_every: None,
            fail_open: false,
            decode_delay: None,
        }
    }
}

impl SyntheticSpec {
    pub fn video_only() -> Self {
        Self {
            audio: false,
            ..Self::default()
        }
    }

    pub fn audio_only() -> Self {
        Self {
            video: false,
            ..Self::default()
        }
    }

    pub fn with_duration_ms(mut self, duration_ms: Millis) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_audio_duration_ms(mut self, duration_ms: Millis) -> Self {
        self.audio_duration_ms = Some(duration_ms);
        self
    }

    pub fn with_decode_delay(mut self, delay: Duration) -> Self {
        self.decode_delay = Some(delay);
        self
    }

    pub fn with_unknown_stream_every(mut self, every: u32) -> Self {
        self.unknown_stream_every = Some(every.max(1));
        self
    }

    pub fn failing() -> Self {
        Self {
            fail_open: true,
            ..Self::default()
        }
    }

    fn video_frames(&self) -> u64 {
        if self.video && self.fps > 0 {
            (self.duration_ms.max(0) as u64) * self.fps as u64 / 1_000
        } else {
            0
        }
    }

    fn video_ms(&self, index: u64) -> Millis {
        (index * 1_000 / self.fps.max(1) as u64) as Millis
    }

    fn video_pts(&self, index: u64) -> i64 {
        (index * VIDEO_TIME_BASE.den as u64 / self.fps.max(1) as u64) as i64
    }

    fn audio_duration(&self) -> Millis {
        self.audio_duration_ms.map_or(self.duration_ms, |ms| ms.min(self.duration_ms))
    }

    fn audio_samples(&self) -> u64 {
        if self.audio {
            (self.audio_duration().max(0) as u64) * self.sample_rate as u64 / 1_000
        } else {
            0
        }
    }

    fn audio_packets(&self) -> u64 {
        self.audio_samples().div_ceil(self.samples_per_packet.max(1) as u64)
    }

    fn audio_ms(&self, index: u64) -> Millis {
        samples_to_ms((index * self.samples_per_packet as u64) as i64, self.sample_rate)
    }

    fn audio_time_base(&self) -> TimeBase {
        TimeBase::sample_rate(self.sample_rate)
    }
}

/// Shared resource accounting for one backend.
#[derive(Debug, Default)]
pub struct Counters {
    live_packets: AtomicI64,
    live_frames: AtomicI64,
    packets_read: AtomicU64,
    frames_decoded: AtomicU64,
}

/// Snapshot of the backend's resource accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyntheticStats {
    /// Packets created and not yet dropped
    pub live_packets: i64,
    /// Frames created and not yet dropped
    pub live_frames: i64,
    pub packets_read: u64,
    pub frames_decoded: u64,
}

#[derive(Debug)]
struct PacketToken(Arc<Counters>);

impl PacketToken {
    fn new(counters: &Arc<Counters>) -> Self {
        counters.live_packets.fetch_add(1, Ordering::SeqCst);
        counters.packets_read.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counters))
    }
}

impl Drop for PacketToken {
    fn drop(&mut self) {
        self.0.live_packets.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct FrameToken(Arc<Counters>);

impl FrameToken {
    fn new(counters: &Arc<Counters>) -> Self {
        counters.live_frames.fetch_add(1, Ordering::SeqCst);
        counters.frames_decoded.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counters))
    }
}

impl Drop for FrameToken {
    fn drop(&mut self) {
        self.0.live_frames.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct SyntheticPacket {
    stream_index: usize,
    pts: i64,
    keyframe: bool,
    /// Sample count carried by an audio packet
    samples: u32,
    _token: PacketToken,
}

impl SyntheticPacket {
    pub fn is_keyframe(&self) -> bool {
        self.keyframe
    }
}

impl MediaPacket for SyntheticPacket {
    fn stream_index(&self) -> usize {
        self.stream_index
    }

    fn pts(&self) -> i64 {
        self.pts
    }
}

#[derive(Debug)]
pub struct SyntheticVideoFrame {
    pts: i64,
    width: u32,
    height: u32,
    _token: FrameToken,
}

impl SyntheticVideoFrame {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

impl MediaFrame for SyntheticVideoFrame {
    fn pts(&self) -> i64 {
        self.pts
    }
}

#[derive(Debug)]
pub struct SyntheticAudioFrame {
    pts: i64,
    samples: u32,
    _token: FrameToken,
}

impl SyntheticAudioFrame {
    pub fn samples(&self) -> u32 {
        self.samples
    }
}

impl MediaFrame for SyntheticAudioFrame {
    fn pts(&self) -> i64 {
        self.pts
    }
}

/// Frame type a [`SyntheticDecoder`] produces.
pub trait SyntheticFrame: MediaFrame + Sized {
    const STREAM: usize;
    /// Whether the decoder must see a keyframe after a flush.
    const NEEDS_KEYFRAME: bool;

    fn decode(packet: &SyntheticPacket, spec: &SyntheticSpec, counters: &Arc<Counters>) -> Self;
}

impl SyntheticFrame for SyntheticVideoFrame {
    const STREAM: usize = VIDEO_STREAM;
    const NEEDS_KEYFRAME: bool = true;

    fn decode(packet: &SyntheticPacket, spec: &SyntheticSpec, counters: &Arc<Counters>) -> Self {
        Self {
            pts: packet.pts,
            width: spec.width,
            height: spec.height,
            _token: FrameToken::new(counters),
        }
    }
}

impl SyntheticFrame for SyntheticAudioFrame {
    const STREAM: usize = AUDIO_STREAM;
    const NEEDS_KEYFRAME: bool = false;

    fn decode(packet: &SyntheticPacket, _spec: &SyntheticSpec, counters: &Arc<Counters>) -> Self {
        Self {
            pts: packet.pts,
            samples: packet.samples,
            _token: FrameToken::new(counters),
        }
    }
}

/// Generated container reader.
pub struct SyntheticDemuxer {
    spec: SyntheticSpec,
    counters: Arc<Counters>,
    next_video: u64,
    next_audio: u64,
    reads: u64,
}

impl SyntheticDemuxer {
    fn packet(&self, stream_index: usize, pts: i64, keyframe: bool, samples: u32) -> SyntheticPacket {
        SyntheticPacket {
            stream_index,
            pts,
            keyframe,
            samples,
            _token: PacketToken::new(&self.counters),
        }
    }

    fn next_video_packet(&mut self) -> SyntheticPacket {
        let index = self.next_video;
        self.next_video += 1;
        let keyframe = index % self.spec.gop.max(1) as u64 == 0;
        self.packet(VIDEO_STREAM, self.spec.video_pts(index), keyframe, 0)
    }

    fn next_audio_packet(&mut self) -> SyntheticPacket {
        let index = self.next_audio;
        self.next_audio += 1;
        let spp = self.spec.samples_per_packet as u64;
        let first = index * spp;
        let samples = spp.min(self.spec.audio_samples().saturating_sub(first)) as u32;
        self.packet(AUDIO_STREAM, first as i64, true, samples)
    }
}

impl Demuxer for SyntheticDemuxer {
    type Packet = SyntheticPacket;

    fn read_packet(&mut self) -> Result<Option<SyntheticPacket>, MediaError> {
        let video = (self.next_video < self.spec.video_frames()).then(|| self.spec.video_ms(self.next_video));
        let audio = (self.next_audio < self.spec.audio_packets()).then(|| self.spec.audio_ms(self.next_audio));
        if video.is_none() && audio.is_none() {
            return Ok(None);
        }

        self.reads += 1;
        if let Some(every) = self.spec.unknown_stream_every {
            if self.reads % every as u64 == 0 {
                return Ok(Some(self.packet(UNKNOWN_STREAM, 0, true, 0)));
            }
        }

        let packet = match (video, audio) {
            (Some(v), Some(a)) if a < v => self.next_audio_packet(),
            (Some(_), _) => self.next_video_packet(),
            (None, _) => self.next_audio_packet(),
        };
        Ok(Some(packet))
    }

    fn seek(&mut self, stream_index: usize, timestamp: i64) -> Result<(), MediaError> {
        let target_ms = match stream_index {
            VIDEO_STREAM if self.spec.video => pts_to_ms(timestamp, VIDEO_TIME_BASE),
            AUDIO_STREAM if self.spec.audio => pts_to_ms(timestamp, self.spec.audio_time_base()),
            other => return Err(MediaError::Seek(format!("no stream {}", other))),
        };
        let target_ms = target_ms.clamp(0, self.spec.duration_ms.max(0));

        let mut start_ms = target_ms;
        let frames = self.spec.video_frames();
        if frames > 0 {
            let mut index = (target_ms as u64 * self.spec.fps as u64 / 1_000).min(frames - 1);
            while index + 1 < frames && self.spec.video_ms(index + 1) <= target_ms {
                index += 1;
            }
            let keyframe = index - index % self.spec.gop.max(1) as u64;
            self.next_video = keyframe;
            start_ms = self.spec.video_ms(keyframe);
        }

        let packets = self.spec.audio_packets();
        if packets > 0 {
            let spp = self.spec.samples_per_packet.max(1) as u64;
            let mut index = (start_ms as u64 * self.spec.sample_rate as u64 / 1_000 / spp).min(packets - 1);
            while index > 0 && self.spec.audio_ms(index) > start_ms {
                index -= 1;
            }
            self.next_audio = index;
        }
        tracing::trace!(stream_index, target_ms, start_ms, "synthetic seek");
        Ok(())
    }
}

/// Generated decoder for either stream.
pub struct SyntheticDecoder<F> {
    spec: SyntheticSpec,
    counters: Arc<Counters>,
    pending: VecDeque<F>,
    eof: bool,
    need_keyframe: bool,
    _frame: PhantomData<fn() -> F>,
}

impl<F: SyntheticFrame> SyntheticDecoder<F> {
    fn new(spec: SyntheticSpec, counters: Arc<Counters>) -> Self {
        Self {
            spec,
            counters,
            pending: VecDeque::with_capacity(PENDING_LIMIT),
            eof: false,
            need_keyframe: F::NEEDS_KEYFRAME,
            _frame: PhantomData,
        }
    }
}

impl<F: SyntheticFrame> StreamDecoder for SyntheticDecoder<F> {
    type Packet = SyntheticPacket;
    type Frame = F;

    fn send_packet(&mut self, packet: &SyntheticPacket) -> Result<SendStatus, MediaError> {
        if packet.stream_index != F::STREAM {
            return Err(MediaError::Decode(format!(
                "packet of stream {} sent to decoder of stream {}",
                packet.stream_index,
                F::STREAM
            )));
        }
        if self.eof {
            return Ok(SendStatus::Eof);
        }
        if self.pending.len() >= PENDING_LIMIT {
            return Ok(SendStatus::Again);
        }
        if self.need_keyframe && !packet.keyframe {
            // undecodable until the next keyframe
            return Ok(SendStatus::Accepted);
        }
        self.need_keyframe = false;
        self.pending.push_back(F::decode(packet, &self.spec, &self.counters));
        Ok(SendStatus::Accepted)
    }

    fn send_eof(&mut self) -> Result<(), MediaError> {
        self.eof = true;
        Ok(())
    }

    fn receive_frame(&mut self) -> Result<DecodeStatus<F>, MediaError> {
        match self.pending.pop_front() {
            Some(frame) => {
                if let Some(delay) = self.spec.decode_delay {
                    thread::sleep(delay);
                }
                Ok(DecodeStatus::Ready(frame))
            }
            None if self.eof => Ok(DecodeStatus::Eof),
            None => Ok(DecodeStatus::Again),
        }
    }

    fn flush(&mut self) {
        self.pending.clear();
        self.eof = false;
        self.need_keyframe = F::NEEDS_KEYFRAME;
    }
}

pub type SyntheticVideoDecoder = SyntheticDecoder<SyntheticVideoFrame>;
pub type SyntheticAudioDecoder = SyntheticDecoder<SyntheticAudioFrame>;

/// Writes [`SAMPLE_VALUE`] for every sample of every channel.
pub struct SyntheticResampler {
    rate: u32,
    channels: u16,
}

impl Resampler for SyntheticResampler {
    type Frame = SyntheticAudioFrame;

    fn resample(&mut self, frame: &SyntheticAudioFrame, out: &mut Vec<f32>) -> Result<usize, MediaError> {
        let count = frame.samples as usize;
        out.extend(std::iter::repeat(SAMPLE_VALUE).take(count * self.channels as usize));
        Ok(count)
    }

    fn output_rate(&self) -> u32 {
        self.rate
    }

    fn output_channels(&self) -> u16 {
        self.channels
    }
}

/// Backend producing [`SyntheticSpec`]-shaped media for any path.
#[derive(Debug, Clone)]
pub struct SyntheticBackend {
    spec: SyntheticSpec,
    counters: Arc<Counters>,
}

impl SyntheticBackend {
    pub fn new(spec: SyntheticSpec) -> Self {
        Self {
            spec,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn spec(&self) -> &SyntheticSpec {
        &self.spec
    }

    pub fn stats(&self) -> SyntheticStats {
        SyntheticStats {
            live_packets: self.counters.live_packets.load(Ordering::SeqCst),
            live_frames: self.counters.live_frames.load(Ordering::SeqCst),
            packets_read: self.counters.packets_read.load(Ordering::SeqCst),
            frames_decoded: self.counters.frames_decoded.load(Ordering::SeqCst),
        }
    }

    fn info(&self) -> MediaInfo {
        let spec = &self.spec;
        let video = spec.video.then(|| VideoStreamInfo {
            stream: StreamInfo {
                index: VIDEO_STREAM,
                kind: StreamKind::Video,
                time_base: VIDEO_TIME_BASE,
                duration_ms: spec.duration_ms,
                codec_name: "synthetic-video".to_string(),
            },
            width: spec.width,
            height: spec.height,
            fps: spec.fps as f64,
        });
        let audio = spec.audio.then(|| AudioStreamInfo {
            stream: StreamInfo {
                index: AUDIO_STREAM,
                kind: StreamKind::Audio,
                time_base: spec.audio_time_base(),
                duration_ms: spec.audio_duration(),
                codec_name: "synthetic-pcm".to_string(),
            },
            sample_rate: spec.sample_rate,
            channels: spec.channels,
        });
        MediaInfo {
            video,
            audio,
            duration_ms: spec.duration_ms,
        }
    }
}

impl Default for SyntheticBackend {
    fn default() -> Self {
        Self::new(SyntheticSpec::default())
    }
}

impl MediaBackend for SyntheticBackend {
    type Packet = SyntheticPacket;
    type VideoFrame = SyntheticVideoFrame;
    type AudioFrame = SyntheticAudioFrame;
    type Demuxer = SyntheticDemuxer;
    type VideoDecoder = SyntheticVideoDecoder;
    type AudioDecoder = SyntheticAudioDecoder;
    type Resampler = SyntheticResampler;

    fn open(&self, path: &Path) -> Result<OpenedMedia<Self>, MediaError> {
        if self.spec.fail_open {
            return Err(MediaError::open(path, "synthetic open failure"));
        }
        if !self.spec.video && !self.spec.audio {
            return Err(MediaError::NoStreams);
        }
        tracing::debug!(path = %path.display(), spec = ?self.spec, "opening synthetic media");

        let demuxer = SyntheticDemuxer {
            spec: self.spec.clone(),
            counters: Arc::clone(&self.counters),
            next_video: 0,
            next_audio: 0,
            reads: 0,
        };
        let video = self
            .spec
            .video
            .then(|| SyntheticDecoder::new(self.spec.clone(), Arc::clone(&self.counters)));
        let audio = self.spec.audio.then(|| {
            (
                SyntheticDecoder::new(self.spec.clone(), Arc::clone(&self.counters)),
                SyntheticResampler {
                    rate: self.spec.sample_rate,
                    channels: self.spec.channels,
                },
            )
        });
        Ok(OpenedMedia {
            info: self.info(),
            demuxer,
            video,
            audio,
        })
    }
}
