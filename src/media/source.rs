//! Interfaces to the container/codec library.
//!
//! The playback pipeline only ever talks to these traits. Each handle is
//! owned by exactly one lock in the player: the demuxer by the demux lock,
//! each decoder by its own lock, the resampler by the audio renderer.

use std::path::{Path, PathBuf};

use super::stream::MediaInfo;

/// Error type for container and codec operations
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("Failed to open {path}: {reason}")]
    Open { path: PathBuf, reason: String },
    #[error("No decodable video or audio stream")]
    NoStreams,
    #[error("Decoder not found for stream {0}")]
    CodecNotFound(usize),
    #[error("Failed to open decoder: {0}")]
    CodecOpen(String),
    #[error("Read failed: {0}")]
    Read(String),
    #[error("Decode failed: {0}")]
    Decode(String),
    #[error("Seek failed: {0}")]
    Seek(String),
    #[error("Resample failed: {0}")]
    Resample(String),
    #[cfg(feature = "ffmpeg")]
    #[error("FFmpeg error: {0}")]
    Ffmpeg(#[from] ffmpeg_next::Error),
}

impl MediaError {
    pub fn open(path: &Path, reason: impl ToString) -> Self {
        MediaError::Open {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}

/// Outcome of asking a decoder for a frame.
#[derive(Debug, PartialEq, Eq)]
pub enum DecodeStatus<T> {
    Ready(T),
    /// Needs more input before it can produce a frame.
    Again,
    /// Fully drained after end of input.
    Eof,
}

/// Outcome of feeding a packet to a decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Accepted,
    /// Input is full; drain frames and resend the same packet.
    Again,
    /// The decoder has already been told the input ended.
    Eof,
}

/// A compressed packet. Dropping it releases the underlying buffer.
pub trait MediaPacket: Send + 'static {
    fn stream_index(&self) -> usize;
    /// Timestamp in the stream's time base, `NOPTS` if unknown.
    fn pts(&self) -> i64;
}

/// A decoded picture or block of samples. Dropping it releases the buffer.
pub trait MediaFrame: Send + 'static {
    /// Presentation timestamp in the stream's time base, `NOPTS` if unknown.
    fn pts(&self) -> i64;
}

/// Container reader.
pub trait Demuxer: Send + 'static {
    type Packet: MediaPacket;

    /// Next packet of any stream. `Ok(None)` at end of file.
    fn read_packet(&mut self) -> Result<Option<Self::Packet>, MediaError>;

    /// Reposition to the keyframe at or before `timestamp`, given in the time
    /// base of `stream_index`.
    fn seek(&mut self, stream_index: usize, timestamp: i64) -> Result<(), MediaError>;
}

/// Decoder for one elementary stream.
pub trait StreamDecoder: Send + 'static {
    type Packet: MediaPacket;
    type Frame: MediaFrame;

    fn send_packet(&mut self, packet: &Self::Packet) -> Result<SendStatus, MediaError>;

    /// Signal end of input so buffered frames can be drained.
    fn send_eof(&mut self) -> Result<(), MediaError>;

    fn receive_frame(&mut self) -> Result<DecodeStatus<Self::Frame>, MediaError>;

    /// Discard buffered state, e.g. after a seek.
    fn flush(&mut self);
}

/// Converts decoded audio to interleaved `f32` at the output format.
pub trait Resampler: Send + 'static {
    type Frame: MediaFrame;

    /// Append the converted samples of `frame` to `out`. Returns the number of
    /// sample frames (samples per channel) appended.
    fn resample(&mut self, frame: &Self::Frame, out: &mut Vec<f32>) -> Result<usize, MediaError>;

    fn output_rate(&self) -> u32;

    fn output_channels(&self) -> u16;
}

/// Handles produced by [`MediaBackend::open`].
pub struct OpenedMedia<B: MediaBackend> {
    pub info: MediaInfo,
    pub demuxer: B::Demuxer,
    pub video: Option<B::VideoDecoder>,
    pub audio: Option<(B::AudioDecoder, B::Resampler)>,
}

/// A container/codec library.
pub trait MediaBackend: Send + Sync + Sized + 'static {
    type Packet: MediaPacket;
    type VideoFrame: MediaFrame;
    type AudioFrame: MediaFrame;
    type Demuxer: Demuxer<Packet = Self::Packet>;
    type VideoDecoder: StreamDecoder<Packet = Self::Packet, Frame = Self::VideoFrame>;
    type AudioDecoder: StreamDecoder<Packet = Self::Packet, Frame = Self::AudioFrame>;
    type Resampler: Resampler<Frame = Self::AudioFrame>;

    /// Open `path`, pick the best video and audio streams and open their
    /// decoders.
    fn open(&self, path: &Path) -> Result<OpenedMedia<Self>, MediaError>;
}
