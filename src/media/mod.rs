//! Container and codec boundary.

pub mod source;
pub mod stream;
pub mod synthetic;

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

pub use source::{
    DecodeStatus, Demuxer, MediaBackend, MediaError, MediaFrame, MediaPacket, OpenedMedia, Resampler,
    SendStatus, StreamDecoder,
};
pub use stream::{AudioStreamInfo, MediaInfo, StreamInfo, StreamKind, VideoStreamInfo};
pub use synthetic::{SyntheticBackend, SyntheticSpec, SyntheticStats};

#[cfg(feature = "ffmpeg")]
pub use self::ffmpeg::FfmpegBackend;
