//! Stream descriptors reported when a media file is opened.

use crate::time::{Millis, TimeBase};

/// Kind of elementary stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
}

/// Information about a video or audio stream
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub index: usize,
    pub kind: StreamKind,
    pub time_base: TimeBase,
    /// Duration in milliseconds, 0 if the container does not say
    pub duration_ms: Millis,
    pub codec_name: String,
}

/// Video-specific stream information
#[derive(Debug, Clone, PartialEq)]
pub struct VideoStreamInfo {
    pub stream: StreamInfo,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

impl VideoStreamInfo {
    /// Nominal display duration of one frame.
    pub fn frame_duration_ms(&self) -> Millis {
        if self.fps > 0.0 {
            (1_000.0 / self.fps).round() as Millis
        } else {
            0
        }
    }
}

/// Audio-specific stream information
#[derive(Debug, Clone, PartialEq)]
pub struct AudioStreamInfo {
    pub stream: StreamInfo,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Everything known about an opened file.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaInfo {
    pub video: Option<VideoStreamInfo>,
    pub audio: Option<AudioStreamInfo>,
    pub duration_ms: Millis,
}

impl MediaInfo {
    pub fn has_video(&self) -> bool {
        self.video.is_some()
    }

    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    /// Frame size of the video stream, `(0, 0)` without one.
    pub fn dimensions(&self) -> (u32, u32) {
        self.video
            .as_ref()
            .map(|v| (v.width, v.height))
            .unwrap_or((0, 0))
    }

    pub fn stream_kind(&self, index: usize) -> Option<StreamKind> {
        if self.video.as_ref().is_some_and(|v| v.stream.index == index) {
            Some(StreamKind::Video)
        } else if self.audio.as_ref().is_some_and(|a| a.stream.index == index) {
            Some(StreamKind::Audio)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> MediaInfo {
        MediaInfo {
            video: Some(VideoStreamInfo {
                stream: StreamInfo {
                    index: 0,
                    kind: StreamKind::Video,
                    time_base: TimeBase::new(1, 90_000),
                    duration_ms: 10_000,
                    codec_name: "h264".into(),
                },
                width: 1920,
                height: 1080,
                fps: 29.97,
            }),
            audio: Some(AudioStreamInfo {
                stream: StreamInfo {
                    index: 1,
                    kind: StreamKind::Audio,
                    time_base: TimeBase::sample_rate(48_000),
                    duration_ms: 10_000,
                    codec_name: "aac".into(),
                },
                sample_rate: 48_000,
                channels: 2,
            }),
            duration_ms: 10_000,
        }
    }

    #[test]
    fn test_stream_lookup() {
        let info = info();
        assert_eq!(info.stream_kind(0), Some(StreamKind::Video));
        assert_eq!(info.stream_kind(1), Some(StreamKind::Audio));
        assert_eq!(info.stream_kind(2), None);
        assert_eq!(info.dimensions(), (1920, 1080));
    }

    #[test]
    fn test_frame_duration() {
        let info = info();
        assert_eq!(info.video.unwrap().frame_duration_ms(), 33);
    }
}
