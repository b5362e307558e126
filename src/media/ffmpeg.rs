//! Container and codec access through FFmpeg.
//!
//! The safe `ffmpeg-next` API covers almost everything; the only raw FFI call
//! is the per-stream backward seek. Decoded audio goes through libswresample
//! into packed `f32`, mono or stereo, at the stream's own rate.

use std::path::Path;

use ffmpeg_next as ffmpeg;
use ffmpeg::format::{context::Input, sample, Sample};
use ffmpeg::software::resampling;
use ffmpeg::{codec, decoder, frame, media, ChannelLayout, Packet};

use super::source::{
    DecodeStatus, Demuxer, MediaBackend, MediaError, MediaFrame, MediaPacket, OpenedMedia, Resampler,
    SendStatus, StreamDecoder,
};
use super::stream::{AudioStreamInfo, MediaInfo, StreamInfo, StreamKind, VideoStreamInfo};
use crate::time::{pts_to_ms, Millis, TimeBase, NOPTS};

fn is_again(error: &ffmpeg::Error) -> bool {
    matches!(error, ffmpeg::Error::Other { errno } if *errno == ffmpeg::error::EAGAIN)
}

fn time_base(rational: ffmpeg::Rational) -> TimeBase {
    TimeBase::new(rational.numerator(), rational.denominator())
}

fn duration_ms(duration: i64, tb: TimeBase) -> Millis {
    if duration <= 0 || duration == NOPTS {
        0
    } else {
        pts_to_ms(duration, tb)
    }
}

/// Compressed packet owned by the pipeline.
pub struct FfmpegPacket(Packet);

impl MediaPacket for FfmpegPacket {
    fn stream_index(&self) -> usize {
        self.0.stream()
    }

    fn pts(&self) -> i64 {
        self.0.pts().unwrap_or(NOPTS)
    }
}

/// Decoded picture in the decoder's native pixel format.
pub struct FfmpegVideoFrame(frame::Video);

impl FfmpegVideoFrame {
    pub fn frame(&self) -> &frame::Video {
        &self.0
    }
}

impl MediaFrame for FfmpegVideoFrame {
    fn pts(&self) -> i64 {
        self.0.timestamp().or_else(|| self.0.pts()).unwrap_or(NOPTS)
    }
}

/// Decoded block of audio samples in the decoder's native format.
pub struct FfmpegAudioFrame(frame::Audio);

impl FfmpegAudioFrame {
    pub fn frame(&self) -> &frame::Audio {
        &self.0
    }
}

impl MediaFrame for FfmpegAudioFrame {
    fn pts(&self) -> i64 {
        self.0.timestamp().or_else(|| self.0.pts()).unwrap_or(NOPTS)
    }
}

pub struct FfmpegDemuxer {
    input: Input,
}

// The format context is only ever touched under the player's demux lock.
unsafe impl Send for FfmpegDemuxer {}

impl Demuxer for FfmpegDemuxer {
    type Packet = FfmpegPacket;

    fn read_packet(&mut self) -> Result<Option<FfmpegPacket>, MediaError> {
        loop {
            let mut packet = Packet::empty();
            match packet.read(&mut self.input) {
                Ok(()) => return Ok(Some(FfmpegPacket(packet))),
                Err(ffmpeg::Error::Eof) => return Ok(None),
                Err(ref e) if is_again(e) => continue,
                Err(e) => return Err(MediaError::Read(e.to_string())),
            }
        }
    }

    fn seek(&mut self, stream_index: usize, timestamp: i64) -> Result<(), MediaError> {
        let ret = unsafe {
            ffmpeg::ffi::av_seek_frame(
                self.input.as_mut_ptr(),
                stream_index as i32,
                timestamp,
                ffmpeg::ffi::AVSEEK_FLAG_BACKWARD as i32,
            )
        };
        if ret < 0 {
            return Err(MediaError::Seek(ffmpeg::Error::from(ret).to_string()));
        }
        Ok(())
    }
}

fn send(opened: &mut decoder::Opened, packet: &FfmpegPacket) -> Result<SendStatus, MediaError> {
    match opened.send_packet(&packet.0) {
        Ok(()) => Ok(SendStatus::Accepted),
        Err(ffmpeg::Error::Eof) => Ok(SendStatus::Eof),
        Err(ref e) if is_again(e) => Ok(SendStatus::Again),
        Err(e) => Err(MediaError::Decode(e.to_string())),
    }
}

fn receive(opened: &mut decoder::Opened, frame: &mut frame::Frame) -> Result<DecodeStatus<()>, MediaError> {
    match opened.receive_frame(frame) {
        Ok(()) => Ok(DecodeStatus::Ready(())),
        Err(ffmpeg::Error::Eof) => Ok(DecodeStatus::Eof),
        Err(ref e) if is_again(e) => Ok(DecodeStatus::Again),
        Err(e) => Err(MediaError::Decode(e.to_string())),
    }
}

pub struct FfmpegVideoDecoder(decoder::Video);

unsafe impl Send for FfmpegVideoDecoder {}

impl StreamDecoder for FfmpegVideoDecoder {
    type Packet = FfmpegPacket;
    type Frame = FfmpegVideoFrame;

    fn send_packet(&mut self, packet: &FfmpegPacket) -> Result<SendStatus, MediaError> {
        send(&mut self.0, packet)
    }

    fn send_eof(&mut self) -> Result<(), MediaError> {
        Ok(self.0.send_eof()?)
    }

    fn receive_frame(&mut self) -> Result<DecodeStatus<FfmpegVideoFrame>, MediaError> {
        let mut decoded = frame::Video::empty();
        Ok(match receive(&mut self.0, &mut decoded)? {
            DecodeStatus::Ready(()) => DecodeStatus::Ready(FfmpegVideoFrame(decoded)),
            DecodeStatus::Again => DecodeStatus::Again,
            DecodeStatus::Eof => DecodeStatus::Eof,
        })
    }

    fn flush(&mut self) {
        self.0.flush();
    }
}

pub struct FfmpegAudioDecoder(decoder::Audio);

unsafe impl Send for FfmpegAudioDecoder {}

impl StreamDecoder for FfmpegAudioDecoder {
    type Packet = FfmpegPacket;
    type Frame = FfmpegAudioFrame;

    fn send_packet(&mut self, packet: &FfmpegPacket) -> Result<SendStatus, MediaError> {
        send(&mut self.0, packet)
    }

    fn send_eof(&mut self) -> Result<(), MediaError> {
        Ok(self.0.send_eof()?)
    }

    fn receive_frame(&mut self) -> Result<DecodeStatus<FfmpegAudioFrame>, MediaError> {
        let mut decoded = frame::Audio::empty();
        Ok(match receive(&mut self.0, &mut decoded)? {
            DecodeStatus::Ready(()) => DecodeStatus::Ready(FfmpegAudioFrame(decoded)),
            DecodeStatus::Again => DecodeStatus::Again,
            DecodeStatus::Eof => DecodeStatus::Eof,
        })
    }

    fn flush(&mut self) {
        self.0.flush();
    }
}

/// Converts decoded audio to packed `f32` through libswresample, keeping the
/// source rate and folding anything wider than stereo down to two channels.
pub struct FfmpegResampler {
    context: resampling::Context,
    rate: u32,
    channels: u16,
}

// Owned by the audio pipeline and only used under its decoder lock.
unsafe impl Send for FfmpegResampler {}

/// Device layout for a source with `channels` channels.
fn output_layout(channels: u16) -> ChannelLayout {
    match channels {
        1 => ChannelLayout::MONO,
        _ => ChannelLayout::STEREO,
    }
}

impl FfmpegResampler {
    fn new(decoder: &decoder::Audio, channels: u16) -> Result<Self, MediaError> {
        let rate = decoder.rate();
        let layout = output_layout(channels);
        let mut source_layout = decoder.channel_layout();
        if source_layout.is_empty() {
            source_layout = ChannelLayout::default(i32::from(channels));
        }
        let context = resampling::Context::get(
            decoder.format(),
            source_layout,
            rate,
            Sample::F32(sample::Type::Packed),
            layout,
            rate,
        )
        .map_err(|e| MediaError::Resample(format!("cannot create resampler: {}", e)))?;
        Ok(Self {
            context,
            rate,
            channels: layout.channels() as u16,
        })
    }
}

impl Resampler for FfmpegResampler {
    type Frame = FfmpegAudioFrame;

    fn resample(&mut self, frame: &FfmpegAudioFrame, out: &mut Vec<f32>) -> Result<usize, MediaError> {
        let mut converted = frame::Audio::empty();
        self.context
            .run(&frame.0, &mut converted)
            .map_err(|e| MediaError::Resample(e.to_string()))?;

        let samples = converted.samples();
        let count = samples * self.channels as usize;
        let data = converted.data(0);
        if data.len() < count * 4 {
            return Err(MediaError::Resample("short audio buffer".to_string()));
        }
        out.reserve(count);
        out.extend(
            data[..count * 4]
                .chunks_exact(4)
                .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]])),
        );
        Ok(samples)
    }

    fn output_rate(&self) -> u32 {
        self.rate
    }

    fn output_channels(&self) -> u16 {
        self.channels
    }
}

/// The system FFmpeg libraries.
#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegBackend;

impl FfmpegBackend {
    pub fn new() -> Self {
        Self
    }
}

impl MediaBackend for FfmpegBackend {
    type Packet = FfmpegPacket;
    type VideoFrame = FfmpegVideoFrame;
    type AudioFrame = FfmpegAudioFrame;
    type Demuxer = FfmpegDemuxer;
    type VideoDecoder = FfmpegVideoDecoder;
    type AudioDecoder = FfmpegAudioDecoder;
    type Resampler = FfmpegResampler;

    fn open(&self, path: &Path) -> Result<OpenedMedia<Self>, MediaError> {
        ffmpeg::init().map_err(|e| MediaError::open(path, e))?;
        let input = ffmpeg::format::input(&path).map_err(|e| MediaError::open(path, e))?;
        let container_ms = duration_ms(input.duration(), TimeBase::MICROS);

        let mut video_info = None;
        let mut video_decoder = None;
        if let Some(stream) = input.streams().best(media::Type::Video) {
            let tb = time_base(stream.time_base());
            let context = codec::context::Context::from_parameters(stream.parameters())?;
            let decoder = context
                .decoder()
                .video()
                .map_err(|e| MediaError::CodecOpen(e.to_string()))?;
            let rate = stream.avg_frame_rate();
            let fps = if rate.denominator() != 0 { f64::from(rate) } else { 0.0 };
            video_info = Some(VideoStreamInfo {
                stream: StreamInfo {
                    index: stream.index(),
                    kind: StreamKind::Video,
                    time_base: tb,
                    duration_ms: duration_ms(stream.duration(), tb),
                    codec_name: decoder.id().name().to_string(),
                },
                width: decoder.width(),
                height: decoder.height(),
                fps,
            });
            video_decoder = Some(FfmpegVideoDecoder(decoder));
        }

        let mut audio_info = None;
        let mut audio = None;
        if let Some(stream) = input.streams().best(media::Type::Audio) {
            let tb = time_base(stream.time_base());
            let context = codec::context::Context::from_parameters(stream.parameters())?;
            let decoder = context
                .decoder()
                .audio()
                .map_err(|e| MediaError::CodecOpen(e.to_string()))?;
            let channels = unsafe { (*decoder.as_ptr()).ch_layout.nb_channels }.max(1) as u16;
            let sample_rate = decoder.rate();
            audio_info = Some(AudioStreamInfo {
                stream: StreamInfo {
                    index: stream.index(),
                    kind: StreamKind::Audio,
                    time_base: tb,
                    duration_ms: duration_ms(stream.duration(), tb),
                    codec_name: decoder.id().name().to_string(),
                },
                sample_rate,
                channels,
            });
            let resampler = FfmpegResampler::new(&decoder, channels)?;
            audio = Some((FfmpegAudioDecoder(decoder), resampler));
        }

        if video_info.is_none() && audio_info.is_none() {
            return Err(MediaError::NoStreams);
        }

        let stream_ms = video_info
            .as_ref()
            .map(|v| v.stream.duration_ms)
            .into_iter()
            .chain(audio_info.as_ref().map(|a| a.stream.duration_ms))
            .max()
            .unwrap_or(0);
        let info = MediaInfo {
            video: video_info,
            audio: audio_info,
            duration_ms: if container_ms > 0 { container_ms } else { stream_ms },
        };
        tracing::info!(
            path = %path.display(),
            duration_ms = info.duration_ms,
            video = info.has_video(),
            audio = info.has_audio(),
            "opened media"
        );

        Ok(OpenedMedia {
            info,
            demuxer: FfmpegDemuxer { input },
            video: video_decoder,
            audio,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_layout_folds_to_stereo() {
        assert_eq!(output_layout(1), ChannelLayout::MONO);
        assert_eq!(output_layout(2), ChannelLayout::STEREO);
        assert_eq!(output_layout(6), ChannelLayout::STEREO);
        assert_eq!(output_layout(6).channels(), 2);
    }
}
