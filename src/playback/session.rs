//! Everything owned by one opened file: the demuxer, both stream pipelines,
//! the audio renderer and the worker threads.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use super::audio::AudioRenderer;
use super::decode::{PacketMessage, StreamPipeline};
use super::state::WorkerStatus;
use super::sync::ClockState;
use super::worker::{Worker, WorkerControl};
use crate::config::PlayerConfig;
use crate::media::{MediaBackend, MediaInfo, MediaPacket, OpenedMedia, StreamKind};

/// Something a seek read past its priming point.
pub(crate) enum Readahead<P> {
    Packet(P),
    EndOfFile,
}

pub struct Session<B: MediaBackend> {
    pub(crate) info: MediaInfo,
    pub(crate) demuxer: Mutex<B::Demuxer>,
    pub(crate) demux_control: WorkerControl,
    /// Seek epoch. Read and bumped only under the demuxer lock.
    pub(crate) epoch: AtomicU64,
    /// Left over by the last seek and replayed by the demux worker before it
    /// reads again. Touched only under the demuxer lock.
    pub(crate) readahead: Mutex<VecDeque<Readahead<B::Packet>>>,
    pub(crate) video: Option<StreamPipeline<B::VideoDecoder>>,
    pub(crate) audio: Option<StreamPipeline<B::AudioDecoder>>,
    pub(crate) renderer: Option<Arc<AudioRenderer<B::Resampler>>>,
    pub(crate) clock: Arc<ClockState>,
    /// The video end-of-stream entry has been handed to the renderer.
    pub(crate) video_finished: AtomicBool,
    pub(crate) workers: Mutex<Vec<Worker>>,
}

impl<B: MediaBackend> Session<B> {
    pub(crate) fn new(opened: OpenedMedia<B>, clock: Arc<ClockState>, config: &PlayerConfig) -> Self {
        let OpenedMedia {
            info,
            demuxer,
            video,
            audio,
        } = opened;

        let video = match (video, info.video.as_ref()) {
            (Some(decoder), Some(stream)) => Some(StreamPipeline::new(
                StreamKind::Video,
                stream.stream.index,
                stream.stream.time_base,
                decoder,
                config.packet_channel_capacity,
                config.video_timeline_capacity,
            )),
            _ => None,
        };

        let (audio, renderer) = match (audio, info.audio.as_ref()) {
            (Some((decoder, resampler)), Some(stream)) => {
                let pipe = StreamPipeline::new(
                    StreamKind::Audio,
                    stream.stream.index,
                    stream.stream.time_base,
                    decoder,
                    config.packet_channel_capacity,
                    config.audio_timeline_capacity,
                );
                let renderer = AudioRenderer::new(
                    resampler,
                    Arc::clone(&pipe.timeline),
                    Arc::clone(&clock),
                    config.audio_sync_threshold_ms,
                );
                (Some(pipe), Some(Arc::new(renderer)))
            }
            _ => (None, None),
        };

        Self {
            info,
            demuxer: Mutex::new(demuxer),
            demux_control: WorkerControl::new("demux", WorkerStatus::Working),
            epoch: AtomicU64::new(0),
            readahead: Mutex::new(VecDeque::new()),
            video,
            audio,
            renderer,
            clock,
            video_finished: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Hand a packet to the channel of its stream. Packets of streams
    /// without a pipeline are dropped. Returns `false` once the target
    /// channel is closed.
    pub(crate) fn route(&self, packet: B::Packet, epoch: u64) -> bool {
        let index = packet.stream_index();
        if let Some(video) = self.video.as_ref().filter(|p| p.stream_index == index) {
            return video.packets.send(PacketMessage::Packet { epoch, packet });
        }
        if let Some(audio) = self.audio.as_ref().filter(|p| p.stream_index == index) {
            return audio.packets.send(PacketMessage::Packet { epoch, packet });
        }
        tracing::warn!(stream = index, "packet of unknown stream dropped");
        true
    }

    /// Tell every decode worker the demuxer ran dry.
    pub(crate) fn send_end_of_stream(&self, epoch: u64) {
        if let Some(video) = &self.video {
            video.packets.send(PacketMessage::EndOfStream { epoch });
        }
        if let Some(audio) = &self.audio {
            audio.packets.send(PacketMessage::EndOfStream { epoch });
        }
    }

    /// Every present stream has played its end-of-stream entry.
    pub(crate) fn is_finished(&self) -> bool {
        let video_done = self.video.is_none() || self.video_finished.load(Ordering::Acquire);
        let audio_done = self.renderer.as_ref().map_or(true, |r| r.is_finished());
        video_done && audio_done
    }

    /// Flip every worker to `Exiting` and close every queue, then join the
    /// threads. Nothing may block on a queue after this returns.
    pub(crate) fn shutdown(&self) {
        self.demux_control.set(WorkerStatus::Exiting);
        if let Some(video) = &self.video {
            video.shut_down();
        }
        if let Some(audio) = &self.audio {
            audio.shut_down();
        }
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            tracing::debug!(worker = worker.name(), "joining");
            worker.join();
        }
    }
}
