//! Playback controller: owns the clock, the audio device and the session of
//! the open file, and coordinates every state change across the workers.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::audio::AudioRenderer;
use super::decode::{self, prime_with, Prime, StreamPipeline};
use super::demux;
use super::fatal;
use super::session::{Readahead, Session};
use super::state::{PlaybackPhase, WorkerStatus};
use super::sync::{ClockSource, ClockState};
use super::worker::Worker;
use crate::audio::{AudioOutput, AudioOutputError, AudioSource, OutputSpec};
use crate::config::{ConfigError, PlayerConfig};
use crate::media::{Demuxer, MediaBackend, MediaError, MediaInfo, MediaPacket, Resampler, StreamDecoder};
use crate::time::{format_time, ms_to_pts, Millis};

/// Error type for playback operations
#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    #[error("No media is open")]
    NotOpened,
    #[error("Media has no playable stream")]
    NoStreams,
    #[error("Cannot {operation} while {phase}")]
    InvalidState {
        operation: &'static str,
        phase: PlaybackPhase,
    },
    #[error("Media error: {0}")]
    Media(#[from] MediaError),
    #[error("Audio error: {0}")]
    Audio(#[from] AudioOutputError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Thread error: {0}")]
    Thread(String),
}

/// Result of polling for the next picture
#[derive(Debug)]
pub enum FetchedFrame<F> {
    Frame { frame: F, present_ms: Millis },
    /// The video stream is over; nothing further will be returned.
    EndOfStream,
}

/// Snapshot of how full each queue is
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepths {
    pub video_packets: usize,
    pub audio_packets: usize,
    pub video_frames: usize,
    pub audio_frames: usize,
}

/// A media player.
///
/// Opening a file builds the pipeline; [`start_playback`](Self::start_playback)
/// spawns the demux and decode threads and starts the audio device. Every
/// method takes `&self`, so a player can be shared between the UI thread and
/// a render thread.
pub struct Player<B: MediaBackend> {
    backend: B,
    config: PlayerConfig,
    clock: Arc<ClockState>,
    output: Mutex<Box<dyn AudioOutput>>,
    session: Mutex<Option<Arc<Session<B>>>>,
    /// Serializes open/close/start/pause/seek/speed.
    control: Mutex<()>,
}

impl<B: MediaBackend> Player<B> {
    /// Create a new player
    pub fn new(backend: B, output: Box<dyn AudioOutput>, config: PlayerConfig) -> Result<Self, PlaybackError> {
        config.validate()?;
        Ok(Self {
            backend,
            config,
            clock: Arc::new(ClockState::new()),
            output: Mutex::new(output),
            session: Mutex::new(None),
            control: Mutex::new(()),
        })
    }

    /// Create a new player with default settings
    pub fn with_defaults(backend: B, output: Box<dyn AudioOutput>) -> Self {
        Self {
            backend,
            config: PlayerConfig::default(),
            clock: Arc::new(ClockState::new()),
            output: Mutex::new(output),
            session: Mutex::new(None),
            control: Mutex::new(()),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.config
    }

    fn session(&self) -> Result<Arc<Session<B>>, PlaybackError> {
        self.session.lock().clone().ok_or(PlaybackError::NotOpened)
    }

    fn invalid(&self, operation: &'static str) -> PlaybackError {
        PlaybackError::InvalidState {
            operation,
            phase: self.clock.phase(),
        }
    }

    /// Open `path`, replacing any open file. No thread is started until
    /// [`start_playback`](Self::start_playback).
    pub fn open(&self, path: impl AsRef<Path>) -> Result<MediaInfo, PlaybackError> {
        let path = path.as_ref();
        let _control = self.control.lock();
        self.close_locked();

        let opened = self.backend.open(path).map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "failed to open media");
            PlaybackError::from(e)
        })?;
        if opened.video.is_none() && opened.audio.is_none() {
            tracing::error!(path = %path.display(), "no decodable stream");
            return Err(PlaybackError::NoStreams);
        }

        let (source, sample_rate) = match &opened.audio {
            Some((_, resampler)) => (ClockSource::AudioSamples, resampler.output_rate()),
            None => (ClockSource::Monotonic, 0),
        };
        self.clock.reset();
        self.clock.configure(source, sample_rate);

        let session = Arc::new(Session::new(opened, Arc::clone(&self.clock), &self.config));
        let info = session.info.clone();
        let (width, height) = info.dimensions();
        tracing::info!(
            path = %path.display(),
            duration = %format_time(info.duration_ms),
            width,
            height,
            audio = info.has_audio(),
            clock = ?source,
            "media opened"
        );
        *self.session.lock() = Some(session);
        Ok(info)
    }

    /// [`open`](Self::open), reporting only success. Failures are logged.
    pub fn open_path(&self, path: impl AsRef<Path>) -> bool {
        self.open(path).is_ok()
    }

    /// Stop every worker, release the device and forget the file. The player
    /// can open another file afterwards.
    pub fn close(&self) {
        let _control = self.control.lock();
        self.close_locked();
    }

    fn close_locked(&self) {
        let Some(session) = self.session.lock().take() else {
            return;
        };
        self.clock.set_phase(PlaybackPhase::Exiting);
        // no callback may run once the device is closed
        self.output.lock().close();
        session.shutdown();
        self.clock.reset();
        tracing::info!("media closed");
    }

    /// Spawn the workers, start the audio device and begin playing.
    pub fn start_playback(&self) -> Result<(), PlaybackError> {
        let _control = self.control.lock();
        let session = self.session()?;
        if self.clock.phase() != PlaybackPhase::Idle {
            return Err(self.invalid("start playback"));
        }
        if let Some(renderer) = &session.renderer {
            self.open_device(renderer, self.clock.speed())?;
        }
        self.spawn_workers(&session)?;
        self.clock.set_phase(PlaybackPhase::Playing);
        tracing::info!(at = %format_time(self.clock.played_ms()), "playback started");
        Ok(())
    }

    fn open_device(&self, renderer: &Arc<AudioRenderer<B::Resampler>>, speed: f64) -> Result<(), PlaybackError> {
        let spec = OutputSpec {
            sample_rate: (renderer.sample_rate() as f64 * speed).round() as u32,
            channels: renderer.channels(),
        };
        let source: Arc<dyn AudioSource> = Arc::clone(renderer) as Arc<dyn AudioSource>;
        let mut output = self.output.lock();
        let granted = output.open(spec, source)?;
        if granted != spec {
            tracing::warn!(requested = ?spec, ?granted, "audio device changed the output format");
        }
        tracing::debug!(device = %output.device_name(), sample_rate = granted.sample_rate, "audio device open");
        Ok(())
    }

    fn spawn_workers(&self, session: &Arc<Session<B>>) -> Result<(), PlaybackError> {
        let mut workers = Vec::with_capacity(3);
        let spawn_error = |e: std::io::Error| PlaybackError::Thread(e.to_string());

        let demux_session = Arc::clone(session);
        workers.push(Worker::spawn("demux", move || demux::run(&demux_session)).map_err(spawn_error)?);

        if session.video.is_some() {
            let s = Arc::clone(session);
            let worker = Worker::spawn("video-decode", move || {
                if let Some(pipe) = &s.video {
                    decode::run(pipe, &s.epoch, &s.clock);
                }
            })
            .map_err(spawn_error)?;
            workers.push(worker);
        }
        if session.audio.is_some() {
            let s = Arc::clone(session);
            let worker = Worker::spawn("audio-decode", move || {
                if let Some(pipe) = &s.audio {
                    decode::run(pipe, &s.epoch, &s.clock);
                }
            })
            .map_err(spawn_error)?;
            workers.push(worker);
        }

        session.workers.lock().extend(workers);
        Ok(())
    }

    fn set_device_paused(&self, paused: bool) {
        let mut output = self.output.lock();
        if output.is_open() {
            if let Err(e) = output.set_paused(paused) {
                tracing::warn!(error = %e, paused, "failed to pause audio device");
            }
        }
    }

    pub fn pause(&self) -> Result<(), PlaybackError> {
        let _control = self.control.lock();
        self.session()?;
        if !self.clock.transition(PlaybackPhase::Playing, PlaybackPhase::Paused) {
            return Err(self.invalid("pause"));
        }
        self.set_device_paused(true);
        tracing::info!(at = %format_time(self.clock.played_ms()), "paused");
        Ok(())
    }

    pub fn unpause(&self) -> Result<(), PlaybackError> {
        let _control = self.control.lock();
        self.session()?;
        if !self.clock.transition(PlaybackPhase::Paused, PlaybackPhase::Playing) {
            return Err(self.invalid("unpause"));
        }
        self.set_device_paused(false);
        tracing::info!(at = %format_time(self.clock.played_ms()), "resumed");
        Ok(())
    }

    /// Pause when playing, resume when paused. Anything else is ignored with
    /// a warning.
    pub fn toggle_pause(&self) {
        let result = match self.clock.phase() {
            PlaybackPhase::Playing => self.pause(),
            PlaybackPhase::Paused => self.unpause(),
            phase => {
                tracing::warn!(%phase, "toggle pause ignored");
                return;
            }
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "toggle pause ignored");
        }
    }

    /// Jump to `ms`, clamped to the media. On return one fresh frame per
    /// stream at or after the target is queued. Returns the target used.
    pub fn seek_to(&self, ms: Millis) -> Result<Millis, PlaybackError> {
        let _control = self.control.lock();
        let session = self.session()?;
        if self.clock.phase() == PlaybackPhase::Exiting {
            return Err(self.invalid("seek"));
        }
        let duration = session.info.duration_ms;
        let target = if duration > 0 { ms.clamp(0, duration) } else { ms.max(0) };

        let previous = self.clock.set_phase(PlaybackPhase::Seeking);
        let result = self.seek_locked(&session, target);
        self.clock.set_phase(previous);
        match &result {
            Ok(()) => tracing::info!(to = %format_time(target), "seek complete"),
            Err(e) => tracing::error!(to = %format_time(target), error = %e, "seek failed"),
        }
        result.map(|()| target)
    }

    // Lock order: demuxer, video decoder, audio decoder.
    fn seek_locked(&self, session: &Session<B>, target: Millis) -> Result<(), PlaybackError> {
        let mut demuxer = session.demuxer.lock();
        session.demux_control.set(WorkerStatus::Idle);

        let video = session.video.as_ref();
        let audio = session.audio.as_ref();
        let mut video_decoder = video.map(|p| p.decoder.lock());
        let mut audio_decoder = audio.map(|p| p.decoder.lock());

        let epoch = session.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        session.readahead.lock().clear();
        if let Some(pipe) = video {
            pipe.clear();
        }
        if let Some(pipe) = audio {
            pipe.clear();
        }
        if let Some(renderer) = &session.renderer {
            renderer.reset();
        }
        session.video_finished.store(false, Ordering::Release);

        let repositioned = match (audio, audio_decoder.as_mut()) {
            (Some(pipe), Some(decoder)) => reposition(&mut *demuxer, pipe, &mut **decoder, target),
            _ => Ok(()),
        }
        .and_then(|()| match (video, video_decoder.as_mut()) {
            (Some(pipe), Some(decoder)) => reposition(&mut *demuxer, pipe, &mut **decoder, target),
            _ => Ok(()),
        });
        if let Err(e) = repositioned {
            // carry on from wherever the demuxer is
            session.demux_control.set(WorkerStatus::Working);
            return Err(e.into());
        }

        self.clock.rebase_ms(target);

        // a stream that ends before the target has nothing to prime
        let reaches = |duration_ms: Option<Millis>| duration_ms.is_some_and(|d| d <= 0 || target < d);
        let mut video_pending = video.is_some() && reaches(session.info.video.as_ref().map(|v| v.stream.duration_ms));
        let mut audio_pending = audio.is_some() && reaches(session.info.audio.as_ref().map(|a| a.stream.duration_ms));
        let mut readahead = session.readahead.lock();
        let mut reached_eof = false;
        while video_pending || audio_pending {
            let packet = match demuxer.read_packet() {
                Ok(Some(packet)) => packet,
                Ok(None) => {
                    reached_eof = true;
                    break;
                }
                Err(e) => fatal("demuxer read failed while seeking", &e),
            };
            let index = packet.stream_index();
            match (video, video_decoder.as_mut()) {
                (Some(pipe), Some(decoder)) if video_pending && pipe.stream_index == index => {
                    let generation = pipe.timeline.generation();
                    video_pending = !settle(prime_with(pipe, &mut **decoder, packet, target, generation), &mut readahead);
                    continue;
                }
                _ => {}
            }
            match (audio, audio_decoder.as_mut()) {
                (Some(pipe), Some(decoder)) if audio_pending && pipe.stream_index == index => {
                    let generation = pipe.timeline.generation();
                    audio_pending = !settle(prime_with(pipe, &mut **decoder, packet, target, generation), &mut readahead);
                    continue;
                }
                _ => {}
            }
            readahead.push_back(Readahead::Packet(packet));
        }
        if reached_eof {
            readahead.push_back(Readahead::EndOfFile);
        }
        tracing::debug!(epoch, readahead = readahead.len(), reached_eof, "seek primed");
        drop(readahead);
        drop(audio_decoder);
        drop(video_decoder);
        drop(demuxer);
        // the demux worker replays the readahead before touching the file
        session.demux_control.set(WorkerStatus::Working);
        Ok(())
    }

    /// Seek `seek_step_ms` ahead.
    pub fn seek_forward(&self) -> Result<Millis, PlaybackError> {
        self.seek_to(self.played_ms().saturating_add(self.config.seek_step_ms))
    }

    /// Seek `seek_step_ms` back.
    pub fn seek_backward(&self) -> Result<Millis, PlaybackError> {
        self.seek_to(self.played_ms().saturating_sub(self.config.seek_step_ms))
    }

    /// Move to the next faster entry of `speed_steps`.
    pub fn speed_up(&self) -> Result<f64, PlaybackError> {
        let current = self.clock.speed();
        let steps = &self.config.speed_steps;
        let next = steps
            .iter()
            .copied()
            .find(|s| *s > current + f64::EPSILON)
            .or_else(|| steps.last().copied())
            .unwrap_or(current);
        self.set_speed(next.max(current))
    }

    /// Move to the next slower entry of `speed_steps`.
    pub fn speed_down(&self) -> Result<f64, PlaybackError> {
        let current = self.clock.speed();
        let steps = &self.config.speed_steps;
        let next = steps
            .iter()
            .rev()
            .copied()
            .find(|s| *s < current - f64::EPSILON)
            .or_else(|| steps.first().copied())
            .unwrap_or(current);
        self.set_speed(next.min(current))
    }

    /// Change the playback rate, clamped to `[min_speed, max_speed]`. The
    /// audio device is reopened at `sample_rate * speed`; if it refuses, it
    /// goes back to the previous rate and the speed is left unchanged.
    pub fn set_speed(&self, speed: f64) -> Result<f64, PlaybackError> {
        let _control = self.control.lock();
        let session = self.session()?;
        let speed = speed.clamp(self.config.min_speed, self.config.max_speed);
        let previous = self.clock.speed();
        if (previous - speed).abs() < f64::EPSILON {
            return Ok(speed);
        }

        if let Some(renderer) = &session.renderer {
            if self.output.lock().is_open() {
                let paused = self.clock.phase() == PlaybackPhase::Paused;
                self.set_device_paused(true);
                if let Err(e) = self.open_device(renderer, speed) {
                    tracing::warn!(error = %e, speed, "speed change refused, restoring previous rate");
                    self.open_device(renderer, previous)?;
                    if paused {
                        self.set_device_paused(true);
                    }
                    return Err(e);
                }
                if paused {
                    self.set_device_paused(true);
                }
            }
        }
        self.clock.set_speed(speed);
        tracing::info!(from = previous, to = speed, "speed changed");
        Ok(speed)
    }

    /// Media time played so far.
    pub fn played_ms(&self) -> Millis {
        self.clock.played_ms()
    }

    /// Video frame size, `(0, 0)` when nothing with video is open.
    pub fn dimensions(&self) -> (u32, u32) {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.info.dimensions())
            .unwrap_or((0, 0))
    }

    pub fn media_info(&self) -> Option<MediaInfo> {
        self.session.lock().as_ref().map(|s| s.info.clone())
    }

    pub fn duration_ms(&self) -> Millis {
        self.session.lock().as_ref().map_or(0, |s| s.info.duration_ms)
    }

    pub fn phase(&self) -> PlaybackPhase {
        self.clock.phase()
    }

    pub fn speed(&self) -> f64 {
        self.clock.speed()
    }

    /// Every stream has played out its last frame.
    pub fn is_finished(&self) -> bool {
        self.session.lock().as_ref().is_some_and(|s| s.is_finished())
    }

    pub fn queue_depths(&self) -> QueueDepths {
        let Some(session) = self.session.lock().clone() else {
            return QueueDepths::default();
        };
        let mut depths = QueueDepths::default();
        if let Some(video) = &session.video {
            depths.video_packets = video.packets.len();
            depths.video_frames = video.timeline.len();
        }
        if let Some(audio) = &session.audio {
            depths.audio_packets = audio.packets.len();
            depths.audio_frames = audio.timeline.len();
        }
        depths
    }

    /// Pop the video frame due at the current played time, if any.
    pub fn try_fetch_due_video_frame(&self) -> Option<FetchedFrame<B::VideoFrame>> {
        self.try_fetch_due_video_frame_at(self.clock.played_ms())
    }

    /// Pop the front video frame if it is due at `now_ms`. A frame that is
    /// not yet due stays queued.
    pub fn try_fetch_due_video_frame_at(&self, now_ms: Millis) -> Option<FetchedFrame<B::VideoFrame>> {
        if matches!(self.clock.phase(), PlaybackPhase::Seeking | PlaybackPhase::Exiting) {
            return None;
        }
        let session = self.session.lock().clone()?;
        let video = session.video.as_ref()?;
        let entry = video.timeline.try_pop_if_due(now_ms)?;
        match entry.frame {
            Some(frame) => Some(FetchedFrame::Frame {
                frame,
                present_ms: entry.present_ms,
            }),
            None => {
                tracing::info!(at = %format_time(now_ms), "video stream finished");
                session.video_finished.store(true, Ordering::Release);
                Some(FetchedFrame::EndOfStream)
            }
        }
    }
}

impl<B: MediaBackend> Drop for Player<B> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Seek the demuxer on `pipe`'s stream and flush its decoder.
fn reposition<X: Demuxer, D: StreamDecoder>(
    demuxer: &mut X,
    pipe: &StreamPipeline<D>,
    decoder: &mut D,
    target: Millis,
) -> Result<(), MediaError> {
    demuxer.seek(pipe.stream_index, ms_to_pts(target, pipe.time_base))?;
    decoder.flush();
    Ok(())
}

/// `true` once the stream has its frame.
fn settle<P>(prime: Prime<P>, readahead: &mut VecDeque<Readahead<P>>) -> bool {
    match prime {
        Prime::Primed => true,
        Prime::NeedMore => false,
        Prime::Leftover(packet) => {
            readahead.push_back(Readahead::Packet(packet));
            true
        }
    }
}
