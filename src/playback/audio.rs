//! Audio presentation: the device callback side of the audio stream.
//!
//! The output device pulls samples through [`AudioRenderer::fill`]. The
//! renderer takes the next non-late frame off the audio timeline, converts
//! it, nudges it towards the clock with [`audio_sync_to`] and hands it out.
//! Each chunk handed to the device advances the clock by exactly its sample
//! count; this is the only place the clock moves forward.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::state::PlaybackPhase;
use super::sync::{audio_sync_to, ClockState, SyncCorrection};
use crate::audio::AudioSource;
use crate::media::Resampler;
use crate::queue::FrameTimeline;
use crate::time::Millis;

struct RendererState<R> {
    resampler: R,
    pending: Vec<f32>,
    cursor: usize,
}

pub struct AudioRenderer<R: Resampler> {
    timeline: Arc<FrameTimeline<R::Frame>>,
    clock: Arc<ClockState>,
    state: Mutex<RendererState<R>>,
    sample_rate: u32,
    channels: u16,
    sync_threshold_ms: Millis,
    finished: AtomicBool,
}

impl<R: Resampler> AudioRenderer<R> {
    pub fn new(
        resampler: R,
        timeline: Arc<FrameTimeline<R::Frame>>,
        clock: Arc<ClockState>,
        sync_threshold_ms: Millis,
    ) -> Self {
        let sample_rate = resampler.output_rate();
        let channels = resampler.output_channels();
        Self {
            timeline,
            clock,
            state: Mutex::new(RendererState {
                resampler,
                pending: Vec::new(),
                cursor: 0,
            }),
            sample_rate,
            channels,
            sync_threshold_ms,
            finished: AtomicBool::new(false),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// The end-of-stream entry has been reached.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Forget buffered samples (seek). Waits for a callback in progress.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.pending.clear();
        state.cursor = 0;
        self.finished.store(false, Ordering::Release);
    }

    /// Load the next frame into `pending`. `false` when nothing is playable
    /// right now.
    fn refill(&self, state: &mut RendererState<R>) -> bool {
        if self.is_finished() {
            return false;
        }
        let played_ms = self.clock.played_ms();
        let (entry, dropped) = self.timeline.pop_fresh(played_ms);
        if dropped > 0 {
            tracing::debug!(dropped, played_ms, "late audio frames skipped");
        }
        let Some(entry) = entry else {
            return false;
        };
        let Some(frame) = entry.frame else {
            tracing::info!(played_ms, "audio stream finished");
            self.finished.store(true, Ordering::Release);
            return false;
        };

        state.pending.clear();
        state.cursor = 0;
        let RendererState { resampler, pending, .. } = state;
        if let Err(e) = resampler.resample(&frame, pending) {
            tracing::warn!(error = %e, present_ms = entry.present_ms, "dropping unconvertible audio frame");
            pending.clear();
            return true;
        }
        let correction = audio_sync_to(
            pending,
            entry.present_ms,
            played_ms,
            self.sample_rate,
            self.channels,
            self.sync_threshold_ms,
        );
        if correction != SyncCorrection::None {
            tracing::info!(?correction, present_ms = entry.present_ms, played_ms, "audio sync correction");
        }
        true
    }
}

impl<R: Resampler> AudioSource for AudioRenderer<R> {
    fn fill(&self, out: &mut [f32]) {
        if self.clock.phase() != PlaybackPhase::Playing {
            out.fill(0.0);
            return;
        }
        let channels = self.channels.max(1) as usize;
        let mut state = self.state.lock();
        let mut written = 0;
        while written < out.len() {
            if state.cursor >= state.pending.len() {
                if self.refill(&mut state) {
                    continue;
                }
                break;
            }
            let n = (out.len() - written).min(state.pending.len() - state.cursor);
            let start = state.cursor;
            out[written..written + n].copy_from_slice(&state.pending[start..start + n]);
            state.cursor += n;
            written += n;
            self.clock.advance(n / channels);
        }
        out[written..].fill(0.0);
        // past the end of the audio the clock keeps running on silence so
        // a longer video stream can finish
        if self.is_finished() && written < out.len() {
            self.clock.advance((out.len() - written) / channels);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::synthetic::{SyntheticBackend, SyntheticSpec, SAMPLE_VALUE};
    use crate::media::{DecodeStatus, Demuxer, MediaBackend, StreamDecoder};
    use crate::playback::sync::ClockSource;
    use crate::time::{pts_to_ms, TimeBase};
    use std::path::Path;

    fn renderer_with_frames(count: usize) -> (AudioRenderer<crate::media::synthetic::SyntheticResampler>, Arc<ClockState>, Arc<FrameTimeline<crate::media::synthetic::SyntheticAudioFrame>>) {
        let backend = SyntheticBackend::new(SyntheticSpec::audio_only());
        let mut opened = backend.open(Path::new("a.wav")).unwrap();
        let (mut decoder, resampler) = opened.audio.take().unwrap();
        let timeline = Arc::new(FrameTimeline::new("audio", 16));
        let generation = timeline.generation();
        for _ in 0..count {
            let packet = opened.demuxer.read_packet().unwrap().unwrap();
            decoder.send_packet(&packet).unwrap();
            if let DecodeStatus::Ready(frame) = decoder.receive_frame().unwrap() {
                let ms = pts_to_ms(crate::media::MediaFrame::pts(&frame), TimeBase::sample_rate(48_000));
                timeline.push_fresh(frame, ms, 0, generation);
            }
        }
        let clock = Arc::new(ClockState::new());
        clock.configure(ClockSource::AudioSamples, 48_000);
        let renderer = AudioRenderer::new(resampler, Arc::clone(&timeline), Arc::clone(&clock), 100);
        (renderer, clock, timeline)
    }

    #[test]
    fn test_silence_unless_playing() {
        let (renderer, clock, timeline) = renderer_with_frames(2);
        let mut out = vec![1.0; 256];
        renderer.fill(&mut out);
        assert!(out.iter().all(|s| *s == 0.0));
        assert_eq!(clock.sample_count(), 0);
        assert_eq!(timeline.len(), 2);
    }

    #[test]
    fn test_fill_advances_clock_by_samples_handed_out() {
        let (renderer, clock, _timeline) = renderer_with_frames(4);
        clock.set_phase(PlaybackPhase::Playing);
        // 1536 sample frames of stereo
        let mut out = vec![0.0; 3_072];
        renderer.fill(&mut out);
        assert!(out.iter().all(|s| *s == SAMPLE_VALUE));
        assert_eq!(clock.sample_count(), 1_536);
        renderer.fill(&mut out);
        assert_eq!(clock.sample_count(), 3_072);
    }

    #[test]
    fn test_underrun_does_not_advance_clock() {
        let (renderer, clock, _timeline) = renderer_with_frames(1);
        clock.set_phase(PlaybackPhase::Playing);
        let mut out = vec![0.0; 4_096];
        renderer.fill(&mut out);
        assert_eq!(clock.sample_count(), 1_024);
        assert!(out[2_048..].iter().all(|s| *s == 0.0));
        assert!(!renderer.is_finished());
    }

    #[test]
    fn test_end_of_stream_marks_finished_and_keeps_clock_running() {
        let (renderer, clock, timeline) = renderer_with_frames(1);
        timeline.push_end_of_stream(timeline.generation());
        clock.set_phase(PlaybackPhase::Playing);
        let mut out = vec![0.0; 4_096];
        renderer.fill(&mut out);
        assert!(renderer.is_finished());
        assert_eq!(clock.sample_count(), 2_048);
        renderer.reset();
        assert!(!renderer.is_finished());
    }
}
