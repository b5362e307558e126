//! Playback clock and audio drift correction.
//!
//! With an audio stream the clock is the number of samples the output device
//! has consumed: `played_ms = sample_count * 1000 / sample_rate`. Only the
//! audio callback advances it, and only while playing. Video is presented by
//! comparing frame times against this value.
//!
//! Media without audio has nothing to count, so the clock falls back to a
//! monotonic `Instant` scaled by the playback speed.

use parking_lot::Mutex;
use std::time::Instant;

use super::state::PlaybackPhase;
use crate::time::{ms_to_samples, samples_to_ms, Millis};

/// What drives the clock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockSource {
    /// Samples consumed by the audio device
    AudioSamples,
    /// Wall time since the last anchor, for media without audio
    Monotonic,
}

#[derive(Debug)]
struct ClockInner {
    phase: PlaybackPhase,
    sample_count: i64,
    sample_rate: u32,
    source: ClockSource,
    speed: f64,
    /// Monotonic mode: media time at `anchor`
    base_ms: Millis,
    anchor: Option<Instant>,
}

impl ClockInner {
    fn monotonic_ms(&self, now: Instant) -> Millis {
        match self.anchor {
            Some(anchor) if self.phase == PlaybackPhase::Playing => {
                let elapsed = now.saturating_duration_since(anchor).as_secs_f64() * 1_000.0;
                self.base_ms + (elapsed * self.speed) as Millis
            }
            _ => self.base_ms,
        }
    }

    fn fold(&mut self, now: Instant) {
        if self.source == ClockSource::Monotonic {
            self.base_ms = self.monotonic_ms(now);
            self.anchor = (self.phase == PlaybackPhase::Playing).then_some(now);
        }
    }
}

/// Shared playback phase and clock. One per player.
#[derive(Debug)]
pub struct ClockState {
    inner: Mutex<ClockInner>,
}

impl ClockState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ClockInner {
                phase: PlaybackPhase::Idle,
                sample_count: 0,
                sample_rate: 0,
                source: ClockSource::AudioSamples,
                speed: 1.0,
                base_ms: 0,
                anchor: None,
            }),
        }
    }

    /// Set the clock source for a newly opened file and zero the clock.
    pub fn configure(&self, source: ClockSource, sample_rate: u32) {
        let mut inner = self.inner.lock();
        inner.source = source;
        inner.sample_rate = sample_rate;
        inner.sample_count = 0;
        inner.base_ms = 0;
        inner.anchor = None;
    }

    /// Back to `Idle` at time zero, normal speed.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.phase = PlaybackPhase::Idle;
        inner.sample_count = 0;
        inner.base_ms = 0;
        inner.anchor = None;
        inner.speed = 1.0;
    }

    pub fn phase(&self) -> PlaybackPhase {
        self.inner.lock().phase
    }

    /// Switch phase, returning the previous one.
    pub fn set_phase(&self, phase: PlaybackPhase) -> PlaybackPhase {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let previous = inner.phase;
        if previous == phase {
            return previous;
        }
        // fold elapsed wall time under the old phase, then re-anchor
        inner.fold(now);
        inner.phase = phase;
        inner.fold(now);
        previous
    }

    /// Move `from` to `to` only if the phase is currently `from`.
    pub fn transition(&self, from: PlaybackPhase, to: PlaybackPhase) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if inner.phase != from {
            return false;
        }
        inner.fold(now);
        inner.phase = to;
        inner.fold(now);
        true
    }

    /// Media time that has been played out.
    pub fn played_ms(&self) -> Millis {
        let inner = self.inner.lock();
        match inner.source {
            ClockSource::AudioSamples => samples_to_ms(inner.sample_count, inner.sample_rate),
            ClockSource::Monotonic => inner.monotonic_ms(Instant::now()),
        }
    }

    /// Count `frames` sample frames as played. Ignored unless playing, so a
    /// callback racing a pause or seek cannot move the clock.
    pub fn advance(&self, frames: usize) -> bool {
        let mut inner = self.inner.lock();
        if inner.phase != PlaybackPhase::Playing || inner.source != ClockSource::AudioSamples {
            return false;
        }
        inner.sample_count += frames as i64;
        true
    }

    /// Jump the clock to `ms` (seek).
    pub fn rebase_ms(&self, ms: Millis) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.sample_count = ms_to_samples(ms, inner.sample_rate);
        inner.base_ms = ms;
        inner.anchor = (inner.phase == PlaybackPhase::Playing).then_some(now);
    }

    pub fn set_speed(&self, speed: f64) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.fold(now);
        inner.speed = speed;
    }

    pub fn speed(&self) -> f64 {
        self.inner.lock().speed
    }

    pub fn source(&self) -> ClockSource {
        self.inner.lock().source
    }

    pub fn sample_rate(&self) -> u32 {
        self.inner.lock().sample_rate
    }

    pub fn sample_count(&self) -> i64 {
        self.inner.lock().sample_count
    }
}

impl Default for ClockState {
    fn default() -> Self {
        Self::new()
    }
}

/// Correction applied by [`audio_sync_to`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncCorrection {
    None,
    /// Silence of this many ms was inserted before the frame
    PaddedSilence(Millis),
    /// This many ms were cut from the front of the frame
    Trimmed(Millis),
}

/// Nudge a freshly resampled frame towards the clock.
///
/// `pending` holds the frame's interleaved samples. If the frame starts more
/// than `threshold_ms` after `played_ms`, silence covering the gap is put in
/// front of it; if it starts more than `threshold_ms` before, the overdue
/// part is dropped from the front.
pub fn audio_sync_to(
    pending: &mut Vec<f32>,
    present_ms: Millis,
    played_ms: Millis,
    sample_rate: u32,
    channels: u16,
    threshold_ms: Millis,
) -> SyncCorrection {
    let diff = present_ms - played_ms;
    let channels = channels.max(1) as usize;
    if diff > threshold_ms {
        let pad = ms_to_samples(diff, sample_rate) as usize * channels;
        pending.splice(0..0, std::iter::repeat(0.0).take(pad));
        SyncCorrection::PaddedSilence(diff)
    } else if diff < -threshold_ms {
        let trim = (ms_to_samples(-diff, sample_rate) as usize * channels).min(pending.len());
        pending.drain(..trim);
        SyncCorrection::Trimmed(-diff)
    } else {
        SyncCorrection::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_played_ms_from_samples() {
        let clock = ClockState::new();
        clock.configure(ClockSource::AudioSamples, 48_000);
        clock.set_phase(PlaybackPhase::Playing);
        assert!(clock.advance(48_000));
        assert_eq!(clock.played_ms(), 1_000);
        clock.advance(24_000);
        assert_eq!(clock.played_ms(), 1_500);
    }

    #[test]
    fn test_advance_ignored_unless_playing() {
        let clock = ClockState::new();
        clock.configure(ClockSource::AudioSamples, 48_000);
        assert!(!clock.advance(480));
        clock.set_phase(PlaybackPhase::Paused);
        assert!(!clock.advance(480));
        clock.set_phase(PlaybackPhase::Seeking);
        assert!(!clock.advance(480));
        assert_eq!(clock.played_ms(), 0);
    }

    #[test]
    fn test_rebase() {
        let clock = ClockState::new();
        clock.configure(ClockSource::AudioSamples, 44_100);
        clock.rebase_ms(5_000);
        assert_eq!(clock.sample_count(), 220_500);
        assert_eq!(clock.played_ms(), 5_000);
    }

    #[test]
    fn test_transition_only_from_expected_phase() {
        let clock = ClockState::new();
        assert!(!clock.transition(PlaybackPhase::Playing, PlaybackPhase::Paused));
        clock.set_phase(PlaybackPhase::Playing);
        assert!(clock.transition(PlaybackPhase::Playing, PlaybackPhase::Paused));
        assert_eq!(clock.phase(), PlaybackPhase::Paused);
    }

    #[test]
    fn test_clock_monotonic_under_concurrent_readers() {
        let clock = Arc::new(ClockState::new());
        clock.configure(ClockSource::AudioSamples, 48_000);
        clock.set_phase(PlaybackPhase::Playing);

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let clock = Arc::clone(&clock);
                thread::spawn(move || {
                    let mut last = 0;
                    for _ in 0..10_000 {
                        let now = clock.played_ms();
                        assert!(now >= last, "clock went back from {} to {}", last, now);
                        last = now;
                    }
                })
            })
            .collect();
        for _ in 0..10_000 {
            clock.advance(256);
        }
        for reader in readers {
            reader.join().unwrap();
        }
    }

    #[test]
    fn test_monotonic_source_freezes_when_paused() {
        let clock = ClockState::new();
        clock.configure(ClockSource::Monotonic, 0);
        clock.set_phase(PlaybackPhase::Playing);
        thread::sleep(Duration::from_millis(30));
        clock.set_phase(PlaybackPhase::Paused);
        let frozen = clock.played_ms();
        assert!(frozen >= 30);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(clock.played_ms(), frozen);
        clock.set_phase(PlaybackPhase::Playing);
        thread::sleep(Duration::from_millis(10));
        assert!(clock.played_ms() >= frozen + 10);
    }

    #[test]
    fn test_monotonic_source_scales_with_speed() {
        let clock = ClockState::new();
        clock.configure(ClockSource::Monotonic, 0);
        clock.set_speed(2.0);
        clock.set_phase(PlaybackPhase::Playing);
        thread::sleep(Duration::from_millis(50));
        assert!(clock.played_ms() >= 100);
    }

    #[test]
    fn test_sync_pads_silence_when_frame_is_ahead() {
        let mut pending = vec![1.0; 20];
        let correction = audio_sync_to(&mut pending, 1_250, 1_000, 1_000, 2, 100);
        assert_eq!(correction, SyncCorrection::PaddedSilence(250));
        assert_eq!(pending.len(), 20 + 500);
        assert!(pending[..500].iter().all(|s| *s == 0.0));
        assert_eq!(pending[500], 1.0);
    }

    #[test]
    fn test_sync_trims_when_frame_is_behind() {
        let mut pending: Vec<f32> = (0..400).map(|i| i as f32).collect();
        let correction = audio_sync_to(&mut pending, 800, 1_000, 1_000, 1, 100);
        assert_eq!(correction, SyncCorrection::Trimmed(200));
        assert_eq!(pending.len(), 200);
        assert_eq!(pending[0], 200.0);
    }

    #[test]
    fn test_sync_within_threshold_is_untouched() {
        let mut pending = vec![1.0; 10];
        assert_eq!(audio_sync_to(&mut pending, 1_050, 1_000, 48_000, 2, 100), SyncCorrection::None);
        assert_eq!(pending.len(), 10);
    }
}
