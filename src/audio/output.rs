//! Audio output device abstraction.
//!
//! Devices are pull based: once opened, the device calls
//! [`AudioSource::fill`] from its own thread whenever it needs samples.
//! Every sample handed out by `fill` is a sample the device will play, which
//! is what makes the sample count a usable clock.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Error type for audio output devices
#[derive(Debug)]
pub enum AudioOutputError {
    NoDevice,
    UnsupportedConfig(String),
    Stream(String),
    NotOpen,
    DeviceThread(String),
}

impl fmt::Display for AudioOutputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AudioOutputError::NoDevice => write!(f, "No audio device available"),
            AudioOutputError::UnsupportedConfig(e) => write!(f, "Unsupported output config: {}", e),
            AudioOutputError::Stream(e) => write!(f, "Audio stream error: {}", e),
            AudioOutputError::NotOpen => write!(f, "Audio device is not open"),
            AudioOutputError::DeviceThread(e) => write!(f, "Audio device thread error: {}", e),
        }
    }
}

impl std::error::Error for AudioOutputError {}

/// Sample format requested from / granted by a device. Samples are always
/// interleaved `f32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputSpec {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Producer side of a pull-mode device.
pub trait AudioSource: Send + Sync + 'static {
    /// Fill all of `out` with interleaved samples. Must not block.
    fn fill(&self, out: &mut [f32]);
}

/// An audio device that pulls from an [`AudioSource`].
pub trait AudioOutput: Send {
    /// Open the device (closing any previous stream) and start pulling from
    /// `source`. Returns the format actually in use.
    fn open(&mut self, spec: OutputSpec, source: Arc<dyn AudioSource>) -> Result<OutputSpec, AudioOutputError>;

    fn set_paused(&mut self, paused: bool) -> Result<(), AudioOutputError>;

    /// Stop pulling and release the device. Idempotent.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    fn device_name(&self) -> String;
}

#[derive(Default)]
struct VirtualState {
    source: Option<Arc<dyn AudioSource>>,
    spec: Option<OutputSpec>,
    paused: bool,
    opened: Vec<OutputSpec>,
    refused_rates: Vec<u32>,
}

/// Device without hardware: samples are pulled explicitly with
/// [`VirtualOutput::pull`]. Clones share the same device, so a test can keep
/// one handle while the player owns another.
#[derive(Clone, Default)]
pub struct VirtualOutput {
    state: Arc<Mutex<VirtualState>>,
}

impl VirtualOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pull `frames` sample frames from the source as the hardware would.
    /// `None` while the device is closed or paused.
    pub fn pull(&self, frames: usize) -> Option<Vec<f32>> {
        let (source, spec) = {
            let state = self.state.lock();
            if state.paused {
                return None;
            }
            (state.source.clone()?, state.spec?)
        };
        let mut buffer = vec![0.0f32; frames * spec.channels as usize];
        source.fill(&mut buffer);
        Some(buffer)
    }

    /// Pull `ms` of wall time worth of samples at the device's rate.
    pub fn pull_ms(&self, ms: u64) -> Option<Vec<f32>> {
        let rate = self.state.lock().spec?.sample_rate;
        self.pull((ms * rate as u64 / 1_000) as usize)
    }

    /// Spec of the currently open stream.
    pub fn spec(&self) -> Option<OutputSpec> {
        self.state.lock().spec
    }

    /// Every format the device has been opened with, oldest first.
    pub fn open_history(&self) -> Vec<OutputSpec> {
        self.state.lock().opened.clone()
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    /// Make later opens at `rate` fail, as a card without that rate would.
    pub fn refuse_rate(&self, rate: u32) {
        self.state.lock().refused_rates.push(rate);
    }
}

impl AudioOutput for VirtualOutput {
    fn open(&mut self, spec: OutputSpec, source: Arc<dyn AudioSource>) -> Result<OutputSpec, AudioOutputError> {
        if spec.sample_rate == 0 || spec.channels == 0 {
            return Err(AudioOutputError::UnsupportedConfig(format!("{:?}", spec)));
        }
        let mut state = self.state.lock();
        if state.refused_rates.contains(&spec.sample_rate) {
            state.source = None;
            state.spec = None;
            return Err(AudioOutputError::UnsupportedConfig(format!("{} Hz", spec.sample_rate)));
        }
        state.source = Some(source);
        state.spec = Some(spec);
        state.paused = false;
        state.opened.push(spec);
        Ok(spec)
    }

    fn set_paused(&mut self, paused: bool) -> Result<(), AudioOutputError> {
        let mut state = self.state.lock();
        if state.source.is_none() {
            return Err(AudioOutputError::NotOpen);
        }
        state.paused = paused;
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.state.lock();
        state.source = None;
        state.spec = None;
        state.paused = false;
    }

    fn is_open(&self) -> bool {
        self.state.lock().source.is_some()
    }

    fn device_name(&self) -> String {
        "virtual".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize);

    impl AudioSource for Counting {
        fn fill(&self, out: &mut [f32]) {
            self.0.fetch_add(out.len(), Ordering::SeqCst);
            out.fill(0.5);
        }
    }

    #[test]
    fn test_virtual_output_pulls_from_source() {
        let source = Arc::new(Counting(AtomicUsize::new(0)));
        let mut output = VirtualOutput::new();
        let handle = output.clone();
        assert!(handle.pull(16).is_none());

        let spec = OutputSpec {
            sample_rate: 48_000,
            channels: 2,
        };
        output.open(spec, source.clone()).unwrap();
        let samples = handle.pull_ms(10).unwrap();
        assert_eq!(samples.len(), 960);
        assert!(samples.iter().all(|s| *s == 0.5));
        assert_eq!(source.0.load(Ordering::SeqCst), 960);
    }

    #[test]
    fn test_virtual_output_pause_and_close() {
        let mut output = VirtualOutput::new();
        assert!(output.set_paused(true).is_err());
        let spec = OutputSpec {
            sample_rate: 44_100,
            channels: 1,
        };
        output.open(spec, Arc::new(Counting(AtomicUsize::new(0)))).unwrap();
        output.set_paused(true).unwrap();
        assert!(output.pull(8).is_none());
        output.set_paused(false).unwrap();
        assert!(output.pull(8).is_some());
        output.close();
        assert!(!output.is_open());
        assert!(output.pull(8).is_none());
        assert_eq!(output.open_history(), vec![spec]);
    }

    #[test]
    fn test_rejects_empty_spec() {
        let mut output = VirtualOutput::new();
        let spec = OutputSpec {
            sample_rate: 0,
            channels: 2,
        };
        assert!(matches!(
            output.open(spec, Arc::new(Counting(AtomicUsize::new(0)))),
            Err(AudioOutputError::UnsupportedConfig(_))
        ));
    }

    #[test]
    fn test_refused_rate_leaves_device_closed() {
        let mut output = VirtualOutput::new();
        let source: Arc<dyn AudioSource> = Arc::new(Counting(AtomicUsize::new(0)));
        let stereo = |sample_rate| OutputSpec {
            sample_rate,
            channels: 2,
        };
        output.open(stereo(48_000), Arc::clone(&source)).unwrap();
        output.refuse_rate(96_000);
        assert!(matches!(
            output.open(stereo(96_000), Arc::clone(&source)),
            Err(AudioOutputError::UnsupportedConfig(_))
        ));
        assert!(!output.is_open());
        assert_eq!(output.open(stereo(44_100), source).unwrap().sample_rate, 44_100);
        assert_eq!(output.open_history().len(), 2);
    }
}
