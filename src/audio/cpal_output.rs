//! Sound card output through cpal.
//!
//! `cpal::Stream` is not `Send` on every platform, so the stream lives on a
//! dedicated device thread and [`CpalOutput`] drives it with commands over a
//! crossbeam channel. The data callback only ever calls
//! [`AudioSource::fill`].

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam::channel::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;

use super::output::{AudioOutput, AudioOutputError, AudioSource, OutputSpec};

impl From<cpal::BuildStreamError> for AudioOutputError {
    fn from(err: cpal::BuildStreamError) -> Self {
        AudioOutputError::Stream(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for AudioOutputError {
    fn from(err: cpal::PlayStreamError) -> Self {
        AudioOutputError::Stream(err.to_string())
    }
}

impl From<cpal::PauseStreamError> for AudioOutputError {
    fn from(err: cpal::PauseStreamError) -> Self {
        AudioOutputError::Stream(err.to_string())
    }
}

impl From<cpal::DevicesError> for AudioOutputError {
    fn from(err: cpal::DevicesError) -> Self {
        AudioOutputError::Stream(err.to_string())
    }
}

/// Command sent to the device thread
enum DeviceCommand {
    Open {
        spec: OutputSpec,
        source: Arc<dyn AudioSource>,
        reply: Sender<Result<OutputSpec, AudioOutputError>>,
    },
    Pause {
        paused: bool,
        reply: Sender<Result<(), AudioOutputError>>,
    },
    Close {
        reply: Sender<()>,
    },
}

/// Names of the host's output devices.
pub fn list_output_devices() -> Result<Vec<String>, AudioOutputError> {
    let host = cpal::default_host();
    let names = host
        .output_devices()?
        .filter_map(|device| device.name().ok())
        .collect();
    Ok(names)
}

fn find_device(name: Option<&str>) -> Result<cpal::Device, AudioOutputError> {
    let host = cpal::default_host();
    match name {
        None => host.default_output_device().ok_or(AudioOutputError::NoDevice),
        Some(wanted) => host
            .output_devices()?
            .find(|device| device.name().map(|n| n == wanted).unwrap_or(false))
            .ok_or(AudioOutputError::NoDevice),
    }
}

fn build_stream(
    device: &cpal::Device,
    spec: OutputSpec,
    source: Arc<dyn AudioSource>,
) -> Result<cpal::Stream, AudioOutputError> {
    let config = cpal::StreamConfig {
        channels: spec.channels,
        sample_rate: cpal::SampleRate(spec.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    let stream = device.build_output_stream(
        &config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| source.fill(data),
        |err| tracing::error!(error = %err, "audio stream error"),
        None,
    )?;
    stream.play()?;
    Ok(stream)
}

fn device_thread(device: cpal::Device, commands: Receiver<DeviceCommand>) {
    let mut stream: Option<cpal::Stream> = None;
    // Disconnection means the owning CpalOutput was dropped.
    while let Ok(command) = commands.recv() {
        match command {
            DeviceCommand::Open { spec, source, reply } => {
                stream = None;
                let result = build_stream(&device, spec, source).map(|s| {
                    stream = Some(s);
                    spec
                });
                let _ = reply.send(result);
            }
            DeviceCommand::Pause { paused, reply } => {
                let result = match &stream {
                    Some(s) if paused => s.pause().map_err(AudioOutputError::from),
                    Some(s) => s.play().map_err(AudioOutputError::from),
                    None => Err(AudioOutputError::NotOpen),
                };
                let _ = reply.send(result);
            }
            DeviceCommand::Close { reply } => {
                stream = None;
                let _ = reply.send(());
            }
        }
    }
    tracing::debug!("audio device thread exiting");
}

/// Pull-mode output on a real sound card.
pub struct CpalOutput {
    commands: Option<Sender<DeviceCommand>>,
    thread: Option<thread::JoinHandle<()>>,
    device_name: String,
    open: bool,
}

impl CpalOutput {
    /// Use the host's default output device.
    pub fn new() -> Result<Self, AudioOutputError> {
        Self::with_device(None)
    }

    /// Use the output device called `name`, or the default one.
    pub fn with_device(name: Option<&str>) -> Result<Self, AudioOutputError> {
        let device = find_device(name)?;
        let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());
        let (tx, rx) = channel::unbounded();
        let thread = thread::Builder::new()
            .name("audio-device".to_string())
            .spawn(move || device_thread(device, rx))
            .map_err(|e| AudioOutputError::DeviceThread(e.to_string()))?;
        tracing::info!(device = %device_name, "audio output ready");
        Ok(Self {
            commands: Some(tx),
            thread: Some(thread),
            device_name,
            open: false,
        })
    }

    fn request<T>(&self, make: impl FnOnce(Sender<T>) -> DeviceCommand) -> Result<T, AudioOutputError> {
        let commands = self
            .commands
            .as_ref()
            .ok_or_else(|| AudioOutputError::DeviceThread("device thread stopped".to_string()))?;
        let (reply_tx, reply_rx) = channel::bounded(1);
        commands
            .send(make(reply_tx))
            .map_err(|_| AudioOutputError::DeviceThread("device thread stopped".to_string()))?;
        reply_rx
            .recv()
            .map_err(|_| AudioOutputError::DeviceThread("device thread did not reply".to_string()))
    }
}

impl AudioOutput for CpalOutput {
    fn open(&mut self, spec: OutputSpec, source: Arc<dyn AudioSource>) -> Result<OutputSpec, AudioOutputError> {
        let granted = self.request(|reply| DeviceCommand::Open { spec, source, reply })??;
        self.open = true;
        tracing::debug!(
            device = %self.device_name,
            sample_rate = granted.sample_rate,
            channels = granted.channels,
            "audio stream opened"
        );
        Ok(granted)
    }

    fn set_paused(&mut self, paused: bool) -> Result<(), AudioOutputError> {
        self.request(|reply| DeviceCommand::Pause { paused, reply })?
    }

    fn close(&mut self) {
        if !self.open {
            return;
        }
        if let Err(e) = self.request(|reply| DeviceCommand::Close { reply }) {
            tracing::warn!(error = %e, "failed to close audio stream");
        }
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn device_name(&self) -> String {
        self.device_name.clone()
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.close();
        // dropping the sender ends the device thread's loop
        self.commands.take();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}
