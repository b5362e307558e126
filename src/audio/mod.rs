pub mod output;

#[cfg(feature = "cpal")]
pub mod cpal_output;

pub use output::{AudioOutput, AudioOutputError, AudioSource, OutputSpec, VirtualOutput};

#[cfg(feature = "cpal")]
pub use cpal_output::{list_output_devices, CpalOutput};
