//! The playback pipeline: demux and decode workers, the audio clock and the
//! [`Player`] that drives them.

pub mod audio;
pub mod decode;
pub mod demux;
pub mod engine;
pub mod session;
pub mod state;
pub mod sync;
pub mod worker;

pub use audio::AudioRenderer;
pub use engine::{FetchedFrame, PlaybackError, Player, QueueDepths};
pub use state::{PlaybackPhase, WorkerStatus};
pub use sync::{audio_sync_to, ClockSource, ClockState, SyncCorrection};

/// Log and terminate. Used where the pipeline state can no longer be trusted,
/// such as a demuxer read failing for a reason other than end of file.
pub(crate) fn fatal(context: &str, error: &dyn std::error::Error) -> ! {
    tracing::error!(error = %error, "{}; terminating", context);
    std::process::exit(1)
}
