//! Playback and worker state machines.

use std::fmt;

/// Phase of the whole player
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackPhase {
    /// Nothing playing: before `start_playback` or after `close`
    #[default]
    Idle,
    /// Clock advancing, frames being presented
    Playing,
    /// Clock frozen at the current position
    Paused,
    /// Pipeline being flushed and re-primed; returns to the previous phase
    Seeking,
    /// Shutting down; terminal for the session
    Exiting,
}

impl fmt::Display for PlaybackPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PlaybackPhase::Idle => "idle",
            PlaybackPhase::Playing => "playing",
            PlaybackPhase::Paused => "paused",
            PlaybackPhase::Seeking => "seeking",
            PlaybackPhase::Exiting => "exiting",
        };
        f.write_str(name)
    }
}

/// Status of one worker thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerStatus {
    /// Parked; must not touch shared decoder state
    #[default]
    Idle,
    Working,
    /// Terminal: the thread leaves its loop
    Exiting,
}
