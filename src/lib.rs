//! Cadence: demux/decode pipeline and audio-clocked A/V synchronization for a
//! desktop media player.
//!
//! A [`Player`] opens a file through a [`media::MediaBackend`], runs one demux
//! thread and one decode thread per stream, and presents audio through an
//! [`audio::AudioOutput`] whose consumed samples are the playback clock.
//! Video is pulled by the caller with [`Player::try_fetch_due_video_frame`].

pub mod audio;
pub mod config;
pub mod media;
pub mod playback;
pub mod queue;
pub mod time;

pub use config::PlayerConfig;
pub use playback::{FetchedFrame, PlaybackError, PlaybackPhase, Player};
