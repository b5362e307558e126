//! Headless player: plays a file on the default sound card and logs the
//! video frames as they come due.
//!
//! Usage: `cadence <file>`. Settings are read from the TOML file named by
//! `CADENCE_CONFIG`, if set; log filtering follows `RUST_LOG`.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use cadence::audio::CpalOutput;
use cadence::config::{self, PlayerConfig};
use cadence::media::FfmpegBackend;
use cadence::time::format_time;
use cadence::{FetchedFrame, PlaybackError, Player};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("cadence=info")),
        )
        .init();

    let Some(path) = std::env::args().nth(1).map(PathBuf::from) else {
        eprintln!("usage: cadence <file>");
        std::process::exit(2);
    };

    if let Err(e) = run(&path) {
        tracing::error!(error = %e, "playback failed");
        std::process::exit(1);
    }
}

fn load_config() -> Result<PlayerConfig, PlaybackError> {
    match std::env::var_os("CADENCE_CONFIG") {
        Some(path) => Ok(config::load_from_path(PathBuf::from(path).as_path())?),
        None => Ok(PlayerConfig::default()),
    }
}

fn run(path: &Path) -> Result<(), PlaybackError> {
    let config = load_config()?;
    let backoff = Duration::from_millis(config.idle_backoff_ms.max(1));
    let backend = FfmpegBackend::new();
    let output = CpalOutput::new()?;
    let player = Player::new(backend, Box::new(output), config)?;

    let info = player.open(path)?;
    tracing::info!(
        duration = %format_time(info.duration_ms),
        video = info.has_video(),
        audio = info.has_audio(),
        "opened {}",
        path.display()
    );
    player.start_playback()?;

    let mut frames = 0u64;
    let mut last_report = 0;
    while !player.is_finished() {
        match player.try_fetch_due_video_frame() {
            Some(FetchedFrame::Frame { present_ms, .. }) => {
                frames += 1;
                tracing::trace!(present_ms, "frame due");
            }
            Some(FetchedFrame::EndOfStream) => tracing::debug!("last video frame shown"),
            None => thread::sleep(backoff),
        }
        let played = player.played_ms();
        if played - last_report >= 1_000 {
            last_report = played;
            tracing::info!(at = %format_time(played), frames, depths = ?player.queue_depths(), "progress");
        }
    }

    tracing::info!(frames, at = %format_time(player.played_ms()), "finished");
    player.close();
    Ok(())
}
