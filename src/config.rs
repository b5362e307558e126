//! Player settings, loaded from and saved to a TOML file.
//!
//! Every field has a default, so a file only needs to name what it changes:
//!
//! ```toml
//! audio_sync_threshold_ms = 80
//! speed_steps = [0.5, 1.0, 2.0]
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::time::Millis;

pub const DEFAULT_PACKET_CHANNEL_CAPACITY: usize = 256;
pub const DEFAULT_VIDEO_TIMELINE_CAPACITY: usize = 200;
pub const DEFAULT_AUDIO_TIMELINE_CAPACITY: usize = 100;

/// How far an audio frame may drift from the clock before it is padded or
/// trimmed.
pub const DEFAULT_AUDIO_SYNC_THRESHOLD_MS: Millis = 100;

pub const DEFAULT_SPEED_STEPS: [f64; 4] = [0.5, 1.0, 1.5, 2.0];
pub const DEFAULT_MIN_SPEED: f64 = 0.25;
pub const DEFAULT_MAX_SPEED: f64 = 4.0;

pub const DEFAULT_SEEK_STEP_MS: Millis = 5_000;
pub const DEFAULT_IDLE_BACKOFF_MS: u64 = 10;

/// Error type for configuration files
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Packets buffered per stream between the demuxer and a decoder
    pub packet_channel_capacity: usize,
    /// Decoded pictures buffered ahead of the renderer
    pub video_timeline_capacity: usize,
    /// Decoded audio frames buffered ahead of the device
    pub audio_timeline_capacity: usize,
    pub audio_sync_threshold_ms: Millis,
    /// Speeds visited by `speed_up`/`speed_down`, ascending
    pub speed_steps: Vec<f64>,
    pub min_speed: f64,
    pub max_speed: f64,
    pub seek_step_ms: Millis,
    /// Polling interval of the headless shell
    pub idle_backoff_ms: u64,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            packet_channel_capacity: DEFAULT_PACKET_CHANNEL_CAPACITY,
            video_timeline_capacity: DEFAULT_VIDEO_TIMELINE_CAPACITY,
            audio_timeline_capacity: DEFAULT_AUDIO_TIMELINE_CAPACITY,
            audio_sync_threshold_ms: DEFAULT_AUDIO_SYNC_THRESHOLD_MS,
            speed_steps: DEFAULT_SPEED_STEPS.to_vec(),
            min_speed: DEFAULT_MIN_SPEED,
            max_speed: DEFAULT_MAX_SPEED,
            seek_step_ms: DEFAULT_SEEK_STEP_MS,
            idle_backoff_ms: DEFAULT_IDLE_BACKOFF_MS,
        }
    }
}

impl PlayerConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: PlayerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let capacities = [
            ("packet_channel_capacity", self.packet_channel_capacity),
            ("video_timeline_capacity", self.video_timeline_capacity),
            ("audio_timeline_capacity", self.audio_timeline_capacity),
        ];
        for (name, value) in capacities {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be at least 1", name)));
            }
        }
        if self.audio_sync_threshold_ms < 0 {
            return Err(ConfigError::Invalid("audio_sync_threshold_ms must not be negative".to_string()));
        }
        if !(self.min_speed > 0.0 && self.min_speed <= self.max_speed) {
            return Err(ConfigError::Invalid(format!(
                "speed range {}..{} is empty",
                self.min_speed, self.max_speed
            )));
        }
        if self.speed_steps.is_empty() {
            return Err(ConfigError::Invalid("speed_steps is empty".to_string()));
        }
        if !self.speed_steps.windows(2).all(|w| w[0] < w[1]) {
            return Err(ConfigError::Invalid("speed_steps must be strictly ascending".to_string()));
        }
        if self.seek_step_ms <= 0 {
            return Err(ConfigError::Invalid("seek_step_ms must be positive".to_string()));
        }
        Ok(())
    }
}

/// Load settings from `path`.
pub fn load_from_path(path: &Path) -> Result<PlayerConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    PlayerConfig::from_toml_str(&content)
}

/// Write settings to `path`, creating parent directories as needed.
pub fn save_to_path(config: &PlayerConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, config.to_toml_string()?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let config = PlayerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.packet_channel_capacity, 256);
        assert_eq!(config.speed_steps, vec![0.5, 1.0, 1.5, 2.0]);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let config = PlayerConfig::from_toml_str("audio_sync_threshold_ms = 80\n").unwrap();
        assert_eq!(config.audio_sync_threshold_ms, 80);
        assert_eq!(config.video_timeline_capacity, DEFAULT_VIDEO_TIMELINE_CAPACITY);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let config = PlayerConfig {
            seek_step_ms: 10_000,
            speed_steps: vec![1.0, 2.0],
            ..PlayerConfig::default()
        };
        let dir = tempdir().expect("failed to create temp dir");
        let path = dir.path().join("nested").join("cadence.toml");

        save_to_path(&config, &path).expect("failed to save config");
        let loaded = load_from_path(&path).expect("failed to load config");
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let dir = tempdir().expect("failed to create temp dir");
        let path = dir.path().join("cadence.toml");
        fs::write(&path, "not = valid = toml").unwrap();
        assert!(matches!(load_from_path(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let zero = PlayerConfig {
            audio_timeline_capacity: 0,
            ..PlayerConfig::default()
        };
        assert!(matches!(zero.validate(), Err(ConfigError::Invalid(_))));

        let unsorted = PlayerConfig {
            speed_steps: vec![1.0, 0.5],
            ..PlayerConfig::default()
        };
        assert!(unsorted.validate().is_err());

        let empty = PlayerConfig {
            speed_steps: Vec::new(),
            ..PlayerConfig::default()
        };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempdir().unwrap();
        let result = load_from_path(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
