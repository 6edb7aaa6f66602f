//! Calibration configuration
//!
//! Round counts, MLS order, settle delays and the session deadline, stored
//! as pretty JSON at `<data_dir>/speakercal/config.json`. Field names also
//! accept the camelCase spelling the listener page uses.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audio::recorder::PlaybackSettle;
use crate::{DEFAULT_MLS_ORDER, MAX_MLS_ORDER, MIN_MLS_ORDER};

/// Invalid configuration
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("MLS order {0} outside supported range {MIN_MLS_ORDER}..={MAX_MLS_ORDER}")]
    InvalidOrder(u32),

    #[error("Configuration runs zero rounds")]
    ZeroRounds,

    #[error("Timeout must be greater than zero")]
    ZeroTimeout,
}

impl ConfigError {
    /// Taxonomy name of the error
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidOrder(_) => "InvalidOrderError",
            Self::ZeroRounds => "ZeroRoundsError",
            Self::ZeroTimeout => "ZeroTimeoutError",
        }
    }
}

fn default_num_captures() -> u32 {
    1
}

fn default_num_mls_per_capture() -> u32 {
    1
}

fn default_mls_order() -> u32 {
    DEFAULT_MLS_ORDER
}

fn default_inter_round_settle_ms() -> u64 {
    2000
}

fn default_timeout_ms() -> u64 {
    180_000
}

fn default_busy_grace_ms() -> u64 {
    500
}

/// Settings for one calibration attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Capture passes
    #[serde(default = "default_num_captures", alias = "numCaptures")]
    pub num_captures: u32,
    /// MLS rounds per capture pass
    #[serde(default = "default_num_mls_per_capture", alias = "numMLSPerCapture")]
    pub num_mls_per_capture: u32,
    /// MLS order N (signal length 2^N - 1)
    #[serde(default = "default_mls_order", alias = "mlsOrder")]
    pub mls_order: u32,
    /// Fixed post-playback wait; None derives it from the signal length
    #[serde(default, alias = "playbackSettleMs")]
    pub playback_settle_ms: Option<u64>,
    /// Pause between rounds for reverberation to decay
    #[serde(default = "default_inter_round_settle_ms", alias = "interRoundSettleMs")]
    pub inter_round_settle_ms: u64,
    /// Deadline for the whole attempt
    #[serde(default = "default_timeout_ms", alias = "timeoutMs")]
    pub timeout_ms: u64,
    /// Grace period before a second connection is closed
    #[serde(default = "default_busy_grace_ms", alias = "busyGraceMs")]
    pub busy_grace_ms: u64,
    /// Export excitation, rounds and result as WAV files
    #[serde(default)]
    pub download: bool,
    /// Export directory (None = `<data_dir>/speakercal/exports`)
    #[serde(default, alias = "downloadDir")]
    pub download_dir: Option<PathBuf>,
    /// Remote analysis service base URL
    #[serde(default, alias = "analysisUrl")]
    pub analysis_url: Option<String>,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            num_captures: default_num_captures(),
            num_mls_per_capture: default_num_mls_per_capture(),
            mls_order: default_mls_order(),
            playback_settle_ms: None,
            inter_round_settle_ms: default_inter_round_settle_ms(),
            timeout_ms: default_timeout_ms(),
            busy_grace_ms: default_busy_grace_ms(),
            download: false,
            download_dir: None,
            analysis_url: None,
        }
    }
}

impl CalibrationConfig {
    /// Total rounds per session
    pub fn num_rounds(&self) -> u32 {
        self.num_captures.saturating_mul(self.num_mls_per_capture)
    }

    /// Reject settings no session can run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_MLS_ORDER..=MAX_MLS_ORDER).contains(&self.mls_order) {
            return Err(ConfigError::InvalidOrder(self.mls_order));
        }
        if self.num_rounds() == 0 {
            return Err(ConfigError::ZeroRounds);
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }

    pub fn playback_settle(&self) -> PlaybackSettle {
        match self.playback_settle_ms {
            Some(ms) => PlaybackSettle::Fixed(Duration::from_millis(ms)),
            None => PlaybackSettle::Derived,
        }
    }

    pub fn inter_round_settle(&self) -> Duration {
        Duration::from_millis(self.inter_round_settle_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn busy_grace(&self) -> Duration {
        Duration::from_millis(self.busy_grace_ms)
    }

    /// Directory exports are written under
    pub fn export_dir(&self) -> PathBuf {
        self.download_dir.clone().unwrap_or_else(|| {
            data_dir().join("exports")
        })
    }

    /// Config file path: `<data_dir>/speakercal/config.json`
    pub fn path() -> PathBuf {
        data_dir().join("config.json")
    }

    /// Load config from disk, falling back to defaults on any error
    pub fn load() -> Self {
        Self::load_from(&Self::path())
    }

    /// Load config from `path`, falling back to defaults on any error
    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => {
                    tracing::info!(path = %path.display(), "Loaded config from disk");
                    config
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to parse config, using defaults");
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!(path = %path.display(), "No config file found, using defaults");
                Self::default()
            }
        }
    }

    /// Save config to disk, creating parent directories if needed
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!(path = %path.display(), "Config saved to disk");
        Ok(())
    }
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("speakercal")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CalibrationConfig::default();
        assert_eq!(config.num_rounds(), 1);
        assert_eq!(config.mls_order, 18);
        assert_eq!(config.timeout(), Duration::from_millis(180_000));
        assert_eq!(config.busy_grace(), Duration::from_millis(500));
        assert_eq!(config.playback_settle(), PlaybackSettle::Derived);
        assert!(!config.download);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_camel_case_surface() {
        let json = r#"{
            "numCaptures": 2,
            "numMLSPerCapture": 3,
            "mlsOrder": 12,
            "playbackSettleMs": 1500,
            "timeoutMs": 1000,
            "download": true
        }"#;
        let config: CalibrationConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.num_rounds(), 6);
        assert_eq!(config.mls_order, 12);
        assert_eq!(
            config.playback_settle(),
            PlaybackSettle::Fixed(Duration::from_millis(1500))
        );
        assert_eq!(config.timeout_ms, 1000);
        assert!(config.download);
        assert_eq!(config.inter_round_settle_ms, 2000);
    }

    #[test]
    fn test_empty_json_uses_defaults() {
        let config: CalibrationConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, CalibrationConfig::default());
    }

    #[test]
    fn test_validate() {
        let mut config = CalibrationConfig {
            mls_order: 2,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidOrder(2)));

        config.mls_order = 19;
        assert_eq!(config.validate(), Err(ConfigError::InvalidOrder(19)));

        config.mls_order = 4;
        config.num_captures = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroRounds));

        config.num_captures = 1;
        config.timeout_ms = 0;
        assert_eq!(config.validate().unwrap_err().kind(), "ZeroTimeoutError");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let config = CalibrationConfig {
            num_captures: 2,
            mls_order: 10,
            analysis_url: Some("http://localhost:9000".into()),
            ..Default::default()
        };
        config.save(&path).unwrap();

        assert_eq!(CalibrationConfig::load_from(&path), config);
    }

    #[test]
    fn test_corrupt_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert_eq!(CalibrationConfig::load_from(&path), CalibrationConfig::default());
    }
}
