//! Bridge configuration.
//!
//! Every field has a default, so an empty (or absent) TOML file is a valid
//! configuration:
//!
//! ```toml
//! baud_rate = 115200
//! calibration_window_ms = 2000
//! poll_interval_ms = 50
//! read_timeout_ms = 100
//! include_keywords = ["bluetooth", "spp", "serial"]
//! exclude_keywords = ["usb"]
//! # port = "COM7"
//! fill_poll_interval_ms = 50
//! command_keyword = "Syclone"
//! max_targets = 1048576
//! ```

use crate::command::DEFAULT_COMMAND_KEYWORD;
use crate::detect::{CandidateFilter, DetectorConfig, DEFAULT_BAUD_RATE};
use crate::grid::DEFAULT_MAX_TARGETS;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub baud_rate: u32,
    pub calibration_window_ms: u64,
    pub poll_interval_ms: u64,
    pub read_timeout_ms: u64,
    pub include_keywords: Vec<String>,
    pub exclude_keywords: Vec<String>,
    /// Skip detection and open this port directly.
    pub port: Option<String>,
    pub fill_poll_interval_ms: u64,
    pub command_keyword: String,
    /// Largest grid a single command may reserve, in sample cells.
    pub max_targets: usize,
    /// CSV written from the in-memory sheet at shutdown.
    pub output: Option<PathBuf>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        let filter = CandidateFilter::default();
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            calibration_window_ms: 2000,
            poll_interval_ms: 50,
            read_timeout_ms: 100,
            include_keywords: filter.include,
            exclude_keywords: filter.exclude,
            port: None,
            fill_poll_interval_ms: 50,
            command_keyword: String::from(DEFAULT_COMMAND_KEYWORD),
            max_targets: DEFAULT_MAX_TARGETS,
            output: None,
        }
    }
}

impl BridgeConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.baud_rate == 0 {
            return Err(ConfigError::Invalid("baud_rate must be positive".into()));
        }
        if self.calibration_window_ms == 0 {
            return Err(ConfigError::Invalid(
                "calibration_window_ms must be positive".into(),
            ));
        }
        if self.poll_interval_ms == 0 || self.fill_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll intervals must be positive".into(),
            ));
        }
        if self.read_timeout_ms == 0 {
            return Err(ConfigError::Invalid("read_timeout_ms must be positive".into()));
        }
        if self.command_keyword.trim().is_empty() {
            return Err(ConfigError::Invalid("command_keyword must not be empty".into()));
        }
        if self.max_targets == 0 {
            return Err(ConfigError::Invalid("max_targets must be positive".into()));
        }
        if self.include_keywords.is_empty() {
            return Err(ConfigError::Invalid(
                "include_keywords must name at least one keyword".into(),
            ));
        }
        Ok(())
    }

    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            baud_rate: self.baud_rate,
            calibration_window: Duration::from_millis(self.calibration_window_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
        }
    }

    pub fn candidate_filter(&self) -> CandidateFilter {
        CandidateFilter::new(self.include_keywords.clone(), self.exclude_keywords.clone())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn fill_poll_interval(&self) -> Duration {
        Duration::from_millis(self.fill_poll_interval_ms)
    }
}
