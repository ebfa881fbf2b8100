//! TOML configuration of the rig and of test programs.
//!
//! ```toml
//! # rig.toml
//! calibration_file = "settings.json"
//!
//! [link]
//! port = "/dev/ttyUSB0"
//! baud_rate = 460800
//! idle_interval_ms = 2
//!
//! [mechanics]
//! screw_pitch_mm = 5.0873
//!
//! [limits]
//! force_limit_n = 50.0
//! displacement_limit_mm = 120.0
//! ```

use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    block::BlockSpec, limits::MachineLimits, monotonic::MonotonicSpec, scaling::MechanicalScaling,
};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to write TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

fn read(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Serial link tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Port to open; prompted for when absent.
    pub port: Option<String>,
    pub baud_rate: u32,
    /// Sleep between loop iterations when nothing arrived.
    pub idle_interval_ms: u64,
    /// Queued commands written per loop iteration.
    pub drain_batch: usize,
    /// Period of `GET_DATA` requests while in polling mode.
    pub poll_interval_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 460_800,
            idle_interval_ms: 2,
            drain_batch: 1,
            poll_interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    pub link: LinkConfig,
    pub mechanics: MechanicalScaling,
    pub limits: MachineLimits,
    /// JSON table of calibration weights.
    pub calibration_file: Option<PathBuf>,
}

impl RigConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        read(path)?.parse()
    }
}

impl FromStr for RigConfig {
    type Err = ConfigError;

    fn from_str(content: &str) -> Result<Self, Self::Err> {
        Ok(toml::from_str(content)?)
    }
}

/// A test program on disk: either blocks or a single monotonic test.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgramFile {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<BlockSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monotonic: Option<MonotonicSpec>,
}

impl FromStr for ProgramFile {
    type Err = ConfigError;

    fn from_str(content: &str) -> Result<Self, Self::Err> {
        Ok(toml::from_str(content)?)
    }
}

impl ProgramFile {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        read(path)?.parse()
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}
