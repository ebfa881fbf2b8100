//! Load cell calibration.
//!
//! Calibration is a three step handshake with the operator:
//! 1. remove all load, 2. tare, 3. hang the known weight and calibrate.
//! The known weights per load cell live in a small JSON table.

use std::{collections::BTreeMap, fs, io, path::Path, str::FromStr};

use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::command::Command;

#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("Calibration file I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Calibration file is not valid: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Unknown load cell '{0}'")]
    UnknownCell(String),
    #[error("Calibration file has no calibration factor")]
    MissingFactor,
}

/// Zero and calibration mass in grams, per load cell name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationTable {
    pub cal_loads: BTreeMap<String, [f64; 2]>,
}

impl Default for CalibrationTable {
    fn default() -> Self {
        let cal_loads = [
            ("1N", 44.0),
            ("10N", 398.0),
            ("50N", 398.0),
            ("100N", 1398.0),
            ("200N", 1398.0),
        ]
        .into_iter()
        .map(|(cell, grams)| (cell.to_string(), [0.0, grams]))
        .collect();
        Self { cal_loads }
    }
}

impl FromStr for CalibrationTable {
    type Err = CalibrationError;

    fn from_str(contents: &str) -> Result<Self, Self::Err> {
        Ok(serde_json::from_str(contents)?)
    }
}

impl CalibrationTable {

    /// Load the table, falling back to the defaults when the file is missing.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, CalibrationError> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(contents) => contents.parse(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("No calibration table at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), CalibrationError> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Calibration mass in grams for a cell.
    pub fn weight_g(&self, cell: &str) -> Result<f64, CalibrationError> {
        self.cal_loads
            .get(cell)
            .map(|[_, cal]| *cal)
            .ok_or_else(|| CalibrationError::UnknownCell(cell.to_string()))
    }

    pub fn cells(&self) -> impl Iterator<Item = &str> {
        self.cal_loads.keys().map(String::as_str)
    }
}

/// Rated force of a cell named like `"50N"`.
pub fn rated_force_n(cell: &str) -> Option<f64> {
    let cell = cell.trim();
    let number = cell
        .strip_suffix('N')
        .or_else(|| cell.strip_suffix('n'))?;
    number.trim().parse::<f64>().ok().filter(|n| *n > 0.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CalibrationStep {
    #[default]
    Idle,
    WaitingForZero,
    WaitingForWeight,
}

/// Result of pressing "continue".
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub command: Option<Command>,
    /// Set when the last step completed for this cell.
    pub calibrated_cell: Option<String>,
}

#[derive(Debug, Default)]
pub struct CalibrationStepper {
    step: CalibrationStep,
    ready_to_save: bool,
}

impl CalibrationStepper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(&self) -> CalibrationStep {
        self.step
    }

    /// A calibration finished and can be written to file.
    pub fn ready_to_save(&self) -> bool {
        self.ready_to_save
    }

    /// Move to the next step for `cell`.
    pub fn advance(&mut self, table: &CalibrationTable, cell: &str) -> Result<StepOutcome, CalibrationError> {
        let weight_g = table.weight_g(cell)?;

        let outcome = match self.step {
            CalibrationStep::Idle => {
                self.step = CalibrationStep::WaitingForZero;
                self.ready_to_save = false;
                StepOutcome {
                    command: None,
                    calibrated_cell: None,
                }
            }
            CalibrationStep::WaitingForZero => {
                self.step = CalibrationStep::WaitingForWeight;
                StepOutcome {
                    command: Some(Command::Tare),
                    calibrated_cell: None,
                }
            }
            CalibrationStep::WaitingForWeight => {
                self.step = CalibrationStep::Idle;
                self.ready_to_save = true;
                info!("Load cell {} calibrated with {} g", cell, weight_g);
                StepOutcome {
                    command: Some(Command::Calibrate(weight_g)),
                    calibrated_cell: Some(cell.to_string()),
                }
            }
        };
        Ok(outcome)
    }

    /// Operator instruction for the current step.
    pub fn prompt(&self, table: &CalibrationTable, cell: &str) -> String {
        match self.step {
            CalibrationStep::Idle if self.ready_to_save => "Calibration complete.".to_string(),
            CalibrationStep::Idle => "Select a load cell and start the calibration.".to_string(),
            CalibrationStep::WaitingForZero => "Remove clamps and weights, then continue.".to_string(),
            CalibrationStep::WaitingForWeight => match table.weight_g(cell) {
                Ok(g) => format!("Add the calibration weight ({} g), then continue.", g),
                Err(e) => e.to_string(),
            },
        }
    }
}

/// A saved calibration result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationFile {
    pub calibration_factor: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cell: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibrated_on: Option<String>,
}

impl CalibrationFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CalibrationError> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), CalibrationError> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Command restoring this calibration on the controller.
    pub fn set_scale_command(&self) -> Result<Command, CalibrationError> {
        match self.calibration_factor {
            Some(factor) => Ok(Command::SetScale(factor)),
            None => {
                warn!("Calibration file without a factor");
                Err(CalibrationError::MissingFactor)
            }
        }
    }

    /// Cell name, from the file contents or else from a `cal_<cell>_<date>.json` name.
    pub fn cell_name(&self, path: impl AsRef<Path>) -> Option<String> {
        if let Some(cell) = &self.cell {
            return Some(cell.clone());
        }
        let stem = path.as_ref().file_stem()?.to_str()?;
        stem.split('_').nth(1).map(str::to_string)
    }
}

/// `cal_<cell>_<YYYY-mm-dd>.json`
pub fn default_file_name(cell: &str, date: chrono::NaiveDate) -> String {
    format!("cal_{}_{}.json", cell, date.format("%Y-%m-%d"))
}
