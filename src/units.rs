//! Conversion of operator units into the controller's native units.
//!
//! The controller only understands crosshead displacement (mm, mm/s) and load
//! (N, sent as grams). Strain and stress inputs are turned into displacement
//! and force using the gauge length and cross-section of the specimen under
//! test.

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};
use thiserror::Error;

/// What quantity a block setpoint is expressed in.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter, EnumString, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    /// Crosshead displacement in millimetres.
    #[strum(serialize = "Displacement (mm)")]
    Displacement,
    /// Engineering strain in percent of gauge length.
    #[strum(serialize = "Strain (%)")]
    Strain,
    /// Load in newtons.
    #[strum(serialize = "Force (N)")]
    Force,
    /// Engineering stress in MPa (N/mm²).
    #[strum(serialize = "Stress (MPa)")]
    Stress,
}

impl ControlMode {
    /// The unit the controller is driven in for this mode.
    pub const fn base_unit(&self) -> BaseUnit {
        match self {
            ControlMode::Displacement | ControlMode::Strain => BaseUnit::Millimeters,
            ControlMode::Force | ControlMode::Stress => BaseUnit::Newtons,
        }
    }

    /// Short unit suffix shown next to operator values.
    pub const fn unit_suffix(&self) -> &'static str {
        match self {
            ControlMode::Displacement => "mm",
            ControlMode::Strain => "%",
            ControlMode::Force => "N",
            ControlMode::Stress => "MPa",
        }
    }
}

/// Operator speed units.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter, EnumString, Serialize, Deserialize,
)]
pub enum SpeedUnit {
    #[strum(serialize = "mm/s")]
    #[serde(rename = "mm/s")]
    MmPerSec,
    #[strum(serialize = "mm/min")]
    #[serde(rename = "mm/min")]
    MmPerMin,
    #[strum(serialize = "%/s")]
    #[serde(rename = "%/s")]
    PercentPerSec,
    #[strum(serialize = "%/min")]
    #[serde(rename = "%/min")]
    PercentPerMin,
}

impl SpeedUnit {
    /// Whether the unit is relative to the specimen gauge length.
    pub const fn is_relative(&self) -> bool {
        matches!(self, SpeedUnit::PercentPerSec | SpeedUnit::PercentPerMin)
    }
}

/// The two quantities the controller can regulate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum BaseUnit {
    #[strum(serialize = "mm")]
    Millimeters,
    #[strum(serialize = "N")]
    Newtons,
}

impl BaseUnit {
    /// Mode token used on the wire.
    pub const fn wire_token(&self) -> &'static str {
        match self {
            BaseUnit::Millimeters => "DISP",
            BaseUnit::Newtons => "FORCE",
        }
    }
}

/// Specimen geometry needed by relative units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    pub gauge_length_mm: f64,
    pub area_mm2: f64,
}

impl Geometry {
    pub const fn new(gauge_length_mm: f64, area_mm2: f64) -> Self {
        Self {
            gauge_length_mm,
            area_mm2,
        }
    }
}

/// A setpoint converted into controller base units, still relative to the
/// operator's zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Setpoint {
    pub value: f64,
    pub unit: BaseUnit,
}

#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum ConversionError {
    #[error("Gauge length must be > 0 to use {0}.")]
    MissingGaugeLength(&'static str),
    #[error("Area must be > 0 to use Stress (MPa).")]
    MissingArea,
}

fn gauge_length(geometry: Option<&Geometry>, what: &'static str) -> Result<f64, ConversionError> {
    match geometry {
        Some(g) if g.gauge_length_mm > 0.0 => Ok(g.gauge_length_mm),
        _ => Err(ConversionError::MissingGaugeLength(what)),
    }
}

/// Convert an operator speed to mm/s.
///
/// `%`-based units need a specimen with a positive gauge length.
pub fn convert_speed(
    value: f64,
    unit: SpeedUnit,
    geometry: Option<&Geometry>,
) -> Result<f64, ConversionError> {
    match unit {
        SpeedUnit::MmPerSec => Ok(value),
        SpeedUnit::MmPerMin => Ok(value / 60.0),
        SpeedUnit::PercentPerSec => {
            let gauge = gauge_length(geometry, "%-based speed")?;
            Ok((gauge / 100.0) * value)
        }
        SpeedUnit::PercentPerMin => {
            let gauge = gauge_length(geometry, "%-based speed")?;
            Ok((gauge / 100.0) * (value / 60.0))
        }
    }
}

/// Convert an operator setpoint to displacement or force.
pub fn convert_setpoint(
    value: f64,
    mode: ControlMode,
    geometry: Option<&Geometry>,
) -> Result<Setpoint, ConversionError> {
    let converted = match mode {
        ControlMode::Displacement | ControlMode::Force => value,
        ControlMode::Strain => {
            let gauge = gauge_length(geometry, "Strain (%)")?;
            (gauge * value) / 100.0
        }
        ControlMode::Stress => match geometry {
            // MPa is N/mm², so multiplying by mm² yields N.
            Some(g) if g.area_mm2 > 0.0 => value * g.area_mm2,
            _ => return Err(ConversionError::MissingArea),
        },
    };

    Ok(Setpoint {
        value: converted,
        unit: mode.base_unit(),
    })
}
