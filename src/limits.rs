//! Machine safety limits and the tare offsets used to check setpoints against
//! them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::units::{BaseUnit, Setpoint};

/// Absolute safety envelope of the rig.
///
/// Displacement is symmetric about zero. Only the tensile (upper) force bound
/// is enforced.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineLimits {
    pub force_limit_n: f64,
    pub displacement_limit_mm: f64,
}

/// Limits of the stock frame with the 100 N cell fitted.
impl Default for MachineLimits {
    fn default() -> Self {
        Self {
            force_limit_n: 100.0,
            displacement_limit_mm: 190.0,
        }
    }
}

impl MachineLimits {
    pub const fn new(force_limit_n: f64, displacement_limit_mm: f64) -> Self {
        Self {
            force_limit_n,
            displacement_limit_mm,
        }
    }
}

/// Absolute readings captured at the last zero action.
///
/// `absolute = relative + offset`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Offsets {
    pub load_offset_n: f64,
    pub displacement_offset_mm: f64,
}

impl Offsets {
    /// Absolute machine value of a relative setpoint.
    pub fn absolute(&self, setpoint: Setpoint) -> f64 {
        match setpoint.unit {
            BaseUnit::Millimeters => setpoint.value + self.displacement_offset_mm,
            BaseUnit::Newtons => setpoint.value + self.load_offset_n,
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum LimitError {
    #[error("Absolute displacement ({absolute_mm:.2} mm) exceeds machine limit of ±{limit_mm:.2} mm.")]
    Displacement { absolute_mm: f64, limit_mm: f64 },
    #[error("Absolute force ({absolute_n:.2} N) exceeds machine limit of {limit_n:.2} N.")]
    Force { absolute_n: f64, limit_n: f64 },
    #[error("Setpoint is not a finite number.")]
    NotFinite,
}

/// Check a converted setpoint against the machine limits once the tare offset
/// has been applied.
pub fn validate(
    setpoint: Setpoint,
    offsets: &Offsets,
    limits: &MachineLimits,
) -> Result<(), LimitError> {
    let absolute = offsets.absolute(setpoint);
    if !absolute.is_finite() {
        return Err(LimitError::NotFinite);
    }
    match setpoint.unit {
        BaseUnit::Millimeters if absolute.abs() > limits.displacement_limit_mm => {
            Err(LimitError::Displacement {
                absolute_mm: absolute,
                limit_mm: limits.displacement_limit_mm,
            })
        }
        // TODO: confirm with the rig owners whether a compressive bound should be enforced too.
        BaseUnit::Newtons if absolute > limits.force_limit_n => Err(LimitError::Force {
            absolute_n: absolute,
            limit_n: limits.force_limit_n,
        }),
        _ => Ok(()),
    }
}
