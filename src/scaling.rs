//! Scaling factors for the rig's load cell and lead-screw drive.
//!
//! The controller reports load in grams and crosshead travel as a raw encoder
//! pulse count. This module holds the mechanical constants used to turn those
//! raw values into newtons and millimetres, and the reverse conversion used
//! when force setpoints are sent back down to the controller.

use serde::{Deserialize, Serialize};

/// Standard gravity used by the controller firmware when it reports grams.
pub const GRAVITY: f64 = 9.81;

/// Mechanical constants of the drive train.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MechanicalScaling {
    /// Encoder pulses per motor revolution.
    pub pulses_per_rev: f64,
    /// Reduction between motor and lead screw.
    pub gear_ratio: f64,
    /// Lead screw pitch in millimetres per screw revolution.
    pub screw_pitch_mm: f64,
    /// Gravity constant for gram/newton conversion.
    pub gravity: f64,
}

impl Default for MechanicalScaling {
    /// Constants of the stock rig.
    fn default() -> Self {
        Self {
            pulses_per_rev: 2000.0,
            gear_ratio: 10.0,
            screw_pitch_mm: 5.0873,
            gravity: GRAVITY,
        }
    }
}

impl MechanicalScaling {
    pub const fn new(pulses_per_rev: f64, gear_ratio: f64, screw_pitch_mm: f64) -> Self {
        Self {
            pulses_per_rev,
            gear_ratio,
            screw_pitch_mm,
            gravity: GRAVITY,
        }
    }

    /// Millimetres of crosshead travel per encoder pulse.
    #[inline]
    pub fn pulses_to_mm(&self) -> f64 {
        self.screw_pitch_mm / (self.pulses_per_rev * self.gear_ratio)
    }

    /// Convert a raw pulse count to millimetres.
    #[inline]
    pub fn displacement_mm(&self, pulses: i64) -> f64 {
        pulses as f64 * self.pulses_to_mm()
    }

    /// Convert a load cell reading in grams to newtons.
    #[inline]
    pub fn grams_to_newtons(&self, grams: f64) -> f64 {
        grams / 1000.0 * self.gravity
    }

    /// Convert newtons to the grams expected by force-controlled commands.
    #[inline]
    pub fn newtons_to_grams(&self, newtons: f64) -> f64 {
        newtons / self.gravity * 1000.0
    }
}
