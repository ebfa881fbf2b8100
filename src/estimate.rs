//! Run time prediction for a test program.
//!
//! The crosshead position is simulated block by block so that travel between
//! blocks is counted. Force-controlled blocks end wherever the specimen
//! reaches the load, so their duration cannot be known in advance.

use core::fmt;

use crate::{block::TestBlock, sequence::Sequence, units::BaseUnit};

/// Positions closer than this are treated as equal.
const POSITION_TOLERANCE_MM: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Estimate {
    /// Total duration in seconds.
    Predictable(f64),
    NotPredictable,
}

impl Estimate {
    pub fn seconds(&self) -> Option<f64> {
        match self {
            Estimate::Predictable(s) => Some(*s),
            Estimate::NotPredictable => None,
        }
    }
}

/// `1h 02m 03s`, `2m 03s` or `45s`, truncated to whole seconds.
impl fmt::Display for Estimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Estimate::Predictable(total) => {
                let total = total.max(0.0) as u64;
                let (minutes, seconds) = (total / 60, total % 60);
                let (hours, minutes) = (minutes / 60, minutes % 60);
                if hours > 0 {
                    write!(f, "{}h {:02}m {:02}s", hours, minutes, seconds)
                } else if minutes > 0 {
                    write!(f, "{}m {:02}s", minutes, seconds)
                } else {
                    write!(f, "{}s", seconds)
                }
            }
            Estimate::NotPredictable => f.write_str("N/A (contains non-displacement blocks)"),
        }
    }
}

/// Travel time from `from` to `to`, or `None` if the speed cannot get there.
fn travel(from: f64, to: f64, speed_mm_s: f64) -> Option<f64> {
    let distance = (to - from).abs();
    if distance <= POSITION_TOLERANCE_MM {
        Some(0.0)
    } else if speed_mm_s > 0.0 {
        Some(distance / speed_mm_s)
    } else {
        None
    }
}

/// Predict the run time of `sequence` starting from `start_mm` (relative).
pub fn estimate_from(sequence: &Sequence, start_mm: f64) -> Estimate {
    let mut total = 0.0;
    let mut position = start_mm;

    for block in sequence.iter() {
        match block {
            TestBlock::Pause(p) => total += p.duration_s,
            TestBlock::Cyclic(c) if c.base_unit == BaseUnit::Millimeters => {
                if !(c.speed_mm_s > 0.0) {
                    return Estimate::NotPredictable;
                }
                let Some(reposition) = travel(position, c.lower_conv, c.speed_mm_s) else {
                    return Estimate::NotPredictable;
                };
                let ramp = (c.upper_conv - c.lower_conv).abs() / c.speed_mm_s;
                let per_cycle = 2.0 * ramp + c.spec.hold_upper_s + c.spec.hold_lower_s;
                total += reposition + per_cycle * c.spec.cycles as f64;
                position = c.lower_conv;
            }
            TestBlock::Ramp(r) if r.base_unit == BaseUnit::Millimeters => {
                let Some(ramp) = travel(position, r.target_conv, r.speed_mm_s) else {
                    return Estimate::NotPredictable;
                };
                total += ramp + r.spec.hold_s;
                position = r.target_conv;
            }
            _ => return Estimate::NotPredictable,
        }
    }

    Estimate::Predictable(total)
}

/// Predict the run time of `sequence` starting at the relative zero.
pub fn estimate(sequence: &Sequence) -> Estimate {
    estimate_from(sequence, 0.0)
}
