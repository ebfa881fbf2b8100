//! Decoding of inbound controller lines.
//!
//! Lines come in three flavours:
//! * `STATUS:<code>` - free-text status events.
//! * `D:<load_g>;<pulses>;<time_ms>[;<cycle>]` - data samples, 3 fields when
//!   polled and 4 fields while streaming.
//! * `R:<ohm>` - readings from the auxiliary LCR meter.
//!
//! Malformed data lines are expected under electrical noise; they decode to an
//! error the caller is meant to drop.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{limits::Offsets, scaling::MechanicalScaling};

pub const STATUS_MARKER: &str = "STATUS:";
pub const DATA_MARKER: &str = "D:";
pub const RESISTANCE_MARKER: &str = "R:";
const FIELD_SEPARATOR: char = ';';

/// Resistance value reported when LCR polling is off or nothing was read yet.
pub const RESISTANCE_DISABLED: f64 = -999.0;
/// Resistance value reported when the meter did not answer.
pub const RESISTANCE_TIMEOUT: f64 = -1.0;
/// Resistance value reported when the meter answer could not be parsed.
pub const RESISTANCE_PARSE_ERROR: f64 = -2.0;

/// Raw data sample as sent by the controller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawSample {
    pub load_g: f64,
    pub pulses: i64,
    pub time_ms: f64,
    /// Only present with streaming framing.
    pub cycle: Option<u32>,
}

impl RawSample {
    /// Convert to physical units.
    pub fn to_reading(&self, scaling: &MechanicalScaling) -> Reading {
        Reading {
            load_n: scaling.grams_to_newtons(self.load_g),
            displacement_mm: scaling.displacement_mm(self.pulses),
            time_s: self.time_ms / 1000.0,
            cycle: self.cycle.unwrap_or(0),
        }
    }
}

/// An absolute machine reading in physical units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub load_n: f64,
    pub displacement_mm: f64,
    pub time_s: f64,
    pub cycle: u32,
}

/// One recorded point of a running test.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub time_s: f64,
    pub relative_disp_mm: f64,
    pub relative_load_n: f64,
    pub absolute_disp_mm: f64,
    pub absolute_load_n: f64,
    pub cycle_count: u32,
    pub block_index: u32,
    /// Latest LCR reading, see [`Resistance::from_code`] for the sentinels.
    pub resistance_ohm: f64,
}

impl TelemetrySample {
    pub fn new(reading: &Reading, offsets: &Offsets, block_index: u32, resistance_ohm: f64) -> Self {
        Self {
            time_s: reading.time_s,
            relative_disp_mm: reading.displacement_mm - offsets.displacement_offset_mm,
            relative_load_n: reading.load_n - offsets.load_offset_n,
            absolute_disp_mm: reading.displacement_mm,
            absolute_load_n: reading.load_n,
            cycle_count: reading.cycle,
            block_index,
            resistance_ohm,
        }
    }
}

/// Classification of status codes that drive the rest of the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    BlockCompleted,
    HomingCompleted,
    TestCompleted,
    StoppedByUser,
    /// Firmware-enforced force or displacement limit tripped.
    LimitHit,
    /// A physical travel switch was reached.
    EndStopHit,
    Other,
}

impl StatusCode {
    /// Classify a status text. Safety codes take precedence.
    pub fn classify(text: &str) -> Self {
        if text.contains("LIMIT_HIT") {
            StatusCode::LimitHit
        } else if text.contains("TOP_HIT") || text.contains("BOTTOM_HIT") || text.contains("END_STOP") {
            StatusCode::EndStopHit
        } else if text.contains("BLOCK_COMPLETED") {
            StatusCode::BlockCompleted
        } else if text.contains("HOMING_COMPLETED") || text.contains("HOMED") {
            StatusCode::HomingCompleted
        } else if text.contains("TEST_COMPLETED") {
            StatusCode::TestCompleted
        } else if text.contains("STOPPED_BY_USER") {
            StatusCode::StoppedByUser
        } else {
            StatusCode::Other
        }
    }

    /// Whether this code must abort a running test and raise a critical alert.
    pub const fn is_safety_fault(&self) -> bool {
        matches!(self, StatusCode::LimitHit | StatusCode::EndStopHit)
    }
}

/// A status event with its original text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: StatusCode,
    pub text: String,
}

impl Status {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            code: StatusCode::classify(&text),
            text,
        }
    }
}

/// Interpretation of a resistance value and its sentinel codes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Resistance {
    Disabled,
    Timeout,
    ParseError,
    Ohms(f64),
}

impl Resistance {
    pub fn from_code(value: f64) -> Self {
        if value <= -900.0 {
            Resistance::Disabled
        } else if value == RESISTANCE_TIMEOUT {
            Resistance::Timeout
        } else if value == RESISTANCE_PARSE_ERROR {
            Resistance::ParseError
        } else {
            Resistance::Ohms(value)
        }
    }
}

/// One decoded line.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Status(Status),
    Data(RawSample),
    Resistance(f64),
    Unrecognized,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Data frame has {0} fields, expected 3 or 4")]
    FieldCount(usize),
    #[error("Data field {index} is not numeric: {field:?}")]
    BadField { index: usize, field: String },
}

fn field<T: core::str::FromStr>(fields: &[&str], index: usize) -> Result<T, DecodeError> {
    fields[index].trim().parse::<T>().map_err(|_| DecodeError::BadField {
        index,
        field: fields[index].to_string(),
    })
}

/// Decode a single line (without its terminator).
pub fn decode(line: &str) -> Result<Frame, DecodeError> {
    let line = line.trim();

    if let Some(text) = line.strip_prefix(STATUS_MARKER) {
        return Ok(Frame::Status(Status::new(text.trim())));
    }

    if let Some(payload) = line.strip_prefix(DATA_MARKER) {
        let fields: Vec<&str> = payload.split(FIELD_SEPARATOR).collect();
        let cycle = match fields.len() {
            3 => None,
            4 => Some(field::<u32>(&fields, 3)?),
            n => return Err(DecodeError::FieldCount(n)),
        };
        return Ok(Frame::Data(RawSample {
            load_g: field(&fields, 0)?,
            pulses: field(&fields, 1)?,
            time_ms: field(&fields, 2)?,
            cycle,
        }));
    }

    if let Some(payload) = line.strip_prefix(RESISTANCE_MARKER) {
        let fields = [payload];
        return Ok(Frame::Resistance(field(&fields, 0)?));
    }

    Ok(Frame::Unrecognized)
}
