//! Host-side command and sequencing engine for a single-axis tensile/compression rig.
//!
//! The rig controller speaks a line-oriented ASCII protocol over a serial port:
//! * outbound commands such as `HOME`, `EXECUTE_RAMP:...` or `SET_MODE:STREAMING`,
//!   plus the out-of-band emergency stop `!`,
//! * inbound `STATUS:<code>` events, `D:<load_g>;<pulses>;<time_ms>[;<cycle>]`
//!   data frames and `R:<ohm>` resistance readings.
//!
//! Test programs are authored in operator units (mm, %, N, MPa), converted to
//! the controller's displacement and force units, checked against the machine
//! limits, and then run one block at a time. The next block is only sent once
//! the controller reports `BLOCK_COMPLETED`.
//!
//! The serial port should be configured like so:
//! * Default baud rate: 460800
//! * Data bits: 8
//! * Stop bits: 1
//! * Parity: None

pub mod block;
pub mod calibration;
pub mod command;
pub mod config;
pub mod error;
pub mod estimate;
pub mod export;
pub mod limits;
pub mod monotonic;
pub mod port;
pub mod scaling;
pub mod sequence;
pub mod sequencer;
pub mod session;
pub mod specimen;
pub mod telemetry;
pub mod transport;
pub mod units;

#[cfg(test)]
mod mock_serial;
