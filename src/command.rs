//! Outbound controller commands.
//!
//! Every command is a single ASCII line. [`Command`] renders the line body via
//! `Display`; the transport appends the terminator.

use core::fmt;

use fugit::MillisDurationU32;

use crate::units::BaseUnit;

/// Line terminator used on the wire.
pub const LINE_TERMINATOR: u8 = b'\n';

/// The out-of-band kill switch, terminator included.
pub const EMERGENCY_STOP: &[u8] = b"!\n";

/// Telemetry framing requested from the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    /// Controller pushes 4-field data frames continuously.
    Streaming,
    /// Controller answers each `GET_DATA` with a 3-field frame.
    Polling,
}

impl fmt::Display for LinkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkMode::Streaming => f.write_str("STREAMING"),
            LinkMode::Polling => f.write_str("POLLING"),
        }
    }
}

/// Absolute parameters of a cyclic block, in controller units.
///
/// Force setpoints are in grams, displacement setpoints in millimetres.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CyclicParams {
    pub mode: BaseUnit,
    pub upper: f64,
    pub lower: f64,
    pub speed_mm_s: f64,
    pub hold_upper: MillisDurationU32,
    pub hold_lower: MillisDurationU32,
    pub cycles: u32,
}

/// Absolute parameters of a ramp block, in controller units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RampParams {
    pub mode: BaseUnit,
    pub target: f64,
    pub speed_mm_s: f64,
    pub hold: MillisDurationU32,
}

/// Parameters of a single-phase monotonic test.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonotonicParams {
    pub speed_mm_s: f64,
    pub criterion: BaseUnit,
    pub stop_value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Tare,
    /// Calibrate the load cell against a known mass in grams.
    Calibrate(f64),
    SetScale(f64),
    Home,
    Stop,
    JogUp,
    JogDown,
    /// Jog speed in mm/s.
    SetSpeed(f64),
    GetData,
    SetMode(LinkMode),
    ResetTimer,
    StartCyclic(CyclicParams),
    ExecuteRamp(RampParams),
    ExecutePause(MillisDurationU32),
    StartTest(MonotonicParams),
    ReturnToStart,
    SetLimits { force_g: f64, displacement_mm: f64 },
    EnableLcrPolling,
    DisableLcrPolling,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Tare => f.write_str("TARE"),
            Command::Calibrate(grams) => write!(f, "CALIBRATE:{}", grams),
            Command::SetScale(factor) => write!(f, "SET_SCALE:{}", factor),
            Command::Home => f.write_str("HOME"),
            Command::Stop => f.write_str("STOP"),
            Command::JogUp => f.write_str("JOG_UP"),
            Command::JogDown => f.write_str("JOG_DOWN"),
            Command::SetSpeed(speed) => write!(f, "SET_SPEED:{:.2}", speed),
            Command::GetData => f.write_str("GET_DATA"),
            Command::SetMode(mode) => write!(f, "SET_MODE:{}", mode),
            Command::ResetTimer => f.write_str("RESET_TIMER"),
            Command::StartCyclic(p) => write!(
                f,
                "START_CYCLIC_TEST:MODE={};UPPER={:.4};LOWER={:.4};SPEED={:.3};HOLD_U={};HOLD_L={};CYCLES={}",
                p.mode.wire_token(),
                p.upper,
                p.lower,
                p.speed_mm_s,
                p.hold_upper.to_millis(),
                p.hold_lower.to_millis(),
                p.cycles
            ),
            Command::ExecuteRamp(p) => write!(
                f,
                "EXECUTE_RAMP:MODE={};TARGET={:.4};SPEED={:.3};HOLD={}",
                p.mode.wire_token(),
                p.target,
                p.speed_mm_s,
                p.hold.to_millis()
            ),
            Command::ExecutePause(duration) => write!(f, "EXECUTE_PAUSE:{}", duration.to_millis()),
            Command::StartTest(p) => write!(
                f,
                "START_TEST:SPEED_MMS={:.3};CRITERION={};STOP_VAL={:.3}",
                p.speed_mm_s,
                p.criterion.wire_token(),
                p.stop_value
            ),
            Command::ReturnToStart => f.write_str("RETURN_TO_START"),
            Command::SetLimits {
                force_g,
                displacement_mm,
            } => write!(f, "SET_LIMITS:FORCE_G={:.2};DISP_MM={:.4}", force_g, displacement_mm),
            Command::EnableLcrPolling => f.write_str("ENABLE_LCR_POLLING"),
            Command::DisableLcrPolling => f.write_str("DISABLE_LCR_POLLING"),
        }
    }
}

/// Anything commands can be handed to, normally the serial transport.
///
/// Both calls return immediately; delivery failures are reported out of band.
pub trait CommandSink {
    /// Queue a command behind any already pending.
    fn send_command(&mut self, command: &Command);
    /// Send the kill switch ahead of the queue.
    fn send_emergency(&mut self);
}

/// Records commands instead of sending them.
impl CommandSink for Vec<String> {
    fn send_command(&mut self, command: &Command) {
        self.push(command.to_string());
    }

    fn send_emergency(&mut self) {
        self.push("!".to_string());
    }
}

/// Convert seconds to whole milliseconds, truncating.
///
/// Negative or non-finite inputs clamp to zero.
pub fn seconds_to_millis(seconds: f64) -> MillisDurationU32 {
    let millis = (seconds * 1000.0).trunc();
    let millis = if millis.is_finite() && millis > 0.0 {
        millis.min(u32::MAX as f64) as u32
    } else {
        0
    };
    MillisDurationU32::millis(millis)
}
