//! Test program blocks.
//!
//! A [`BlockSpec`] is what the operator typed. Authoring turns it into a
//! [`TestBlock`], which also carries the setpoints converted to controller
//! base units. Authoring is where unit conversion and machine-limit checks
//! happen; a [`TestBlock`] that exists has passed both.

use core::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    command::{seconds_to_millis, Command, CyclicParams, RampParams},
    limits::{validate, LimitError, MachineLimits, Offsets},
    scaling::MechanicalScaling,
    units::{convert_setpoint, convert_speed, BaseUnit, ControlMode, ConversionError, Geometry, Setpoint, SpeedUnit},
};

/// Raw cyclic block input.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CyclicSpec {
    pub control: ControlMode,
    pub upper: f64,
    pub lower: f64,
    pub speed: f64,
    pub speed_unit: SpeedUnit,
    #[serde(default)]
    pub hold_upper_s: f64,
    #[serde(default)]
    pub hold_lower_s: f64,
    pub cycles: u32,
}

/// Raw ramp block input.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RampSpec {
    pub control: ControlMode,
    pub target: f64,
    pub speed: f64,
    pub speed_unit: SpeedUnit,
    #[serde(default)]
    pub hold_s: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PauseSpec {
    pub duration_s: f64,
}

/// One block of a program as entered by the operator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockSpec {
    Cyclic(CyclicSpec),
    Ramp(RampSpec),
    Pause(PauseSpec),
}

impl BlockSpec {
    pub const fn pause(duration_s: f64) -> Self {
        BlockSpec::Pause(PauseSpec { duration_s })
    }
}

/// Use this type to put together a cyclic block.
pub struct CyclicBuilder {
    spec: CyclicSpec,
}

impl CyclicBuilder {
    /// Starts from 1 mm/s, no holds and a single cycle.
    pub fn new(control: ControlMode, upper: f64, lower: f64) -> Self {
        Self {
            spec: CyclicSpec {
                control,
                upper,
                lower,
                speed: 1.0,
                speed_unit: SpeedUnit::MmPerSec,
                hold_upper_s: 0.0,
                hold_lower_s: 0.0,
                cycles: 1,
            },
        }
    }

    pub fn with_speed(mut self, speed: f64, unit: SpeedUnit) -> Self {
        self.spec.speed = speed;
        self.spec.speed_unit = unit;
        self
    }

    /// Dwell at the upper and lower bound, in seconds.
    pub fn with_holds(mut self, upper_s: f64, lower_s: f64) -> Self {
        self.spec.hold_upper_s = upper_s;
        self.spec.hold_lower_s = lower_s;
        self
    }

    pub fn with_cycles(mut self, cycles: u32) -> Self {
        self.spec.cycles = cycles;
        self
    }

    pub fn build(self) -> BlockSpec {
        BlockSpec::Cyclic(self.spec)
    }
}

/// Use this type to put together a ramp block.
pub struct RampBuilder {
    spec: RampSpec,
}

impl RampBuilder {
    pub fn new(control: ControlMode, target: f64) -> Self {
        Self {
            spec: RampSpec {
                control,
                target,
                speed: 1.0,
                speed_unit: SpeedUnit::MmPerSec,
                hold_s: 0.0,
            },
        }
    }

    pub fn with_speed(mut self, speed: f64, unit: SpeedUnit) -> Self {
        self.spec.speed = speed;
        self.spec.speed_unit = unit;
        self
    }

    pub fn with_hold(mut self, hold_s: f64) -> Self {
        self.spec.hold_s = hold_s;
        self
    }

    pub fn build(self) -> BlockSpec {
        BlockSpec::Ramp(self.spec)
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum SequenceError {
    #[error("{0}")]
    Conversion(#[from] ConversionError),
    #[error("{0}")]
    Limit(#[from] LimitError),
    #[error("Upper bound ({upper:.2}) must be greater than lower bound ({lower:.2}).")]
    InvalidBounds { upper: f64, lower: f64 },
    #[error("A cyclic block needs at least one cycle.")]
    ZeroCycles,
    #[error("Pause duration must be a finite number greater than 0 s.")]
    NonPositivePause,
    #[error("Speed must be greater than 0.")]
    NonPositiveSpeed,
    #[error("Hold times must be finite and cannot be negative.")]
    NegativeHold,
    #[error("No block at position {index}, the sequence has {len} blocks.")]
    IndexOutOfRange { index: usize, len: usize },
}

/// Everything authoring needs besides the block itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuthoringContext {
    /// Geometry of the selected specimen, if any.
    pub geometry: Option<Geometry>,
    pub offsets: Offsets,
    pub limits: MachineLimits,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CyclicBlock {
    pub spec: CyclicSpec,
    pub upper_conv: f64,
    pub lower_conv: f64,
    pub base_unit: BaseUnit,
    pub speed_mm_s: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RampBlock {
    pub spec: RampSpec,
    pub target_conv: f64,
    pub base_unit: BaseUnit,
    pub speed_mm_s: f64,
}

/// An authored block, ready to be sent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TestBlock {
    Cyclic(CyclicBlock),
    Ramp(RampBlock),
    Pause(PauseSpec),
}

fn checked_speed(
    speed: f64,
    unit: SpeedUnit,
    geometry: Option<&Geometry>,
) -> Result<f64, SequenceError> {
    let speed_mm_s = convert_speed(speed, unit, geometry)?;
    if !(speed_mm_s > 0.0 && speed_mm_s.is_finite()) {
        return Err(SequenceError::NonPositiveSpeed);
    }
    Ok(speed_mm_s)
}

fn valid_hold(seconds: f64) -> bool {
    seconds >= 0.0 && seconds.is_finite()
}

impl TestBlock {
    /// Convert and limit-check a raw block.
    pub fn author(spec: &BlockSpec, ctx: &AuthoringContext) -> Result<Self, SequenceError> {
        let geometry = ctx.geometry.as_ref();

        match spec {
            BlockSpec::Cyclic(c) => {
                let speed_mm_s = checked_speed(c.speed, c.speed_unit, geometry)?;
                if !valid_hold(c.hold_upper_s) || !valid_hold(c.hold_lower_s) {
                    return Err(SequenceError::NegativeHold);
                }
                if c.cycles == 0 {
                    return Err(SequenceError::ZeroCycles);
                }
                if !(c.upper > c.lower) {
                    return Err(SequenceError::InvalidBounds {
                        upper: c.upper,
                        lower: c.lower,
                    });
                }

                let upper = convert_setpoint(c.upper, c.control, geometry)?;
                let lower = convert_setpoint(c.lower, c.control, geometry)?;
                validate(upper, &ctx.offsets, &ctx.limits)?;
                validate(lower, &ctx.offsets, &ctx.limits)?;

                Ok(TestBlock::Cyclic(CyclicBlock {
                    spec: *c,
                    upper_conv: upper.value,
                    lower_conv: lower.value,
                    base_unit: upper.unit,
                    speed_mm_s,
                }))
            }
            BlockSpec::Ramp(r) => {
                let speed_mm_s = checked_speed(r.speed, r.speed_unit, geometry)?;
                if !valid_hold(r.hold_s) {
                    return Err(SequenceError::NegativeHold);
                }

                let target = convert_setpoint(r.target, r.control, geometry)?;
                validate(target, &ctx.offsets, &ctx.limits)?;

                Ok(TestBlock::Ramp(RampBlock {
                    spec: *r,
                    target_conv: target.value,
                    base_unit: target.unit,
                    speed_mm_s,
                }))
            }
            BlockSpec::Pause(p) => {
                if !(p.duration_s > 0.0 && p.duration_s.is_finite()) {
                    return Err(SequenceError::NonPositivePause);
                }
                Ok(TestBlock::Pause(*p))
            }
        }
    }

    /// The raw input this block was authored from.
    pub fn spec(&self) -> BlockSpec {
        match self {
            TestBlock::Cyclic(c) => BlockSpec::Cyclic(c.spec),
            TestBlock::Ramp(r) => BlockSpec::Ramp(r.spec),
            TestBlock::Pause(p) => BlockSpec::Pause(*p),
        }
    }

    pub const fn is_pause(&self) -> bool {
        matches!(self, TestBlock::Pause(_))
    }

    /// Controller unit of the block, `None` for pauses.
    pub const fn base_unit(&self) -> Option<BaseUnit> {
        match self {
            TestBlock::Cyclic(c) => Some(c.base_unit),
            TestBlock::Ramp(r) => Some(r.base_unit),
            TestBlock::Pause(_) => None,
        }
    }

    /// Re-check the converted setpoints against limits and offsets that may
    /// have changed since the block was authored.
    pub fn check_limits(&self, offsets: &Offsets, limits: &MachineLimits) -> Result<(), LimitError> {
        match self {
            TestBlock::Cyclic(c) => {
                validate(Setpoint { value: c.upper_conv, unit: c.base_unit }, offsets, limits)?;
                validate(Setpoint { value: c.lower_conv, unit: c.base_unit }, offsets, limits)
            }
            TestBlock::Ramp(r) => validate(Setpoint { value: r.target_conv, unit: r.base_unit }, offsets, limits),
            TestBlock::Pause(_) => Ok(()),
        }
    }

    /// Encode the block for the controller using the current tare offsets.
    pub fn command(&self, offsets: &Offsets, scaling: &MechanicalScaling) -> Command {
        match self {
            TestBlock::Cyclic(c) => Command::StartCyclic(CyclicParams {
                mode: c.base_unit,
                upper: to_wire(c.upper_conv, c.base_unit, offsets, scaling),
                lower: to_wire(c.lower_conv, c.base_unit, offsets, scaling),
                speed_mm_s: c.speed_mm_s,
                hold_upper: seconds_to_millis(c.spec.hold_upper_s),
                hold_lower: seconds_to_millis(c.spec.hold_lower_s),
                cycles: c.spec.cycles,
            }),
            TestBlock::Ramp(r) => Command::ExecuteRamp(RampParams {
                mode: r.base_unit,
                target: to_wire(r.target_conv, r.base_unit, offsets, scaling),
                speed_mm_s: r.speed_mm_s,
                hold: seconds_to_millis(r.spec.hold_s),
            }),
            TestBlock::Pause(p) => Command::ExecutePause(seconds_to_millis(p.duration_s)),
        }
    }
}

/// Absolute setpoint in controller units: millimetres, or grams for force.
pub(crate) fn to_wire(
    converted: f64,
    unit: BaseUnit,
    offsets: &Offsets,
    scaling: &MechanicalScaling,
) -> f64 {
    match unit {
        BaseUnit::Millimeters => converted + offsets.displacement_offset_mm,
        BaseUnit::Newtons => scaling.newtons_to_grams(converted + offsets.load_offset_n),
    }
}

impl fmt::Display for TestBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestBlock::Cyclic(c) => write!(
                f,
                "{} Cycle [{:.2} ↔ {:.2} {}] @ {:.2} {}, {} cycles (Hold U/L: {:.1}s / {:.1}s)",
                c.spec.control,
                c.spec.lower,
                c.spec.upper,
                c.spec.control.unit_suffix(),
                c.spec.speed,
                c.spec.speed_unit,
                c.spec.cycles,
                c.spec.hold_upper_s,
                c.spec.hold_lower_s
            ),
            TestBlock::Ramp(r) => {
                write!(
                    f,
                    "Ramp to {:.2} {} @ {:.2} {}",
                    r.spec.target,
                    r.spec.control.unit_suffix(),
                    r.spec.speed,
                    r.spec.speed_unit
                )?;
                if r.spec.hold_s > 0.0 {
                    write!(f, ", Hold {:.1}s", r.spec.hold_s)?;
                }
                Ok(())
            }
            TestBlock::Pause(p) => write!(f, "Pause [{:.1} s]", p.duration_s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> AuthoringContext {
        AuthoringContext {
            geometry: Some(Geometry::new(50.0, 10.0)),
            offsets: Offsets::default(),
            limits: MachineLimits::default(),
        }
    }

    #[test]
    fn cyclic_displacement() {
        let spec = CyclicBuilder::new(ControlMode::Displacement, 5.0, 0.0)
            .with_speed(60.0, SpeedUnit::MmPerMin)
            .with_cycles(3)
            .build();
        let TestBlock::Cyclic(block) = TestBlock::author(&spec, &ctx()).unwrap() else {
            panic!("expected cyclic block");
        };
        assert_eq!(block.upper_conv, 5.0);
        assert_eq!(block.lower_conv, 0.0);
        assert_eq!(block.base_unit, BaseUnit::Millimeters);
        assert_eq!(block.speed_mm_s, 1.0);
    }

    #[test]
    fn cyclic_strain_and_stress() {
        let strain = CyclicBuilder::new(ControlMode::Strain, 10.0, 2.0).build();
        let TestBlock::Cyclic(block) = TestBlock::author(&strain, &ctx()).unwrap() else {
            panic!("expected cyclic block");
        };
        assert_eq!(block.upper_conv, 5.0);
        assert_eq!(block.lower_conv, 1.0);

        let stress = CyclicBuilder::new(ControlMode::Stress, 2.0, 1.0).build();
        let TestBlock::Cyclic(block) = TestBlock::author(&stress, &ctx()).unwrap() else {
            panic!("expected cyclic block");
        };
        assert_eq!(block.upper_conv, 20.0);
        assert_eq!(block.base_unit, BaseUnit::Newtons);
    }

    #[test]
    fn cyclic_bounds_must_be_ordered() {
        for (upper, lower) in [(1.0, 1.0), (0.0, 1.0), (-5.0, 5.0)] {
            let spec = CyclicBuilder::new(ControlMode::Displacement, upper, lower).build();
            assert!(matches!(
                TestBlock::author(&spec, &ctx()),
                Err(SequenceError::InvalidBounds { .. })
            ));
        }
    }

    #[test]
    fn cyclic_rejections() {
        let zero_cycles = CyclicBuilder::new(ControlMode::Displacement, 1.0, 0.0)
            .with_cycles(0)
            .build();
        assert_eq!(TestBlock::author(&zero_cycles, &ctx()), Err(SequenceError::ZeroCycles));

        let stopped = CyclicBuilder::new(ControlMode::Displacement, 1.0, 0.0)
            .with_speed(0.0, SpeedUnit::MmPerSec)
            .build();
        assert_eq!(TestBlock::author(&stopped, &ctx()), Err(SequenceError::NonPositiveSpeed));

        let holds = CyclicBuilder::new(ControlMode::Displacement, 1.0, 0.0)
            .with_holds(-1.0, 0.0)
            .build();
        assert_eq!(TestBlock::author(&holds, &ctx()), Err(SequenceError::NegativeHold));

        let beyond = CyclicBuilder::new(ControlMode::Displacement, 200.0, 0.0).build();
        assert!(matches!(TestBlock::author(&beyond, &ctx()), Err(SequenceError::Limit(_))));

        let below = CyclicBuilder::new(ControlMode::Displacement, 0.0, -200.0).build();
        assert!(matches!(TestBlock::author(&below, &ctx()), Err(SequenceError::Limit(_))));
    }

    #[test]
    fn non_finite_inputs_rejected() {
        let nan_target = RampBuilder::new(ControlMode::Displacement, f64::NAN).build();
        assert_eq!(
            TestBlock::author(&nan_target, &ctx()),
            Err(SequenceError::Limit(LimitError::NotFinite))
        );

        let nan_force = RampBuilder::new(ControlMode::Force, f64::NAN).build();
        assert!(TestBlock::author(&nan_force, &ctx()).is_err());

        let endless_hold = RampBuilder::new(ControlMode::Displacement, 1.0)
            .with_hold(f64::INFINITY)
            .build();
        assert_eq!(TestBlock::author(&endless_hold, &ctx()), Err(SequenceError::NegativeHold));

        let nan_hold = CyclicBuilder::new(ControlMode::Displacement, 1.0, 0.0)
            .with_holds(0.0, f64::NAN)
            .build();
        assert_eq!(TestBlock::author(&nan_hold, &ctx()), Err(SequenceError::NegativeHold));

        let endless_speed = RampBuilder::new(ControlMode::Displacement, 1.0)
            .with_speed(f64::INFINITY, SpeedUnit::MmPerSec)
            .build();
        assert_eq!(TestBlock::author(&endless_speed, &ctx()), Err(SequenceError::NonPositiveSpeed));

        assert_eq!(
            TestBlock::author(&BlockSpec::pause(f64::INFINITY), &ctx()),
            Err(SequenceError::NonPositivePause)
        );
    }

    #[test]
    fn toml_nan_target_rejected() {
        let spec: BlockSpec = toml::from_str(
            r#"
            type = "ramp"
            control = "force"
            target = nan
            speed = 1.0
            speed_unit = "mm/s"
            "#,
        )
        .unwrap();
        assert!(TestBlock::author(&spec, &ctx()).is_err());
    }

    #[test]
    fn limits_rechecked_against_new_zero() {
        let spec = RampBuilder::new(ControlMode::Displacement, 80.0).build();
        let block = TestBlock::author(&spec, &ctx()).unwrap();
        let limits = ctx().limits;
        assert!(block.check_limits(&Offsets::default(), &limits).is_ok());

        let shifted = Offsets {
            load_offset_n: 0.0,
            displacement_offset_mm: 120.0,
        };
        assert!(matches!(
            block.check_limits(&shifted, &limits),
            Err(LimitError::Displacement { .. })
        ));
        assert!(TestBlock::author(&BlockSpec::pause(1.0), &ctx())
            .unwrap()
            .check_limits(&shifted, &limits)
            .is_ok());
    }

    #[test]
    fn missing_geometry() {
        let no_specimen = AuthoringContext::default();

        let strain = CyclicBuilder::new(ControlMode::Strain, 1.0, 0.0).build();
        assert!(matches!(
            TestBlock::author(&strain, &no_specimen),
            Err(SequenceError::Conversion(ConversionError::MissingGaugeLength(_)))
        ));

        let relative_speed = RampBuilder::new(ControlMode::Displacement, 1.0)
            .with_speed(1.0, SpeedUnit::PercentPerMin)
            .build();
        assert!(TestBlock::author(&relative_speed, &no_specimen).is_err());

        let stress = RampBuilder::new(ControlMode::Stress, 1.0).build();
        let err = TestBlock::author(&stress, &no_specimen).unwrap_err();
        assert_eq!(err.to_string(), "Area must be > 0 to use Stress (MPa).");
    }

    #[test]
    fn force_limit_uses_offset() {
        let mut ctx = ctx();
        ctx.offsets.load_offset_n = 30.0;

        let ok = RampBuilder::new(ControlMode::Force, 70.0).build();
        assert!(TestBlock::author(&ok, &ctx).is_ok());

        let over = RampBuilder::new(ControlMode::Force, 70.5).build();
        assert!(matches!(
            TestBlock::author(&over, &ctx),
            Err(SequenceError::Limit(LimitError::Force { .. }))
        ));
    }

    #[test]
    fn pause_must_be_positive() {
        assert!(TestBlock::author(&BlockSpec::pause(0.5), &ctx()).is_ok());
        for bad in [0.0, -1.0, f64::NAN] {
            assert_eq!(
                TestBlock::author(&BlockSpec::pause(bad), &ctx()),
                Err(SequenceError::NonPositivePause)
            );
        }
    }

    #[test]
    fn commands_are_absolute() {
        let scaling = MechanicalScaling::default();
        let offsets = Offsets {
            load_offset_n: 9.81,
            displacement_offset_mm: 2.0,
        };

        let cyclic = CyclicBuilder::new(ControlMode::Displacement, 5.0, 1.0)
            .with_speed(0.5, SpeedUnit::MmPerSec)
            .with_holds(1.5, 0.25)
            .with_cycles(4)
            .build();
        let block = TestBlock::author(&cyclic, &ctx()).unwrap();
        assert_eq!(
            block.command(&offsets, &scaling).to_string(),
            "START_CYCLIC_TEST:MODE=DISP;UPPER=7.0000;LOWER=3.0000;SPEED=0.500;HOLD_U=1500;HOLD_L=250;CYCLES=4"
        );

        // 9.81 N relative plus 9.81 N offset is 2 kg.
        let ramp = RampBuilder::new(ControlMode::Force, 9.81).with_hold(2.0).build();
        let block = TestBlock::author(&ramp, &ctx()).unwrap();
        assert_eq!(
            block.command(&offsets, &scaling).to_string(),
            "EXECUTE_RAMP:MODE=FORCE;TARGET=2000.0000;SPEED=1.000;HOLD=2000"
        );

        let pause = TestBlock::author(&BlockSpec::pause(3.0), &ctx()).unwrap();
        assert_eq!(pause.command(&offsets, &scaling).to_string(), "EXECUTE_PAUSE:3000");
    }

    #[test]
    fn descriptions() {
        let cyclic = TestBlock::author(
            &CyclicBuilder::new(ControlMode::Displacement, 5.0, 0.0)
                .with_cycles(2)
                .build(),
            &ctx(),
        )
        .unwrap();
        assert_eq!(
            cyclic.to_string(),
            "Displacement (mm) Cycle [0.00 ↔ 5.00 mm] @ 1.00 mm/s, 2 cycles (Hold U/L: 0.0s / 0.0s)"
        );

        let ramp = TestBlock::author(
            &RampBuilder::new(ControlMode::Strain, 4.0).with_hold(1.0).build(),
            &ctx(),
        )
        .unwrap();
        assert_eq!(ramp.to_string(), "Ramp to 4.00 % @ 1.00 mm/s, Hold 1.0s");

        let pause = TestBlock::author(&BlockSpec::pause(2.0), &ctx()).unwrap();
        assert_eq!(pause.to_string(), "Pause [2.0 s]");
    }

    #[test]
    fn program_toml() {
        #[derive(Deserialize)]
        struct Program {
            blocks: Vec<BlockSpec>,
        }

        let program: Program = toml::from_str(
            r#"
            [[blocks]]
            type = "cyclic"
            control = "displacement"
            upper = 5.0
            lower = 0.0
            speed = 1.0
            speed_unit = "mm/s"
            cycles = 2

            [[blocks]]
            type = "pause"
            duration_s = 2.5

            [[blocks]]
            type = "ramp"
            control = "force"
            target = 10.0
            speed = 30.0
            speed_unit = "mm/min"
            hold_s = 1.0
            "#,
        )
        .unwrap();

        assert_eq!(program.blocks.len(), 3);
        assert_eq!(
            program.blocks[0],
            CyclicBuilder::new(ControlMode::Displacement, 5.0, 0.0)
                .with_cycles(2)
                .build()
        );
        assert_eq!(program.blocks[1], BlockSpec::pause(2.5));
        assert!(matches!(program.blocks[2], BlockSpec::Ramp(RampSpec { hold_s: 1.0, .. })));
    }
}
