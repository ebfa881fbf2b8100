//! Single-phase pull or push to a stop criterion.

use serde::{Deserialize, Serialize};

use crate::{
    block::{to_wire, AuthoringContext, SequenceError},
    command::{Command, MonotonicParams},
    limits::{validate, LimitError, MachineLimits, Offsets},
    scaling::MechanicalScaling,
    units::{convert_setpoint, convert_speed, BaseUnit, ControlMode, Setpoint, SpeedUnit},
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MonotonicSpec {
    pub speed: f64,
    pub speed_unit: SpeedUnit,
    /// Quantity the stop value is expressed in.
    pub criterion: ControlMode,
    pub stop_value: f64,
    /// Drive back to the start position once the test ends.
    #[serde(default)]
    pub return_to_start: bool,
}

/// An authored monotonic test.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonotonicTest {
    pub spec: MonotonicSpec,
    pub speed_mm_s: f64,
    pub stop_conv: f64,
    pub base_unit: BaseUnit,
}

impl MonotonicTest {
    pub fn author(spec: &MonotonicSpec, ctx: &AuthoringContext) -> Result<Self, SequenceError> {
        let geometry = ctx.geometry.as_ref();

        let speed_mm_s = convert_speed(spec.speed, spec.speed_unit, geometry)?;
        if !(speed_mm_s > 0.0 && speed_mm_s.is_finite()) {
            return Err(SequenceError::NonPositiveSpeed);
        }
        let stop = convert_setpoint(spec.stop_value, spec.criterion, geometry)?;
        validate(stop, &ctx.offsets, &ctx.limits)?;

        Ok(Self {
            spec: *spec,
            speed_mm_s,
            stop_conv: stop.value,
            base_unit: stop.unit,
        })
    }

    /// Re-check the stop value against the current zero and limits.
    pub fn check_limits(&self, offsets: &Offsets, limits: &MachineLimits) -> Result<(), LimitError> {
        let stop = Setpoint {
            value: self.stop_conv,
            unit: self.base_unit,
        };
        validate(stop, offsets, limits)
    }

    pub fn command(&self, offsets: &Offsets, scaling: &MechanicalScaling) -> Command {
        Command::StartTest(MonotonicParams {
            speed_mm_s: self.speed_mm_s,
            criterion: self.base_unit,
            stop_value: to_wire(self.stop_conv, self.base_unit, offsets, scaling),
        })
    }

    pub fn description(&self) -> String {
        format!(
            "Monotonic @ {:.2} {} until {:.2} {}",
            self.spec.speed,
            self.spec.speed_unit,
            self.spec.stop_value,
            self.spec.criterion.unit_suffix()
        )
    }
}
