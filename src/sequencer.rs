//! Test execution state machine.
//!
//! [`Sequencer`] is a pure transition function: it is fed [`Event`]s in
//! arrival order and answers with the [`Action`]s the caller must carry out.
//! It never touches the serial link itself and never advances on a timer.
//! A block only ends when the controller says so.
//!
//! ```text
//! Idle -> Running(0) -> Running(1) -> ... -> Running(N-1) -> Stopped
//!              \______________ Stopping ______________/
//! ```

use log::{info, warn};
use thiserror::Error;

use crate::{
    command::{Command, LinkMode},
    limits::{LimitError, MachineLimits, Offsets},
    monotonic::MonotonicTest,
    scaling::MechanicalScaling,
    sequence::Sequence,
    telemetry::{Reading, Status, StatusCode, TelemetrySample},
};

/// What is being run.
#[derive(Debug, Clone, PartialEq)]
pub enum Program {
    Sequence(Sequence),
    Monotonic(MonotonicTest),
}

impl Program {
    pub fn description(&self) -> String {
        match self {
            Program::Sequence(sequence) => sequence.description(),
            Program::Monotonic(test) => test.description(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Idle,
    Running { block_index: u32 },
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunState {
    pub status: RunStatus,
    pub current_cycle: u32,
    pub elapsed_time_s: f64,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            status: RunStatus::Idle,
            current_cycle: 0,
            elapsed_time_s: 0.0,
        }
    }
}

/// Data state of the specimen a test will write to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecimenCheck {
    pub has_data: bool,
    pub overwrite_confirmed: bool,
}

pub struct StartRequest {
    pub program: Program,
    pub offsets: Offsets,
    /// Limits every setpoint is re-checked against before anything is sent.
    pub limits: MachineLimits,
    pub scaling: MechanicalScaling,
    pub homed: bool,
    /// `None` when no specimen is selected.
    pub specimen: Option<SpecimenCheck>,
}

#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum StartError {
    #[error("A test is already in progress.")]
    NotIdle,
    #[error("Homing is required before starting a test.")]
    NotHomed,
    #[error("Select a specimen before starting.")]
    NoSpecimen,
    #[error("The specimen already has test data; confirm the overwrite first.")]
    OverwriteNotConfirmed,
    #[error("The sequence is empty.")]
    EmptySequence,
    #[error("The sequence cannot start with a pause.")]
    StartsWithPause,
    #[error("Block {block}: {source}")]
    Limit { block: usize, source: LimitError },
}

/// Why a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopCause {
    /// Last block completed.
    Finished,
    UserStop,
    /// Controller reported a limit or end-stop hit.
    SafetyFault(String),
    /// Controller ended the test on its own (completion or stop).
    Controller(String),
    /// Serial link went away mid-run.
    LinkLost,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Status(Status),
    Sample { reading: Reading, resistance_ohm: f64 },
    /// Operator pressed stop.
    UserStop,
    /// Local request to abort, acknowledged by the controller.
    Abort,
    LinkLost,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Send(Command),
    /// Fire the out-of-band kill switch.
    EmergencyStop,
    BlockStarted(u32),
    /// Samples of the ended run, emitted once per run.
    Persist(Vec<TelemetrySample>),
    Ended(StopCause),
}

struct ActiveRun {
    program: Program,
    offsets: Offsets,
    scaling: MechanicalScaling,
    samples: Vec<TelemetrySample>,
}

impl ActiveRun {
    fn return_to_start(&self) -> bool {
        matches!(&self.program, Program::Monotonic(t) if t.spec.return_to_start)
    }
}

#[derive(Default)]
pub struct Sequencer {
    state: RunState,
    run: Option<ActiveRun>,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state.status, RunStatus::Running { .. })
    }

    /// Whether a run is in progress, including a pending stop.
    pub fn is_active(&self) -> bool {
        matches!(self.state.status, RunStatus::Running { .. } | RunStatus::Stopping)
    }

    /// Samples recorded so far in the current run.
    pub fn samples(&self) -> &[TelemetrySample] {
        self.run.as_ref().map(|r| r.samples.as_slice()).unwrap_or(&[])
    }

    /// Return from `Stopped` to `Idle`.
    pub fn reset(&mut self) {
        if self.state.status == RunStatus::Stopped {
            self.state = RunState::default();
        }
    }

    /// Begin a run. Nothing is sent when the request is rejected.
    pub fn start(&mut self, request: StartRequest) -> Result<Vec<Action>, StartError> {
        if self.state.status != RunStatus::Idle {
            return Err(StartError::NotIdle);
        }
        if !request.homed {
            return Err(StartError::NotHomed);
        }
        let specimen = request.specimen.ok_or(StartError::NoSpecimen)?;
        if specimen.has_data && !specimen.overwrite_confirmed {
            return Err(StartError::OverwriteNotConfirmed);
        }

        let mut actions = Vec::new();
        match &request.program {
            Program::Sequence(sequence) => {
                let first = sequence.first().ok_or(StartError::EmptySequence)?;
                if first.is_pause() {
                    return Err(StartError::StartsWithPause);
                }
                // Zero and limits may have moved since the blocks were authored.
                for (index, block) in sequence.iter().enumerate() {
                    block
                        .check_limits(&request.offsets, &request.limits)
                        .map_err(|source| StartError::Limit {
                            block: index + 1,
                            source,
                        })?;
                }
                actions.push(Action::Send(Command::ResetTimer));
                actions.push(Action::Send(first.command(&request.offsets, &request.scaling)));
            }
            Program::Monotonic(test) => {
                test.check_limits(&request.offsets, &request.limits)
                    .map_err(|source| StartError::Limit { block: 1, source })?;
                actions.push(Action::Send(test.command(&request.offsets, &request.scaling)));
            }
        }
        actions.push(Action::Send(Command::SetMode(LinkMode::Streaming)));
        actions.push(Action::BlockStarted(0));

        info!("Test started: {}", request.program.description().replace('\n', "; "));
        self.state = RunState {
            status: RunStatus::Running { block_index: 0 },
            ..RunState::default()
        };
        self.run = Some(ActiveRun {
            program: request.program,
            offsets: request.offsets,
            scaling: request.scaling,
            samples: Vec::new(),
        });
        Ok(actions)
    }

    /// Feed one event and collect the resulting actions.
    pub fn handle(&mut self, event: Event) -> Vec<Action> {
        match event {
            Event::Sample {
                reading,
                resistance_ohm,
            } => {
                self.record(&reading, resistance_ohm);
                Vec::new()
            }
            Event::Status(status) => self.on_status(&status),
            Event::UserStop => self.on_user_stop(),
            Event::Abort => self.on_abort(),
            Event::LinkLost => {
                if self.is_active() {
                    warn!("Link lost during a test");
                    self.finish(StopCause::LinkLost, false)
                } else {
                    Vec::new()
                }
            }
        }
    }

    fn record(&mut self, reading: &Reading, resistance_ohm: f64) {
        let RunStatus::Running { block_index } = self.state.status else {
            return;
        };
        let Some(run) = self.run.as_mut() else {
            return;
        };
        self.state.current_cycle = reading.cycle;
        self.state.elapsed_time_s = reading.time_s;
        run.samples
            .push(TelemetrySample::new(reading, &run.offsets, block_index, resistance_ohm));
    }

    fn on_status(&mut self, status: &Status) -> Vec<Action> {
        match (self.state.status, status.code) {
            (RunStatus::Running { block_index }, StatusCode::BlockCompleted) => {
                self.advance(block_index)
            }
            (RunStatus::Running { .. } | RunStatus::Stopping, code) if code.is_safety_fault() => {
                self.finish(StopCause::SafetyFault(status.text.clone()), true)
            }
            (
                RunStatus::Running { .. } | RunStatus::Stopping,
                StatusCode::TestCompleted | StatusCode::StoppedByUser,
            ) => self.finish(StopCause::Controller(status.text.clone()), true),
            // Whatever the controller says after a local abort is its acknowledgement.
            (RunStatus::Stopping, StatusCode::BlockCompleted) => {
                self.finish(StopCause::Controller(status.text.clone()), true)
            }
            _ => Vec::new(),
        }
    }

    fn advance(&mut self, block_index: u32) -> Vec<Action> {
        let Some(run) = self.run.as_ref() else {
            return Vec::new();
        };
        let Program::Sequence(sequence) = &run.program else {
            // Monotonic tests end on their own status codes.
            return Vec::new();
        };

        let next = block_index + 1;
        match sequence.get(next as usize) {
            Some(block) => {
                info!("Block {} completed, starting block {}", block_index + 1, next + 1);
                let command = block.command(&run.offsets, &run.scaling);
                self.state.status = RunStatus::Running { block_index: next };
                vec![Action::Send(command), Action::BlockStarted(next)]
            }
            None => {
                info!("Sequence finished after {} blocks", next);
                self.finish(StopCause::Finished, true)
            }
        }
    }

    fn on_user_stop(&mut self) -> Vec<Action> {
        if !self.is_active() {
            return Vec::new();
        }
        info!("Test stopped by operator");
        let mut actions = vec![Action::EmergencyStop, Action::Send(Command::Stop)];
        actions.extend(self.finish(StopCause::UserStop, true));
        actions
    }

    fn on_abort(&mut self) -> Vec<Action> {
        if !self.is_running() {
            return Vec::new();
        }
        warn!("Aborting test, waiting for controller acknowledgement");
        self.state.status = RunStatus::Stopping;
        vec![Action::Send(Command::Stop)]
    }

    /// Enter `Stopped`, releasing the recorded samples exactly once.
    fn finish(&mut self, cause: StopCause, link_up: bool) -> Vec<Action> {
        self.state.status = RunStatus::Stopped;
        let Some(run) = self.run.take() else {
            return Vec::new();
        };

        let mut actions = Vec::new();
        if link_up {
            actions.push(Action::Send(Command::SetMode(LinkMode::Polling)));
        }
        let return_to_start = link_up && run.return_to_start();
        info!("Test ended ({:?}), {} samples recorded", cause, run.samples.len());
        actions.push(Action::Persist(run.samples));
        actions.push(Action::Ended(cause));
        if return_to_start {
            actions.push(Action::Send(Command::ReturnToStart));
        }
        actions
    }
}
