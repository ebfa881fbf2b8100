//! The operator-side view of the rig.
//!
//! [`Session`] consumes inbound lines in arrival order, runs them through the
//! decoder and the [`Sequencer`], and keeps everything the operator works
//! with: specimens, the program being authored, zero offsets, limits and the
//! calibration handshake. Outbound traffic goes through a [`CommandSink`].

use std::path::Path;

use log::{debug, error, info, warn};
use thiserror::Error;

use crate::{
    block::{AuthoringContext, BlockSpec, SequenceError},
    calibration::{rated_force_n, CalibrationError, CalibrationFile, CalibrationStepper, CalibrationTable, StepOutcome},
    command::{Command, CommandSink, LinkMode},
    config::RigConfig,
    export::{RecordSink, TestRecord},
    limits::{MachineLimits, Offsets},
    monotonic::{MonotonicSpec, MonotonicTest},
    scaling::MechanicalScaling,
    sequence::{Direction, Sequence},
    sequencer::{Action, Event, Program, RunState, Sequencer, SpecimenCheck, StartError, StartRequest, StopCause},
    specimen::{SpecimenError, SpecimenRegistry},
    telemetry::{decode, Frame, Reading, StatusCode, RESISTANCE_DISABLED},
    transport::LinkEvent,
};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Start(#[from] StartError),
    #[error(transparent)]
    Sequence(#[from] SequenceError),
    #[error(transparent)]
    Specimen(#[from] SpecimenError),
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
    #[error("No reading received yet.")]
    NoReading,
    #[error("Not available while a test is running.")]
    TestRunning,
    #[error("Speed must be greater than 0.")]
    InvalidSpeed,
}

/// Things the operator should be told about.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Connected,
    Disconnected(Option<String>),
    Homed,
    HomingCancelled,
    /// Any status line, verbatim.
    Status(String),
    WriteFailed(String),
    BlockStarted(u32),
    SequenceFinished,
    TestEnded(StopCause),
    /// Safety fault needing acknowledgement.
    Critical(String),
}

pub struct Session {
    scaling: MechanicalScaling,
    limits: MachineLimits,
    offsets: Offsets,
    specimens: SpecimenRegistry,
    sequence: Sequence,
    sequencer: Sequencer,
    calibration: CalibrationTable,
    stepper: CalibrationStepper,
    recorder: Option<Box<dyn RecordSink + Send>>,
    connected: bool,
    homed: bool,
    homing: bool,
    link_mode: LinkMode,
    latest: Option<Reading>,
    resistance_ohm: f64,
    critical_active: bool,
    /// Specimen and program of the run in progress.
    running: Option<(String, String)>,
}

impl Session {
    pub fn new(config: &RigConfig, calibration: CalibrationTable) -> Self {
        Self {
            scaling: config.mechanics,
            limits: config.limits,
            offsets: Offsets::default(),
            specimens: SpecimenRegistry::new(),
            sequence: Sequence::new(),
            sequencer: Sequencer::new(),
            calibration,
            stepper: CalibrationStepper::new(),
            recorder: None,
            connected: false,
            homed: false,
            homing: false,
            link_mode: LinkMode::Polling,
            latest: None,
            resistance_ohm: RESISTANCE_DISABLED,
            critical_active: false,
            running: None,
        }
    }

    /// Hand finished runs to `recorder` as well as to the specimen.
    pub fn with_recorder(mut self, recorder: Box<dyn RecordSink + Send>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn run_state(&self) -> &RunState {
        self.sequencer.state()
    }

    pub fn is_test_active(&self) -> bool {
        self.sequencer.is_active()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_homed(&self) -> bool {
        self.homed
    }

    pub fn is_homing(&self) -> bool {
        self.homing
    }

    pub fn link_mode(&self) -> LinkMode {
        self.link_mode
    }

    pub fn latest_reading(&self) -> Option<&Reading> {
        self.latest.as_ref()
    }

    pub fn resistance_ohm(&self) -> f64 {
        self.resistance_ohm
    }

    pub fn offsets(&self) -> &Offsets {
        &self.offsets
    }

    pub fn limits(&self) -> &MachineLimits {
        &self.limits
    }

    pub fn scaling(&self) -> &MechanicalScaling {
        &self.scaling
    }

    pub fn specimens(&self) -> &SpecimenRegistry {
        &self.specimens
    }

    /// Specimens can only be edited between runs, the active run owns its entry.
    pub fn specimens_mut(&mut self) -> Result<&mut SpecimenRegistry, SessionError> {
        self.idle()?;
        Ok(&mut self.specimens)
    }

    pub fn sequence(&self) -> &Sequence {
        &self.sequence
    }

    pub fn calibration_table(&self) -> &CalibrationTable {
        &self.calibration
    }

    pub fn calibration_stepper(&self) -> &CalibrationStepper {
        &self.stepper
    }

    pub fn critical_active(&self) -> bool {
        self.critical_active
    }

    /// Allow the next safety fault to raise a new critical alert.
    pub fn acknowledge_critical(&mut self) {
        self.critical_active = false;
    }

    /// Geometry of the selected specimen with the current offsets and limits.
    pub fn authoring_context(&self) -> AuthoringContext {
        AuthoringContext {
            geometry: self.specimens.selected().map(|s| s.geometry()),
            offsets: self.offsets,
            limits: self.limits,
        }
    }

    // Program editing

    pub fn add_block(&mut self, spec: &BlockSpec) -> Result<usize, SessionError> {
        let ctx = self.authoring_context();
        Ok(self.sequence.append(spec, &ctx)?)
    }

    pub fn replace_block(&mut self, index: usize, spec: &BlockSpec) -> Result<(), SessionError> {
        let ctx = self.authoring_context();
        Ok(self.sequence.replace(index, spec, &ctx)?)
    }

    pub fn remove_block(&mut self, index: usize) -> Result<(), SessionError> {
        self.sequence.remove(index)?;
        Ok(())
    }

    pub fn move_block(&mut self, index: usize, direction: Direction) -> Result<usize, SessionError> {
        Ok(self.sequence.move_block(index, direction)?)
    }

    pub fn clear_sequence(&mut self) {
        self.sequence.clear();
    }

    /// Replace the program with `specs`, keeping the old one if any block is rejected.
    pub fn load_program(&mut self, specs: &[BlockSpec]) -> Result<(), SessionError> {
        self.sequence = Sequence::from_specs(specs, &self.authoring_context())?;
        Ok(())
    }

    // Inbound

    /// Process one link event.
    pub fn handle_link_event(&mut self, event: LinkEvent, sink: &mut impl CommandSink) -> Vec<Notification> {
        match event {
            LinkEvent::Connected => {
                info!("Controller connected");
                self.connected = true;
                self.send(sink, Command::SetMode(LinkMode::Polling));
                vec![Notification::Connected]
            }
            LinkEvent::Line(line) => self.handle_line(&line, sink),
            LinkEvent::WriteFailed(command) => {
                warn!("Write failed: {}", command);
                vec![Notification::WriteFailed(command)]
            }
            LinkEvent::Disconnected { reason } => {
                info!("Controller disconnected");
                self.connected = false;
                self.homed = false;
                self.homing = false;
                let mut notifications = Vec::new();
                let actions = self.sequencer.handle(Event::LinkLost);
                self.apply(actions, sink, &mut notifications);
                notifications.push(Notification::Disconnected(reason));
                notifications
            }
        }
    }

    /// Process one inbound line.
    pub fn handle_line(&mut self, line: &str, sink: &mut impl CommandSink) -> Vec<Notification> {
        debug!("<< {}", line);
        let mut notifications = Vec::new();

        let frame = match decode(line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropped line {:?}: {}", line, e);
                return notifications;
            }
        };

        match frame {
            Frame::Status(status) => {
                notifications.push(Notification::Status(status.text.clone()));
                match status.code {
                    StatusCode::HomingCompleted => {
                        info!("Homing completed");
                        self.homed = true;
                        self.homing = false;
                        notifications.push(Notification::Homed);
                    }
                    StatusCode::StoppedByUser if self.homing => {
                        info!("Homing cancelled");
                        self.homing = false;
                        notifications.push(Notification::HomingCancelled);
                    }
                    code if code.is_safety_fault() => {
                        error!("Safety fault: {}", status.text);
                        if !self.critical_active {
                            self.critical_active = true;
                            notifications.push(Notification::Critical(status.text.clone()));
                        }
                    }
                    _ => {}
                }
                let actions = self.sequencer.handle(Event::Status(status));
                self.apply(actions, sink, &mut notifications);
            }
            Frame::Data(raw) => {
                let reading = raw.to_reading(&self.scaling);
                self.latest = Some(reading);
                let actions = self.sequencer.handle(Event::Sample {
                    reading,
                    resistance_ohm: self.resistance_ohm,
                });
                self.apply(actions, sink, &mut notifications);
            }
            Frame::Resistance(ohm) => self.resistance_ohm = ohm,
            Frame::Unrecognized => debug!("Unrecognized line {:?}", line),
        }
        notifications
    }

    fn send(&mut self, sink: &mut impl CommandSink, command: Command) {
        debug!(">> {}", command);
        if let Command::SetMode(mode) = command {
            self.link_mode = mode;
        }
        sink.send_command(&command);
    }

    fn apply(&mut self, actions: Vec<Action>, sink: &mut impl CommandSink, notifications: &mut Vec<Notification>) {
        for action in actions {
            match action {
                Action::Send(command) => self.send(sink, command),
                Action::EmergencyStop => {
                    debug!(">> !");
                    sink.send_emergency();
                }
                Action::BlockStarted(index) => notifications.push(Notification::BlockStarted(index)),
                Action::Persist(samples) => self.persist(samples),
                Action::Ended(cause) => {
                    if cause == StopCause::Finished {
                        notifications.push(Notification::SequenceFinished);
                    }
                    notifications.push(Notification::TestEnded(cause));
                }
            }
        }
    }

    fn persist(&mut self, samples: Vec<crate::telemetry::TelemetrySample>) {
        let Some((name, description)) = self.running.take() else {
            return;
        };
        let Some(specimen) = self.specimens.get(&name) else {
            warn!("Specimen {} is gone, {} samples not stored", name, samples.len());
            return;
        };
        let record = TestRecord {
            specimen_name: name.clone(),
            gauge_length_mm: specimen.gauge_length_mm,
            area_mm2: specimen.area_mm2,
            samples,
            sequence_description: description,
        };
        if let Some(recorder) = self.recorder.as_mut().filter(|_| !record.samples.is_empty()) {
            if let Err(e) = recorder.store(&record) {
                error!("Could not save test data for {}: {}", name, e);
            }
        }
        if let Err(e) = self.specimens.attach_data(&name, record.samples) {
            warn!("{}", e);
        }
    }

    // Test control

    /// Run the authored sequence on the selected specimen.
    pub fn start_sequence(&mut self, overwrite_confirmed: bool, sink: &mut impl CommandSink) -> Result<(), SessionError> {
        self.start(Program::Sequence(self.sequence.clone()), overwrite_confirmed, sink)
    }

    /// Run a single monotonic test on the selected specimen.
    pub fn start_monotonic(
        &mut self,
        spec: &MonotonicSpec,
        overwrite_confirmed: bool,
        sink: &mut impl CommandSink,
    ) -> Result<(), SessionError> {
        let test = MonotonicTest::author(spec, &self.authoring_context())?;
        self.start(Program::Monotonic(test), overwrite_confirmed, sink)
    }

    fn start(&mut self, program: Program, overwrite_confirmed: bool, sink: &mut impl CommandSink) -> Result<(), SessionError> {
        self.sequencer.reset();
        let selected = self.specimens.selected().map(|s| (s.name.clone(), s.has_data()));
        let description = program.description();

        let request = StartRequest {
            program,
            offsets: self.offsets,
            limits: self.limits,
            scaling: self.scaling,
            homed: self.homed,
            specimen: selected.as_ref().map(|(_, has_data)| SpecimenCheck {
                has_data: *has_data,
                overwrite_confirmed,
            }),
        };
        let actions = self.sequencer.start(request).inspect_err(|e| warn!("Start rejected: {}", e))?;

        if let Some((name, has_data)) = selected {
            if has_data {
                self.specimens.clear_data(&name)?;
            }
            self.running = Some((name, description));
        }
        let mut notifications = Vec::new();
        self.apply(actions, sink, &mut notifications);
        Ok(())
    }

    /// Operator stop: emergency byte, `STOP`, then the run ends locally.
    pub fn stop(&mut self, sink: &mut impl CommandSink) -> Vec<Notification> {
        let mut notifications = Vec::new();
        let actions = self.sequencer.handle(Event::UserStop);
        self.apply(actions, sink, &mut notifications);
        notifications
    }

    /// Ask the controller to stop and wait for it to confirm.
    pub fn abort(&mut self, sink: &mut impl CommandSink) {
        let mut notifications = Vec::new();
        let actions = self.sequencer.handle(Event::Abort);
        self.apply(actions, sink, &mut notifications);
    }

    // Manual control

    fn idle(&self) -> Result<(), SessionError> {
        if self.sequencer.is_active() {
            return Err(SessionError::TestRunning);
        }
        Ok(())
    }

    pub fn home(&mut self, sink: &mut impl CommandSink) -> Result<(), SessionError> {
        self.idle()?;
        self.homing = true;
        self.send(sink, Command::Home);
        Ok(())
    }

    pub fn jog_up(&mut self, speed_mm_s: f64, sink: &mut impl CommandSink) -> Result<(), SessionError> {
        self.jog(speed_mm_s, Command::JogUp, sink)
    }

    pub fn jog_down(&mut self, speed_mm_s: f64, sink: &mut impl CommandSink) -> Result<(), SessionError> {
        self.jog(speed_mm_s, Command::JogDown, sink)
    }

    fn jog(&mut self, speed_mm_s: f64, command: Command, sink: &mut impl CommandSink) -> Result<(), SessionError> {
        self.idle()?;
        if !(speed_mm_s > 0.0) {
            return Err(SessionError::InvalidSpeed);
        }
        self.send(sink, Command::SetSpeed(speed_mm_s));
        self.send(sink, command);
        Ok(())
    }

    pub fn stop_motion(&mut self, sink: &mut impl CommandSink) {
        self.send(sink, Command::Stop);
    }

    /// Request a sample. Only sent while connected in polling mode.
    pub fn poll(&mut self, sink: &mut impl CommandSink) -> bool {
        if !self.connected || self.link_mode != LinkMode::Polling {
            return false;
        }
        self.send(sink, Command::GetData);
        true
    }

    pub fn set_lcr_polling(&mut self, enabled: bool, sink: &mut impl CommandSink) {
        if enabled {
            self.send(sink, Command::EnableLcrPolling);
        } else {
            self.send(sink, Command::DisableLcrPolling);
            self.resistance_ohm = RESISTANCE_DISABLED;
        }
    }

    /// Take the current load as zero.
    pub fn zero_load(&mut self) -> Result<(), SessionError> {
        self.idle()?;
        let reading = self.latest.ok_or(SessionError::NoReading)?;
        self.offsets.load_offset_n = reading.load_n;
        info!("Load zeroed at {:.3} N", reading.load_n);
        Ok(())
    }

    /// Take the current position as zero.
    pub fn zero_displacement(&mut self) -> Result<(), SessionError> {
        self.idle()?;
        let reading = self.latest.ok_or(SessionError::NoReading)?;
        self.offsets.displacement_offset_mm = reading.displacement_mm;
        info!("Displacement zeroed at {:.4} mm", reading.displacement_mm);
        Ok(())
    }

    /// Store new machine limits and push them to the controller.
    pub fn set_limits(&mut self, limits: MachineLimits, sink: &mut impl CommandSink) -> Result<(), SessionError> {
        self.idle()?;
        self.limits = limits;
        info!(
            "Machine limits set to {} N, {} mm",
            limits.force_limit_n, limits.displacement_limit_mm
        );
        let command = Command::SetLimits {
            force_g: self.scaling.newtons_to_grams(limits.force_limit_n),
            displacement_mm: limits.displacement_limit_mm,
        };
        self.send(sink, command);
        Ok(())
    }

    fn limit_force_to_cell(&mut self, cell: &str, sink: &mut impl CommandSink) -> Result<(), SessionError> {
        if let Some(force_n) = rated_force_n(cell) {
            let limits = MachineLimits::new(force_n, self.limits.displacement_limit_mm);
            self.set_limits(limits, sink)?;
        }
        Ok(())
    }

    /// Advance the calibration handshake for `cell`.
    pub fn calibration_step(&mut self, cell: &str, sink: &mut impl CommandSink) -> Result<StepOutcome, SessionError> {
        self.idle()?;
        let outcome = self.stepper.advance(&self.calibration, cell)?;
        if let Some(command) = &outcome.command {
            self.send(sink, command.clone());
        }
        if let Some(cell) = &outcome.calibrated_cell {
            self.limit_force_to_cell(cell, sink)?;
        }
        Ok(outcome)
    }

    /// Restore a saved calibration. Returns the cell it was made for, if known.
    pub fn load_calibration_file(
        &mut self,
        path: impl AsRef<Path>,
        sink: &mut impl CommandSink,
    ) -> Result<Option<String>, SessionError> {
        let path = path.as_ref();
        let file = CalibrationFile::load(path)?;
        let command = file.set_scale_command()?;
        self.send(sink, command);
        let cell = file.cell_name(path);
        if let Some(cell) = &cell {
            self.limit_force_to_cell(cell, sink)?;
        }
        info!("Calibration loaded from {}", path.display());
        Ok(cell)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::{
        block::RampBuilder,
        limits::LimitError,
        sequencer::RunStatus,
        units::{ControlMode, SpeedUnit},
    };

    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<TestRecord>>>);

    impl RecordSink for Shared {
        fn store(&mut self, record: &TestRecord) -> Result<(), crate::export::ExportError> {
            self.0.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    fn session() -> Session {
        Session::new(&RigConfig::default(), CalibrationTable::default())
    }

    /// Connected, homed, with a selected specimen and a two-ramp program.
    fn ready(sent: &mut Vec<String>) -> Session {
        let mut s = session();
        s.handle_link_event(LinkEvent::Connected, sent);
        s.handle_line("STATUS:HOMED", sent);
        s.specimens_mut().unwrap().create("S1", 50.0, 10.0).unwrap();
        s.add_block(&RampBuilder::new(ControlMode::Displacement, 1.0).build()).unwrap();
        s.add_block(&RampBuilder::new(ControlMode::Displacement, 2.0).build()).unwrap();
        sent.clear();
        s
    }

    #[test]
    fn connect_switches_to_polling() {
        let mut s = session();
        let mut sent = Vec::new();
        assert!(!s.poll(&mut sent));

        let notes = s.handle_link_event(LinkEvent::Connected, &mut sent);
        assert_eq!(notes, vec![Notification::Connected]);
        assert!(s.poll(&mut sent));
        assert_eq!(sent, vec!["SET_MODE:POLLING", "GET_DATA"]);
    }

    #[test]
    fn homing_and_cancel() {
        let mut s = session();
        let mut sent = Vec::new();
        s.home(&mut sent).unwrap();
        assert!(s.is_homing());
        let notes = s.handle_line("STATUS:STOPPED_BY_USER", &mut sent);
        assert!(notes.contains(&Notification::HomingCancelled));
        assert!(!s.is_homing());
        assert!(!s.is_homed());

        s.home(&mut sent).unwrap();
        let notes = s.handle_line("STATUS:HOMING_COMPLETED", &mut sent);
        assert!(notes.contains(&Notification::Homed));
        assert!(s.is_homed());
        assert_eq!(sent, vec!["HOME", "HOME"]);
    }

    #[test]
    fn full_sequence_run() {
        let mut sent = Vec::new();
        let records = Shared::default();
        let mut s = ready(&mut sent).with_recorder(Box::new(records.clone()));

        s.start_sequence(false, &mut sent).unwrap();
        assert_eq!(
            sent,
            vec![
                "RESET_TIMER",
                "EXECUTE_RAMP:MODE=DISP;TARGET=1.0000;SPEED=1.000;HOLD=0",
                "SET_MODE:STREAMING",
            ]
        );
        assert!(!s.poll(&mut sent));

        s.handle_line("R:120.5", &mut sent);
        s.handle_line("D:500;2000;1000;0", &mut sent);
        s.handle_line("D:bad;line", &mut sent);
        let notes = s.handle_line("STATUS:BLOCK_COMPLETED", &mut sent);
        assert!(notes.contains(&Notification::BlockStarted(1)));
        assert_eq!(sent[3], "EXECUTE_RAMP:MODE=DISP;TARGET=2.0000;SPEED=1.000;HOLD=0");

        s.handle_line("D:510;4000;2000;0", &mut sent);
        let notes = s.handle_line("STATUS:BLOCK_COMPLETED", &mut sent);
        assert!(notes.contains(&Notification::SequenceFinished));
        assert!(notes.contains(&Notification::TestEnded(StopCause::Finished)));
        assert_eq!(sent.last().map(String::as_str), Some("SET_MODE:POLLING"));
        assert_eq!(s.run_state().status, RunStatus::Stopped);

        let data = s.specimens().get("S1").unwrap().test_data.clone().unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data[0].resistance_ohm, 120.5);
        assert_eq!(data[1].block_index, 1);

        let stored = records.0.lock().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].specimen_name, "S1");
        assert!(stored[0].sequence_description.starts_with("Block 1:"));
    }

    #[test]
    fn restart_needs_overwrite_confirmation() {
        let mut sent = Vec::new();
        let mut s = ready(&mut sent);
        s.start_sequence(false, &mut sent).unwrap();
        s.handle_line("D:500;2000;1000;0", &mut sent);
        s.stop(&mut sent);
        assert!(s.specimens().selected().unwrap().has_data());

        sent.clear();
        assert!(matches!(
            s.start_sequence(false, &mut sent),
            Err(SessionError::Start(StartError::OverwriteNotConfirmed))
        ));
        assert!(sent.is_empty());

        s.start_sequence(true, &mut sent).unwrap();
        assert!(!s.specimens().selected().unwrap().has_data());
        assert!(s.is_test_active());
    }

    #[test]
    fn user_stop_sends_emergency_first() {
        let mut sent = Vec::new();
        let mut s = ready(&mut sent);
        s.start_sequence(false, &mut sent).unwrap();
        sent.clear();

        let notes = s.stop(&mut sent);
        assert_eq!(sent, vec!["!", "STOP", "SET_MODE:POLLING"]);
        assert!(notes.contains(&Notification::TestEnded(StopCause::UserStop)));
    }

    #[test]
    fn start_rejected_without_homing() {
        let mut s = session();
        let mut sent = Vec::new();
        s.specimens_mut().unwrap().create("S1", 50.0, 10.0).unwrap();
        s.add_block(&RampBuilder::new(ControlMode::Displacement, 1.0).build()).unwrap();
        assert!(matches!(
            s.start_sequence(false, &mut sent),
            Err(SessionError::Start(StartError::NotHomed))
        ));
        assert!(sent.is_empty());
    }

    #[test]
    fn start_rechecks_limits_after_zeroing() {
        let mut sent = Vec::new();
        let mut s = session();
        s.handle_link_event(LinkEvent::Connected, &mut sent);
        s.handle_line("STATUS:HOMED", &mut sent);
        s.specimens_mut().unwrap().create("S1", 50.0, 10.0).unwrap();
        s.add_block(&RampBuilder::new(ControlMode::Displacement, 180.0).build()).unwrap();

        s.handle_line("D:0;1000000;0", &mut sent);
        s.zero_displacement().unwrap();
        sent.clear();
        assert!(matches!(
            s.start_sequence(false, &mut sent),
            Err(SessionError::Start(StartError::Limit {
                block: 1,
                source: LimitError::Displacement { .. },
            }))
        ));
        assert!(sent.is_empty());
        assert!(!s.is_test_active());

        s.handle_line("D:0;0;0", &mut sent);
        s.zero_displacement().unwrap();
        s.set_limits(MachineLimits::new(100.0, 150.0), &mut sent).unwrap();
        sent.clear();
        assert!(s.start_sequence(false, &mut sent).is_err());
        assert!(sent.is_empty());
    }

    #[test]
    fn specimens_locked_during_run() {
        let mut sent = Vec::new();
        let mut s = ready(&mut sent);
        s.start_sequence(false, &mut sent).unwrap();
        s.handle_line("D:500;2000;1000;0", &mut sent);

        assert!(matches!(s.specimens_mut(), Err(SessionError::TestRunning)));

        s.handle_line("STATUS:FORCE_LIMIT_HIT", &mut sent);
        assert!(!s.is_test_active());
        let data = s.specimens().get("S1").unwrap().test_data.clone().unwrap();
        assert_eq!(data.len(), 1);

        assert!(s.specimens_mut().unwrap().delete("S1").is_ok());
    }

    #[test]
    fn critical_alerts_are_coalesced() {
        let mut s = session();
        let mut sent = Vec::new();

        let critical = |notes: &[Notification]| {
            notes
                .iter()
                .filter(|n| matches!(n, Notification::Critical(_)))
                .count()
        };

        assert_eq!(critical(&s.handle_line("STATUS:FORCE_LIMIT_HIT", &mut sent)), 1);
        assert_eq!(critical(&s.handle_line("STATUS:TOP_HIT", &mut sent)), 0);
        assert!(s.critical_active());

        s.acknowledge_critical();
        assert_eq!(critical(&s.handle_line("STATUS:DISP_LIMIT_HIT", &mut sent)), 1);
    }

    #[test]
    fn limit_hit_during_run() {
        let mut sent = Vec::new();
        let mut s = ready(&mut sent);
        s.start_sequence(false, &mut sent).unwrap();
        s.handle_line("D:500;2000;1000;0", &mut sent);

        let notes = s.handle_line("STATUS:FORCE_LIMIT_HIT", &mut sent);
        assert!(notes.contains(&Notification::Critical("FORCE_LIMIT_HIT".into())));
        assert!(notes.contains(&Notification::TestEnded(StopCause::SafetyFault(
            "FORCE_LIMIT_HIT".into()
        ))));
        assert!(s.specimens().selected().unwrap().has_data());
    }

    #[test]
    fn link_loss_ends_run_silently() {
        let mut sent = Vec::new();
        let mut s = ready(&mut sent);
        s.start_sequence(false, &mut sent).unwrap();
        s.handle_line("D:500;2000;1000;0", &mut sent);
        sent.clear();

        let notes = s.handle_link_event(
            LinkEvent::Disconnected {
                reason: Some("unplugged".into()),
            },
            &mut sent,
        );
        assert!(sent.is_empty());
        assert!(notes.contains(&Notification::TestEnded(StopCause::LinkLost)));
        assert_eq!(notes.last(), Some(&Notification::Disconnected(Some("unplugged".into()))));
        assert!(!s.is_homed());
        assert!(s.specimens().selected().unwrap().has_data());
    }

    #[test]
    fn zeroing_uses_latest_reading() {
        let mut s = session();
        let mut sent = Vec::new();
        assert!(matches!(s.zero_load(), Err(SessionError::NoReading)));

        s.handle_line("D:1000;20000;500", &mut sent);
        s.zero_load().unwrap();
        s.zero_displacement().unwrap();
        assert!((s.offsets().load_offset_n - 9.81).abs() < 1e-9);
        assert!((s.offsets().displacement_offset_mm - 5.0873).abs() < 1e-9);

        // Authoring now checks limits against the shifted zero.
        s.set_limits(MachineLimits::new(100.0, 10.0), &mut sent).unwrap();
        assert!(s.add_block(&RampBuilder::new(ControlMode::Displacement, 5.0).build()).is_err());
        assert!(s.add_block(&RampBuilder::new(ControlMode::Displacement, 4.0).build()).is_ok());
    }

    #[test]
    fn limits_and_jog() {
        let mut s = session();
        let mut sent = Vec::new();
        s.set_limits(MachineLimits::new(10.0, 190.0), &mut sent).unwrap();
        s.jog_up(1.5, &mut sent).unwrap();
        s.jog_down(0.25, &mut sent).unwrap();
        assert!(matches!(s.jog_up(0.0, &mut sent), Err(SessionError::InvalidSpeed)));
        s.stop_motion(&mut sent);
        assert_eq!(
            sent,
            vec![
                "SET_LIMITS:FORCE_G=1019.37;DISP_MM=190.0000",
                "SET_SPEED:1.50",
                "JOG_UP",
                "SET_SPEED:0.25",
                "JOG_DOWN",
                "STOP",
            ]
        );
    }

    #[test]
    fn lcr_disable_resets_resistance() {
        let mut s = session();
        let mut sent = Vec::new();
        s.set_lcr_polling(true, &mut sent);
        s.handle_line("R:87.25", &mut sent);
        assert_eq!(s.resistance_ohm(), 87.25);
        s.set_lcr_polling(false, &mut sent);
        assert_eq!(s.resistance_ohm(), RESISTANCE_DISABLED);
        assert_eq!(sent, vec!["ENABLE_LCR_POLLING", "DISABLE_LCR_POLLING"]);
    }

    #[test]
    fn calibration_sets_force_limit() {
        let mut s = session();
        let mut sent = Vec::new();
        for _ in 0..3 {
            s.calibration_step("10N", &mut sent).unwrap();
        }
        assert!(s.calibration_stepper().ready_to_save());
        assert_eq!(s.limits().force_limit_n, 10.0);
        assert_eq!(
            sent,
            vec!["TARE", "CALIBRATE:398", "SET_LIMITS:FORCE_G=1019.37;DISP_MM=190.0000"]
        );
    }

    #[test]
    fn calibration_file_restores_scale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cal_50N_2024-01-02.json");
        std::fs::write(&path, r#"{"calibration_factor": -412.5}"#).unwrap();

        let mut s = session();
        let mut sent = Vec::new();
        let cell = s.load_calibration_file(&path, &mut sent).unwrap();
        assert_eq!(cell.as_deref(), Some("50N"));
        assert_eq!(sent[0], "SET_SCALE:-412.5");
        assert_eq!(s.limits().force_limit_n, 50.0);
    }

    #[test]
    fn monotonic_uses_specimen_geometry() {
        let mut sent = Vec::new();
        let mut s = ready(&mut sent);
        let spec = MonotonicSpec {
            speed: 10.0,
            speed_unit: SpeedUnit::PercentPerMin,
            criterion: ControlMode::Strain,
            stop_value: 4.0,
            return_to_start: false,
        };
        s.start_monotonic(&spec, false, &mut sent).unwrap();
        // 10 %/min of 50 mm is 5 mm/min; 4 % of 50 mm is 2 mm.
        assert_eq!(
            sent[0],
            "START_TEST:SPEED_MMS=0.083;CRITERION=DISP;STOP_VAL=2.000"
        );
        assert_eq!(sent[1], "SET_MODE:STREAMING");
    }

    #[test]
    fn manual_control_blocked_during_test() {
        let mut sent = Vec::new();
        let mut s = ready(&mut sent);
        s.start_sequence(false, &mut sent).unwrap();
        assert!(matches!(s.home(&mut sent), Err(SessionError::TestRunning)));
        assert!(matches!(s.jog_up(1.0, &mut sent), Err(SessionError::TestRunning)));
        assert!(matches!(s.zero_load(), Err(SessionError::TestRunning)));
    }
}
