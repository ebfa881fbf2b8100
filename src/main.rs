//! # tensile-rig
//!
//! Operator front end for the tensile/compression rig.
//!
//! ```bash
//! # List serial ports
//! tensile-rig ports
//!
//! # Estimate how long a program takes
//! tensile-rig estimate --program fatigue.toml --gauge 50 --area 4
//!
//! # Home, run the program on a new specimen and autosave the data
//! tensile-rig -v run --program fatigue.toml --specimen S1 --gauge 50 --area 4 --out results
//!
//! # Calibrate the 50 N load cell
//! tensile-rig calibrate --cell 50N
//! ```

use std::{
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use inquire::{Confirm, Select};
use log::info;

use tensile_rig::{
    block::AuthoringContext,
    calibration::{default_file_name, CalibrationTable},
    config::{ProgramFile, RigConfig},
    estimate::estimate_from,
    export::CsvExporter,
    port,
    sequence::Sequence,
    session::{Notification, Session},
    transport::{LinkEvent, Transport},
    units::Geometry,
};

/// How long homing may take before giving up.
const HOMING_TIMEOUT: Duration = Duration::from_secs(180);
/// How long to wait for the link worker to report the port open.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Tensile rig command and sequencing tool
#[derive(Parser)]
#[command(name = "tensile-rig")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity level (-v for info, -vv for debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Rig configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available serial ports
    Ports,

    /// Print a program and its estimated duration
    Estimate {
        /// Program file (TOML)
        #[arg(short, long)]
        program: PathBuf,

        /// Gauge length in mm, needed for % units
        #[arg(long)]
        gauge: Option<f64>,

        /// Cross-section in mm², needed for MPa units
        #[arg(long)]
        area: Option<f64>,

        /// Crosshead position the program starts from, in mm
        #[arg(long, default_value = "0")]
        start_mm: f64,
    },

    /// Home the rig and run a program on a specimen
    Run {
        /// Program file (TOML)
        #[arg(short, long)]
        program: PathBuf,

        /// Specimen name
        #[arg(short, long)]
        specimen: String,

        /// Gauge length in mm
        #[arg(long)]
        gauge: f64,

        /// Cross-section in mm²
        #[arg(long)]
        area: f64,

        /// Serial port, prompted for when absent
        #[arg(long)]
        port: Option<String>,

        /// Directory for the autosaved data
        #[arg(short, long, default_value = ".")]
        out: PathBuf,
    },

    /// Calibrate a load cell interactively
    Calibrate {
        /// Load cell name, e.g. 50N
        #[arg(long)]
        cell: String,

        /// Serial port, prompted for when absent
        #[arg(long)]
        port: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let config = match &cli.config {
        Some(path) => RigConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => RigConfig::default(),
    };

    match cli.command {
        Commands::Ports => run_ports(),
        Commands::Estimate {
            program,
            gauge,
            area,
            start_mm,
        } => run_estimate(&config, &program, gauge, area, start_mm),
        Commands::Run {
            program,
            specimen,
            gauge,
            area,
            port,
            out,
        } => run_test(&config, &program, &specimen, gauge, area, port, out),
        Commands::Calibrate { cell, port } => run_calibrate(&config, &cell, port),
    }
}

fn run_ports() -> Result<()> {
    let ports = port::list_ports().context("Failed to enumerate serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for name in ports {
        println!("{}", name);
    }
    Ok(())
}

fn run_estimate(
    config: &RigConfig,
    program: &Path,
    gauge: Option<f64>,
    area: Option<f64>,
    start_mm: f64,
) -> Result<()> {
    let program = ProgramFile::from_file(program)
        .with_context(|| format!("Failed to load program {}", program.display()))?;
    let ctx = AuthoringContext {
        geometry: gauge.zip(area).map(|(g, a)| Geometry::new(g, a)),
        limits: config.limits,
        ..AuthoringContext::default()
    };

    if !program.blocks.is_empty() {
        let sequence = Sequence::from_specs(&program.blocks, &ctx).context("Invalid program")?;
        println!("{}", sequence);
        println!("Estimated duration: {}", estimate_from(&sequence, start_mm));
    }
    if let Some(spec) = &program.monotonic {
        let test = tensile_rig::monotonic::MonotonicTest::author(spec, &ctx)
            .context("Invalid monotonic test")?;
        println!("{}", test.description());
    }
    Ok(())
}

fn calibration_table(config: &RigConfig) -> Result<CalibrationTable> {
    match &config.calibration_file {
        Some(path) => CalibrationTable::load_or_default(path)
            .with_context(|| format!("Failed to load calibration table {}", path.display())),
        None => Ok(CalibrationTable::default()),
    }
}

fn pick_port(config: &RigConfig, port: Option<String>) -> Result<String> {
    if let Some(port) = port.or_else(|| config.link.port.clone()) {
        return Ok(port);
    }
    let ports = port::list_ports().context("Failed to enumerate serial ports")?;
    if ports.is_empty() {
        bail!("No serial ports found");
    }
    Select::new("Select a serial port:", ports)
        .prompt()
        .context("Failed to select port")
}

/// Owns the link and forwards its events into the session.
struct Link {
    transport: Transport,
    events: Receiver<LinkEvent>,
    poll_interval: Duration,
    last_poll: Instant,
}

impl Link {
    fn open(config: &RigConfig, port: &str) -> Result<Self> {
        let mut transport = Transport::new(config.link.clone());
        let events = transport.subscribe();
        transport
            .connect(port)
            .with_context(|| format!("Failed to connect to {}", port))?;
        println!("Using port: {}", port);
        Ok(Self {
            transport,
            events,
            poll_interval: Duration::from_millis(config.link.poll_interval_ms),
            last_poll: Instant::now(),
        })
    }

    /// Feed events to the session until `done` accepts a notification.
    fn pump(
        &mut self,
        session: &mut Session,
        timeout: Option<Duration>,
        done: impl FnMut(&Notification) -> bool,
    ) -> Result<()> {
        if !self.wait(session, timeout, done)? {
            bail!("Timed out waiting for the controller");
        }
        Ok(())
    }

    /// Feed events to the session for `duration`. Losing the link is still an error.
    fn drain(&mut self, session: &mut Session, duration: Duration) -> Result<()> {
        self.wait(session, Some(duration), |_| false).map(|_| ())
    }

    /// Returns `false` when `timeout` ran out first.
    fn wait(
        &mut self,
        session: &mut Session,
        timeout: Option<Duration>,
        mut done: impl FnMut(&Notification) -> bool,
    ) -> Result<bool> {
        let started = Instant::now();
        loop {
            if timeout.is_some_and(|t| started.elapsed() > t) {
                return Ok(false);
            }
            if self.last_poll.elapsed() >= self.poll_interval {
                session.poll(&mut self.transport);
                self.last_poll = Instant::now();
            }

            let event = match self.events.recv_timeout(self.poll_interval) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => bail!("Link worker went away"),
            };
            for notification in session.handle_link_event(event, &mut self.transport) {
                report(&notification);
                if done(&notification) {
                    return Ok(true);
                }
                if let Notification::Disconnected(reason) = &notification {
                    bail!(
                        "Controller disconnected: {}",
                        reason.as_deref().unwrap_or("closed")
                    );
                }
            }
        }
    }
}

fn report(notification: &Notification) {
    match notification {
        Notification::Status(text) => info!("Status: {}", text),
        Notification::Critical(cause) => eprintln!("CRITICAL: {}", cause),
        Notification::WriteFailed(command) => eprintln!("Write failed: {}", command),
        Notification::BlockStarted(index) => println!("Block {} started", index + 1),
        Notification::Homed => println!("Homed"),
        Notification::HomingCancelled => println!("Homing cancelled"),
        Notification::SequenceFinished => println!("Sequence finished"),
        Notification::TestEnded(cause) => println!("Test ended: {:?}", cause),
        Notification::Connected => println!("Connected"),
        Notification::Disconnected(_) => {}
    }
}

fn run_test(
    config: &RigConfig,
    program: &Path,
    specimen: &str,
    gauge: f64,
    area: f64,
    port: Option<String>,
    out: PathBuf,
) -> Result<()> {
    let program = ProgramFile::from_file(program)
        .with_context(|| format!("Failed to load program {}", program.display()))?;

    let mut session = Session::new(config, calibration_table(config)?)
        .with_recorder(Box::new(CsvExporter::new(&out)));
    session
        .specimens_mut()?
        .create(specimen, gauge, area)
        .context("Invalid specimen")?;
    if program.monotonic.is_none() {
        session.load_program(&program.blocks).context("Invalid program")?;
        println!("{}", session.sequence());
    }

    let port = pick_port(config, port)?;
    let mut link = Link::open(config, &port)?;
    link.pump(&mut session, Some(CONNECT_TIMEOUT), |n| *n == Notification::Connected)?;

    session.set_limits(config.limits, &mut link.transport)?;
    session.home(&mut link.transport)?;
    link.pump(&mut session, Some(HOMING_TIMEOUT), |n| {
        matches!(n, Notification::Homed | Notification::HomingCancelled)
    })?;
    if !session.is_homed() {
        bail!("Homing did not complete");
    }

    match &program.monotonic {
        Some(spec) => session.start_monotonic(spec, false, &mut link.transport)?,
        None => session.start_sequence(false, &mut link.transport)?,
    }
    link.pump(&mut session, None, |n| matches!(n, Notification::TestEnded(_)))?;

    let state = session.run_state();
    println!(
        "Finished after {:.1} s, cycle {}",
        state.elapsed_time_s, state.current_cycle
    );
    println!("Data saved to {}", out.display());
    Ok(())
}

fn run_calibrate(config: &RigConfig, cell: &str, port: Option<String>) -> Result<()> {
    let mut session = Session::new(config, calibration_table(config)?);
    session
        .calibration_table()
        .weight_g(cell)
        .with_context(|| format!("No calibration weight for {}", cell))?;

    let port = pick_port(config, port)?;
    let mut link = Link::open(config, &port)?;
    link.pump(&mut session, Some(CONNECT_TIMEOUT), |n| *n == Notification::Connected)?;

    loop {
        let outcome = session.calibration_step(cell, &mut link.transport)?;
        if outcome.calibrated_cell.is_some() {
            break;
        }
        let prompt = session
            .calibration_stepper()
            .prompt(session.calibration_table(), cell);
        let proceed = Confirm::new(&prompt)
            .with_default(true)
            .prompt()
            .map_err(|e| anyhow!("Calibration aborted: {}", e))?;
        if !proceed {
            println!("Calibration aborted");
            return Ok(());
        }
    }

    // Give the controller a moment to report the new factor.
    link.drain(&mut session, Duration::from_secs(2))
        .context("Link lost before the new factor was reported")?;
    println!(
        "Calibration complete. Save the reported factor as {}",
        default_file_name(cell, chrono::Local::now().date_naive())
    );
    Ok(())
}
