//! Serial link to the rig controller.
//!
//! A dedicated thread owns the port and runs [`LinkLoop`]: it services the
//! emergency channel first, writes queued commands in FIFO order, then frames
//! whatever bytes have arrived into lines. Everything it observes is
//! broadcast to subscribers as [`LinkEvent`]s.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use embedded_io::{Error as _, ErrorKind, Read, ReadReady, Write};
use log::{debug, error, info, warn};

use crate::{
    command::{Command, CommandSink, EMERGENCY_STOP, LINE_TERMINATOR},
    config::LinkConfig,
    error::{Error, Result},
    port::{self, IoError},
};

/// Longest line kept; longer lines are dropped up to the next terminator.
pub const LINE_CAPACITY: usize = 256;
const READ_CHUNK: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    /// A complete inbound line, trimmed, never empty.
    Line(String),
    /// A command could not be written. The link stays up.
    WriteFailed(String),
    /// The link closed, with the fault that closed it if any.
    Disconnected { reason: Option<String> },
}

/// One end of the link, stepped by the worker thread.
pub struct LinkLoop<S> {
    interface: S,
    commands: Receiver<String>,
    emergency: Receiver<Vec<u8>>,
    line: heapless::Vec<u8, LINE_CAPACITY>,
    discarding: bool,
    drain_batch: usize,
}

impl<S> LinkLoop<S>
where
    S: Read + Write + ReadReady,
{
    pub fn new(
        interface: S,
        commands: Receiver<String>,
        emergency: Receiver<Vec<u8>>,
        drain_batch: usize,
    ) -> Self {
        Self {
            interface,
            commands,
            emergency,
            line: heapless::Vec::new(),
            discarding: false,
            drain_batch: drain_batch.max(1),
        }
    }

    fn write_frame(&mut self, frame: &[u8]) -> core::result::Result<(), S::Error> {
        self.interface.write_all(frame)?;
        self.interface.flush()
    }

    /// Run one iteration. Returns whether any bytes were received.
    ///
    /// Write failures are reported through `emit`; read failures end the loop.
    pub fn step(&mut self, emit: &mut impl FnMut(LinkEvent)) -> Result<bool, S::Error> {
        while let Ok(frame) = self.emergency.try_recv() {
            if let Err(e) = self.write_frame(&frame) {
                error!("Emergency stop could not be written: {:?}", e);
                emit(LinkEvent::WriteFailed(format!("emergency stop: {:?}", e.kind())));
            } else {
                warn!("Emergency stop sent");
            }
        }

        for _ in 0..self.drain_batch {
            let command = match self.commands.try_recv() {
                Ok(command) => command,
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            };
            let mut frame = command.clone().into_bytes();
            frame.push(LINE_TERMINATOR);
            match self.write_frame(&frame) {
                Ok(()) => debug!("-> {}", command),
                Err(e) => {
                    warn!("Could not write {}: {:?}", command, e);
                    emit(LinkEvent::WriteFailed(command));
                }
            }
        }

        if !self.interface.read_ready().map_err(Error::SerialError)? {
            return Ok(false);
        }
        let mut buf = [0u8; READ_CHUNK];
        let count = match self.interface.read(&mut buf) {
            Ok(count) => count,
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::Interrupted) => 0,
            Err(e) => return Err(Error::SerialError(e)),
        };
        for &byte in &buf[..count] {
            self.push_byte(byte, emit);
        }
        Ok(count > 0)
    }

    fn push_byte(&mut self, byte: u8, emit: &mut impl FnMut(LinkEvent)) {
        if byte == LINE_TERMINATOR {
            if !self.discarding {
                let text = String::from_utf8_lossy(&self.line);
                let text = text.trim();
                if !text.is_empty() {
                    debug!("<- {}", text);
                    emit(LinkEvent::Line(text.to_string()));
                }
            }
            self.line.clear();
            self.discarding = false;
        } else if !self.discarding && self.line.push(byte).is_err() {
            warn!("Inbound line longer than {} bytes dropped", LINE_CAPACITY);
            self.line.clear();
            self.discarding = true;
        }
    }
}

type Subscribers = Arc<Mutex<Vec<Sender<LinkEvent>>>>;

fn broadcast(subscribers: &Subscribers, event: LinkEvent) {
    if let Ok(mut subscribers) = subscribers.lock() {
        subscribers.retain(|s| s.send(event.clone()).is_ok());
    }
}

struct Worker {
    commands: Sender<String>,
    emergency: Sender<Vec<u8>>,
    shutdown: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Owner of the link worker thread.
pub struct Transport {
    config: LinkConfig,
    subscribers: Subscribers,
    worker: Option<Worker>,
}

impl Transport {
    pub fn new(config: LinkConfig) -> Self {
        Self {
            config,
            subscribers: Arc::new(Mutex::new(Vec::new())),
            worker: None,
        }
    }

    /// Open a serial port and start the link on it.
    pub fn connect(&mut self, port: &str) -> Result<(), IoError> {
        let interface = port::open(port, self.config.baud_rate)?;
        self.attach(interface)
    }

    /// Start the link on an already open interface.
    pub fn attach<S>(&mut self, interface: S) -> Result<(), S::Error>
    where
        S: Read + Write + ReadReady + Send + 'static,
    {
        self.disconnect();

        let (commands, command_rx) = unbounded();
        let (emergency, emergency_rx) = unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));
        let running = Arc::new(AtomicBool::new(true));

        let mut link = LinkLoop::new(interface, command_rx, emergency_rx, self.config.drain_batch);
        let idle = Duration::from_millis(self.config.idle_interval_ms);
        let subscribers = Arc::clone(&self.subscribers);
        let stop = Arc::clone(&shutdown);
        let alive = Arc::clone(&running);

        let handle = thread::Builder::new()
            .name("rig-link".into())
            .spawn(move || {
                broadcast(&subscribers, LinkEvent::Connected);
                let reason = loop {
                    if stop.load(Ordering::Acquire) {
                        break None;
                    }
                    match link.step(&mut |event| broadcast(&subscribers, event)) {
                        Ok(true) => {}
                        Ok(false) => thread::sleep(idle),
                        Err(e) => {
                            error!("Link fault, closing port: {}", e);
                            break Some(e.to_string());
                        }
                    }
                };
                drop(link);
                alive.store(false, Ordering::Release);
                info!("Link closed");
                broadcast(&subscribers, LinkEvent::Disconnected { reason });
            })
            .map_err(|e| Error::Spawn(e.to_string()))?;

        self.worker = Some(Worker {
            commands,
            emergency,
            shutdown,
            running,
            handle,
        });
        Ok(())
    }

    /// Stop the worker and close the port. No-op when not connected.
    pub fn disconnect(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.shutdown.store(true, Ordering::Release);
            if worker.handle.join().is_err() {
                error!("Link worker panicked");
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|w| w.running.load(Ordering::Acquire))
    }

    /// Queue a raw command line. Never blocks.
    pub fn enqueue_command(&self, text: impl Into<String>) -> Result<(), IoError> {
        let worker = self.live_worker()?;
        worker
            .commands
            .send(text.into())
            .map_err(|_| Error::NotConnected)
    }

    /// Send a byte sequence ahead of all queued commands.
    pub fn send_emergency_bytes(&self, bytes: &[u8]) -> Result<(), IoError> {
        let worker = self.live_worker()?;
        worker
            .emergency
            .send(bytes.to_vec())
            .map_err(|_| Error::NotConnected)
    }

    /// Receive every [`LinkEvent`] from now on.
    pub fn subscribe(&self) -> Receiver<LinkEvent> {
        let (tx, rx) = unbounded();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    fn live_worker(&self) -> Result<&Worker, IoError> {
        match &self.worker {
            Some(worker) if worker.running.load(Ordering::Acquire) => Ok(worker),
            _ => Err(Error::NotConnected),
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl CommandSink for Transport {
    fn send_command(&mut self, command: &Command) {
        if let Err(e) = self.enqueue_command(command.to_string()) {
            warn!("Dropped {}: {}", command, e);
        }
    }

    fn send_emergency(&mut self) {
        if let Err(e) = self.send_emergency_bytes(EMERGENCY_STOP) {
            error!("Emergency stop not sent: {}", e);
        }
    }
}
