//! Host serial port adapter.
//!
//! Wraps a [`serialport::SerialPort`] so it can be driven through the
//! `embedded_io` traits the link loop is written against.

use std::{io, time::Duration};

use embedded_io::{ErrorKind, ErrorType, Read, ReadReady, Write};
use log::info;
use serialport::SerialPort;
use thiserror::Error;

use crate::error::Error;

/// Read timeout of the underlying port. Reads are only issued once bytes are
/// waiting, so this merely bounds a misbehaving driver.
const READ_TIMEOUT: Duration = Duration::from_millis(10);

pub struct PortWrapper(Box<dyn SerialPort>);

impl PortWrapper {
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self(port)
    }

    pub fn name(&self) -> Option<String> {
        self.0.name()
    }
}

/// Fault reported by the host serial driver.
#[derive(Error, Debug)]
#[error(transparent)]
pub struct IoError(#[from] io::Error);

impl From<serialport::Error> for IoError {
    fn from(e: serialport::Error) -> Self {
        Self(e.into())
    }
}

/// The link loop only tells timeouts apart from faults that close the link.
fn link_kind(kind: io::ErrorKind) -> ErrorKind {
    match kind {
        // A read with nothing to hand back.
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ErrorKind::TimedOut,
        io::ErrorKind::Interrupted => ErrorKind::Interrupted,
        io::ErrorKind::NotFound => ErrorKind::NotFound,
        io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
        io::ErrorKind::BrokenPipe => ErrorKind::BrokenPipe,
        io::ErrorKind::NotConnected => ErrorKind::NotConnected,
        io::ErrorKind::InvalidInput => ErrorKind::InvalidInput,
        io::ErrorKind::InvalidData => ErrorKind::InvalidData,
        _ => ErrorKind::Other,
    }
}

impl embedded_io::Error for IoError {
    fn kind(&self) -> ErrorKind {
        link_kind(self.0.kind())
    }
}

impl ErrorType for PortWrapper {
    type Error = IoError;
}

impl Read for PortWrapper {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, IoError> {
        Ok(io::Read::read(&mut self.0, buf)?)
    }
}

impl ReadReady for PortWrapper {
    fn read_ready(&mut self) -> Result<bool, IoError> {
        Ok(self.0.bytes_to_read()? > 0)
    }
}

impl Write for PortWrapper {
    fn write(&mut self, buf: &[u8]) -> Result<usize, IoError> {
        Ok(io::Write::write(&mut self.0, buf)?)
    }

    fn flush(&mut self) -> Result<(), IoError> {
        Ok(io::Write::flush(&mut self.0)?)
    }
}

/// Open `port` at `baud_rate`.
pub fn open(port: &str, baud_rate: u32) -> Result<PortWrapper, Error<IoError>> {
    let handle = serialport::new(port, baud_rate)
        .timeout(READ_TIMEOUT)
        .open()
        .map_err(|e| Error::Open(format!("{}: {}", port, e)))?;
    info!("Opened {} at {} baud", port, baud_rate);
    Ok(PortWrapper::new(handle))
}

/// Names of the serial ports present on this host.
pub fn list_ports() -> Result<Vec<String>, Error<IoError>> {
    let ports = serialport::available_ports().map_err(|e| Error::Open(e.to_string()))?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}
