//! Error types for the serial link to the rig controller.

use thiserror::Error;

pub type Result<T, I> = core::result::Result<T, Error<I>>;

/// Faults raised by the link run loop.
///
/// Any of these closes the port; reconnection is left to the operator.
#[derive(Error, Debug)]
pub enum Error<I: embedded_io::Error> {
    #[error("Serial communication error: {0:?}")]
    SerialError(I),
    #[error("Could not open serial port: {0}")]
    Open(String),
    #[error("Link is not connected")]
    NotConnected,
    #[error("Link worker could not be started: {0}")]
    Spawn(String),
}

impl<I: embedded_io::Error> Error<I> {
    /// The `embedded_io` classification of the underlying fault, if any.
    pub fn kind(&self) -> Option<embedded_io::ErrorKind> {
        match self {
            Error::SerialError(inner) => Some(inner.kind()),
            _ => None,
        }
    }
}
