//! In-memory serial port for exercising the link loop in unit tests.

use heapless::{Deque, Vec};
use thiserror::Error;

const CAPACITY: usize = 256;

/// Emulated controller port.
///
/// Bytes queued with [`MockSerial::push_incoming`] are handed out by `read`,
/// everything written is captured for inspection.
pub struct MockSerial {
    /// Bytes written by the host.
    written: Vec<u8, CAPACITY>,
    /// Bytes waiting to be read by the host.
    incoming: Deque<u8, CAPACITY>,
    fail_writes: bool,
    fail_reads: bool,
    flushes: usize,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockSerialError {
    /// Simulated unplugged cable.
    #[error("device disconnected")]
    Disconnected,
    #[error("buffer overflow")]
    Overflow,
    /// Nothing to read right now.
    #[error("no data available")]
    WouldBlock,
}

impl embedded_io::Error for MockSerialError {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self {
            MockSerialError::Disconnected => embedded_io::ErrorKind::BrokenPipe,
            MockSerialError::Overflow => embedded_io::ErrorKind::OutOfMemory,
            MockSerialError::WouldBlock => embedded_io::ErrorKind::TimedOut,
        }
    }
}

impl embedded_io::ErrorType for MockSerial {
    type Error = MockSerialError;
}

impl embedded_io::Write for MockSerial {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        if self.fail_writes {
            return Err(MockSerialError::Disconnected);
        }
        if self.written.extend_from_slice(buf).is_err() {
            return Err(MockSerialError::Overflow);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        if self.fail_writes {
            return Err(MockSerialError::Disconnected);
        }
        self.flushes += 1;
        Ok(())
    }
}

impl embedded_io::Read for MockSerial {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if self.fail_reads {
            return Err(MockSerialError::Disconnected);
        }
        if self.incoming.is_empty() {
            return Err(MockSerialError::WouldBlock);
        }

        let mut count = 0;
        for slot in buf.iter_mut() {
            match self.incoming.pop_front() {
                Some(byte) => {
                    *slot = byte;
                    count += 1;
                }
                None => break,
            }
        }
        Ok(count)
    }
}

impl embedded_io::ReadReady for MockSerial {
    fn read_ready(&mut self) -> Result<bool, Self::Error> {
        if self.fail_reads {
            return Err(MockSerialError::Disconnected);
        }
        Ok(!self.incoming.is_empty())
    }
}

impl Default for MockSerial {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSerial {
    pub fn new() -> Self {
        Self {
            written: Vec::new(),
            incoming: Deque::new(),
            fail_writes: false,
            fail_reads: false,
            flushes: 0,
        }
    }

    /// Queue bytes as if the controller had sent them.
    pub fn push_incoming(&mut self, data: &[u8]) -> Result<(), MockSerialError> {
        if data.len() > self.incoming.capacity() - self.incoming.len() {
            return Err(MockSerialError::Overflow);
        }
        for &byte in data {
            self.incoming
                .push_back(byte)
                .map_err(|_| MockSerialError::Overflow)?;
        }
        Ok(())
    }

    pub fn written_data(&self) -> &[u8] {
        &self.written
    }

    /// Written data split into lines, terminators removed.
    pub fn written_lines(&self) -> std::vec::Vec<String> {
        String::from_utf8_lossy(&self.written)
            .split_terminator('\n')
            .map(str::to_string)
            .collect()
    }

    pub fn clear_written_data(&mut self) {
        self.written.clear();
    }

    pub fn flush_count(&self) -> usize {
        self.flushes
    }

    pub fn pending_incoming(&self) -> usize {
        self.incoming.len()
    }

    pub fn set_write_error(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    pub fn set_read_error(&mut self, fail: bool) {
        self.fail_reads = fail;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_io::{Error, Read, ReadReady, Write};

    #[test]
    fn test_write_capture() {
        let mut mock = MockSerial::new();
        mock.write_all(b"HOME\n").unwrap();
        mock.write_all(b"GET_DATA\n").unwrap();
        mock.flush().unwrap();

        assert_eq!(mock.written_lines(), vec!["HOME", "GET_DATA"]);
        assert_eq!(mock.flush_count(), 1);

        mock.clear_written_data();
        assert!(mock.written_data().is_empty());
    }

    #[test]
    fn test_write_overflow() {
        let mut mock = MockSerial::new();
        let result = mock.write(&[b'x'; 300]);
        assert_eq!(result, Err(MockSerialError::Overflow));
        assert!(mock.written_data().is_empty());
    }

    #[test]
    fn test_read_in_chunks() {
        let mut mock = MockSerial::new();
        mock.push_incoming(b"D:1;2;3\n").unwrap();
        assert!(mock.read_ready().unwrap());

        let mut buf = [0u8; 4];
        assert_eq!(mock.read(&mut buf), Ok(4));
        assert_eq!(&buf, b"D:1;");
        assert_eq!(mock.pending_incoming(), 4);

        let mut rest = [0u8; 16];
        assert_eq!(mock.read(&mut rest), Ok(4));
        assert_eq!(&rest[..4], b"2;3\n");
        assert!(!mock.read_ready().unwrap());
    }

    #[test]
    fn test_read_when_empty() {
        let mut mock = MockSerial::new();
        let mut buf = [0u8; 4];
        let err = mock.read(&mut buf).unwrap_err();
        assert_eq!(err, MockSerialError::WouldBlock);
        assert_eq!(err.kind(), embedded_io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_incoming_appends() {
        let mut mock = MockSerial::new();
        mock.push_incoming(b"STATUS:").unwrap();
        mock.push_incoming(b"HOMED\n").unwrap();

        let mut buf = [0u8; 32];
        let n = mock.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"STATUS:HOMED\n");

        assert_eq!(mock.push_incoming(&[0u8; 300]), Err(MockSerialError::Overflow));
    }

    #[test]
    fn test_fault_injection() {
        let mut mock = MockSerial::new();
        mock.set_write_error(true);
        assert_eq!(mock.write(b"STOP\n"), Err(MockSerialError::Disconnected));
        assert!(mock.flush().is_err());
        mock.set_write_error(false);
        assert!(mock.write(b"STOP\n").is_ok());

        mock.push_incoming(b"x").unwrap();
        mock.set_read_error(true);
        assert!(mock.read_ready().is_err());
        let mut buf = [0u8; 1];
        assert_eq!(
            mock.read(&mut buf).unwrap_err().kind(),
            embedded_io::ErrorKind::BrokenPipe
        );
    }
}
