//! Line-oriented transport abstraction
//!
//! The dispatcher only needs to write a buffer, read one delimited line with a
//! timeout, and drop stale input. Anything that can do that (a serial port, a
//! simulated device, a test spy) implements [`Transport`].

use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::serial::{clear_input, configure_port, open_port};
use super::{DispatchError, LINE_DELIMITER};

/// Polling step while waiting for bytes to arrive
const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Pause after the wake-up newline before flushing input
const WAKE_FLUSH_DELAY: Duration = Duration::from_millis(100);

/// A byte channel that reads delimited lines
pub trait Transport: Send {
    /// Write the whole buffer, returning the number of bytes written
    fn write(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Read one line ending in `delimiter`, waiting at most `timeout`.
    ///
    /// Returns the line without its delimiter, or `Ok(None)` if no complete
    /// line arrived in time. Bytes of an incomplete line are kept for the
    /// next call.
    fn read_until(&mut self, delimiter: u8, timeout: Duration) -> io::Result<Option<Vec<u8>>>;

    /// Discard any unread input, including buffered partial lines
    fn flush_input(&mut self) -> io::Result<()>;

    /// Release the underlying channel
    fn close(&mut self) -> io::Result<()>;

    /// Whether the channel is usable
    fn is_open(&self) -> bool;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        (**self).write(data)
    }

    fn read_until(&mut self, delimiter: u8, timeout: Duration) -> io::Result<Option<Vec<u8>>> {
        (**self).read_until(delimiter, timeout)
    }

    fn flush_input(&mut self) -> io::Result<()> {
        (**self).flush_input()
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }
}

/// Remove and return the first complete line in `buffer`
pub(crate) fn take_line(buffer: &mut Vec<u8>, delimiter: u8) -> Option<Vec<u8>> {
    let pos = buffer.iter().position(|&b| b == delimiter)?;
    let mut line: Vec<u8> = buffer.drain(..=pos).collect();
    line.pop();
    Some(line)
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "serial port not open")
}

/// Serial port implementing [`Transport`]
pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
    /// Bytes received but not yet returned as a line
    pending: Vec<u8>,
}

impl SerialTransport {
    /// Wrap an already opened port
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self {
            port: Some(port),
            pending: Vec::new(),
        }
    }

    /// Open and configure a port
    pub fn open(name: &str, baud_rate: u32, read_timeout: Duration) -> Result<Self, DispatchError> {
        let mut port = open_port(name, Some(baud_rate), read_timeout)?;
        configure_port(port.as_mut())?;
        clear_input(port.as_mut())?;
        info!("Connected to {}", name);
        Ok(Self::new(port))
    }

    /// Wait for the bridge to boot, nudge it with a bare newline and drop
    /// whatever it printed meanwhile
    pub fn wake(&mut self, settle: Duration) -> Result<(), DispatchError> {
        std::thread::sleep(settle);
        self.write(&[LINE_DELIMITER])?;
        std::thread::sleep(WAKE_FLUSH_DELAY);
        self.flush_input()?;
        Ok(())
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let port = self.port.as_mut().ok_or_else(not_connected)?;
        port.write_all(data)?;
        port.flush()?;
        Ok(data.len())
    }

    fn read_until(&mut self, delimiter: u8, timeout: Duration) -> io::Result<Option<Vec<u8>>> {
        let port = self.port.as_mut().ok_or_else(not_connected)?;
        let start = Instant::now();

        loop {
            if let Some(line) = take_line(&mut self.pending, delimiter) {
                return Ok(Some(line));
            }
            if start.elapsed() >= timeout {
                return Ok(None);
            }

            // Poll bytes_to_read() so a read never blocks past the deadline
            let available = port
                .bytes_to_read()
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
                as usize;
            if available == 0 {
                std::thread::sleep(POLL_INTERVAL);
                continue;
            }

            let mut buf = vec![0u8; available];
            match port.read(&mut buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "serial port closed by peer",
                    ))
                }
                Ok(n) => {
                    debug!("read {} bytes: {:?}", n, String::from_utf8_lossy(&buf[..n]));
                    self.pending.extend_from_slice(&buf[..n]);
                }
                Err(ref e)
                    if e.kind() == io::ErrorKind::TimedOut
                        || e.kind() == io::ErrorKind::WouldBlock =>
                {
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn flush_input(&mut self) -> io::Result<()> {
        self.pending.clear();
        let port = self.port.as_mut().ok_or_else(not_connected)?;
        port.clear(serialport::ClearBuffer::Input)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn close(&mut self) -> io::Result<()> {
        if self.port.take().is_some() {
            info!("Serial connection closed.");
        }
        self.pending.clear();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }
}
