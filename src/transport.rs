//! Byte transports the driver runs its transactions over.
//!
//! The driver never owns a device handle. It asks a [`Transport`] for exclusive use of a
//! [`Port`] for the length of one request/response exchange; serializing concurrent callers
//! and bounding reads in time are the transport's job.

use std::io;
use std::sync::Mutex;
use std::time::Duration;

use serialport::SerialPort;
use tracing::{debug, info};

use crate::error::{Result, ZifError};
use crate::frame::ByteSource;

/// A half-duplex byte channel.
pub trait Port: ByteSource {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()>;
}

/// Work done while the transport is held.
pub type Exchange<'a> = dyn FnMut(&mut dyn Port) -> Result<Vec<u8>> + 'a;

/// Grants one caller at a time access to the underlying port.
pub trait Transport: Send + Sync {
    fn transact(&self, exchange: &mut Exchange<'_>) -> Result<Vec<u8>>;
}

/// A serial line opened through the `serialport` crate.
pub struct SerialTransport {
    port: Mutex<Box<dyn SerialPort>>,
}

impl SerialTransport {
    /// Opens `name` at `baud_rate`, 8N1. `timeout` bounds every single-byte read.
    pub fn open(name: &str, baud_rate: u32, timeout: Duration) -> Result<Self> {
        let port = serialport::new(name, baud_rate)
            .timeout(timeout)
            .open()
            .map_err(|e| ZifError::config(format!("failed to open port '{name}': {e}")))?;
        info!(port = name, baud_rate, "opened serial port");
        Ok(Self {
            port: Mutex::new(port),
        })
    }
}

impl Transport for SerialTransport {
    fn transact(&self, exchange: &mut Exchange<'_>) -> Result<Vec<u8>> {
        // Port stays usable after a panicking caller; leftover bytes get resynced.
        let mut guard = self
            .port
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut port = SerialLine(&mut **guard);
        exchange(&mut port)
    }
}

/// Adapts a `serialport` handle to [`Port`].
pub struct SerialLine<'a>(pub &'a mut dyn SerialPort);

impl ByteSource for SerialLine<'_> {
    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        let mut buf = [0u8; 1];
        loop {
            match self.0.read(&mut buf) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(buf[0])),
                Err(ref e) if e.kind() == io::ErrorKind::TimedOut => return Ok(None),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl Port for SerialLine<'_> {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.0.write_all(bytes)?;
        self.0.flush()
    }
}

/// Names of the serial ports present on this machine.
pub fn available_ports() -> Result<Vec<String>> {
    let ports = serialport::available_ports()
        .map_err(|e| ZifError::config(format!("could not enumerate serial ports: {e}")))?;
    debug!(count = ports.len(), "enumerated serial ports");
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}
