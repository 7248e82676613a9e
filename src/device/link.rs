//! Byte links to the LED controller

use std::io::Write;
use std::time::Duration;

use serialport::SerialPort;

use crate::{Error, Result};

/// Default baud rate of the panel controller firmware
pub const DEFAULT_BAUD: u32 = 230_400;

/// Serial write timeout; a stuck controller must not wedge the worker
const SERIAL_TIMEOUT: Duration = Duration::from_millis(500);

/// Point-to-point byte sink for encoded frames
///
/// The link carries no framing, so each call writes exactly one frame.
pub trait ByteLink: Send {
    /// Write one encoded frame
    ///
    /// # Errors
    ///
    /// Returns error if the bytes could not be written
    fn write_frame(&mut self, bytes: &[u8]) -> std::io::Result<()>;

    /// Address for logs
    fn address(&self) -> &str;
}

/// Serial port connection to a microcontroller driving the strip
pub struct SerialLink {
    port: Box<dyn SerialPort>,
    path: String,
}

impl SerialLink {
    /// Open `path` at `baud`
    ///
    /// # Errors
    ///
    /// Returns `DeviceUnavailable` if the port cannot be opened
    pub fn open(path: &str, baud: u32) -> Result<Self> {
        let port = serialport::new(path, baud)
            .timeout(SERIAL_TIMEOUT)
            .open()
            .map_err(|e| Error::DeviceUnavailable {
                address: path.to_string(),
                reason: e.to_string(),
            })?;

        tracing::info!(path, baud, "serial link opened");

        Ok(Self {
            port,
            path: path.to_string(),
        })
    }
}

impl ByteLink for SerialLink {
    fn write_frame(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.port.write_all(bytes)?;
        self.port.flush()
    }

    fn address(&self) -> &str {
        &self.path
    }
}

/// Names of serial ports present on this machine
#[must_use]
pub fn available_ports() -> Vec<String> {
    match serialport::available_ports() {
        Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
        Err(e) => {
            tracing::debug!(error = %e, "failed to enumerate serial ports");
            Vec::new()
        }
    }
}
