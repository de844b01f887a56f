//! Blocking request/response channels to serial-connected devices.
//!
//! Every driver owns exactly one [`Transport`]. The contract is deliberately narrow:
//! write a frame, read up to N bytes (shorter on timeout), or read whatever arrives before the
//! channel goes quiet. Framing, checksums and retries live in the protocol layer.
//!
//! Implementations:
//! - [`SerialTransport`]: RS-232/USB serial ports via the `serialport` crate
//! - [`MockTransport`]: scripted responses and a write log for tests
//! - the firmware simulators in [`crate::sim`]

use crate::error::AppResult;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod mock;
pub mod serial;

pub use mock::MockTransport;
pub use serial::SerialTransport;

/// Connection parameters for one physical device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportSettings {
    /// Serial port path (e.g., "/dev/ttyUSB0", "COM3")
    pub path: String,
    /// Communication speed (e.g., 9600, 115200)
    pub baud_rate: u32,
    /// Per-read timeout
    pub timeout: Duration,
}

impl TransportSettings {
    /// Settings with the 1 second read timeout most of these devices expect.
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            timeout: Duration::from_secs(1),
        }
    }

    /// Override the per-read timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Half-duplex byte channel.
///
/// Reads never fail on timeout; they return whatever arrived, possibly nothing. Callers decide
/// whether an empty read is an error.
pub trait Transport {
    /// Write a complete frame.
    fn write(&mut self, bytes: &[u8]) -> AppResult<()>;

    /// Read up to `max_len` bytes, returning early on timeout.
    fn read(&mut self, max_len: usize) -> AppResult<Vec<u8>>;

    /// Read until the line goes quiet for one timeout period.
    fn read_until_timeout(&mut self) -> AppResult<Vec<u8>>;

    /// Release the underlying channel. Further I/O fails.
    fn close(&mut self) -> AppResult<()>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&mut self, bytes: &[u8]) -> AppResult<()> {
        (**self).write(bytes)
    }

    fn read(&mut self, max_len: usize) -> AppResult<Vec<u8>> {
        (**self).read(max_len)
    }

    fn read_until_timeout(&mut self) -> AppResult<Vec<u8>> {
        (**self).read_until_timeout()
    }

    fn close(&mut self) -> AppResult<()> {
        (**self).close()
    }
}

/// Render bytes as space separated hex for trace output.
pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}
