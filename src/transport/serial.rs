//! Serial port transport for RS-232/USB-Serial instruments.
//!
//! Wraps the `serialport` crate with the blocking semantics the drivers expect: a fixed-length
//! read returns early on timeout instead of failing, and `read_until_timeout` drains the line
//! until it goes quiet.

use super::{Transport, TransportSettings};
use crate::error::{AppResult, FluidicsError};
#[cfg(feature = "instrument_serial")]
use std::time::Duration;
#[cfg(feature = "instrument_serial")]
use tracing::{debug, trace};

#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;

/// Quiet period that ends `read_until_timeout` once some bytes have arrived.
#[cfg(feature = "instrument_serial")]
const INTER_FRAME_GAP: Duration = Duration::from_millis(20);

/// Blocking serial transport.
pub struct SerialTransport {
    settings: TransportSettings,
    #[cfg(feature = "instrument_serial")]
    port: Option<Box<dyn SerialPort>>,
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl SerialTransport {
    /// Open the port described by `settings` (8N1, no flow control).
    #[cfg(feature = "instrument_serial")]
    pub fn open(settings: &TransportSettings) -> AppResult<Self> {
        let port = serialport::new(&settings.path, settings.baud_rate)
            .timeout(settings.timeout)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(|e| FluidicsError::transport(&settings.path, format!("open failed: {e}")))?;

        debug!(
            port = %settings.path,
            baud = settings.baud_rate,
            timeout = ?settings.timeout,
            "Serial port opened"
        );

        Ok(Self {
            settings: settings.clone(),
            port: Some(port),
        })
    }

    /// Serial support was compiled out.
    #[cfg(not(feature = "instrument_serial"))]
    pub fn open(settings: &TransportSettings) -> AppResult<Self> {
        Err(FluidicsError::transport(
            &settings.path,
            "serial support not enabled. Rebuild with --features instrument_serial",
        ))
    }

    /// Connection parameters this transport was opened with.
    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    #[cfg(feature = "instrument_serial")]
    fn port_mut(&mut self) -> AppResult<&mut Box<dyn SerialPort>> {
        let path = &self.settings.path;
        self.port
            .as_mut()
            .ok_or_else(|| FluidicsError::transport(path, "port is closed"))
    }
}

#[cfg(feature = "instrument_serial")]
impl Transport for SerialTransport {
    fn write(&mut self, bytes: &[u8]) -> AppResult<()> {
        use std::io::Write;

        let path = self.settings.path.clone();
        let port = self.port_mut()?;
        port.write_all(bytes)
            .and_then(|_| port.flush())
            .map_err(|e| FluidicsError::transport(&path, format!("write failed: {e}")))?;
        trace!(port = %path, len = bytes.len(), "Serial write");
        Ok(())
    }

    fn read(&mut self, max_len: usize) -> AppResult<Vec<u8>> {
        use std::io::{ErrorKind, Read};

        let path = self.settings.path.clone();
        let port = self.port_mut()?;
        let mut buffer = vec![0u8; max_len];
        let mut filled = 0;

        while filled < max_len {
            match port.read(&mut buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::TimedOut => break,
                Err(e) => {
                    return Err(FluidicsError::transport(&path, format!("read failed: {e}")));
                }
            }
        }

        buffer.truncate(filled);
        trace!(port = %path, len = filled, "Serial read");
        Ok(buffer)
    }

    fn read_until_timeout(&mut self) -> AppResult<Vec<u8>> {
        use std::io::{ErrorKind, Read};

        let path = self.settings.path.clone();
        let port = self.port_mut()?;
        let mut response = Vec::new();
        let mut chunk = [0u8; 256];

        loop {
            match port.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    response.extend_from_slice(&chunk[..n]);
                    if port.bytes_to_read().unwrap_or(0) == 0 {
                        std::thread::sleep(INTER_FRAME_GAP);
                        if port.bytes_to_read().unwrap_or(0) == 0 {
                            break;
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::TimedOut => break,
                Err(e) => {
                    return Err(FluidicsError::transport(&path, format!("read failed: {e}")));
                }
            }
        }

        trace!(port = %path, len = response.len(), "Serial drain");
        Ok(response)
    }

    fn close(&mut self) -> AppResult<()> {
        if self.port.take().is_some() {
            debug!(port = %self.settings.path, "Serial port closed");
        }
        Ok(())
    }
}

#[cfg(not(feature = "instrument_serial"))]
impl Transport for SerialTransport {
    fn write(&mut self, _bytes: &[u8]) -> AppResult<()> {
        Err(FluidicsError::transport(&self.settings.path, "serial support not enabled"))
    }

    fn read(&mut self, _max_len: usize) -> AppResult<Vec<u8>> {
        Err(FluidicsError::transport(&self.settings.path, "serial support not enabled"))
    }

    fn read_until_timeout(&mut self) -> AppResult<Vec<u8>> {
        Err(FluidicsError::transport(&self.settings.path, "serial support not enabled"))
    }

    fn close(&mut self) -> AppResult<()> {
        Ok(())
    }
}
