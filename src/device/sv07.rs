//! SV07 multi-port selector valve driver.
//!
//! Binary frame protocol, default 16 ports, bus address 0. Port changes block until the valve
//! reports idle, then wait the configured settle delay.
//!
//! ## Example
//!
//! ```no_run
//! use rust_fluidics::device::{PortSelector, Sv07Settings, Sv07Valve};
//! use rust_fluidics::transport::TransportSettings;
//!
//! # fn main() -> rust_fluidics::error::AppResult<()> {
//! let mut valve = Sv07Valve::open(
//!     &TransportSettings::new("/dev/ttyUSB0", 9600),
//!     Sv07Settings::default(),
//! )?;
//! valve.select_port(3)?;
//! # Ok(())
//! # }
//! ```

use crate::device::{settle, BinaryLink, Capability, DeviceHandle, PollPolicy, PortSelector};
use crate::error::{AppResult, FluidicsError};
use crate::transport::{SerialTransport, Transport, TransportSettings};
use std::time::Duration;
use tracing::{debug, info};

/// SV07 function codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sv07Opcode {
    /// Read the bus address
    QueryAddress,
    /// Read the current port
    QueryPosition,
    /// Read the firmware version
    QueryVersion,
    /// Move to a port (p1 = port number)
    ChangePort,
    /// Return to port 1
    Reset,
    /// Re-find the optical origin
    OriginReset,
    /// Stop immediately
    StrongStop,
}

impl Sv07Opcode {
    /// Wire value.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Sv07Opcode::QueryAddress => 0x20,
            Sv07Opcode::QueryPosition => 0x3E,
            Sv07Opcode::QueryVersion => 0x3F,
            Sv07Opcode::ChangePort => 0x44,
            Sv07Opcode::Reset => 0x45,
            Sv07Opcode::OriginReset => 0x4F,
            Sv07Opcode::StrongStop => 0x49,
        }
    }

    /// Reverse lookup from a wire value.
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        [
            Sv07Opcode::QueryAddress,
            Sv07Opcode::QueryPosition,
            Sv07Opcode::QueryVersion,
            Sv07Opcode::ChangePort,
            Sv07Opcode::Reset,
            Sv07Opcode::OriginReset,
            Sv07Opcode::StrongStop,
        ]
        .into_iter()
        .find(|op| op.code() == code)
    }
}

/// Driver options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sv07Settings {
    /// Bus address
    pub address: u8,
    /// Number of ports on the valve head
    pub ports: u8,
    /// Reject replies whose checksum does not match
    pub verify_checksum: bool,
    /// Motion-completion polling
    pub poll: PollPolicy,
    /// Extra wait after each completed move
    pub settle: Duration,
}

impl Default for Sv07Settings {
    fn default() -> Self {
        Self {
            address: 0,
            ports: 16,
            verify_checksum: true,
            poll: PollPolicy::default(),
            settle: Duration::ZERO,
        }
    }
}

impl Sv07Settings {
    /// Replace the polling policy.
    #[must_use]
    pub fn with_poll(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    /// Replace the port count.
    #[must_use]
    pub fn with_ports(mut self, ports: u8) -> Self {
        self.ports = ports;
        self
    }
}

/// SV07 selector valve.
#[derive(Debug)]
pub struct Sv07Valve<T> {
    link: BinaryLink<T>,
    ports: u8,
    settle: Duration,
    current_port: Option<u8>,
}

impl Sv07Valve<SerialTransport> {
    /// Open the valve on a serial port.
    pub fn open(transport: &TransportSettings, settings: Sv07Settings) -> AppResult<Self> {
        let mut valve = Self::new(SerialTransport::open(transport)?, settings)?;
        valve.link.handle_mut().set_connection(transport);
        info!(device = %valve.handle(), port = %transport.path, "SV07 connected");
        Ok(valve)
    }
}

impl<T: Transport> Sv07Valve<T> {
    /// Drive a valve over an already-open transport.
    pub fn new(transport: T, settings: Sv07Settings) -> AppResult<Self> {
        if settings.ports == 0 {
            return Err(FluidicsError::range("ports", 0u8, 1u8, u8::MAX));
        }
        let handle = DeviceHandle::new("SV07", settings.address, Capability::Valve);
        Ok(Self {
            link: BinaryLink::new(transport, handle, settings.verify_checksum, settings.poll),
            ports: settings.ports,
            settle: settings.settle,
            current_port: None,
        })
    }

    /// Device identity.
    pub fn handle(&self) -> &DeviceHandle {
        self.link.handle()
    }

    /// Underlying transport.
    pub fn transport(&self) -> &T {
        self.link.transport()
    }

    /// Mutable underlying transport.
    pub fn transport_mut(&mut self) -> &mut T {
        self.link.transport_mut()
    }

    fn command(&mut self, opcode: Sv07Opcode, param: u8) -> AppResult<u16> {
        let frame = self.link.frame(opcode.code()).with_byte(param);
        Ok(self.link.exchange(frame)?.word())
    }

    fn finish_move(&mut self, port: u8) -> AppResult<()> {
        self.link.wait_idle()?;
        settle(self.settle);
        self.current_port = Some(port);
        self.link.handle_mut().last_position = Some(u32::from(port));
        Ok(())
    }

    /// Return to port 1.
    pub fn reset(&mut self) -> AppResult<()> {
        self.command(Sv07Opcode::Reset, 0)?;
        self.finish_move(1)
    }

    /// Re-find the optical origin. Ends at port 1.
    pub fn origin_reset(&mut self) -> AppResult<()> {
        self.command(Sv07Opcode::OriginReset, 0)?;
        self.finish_move(1)
    }

    /// Port the valve reports it is on.
    pub fn query_port(&mut self) -> AppResult<u8> {
        let word = self.command(Sv07Opcode::QueryPosition, 0)?;
        let port = word.to_le_bytes()[0];
        self.link.handle_mut().last_position = Some(u32::from(port));
        Ok(port)
    }

    /// Firmware version word.
    pub fn query_version(&mut self) -> AppResult<u16> {
        self.command(Sv07Opcode::QueryVersion, 0)
    }

    /// Stop any motion immediately.
    pub fn stop(&mut self) -> AppResult<()> {
        self.command(Sv07Opcode::StrongStop, 0)?;
        self.current_port = None;
        Ok(())
    }

    /// Release the transport.
    pub fn close(&mut self) -> AppResult<()> {
        self.link.close()
    }
}

impl<T: Transport> PortSelector for Sv07Valve<T> {
    fn port_count(&self) -> u8 {
        self.ports
    }

    fn select_port(&mut self, port: u8) -> AppResult<()> {
        if !(1..=self.ports).contains(&port) {
            return Err(FluidicsError::range("port", port, 1u8, self.ports));
        }
        debug!(device = %self.handle(), port, "Selecting port");
        self.command(Sv07Opcode::ChangePort, port)?;
        self.finish_move(port)
    }

    fn current_port(&self) -> Option<u8> {
        self.current_port
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::binary::{checksum, BinaryFrame};
    use crate::transport::MockTransport;

    fn reply(status: u8, p1: u8) -> Vec<u8> {
        let mut bytes = vec![0xCC, 0x00, status, p1, 0x00, 0xDD, 0, 0];
        let [lo, hi] = checksum(&bytes[..6]).to_le_bytes();
        bytes[6] = lo;
        bytes[7] = hi;
        bytes
    }

    fn valve(responses: Vec<Vec<u8>>) -> Sv07Valve<MockTransport> {
        Sv07Valve::new(
            MockTransport::new().with_responses(responses),
            Sv07Settings::default().with_poll(PollPolicy::immediate()),
        )
        .unwrap()
    }

    #[test]
    fn select_port_sends_change_then_polls_until_idle() {
        let mut valve = valve(vec![reply(0x00, 0), reply(0xFE, 0), reply(0x00, 0)]);
        valve.select_port(3).unwrap();

        let writes = valve.transport().writes();
        assert_eq!(writes.len(), 3);
        assert_eq!(
            writes[0],
            BinaryFrame::new(0, 0x44).with_byte(3).encode().to_vec()
        );
        assert_eq!(writes[1][2], 0x4A);
        assert_eq!(valve.current_port(), Some(3));
        assert_eq!(valve.handle().last_position, Some(3));
    }

    #[test]
    fn out_of_range_port_writes_nothing() {
        let mut valve = valve(vec![]);
        for port in [0u8, 17, 255] {
            let err = valve.select_port(port).unwrap_err();
            assert!(matches!(err, FluidicsError::Range { .. }));
        }
        assert_eq!(valve.transport().write_count(), 0);
        assert_eq!(valve.current_port(), None);
    }

    #[test]
    fn transport_failure_while_polling_propagates() {
        let mut valve = valve(vec![reply(0x00, 0)]);
        // ack arrives, then the status poll gets no reply twice
        let err = valve.select_port(5).unwrap_err();
        assert!(matches!(err, FluidicsError::Transport { .. }));
        assert_eq!(valve.current_port(), None);
    }

    #[test]
    fn corrupted_reply_is_a_protocol_error() {
        let mut bad = reply(0x00, 0);
        bad[6] ^= 0xFF;
        let mut valve = valve(vec![bad]);
        let err = valve.select_port(2).unwrap_err();
        assert!(matches!(err, FluidicsError::Protocol { .. }));
    }

    #[test]
    fn query_port_reads_first_parameter_byte() {
        let mut valve = valve(vec![reply(0x00, 7)]);
        assert_eq!(valve.query_port().unwrap(), 7);
    }

    #[test]
    fn opcode_table_round_trips() {
        assert_eq!(Sv07Opcode::from_code(0x44), Some(Sv07Opcode::ChangePort));
        assert_eq!(Sv07Opcode::from_code(0x66), None);
    }

    #[test]
    fn zero_ports_is_rejected() {
        let result = Sv07Valve::new(MockTransport::new(), Sv07Settings::default().with_ports(0));
        assert!(result.is_err());
    }
}
