//! SY08 syringe pump driver.
//!
//! Binary frame protocol, 5 mL syringe over 12000 plunger steps by default, speed 0..=600.
//!
//! Every aspirate/discharge reads the plunger position first and refuses moves that would leave
//! `[0, capacity]`. After the motion completes the position is read again so the handle always
//! reflects what the device reports.

use crate::device::{
    settle, BinaryLink, Capability, DeviceHandle, PollPolicy, PumpCapacity, Syringe,
};
use crate::error::{AppResult, FluidicsError};
use crate::transport::{SerialTransport, Transport, TransportSettings};
use std::time::Duration;
use tracing::{debug, info};

/// Highest accepted speed setting.
pub const MAX_SPEED: u32 = 600;

/// SY08 function codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sy08Opcode {
    /// Read the bus address
    QueryAddress,
    /// Read the microstep subdivision
    QuerySubdivision,
    /// Read the maximum speed
    QueryMaxSpeed,
    /// Read the firmware version
    QueryVersion,
    /// Read the plunger position (p1/p2, little-endian)
    QueryPosition,
    /// Set plunger speed
    SetSpeed,
    /// Draw a relative number of steps
    Aspirate,
    /// Push a relative number of steps
    Discharge,
    /// Move to an absolute step position
    SetPosition,
    /// Home the plunger
    Reset,
    /// Home the plunger ignoring the current state
    ForcedReset,
    /// Stop immediately
    StrongStop,
}

impl Sy08Opcode {
    const ALL: [Sy08Opcode; 12] = [
        Sy08Opcode::QueryAddress,
        Sy08Opcode::QuerySubdivision,
        Sy08Opcode::QueryMaxSpeed,
        Sy08Opcode::QueryVersion,
        Sy08Opcode::QueryPosition,
        Sy08Opcode::SetSpeed,
        Sy08Opcode::Aspirate,
        Sy08Opcode::Discharge,
        Sy08Opcode::SetPosition,
        Sy08Opcode::Reset,
        Sy08Opcode::ForcedReset,
        Sy08Opcode::StrongStop,
    ];

    /// Wire value.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Sy08Opcode::QueryAddress => 0x20,
            Sy08Opcode::QuerySubdivision => 0x25,
            Sy08Opcode::QueryMaxSpeed => 0x27,
            Sy08Opcode::QueryVersion => 0x3F,
            Sy08Opcode::QueryPosition => 0x66,
            Sy08Opcode::SetSpeed => 0x4B,
            Sy08Opcode::Aspirate => 0x4D,
            Sy08Opcode::Discharge => 0x42,
            Sy08Opcode::SetPosition => 0x4E,
            Sy08Opcode::Reset => 0x45,
            Sy08Opcode::ForcedReset => 0x4F,
            Sy08Opcode::StrongStop => 0x49,
        }
    }

    /// Reverse lookup from a wire value.
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.code() == code)
    }
}

/// Driver options.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sy08Settings {
    /// Bus address
    pub address: u8,
    /// Syringe volume and stroke
    pub capacity: PumpCapacity,
    /// Reject replies whose checksum does not match
    pub verify_checksum: bool,
    /// Motion-completion polling
    pub poll: PollPolicy,
    /// Extra wait after each completed move
    pub settle: Duration,
}

impl Default for Sy08Settings {
    fn default() -> Self {
        Self {
            address: 0,
            capacity: PumpCapacity::new(5.0, 12000),
            verify_checksum: true,
            poll: PollPolicy::default(),
            settle: Duration::ZERO,
        }
    }
}

impl Sy08Settings {
    /// Replace the polling policy.
    #[must_use]
    pub fn with_poll(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    /// Replace the syringe capacity.
    #[must_use]
    pub fn with_capacity(mut self, capacity: PumpCapacity) -> Self {
        self.capacity = capacity;
        self
    }
}

/// SY08 syringe pump.
#[derive(Debug)]
pub struct Sy08Pump<T> {
    link: BinaryLink<T>,
    capacity: PumpCapacity,
    settle: Duration,
    speed: Option<u32>,
}

impl Sy08Pump<SerialTransport> {
    /// Open the pump on a serial port.
    pub fn open(transport: &TransportSettings, settings: Sy08Settings) -> AppResult<Self> {
        let mut pump = Self::new(SerialTransport::open(transport)?, settings)?;
        pump.link.handle_mut().set_connection(transport);
        info!(device = %pump.handle(), port = %transport.path, "SY08 connected");
        Ok(pump)
    }
}

impl<T: Transport> Sy08Pump<T> {
    /// Drive a pump over an already-open transport.
    ///
    /// The stroke must fit the 16-bit position field.
    pub fn new(transport: T, settings: Sy08Settings) -> AppResult<Self> {
        let capacity = settings.capacity;
        if capacity.steps == 0 || capacity.steps > u32::from(u16::MAX) {
            return Err(FluidicsError::range(
                "capacity steps",
                capacity.steps,
                1u32,
                u16::MAX,
            ));
        }
        if !(capacity.volume.is_finite() && capacity.volume > 0.0) {
            return Err(FluidicsError::range(
                "capacity volume",
                capacity.volume,
                f64::MIN_POSITIVE,
                f64::MAX,
            ));
        }

        let handle = DeviceHandle::new("SY08", settings.address, Capability::Pump);
        Ok(Self {
            link: BinaryLink::new(transport, handle, settings.verify_checksum, settings.poll),
            capacity,
            settle: settings.settle,
            speed: None,
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

    /// Last speed set through this driver.
    pub fn speed(&self) -> Option<u32> {
        self.speed
    }

    fn command(&mut self, opcode: Sy08Opcode, param: u16) -> AppResult<u16> {
        let frame = self.link.frame(opcode.code()).with_word(param);
        Ok(self.link.exchange(frame)?.word())
    }

    fn complete_motion(&mut self) -> AppResult<u32> {
        self.link.wait_idle()?;
        settle(self.settle);
        self.query_position()
    }

    fn word(&self, quantity: &'static str, value: u32) -> AppResult<u16> {
        u16::try_from(value).map_err(|_| FluidicsError::range(quantity, value, 0u32, u16::MAX))
    }

    /// Home ignoring the current state.
    pub fn full_reset(&mut self) -> AppResult<()> {
        self.command(Sy08Opcode::ForcedReset, 0)?;
        self.complete_motion()?;
        Ok(())
    }

    /// Stop any motion immediately.
    pub fn stop(&mut self) -> AppResult<()> {
        self.command(Sy08Opcode::StrongStop, 0)?;
        Ok(())
    }

    /// Firmware version word.
    pub fn query_version(&mut self) -> AppResult<u16> {
        self.command(Sy08Opcode::QueryVersion, 0)
    }

    /// Maximum speed reported by the device.
    pub fn query_max_speed(&mut self) -> AppResult<u16> {
        self.command(Sy08Opcode::QueryMaxSpeed, 0)
    }

    /// Release the transport.
    pub fn close(&mut self) -> AppResult<()> {
        self.link.close()
    }
}

impl<T: Transport> Syringe for Sy08Pump<T> {
    fn capacity(&self) -> PumpCapacity {
        self.capacity
    }

    fn aspirate_steps(&mut self, steps: u32) -> AppResult<()> {
        let current = self.query_position()?;
        let target = current.saturating_add(steps);
        if target > self.capacity.steps {
            return Err(FluidicsError::range(
                "position",
                target,
                0u32,
                self.capacity.steps,
            ));
        }
        let param = self.word("steps", steps)?;
        debug!(device = %self.handle(), steps, from = current, "Aspirating");
        self.command(Sy08Opcode::Aspirate, param)?;
        self.complete_motion()?;
        Ok(())
    }

    fn dispense_steps(&mut self, steps: u32) -> AppResult<()> {
        let current = self.query_position()?;
        if steps > current {
            return Err(FluidicsError::range(
                "position",
                f64::from(current) - f64::from(steps),
                0u32,
                self.capacity.steps,
            ));
        }
        let param = self.word("steps", steps)?;
        debug!(device = %self.handle(), steps, from = current, "Discharging");
        self.command(Sy08Opcode::Discharge, param)?;
        self.complete_motion()?;
        Ok(())
    }

    fn move_to_absolute(&mut self, position: u32) -> AppResult<()> {
        if position > self.capacity.steps {
            return Err(FluidicsError::range(
                "position",
                position,
                0u32,
                self.capacity.steps,
            ));
        }
        let param = self.word("position", position)?;
        debug!(device = %self.handle(), position, "Moving plunger");
        self.command(Sy08Opcode::SetPosition, param)?;
        self.complete_motion()?;
        Ok(())
    }

    fn query_position(&mut self) -> AppResult<u32> {
        let position = u32::from(self.command(Sy08Opcode::QueryPosition, 0)?);
        self.link.handle_mut().last_position = Some(position);
        Ok(position)
    }

    fn reset(&mut self) -> AppResult<()> {
        self.command(Sy08Opcode::Reset, 0)?;
        self.complete_motion()?;
        Ok(())
    }

    fn set_speed(&mut self, speed: u32) -> AppResult<()> {
        if speed > MAX_SPEED {
            return Err(FluidicsError::range("speed", speed, 0u32, MAX_SPEED));
        }
        let param = self.word("speed", speed)?;
        self.command(Sy08Opcode::SetSpeed, param)?;
        self.speed = Some(speed);
        debug!(device = %self.handle(), speed, "Speed set");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Discharge;
    use crate::protocol::binary::checksum;
    use crate::sim::SimulatedSy08;
    use crate::transport::MockTransport;

    fn sim_pump() -> Sy08Pump<SimulatedSy08> {
        Sy08Pump::new(
            SimulatedSy08::new(0).with_busy_polls(2),
            Sy08Settings::default().with_poll(PollPolicy::immediate()),
        )
        .unwrap()
    }

    fn mock_pump(responses: Vec<Vec<u8>>) -> Sy08Pump<MockTransport> {
        Sy08Pump::new(
            MockTransport::new().with_responses(responses),
            Sy08Settings::default().with_poll(PollPolicy::immediate()),
        )
        .unwrap()
    }

    fn position_reply(position: u16) -> Vec<u8> {
        let [lo, hi] = position.to_le_bytes();
        let mut bytes = vec![0xCC, 0x00, 0x00, lo, hi, 0xDD, 0, 0];
        let [c0, c1] = checksum(&bytes[..6]).to_le_bytes();
        bytes[6] = c0;
        bytes[7] = c1;
        bytes
    }

    #[test]
    fn aspirate_two_millilitres_is_4800_steps() {
        let mut pump = sim_pump();
        pump.aspirate(2.0).unwrap();
        assert_eq!(pump.query_position().unwrap(), 4800);
        assert_eq!(pump.handle().last_position, Some(4800));
    }

    #[test]
    fn discharge_all_returns_to_zero() {
        let mut pump = sim_pump();
        pump.aspirate(3.3).unwrap();
        pump.discharge(Discharge::All).unwrap();
        assert_eq!(pump.query_position().unwrap(), 0);
    }

    #[test]
    fn full_capacity_is_legal() {
        let mut pump = sim_pump();
        pump.aspirate(5.0).unwrap();
        assert_eq!(pump.query_position().unwrap(), 12000);
    }

    #[test]
    fn absolute_move_past_stroke_writes_nothing() {
        let mut pump = mock_pump(vec![]);
        let err = pump.move_to_absolute(12001).unwrap_err();
        assert!(matches!(err, FluidicsError::Range { .. }));
        assert_eq!(pump.transport().write_count(), 0);
    }

    #[test]
    fn overfill_is_rejected_after_position_query_only() {
        let mut pump = mock_pump(vec![position_reply(11000)]);
        let err = pump.aspirate(1.0).unwrap_err();
        assert!(matches!(err, FluidicsError::Range { .. }));
        // only the position query went out
        assert_eq!(pump.transport().write_count(), 1);
        assert_eq!(pump.transport().writes()[0][2], 0x66);
    }

    #[test]
    fn discharge_below_empty_is_rejected() {
        let mut pump = mock_pump(vec![position_reply(100)]);
        let err = pump.discharge(Discharge::Volume(1.0)).unwrap_err();
        assert!(matches!(err, FluidicsError::Range { .. }));
        assert_eq!(pump.transport().write_count(), 1);
    }

    #[test]
    fn position_is_little_endian_from_bytes_three_and_four() {
        let mut pump = mock_pump(vec![position_reply(0x1234)]);
        assert_eq!(pump.query_position().unwrap(), 0x1234);
    }

    #[test]
    fn speed_above_limit_writes_nothing() {
        let mut pump = mock_pump(vec![]);
        assert!(pump.set_speed(601).is_err());
        assert_eq!(pump.transport().write_count(), 0);
    }

    #[test]
    fn set_speed_is_recorded() {
        let mut pump = sim_pump();
        pump.set_speed(300).unwrap();
        assert_eq!(pump.speed(), Some(300));
        assert_eq!(pump.transport().speed(), 300);
    }

    #[test]
    fn oversized_stroke_is_rejected_at_construction() {
        let settings = Sy08Settings::default().with_capacity(PumpCapacity::new(5.0, 70_000));
        assert!(Sy08Pump::new(MockTransport::new(), settings).is_err());
    }

    #[test]
    fn opcode_lookup() {
        assert_eq!(Sy08Opcode::from_code(0x4D), Some(Sy08Opcode::Aspirate));
        assert_eq!(Sy08Opcode::from_code(0x00), None);
    }
}
