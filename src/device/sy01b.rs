//! SY01B syringe pump with integrated selector valve (DT ASCII protocol).
//!
//! One device, two capabilities: it implements both [`Syringe`] and [`PortSelector`]. Share it
//! between the router's valve and pump roles with [`SharedDevice`](crate::device::SharedDevice).
//!
//! Plunger range depends on the step mode: 0..=12000 in normal mode, 0..=96000 in fine and
//! micro-step modes. `init` switches to micro-step mode.
//!
//! Every reply is checked for a non-zero error nibble, which surfaces as
//! [`FluidicsError::DeviceFault`].

use crate::device::{
    settle, Capability, DeviceHandle, PollPolicy, PortSelector, PumpCapacity, Syringe,
};
use crate::error::{AppResult, FluidicsError};
use crate::protocol::ascii::{parse_reply, AsciiCommand, DtReply};
use crate::transport::{hex, SerialTransport, Transport, TransportSettings};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, trace};

/// Highest accepted speed, pulses per second.
pub const MAX_SPEED: u32 = 12000;
/// Highest accepted flow rate, volume units per minute.
pub const MAX_RATE: u32 = 3750;
/// Micro-step stroke used to convert flow rates into pulse speeds.
const MICRO_STROKE: u32 = 96000;

/// Plunger resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepMode {
    /// 12000 steps full stroke
    Normal,
    /// 96000 steps, fine positioning
    Fine,
    /// 96000 steps, micro-stepping
    Micro,
}

impl StepMode {
    /// `N` command operand.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            StepMode::Normal => 0,
            StepMode::Fine => 1,
            StepMode::Micro => 2,
        }
    }

    /// Full-stroke step count in this mode.
    #[must_use]
    pub fn stroke(self) -> u32 {
        match self {
            StepMode::Normal => 12000,
            StepMode::Fine | StepMode::Micro => 96000,
        }
    }
}

/// Driver options.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sy01bSettings {
    /// Bus address ('1' on the wire for 1)
    pub address: u8,
    /// Syringe volume in user units
    pub volume: f64,
    /// Ports on the valve head
    pub ports: u8,
    /// Step mode assumed at connect
    pub mode: StepMode,
    /// Motion-completion polling
    pub poll: PollPolicy,
    /// Extra wait after each completed move
    pub settle: Duration,
}

impl Default for Sy01bSettings {
    fn default() -> Self {
        Self {
            address: 1,
            volume: 500.0,
            ports: 9,
            mode: StepMode::Normal,
            poll: PollPolicy::default(),
            settle: Duration::ZERO,
        }
    }
}

impl Sy01bSettings {
    /// Replace the polling policy.
    #[must_use]
    pub fn with_poll(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    /// Replace the syringe volume.
    #[must_use]
    pub fn with_volume(mut self, volume: f64) -> Self {
        self.volume = volume;
        self
    }
}

/// SY01B pump-valve.
#[derive(Debug)]
pub struct Sy01bPump<T> {
    transport: T,
    handle: DeviceHandle,
    volume: f64,
    ports: u8,
    mode: StepMode,
    poll: PollPolicy,
    settle: Duration,
    current_port: Option<u8>,
    speed: Option<u32>,
}

impl Sy01bPump<SerialTransport> {
    /// Open the pump-valve on a serial port.
    pub fn open(transport: &TransportSettings, settings: Sy01bSettings) -> AppResult<Self> {
        let mut pump = Self::new(SerialTransport::open(transport)?, settings)?;
        pump.handle.set_connection(transport);
        info!(device = %pump.handle, port = %transport.path, "SY01B connected");
        Ok(pump)
    }
}

impl<T: Transport> Sy01bPump<T> {
    /// Drive a pump-valve over an already-open transport.
    pub fn new(transport: T, settings: Sy01bSettings) -> AppResult<Self> {
        if !(settings.volume.is_finite() && settings.volume > 0.0) {
            return Err(FluidicsError::range(
                "capacity volume",
                settings.volume,
                f64::MIN_POSITIVE,
                f64::MAX,
            ));
        }
        if settings.ports == 0 {
            return Err(FluidicsError::range("ports", 0u8, 1u8, u8::MAX));
        }
        Ok(Self {
            transport,
            handle: DeviceHandle::new("SY01B", settings.address, Capability::PumpValve),
            volume: settings.volume,
            ports: settings.ports,
            mode: settings.mode,
            poll: settings.poll,
            settle: settings.settle,
            current_port: None,
            speed: None,
        })
    }

    /// Device identity.
    pub fn handle(&self) -> &DeviceHandle {
        &self.handle
    }

    /// Current step mode.
    pub fn mode(&self) -> StepMode {
        self.mode
    }

    /// Last speed set through this driver.
    pub fn speed(&self) -> Option<u32> {
        self.speed
    }

    /// Underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Mutable underlying transport.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Send one command and return its checked reply.
    fn exchange(&mut self, command: &AsciiCommand) -> AppResult<DtReply> {
        let label = self.handle.label();
        let bytes = command.encode();
        trace!(device = %label, tx = command.body(), "DT request");
        self.transport.write(&bytes)?;

        let mut raw = self.transport.read_until_timeout()?;
        if raw.is_empty() {
            debug!(device = %label, "Empty reply, reading again");
            raw = self.transport.read_until_timeout()?;
        }
        if raw.is_empty() {
            return Err(FluidicsError::transport(&label, "no response"));
        }
        trace!(device = %label, rx = %hex(&raw), "DT reply");

        parse_reply(&label, &raw)?.check(&label)
    }

    fn execute(&mut self, body: impl Into<String>) -> AppResult<DtReply> {
        let command = AsciiCommand::execute(self.handle.address, body);
        self.exchange(&command)
    }

    fn query(&mut self, body: &str) -> AppResult<DtReply> {
        let command = AsciiCommand::query(self.handle.address, body);
        self.exchange(&command)
    }

    /// Poll `Q` until the ready bit is set.
    pub fn wait_idle(&mut self) -> AppResult<u32> {
        let label = self.handle.label();
        let policy = self.poll;
        policy.wait_until(&label, || Ok(self.query("Q")?.status.is_idle()))
    }

    fn complete_motion(&mut self) -> AppResult<u32> {
        self.wait_idle()?;
        settle(self.settle);
        self.query_position()
    }

    /// Initialise: micro-step mode, home plunger and valve.
    pub fn init(&mut self) -> AppResult<()> {
        self.execute("N2Z1")?;
        self.mode = StepMode::Micro;
        self.wait_idle()?;
        self.current_port = Some(1);
        info!(device = %self.handle, "SY01B initialised");
        Ok(())
    }

    /// Switch step mode. Changes the legal plunger range.
    pub fn set_mode(&mut self, mode: StepMode) -> AppResult<()> {
        self.execute(format!("N{}", mode.code()))?;
        self.mode = mode;
        debug!(device = %self.handle, ?mode, "Step mode set");
        Ok(())
    }

    /// Set speed from a flow rate in volume units per minute.
    pub fn set_rate(&mut self, rate: u32) -> AppResult<()> {
        if rate > MAX_RATE {
            return Err(FluidicsError::range("rate", rate, 0u32, MAX_RATE));
        }
        let speed = f64::from(rate) / 60.0 * f64::from(MICRO_STROKE) / self.volume;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let speed = speed.trunc().clamp(0.0, f64::from(MAX_SPEED)) as u32;
        self.set_speed(speed)
    }

    /// Port the valve reports it is on.
    pub fn query_port(&mut self) -> AppResult<u8> {
        let label = self.handle.label();
        let value = self.query("?6")?.data_as_u32(&label)?;
        u8::try_from(value)
            .map_err(|_| FluidicsError::protocol(&label, format!("port {value} out of range")))
    }

    /// Top speed reported by the device.
    pub fn query_top_speed(&mut self) -> AppResult<u32> {
        let label = self.handle.label();
        self.query("?2")?.data_as_u32(&label)
    }

    /// Step mode reported by the device.
    pub fn query_mode(&mut self) -> AppResult<u32> {
        let label = self.handle.label();
        self.query("?28")?.data_as_u32(&label)
    }

    /// Halt the command string.
    pub fn stop(&mut self) -> AppResult<()> {
        self.execute("H")?;
        Ok(())
    }

    /// Terminate plunger motion. Re-initialisation is recommended afterwards.
    pub fn strong_stop(&mut self) -> AppResult<()> {
        self.execute("T")?;
        Ok(())
    }

    /// Release the transport.
    pub fn close(&mut self) -> AppResult<()> {
        self.transport.close()
    }
}

impl<T: Transport> Syringe for Sy01bPump<T> {
    fn capacity(&self) -> PumpCapacity {
        PumpCapacity::new(self.volume, self.mode.stroke())
    }

    fn aspirate_steps(&mut self, steps: u32) -> AppResult<()> {
        self.wait_idle()?;
        let current = self.query_position()?;
        let stroke = self.mode.stroke();
        let target = current.saturating_add(steps);
        if target > stroke {
            return Err(FluidicsError::range("position", target, 0u32, stroke));
        }
        debug!(device = %self.handle, steps, from = current, "Aspirating");
        self.execute(format!("P{steps}"))?;
        self.complete_motion()?;
        Ok(())
    }

    fn dispense_steps(&mut self, steps: u32) -> AppResult<()> {
        self.wait_idle()?;
        let current = self.query_position()?;
        if steps > current {
            return Err(FluidicsError::range(
                "position",
                f64::from(current) - f64::from(steps),
                0u32,
                self.mode.stroke(),
            ));
        }
        debug!(device = %self.handle, steps, from = current, "Discharging");
        self.execute(format!("D{steps}"))?;
        self.complete_motion()?;
        Ok(())
    }

    fn move_to_absolute(&mut self, position: u32) -> AppResult<()> {
        let stroke = self.mode.stroke();
        if position > stroke {
            return Err(FluidicsError::range("position", position, 0u32, stroke));
        }
        debug!(device = %self.handle, position, "Moving plunger");
        self.execute(format!("A{position}"))?;
        self.complete_motion()?;
        Ok(())
    }

    fn query_position(&mut self) -> AppResult<u32> {
        let label = self.handle.label();
        let position = self.query("?")?.data_as_u32(&label)?;
        self.handle.last_position = Some(position);
        Ok(position)
    }

    fn reset(&mut self) -> AppResult<()> {
        self.execute("A0")?;
        self.complete_motion()?;
        Ok(())
    }

    fn set_speed(&mut self, speed: u32) -> AppResult<()> {
        if speed > MAX_SPEED {
            return Err(FluidicsError::range("speed", speed, 0u32, MAX_SPEED));
        }
        self.execute(format!("V{speed}"))?;
        self.speed = Some(speed);
        debug!(device = %self.handle, speed, "Speed set");
        Ok(())
    }
}

impl<T: Transport> PortSelector for Sy01bPump<T> {
    fn port_count(&self) -> u8 {
        self.ports
    }

    fn select_port(&mut self, port: u8) -> AppResult<()> {
        if !(1..=self.ports).contains(&port) {
            return Err(FluidicsError::range("port", port, 1u8, self.ports));
        }
        debug!(device = %self.handle, port, "Selecting port");
        self.execute(format!("I{port}"))?;
        self.wait_idle()?;
        settle(self.settle);
        self.current_port = Some(port);
        Ok(())
    }

    fn current_port(&self) -> Option<u8> {
        self.current_port
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Discharge, SharedDevice};
    use crate::sim::SimulatedSy01b;
    use crate::transport::MockTransport;

    fn sim_pump() -> Sy01bPump<SimulatedSy01b> {
        Sy01bPump::new(
            SimulatedSy01b::new(1).with_busy_polls(2),
            Sy01bSettings::default().with_poll(PollPolicy::immediate()),
        )
        .unwrap()
    }

    #[test]
    fn aspirate_and_discharge_in_normal_mode() {
        let mut pump = sim_pump();
        pump.aspirate(250.0).unwrap();
        assert_eq!(pump.query_position().unwrap(), 6000);
        pump.discharge(Discharge::Volume(100.0)).unwrap();
        assert_eq!(pump.query_position().unwrap(), 3600);
        pump.discharge(Discharge::All).unwrap();
        assert_eq!(pump.query_position().unwrap(), 0);
    }

    #[test]
    fn init_switches_to_micro_step_range() {
        let mut pump = sim_pump();
        pump.init().unwrap();
        assert_eq!(pump.mode(), StepMode::Micro);
        assert_eq!(pump.capacity().steps, 96000);
        pump.move_to_absolute(90000).unwrap();
        assert_eq!(pump.query_position().unwrap(), 90000);
    }

    #[test]
    fn normal_mode_rejects_micro_positions_without_io() {
        let mut pump = Sy01bPump::new(MockTransport::new(), Sy01bSettings::default()).unwrap();
        assert!(pump.move_to_absolute(12001).is_err());
        assert!(pump.select_port(10).is_err());
        assert!(pump.set_speed(12001).is_err());
        assert!(pump.set_rate(3751).is_err());
        assert_eq!(pump.transport().write_count(), 0);
    }

    #[test]
    fn port_selection_moves_the_valve() {
        let mut pump = sim_pump();
        pump.select_port(4).unwrap();
        assert_eq!(pump.current_port(), Some(4));
        assert_eq!(pump.query_port().unwrap(), 4);
    }

    #[test]
    fn rate_converts_to_microstep_speed() {
        let mut pump = sim_pump();
        pump.set_rate(3750).unwrap();
        assert_eq!(pump.speed(), Some(12000));
        assert_eq!(pump.query_top_speed().unwrap(), 12000);
    }

    #[test]
    fn error_nibble_surfaces_as_device_fault() {
        let mut pump = Sy01bPump::new(
            MockTransport::new().with_responses([b"/0g\x03\r\n".to_vec()]),
            Sy01bSettings::default(),
        )
        .unwrap();
        let err = pump.query_position().unwrap_err();
        assert!(matches!(err, FluidicsError::DeviceFault { code: 7, .. }));
    }

    #[test]
    fn silent_device_is_a_transport_error_after_one_reread() {
        let mut pump = Sy01bPump::new(MockTransport::new(), Sy01bSettings::default()).unwrap();
        let err = pump.query_position().unwrap_err();
        assert!(matches!(err, FluidicsError::Transport { .. }));
        assert_eq!(pump.transport().write_count(), 1);
    }

    #[test]
    fn shared_device_serves_both_roles() {
        let shared = SharedDevice::new(sim_pump());
        let mut valve = shared.clone();
        let mut pump = shared.clone();

        valve.select_port(2).unwrap();
        pump.aspirate(50.0).unwrap();
        valve.select_port(3).unwrap();
        pump.discharge(Discharge::All).unwrap();

        assert_eq!(valve.current_port(), Some(3));
        assert_eq!(pump.query_position().unwrap(), 0);
    }
}
