//! Device Capabilities and Drivers
//!
//! Drivers implement small capability traits instead of one monolithic instrument trait:
//!
//! - a selector valve implements [`PortSelector`]
//! - a syringe pump implements [`Syringe`]
//! - the SY01B pump-valve implements both, and is shared between the two roles with
//!   [`SharedDevice`]
//!
//! Code above this layer (the [`Router`](crate::router::Router)) is generic over the traits, so
//! any combination of models, simulators or test doubles can be plugged in.
//!
//! # Contract
//!
//! Every capability call is synchronous and, for motion, returns only after the device has
//! reported idle (see [`PollPolicy`]). Range checks happen before any byte is written; a
//! rejected request leaves the device untouched.
//!
//! # Example
//!
//! ```
//! use rust_fluidics::device::{Discharge, PollPolicy, Syringe, Sy08Pump, Sy08Settings};
//! use rust_fluidics::sim::SimulatedSy08;
//!
//! let settings = Sy08Settings::default().with_poll(PollPolicy::immediate());
//! let mut pump = Sy08Pump::new(SimulatedSy08::new(0), settings).unwrap();
//!
//! pump.aspirate(2.0).unwrap();
//! assert_eq!(pump.query_position().unwrap(), 4800);
//!
//! pump.discharge(Discharge::All).unwrap();
//! assert_eq!(pump.query_position().unwrap(), 0);
//! ```

use crate::error::{AppResult, FluidicsError};
use crate::transport::TransportSettings;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

pub mod binary_link;
pub mod poll;
pub mod sv07;
pub mod sy01b;
pub mod sy08;

pub use binary_link::BinaryLink;
pub use poll::PollPolicy;
pub use sv07::{Sv07Settings, Sv07Valve};
pub use sy01b::{StepMode, Sy01bPump, Sy01bSettings};
pub use sy08::{Sy08Pump, Sy08Settings};

/// Role a device plays on the bench.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Selector valve only
    Valve,
    /// Syringe pump only
    Pump,
    /// Syringe pump with an integrated selector valve
    PumpValve,
    /// pH probe or other analog sensor
    Sensor,
}

/// Identity and connection facts for one open device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceHandle {
    /// Model name ("SV07", "SY08", "SY01B", ...)
    pub model: &'static str,
    /// Bus address
    pub address: u8,
    /// Line speed of the owning transport
    pub baud_rate: u32,
    /// Per-read timeout of the owning transport
    pub timeout: Duration,
    /// Role
    pub capability: Capability,
    /// Last position or port reported by the device
    pub last_position: Option<u32>,
}

impl DeviceHandle {
    /// Handle with no position known yet.
    pub fn new(model: &'static str, address: u8, capability: Capability) -> Self {
        Self {
            model,
            address,
            baud_rate: 9600,
            timeout: Duration::from_secs(1),
            capability,
            last_position: None,
        }
    }

    /// Record the connection parameters of the owning transport.
    pub fn set_connection(&mut self, settings: &TransportSettings) {
        self.baud_rate = settings.baud_rate;
        self.timeout = settings.timeout;
    }

    /// Label used in logs and errors, e.g. `SY08@0`.
    #[must_use]
    pub fn label(&self) -> String {
        format!("{}@{}", self.model, self.address)
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.model, self.address)
    }
}

/// Syringe volume and the plunger steps that span it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PumpCapacity {
    /// Full stroke volume in user units (mL)
    pub volume: f64,
    /// Full stroke in motor steps
    pub steps: u32,
}

impl PumpCapacity {
    /// Capacity of `volume` units over `steps` steps.
    #[must_use]
    pub fn new(volume: f64, steps: u32) -> Self {
        Self { volume, steps }
    }

    /// Steps for `volume`, truncated toward zero.
    ///
    /// Negative and non-finite volumes are rejected. Volumes above capacity are allowed here;
    /// callers check the resulting step count against the plunger position.
    pub fn steps_for(&self, volume: f64) -> AppResult<u32> {
        if !volume.is_finite() || volume < 0.0 {
            return Err(FluidicsError::range("volume", volume, 0.0, self.volume));
        }
        let steps = (volume * f64::from(self.steps) / self.volume).trunc();
        if steps > f64::from(u32::MAX) {
            return Err(FluidicsError::range("volume", volume, 0.0, self.volume));
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Ok(steps as u32)
    }

    /// Volume moved by `steps` steps.
    #[must_use]
    pub fn volume_for(&self, steps: u32) -> f64 {
        f64::from(steps) * self.volume / f64::from(self.steps)
    }
}

/// How much to push out of the syringe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Discharge {
    /// A volume in user units
    Volume(f64),
    /// Everything: drive the plunger to position 0
    All,
}

/// Capability: Port Selection
///
/// Devices that route a common line to one of N numbered ports.
///
/// # Contract
/// - Ports are numbered `1..=port_count()`
/// - `select_port` rejects out-of-range ports before any I/O
/// - `select_port` returns once the device reports idle
pub trait PortSelector {
    /// Number of selectable ports.
    fn port_count(&self) -> u8;

    /// Switch to `port` and wait for the move to finish.
    fn select_port(&mut self, port: u8) -> AppResult<()>;

    /// Port most recently selected through this driver, if any.
    fn current_port(&self) -> Option<u8>;
}

/// Capability: Syringe Pumping
///
/// Devices with a plunger that aspirates into and discharges out of a syringe.
///
/// # Contract
/// - Plunger positions run `0..=capacity().steps`, 0 being empty
/// - Every motion command re-queries the position after the device reports idle
/// - Requests that would leave the legal stroke fail with `Range` before any motion frame
///
/// The volume methods are provided in terms of the step methods so that callers which plan
/// in steps (the router) and callers which think in volumes see identical rounding.
pub trait Syringe {
    /// Syringe volume and full-stroke step count.
    fn capacity(&self) -> PumpCapacity;

    /// Draw `steps` steps into the syringe.
    fn aspirate_steps(&mut self, steps: u32) -> AppResult<()>;

    /// Push `steps` steps out of the syringe.
    fn dispense_steps(&mut self, steps: u32) -> AppResult<()>;

    /// Drive the plunger to an absolute step position.
    fn move_to_absolute(&mut self, position: u32) -> AppResult<()>;

    /// Read the plunger position in steps.
    fn query_position(&mut self) -> AppResult<u32>;

    /// Home the plunger.
    fn reset(&mut self) -> AppResult<()>;

    /// Set plunger speed in device units.
    fn set_speed(&mut self, speed: u32) -> AppResult<()>;

    /// Draw `volume` units.
    fn aspirate(&mut self, volume: f64) -> AppResult<()> {
        let steps = self.capacity().steps_for(volume)?;
        self.aspirate_steps(steps)
    }

    /// Discharge a volume, or everything.
    fn discharge(&mut self, amount: Discharge) -> AppResult<()> {
        match amount {
            Discharge::Volume(volume) => {
                let steps = self.capacity().steps_for(volume)?;
                self.dispense_steps(steps)
            }
            Discharge::All => self.move_to_absolute(0),
        }
    }
}

impl<T: PortSelector + ?Sized> PortSelector for Box<T> {
    fn port_count(&self) -> u8 {
        (**self).port_count()
    }

    fn select_port(&mut self, port: u8) -> AppResult<()> {
        (**self).select_port(port)
    }

    fn current_port(&self) -> Option<u8> {
        (**self).current_port()
    }
}

impl<T: Syringe + ?Sized> Syringe for Box<T> {
    fn capacity(&self) -> PumpCapacity {
        (**self).capacity()
    }

    fn aspirate_steps(&mut self, steps: u32) -> AppResult<()> {
        (**self).aspirate_steps(steps)
    }

    fn dispense_steps(&mut self, steps: u32) -> AppResult<()> {
        (**self).dispense_steps(steps)
    }

    fn move_to_absolute(&mut self, position: u32) -> AppResult<()> {
        (**self).move_to_absolute(position)
    }

    fn query_position(&mut self) -> AppResult<u32> {
        (**self).query_position()
    }

    fn reset(&mut self) -> AppResult<()> {
        (**self).reset()
    }

    fn set_speed(&mut self, speed: u32) -> AppResult<()> {
        (**self).set_speed(speed)
    }
}

/// One device serving several roles.
///
/// The router holds a valve and a pump by value; for a pump-valve both are clones of the same
/// `SharedDevice`. Access is strictly sequential, so the inner borrow never overlaps. An
/// overlapping borrow is reported as a `State` error rather than a panic.
#[derive(Debug)]
pub struct SharedDevice<D>(Rc<RefCell<D>>);

impl<D> Clone for SharedDevice<D> {
    fn clone(&self) -> Self {
        Self(Rc::clone(&self.0))
    }
}

impl<D> SharedDevice<D> {
    /// Wrap `device` for shared use.
    pub fn new(device: D) -> Self {
        Self(Rc::new(RefCell::new(device)))
    }

    /// Run `f` with exclusive access to the device.
    pub fn with<R>(&self, f: impl FnOnce(&mut D) -> AppResult<R>) -> AppResult<R> {
        let mut device = self
            .0
            .try_borrow_mut()
            .map_err(|_| FluidicsError::State("device already in use".into()))?;
        f(&mut device)
    }

    fn peek<R: Default>(&self, f: impl FnOnce(&D) -> R) -> R {
        self.0.try_borrow().map(|d| f(&d)).unwrap_or_default()
    }
}

impl<D: PortSelector> PortSelector for SharedDevice<D> {
    fn port_count(&self) -> u8 {
        self.peek(PortSelector::port_count)
    }

    fn select_port(&mut self, port: u8) -> AppResult<()> {
        self.with(|d| d.select_port(port))
    }

    fn current_port(&self) -> Option<u8> {
        self.peek(PortSelector::current_port)
    }
}

impl<D: Syringe> Syringe for SharedDevice<D> {
    fn capacity(&self) -> PumpCapacity {
        self.0
            .try_borrow()
            .map(|d| d.capacity())
            .unwrap_or(PumpCapacity::new(0.0, 0))
    }

    fn aspirate_steps(&mut self, steps: u32) -> AppResult<()> {
        self.with(|d| d.aspirate_steps(steps))
    }

    fn dispense_steps(&mut self, steps: u32) -> AppResult<()> {
        self.with(|d| d.dispense_steps(steps))
    }

    fn move_to_absolute(&mut self, position: u32) -> AppResult<()> {
        self.with(|d| d.move_to_absolute(position))
    }

    fn query_position(&mut self) -> AppResult<u32> {
        self.with(Syringe::query_position)
    }

    fn reset(&mut self) -> AppResult<()> {
        self.with(Syringe::reset)
    }

    fn set_speed(&mut self, speed: u32) -> AppResult<()> {
        self.with(|d| d.set_speed(speed))
    }
}

/// Settle delay after a completed move. Zero skips the sleep.
pub(crate) fn settle(delay: Duration) {
    if !delay.is_zero() {
        std::thread::sleep(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_for_truncates_toward_zero() {
        let capacity = PumpCapacity::new(5.0, 12000);
        assert_eq!(capacity.steps_for(2.0).unwrap(), 4800);
        assert_eq!(capacity.steps_for(0.0001).unwrap(), 0);
        assert_eq!(capacity.steps_for(5.0).unwrap(), 12000);
        assert!((capacity.volume_for(4800) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn steps_for_rejects_negative_and_nan() {
        let capacity = PumpCapacity::new(5.0, 12000);
        assert!(matches!(
            capacity.steps_for(-1.0),
            Err(FluidicsError::Range { .. })
        ));
        assert!(capacity.steps_for(f64::NAN).is_err());
        assert!(capacity.steps_for(f64::INFINITY).is_err());
    }

    #[test]
    fn handle_label_combines_model_and_address() {
        let handle = DeviceHandle::new("SV07", 3, Capability::Valve);
        assert_eq!(handle.label(), "SV07@3");
        assert_eq!(handle.to_string(), "SV07@3");
    }

    struct Counter {
        port: Option<u8>,
        selects: u32,
    }

    impl PortSelector for Counter {
        fn port_count(&self) -> u8 {
            6
        }

        fn select_port(&mut self, port: u8) -> AppResult<()> {
            self.selects += 1;
            self.port = Some(port);
            Ok(())
        }

        fn current_port(&self) -> Option<u8> {
            self.port
        }
    }

    #[test]
    fn shared_device_clones_see_the_same_state() {
        let shared = SharedDevice::new(Counter {
            port: None,
            selects: 0,
        });
        let mut a = shared.clone();
        let b = shared.clone();

        a.select_port(4).unwrap();
        assert_eq!(b.current_port(), Some(4));
        assert_eq!(b.port_count(), 6);
        assert_eq!(shared.with(|d| Ok(d.selects)).unwrap(), 1);
    }

    #[test]
    fn nested_access_is_a_state_error() {
        let shared = SharedDevice::new(Counter {
            port: None,
            selects: 0,
        });
        let inner = shared.clone();
        let result = shared.with(|_| inner.with(|_| Ok(())));
        assert!(matches!(result, Err(FluidicsError::State(_))));
    }
}
