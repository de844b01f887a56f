//! Volume routing between named stations.
//!
//! The [`Router`] owns one valve and one pump and turns "move V of X to Y" into a sequence of
//! capacity-bounded cycles: select source, aspirate, select destination, discharge. Every
//! station name is resolved before the first move, so an unknown name never leaves liquid
//! half-way through the plumbing.
//!
//! Cycles are planned in pump steps, not volumes, so the per-cycle amounts always add up to the
//! requested volume exactly (after the single truncation to whole steps).
//!
//! ```
//! use rust_fluidics::device::{PollPolicy, Sv07Settings, Sv07Valve, Sy08Pump, Sy08Settings};
//! use rust_fluidics::router::Router;
//! use rust_fluidics::sim::{SimulatedSv07, SimulatedSy08};
//! use rust_fluidics::stations::PortTable;
//!
//! let poll = PollPolicy::immediate();
//! let valve = Sv07Valve::new(SimulatedSv07::new(0), Sv07Settings::default().with_poll(poll)).unwrap();
//! let pump = Sy08Pump::new(SimulatedSy08::new(0), Sy08Settings::default().with_poll(poll)).unwrap();
//! let ports = PortTable::from_pairs([("naoh", 2), ("cell", 5), ("waste", 6)]).unwrap();
//!
//! let mut router = Router::new(valve, pump, ports).unwrap();
//! let moved = router.transfer("naoh", "cell", 12.0).unwrap();
//! assert!((moved - 12.0).abs() < 1e-9);
//! ```

use crate::device::{Discharge, PortSelector, Syringe};
use crate::error::{AppResult, FluidicsError};
use crate::records::{NullSink, RecordSink};
use crate::sensor::{Calibrator, PhProbe, RawSignal};
use crate::stations::{PortTable, StationNames};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, instrument};

pub use crate::records::TransferRecord;

/// Tunables for the derived operations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterSettings {
    /// Extra volume removed from the cell on each side of a clean
    pub extra_volume: f64,
    /// Air pushed behind every dispensed chunk
    pub air_volume: f64,
    /// Reagent sent to waste before a dispense, to wet the line
    pub prime_volume: f64,
    /// Largest chunk per dispense leg. `None` means the pump capacity
    pub aspirate_volume: Option<f64>,
    /// Extra volume withdrawn after a prime
    pub prime_margin: f64,
    /// Probe calibration options
    pub calibration: CalibrationSettings,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            extra_volume: 5.0,
            air_volume: 1.0,
            prime_volume: 0.1,
            aspirate_volume: None,
            prime_margin: 0.0,
            calibration: CalibrationSettings::default(),
        }
    }
}

impl RouterSettings {
    /// Every volume must be finite and non-negative; the chunk limit must be positive.
    pub fn validate(&self) -> Result<(), String> {
        let volumes = [
            ("extra_volume", self.extra_volume),
            ("air_volume", self.air_volume),
            ("prime_volume", self.prime_volume),
            ("prime_margin", self.prime_margin),
            ("calibration.buffer_volume", self.calibration.buffer_volume),
            ("calibration.extra_volume", self.calibration.extra_volume),
            ("calibration.rinse_margin", self.calibration.rinse_margin),
            ("calibration.air_volume", self.calibration.air_volume),
        ];
        for (name, value) in volumes {
            if !value.is_finite() || value < 0.0 {
                return Err(format!("router.{name} must be a non-negative number, got {value}"));
            }
        }
        if let Some(chunk) = self.aspirate_volume {
            if !chunk.is_finite() || chunk <= 0.0 {
                return Err(format!("router.aspirate_volume must be positive, got {chunk}"));
            }
        }
        Ok(())
    }
}

/// Volumes used while calibrating a probe in buffer solutions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationSettings {
    /// Buffer delivered to the cell per reference point
    pub buffer_volume: f64,
    /// Extra volume for the cleans around the calibration run
    pub extra_volume: f64,
    /// Extra volume for the rinse after each reading
    pub rinse_margin: f64,
    /// Air bubbled through the cell before reading
    pub air_volume: f64,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            buffer_volume: 5.0,
            extra_volume: 2.0,
            rinse_margin: 1.0,
            air_volume: 5.0,
        }
    }
}

/// Split `total` steps into chunks of at most `chunk`, largest first.
///
/// The remainder chunk is omitted when it would be zero. `chunk == 0` yields no cycles.
#[must_use]
pub fn plan_cycles(total: u32, chunk: u32) -> Vec<u32> {
    if chunk == 0 || total == 0 {
        return Vec::new();
    }
    let full = total / chunk;
    let remainder = total % chunk;
    let mut cycles = vec![chunk; full as usize];
    if remainder > 0 {
        cycles.push(remainder);
    }
    cycles
}

/// One valve and one pump, driven by station name.
pub struct Router<V, P> {
    valve: V,
    pump: P,
    ports: PortTable,
    names: StationNames,
    settings: RouterSettings,
    sink: Box<dyn RecordSink>,
}

impl<V, P> fmt::Debug for Router<V, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("ports", &self.ports)
            .field("names", &self.names)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// A resolved station: name for records, port for the valve.
#[derive(Debug, Clone, Copy)]
struct Leg<'a> {
    name: &'a str,
    port: u8,
}

impl<V: PortSelector, P: Syringe> Router<V, P> {
    /// Router with default settings and station names, discarding records.
    ///
    /// Fails if a port in the table does not exist on the valve.
    pub fn new(valve: V, pump: P, ports: PortTable) -> AppResult<Self> {
        ports.check_fits(valve.port_count())?;
        Ok(Self {
            valve,
            pump,
            ports,
            names: StationNames::default(),
            settings: RouterSettings::default(),
            sink: Box::new(NullSink),
        })
    }

    /// Replace the tunables.
    pub fn with_settings(mut self, settings: RouterSettings) -> AppResult<Self> {
        settings.validate().map_err(FluidicsError::State)?;
        self.settings = settings;
        Ok(self)
    }

    /// Replace the cell/waste/air/flush names.
    #[must_use]
    pub fn with_station_names(mut self, names: StationNames) -> Self {
        self.names = names;
        self
    }

    /// Send transfer records to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: Box<dyn RecordSink>) -> Self {
        self.sink = sink;
        self
    }

    /// The valve.
    pub fn valve(&self) -> &V {
        &self.valve
    }

    /// The valve, mutably.
    pub fn valve_mut(&mut self) -> &mut V {
        &mut self.valve
    }

    /// The pump.
    pub fn pump(&self) -> &P {
        &self.pump
    }

    /// The pump, mutably.
    pub fn pump_mut(&mut self) -> &mut P {
        &mut self.pump
    }

    /// The port table.
    pub fn ports(&self) -> &PortTable {
        &self.ports
    }

    /// Current tunables.
    pub fn settings(&self) -> &RouterSettings {
        &self.settings
    }

    /// Names of the fixed stations.
    pub fn station_names(&self) -> &StationNames {
        &self.names
    }

    /// Switch the working cell, e.g. between two reaction vessels.
    pub fn change_cell(&mut self, name: impl Into<String>) {
        self.names.cell = name.into();
    }

    /// Give back the devices.
    pub fn into_parts(self) -> (V, P) {
        (self.valve, self.pump)
    }

    fn resolve<'a>(&self, name: &'a str) -> AppResult<Leg<'a>> {
        Ok(Leg {
            name,
            port: self.ports.resolve(name)?,
        })
    }

    fn steps_for(&self, volume: f64) -> AppResult<u32> {
        self.pump.capacity().steps_for(volume)
    }

    /// Largest dispense chunk in steps, never more than the syringe holds.
    fn chunk_steps(&self) -> AppResult<u32> {
        let capacity = self.pump.capacity();
        let chunk = match self.settings.aspirate_volume {
            Some(volume) => capacity.steps_for(volume)?.min(capacity.steps),
            None => capacity.steps,
        };
        if chunk == 0 {
            return Err(FluidicsError::State(
                "dispense chunk is smaller than one pump step".into(),
            ));
        }
        Ok(chunk)
    }

    /// One cycle: fill at `from`, empty the same amount at `to`.
    fn cycle(&mut self, from: Leg<'_>, to: Leg<'_>, steps: u32) -> AppResult<()> {
        self.valve.select_port(from.port)?;
        self.pump.aspirate_steps(steps)?;
        self.valve.select_port(to.port)?;
        self.pump.dispense_steps(steps)
    }

    /// Move `steps` from `from` to `to` in capacity-bounded cycles and record it.
    fn move_steps(&mut self, from: Leg<'_>, to: Leg<'_>, steps: u32) -> AppResult<f64> {
        let capacity = self.pump.capacity();
        let cycles = plan_cycles(steps, capacity.steps);
        for (n, chunk) in cycles.iter().enumerate() {
            debug!(
                from = from.name,
                to = to.name,
                cycle = n + 1,
                of = cycles.len(),
                steps = chunk,
                "Transfer cycle"
            );
            self.cycle(from, to, *chunk)?;
        }

        let moved = capacity.volume_for(steps);
        if steps > 0 {
            self.sink
                .record(TransferRecord::now(from.name, to.name, moved));
        }
        Ok(moved)
    }

    /// Move `volume` from `source` to `dest`.
    ///
    /// Volumes above the pump capacity are split into full cycles plus one remainder cycle.
    /// Returns the volume actually moved (the request truncated to whole pump steps).
    #[instrument(skip(self), err)]
    pub fn transfer(&mut self, source: &str, dest: &str, volume: f64) -> AppResult<f64> {
        let from = self.resolve(source)?;
        let to = self.resolve(dest)?;
        let steps = self.steps_for(volume)?;
        let moved = self.move_steps(from, to, steps)?;
        info!(source, dest, volume = moved, "Transfer complete");
        Ok(moved)
    }

    /// Fill the syringe completely at `source` and empty it at `dest`.
    #[instrument(skip(self), err)]
    pub fn transfer_all(&mut self, source: &str, dest: &str) -> AppResult<f64> {
        let from = self.resolve(source)?;
        let to = self.resolve(dest)?;
        let capacity = self.pump.capacity();

        self.valve.select_port(from.port)?;
        self.pump.move_to_absolute(capacity.steps)?;
        self.valve.select_port(to.port)?;
        self.pump.discharge(Discharge::All)?;

        self.sink
            .record(TransferRecord::now(from.name, to.name, capacity.volume));
        Ok(capacity.volume)
    }

    /// Point the valve at waste and home the pump, emptying whatever it held.
    #[instrument(skip(self), err)]
    pub fn reset_to_waste(&mut self) -> AppResult<()> {
        let waste = self.ports.resolve(&self.names.waste)?;
        self.valve.select_port(waste)?;
        self.pump.reset()
    }

    /// Fill a reagent line and push it through with air.
    #[instrument(skip(self), err)]
    pub fn init_line(&mut self, reagent: &str) -> AppResult<()> {
        let names = self.names.clone();
        self.resolve(reagent)?;
        self.resolve(&names.waste)?;
        self.resolve(&names.air)?;

        self.transfer_all(reagent, &names.waste)?;
        self.transfer_all(&names.air, &names.waste)?;
        Ok(())
    }

    /// Deliver `volume` of `reagent` to the cell.
    ///
    /// Resets to waste, wets the line with `prime_volume` to waste, then delivers in chunks of
    /// at most `aspirate_volume`, chasing each chunk with `air_volume` of air. Zero volume does
    /// nothing once the stations resolve. Returns the reagent volume delivered to the cell.
    #[instrument(skip(self), err)]
    pub fn dispense(&mut self, reagent: &str, volume: f64) -> AppResult<f64> {
        let names = self.names.clone();
        let source = self.resolve(reagent)?;
        let cell = self.resolve(&names.cell)?;
        let waste = self.resolve(&names.waste)?;
        let air = self.resolve(&names.air)?;

        let total = self.steps_for(volume)?;
        if total == 0 {
            return Ok(0.0);
        }
        let prime_steps = self.steps_for(self.settings.prime_volume)?;
        let air_steps = self.steps_for(self.settings.air_volume)?;
        let chunk = self.chunk_steps()?;

        self.reset_to_waste()?;
        self.move_steps(source, waste, prime_steps)?;

        let mut delivered = 0.0;
        for steps in plan_cycles(total, chunk) {
            delivered += self.move_steps(source, cell, steps)?;
            self.move_steps(air, cell, air_steps)?;
        }
        info!(reagent, volume = delivered, "Dispense complete");
        Ok(delivered)
    }

    /// Pump `volume` out of the cell into waste.
    #[instrument(skip(self), err)]
    pub fn remove_cell_contents(&mut self, volume: f64) -> AppResult<f64> {
        let names = self.names.clone();
        self.transfer(&names.cell, &names.waste, volume)
    }

    /// Two-stage purge of the cell.
    ///
    /// Removes `volume + extra_volume`, rinses with `volume` of flush, then removes
    /// `volume + extra_volume` again. Both removals run even when `volume` is zero.
    #[instrument(skip(self), err)]
    pub fn clean(&mut self, volume: f64) -> AppResult<()> {
        let names = self.names.clone();
        for name in names.all() {
            self.resolve(name)?;
        }
        let purge = volume + self.settings.extra_volume;
        self.steps_for(purge)?;

        self.reset_to_waste()?;
        self.remove_cell_contents(purge)?;
        self.dispense(&names.flush, volume)?;
        self.remove_cell_contents(purge)?;
        info!(volume, "Cell cleaned");
        Ok(())
    }

    /// Fill a line without leaving reagent in the cell.
    ///
    /// Dispenses `volume`, then withdraws `volume + prime_margin` from the cell.
    #[instrument(skip(self), err)]
    pub fn prime(&mut self, reagent: &str, volume: f64) -> AppResult<()> {
        let names = self.names.clone();
        self.resolve(reagent)?;
        self.resolve(&names.cell)?;
        self.resolve(&names.waste)?;

        self.dispense(reagent, volume)?;
        self.remove_cell_contents(volume + self.settings.prime_margin)?;
        Ok(())
    }

    /// Back-flush a reagent line with flush solvent, then air.
    #[instrument(skip(self), err)]
    pub fn clear_line(&mut self, reagent: &str) -> AppResult<()> {
        let names = self.names.clone();
        self.resolve(reagent)?;
        self.resolve(&names.flush)?;
        self.resolve(&names.air)?;

        self.transfer_all(&names.flush, reagent)?;
        self.transfer(&names.air, reagent, self.settings.air_volume)?;
        Ok(())
    }

    /// Push `volume` of air through the cell.
    #[instrument(skip(self), err)]
    pub fn bubble(&mut self, volume: f64) -> AppResult<f64> {
        let names = self.names.clone();
        self.transfer(&names.air, &names.cell, volume)
    }

    /// Calibrate `probe` against buffer solutions.
    ///
    /// For each `(buffer station, reference value)`: clean, prime, dispense the buffer, bubble,
    /// read the averaged signal and rinse. A final clean follows, then the curve is fitted and
    /// stored in the probe. Returns the `(signal, reference)` samples.
    #[instrument(skip(self, probe, calibrator, buffers), fields(points = buffers.len()), err)]
    pub fn calibrate_probe<S: RawSignal>(
        &mut self,
        probe: &mut PhProbe<S>,
        calibrator: &dyn Calibrator,
        buffers: &[(String, f64)],
    ) -> AppResult<Vec<(f64, f64)>> {
        for (buffer, _) in buffers {
            self.resolve(buffer)?;
        }
        let names = self.names.clone();
        for name in names.all() {
            self.resolve(name)?;
        }

        let cal = self.settings.calibration;
        let mut samples = Vec::with_capacity(buffers.len());
        for (buffer, reference) in buffers {
            self.clean(cal.buffer_volume + cal.extra_volume)?;
            self.prime(buffer, cal.buffer_volume)?;
            self.dispense(buffer, cal.buffer_volume)?;
            self.bubble(cal.air_volume)?;
            let signal = probe.voltage()?;
            debug!(buffer = %buffer, reference, signal, "Calibration point");
            samples.push((signal, *reference));
            self.clean(cal.buffer_volume + cal.rinse_margin)?;
        }
        self.clean(cal.buffer_volume + cal.extra_volume)?;

        probe.calibrate(calibrator, &samples)?;
        Ok(samples)
    }
}
