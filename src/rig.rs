//! Assembling a router from configuration.
//!
//! The configuration names device models; this module picks the driver for each, opens it on a
//! serial port or on a firmware simulator, and hands the pair to a [`Router`] behind trait
//! objects so the caller does not care which models are on the bench.

use crate::config::{DeviceConfig, DeviceModel, FluidicsConfig};
use crate::device::{
    PollPolicy, PortSelector, PumpCapacity, SharedDevice, Sv07Settings, Sv07Valve, Sy01bPump,
    Sy01bSettings, Sy08Pump, Sy08Settings, Syringe,
};
use crate::error::{AppResult, FluidicsError};
use crate::router::Router;
use crate::sim::{SimulatedSv07, SimulatedSy01b, SimulatedSy08};
use tracing::info;

/// Router over whatever devices the configuration names.
pub type BenchRouter = Router<Box<dyn PortSelector>, Box<dyn Syringe>>;

/// Where device frames go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Real serial ports
    Serial,
    /// In-process firmware simulators, no hardware needed
    Simulated,
}

type DevicePair = (Box<dyn PortSelector>, Box<dyn Syringe>);

/// Validate `config`, open its devices and build a router with its settings.
pub fn build_router(config: &FluidicsConfig, backend: Backend) -> AppResult<BenchRouter> {
    config.validate().map_err(FluidicsError::State)?;
    let ports = config.port_table()?;

    let poll = match backend {
        Backend::Serial => config.polling.policy(),
        Backend::Simulated => PollPolicy::immediate(),
    };

    let (valve, mut pump) = match (config.pump.model, &config.valve) {
        (DeviceModel::Sy08, Some(valve)) => sv07_sy08(valve, &config.pump, poll, backend)?,
        (DeviceModel::Sy01b, None) => sy01b(&config.pump, poll, backend)?,
        _ => {
            return Err(FluidicsError::State(
                "unsupported valve/pump combination".into(),
            ))
        }
    };
    if let Some(speed) = config.pump.speed {
        pump.set_speed(speed)?;
    }

    info!(
        pump = ?config.pump.model,
        stations = ports.len(),
        ?backend,
        "Bench assembled"
    );
    Router::new(valve, pump, ports)?
        .with_settings(config.router)
        .map(|router| router.with_station_names(config.stations.clone()))
}

fn sv07_sy08(
    valve: &DeviceConfig,
    pump: &DeviceConfig,
    poll: PollPolicy,
    backend: Backend,
) -> AppResult<DevicePair> {
    let defaults = Sv07Settings::default();
    let valve_settings = Sv07Settings {
        address: valve.address.unwrap_or(defaults.address),
        ports: valve.ports.unwrap_or(defaults.ports),
        verify_checksum: valve.verify_checksum,
        poll,
        settle: valve.settle(),
    };

    let defaults = Sy08Settings::default();
    let pump_settings = Sy08Settings {
        address: pump.address.unwrap_or(defaults.address),
        capacity: pump.capacity_or(defaults.capacity),
        verify_checksum: pump.verify_checksum,
        poll,
        settle: pump.settle(),
    };

    match backend {
        Backend::Serial => Ok(boxed(
            Sv07Valve::open(&valve.transport(), valve_settings)?,
            Sy08Pump::open(&pump.transport(), pump_settings)?,
        )),
        Backend::Simulated => {
            let stroke = u16::try_from(pump_settings.capacity.steps).map_err(|_| {
                FluidicsError::range("capacity steps", pump_settings.capacity.steps, 1u32, u16::MAX)
            })?;
            let valve_sim =
                SimulatedSv07::new(valve_settings.address).with_ports(valve_settings.ports);
            let pump_sim = SimulatedSy08::new(pump_settings.address).with_stroke(stroke);
            Ok(boxed(
                Sv07Valve::new(valve_sim, valve_settings)?,
                Sy08Pump::new(pump_sim, pump_settings)?,
            ))
        }
    }
}

fn sy01b(pump: &DeviceConfig, poll: PollPolicy, backend: Backend) -> AppResult<DevicePair> {
    let defaults = Sy01bSettings::default();
    let default_capacity = PumpCapacity::new(defaults.volume, defaults.mode.stroke());
    let settings = Sy01bSettings {
        address: pump.address.unwrap_or(defaults.address),
        volume: pump.capacity_or(default_capacity).volume,
        ports: pump.ports.unwrap_or(defaults.ports),
        mode: pump.mode.unwrap_or(defaults.mode),
        poll,
        settle: pump.settle(),
    };
    let mode = settings.mode;

    Ok(match backend {
        Backend::Serial => {
            let mut device = Sy01bPump::open(&pump.transport(), settings)?;
            device.init()?;
            device.set_mode(mode)?;
            shared(device)
        }
        Backend::Simulated => {
            let sim = SimulatedSy01b::new(settings.address).with_ports(settings.ports);
            let mut device = Sy01bPump::new(sim, settings)?;
            device.init()?;
            device.set_mode(mode)?;
            shared(device)
        }
    })
}

fn boxed<V, P>(valve: V, pump: P) -> DevicePair
where
    V: PortSelector + 'static,
    P: Syringe + 'static,
{
    (Box::new(valve), Box::new(pump))
}

/// One pump-valve in both roles.
fn shared<D: PortSelector + Syringe + 'static>(device: D) -> DevicePair {
    let device = SharedDevice::new(device);
    boxed(device.clone(), device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PollingConfig;
    use crate::router::RouterSettings;
    use crate::stations::StationNames;
    use std::collections::BTreeMap;

    fn device(model: DeviceModel) -> DeviceConfig {
        DeviceConfig {
            model,
            port: "sim".to_string(),
            baud_rate: 9600,
            timeout_ms: 1000,
            address: None,
            ports: None,
            capacity_volume: None,
            capacity_steps: None,
            mode: None,
            verify_checksum: true,
            settle_ms: 0,
            speed: None,
        }
    }

    fn config(valve: Option<DeviceConfig>, pump: DeviceConfig) -> FluidicsConfig {
        let ports: BTreeMap<String, i64> = [("naoh", 2), ("cell", 5), ("waste", 6), ("air", 7)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        FluidicsConfig {
            application: Default::default(),
            valve,
            pump,
            polling: PollingConfig::default(),
            router: RouterSettings::default(),
            stations: StationNames::default(),
            ports,
            port_table: None,
        }
    }

    #[test]
    fn simulated_sv07_sy08_bench_moves_liquid() {
        let cfg = config(Some(device(DeviceModel::Sv07)), device(DeviceModel::Sy08));
        let mut router = build_router(&cfg, Backend::Simulated).unwrap();
        let moved = router.transfer("naoh", "cell", 7.5).unwrap();
        assert!((moved - 7.5).abs() < 1e-9);
        assert_eq!(router.valve().current_port(), Some(5));
    }

    #[test]
    fn simulated_sy01b_serves_as_valve_and_pump() {
        let mut pump = device(DeviceModel::Sy01b);
        pump.capacity_volume = Some(5.0);
        let cfg = config(None, pump);
        let mut router = build_router(&cfg, Backend::Simulated).unwrap();
        assert_eq!(router.valve().port_count(), 9);
        router.transfer("naoh", "cell", 2.0).unwrap();
        assert_eq!(router.valve().current_port(), Some(5));
        assert_eq!(router.pump_mut().query_position().unwrap(), 0);
    }

    #[test]
    fn invalid_config_is_rejected_before_opening_anything() {
        let cfg = config(None, device(DeviceModel::Sy08));
        assert!(matches!(
            build_router(&cfg, Backend::Simulated),
            Err(FluidicsError::State(_))
        ));
    }

    #[test]
    fn ports_beyond_the_valve_are_rejected() {
        let mut valve = device(DeviceModel::Sv07);
        valve.ports = Some(6);
        let cfg = config(Some(valve), device(DeviceModel::Sy08));
        assert!(matches!(
            build_router(&cfg, Backend::Simulated),
            Err(FluidicsError::Range { .. })
        ));
    }
}
