//! Configuration System using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration, `config/fluidics.toml` by default)
//! 2. Environment variables prefixed with `FLUIDICS_`, nested keys separated by `__`
//!
//! Example: `FLUIDICS_PUMP__PORT=/dev/ttyUSB1` overrides `pump.port`.
//!
//! # Example
//! ```no_run
//! use rust_fluidics::config::FluidicsConfig;
//!
//! let config = FluidicsConfig::load()?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), rust_fluidics::error::FluidicsError>(())
//! ```

use crate::device::{PollPolicy, PumpCapacity, StepMode};
use crate::error::{AppResult, FluidicsError};
use crate::router::RouterSettings;
use crate::stations::{PortTable, StationNames};
use crate::transport::TransportSettings;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FluidicsConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Selector valve. Absent when the pump has its own valve (SY01B)
    #[serde(default)]
    pub valve: Option<DeviceConfig>,
    /// Syringe pump
    pub pump: DeviceConfig,
    /// Motion-completion polling
    #[serde(default)]
    pub polling: PollingConfig,
    /// Router tunables
    #[serde(default)]
    pub router: RouterSettings,
    /// Names of the fixed stations
    #[serde(default)]
    pub stations: StationNames,
    /// Inline port table, station name to port
    #[serde(default)]
    pub ports: BTreeMap<String, i64>,
    /// CSV port table, used instead of `ports` when set
    #[serde(default)]
    pub port_table: Option<PathBuf>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

/// Supported device models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceModel {
    /// Binary-protocol selector valve
    Sv07,
    /// Binary-protocol syringe pump
    Sy08,
    /// DT-protocol pump with integrated valve
    Sy01b,
}

/// One serial device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device model
    pub model: DeviceModel,
    /// Serial port path (e.g. "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Line speed
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Per-read timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Bus address. Defaults to the model's factory address
    #[serde(default)]
    pub address: Option<u8>,
    /// Valve port count (SV07, SY01B)
    #[serde(default)]
    pub ports: Option<u8>,
    /// Syringe volume in user units
    #[serde(default)]
    pub capacity_volume: Option<f64>,
    /// Full stroke in steps (SY08)
    #[serde(default)]
    pub capacity_steps: Option<u32>,
    /// Step mode (SY01B)
    #[serde(default)]
    pub mode: Option<StepMode>,
    /// Reject binary replies with a bad checksum
    #[serde(default = "default_verify_checksum")]
    pub verify_checksum: bool,
    /// Extra wait after each completed move, in milliseconds
    #[serde(default)]
    pub settle_ms: u64,
    /// Plunger speed applied at startup
    #[serde(default)]
    pub speed: Option<u32>,
}

impl DeviceConfig {
    /// Serial settings for this device.
    pub fn transport(&self) -> TransportSettings {
        TransportSettings::new(&self.port, self.baud_rate)
            .with_timeout(Duration::from_millis(self.timeout_ms))
    }

    /// Post-move settle delay.
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    /// Capacity from `capacity_volume`/`capacity_steps`, falling back to `default`.
    pub fn capacity_or(&self, default: PumpCapacity) -> PumpCapacity {
        PumpCapacity::new(
            self.capacity_volume.unwrap_or(default.volume),
            self.capacity_steps.unwrap_or(default.steps),
        )
    }
}

/// Motion-completion polling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Delay between status queries in milliseconds
    #[serde(default = "default_poll_interval")]
    pub interval_ms: u64,
    /// Give up after this many milliseconds. Omit to poll forever
    #[serde(default = "default_poll_deadline")]
    pub deadline_ms: Option<u64>,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval(),
            deadline_ms: default_poll_deadline(),
        }
    }
}

impl PollingConfig {
    /// Policy handed to every driver.
    pub fn policy(&self) -> PollPolicy {
        PollPolicy::default()
            .with_interval(Duration::from_millis(self.interval_ms))
            .with_deadline(self.deadline_ms.map(Duration::from_millis))
    }
}

// Default value functions
fn default_name() -> String {
    "rust_fluidics".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_verify_checksum() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    20
}

#[allow(clippy::unnecessary_wraps)]
fn default_poll_deadline() -> Option<u64> {
    Some(120_000)
}

impl FluidicsConfig {
    /// Load configuration from config/fluidics.toml and environment variables
    pub fn load() -> AppResult<Self> {
        Self::load_from("config/fluidics.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Self::figment(path.as_ref())
            .extract()
            .map_err(|e| FluidicsError::Config(Box::new(e)))
    }

    /// Provider stack used by [`load_from`](Self::load_from).
    pub fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("FLUIDICS_").split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        // Validate log level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        // Validate device roles
        match (&self.valve, self.pump.model) {
            (_, DeviceModel::Sv07) => {
                return Err("pump.model cannot be 'sv07', it is a valve".to_string());
            }
            (None, DeviceModel::Sy08) => {
                return Err("pump.model 'sy08' needs a [valve] section".to_string());
            }
            (Some(valve), _) if valve.model != DeviceModel::Sv07 => {
                return Err(format!(
                    "valve.model must be 'sv07', got '{:?}'",
                    valve.model
                ));
            }
            (Some(_), DeviceModel::Sy01b) => {
                return Err("pump.model 'sy01b' has its own valve, remove [valve]".to_string());
            }
            _ => {}
        }
        for (role, device) in self.devices() {
            validate_device(role, device)?;
        }

        // Validate polling
        if self.polling.deadline_ms == Some(0) {
            return Err("polling.deadline_ms must be positive".to_string());
        }

        self.router.validate()?;

        // Validate ports are present; the table checks range and uniqueness
        if self.port_table.is_none() {
            if self.ports.is_empty() {
                return Err("No stations configured: set [ports] or port_table".to_string());
            }
            self.inline_port_table().map_err(|e| e.to_string())?;
        }

        Ok(())
    }

    /// Configured devices with their role names.
    pub fn devices(&self) -> Vec<(&'static str, &DeviceConfig)> {
        let mut devices = Vec::with_capacity(2);
        if let Some(valve) = &self.valve {
            devices.push(("valve", valve));
        }
        devices.push(("pump", &self.pump));
        devices
    }

    /// Build the port table from `port_table` if set, otherwise from `ports`.
    pub fn port_table(&self) -> AppResult<PortTable> {
        match &self.port_table {
            Some(path) => PortTable::from_csv_path(path),
            None => self.inline_port_table(),
        }
    }

    fn inline_port_table(&self) -> AppResult<PortTable> {
        PortTable::from_pairs(self.ports.iter().map(|(k, v)| (k.clone(), *v)))
    }
}

fn validate_device(role: &str, device: &DeviceConfig) -> Result<(), String> {
    if device.port.trim().is_empty() {
        return Err(format!("{role}.port must not be empty"));
    }
    if device.baud_rate == 0 {
        return Err(format!("{role}.baud_rate must be positive"));
    }
    if device.ports == Some(0) {
        return Err(format!("{role}.ports must be positive"));
    }
    if let Some(volume) = device.capacity_volume {
        if !volume.is_finite() || volume <= 0.0 {
            return Err(format!("{role}.capacity_volume must be positive, got {volume}"));
        }
    }
    match (device.model, device.capacity_steps) {
        (DeviceModel::Sy08, Some(steps)) if steps == 0 || steps > u32::from(u16::MAX) => {
            return Err(format!(
                "{role}.capacity_steps must be between 1 and {}, got {steps}",
                u16::MAX
            ));
        }
        (DeviceModel::Sy01b, Some(_)) => {
            return Err(format!(
                "{role}.capacity_steps is fixed by the step mode on sy01b, use mode instead"
            ));
        }
        _ => {}
    }
    if device.mode.is_some() && device.model != DeviceModel::Sy01b {
        return Err(format!("{role}.mode only applies to sy01b"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[application]
name = "Test Bench"
log_level = "debug"

[valve]
model = "sv07"
port = "/dev/ttyUSB0"
ports = 8

[pump]
model = "sy08"
port = "/dev/ttyUSB1"
capacity_volume = 5.0
capacity_steps = 12000

[polling]
interval_ms = 10

[router]
air_volume = 0.5

[ports]
naoh = 2
cell = 5
waste = 6
air = 7
flush = 8
"#;

    fn write_config(text: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_from_file() {
        let file = write_config(SAMPLE);
        let config = FluidicsConfig::load_from(file.path()).unwrap();

        assert_eq!(config.application.name, "Test Bench");
        assert_eq!(config.pump.model, DeviceModel::Sy08);
        assert_eq!(config.pump.baud_rate, 9600);
        assert!(config.pump.verify_checksum);
        assert_eq!(config.valve.as_ref().and_then(|v| v.ports), Some(8));
        assert_eq!(config.polling.deadline_ms, Some(120_000));
        assert!((config.router.air_volume - 0.5).abs() < 1e-12);
        assert!((config.router.extra_volume - 5.0).abs() < 1e-12);
        assert_eq!(config.stations, StationNames::default());
        assert!(config.validate().is_ok());

        let table = config.port_table().unwrap();
        assert_eq!(table.resolve("flush").unwrap(), 8);
    }

    #[test]
    fn test_polling_policy() {
        let polling = PollingConfig {
            interval_ms: 5,
            deadline_ms: None,
        };
        let policy = polling.policy();
        assert_eq!(policy.interval, Duration::from_millis(5));
        assert_eq!(policy.deadline, None);
    }

    #[test]
    fn test_invalid_log_level() {
        let file = write_config(SAMPLE);
        let mut config = FluidicsConfig::load_from(file.path()).unwrap();
        config.application.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_ports() {
        let file = write_config(SAMPLE);
        let mut config = FluidicsConfig::load_from(file.path()).unwrap();
        config.ports.insert("hcl".to_string(), 2);
        let err = config.validate().unwrap_err();
        assert!(err.contains("share port 2"));
    }

    #[test]
    fn test_shared_port_rejected_on_both_load_paths() {
        let file = write_config(SAMPLE);
        let mut config = FluidicsConfig::load_from(file.path()).unwrap();
        config.ports.insert("hcl".to_string(), 6);
        assert!(config.port_table().is_err());

        let csv = write_config("title,port\nnaoh,2\nhcl,6\nwaste,6\n");
        config.port_table = Some(csv.path().to_path_buf());
        let err = config.port_table().unwrap_err();
        assert!(err.to_string().contains("share port 6"));
    }

    #[test]
    fn test_sy08_without_valve_is_rejected() {
        let file = write_config(SAMPLE);
        let mut config = FluidicsConfig::load_from(file.path()).unwrap();
        config.valve = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sy01b_stands_alone() {
        let text = r#"
[pump]
model = "sy01b"
port = "COM3"
capacity_volume = 500.0
mode = "micro"

[ports]
cell = 1
waste = 2
"#;
        let file = write_config(text);
        let config = FluidicsConfig::load_from(file.path()).unwrap();
        assert_eq!(config.pump.mode, Some(StepMode::Micro));
        assert!(config.valve.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_oversized_sy08_stroke() {
        let file = write_config(SAMPLE);
        let mut config = FluidicsConfig::load_from(file.path()).unwrap();
        config.pump.capacity_steps = Some(70_000);
        assert!(config.validate().unwrap_err().contains("capacity_steps"));
    }

    #[test]
    fn test_missing_pump_section() {
        let file = write_config("[application]\nname = \"x\"\n");
        assert!(matches!(
            FluidicsConfig::load_from(file.path()),
            Err(FluidicsError::Config(_))
        ));
    }

    #[test]
    fn test_capacity_falls_back_to_default() {
        let file = write_config(SAMPLE);
        let mut config = FluidicsConfig::load_from(file.path()).unwrap();
        config.pump.capacity_steps = None;
        let capacity = config.pump.capacity_or(PumpCapacity::new(1.0, 6000));
        assert_eq!(capacity.steps, 6000);
        assert!((capacity.volume - 5.0).abs() < 1e-12);
    }
}
