//! Station names and the port table.
//!
//! A station is a logical place on the bench ("naoh", "cell", "waste") wired to one valve port.
//! The [`PortTable`] is built once, validated at load, and only read afterwards.
//!
//! Tables come from `(name, port)` pairs, a TOML map in the configuration file, or a CSV file
//! with `title` and `port` columns and an optional `conc` column:
//!
//! ```text
//! title,port,conc
//! naoh,2,0.1
//! cell,5,
//! waste,6,
//! ```

use crate::error::{AppResult, FluidicsError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use tracing::debug;

/// One row of the table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Station {
    /// Valve port, 1-based
    pub port: u8,
    /// Reagent concentration from the optional `conc` column
    pub concentration: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct PortRow {
    title: String,
    port: i64,
    #[serde(default)]
    conc: Option<f64>,
}

/// Unique station name to valve port.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PortTable {
    stations: BTreeMap<String, Station>,
}

impl PortTable {
    /// Build from `(name, port)` pairs.
    ///
    /// Duplicate names, shared ports and ports outside `1..=255` are state errors.
    pub fn from_pairs<I, S>(pairs: I) -> AppResult<Self>
    where
        I: IntoIterator<Item = (S, i64)>,
        S: Into<String>,
    {
        let mut table = Self::default();
        for (name, port) in pairs {
            table.insert(name.into(), port, None)?;
        }
        Ok(table)
    }

    /// Build from a CSV file.
    pub fn from_csv_path(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)?;
        let table = Self::from_csv_reader(file)?;
        debug!(path = %path.display(), stations = table.len(), "Port table loaded");
        Ok(table)
    }

    /// Build from CSV text with `title`, `port` and optional `conc` columns.
    pub fn from_csv_reader<R: Read>(reader: R) -> AppResult<Self> {
        let mut csv_reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);

        let headers = csv_reader.headers()?.clone();
        for required in ["title", "port"] {
            if !headers.iter().any(|h| h == required) {
                return Err(FluidicsError::State(format!(
                    "port table is missing the '{required}' column"
                )));
            }
        }

        let mut table = Self::default();
        for row in csv_reader.deserialize::<PortRow>() {
            let row = row?;
            table.insert(row.title, row.port, row.conc)?;
        }
        Ok(table)
    }

    fn insert(&mut self, name: String, port: i64, concentration: Option<f64>) -> AppResult<()> {
        let port = u8::try_from(port)
            .ok()
            .filter(|p| *p >= 1)
            .ok_or_else(|| {
                FluidicsError::State(format!("station '{name}' has invalid port {port}"))
            })?;
        if self.stations.contains_key(&name) {
            return Err(FluidicsError::State(format!(
                "station '{name}' is listed more than once"
            )));
        }
        if let Some((other, _)) = self.stations.iter().find(|(_, s)| s.port == port) {
            return Err(FluidicsError::State(format!(
                "stations '{other}' and '{name}' share port {port}"
            )));
        }
        self.stations.insert(
            name,
            Station {
                port,
                concentration,
            },
        );
        Ok(())
    }

    /// Port wired to `name`.
    pub fn resolve(&self, name: &str) -> AppResult<u8> {
        self.station(name).map(|s| s.port)
    }

    /// Full row for `name`.
    pub fn station(&self, name: &str) -> AppResult<Station> {
        self.stations
            .get(name)
            .copied()
            .ok_or_else(|| FluidicsError::Lookup(name.to_string()))
    }

    /// Concentration from the `conc` column, if one was given.
    pub fn concentration(&self, name: &str) -> AppResult<Option<f64>> {
        self.station(name).map(|s| s.concentration)
    }

    /// Check every port fits on a valve with `port_count` ports.
    pub fn check_fits(&self, port_count: u8) -> AppResult<()> {
        for station in self.stations.values() {
            if station.port > port_count {
                return Err(FluidicsError::range("port", station.port, 1u8, port_count));
            }
        }
        Ok(())
    }

    /// Number of stations.
    pub fn len(&self) -> usize {
        self.stations.len()
    }

    /// No stations loaded.
    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }

    /// Stations in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Station)> {
        self.stations.iter().map(|(name, station)| (name.as_str(), station))
    }
}

/// Names of the fixed stations every workflow relies on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationNames {
    /// Reaction cell
    #[serde(default = "default_cell")]
    pub cell: String,
    /// Waste line
    #[serde(default = "default_waste")]
    pub waste: String,
    /// Air line
    #[serde(default = "default_air")]
    pub air: String,
    /// Flush (rinse solvent) line
    #[serde(default = "default_flush")]
    pub flush: String,
}

fn default_cell() -> String {
    "cell".to_string()
}

fn default_waste() -> String {
    "waste".to_string()
}

fn default_air() -> String {
    "air".to_string()
}

fn default_flush() -> String {
    "flush".to_string()
}

impl Default for StationNames {
    fn default() -> Self {
        Self {
            cell: default_cell(),
            waste: default_waste(),
            air: default_air(),
            flush: default_flush(),
        }
    }
}

impl StationNames {
    /// All four names, for up-front resolution.
    #[must_use]
    pub fn all(&self) -> [&str; 4] {
        [&self.cell, &self.waste, &self.air, &self.flush]
    }
}
