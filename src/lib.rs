//! # Rust Fluidics Core Library
//!
//! This crate drives laboratory fluidic hardware (syringe pumps and rotary selector valves) over
//! their serial protocols, and composes those devices into a small plumbing network that moves
//! measured volumes of named reagents between stations such as a reaction cell, a waste line,
//! an air line and a flush line.
//!
//! ## Crate Structure
//!
//! Leaves first:
//!
//! - **`error`**: the `FluidicsError` enum and `AppResult` alias shared by every layer.
//! - **`transport`**: the blocking `Transport` trait, the serial port implementation and a
//!   scripted mock.
//! - **`protocol`**: frame codecs for the binary (SV07/SY08) and DT ASCII (SY01B) protocols.
//! - **`device`**: capability traits (`PortSelector`, `Syringe`), motion polling and the
//!   per-model drivers.
//! - **`sim`**: in-process firmware simulators that implement `Transport`.
//! - **`stations`**: the station name to valve port table.
//! - **`records`**: transfer records and the sinks that receive them.
//! - **`sensor`**: pH probe, calibration curves and the `Calibrator` seam.
//! - **`router`**: volume routing between stations and the derived cleaning/priming workflows.
//! - **`mixing`**: round-robin interleaving of several reagent deliveries.
//! - **`config`**: figment-based configuration loading and validation.
//! - **`logging`**: tracing subscriber setup.
//! - **`rig`**: builds a router from configuration, on hardware or simulators.

pub mod config;
pub mod device;
pub mod error;
pub mod logging;
pub mod mixing;
pub mod protocol;
pub mod records;
pub mod rig;
pub mod router;
pub mod sensor;
pub mod sim;
pub mod stations;
pub mod transport;

pub use error::{AppResult, FluidicsError};
