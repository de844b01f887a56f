//! Custom error types for the crate.
//!
//! This module defines the primary error type, `FluidicsError`, shared by the transports,
//! device drivers and the routing layer. Using the `thiserror` crate, it provides a single
//! taxonomy for everything that can go wrong between a station name and a plunger move.
//!
//! ## Error Hierarchy
//!
//! - **`Range`**: a requested volume, position, speed or port lies outside the legal interval
//!   of the device. Always raised before any frame is transmitted.
//! - **`Lookup`**: a station name has no entry in the port table.
//! - **`Transport`**: the serial channel failed to open, write or read, or stayed silent after
//!   the single empty-response re-read.
//! - **`Timeout`**: motion-completion polling exceeded its deadline.
//! - **`State`**: an operation needs setup that is missing (measuring before calibration,
//!   malformed port table).
//! - **`Protocol`**: a response frame could not be parsed or failed its checksum.
//! - **`DeviceFault`**: the device answered with a non-zero error code.
//! - **`Config`**, **`Csv`**, **`Io`**: wrapped errors from figment, csv and std.
//!
//! By using `#[from]`, the wrapped variants are created implicitly with the `?` operator.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, FluidicsError>;

/// Primary error type for device drivers and volume routing.
#[derive(Error, Debug)]
pub enum FluidicsError {
    /// A value fell outside the interval the device accepts.
    #[error("{quantity} {value} out of range [{min}, {max}]")]
    Range {
        /// What was being validated ("port", "position", "speed", ...)
        quantity: &'static str,
        /// The rejected value
        value: f64,
        /// Inclusive lower bound
        min: f64,
        /// Inclusive upper bound
        max: f64,
    },

    /// A station name is not present in the port table.
    #[error("Unknown station '{0}'")]
    Lookup(String),

    /// The underlying channel failed.
    #[error("Transport error on {device}: {message}")]
    Transport {
        /// Device label used in logs
        device: String,
        /// Failure description
        message: String,
    },

    /// Motion-completion polling ran past its deadline.
    #[error("{device} did not report idle within {after:?}")]
    Timeout {
        /// Device label used in logs
        device: String,
        /// Elapsed polling time
        after: Duration,
    },

    /// A prerequisite is missing.
    #[error("Invalid state: {0}")]
    State(String),

    /// A response could not be decoded.
    #[error("Protocol error from {device}: {message}")]
    Protocol {
        /// Device label used in logs
        device: String,
        /// Failure description
        message: String,
    },

    /// The device reported an error code in its status.
    #[error("{device} reported error {code}: {description}")]
    DeviceFault {
        /// Device label used in logs
        device: String,
        /// Raw error code
        code: u8,
        /// Human readable meaning of the code
        description: &'static str,
    },

    /// Configuration extraction failed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Port table parsing failed.
    #[error("Port table error: {0}")]
    Csv(#[from] csv::Error),

    /// File or OS level I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FluidicsError {
    /// Build a [`FluidicsError::Range`] from any numeric bounds.
    pub fn range(
        quantity: &'static str,
        value: impl Into<f64>,
        min: impl Into<f64>,
        max: impl Into<f64>,
    ) -> Self {
        FluidicsError::Range {
            quantity,
            value: value.into(),
            min: min.into(),
            max: max.into(),
        }
    }

    /// Build a [`FluidicsError::Transport`].
    pub fn transport(device: impl Into<String>, message: impl Into<String>) -> Self {
        FluidicsError::Transport {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Build a [`FluidicsError::Protocol`].
    pub fn protocol(device: impl Into<String>, message: impl Into<String>) -> Self {
        FluidicsError::Protocol {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Whether retrying the same call later could plausibly succeed.
    ///
    /// Validation failures never recover without changing the request; channel and
    /// device-side failures may clear after a reset or reconnect.
    pub fn can_recover(&self) -> bool {
        matches!(
            self,
            FluidicsError::Transport { .. }
                | FluidicsError::Timeout { .. }
                | FluidicsError::Protocol { .. }
                | FluidicsError::DeviceFault { .. }
        )
    }
}

impl From<figment::Error> for FluidicsError {
    fn from(value: figment::Error) -> Self {
        FluidicsError::Config(Box::new(value))
    }
}
