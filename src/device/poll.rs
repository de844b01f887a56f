//! Motion-completion polling.

use crate::error::{AppResult, FluidicsError};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::trace;

/// How to wait for a device to report idle after a motion command.
///
/// `deadline: None` polls until the device answers idle, however long that takes. Motion on
/// these devices can legitimately take tens of seconds at low plunger speeds, so the default
/// deadline is generous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPolicy {
    /// Delay between status queries
    pub interval: Duration,
    /// Give up after this long
    pub deadline: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(20),
            deadline: Some(Duration::from_secs(120)),
        }
    }
}

impl PollPolicy {
    /// Poll forever. A jammed device will block the caller indefinitely.
    #[must_use]
    pub fn unbounded() -> Self {
        Self {
            deadline: None,
            ..Self::default()
        }
    }

    /// Back-to-back polling with no sleep, for simulated devices.
    #[must_use]
    pub fn immediate() -> Self {
        Self {
            interval: Duration::ZERO,
            deadline: Some(Duration::from_secs(10)),
        }
    }

    /// Replace the deadline.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Replace the interval.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Call `probe` until it returns `true`, an error, or the deadline passes.
    ///
    /// Returns the number of probes made. The probe always runs at least once, even with a
    /// zero deadline.
    pub fn wait_until<F>(&self, device: &str, mut probe: F) -> AppResult<u32>
    where
        F: FnMut() -> AppResult<bool>,
    {
        let start = Instant::now();
        let mut polls = 0u32;

        loop {
            polls = polls.saturating_add(1);
            if probe()? {
                trace!(device, polls, elapsed = ?start.elapsed(), "Device idle");
                return Ok(polls);
            }

            let elapsed = start.elapsed();
            if let Some(deadline) = self.deadline {
                if elapsed >= deadline {
                    return Err(FluidicsError::Timeout {
                        device: device.to_string(),
                        after: elapsed,
                    });
                }
            }

            if !self.interval.is_zero() {
                std::thread::sleep(self.interval);
            }
        }
    }
}
