//! Simulated device firmware.
//!
//! Each simulator implements [`Transport`](crate::transport::Transport) and answers frames the
//! way the real device does: position bookkeeping, range rejection with device error codes, and
//! a configurable number of "busy" status polls after every motion. Drivers run unchanged on
//! top of them, which makes them useful both in tests and for `--simulate` runs of the CLI.
//!
//! - [`SimulatedSv07`]: selector valve, binary frames
//! - [`SimulatedSy08`]: syringe pump, binary frames
//! - [`SimulatedSy01b`]: pump-valve, DT ASCII

mod binary;
mod dt;

pub use binary::{SimulatedSv07, SimulatedSy08};
pub use dt::SimulatedSy01b;

use crate::error::{AppResult, FluidicsError};
use std::collections::VecDeque;

/// Pending reply bytes shared by all simulators.
#[derive(Debug, Default)]
struct ReplyBuffer {
    bytes: VecDeque<u8>,
    closed: bool,
}

impl ReplyBuffer {
    fn ensure_open(&self, device: &str) -> AppResult<()> {
        if self.closed {
            return Err(FluidicsError::transport(device, "port is closed"));
        }
        Ok(())
    }

    fn replace(&mut self, reply: Vec<u8>) {
        self.bytes.clear();
        self.bytes.extend(reply);
    }

    fn clear(&mut self) {
        self.bytes.clear();
    }

    fn take(&mut self, max_len: usize) -> Vec<u8> {
        let n = max_len.min(self.bytes.len());
        self.bytes.drain(..n).collect()
    }

    fn take_all(&mut self) -> Vec<u8> {
        self.bytes.drain(..).collect()
    }

    fn close(&mut self) {
        self.closed = true;
        self.bytes.clear();
    }
}
