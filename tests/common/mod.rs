//! Recording test doubles shared by the integration tests.
//!
//! `RecordingValve` and `RecordingPump` append every call to one shared operation log, so a test
//! can assert on the exact interleaving of valve and pump moves.

#![allow(dead_code)]

use rust_fluidics::device::{PortSelector, PumpCapacity, Syringe};
use rust_fluidics::error::{AppResult, FluidicsError};
use rust_fluidics::stations::PortTable;
use std::cell::RefCell;
use std::rc::Rc;

/// One device call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Select(u8),
    Aspirate(u32),
    Dispense(u32),
    MoveTo(u32),
    Reset,
    Speed(u32),
}

pub type OpLog = Rc<RefCell<Vec<Op>>>;

pub struct RecordingValve {
    log: OpLog,
    ports: u8,
    current: Option<u8>,
}

impl RecordingValve {
    pub fn new(log: &OpLog, ports: u8) -> Self {
        Self {
            log: Rc::clone(log),
            ports,
            current: None,
        }
    }
}

impl PortSelector for RecordingValve {
    fn port_count(&self) -> u8 {
        self.ports
    }

    fn select_port(&mut self, port: u8) -> AppResult<()> {
        if !(1..=self.ports).contains(&port) {
            return Err(FluidicsError::range("port", port, 1u8, self.ports));
        }
        self.log.borrow_mut().push(Op::Select(port));
        self.current = Some(port);
        Ok(())
    }

    fn current_port(&self) -> Option<u8> {
        self.current
    }
}

pub struct RecordingPump {
    log: OpLog,
    capacity: PumpCapacity,
    position: u32,
    /// Fail the n-th aspirate (1-based) with a transport error
    fail_on_aspirate: Option<usize>,
    aspirates: usize,
}

impl RecordingPump {
    pub fn new(log: &OpLog, capacity: PumpCapacity) -> Self {
        Self {
            log: Rc::clone(log),
            capacity,
            position: 0,
            fail_on_aspirate: None,
            aspirates: 0,
        }
    }

    pub fn failing_on_aspirate(mut self, n: usize) -> Self {
        self.fail_on_aspirate = Some(n);
        self
    }

    pub fn position(&self) -> u32 {
        self.position
    }
}

impl Syringe for RecordingPump {
    fn capacity(&self) -> PumpCapacity {
        self.capacity
    }

    fn aspirate_steps(&mut self, steps: u32) -> AppResult<()> {
        self.aspirates += 1;
        if self.fail_on_aspirate == Some(self.aspirates) {
            return Err(FluidicsError::transport("recording pump", "line dropped"));
        }
        let target = self.position + steps;
        if target > self.capacity.steps {
            return Err(FluidicsError::range("position", target, 0u32, self.capacity.steps));
        }
        self.log.borrow_mut().push(Op::Aspirate(steps));
        self.position = target;
        Ok(())
    }

    fn dispense_steps(&mut self, steps: u32) -> AppResult<()> {
        if steps > self.position {
            return Err(FluidicsError::range("position", -1.0, 0u32, self.capacity.steps));
        }
        self.log.borrow_mut().push(Op::Dispense(steps));
        self.position -= steps;
        Ok(())
    }

    fn move_to_absolute(&mut self, position: u32) -> AppResult<()> {
        if position > self.capacity.steps {
            return Err(FluidicsError::range("position", position, 0u32, self.capacity.steps));
        }
        self.log.borrow_mut().push(Op::MoveTo(position));
        self.position = position;
        Ok(())
    }

    fn query_position(&mut self) -> AppResult<u32> {
        Ok(self.position)
    }

    fn reset(&mut self) -> AppResult<()> {
        self.log.borrow_mut().push(Op::Reset);
        self.position = 0;
        Ok(())
    }

    fn set_speed(&mut self, speed: u32) -> AppResult<()> {
        self.log.borrow_mut().push(Op::Speed(speed));
        Ok(())
    }
}

/// 5 mL syringe with a 12000 step stroke.
pub fn five_ml() -> PumpCapacity {
    PumpCapacity::new(5.0, 12000)
}

/// `{naoh:2, cell:5, waste:6, air:7, flush:8}` plus an `hcl` line on 3.
pub fn bench_ports() -> PortTable {
    PortTable::from_pairs([
        ("naoh", 2),
        ("hcl", 3),
        ("cell", 5),
        ("waste", 6),
        ("air", 7),
        ("flush", 8),
    ])
    .unwrap()
}

/// Steps for `volume` on the 5 mL syringe.
pub fn steps(volume: f64) -> u32 {
    five_ml().steps_for(volume).unwrap()
}

/// One transfer cycle as the router issues it.
pub fn cycle(from: u8, to: u8, steps: u32) -> [Op; 4] {
    [
        Op::Select(from),
        Op::Aspirate(steps),
        Op::Select(to),
        Op::Dispense(steps),
    ]
}
