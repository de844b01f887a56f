//! Interleaved delivery of several reagents into the cell.
//!
//! Each reagent is a [`MixTask`] that moves at most one increment per call to
//! [`MixTask::step`] and then suspends. A [`MixScheduler`] advances its tasks round-robin, one
//! step each per round, in submission order, so the reagents arrive in alternating slices rather
//! than one after the other. Nothing runs concurrently; the scheduler just calls `step` in turn.

use crate::device::{PortSelector, Syringe};
use crate::error::{AppResult, FluidicsError};
use crate::router::Router;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

/// Volumes below this are treated as delivered.
const EPSILON: f64 = 1e-9;

/// Lifecycle of a [`MixTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// Not stepped yet
    Pending,
    /// Stepped at least once, volume left
    Suspended,
    /// Everything delivered
    Finished,
}

/// One reagent's pending delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct MixTask {
    reagent: String,
    target: f64,
    remaining: f64,
    increment: f64,
    state: TaskState,
}

impl MixTask {
    /// Deliver `volume` of `reagent` in a single step.
    pub fn new(reagent: impl Into<String>, volume: f64) -> AppResult<Self> {
        if !volume.is_finite() || volume < 0.0 {
            return Err(FluidicsError::range("volume", volume, 0.0, f64::MAX));
        }
        let state = if volume < EPSILON {
            TaskState::Finished
        } else {
            TaskState::Pending
        };
        Ok(Self {
            reagent: reagent.into(),
            target: volume,
            remaining: volume,
            increment: volume,
            state,
        })
    }

    /// Deliver in steps of at most `increment`.
    pub fn with_increment(mut self, increment: f64) -> AppResult<Self> {
        if !increment.is_finite() || increment <= 0.0 {
            return Err(FluidicsError::range("increment", increment, EPSILON, f64::MAX));
        }
        self.increment = increment;
        Ok(self)
    }

    /// Reagent station name.
    pub fn reagent(&self) -> &str {
        &self.reagent
    }

    /// Total volume requested.
    pub fn target(&self) -> f64 {
        self.target
    }

    /// Volume still to deliver.
    pub fn remaining(&self) -> f64 {
        self.remaining
    }

    /// Current state.
    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Nothing left to deliver.
    pub fn is_finished(&self) -> bool {
        self.state == TaskState::Finished
    }

    fn next_amount(&self) -> f64 {
        self.increment.min(self.remaining)
    }

    /// Dispense the next increment and suspend. Returns the volume delivered.
    ///
    /// A finished task delivers nothing. On error the task keeps its remaining volume.
    pub fn step<V: PortSelector, P: Syringe>(
        &mut self,
        router: &mut Router<V, P>,
    ) -> AppResult<f64> {
        if self.is_finished() {
            return Ok(0.0);
        }
        let amount = self.next_amount();
        let delivered = router.dispense(&self.reagent, amount)?;

        self.remaining -= amount;
        self.state = if self.remaining < EPSILON {
            self.remaining = 0.0;
            TaskState::Finished
        } else {
            TaskState::Suspended
        };
        debug!(
            reagent = %self.reagent,
            delivered,
            remaining = self.remaining,
            "Mix step"
        );
        Ok(delivered)
    }

    /// Dispense the next increment without counting it against the remaining volume.
    pub fn rehearse<V: PortSelector, P: Syringe>(
        &self,
        router: &mut Router<V, P>,
    ) -> AppResult<f64> {
        if self.is_finished() {
            return Ok(0.0);
        }
        router.dispense(&self.reagent, self.next_amount())
    }
}

/// Round-robin driver for a set of [`MixTask`]s.
#[derive(Debug, Default)]
pub struct MixScheduler {
    tasks: Vec<MixTask>,
}

impl MixScheduler {
    /// No tasks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task; it runs after those already submitted.
    pub fn submit(&mut self, task: MixTask) {
        self.tasks.push(task);
    }

    /// Tasks still in the queue, in submission order.
    pub fn tasks(&self) -> &[MixTask] {
        &self.tasks
    }

    /// Every task has finished.
    pub fn is_done(&self) -> bool {
        self.tasks.iter().all(MixTask::is_finished)
    }

    /// Every queued reagent, finished or not, must be a known station.
    fn check_stations<V: PortSelector, P: Syringe>(&self, router: &Router<V, P>) -> AppResult<()> {
        for task in &self.tasks {
            router.ports().resolve(task.reagent())?;
        }
        Ok(())
    }

    /// Step each unfinished task once, in submission order. Returns the total delivered.
    ///
    /// Finished tasks are dropped from the queue after the round.
    #[instrument(skip_all, fields(tasks = self.tasks.len()), err)]
    pub fn run_round<V: PortSelector, P: Syringe>(
        &mut self,
        router: &mut Router<V, P>,
    ) -> AppResult<f64> {
        self.check_stations(router)?;
        let mut total = 0.0;
        for task in self.tasks.iter_mut().filter(|t| !t.is_finished()) {
            total += task.step(router)?;
        }
        self.tasks.retain(|t| !t.is_finished());
        debug!(total, "Mix round complete");
        Ok(total)
    }

    /// Rehearse one round to wet every line, then clean out what it delivered.
    ///
    /// No task's remaining volume changes.
    #[instrument(skip_all, err)]
    pub fn prime_round<V: PortSelector, P: Syringe>(
        &mut self,
        router: &mut Router<V, P>,
    ) -> AppResult<f64> {
        self.check_stations(router)?;
        let mut total = 0.0;
        for task in &self.tasks {
            total += task.rehearse(router)?;
        }
        router.clean(total)?;
        info!(total, "Mix lines primed");
        Ok(total)
    }

    /// Run rounds until every task is finished. Returns the total delivered.
    #[instrument(skip_all, err)]
    pub fn run_to_completion<V: PortSelector, P: Syringe>(
        &mut self,
        router: &mut Router<V, P>,
    ) -> AppResult<f64> {
        self.check_stations(router)?;
        let mut total = 0.0;
        let mut rounds = 0u32;
        while !self.is_done() {
            total += self.run_round(router)?;
            rounds += 1;
        }
        self.tasks.clear();
        info!(total, rounds, "Mix complete");
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_defaults_to_one_step() {
        let task = MixTask::new("naoh", 3.0).unwrap();
        assert_eq!(task.state(), TaskState::Pending);
        assert!((task.next_amount() - 3.0).abs() < 1e-12);
    }

    #[test]
    fn increment_caps_the_step() {
        let task = MixTask::new("naoh", 3.0).unwrap().with_increment(1.25).unwrap();
        assert!((task.next_amount() - 1.25).abs() < 1e-12);
    }

    #[test]
    fn zero_volume_task_starts_finished() {
        assert!(MixTask::new("naoh", 0.0).unwrap().is_finished());
    }

    #[test]
    fn bad_volumes_are_range_errors() {
        assert!(matches!(
            MixTask::new("naoh", -1.0),
            Err(FluidicsError::Range { .. })
        ));
        assert!(matches!(
            MixTask::new("naoh", 1.0).unwrap().with_increment(0.0),
            Err(FluidicsError::Range { .. })
        ));
    }
}
