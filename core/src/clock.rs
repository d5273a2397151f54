//! Simulation clock: owns step state, the calendar anchor, and pause.

use crate::types::{RunId, Step};
use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimClock {
    pub run_id:       RunId,
    pub current_step: Step,
    /// First day of step 1.
    pub start_date:   NaiveDate,
    pub paused:       bool,
}

impl SimClock {
    pub fn new(run_id: RunId, start_date: NaiveDate) -> Self {
        Self {
            run_id,
            current_step: 0,
            start_date,
            paused: true,
        }
    }

    /// Advance one step. Returns the new step number.
    /// Panics if called while paused; callers must check.
    pub fn advance(&mut self) -> Step {
        assert!(!self.paused, "advance() called on paused clock");
        self.current_step += 1;
        self.current_step
    }

    pub fn pause(&mut self)  { self.paused = true;  }
    pub fn resume(&mut self) { self.paused = false; }

    /// First simulated day of `step` (steps are 1-based).
    pub fn step_start(&self, step: Step) -> NaiveDate {
        self.start_date + Days::new(7 * step.saturating_sub(1))
    }

    /// Last simulated day of `step`.
    pub fn step_end(&self, step: Step) -> NaiveDate {
        self.step_start(step) + Days::new(6)
    }
}
