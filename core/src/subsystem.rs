//! Subsystem trait and registry.
//!
//! RULE: Every per-step subsystem implements SimSubsystem.
//! The engine calls update() on each registered subsystem
//! in registration order, every step.
//! Execution order is fixed and documented in engine.rs.

use crate::{
    clock::SimClock,
    error::SimResult,
    event::SimEvent,
    rng::SubsystemRng,
    store::SimStore,
};
use std::any::Any;

/// The contract every subsystem must fulfill.
pub trait SimSubsystem: Send {
    /// Unique stable name for this subsystem.
    fn name(&self) -> &'static str;

    /// Called once per step by the engine.
    ///
    /// - `clock`:     the clock, already advanced to the current step
    /// - `store`:     the run's store; the only way to touch persisted state
    /// - `events_in`: events emitted by earlier subsystems this step
    /// - `rng`:       this subsystem's deterministic RNG for this step
    ///
    /// Returns a vec of new events to add to the step's event log.
    fn update(
        &mut self,
        clock: &SimClock,
        store: &SimStore,
        events_in: &[SimEvent],
        rng: &mut SubsystemRng,
    ) -> SimResult<Vec<SimEvent>>;

    /// For downcasting in tests and tooling only.
    /// Production sim code never uses this.
    fn as_any(&self) -> &dyn Any;
}
