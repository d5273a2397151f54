//! The simulation engine. Advances the rental business one week at a time.
//!
//! EXECUTION ORDER (fixed, documented, never reordered):
//!   1. Rental subsystem          (lifecycle → demand → allocation → commit)
//!   2. Reconciliation subsystem  (only when `reconcile_each_step` is set)
//!
//! RULES:
//!   - Subsystems execute in registration order, every step.
//!   - No subsystem calls another subsystem's functions directly.
//!   - All randomness flows through the RngBank.
//!   - Every emitted event is recorded in the event log.
//!   - Progress is recorded after each completed step, per shard, so an
//!     aborted run resumes from the last finished step.

use crate::{
    clock::SimClock,
    config::SimConfig,
    error::{SimError, SimResult},
    event::{EventLogEntry, SimEvent},
    reconciliation_subsystem::{ReconciliationReport, ReconciliationSubsystem},
    rental_subsystem::{RentalStepSummary, RentalSubsystem},
    rng::{RngBank, SubsystemSlot},
    store::SimStore,
    subsystem::SimSubsystem,
    types::{RunId, Step},
};
use chrono::NaiveDate;

pub struct SimEngine {
    pub run_id:   RunId,
    pub clock:    SimClock,
    pub rng_bank: RngBank,
    seed:         u64,
    config:       SimConfig,
    subsystems:   Vec<(SubsystemSlot, Box<dyn SimSubsystem>)>,
    pub store:    SimStore,
}

impl SimEngine {
    /// Build a fully wired engine for a run already registered in `store`.
    /// The configuration is validated here, before any step can run.
    pub fn build(run_id: RunId, seed: u64, config: SimConfig, store: SimStore) -> SimResult<Self> {
        config.validate()?;
        if store.run_seed(&run_id)?.is_none() {
            return Err(SimError::RunNotInitialized { run_id });
        }

        let mut engine = Self {
            clock: SimClock::new(run_id.clone(), config.start_date),
            rng_bank: RngBank::new(seed),
            seed,
            subsystems: Vec::new(),
            store,
            run_id,
            config,
        };

        // EXECUTION ORDER: fixed, never reordered.
        engine.register(
            SubsystemSlot::Rental,
            Box::new(RentalSubsystem::new(engine.config.clone())),
        );
        if engine.config.reconcile_each_step {
            engine.register(
                SubsystemSlot::Reconciliation,
                Box::new(ReconciliationSubsystem::new(engine.config.clone())),
            );
        }
        Ok(engine)
    }

    /// Continue a run from its persisted progress. The seed comes from
    /// the run record, the step from this shard's last completed step.
    pub fn resume(run_id: RunId, config: SimConfig, store: SimStore) -> SimResult<Self> {
        let seed = store
            .run_seed(&run_id)?
            .ok_or_else(|| SimError::RunNotInitialized { run_id: run_id.clone() })?;
        let last = store
            .last_completed_step(&run_id, config.shard.index)?
            .unwrap_or(0);
        let mut engine = Self::build(run_id, seed, config, store)?;
        engine.clock.current_step = last;
        log::info!("run {} resumed after step {last}", engine.run_id);
        Ok(engine)
    }

    /// In-memory, migrated store with the run registered. Used in tests.
    pub fn build_test(run_id: &str, seed: u64, config: SimConfig) -> SimResult<Self> {
        let store = SimStore::in_memory()?;
        store.migrate()?;
        store.insert_run(run_id, seed, "test", config.start_date)?;
        Self::build(run_id.to_string(), seed, config, store)
    }

    /// Register a subsystem. Call in the documented execution order.
    pub fn register(&mut self, slot: SubsystemSlot, subsystem: Box<dyn SimSubsystem>) {
        self.subsystems.push((slot, subsystem));
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Advance one step. This is the core simulation step.
    fn step(&mut self) -> SimResult<Vec<SimEvent>> {
        let step = self.clock.advance();
        let mut step_events = vec![SimEvent::StepStarted {
            step,
            week_start: self.clock.step_start(step),
        }];

        // Each subsystem sees all events emitted so far this step.
        for (slot, subsystem) in &mut self.subsystems {
            let mut rng = self.rng_bank.for_subsystem(*slot, step);
            let new_events = subsystem.update(&self.clock, &self.store, &step_events, &mut rng)?;
            for event in &new_events {
                append_event(&self.store, &self.run_id, step, subsystem.name(), event)?;
            }
            step_events.extend(new_events);
        }

        step_events.push(SimEvent::StepCompleted { step });
        self.store.record_step_completed(
            &self.run_id,
            self.config.shard.index,
            step,
            self.clock.step_end(step),
        )?;
        Ok(step_events)
    }

    /// Advance the simulation by `n` steps and return every event emitted.
    pub fn advance_steps(&mut self, n: u64) -> SimResult<Vec<SimEvent>> {
        // Emit RunInitialized at step 0 so seed differences are observable.
        if self.clock.current_step == 0 {
            let init = SimEvent::RunInitialized {
                run_id: self.run_id.clone(),
                seed: self.seed,
            };
            append_event(&self.store, &self.run_id, 0, "engine", &init)?;
        }

        let mut events = Vec::new();
        self.clock.resume();
        for _ in 0..n {
            match self.step() {
                Ok(step_events) => events.extend(step_events),
                Err(e) => {
                    self.clock.pause();
                    log::warn!("step {} aborted: {e}", self.clock.current_step);
                    return Err(e);
                }
            }
        }
        self.clock.pause();
        Ok(events)
    }

    /// Run a reconciliation pass as of `as_of` and log its events under
    /// the current step. Integrity violations are in the report, not the
    /// error; use `ReconciliationReport::into_result` to escalate them.
    pub fn run_reconciliation(&mut self, as_of: NaiveDate) -> SimResult<ReconciliationReport> {
        let report = ReconciliationSubsystem::new(self.config.clone()).run_pass(&self.store, as_of)?;
        for event in report.events() {
            append_event(&self.store, &self.run_id, self.clock.current_step, "reconciliation", &event)?;
        }
        Ok(report)
    }

    /// Query events for a specific step from the store.
    /// Used by the determinism test and replay tooling.
    pub fn store_events_for_step(&self, run_id: &str, step: Step) -> SimResult<Vec<EventLogEntry>> {
        self.store.events_for_step(run_id, step)
    }

    /// The rental subsystem's summary of the last completed step.
    /// Used by sim-runner to print end-of-run summaries.
    pub fn last_rental_summary(&self) -> Option<RentalStepSummary> {
        self.subsystems.iter().find_map(|(_, sub)| {
            sub.as_any()
                .downcast_ref::<RentalSubsystem>()
                .and_then(|r| r.last_summary)
        })
    }
}

fn append_event(
    store: &SimStore,
    run_id: &str,
    step: Step,
    subsystem: &str,
    event: &SimEvent,
) -> SimResult<()> {
    let entry = EventLogEntry {
        id:         None,
        run_id:     run_id.to_string(),
        step,
        subsystem:  subsystem.to_string(),
        event_type: event.event_type_name().to_string(),
        payload:    serde_json::to_string(event)?,
    };
    store.append_event(&entry)
}
