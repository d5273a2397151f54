//! The event log: per-step and per-pass summaries.
//!
//! RULE: Events are summaries. A step emits a bounded number of events
//! regardless of how many loans it commits.

use crate::types::{LoanId, RunId, Step, UnitId};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Every event emitted during simulation.
/// Variants are appended only, never removed or reordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SimEvent {
    // ── Engine events ──────────────────────────────
    StepStarted {
        step: Step,
        week_start: NaiveDate,
    },
    StepCompleted {
        step: Step,
    },
    RunInitialized {
        run_id: RunId,
        seed: u64,
    },

    // ── Lifecycle events ───────────────────────────
    LifecycleAdvanced {
        step: Step,
        active_before: u64,
        onboarded: u64,
        churned: u64,
        reactivated: u64,
        went_inactive: u64,
        active: u64,
        inactive: u64,
    },

    // ── Rental events ──────────────────────────────
    SpikeDay {
        step: Step,
        date: NaiveDate,
        volume: u64,
    },
    RentalsScheduled {
        step: Step,
        target_volume: u64,
        loans_committed: u64,
        allocation_misses: u64,
        lost_races: u64,
        returns_recorded: u64,
        payments_recorded: u64,
    },

    // ── Reconciliation events ──────────────────────
    ReconciliationCompleted {
        as_of: NaiveDate,
        fees_upserted: u64,
        fees_finalized: u64,
        accounts_recomputed: u64,
        audit_events_emitted: u64,
        integrity_violations: u64,
    },
    IntegrityViolationDetected {
        as_of: NaiveDate,
        unit_id: UnitId,
        loan_ids: Vec<LoanId>,
    },
}

impl SimEvent {
    /// Stable name for the event_type column in event_log.
    pub fn event_type_name(&self) -> &'static str {
        match self {
            SimEvent::StepStarted { .. }                => "step_started",
            SimEvent::StepCompleted { .. }              => "step_completed",
            SimEvent::RunInitialized { .. }             => "run_initialized",
            SimEvent::LifecycleAdvanced { .. }          => "lifecycle_advanced",
            SimEvent::SpikeDay { .. }                   => "spike_day",
            SimEvent::RentalsScheduled { .. }           => "rentals_scheduled",
            SimEvent::ReconciliationCompleted { .. }    => "reconciliation_completed",
            SimEvent::IntegrityViolationDetected { .. } => "integrity_violation_detected",
        }
    }
}

/// A persisted event log row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub id:         Option<i64>,
    pub run_id:     RunId,
    pub step:       Step,
    pub subsystem:  String,
    pub event_type: String,
    pub payload:    String,
}
