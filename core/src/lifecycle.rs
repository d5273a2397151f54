//! Customer lifecycle tracker: the sole authority on who transacts.
//!
//! State machine per customer:
//!   active   → inactive  (churn draw, or K consecutive steps without a rental)
//!   inactive → active    (reactivation draw)
//!   new customers enter active.
//!
//! Execution per step:
//!   1. begin_step: onboard, then draw churn and reactivation. The active
//!      set that remains is the step's transacting population.
//!   2. end_step: fold in who actually rented, update streaks, retire
//!      customers whose streak reached the inactivity threshold.
//!
//! Only shard 0 onboards; new ids spread over shards by modulo and are
//! picked up by their owning worker.
//!
//! Each row carries the last step it was begun and settled in, so a step
//! interrupted after either phase is not applied twice on resume.

use crate::{
    config::{LifecycleConfig, ShardConfig},
    error::SimResult,
    rng::SubsystemRng,
    store::{CustomerLifecycleRow, SimStore},
    types::{ActivityStatus, CustomerId, Step},
};
use chrono::NaiveDate;
use std::collections::HashMap;

/// Population movement over one step, for this worker's shard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LifecycleSummary {
    pub active_before: u64,
    pub onboarded:     u64,
    pub churned:       u64,
    pub reactivated:   u64,
    pub went_inactive: u64,
    pub active:        u64,
    pub inactive:      u64,
}

impl LifecycleSummary {
    /// Active count implied by the movements. Always equals `active`.
    pub fn expected_active(&self) -> u64 {
        (self.active_before + self.onboarded + self.reactivated)
            .saturating_sub(self.churned + self.went_inactive)
    }
}

pub struct LifecycleTracker {
    config:  LifecycleConfig,
    shard:   ShardConfig,
    step:    Step,
    rows:    Vec<CustomerLifecycleRow>,
    summary: LifecycleSummary,
}

impl LifecycleTracker {
    pub fn new(config: &LifecycleConfig, shard: ShardConfig) -> Self {
        Self {
            config: config.clone(),
            shard,
            step: 0,
            rows: Vec::new(),
            summary: LifecycleSummary::default(),
        }
    }

    /// Apply onboarding, churn and reactivation for `step`, persist the
    /// transitions, and return the transacting population in id order.
    ///
    /// Re-running a step that was interrupted part way only onboards the
    /// customers still missing and leaves already-drawn rows alone. The
    /// summary then covers the movements of this attempt.
    pub fn begin_step(
        &mut self,
        store: &SimStore,
        step: Step,
        step_start: NaiveDate,
        rng: &mut SubsystemRng,
    ) -> SimResult<Vec<CustomerId>> {
        let mut rows = store.lifecycle_rows(self.shard)?;
        let mut summary = LifecycleSummary {
            active_before: rows.iter().filter(|r| r.status == ActivityStatus::Active).count() as u64,
            ..LifecycleSummary::default()
        };

        if self.shard.index == 0 {
            let already_joined = store.customers_joined_in_step(step)?;
            for slot in 0..u64::from(self.config.new_customers_per_step) {
                let loyal = rng.chance(self.config.loyal_fraction);
                if slot < already_joined {
                    continue;
                }
                let customer_id = store.onboard_customer(step_start, loyal, step)?;
                if self.shard.owns(customer_id) {
                    summary.onboarded += 1;
                    rows.push(CustomerLifecycleRow {
                        customer_id,
                        joined_on: step_start,
                        status: ActivityStatus::Active,
                        last_transaction_on: None,
                        inactivity_streak: 0,
                        loyal,
                        joined_step: Some(step),
                        begun_step: None,
                        settled_step: None,
                    });
                }
            }
        }

        let churn_open = step > self.config.ramp_up_steps as Step;
        let mut begun = Vec::new();
        for row in rows.iter_mut().filter(|r| r.begun_step != Some(step)) {
            match row.status {
                ActivityStatus::Active => {
                    let tenure_steps = (step_start - row.joined_on).num_days() / 7;
                    let eligible = churn_open
                        && !row.loyal
                        && tenure_steps >= self.config.churn_grace_steps as i64;
                    if eligible && rng.chance(self.config.churn_probability) {
                        row.status = ActivityStatus::Inactive;
                        summary.churned += 1;
                    }
                }
                ActivityStatus::Inactive => {
                    if rng.chance(self.config.reactivation_probability) {
                        row.status = ActivityStatus::Active;
                        row.inactivity_streak = 0;
                        summary.reactivated += 1;
                    }
                }
            }
            row.begun_step = Some(step);
            begun.push(row.clone());
        }
        store.save_lifecycle_rows(&begun)?;

        let transacting = rows
            .iter()
            .filter(|r| r.status == ActivityStatus::Active)
            .map(|r| r.customer_id)
            .collect();
        self.step = step;
        self.rows = rows;
        self.summary = summary;
        Ok(transacting)
    }

    /// Record the step's rentals (`transacted` maps customer to the day of
    /// their last rental this step) and apply the inactivity threshold.
    /// Rows already settled for this step are counted but not touched.
    pub fn end_step(
        &mut self,
        store: &SimStore,
        transacted: &HashMap<CustomerId, NaiveDate>,
    ) -> SimResult<LifecycleSummary> {
        let threshold = self.config.inactivity_threshold_steps;
        let step = self.step;
        let mut summary = self.summary;

        let mut settled = Vec::new();
        for row in self.rows.iter_mut().filter(|r| r.settled_step != Some(step)) {
            row.settled_step = Some(step);
            if let Some(day) = transacted.get(&row.customer_id) {
                row.last_transaction_on = Some(*day);
                row.inactivity_streak = 0;
            } else {
                row.inactivity_streak = row.inactivity_streak.saturating_add(1);
                if row.status == ActivityStatus::Active && row.inactivity_streak >= threshold {
                    row.status = ActivityStatus::Inactive;
                    summary.went_inactive += 1;
                }
            }
            settled.push(row.clone());
        }
        store.save_lifecycle_rows(&settled)?;

        summary.active = self.rows.iter().filter(|r| r.status == ActivityStatus::Active).count() as u64;
        summary.inactive = self.rows.len() as u64 - summary.active;
        self.rows.clear();
        self.summary = LifecycleSummary::default();
        Ok(summary)
    }
}
