//! Rental subsystem: drives one simulated week of rentals and returns.
//!
//! Execution order within a step:
//!   1. Lifecycle tracker decides the transacting population.
//!   2. Demand model plans each day's volume.
//!   3. Allocator loads its per-step state (distribution, stock, recency).
//!   4. For each day: record returns due that day (units become available
//!      again), then draw a customer per unit of volume, allocate, and
//!      commit the loan with its rental payment.
//!   5. Lifecycle tracker folds in who rented.
//!
//! Design:
//!   - A loan is committed together with its rental payment, and a return
//!     together with any late-fee payment made at the counter. Aborting
//!     mid-step leaves a consistent prefix.
//!   - Re-running an interrupted step tops each day up to its planned
//!     volume instead of replaying it, and returns already recorded are
//!     not due any more. The re-run's draws differ from an uninterrupted
//!     step, so the loans it adds are not the ones the lost attempt would
//!     have made.
//!   - Allocation misses are counted and reported once per step.
//!   - A customer is drawn uniformly from the tracker's population; the
//!     scheduler never decides eligibility itself.

use crate::{
    allocator::{AllocationOutcome, Allocator, LoanRequest},
    clock::SimClock,
    config::{ReturnConfig, SimConfig},
    demand::DemandModel,
    error::SimResult,
    event::SimEvent,
    lifecycle::{LifecycleSummary, LifecycleTracker},
    reconciliation_subsystem::{days_overdue, late_fee_for},
    rng::SubsystemRng,
    store::{ReturnOutcome, SimStore},
    subsystem::SimSubsystem,
    types::{round_cents, CatalogItemId, CustomerId, LoanId, Step, UnitId},
};
use chrono::{Datelike, Days, NaiveDate, Weekday};
use std::collections::{BTreeMap, HashMap};

// ── Return planning ──────────────────────────────────────────────────────────

pub struct ReturnPlanner<'a> {
    config: &'a ReturnConfig,
}

impl<'a> ReturnPlanner<'a> {
    pub fn new(config: &'a ReturnConfig) -> Self {
        Self { config }
    }

    /// Planned return day for a rental starting `rented_on`, or None if the
    /// copy will never come back.
    pub fn plan_return(&self, rented_on: NaiveDate, rng: &mut SubsystemRng) -> Option<NaiveDate> {
        if rng.chance(self.config.lost_probability) {
            return None;
        }
        let idx = rng.weighted_index(&self.config.duration_weights).unwrap_or(0);
        let mut days = self.config.duration_days.get(idx).copied().unwrap_or(3);
        if rng.chance(self.config.late_return_probability) {
            days += 1 + rng.next_u64_below(self.config.late_days_max.max(1) as u64) as i64;
        }
        let mut due = rented_on + Days::new(days.max(1) as u64);

        // Returns tend to land early in the week.
        let late_week = matches!(due.weekday(), Weekday::Thu | Weekday::Fri | Weekday::Sat | Weekday::Sun);
        if late_week && rng.chance(self.config.early_week_bias) {
            let to_monday = 7 - due.weekday().num_days_from_monday() as u64;
            due = due + Days::new(to_monday);
        }
        Some(due)
    }

    pub fn rental_price(&self, rng: &mut SubsystemRng) -> f64 {
        round_cents(rng.uniform(self.config.rental_price_min, self.config.rental_price_max))
    }

    /// Late-fee payment made at return time, if any.
    pub fn late_fee_payment(&self, fee: f64, rng: &mut SubsystemRng) -> Option<f64> {
        if fee <= 0.0 {
            return None;
        }
        let roll = rng.next_f64();
        if roll < self.config.late_fee_full_payment_probability {
            Some(fee)
        } else if roll < self.config.late_fee_full_payment_probability
            + self.config.late_fee_partial_payment_probability
        {
            Some(round_cents(fee / 2.0))
        } else {
            None
        }
    }
}

// ── Step summary ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RentalStepSummary {
    pub step:              Step,
    pub target_volume:     u64,
    pub planned_volume:    u64,
    pub loans_committed:   u64,
    pub allocation_misses: u64,
    pub lost_races:        u64,
    pub returns_recorded:  u64,
    pub payments_recorded: u64,
    pub lifecycle:         LifecycleSummary,
}

#[derive(Debug, Clone, Copy)]
struct PendingReturn {
    loan_id:         LoanId,
    unit_id:         UnitId,
    catalog_item_id: CatalogItemId,
    start_date:      NaiveDate,
}

// ── Subsystem ────────────────────────────────────────────────────────────────

pub struct RentalSubsystem {
    config:       SimConfig,
    tracker:      LifecycleTracker,
    pub last_summary: Option<RentalStepSummary>,
}

impl RentalSubsystem {
    pub fn new(config: SimConfig) -> Self {
        let tracker = LifecycleTracker::new(&config.lifecycle, config.shard);
        Self { config, tracker, last_summary: None }
    }

    /// Open loans of this shard due back by the end of the step, keyed by
    /// due day. Anything due before the step starts is handled on day one.
    fn load_pending_returns(
        &self,
        store: &SimStore,
        step_end: NaiveDate,
    ) -> SimResult<BTreeMap<NaiveDate, Vec<PendingReturn>>> {
        let mut pending: BTreeMap<NaiveDate, Vec<PendingReturn>> = BTreeMap::new();
        for loan in store.returns_due_through(step_end, self.config.shard)? {
            let Some(due) = loan.due_back_on else { continue };
            pending.entry(due).or_default().push(PendingReturn {
                loan_id:         loan.loan_id,
                unit_id:         loan.unit_id,
                catalog_item_id: loan.catalog_item_id,
                start_date:      loan.start_date,
            });
        }
        Ok(pending)
    }

    /// Loans this shard already committed during the step, per day, and
    /// the last day each customer rented. Empty unless the step is being
    /// re-run after an interruption.
    fn load_committed(
        &self,
        store: &SimStore,
        step_start: NaiveDate,
        step_end: NaiveDate,
    ) -> SimResult<(BTreeMap<NaiveDate, u64>, HashMap<CustomerId, NaiveDate>)> {
        let mut per_day: BTreeMap<NaiveDate, u64> = BTreeMap::new();
        let mut transacted: HashMap<CustomerId, NaiveDate> = HashMap::new();
        for rental in store.rentals_between(step_start, step_end)? {
            if !self.config.shard.owns(rental.customer_id) {
                continue;
            }
            *per_day.entry(rental.start_date).or_default() += 1;
            transacted.insert(rental.customer_id, rental.start_date);
        }
        Ok((per_day, transacted))
    }

    /// Record every return due on or before `day`.
    fn process_returns(
        &self,
        store: &SimStore,
        day: NaiveDate,
        pending: &mut BTreeMap<NaiveDate, Vec<PendingReturn>>,
        allocator: &mut Allocator,
        summary: &mut RentalStepSummary,
        rng: &mut SubsystemRng,
    ) -> SimResult<()> {
        let planner = ReturnPlanner::new(&self.config.returns);
        let fees = &self.config.late_fees;

        while let Some(entry) = pending.first_entry() {
            if *entry.key() > day {
                break;
            }
            for ret in entry.remove() {
                let overdue = days_overdue(ret.start_date, day, fees.grace_period_days);
                let fee = late_fee_for(overdue, fees.late_fee_rate_per_day);
                let payment = planner.late_fee_payment(fee, rng);

                let ReturnOutcome::Returned { unit_released } =
                    store.record_return(ret.loan_id, ret.unit_id, day, payment)?
                else {
                    continue;
                };
                summary.returns_recorded += 1;
                if payment.is_some() {
                    summary.payments_recorded += 1;
                }
                if unit_released {
                    allocator.release(ret.catalog_item_id, ret.unit_id);
                }
            }
        }
        Ok(())
    }

    fn run_step(
        &mut self,
        clock: &SimClock,
        store: &SimStore,
        rng: &mut SubsystemRng,
    ) -> SimResult<Vec<SimEvent>> {
        let step = clock.current_step;
        let step_start = clock.step_start(step);
        let step_end = clock.step_end(step);
        let mut events = Vec::new();

        let population = self.tracker.begin_step(store, step, step_start, rng)?;
        let plan = DemandModel::new(&self.config.demand).plan_week(step, step_start, rng);
        let mut allocator = Allocator::prepare(store, &self.config, step_start, step_end)?;
        let mut pending = self.load_pending_returns(store, step_end)?;
        let planner = ReturnPlanner::new(&self.config.returns);

        let mut summary = RentalStepSummary {
            step,
            target_volume: plan.target_volume,
            planned_volume: plan.total_volume(),
            ..RentalStepSummary::default()
        };
        let (committed, mut transacted) = self.load_committed(store, step_start, step_end)?;
        if !committed.is_empty() {
            log::warn!(
                "step={step} resuming an interrupted step: {} loans already committed",
                committed.values().sum::<u64>(),
            );
        }

        for day in &plan.days {
            self.process_returns(store, day.date, &mut pending, &mut allocator, &mut summary, rng)?;

            if day.spike {
                events.push(SimEvent::SpikeDay { step, date: day.date, volume: day.volume });
            }
            if population.is_empty() {
                continue;
            }

            let remaining = day.volume.saturating_sub(committed.get(&day.date).copied().unwrap_or(0));
            for _ in 0..remaining {
                let customer_id = population[rng.index_below(population.len())];
                let due_back_on = planner.plan_return(day.date, rng);
                let rental_price = Some(planner.rental_price(rng));
                let request = LoanRequest { customer_id, date: day.date, due_back_on, rental_price };

                let AllocationOutcome::Allocated { loan_id, unit_id, catalog_item_id } =
                    allocator.allocate(store, &request, rng)?
                else {
                    continue;
                };
                transacted.insert(customer_id, day.date);
                summary.payments_recorded += 1;

                if let Some(due) = due_back_on.filter(|d| *d <= step_end) {
                    pending.entry(due).or_default().push(PendingReturn {
                        loan_id,
                        unit_id,
                        catalog_item_id,
                        start_date: day.date,
                    });
                }
            }
        }

        let stats = allocator.stats();
        summary.loans_committed = stats.allocated;
        summary.allocation_misses = stats.misses;
        summary.lost_races = stats.lost_races;
        summary.lifecycle = self.tracker.end_step(store, &transacted)?;

        if population.is_empty() && summary.planned_volume > 0 {
            log::warn!("step={step} no transacting customers; {} planned rentals skipped", summary.planned_volume);
        }
        if summary.allocation_misses > 0 || summary.lost_races > 0 {
            log::info!(
                "step={step} allocation misses={} lost_races={}",
                summary.allocation_misses,
                summary.lost_races,
            );
        }
        log::debug!(
            "step={step} phase={:?} target={} planned={} loans={} returns={} active={}",
            plan.phase,
            summary.target_volume,
            summary.planned_volume,
            summary.loans_committed,
            summary.returns_recorded,
            summary.lifecycle.active,
        );

        let lc = summary.lifecycle;
        events.push(SimEvent::LifecycleAdvanced {
            step,
            active_before: lc.active_before,
            onboarded: lc.onboarded,
            churned: lc.churned,
            reactivated: lc.reactivated,
            went_inactive: lc.went_inactive,
            active: lc.active,
            inactive: lc.inactive,
        });
        events.push(SimEvent::RentalsScheduled {
            step,
            target_volume: summary.target_volume,
            loans_committed: summary.loans_committed,
            allocation_misses: summary.allocation_misses,
            lost_races: summary.lost_races,
            returns_recorded: summary.returns_recorded,
            payments_recorded: summary.payments_recorded,
        });

        self.last_summary = Some(summary);
        Ok(events)
    }
}

impl SimSubsystem for RentalSubsystem {
    fn name(&self) -> &'static str {
        "rental"
    }

    fn update(
        &mut self,
        clock: &SimClock,
        store: &SimStore,
        _events_in: &[SimEvent],
        rng: &mut SubsystemRng,
    ) -> SimResult<Vec<SimEvent>> {
        self.run_step(clock, store, rng)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
