//! Reconciliation subsystem: late fees, receivables and inventory audit.
//!
//! A pass is a function of loan and inventory state as of a date. It can
//! run after any step, on demand, or concurrently with the rental
//! subsystem, and running it twice in a row changes nothing.
//!
//! Execution order within a pass:
//!   1. Integrity scan. Loans on a double-booked unit, or open on a unit
//!      marked available, are reported and left out of this pass.
//!   2. Accrue fees on open overdue loans (served by the open-loan index).
//!   3. Finalize fees for loans returned since the return watermark; the
//!      fee amount is pinned at the return date.
//!   4. Fold late-fee payments made after a fee was finalized into its
//!      amount paid and status.
//!   5. Recompute every customer account from the fee records and open loans.
//!   6. Drain the inventory status journal into the audit log.
//!
//! Design:
//!   - Fee records are keyed by loan id and written with an upsert that
//!     skips finalized rows. Open-loan fees only grow.
//!   - Status only moves forward (pending → partially_paid → paid →
//!     written_off). Write-off is the one transition a pass may force.
//!   - Work per pass follows the open set plus new returns, not history.

use crate::{
    clock::SimClock,
    config::{ArStatusThresholds, SimConfig},
    error::{SimError, SimResult},
    event::SimEvent,
    rng::SubsystemRng,
    store::{CustomerAccountRow, LateFeeRow, ReturnsSnapshot, SimStore},
    subsystem::SimSubsystem,
    types::{round_cents, AccountStanding, AgingBucket, CustomerId, FeeStatus, LoanId, UnitId},
};
use chrono::{Days, NaiveDate};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Payments within half a cent of the fee settle it.
const SETTLE_EPSILON: f64 = 0.005;

// ── Fee arithmetic ───────────────────────────────────────────────────────────

/// Days past the grace period between `start` and `end`, never negative.
pub fn days_overdue(start: NaiveDate, end: NaiveDate, grace_period_days: i64) -> i64 {
    ((end - start).num_days() - grace_period_days).max(0)
}

pub fn late_fee_for(days_overdue: i64, rate_per_day: f64) -> f64 {
    round_cents(rate_per_day * days_overdue.max(0) as f64)
}

/// Status implied by payments alone.
pub fn payment_status(fee: f64, paid: f64) -> FeeStatus {
    if paid <= 0.0 {
        FeeStatus::Pending
    } else if paid + SETTLE_EPSILON >= fee {
        FeeStatus::Paid
    } else {
        FeeStatus::PartiallyPaid
    }
}

pub fn classify_standing(balance: f64, overdue_loans: i64, t: &ArStatusThresholds) -> AccountStanding {
    if balance > t.suspend_balance_ceiling || overdue_loans > t.suspend_overdue_ceiling {
        AccountStanding::Suspended
    } else if overdue_loans > t.at_risk_overdue_count {
        AccountStanding::AtRisk
    } else if balance > SETTLE_EPSILON {
        AccountStanding::PastDue
    } else {
        AccountStanding::GoodStanding
    }
}

// ── Report ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityViolation {
    /// More than one open loan references the unit.
    DoubleCheckout { unit_id: UnitId, loan_ids: Vec<LoanId> },
    /// An open loan references a unit whose status says available.
    OpenLoanOnAvailableUnit { unit_id: UnitId, loan_id: LoanId },
}

impl IntegrityViolation {
    pub fn unit_id(&self) -> UnitId {
        match self {
            Self::DoubleCheckout { unit_id, .. } | Self::OpenLoanOnAvailableUnit { unit_id, .. } => *unit_id,
        }
    }

    pub fn loan_ids(&self) -> Vec<LoanId> {
        match self {
            Self::DoubleCheckout { loan_ids, .. } => loan_ids.clone(),
            Self::OpenLoanOnAvailableUnit { loan_id, .. } => vec![*loan_id],
        }
    }
}

impl From<IntegrityViolation> for SimError {
    fn from(v: IntegrityViolation) -> Self {
        SimError::IntegrityViolation { unit_id: v.unit_id(), loan_ids: v.loan_ids() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationReport {
    pub as_of:                NaiveDate,
    pub fees_upserted:        u64,
    pub fees_finalized:       u64,
    pub accounts_recomputed:  u64,
    pub audit_events_emitted: u64,
    pub violations:           Vec<IntegrityViolation>,
}

impl ReconciliationReport {
    /// The report as an error if the scan found anything.
    pub fn into_result(self) -> SimResult<Self> {
        match self.violations.first() {
            Some(v) => Err(v.clone().into()),
            None => Ok(self),
        }
    }

    pub fn events(&self) -> Vec<SimEvent> {
        let mut events: Vec<SimEvent> = self
            .violations
            .iter()
            .map(|v| SimEvent::IntegrityViolationDetected {
                as_of: self.as_of,
                unit_id: v.unit_id(),
                loan_ids: v.loan_ids(),
            })
            .collect();
        events.push(SimEvent::ReconciliationCompleted {
            as_of: self.as_of,
            fees_upserted: self.fees_upserted,
            fees_finalized: self.fees_finalized,
            accounts_recomputed: self.accounts_recomputed,
            audit_events_emitted: self.audit_events_emitted,
            integrity_violations: self.violations.len() as u64,
        });
        events
    }
}

// ── Subsystem ────────────────────────────────────────────────────────────────

pub struct ReconciliationSubsystem {
    config: SimConfig,
    pub last_report: Option<ReconciliationReport>,
}

impl ReconciliationSubsystem {
    pub fn new(config: SimConfig) -> Self {
        Self { config, last_report: None }
    }

    /// Run one reconciliation pass as of `as_of`.
    pub fn run_pass(&self, store: &SimStore, as_of: NaiveDate) -> SimResult<ReconciliationReport> {
        let violations = scan_integrity(store)?;
        let excluded: HashSet<LoanId> = violations.iter().flat_map(|v| v.loan_ids()).collect();
        for v in &violations {
            log::error!(
                "integrity violation as of {as_of}: unit {} open loans {:?}",
                v.unit_id(),
                v.loan_ids()
            );
        }

        let snapshot = store.returns_since_watermark()?;
        let mut unfinalized = store.unfinalized_late_fees()?;
        let mut fees = self.accrue_open_loans(store, as_of, &excluded, &mut unfinalized)?;
        let (finalized, watermark) = self.finalize_returns(&snapshot, as_of, &mut unfinalized);
        let fees_finalized = finalized.len() as u64;
        let just_finalized: HashSet<LoanId> = finalized.iter().map(|f| f.loan_id).collect();
        fees.extend(finalized);
        store.upsert_late_fees(&fees)?;

        let late_paid = self.fold_late_payments(store, &snapshot, as_of, &just_finalized)?;
        store.update_finalized_payments(&late_paid)?;
        store.advance_watermarks(watermark, snapshot.last_payment_id)?;

        let accounts = self.recompute_accounts(store, as_of)?;
        store.upsert_customer_accounts(&accounts)?;

        let audit_events_emitted = store.drain_status_changes()?;

        let report = ReconciliationReport {
            as_of,
            fees_upserted: (fees.len() + late_paid.len()) as u64,
            fees_finalized,
            accounts_recomputed: accounts.len() as u64,
            audit_events_emitted,
            violations,
        };
        log::info!(
            "reconciled as of {as_of}: fees_upserted={} finalized={} accounts={} audit_events={} violations={}",
            report.fees_upserted,
            report.fees_finalized,
            report.accounts_recomputed,
            report.audit_events_emitted,
            report.violations.len(),
        );
        Ok(report)
    }

    fn overdue_cutoff(&self, as_of: NaiveDate) -> NaiveDate {
        as_of - Days::new(self.config.late_fees.grace_period_days.max(0) as u64)
    }

    /// Fee rows for open overdue loans that changed since their last write.
    fn accrue_open_loans(
        &self,
        store: &SimStore,
        as_of: NaiveDate,
        excluded: &HashSet<LoanId>,
        unfinalized: &mut HashMap<LoanId, LateFeeRow>,
    ) -> SimResult<Vec<LateFeeRow>> {
        let cfg = &self.config.late_fees;
        let mut rows = Vec::new();

        for loan in store.open_loans_started_before(self.overdue_cutoff(as_of))? {
            if excluded.contains(&loan.loan_id) {
                continue;
            }
            let days = days_overdue(loan.start_date, as_of, cfg.grace_period_days);
            let fee = late_fee_for(days, cfg.late_fee_rate_per_day);
            let prior = unfinalized.remove(&loan.loan_id);
            if prior.is_none() && fee <= 0.0 {
                continue;
            }

            let mut row = match &prior {
                Some(p) => LateFeeRow {
                    days_overdue: p.days_overdue.max(days),
                    fee_amount: p.fee_amount.max(fee),
                    computed_as_of: p.computed_as_of.max(as_of),
                    ..p.clone()
                },
                None => LateFeeRow {
                    loan_id: loan.loan_id,
                    customer_id: loan.customer_id,
                    days_overdue: days,
                    fee_amount: fee,
                    amount_paid: 0.0,
                    status: FeeStatus::Pending,
                    finalized: false,
                    computed_as_of: as_of,
                },
            };
            row.status = row.status.max(payment_status(row.fee_amount, row.amount_paid));
            if self.past_write_off(row.days_overdue) && row.status < FeeStatus::Paid {
                row.status = FeeStatus::WrittenOff;
            }

            if prior.as_ref() != Some(&row) {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    /// Pinned fee rows for loans returned after the watermark, plus the
    /// sequence the watermark may advance to. Returns dated after `as_of`
    /// are not visible yet and hold the watermark back.
    fn finalize_returns(
        &self,
        snapshot: &ReturnsSnapshot,
        as_of: NaiveDate,
        unfinalized: &mut HashMap<LoanId, LateFeeRow>,
    ) -> (Vec<LateFeeRow>, Option<i64>) {
        let cfg = &self.config.late_fees;
        let mut rows = Vec::new();
        let mut advance_to = None;
        let mut blocked = false;

        for ret in &snapshot.returns {
            if ret.return_date > as_of {
                blocked = true;
                continue;
            }
            if !blocked {
                advance_to = Some(ret.return_seq);
            }

            let days = days_overdue(ret.start_date, ret.return_date, cfg.grace_period_days);
            let fee = late_fee_for(days, cfg.late_fee_rate_per_day);
            let paid = round_cents(snapshot.late_fee_paid.get(&ret.loan_id).copied().unwrap_or(0.0));
            let prior = unfinalized.remove(&ret.loan_id);
            if prior.is_none() && fee <= 0.0 && paid <= 0.0 {
                continue;
            }

            let prior_status = prior.as_ref().map_or(FeeStatus::Pending, |p| p.status);
            let mut status = prior_status.max(payment_status(fee, paid));
            if self.past_write_off(days) && status < FeeStatus::Paid {
                status = FeeStatus::WrittenOff;
            }
            rows.push(LateFeeRow {
                loan_id: ret.loan_id,
                customer_id: ret.customer_id,
                days_overdue: days,
                fee_amount: fee,
                amount_paid: paid,
                status,
                finalized: true,
                computed_as_of: as_of,
            });
        }
        (rows, advance_to)
    }

    /// Finalized fees that picked up a late-fee payment since the last
    /// pass. Loans finalized in this pass already carry every payment in
    /// the snapshot and are skipped.
    fn fold_late_payments(
        &self,
        store: &SimStore,
        snapshot: &ReturnsSnapshot,
        as_of: NaiveDate,
        just_finalized: &HashSet<LoanId>,
    ) -> SimResult<Vec<LateFeeRow>> {
        let mut rows = Vec::new();
        for loan_id in &snapshot.newly_paid {
            if just_finalized.contains(loan_id) {
                continue;
            }
            let Some(prior) = store.get_late_fee(*loan_id)?.filter(|f| f.finalized) else {
                continue;
            };
            let paid = round_cents(snapshot.late_fee_paid.get(loan_id).copied().unwrap_or(0.0));
            if paid <= prior.amount_paid + SETTLE_EPSILON {
                continue;
            }
            let status = prior.status.max(payment_status(prior.fee_amount, paid));
            log::debug!("loan {loan_id}: late payment folded in, paid {:.2} -> {paid:.2}", prior.amount_paid);
            rows.push(LateFeeRow { amount_paid: paid, status, computed_as_of: prior.computed_as_of.max(as_of), ..prior });
        }
        Ok(rows)
    }

    fn past_write_off(&self, days: i64) -> bool {
        self.config
            .late_fees
            .write_off_after_days
            .is_some_and(|limit| days > limit)
    }

    /// Rebuild every customer account from grouped aggregates.
    fn recompute_accounts(&self, store: &SimStore, as_of: NaiveDate) -> SimResult<Vec<CustomerAccountRow>> {
        let grace = self.config.late_fees.grace_period_days;
        let cutoff = self.overdue_cutoff(as_of);

        let totals: HashMap<CustomerId, _> = store
            .fee_totals_by_customer()?
            .into_iter()
            .map(|t| (t.customer_id, t))
            .collect();
        let loans: HashMap<CustomerId, _> = store
            .open_loan_stats_by_customer(cutoff)?
            .into_iter()
            .map(|s| (s.customer_id, s))
            .collect();
        let last_paid = store.last_payment_by_customer()?;

        let mut customers: BTreeSet<CustomerId> = store.all_customer_ids()?.into_iter().collect();
        customers.extend(totals.keys());
        customers.extend(loans.keys());

        let rows = customers
            .into_iter()
            .map(|customer_id| {
                let fees = totals.get(&customer_id);
                let open = loans.get(&customer_id);
                let balance = round_cents(fees.map_or(0.0, |f| f.outstanding).max(0.0));
                let overdue_loans = open.map_or(0, |o| o.overdue_loans);

                let aging_bucket = match open {
                    Some(o) if o.overdue_loans > 0 => {
                        AgingBucket::for_days_overdue(days_overdue(o.oldest_open_start, as_of, grace))
                    }
                    _ => AgingBucket::Current,
                };

                CustomerAccountRow {
                    customer_id,
                    outstanding_balance: balance,
                    total_late_fees: round_cents(fees.map_or(0.0, |f| f.total)),
                    paid_late_fees: round_cents(fees.map_or(0.0, |f| f.paid)),
                    open_loans: open.map_or(0, |o| o.open_loans),
                    overdue_loans,
                    standing: classify_standing(balance, overdue_loans, &self.config.ar_status_thresholds),
                    aging_bucket,
                    last_payment_on: last_paid.get(&customer_id).copied(),
                    computed_as_of: as_of,
                }
            })
            .collect();
        Ok(rows)
    }
}

/// Every unit whose open loans contradict the no-double-checkout rule
/// or the unit's own status.
fn scan_integrity(store: &SimStore) -> SimResult<Vec<IntegrityViolation>> {
    let mut violations: Vec<IntegrityViolation> = store
        .double_checkouts()?
        .into_iter()
        .map(|(unit_id, loan_ids)| IntegrityViolation::DoubleCheckout { unit_id, loan_ids })
        .collect();

    let doubled: HashSet<UnitId> = violations.iter().map(|v| v.unit_id()).collect();
    violations.extend(
        store
            .open_loans_on_available_units()?
            .into_iter()
            .filter(|(unit_id, _)| !doubled.contains(unit_id))
            .map(|(unit_id, loan_id)| IntegrityViolation::OpenLoanOnAvailableUnit { unit_id, loan_id }),
    );
    Ok(violations)
}

impl SimSubsystem for ReconciliationSubsystem {
    fn name(&self) -> &'static str {
        "reconciliation"
    }

    /// Reconcile as of the last day of the step just simulated.
    fn update(
        &mut self,
        clock: &SimClock,
        store: &SimStore,
        _events_in: &[SimEvent],
        _rng: &mut SubsystemRng,
    ) -> SimResult<Vec<SimEvent>> {
        let as_of = clock.step_end(clock.current_step);
        let report = self.run_pass(store, as_of)?;
        let events = report.events();
        self.last_report = Some(report);
        Ok(events)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    #[test]
    fn fee_accrues_per_day_past_grace() {
        assert_eq!(days_overdue(day(1), day(8), 0), 7);
        assert_eq!(days_overdue(day(1), day(8), 3), 4);
        assert_eq!(days_overdue(day(8), day(1), 0), 0);
        assert_eq!(late_fee_for(7, 1.50), 10.50);
        assert_eq!(late_fee_for(-2, 1.50), 0.0);
    }

    #[test]
    fn payment_status_tracks_amount_paid() {
        assert_eq!(payment_status(10.0, 0.0), FeeStatus::Pending);
        assert_eq!(payment_status(10.0, 5.0), FeeStatus::PartiallyPaid);
        assert_eq!(payment_status(10.0, 10.0), FeeStatus::Paid);
        assert_eq!(payment_status(10.0, 9.996), FeeStatus::Paid);
    }

    #[test]
    fn standing_thresholds_apply_in_severity_order() {
        let t = ArStatusThresholds::default();
        assert_eq!(classify_standing(0.0, 0, &t), AccountStanding::GoodStanding);
        assert_eq!(classify_standing(4.5, 1, &t), AccountStanding::PastDue);
        assert_eq!(classify_standing(4.5, 2, &t), AccountStanding::PastDue);
        assert_eq!(classify_standing(9.0, 3, &t), AccountStanding::AtRisk);
        assert_eq!(classify_standing(150.0, 1, &t), AccountStanding::Suspended);
        assert_eq!(classify_standing(20.0, 6, &t), AccountStanding::Suspended);
    }

    #[test]
    fn violation_converts_to_identifying_error() {
        let v = IntegrityViolation::DoubleCheckout { unit_id: 4, loan_ids: vec![9, 12] };
        match SimError::from(v) {
            SimError::IntegrityViolation { unit_id, loan_ids } => {
                assert_eq!(unit_id, 4);
                assert_eq!(loan_ids, vec![9, 12]);
            }
            other => panic!("unexpected error {other}"),
        }
    }
}
