//! Reconciliation tests: late-fee accrual and pinning, receivables
//! standing, integrity reporting, the audit trail, and idempotence.

mod common;

use common::{day, day0, file_store, init_logging, seed_catalog, seed_customers};
use rental_sim_core::{
    config::SimConfig,
    engine::SimEngine,
    error::SimError,
    event::SimEvent,
    reconciliation_subsystem::{days_overdue, late_fee_for, IntegrityViolation, ReconciliationSubsystem},
    store::{ClaimOutcome, NewLoan, ReturnOutcome, SimStore},
    types::{
        round_cents, AccountStanding, AgingBucket, CatalogItemId, CustomerId, FeeStatus, LoanId, PaymentKind,
        UnitId, UnitStatus,
    },
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

fn engine(run_id: &str, config: SimConfig) -> SimEngine {
    SimEngine::build_test(run_id, 1, config).unwrap()
}

fn open_loan(store: &SimStore, customer_id: CustomerId, (item, unit): (CatalogItemId, UnitId), start: chrono::NaiveDate) -> LoanId {
    let loan = NewLoan {
        customer_id,
        unit_id: unit,
        catalog_item_id: item,
        start_date: start,
        due_back_on: None,
        rental_price: None,
    };
    match store.commit_loan(&loan).unwrap() {
        ClaimOutcome::Committed(id) => id,
        ClaimOutcome::Lost => panic!("unit {unit} unexpectedly unavailable"),
    }
}

/// One customer and `units` single-copy titles.
fn fixture(engine: &SimEngine, units: usize) -> (CustomerId, Vec<(CatalogItemId, UnitId)>) {
    let customer = seed_customers(&engine.store, 1, day0())[0];
    let catalog = seed_catalog(&engine.store, units, 1, day0())
        .into_iter()
        .map(|(item, units)| (item, units[0]))
        .collect();
    (customer, catalog)
}

#[test]
fn open_loan_fee_accrues_and_never_decreases() {
    init_logging();
    let mut engine = engine("fee-accrual", SimConfig::default_test());
    let (customer, catalog) = fixture(&engine, 1);
    let loan = open_loan(&engine.store, customer, catalog[0], day0());

    engine.run_reconciliation(day(7)).unwrap();
    let fee = engine.store.get_late_fee(loan).unwrap().unwrap();
    assert_eq!(fee.fee_amount, 10.50);
    assert_eq!(fee.days_overdue, 7);
    assert_eq!(fee.status, FeeStatus::Pending);
    assert!(!fee.finalized);

    engine.run_reconciliation(day(14)).unwrap();
    let fee = engine.store.get_late_fee(loan).unwrap().unwrap();
    assert_eq!(fee.fee_amount, 21.00);

    // An earlier as-of date never takes the fee back down.
    engine.run_reconciliation(day(10)).unwrap();
    let fee = engine.store.get_late_fee(loan).unwrap().unwrap();
    assert_eq!(fee.fee_amount, 21.00, "fee decreased on an earlier re-run");
}

#[test]
fn returned_loan_fee_is_pinned_at_return_date() {
    init_logging();
    let mut engine = engine("fee-pinned", SimConfig::default_test());
    let (customer, catalog) = fixture(&engine, 1);
    let loan = open_loan(&engine.store, customer, catalog[0], day0());

    engine.run_reconciliation(day(7)).unwrap();
    assert_eq!(engine.store.get_late_fee(loan).unwrap().unwrap().fee_amount, 10.50);

    let outcome = engine.store.record_return(loan, catalog[0].1, day(10), None).unwrap();
    assert_eq!(outcome, ReturnOutcome::Returned { unit_released: true });

    let report = engine.run_reconciliation(day(14)).unwrap();
    assert_eq!(report.fees_finalized, 1);
    let fee = engine.store.get_late_fee(loan).unwrap().unwrap();
    assert_eq!(fee.fee_amount, 15.00, "fee should stop at the return date");
    assert_eq!(fee.days_overdue, 10);
    assert!(fee.finalized);

    engine.run_reconciliation(day(60)).unwrap();
    assert_eq!(engine.store.get_late_fee(loan).unwrap().unwrap().fee_amount, 15.00);
}

#[test]
fn grace_period_delays_accrual() {
    let mut config = SimConfig::default_test();
    config.late_fees.grace_period_days = 3;
    let mut engine = engine("fee-grace", config);
    let (customer, catalog) = fixture(&engine, 1);
    let loan = open_loan(&engine.store, customer, catalog[0], day0());

    engine.run_reconciliation(day(3)).unwrap();
    assert!(engine.store.get_late_fee(loan).unwrap().is_none(), "no fee inside the grace period");

    engine.run_reconciliation(day(7)).unwrap();
    assert_eq!(engine.store.get_late_fee(loan).unwrap().unwrap().fee_amount, 6.00);
}

#[test]
fn late_fee_payments_settle_the_account() {
    let mut engine = engine("fee-payments", SimConfig::default_test());
    let (customer, catalog) = fixture(&engine, 2);
    let paid_in_full = open_loan(&engine.store, customer, catalog[0], day0());
    let paid_in_part = open_loan(&engine.store, customer, catalog[1], day0());

    // One pays at the counter, the other settles part of it separately.
    engine.store.record_return(paid_in_full, catalog[0].1, day(10), Some(15.00)).unwrap();
    engine.store.record_return(paid_in_part, catalog[1].1, day(10), None).unwrap();
    engine.store.insert_payment(paid_in_part, customer, PaymentKind::LateFee, 5.00, day(10)).unwrap();

    engine.run_reconciliation(day(14)).unwrap();

    let full = engine.store.get_late_fee(paid_in_full).unwrap().unwrap();
    let part = engine.store.get_late_fee(paid_in_part).unwrap().unwrap();
    assert_eq!(full.status, FeeStatus::Paid);
    assert_eq!(part.status, FeeStatus::PartiallyPaid);
    assert_eq!(part.amount_paid, 5.00);

    let account = engine.store.get_customer_account(customer).unwrap().unwrap();
    assert_eq!(account.outstanding_balance, 10.00);
    assert_eq!(account.total_late_fees, 30.00);
    assert_eq!(account.paid_late_fees, 20.00);
    assert_eq!(account.standing, AccountStanding::PastDue);
    assert_eq!(account.open_loans, 0);
    assert_eq!(account.last_payment_on, Some(day(10)));
}

#[test]
fn payment_recorded_with_the_return_is_seen_by_the_next_pass() {
    let mut engine = engine("fee-counter-payment", SimConfig::default_test());
    let (customer, catalog) = fixture(&engine, 1);
    let loan = open_loan(&engine.store, customer, catalog[0], day0());

    engine.store.record_return(loan, catalog[0].1, day(10), Some(15.00)).unwrap();
    let payments = engine.store.payments_for_loan(loan).unwrap();
    assert_eq!(payments.len(), 1);
    assert_eq!((payments[0].kind, payments[0].amount, payments[0].paid_on), (PaymentKind::LateFee, 15.00, day(10)));

    // Recording the same return again neither reopens it nor pays twice.
    let again = engine.store.record_return(loan, catalog[0].1, day(11), Some(15.00)).unwrap();
    assert_eq!(again, ReturnOutcome::AlreadyReturned);
    assert_eq!(engine.store.payments_for_loan(loan).unwrap().len(), 1);

    engine.run_reconciliation(day(10)).unwrap();
    let fee = engine.store.get_late_fee(loan).unwrap().unwrap();
    assert_eq!(fee.status, FeeStatus::Paid);
    assert_eq!(fee.amount_paid, 15.00);
    assert!(fee.finalized);
}

#[test]
fn payment_after_finalization_on_another_connection_settles_the_fee() {
    init_logging();
    let config = SimConfig::default_test();
    let (_dir, path, scheduler) = file_store("late-payment", 1);
    let reconciler = SimStore::open(&path).unwrap();

    let customer = seed_customers(&scheduler, 1, day0())[0];
    let (item, units) = seed_catalog(&scheduler, 1, 1, day0()).remove(0);
    let loan = open_loan(&scheduler, customer, (item, units[0]), day0());
    scheduler.record_return(loan, units[0], day(10), None).unwrap();

    // The pass lands between the return and the customer paying.
    let pass = ReconciliationSubsystem::new(config);
    let report = pass.run_pass(&reconciler, day(10)).unwrap();
    assert_eq!(report.fees_finalized, 1);
    let fee = reconciler.get_late_fee(loan).unwrap().unwrap();
    assert_eq!((fee.fee_amount, fee.amount_paid, fee.status), (15.00, 0.0, FeeStatus::Pending));

    scheduler.insert_payment(loan, customer, PaymentKind::LateFee, 15.00, day(12)).unwrap();

    let report = pass.run_pass(&reconciler, day(14)).unwrap();
    assert_eq!(report.fees_upserted, 1);
    assert_eq!(report.fees_finalized, 0);
    let report = pass.run_pass(&reconciler, day(30)).unwrap();
    assert_eq!(report.fees_upserted, 0);

    let fee = reconciler.get_late_fee(loan).unwrap().unwrap();
    assert_eq!(fee.status, FeeStatus::Paid);
    assert_eq!(fee.amount_paid, 15.00);
    assert_eq!(fee.fee_amount, 15.00, "a late payment must not move the pinned fee");
    assert!(fee.finalized);

    let account = reconciler.get_customer_account(customer).unwrap().unwrap();
    assert_eq!(account.outstanding_balance, 0.0);
    assert_eq!(account.paid_late_fees, 15.00);
    assert_eq!(account.standing, AccountStanding::GoodStanding);
    assert_eq!(account.last_payment_on, Some(day(12)));
}

#[test]
fn passes_running_alongside_the_scheduler_miss_no_payment() {
    init_logging();
    let mut config = SimConfig::default_test();
    config.demand.base_volume = 20.0;
    config.returns.late_return_probability = 0.4;
    config.returns.late_fee_full_payment_probability = 0.5;
    config.returns.late_fee_partial_payment_probability = 0.3;
    let (_dir, path, store) = file_store("concurrent-recon", 9);
    seed_customers(&store, 12, day0());
    seed_catalog(&store, 10, 2, day0());

    let done = Arc::new(AtomicBool::new(false));
    let reconciler = {
        let (path, config, done) = (path.clone(), config.clone(), Arc::clone(&done));
        std::thread::spawn(move || {
            let store = SimStore::open(&path).unwrap();
            let pass = ReconciliationSubsystem::new(config);
            let mut passes = 0u32;
            while passes == 0 || !done.load(Ordering::Acquire) {
                let report = pass.run_pass(&store, day(70)).unwrap();
                assert!(report.violations.is_empty(), "{:?}", report.violations);
                passes += 1;
            }
            passes
        })
    };

    let mut engine = SimEngine::build("concurrent-recon".into(), 9, config.clone(), store).unwrap();
    engine.advance_steps(10).unwrap();
    done.store(true, Ordering::Release);
    assert!(reconciler.join().expect("reconciler panicked") > 0);

    let report = engine.run_reconciliation(day(70)).unwrap();
    assert!(report.violations.is_empty());

    let rate = config.late_fees.late_fee_rate_per_day;
    let grace = config.late_fees.grace_period_days;
    let mut paid_fees = 0;
    for fee in engine.store.all_late_fees().unwrap().into_iter().filter(|f| f.finalized) {
        let loan = engine.store.get_loan(fee.loan_id).unwrap().unwrap();
        let returned = loan.return_date.expect("finalized fee on an open loan");
        let paid: f64 = engine
            .store
            .payments_for_loan(fee.loan_id)
            .unwrap()
            .iter()
            .filter(|p| p.kind == PaymentKind::LateFee)
            .map(|p| p.amount)
            .sum();
        assert_eq!(fee.fee_amount, late_fee_for(days_overdue(loan.start_date, returned, grace), rate));
        assert_eq!(fee.amount_paid, round_cents(paid), "loan {}: payment not folded in", fee.loan_id);
        if paid > 0.0 {
            paid_fees += 1;
        }
    }
    assert!(paid_fees > 0, "no late fee was ever paid; the run exercised nothing");
}

#[test]
fn standing_follows_overdue_count_and_balance() {
    let mut engine = engine("ar-standing", SimConfig::default_test());
    let catalog: Vec<_> = seed_catalog(&engine.store, 10, 1, day0())
        .into_iter()
        .map(|(item, units)| (item, units[0]))
        .collect();
    let customers = seed_customers(&engine.store, 4, day0());
    let (idle, one, three, six) = (customers[0], customers[1], customers[2], customers[3]);

    open_loan(&engine.store, one, catalog[0], day0());
    for c in &catalog[1..4] {
        open_loan(&engine.store, three, *c, day0());
    }
    for c in &catalog[4..10] {
        open_loan(&engine.store, six, *c, day0());
    }

    let report = engine.run_reconciliation(day(2)).unwrap();
    assert_eq!(report.accounts_recomputed, 4);

    let standing = |c| engine.store.get_customer_account(c).unwrap().unwrap().standing;
    assert_eq!(standing(idle), AccountStanding::GoodStanding);
    assert_eq!(standing(one), AccountStanding::PastDue);
    assert_eq!(standing(three), AccountStanding::AtRisk);
    assert_eq!(standing(six), AccountStanding::Suspended);
}

#[test]
fn balance_ceiling_suspends_and_aging_tracks_oldest_loan() {
    let mut engine = engine("ar-ceiling", SimConfig::default_test());
    let (customer, catalog) = fixture(&engine, 1);
    open_loan(&engine.store, customer, catalog[0], day0());

    engine.run_reconciliation(day(35)).unwrap();
    let account = engine.store.get_customer_account(customer).unwrap().unwrap();
    assert_eq!(account.outstanding_balance, 52.50);
    assert_eq!(account.standing, AccountStanding::PastDue);
    assert_eq!(account.aging_bucket, AgingBucket::Days30);

    engine.run_reconciliation(day(70)).unwrap();
    let account = engine.store.get_customer_account(customer).unwrap().unwrap();
    assert_eq!(account.outstanding_balance, 105.00);
    assert_eq!(account.standing, AccountStanding::Suspended);
    assert_eq!(account.aging_bucket, AgingBucket::Days60);
}

#[test]
fn write_off_is_terminal_and_leaves_the_balance() {
    let mut config = SimConfig::default_test();
    config.late_fees.write_off_after_days = Some(30);
    let mut engine = engine("write-off", config);
    let (customer, catalog) = fixture(&engine, 1);
    let loan = open_loan(&engine.store, customer, catalog[0], day0());

    engine.run_reconciliation(day(20)).unwrap();
    assert_eq!(engine.store.get_late_fee(loan).unwrap().unwrap().status, FeeStatus::Pending);

    engine.run_reconciliation(day(40)).unwrap();
    let fee = engine.store.get_late_fee(loan).unwrap().unwrap();
    assert_eq!(fee.status, FeeStatus::WrittenOff);
    let account = engine.store.get_customer_account(customer).unwrap().unwrap();
    assert_eq!(account.outstanding_balance, 0.0);

    engine.store.record_return(loan, catalog[0].1, day(45), None).unwrap();
    engine.run_reconciliation(day(50)).unwrap();
    let fee = engine.store.get_late_fee(loan).unwrap().unwrap();
    assert_eq!(fee.status, FeeStatus::WrittenOff, "write-off must survive the return");
    assert!(fee.finalized);
}

#[test]
fn double_checkout_is_reported_not_repaired() {
    init_logging();
    let mut engine = engine("integrity-double", SimConfig::default_test());
    let customers = seed_customers(&engine.store, 2, day0());
    let catalog = seed_catalog(&engine.store, 2, 1, day0());
    let (item, unit) = (catalog[0].0, catalog[0].1[0]);

    // History loaded from outside, bypassing the conditional claim.
    let import = |customer_id| {
        let loan = NewLoan { customer_id, unit_id: unit, catalog_item_id: item, start_date: day0(), due_back_on: None, rental_price: None };
        engine.store.import_loan(&loan, None).unwrap()
    };
    let first = import(customers[0]);
    let second = import(customers[1]);
    let healthy = open_loan(&engine.store, customers[0], (catalog[1].0, catalog[1].1[0]), day0());

    let report = engine.run_reconciliation(day(7)).unwrap();
    assert_eq!(
        report.violations,
        vec![IntegrityViolation::DoubleCheckout { unit_id: unit, loan_ids: vec![first, second] }]
    );
    assert!(engine.store.get_late_fee(first).unwrap().is_none(), "conflicting loans must be left alone");
    assert!(engine.store.get_late_fee(second).unwrap().is_none());
    assert_eq!(engine.store.get_late_fee(healthy).unwrap().unwrap().fee_amount, 10.50);

    match report.into_result() {
        Err(SimError::IntegrityViolation { unit_id, loan_ids }) => {
            assert_eq!(unit_id, unit);
            assert_eq!(loan_ids, vec![first, second]);
        }
        other => panic!("expected an integrity violation, got {other:?}"),
    }

    let logged = engine
        .store
        .events_of_type(&engine.run_id, "integrity_violation_detected")
        .unwrap();
    assert_eq!(logged.len(), 1);
}

#[test]
fn open_loan_on_available_unit_is_reported() {
    let mut engine = engine("integrity-available", SimConfig::default_test());
    let customer = seed_customers(&engine.store, 1, day0())[0];
    let catalog = seed_catalog(&engine.store, 1, 1, day0());
    let (item, unit) = (catalog[0].0, catalog[0].1[0]);
    let loan = NewLoan { customer_id: customer, unit_id: unit, catalog_item_id: item, start_date: day0(), due_back_on: None, rental_price: None };
    let loan_id = engine.store.import_loan(&loan, None).unwrap();

    let report = engine.run_reconciliation(day(7)).unwrap();
    assert_eq!(
        report.violations,
        vec![IntegrityViolation::OpenLoanOnAvailableUnit { unit_id: unit, loan_id }]
    );
}

#[test]
fn status_changes_reach_the_audit_log_once() {
    let mut engine = engine("audit", SimConfig::default_test());
    let (customer, catalog) = fixture(&engine, 2);
    let (_, spare) = catalog[1];
    let loan = open_loan(&engine.store, customer, catalog[0], day0());

    assert!(engine.store.mark_unit_status(spare, UnitStatus::Damaged, day(2), "stock-check").unwrap());
    assert!(!engine.store.mark_unit_status(spare, UnitStatus::Damaged, day(2), "stock-check").unwrap());

    let report = engine.run_reconciliation(day(3)).unwrap();
    assert_eq!(report.audit_events_emitted, 2);

    let events = engine.store.audit_events_for_unit(spare).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].old_status, UnitStatus::Available);
    assert_eq!(events[0].new_status, UnitStatus::Damaged);
    assert_eq!(events[0].actor, "stock-check");
    assert_eq!(engine.store.get_unit(spare).unwrap().unwrap().audited_status, Some(UnitStatus::Damaged));

    let again = engine.run_reconciliation(day(3)).unwrap();
    assert_eq!(again.audit_events_emitted, 0, "audit events re-emitted");

    // A unit marked missing while out stays missing when the loan closes.
    engine.store.mark_unit_status(catalog[0].1, UnitStatus::Missing, day(4), "stock-check").unwrap();
    let outcome = engine.store.record_return(loan, catalog[0].1, day(5), None).unwrap();
    assert_eq!(outcome, ReturnOutcome::Returned { unit_released: false });
    assert_eq!(engine.store.get_unit(catalog[0].1).unwrap().unwrap().status, UnitStatus::Missing);

    assert!(engine.store.reset_unit(spare, day(6), "repair").unwrap());
    engine.run_reconciliation(day(7)).unwrap();
    assert_eq!(engine.store.audit_events_for_unit(spare).unwrap().len(), 2);
    assert_eq!(engine.store.get_unit(spare).unwrap().unwrap().audited_status, Some(UnitStatus::Available));
}

#[test]
fn second_pass_at_same_date_changes_nothing() {
    init_logging();
    let mut config = SimConfig::default_test();
    config.demand.base_volume = 25.0;
    config.returns.late_return_probability = 0.3;
    config.returns.lost_probability = 0.05;
    let mut engine = SimEngine::build_test("idempotence", 17, config).unwrap();
    seed_customers(&engine.store, 15, day0());
    seed_catalog(&engine.store, 12, 2, day0());
    engine.advance_steps(10).unwrap();

    let as_of = engine.clock.step_end(10);
    let first = engine.run_reconciliation(as_of).unwrap();
    assert!(first.fees_upserted > 0, "run produced no late fees to reconcile");
    let fees = engine.store.all_late_fees().unwrap();
    let accounts = engine.store.all_customer_accounts().unwrap();
    let audit = engine.store.all_audit_events().unwrap();

    let second = engine.run_reconciliation(as_of).unwrap();
    assert_eq!(second.fees_upserted, 0);
    assert_eq!(second.fees_finalized, 0);
    assert_eq!(second.audit_events_emitted, 0);
    assert_eq!(engine.store.all_late_fees().unwrap(), fees);
    assert_eq!(engine.store.all_customer_accounts().unwrap(), accounts);
    assert_eq!(engine.store.all_audit_events().unwrap(), audit);
}

#[test]
fn reconcile_each_step_runs_inside_the_engine() {
    let mut config = SimConfig::default_test();
    config.reconcile_each_step = true;
    let mut engine = SimEngine::build_test("recon-each-step", 2, config).unwrap();
    seed_customers(&engine.store, 5, day0());
    seed_catalog(&engine.store, 5, 1, day0());

    let events = engine.advance_steps(3).unwrap();
    let passes: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            SimEvent::ReconciliationCompleted { as_of, .. } => Some(*as_of),
            _ => None,
        })
        .collect();
    assert_eq!(passes, vec![day(6), day(13), day(20)]);
    assert_eq!(engine.store.all_customer_accounts().unwrap().len(), 5);
}
