//! Engine wiring: fail-fast configuration, run registration, event log
//! and progress records.

mod common;

use common::{day, day0, seed_catalog, seed_customers};
use rental_sim_core::{
    config::{ShardConfig, SimConfig},
    engine::SimEngine,
    error::SimError,
    event::SimEvent,
    store::SimStore,
};

#[test]
fn invalid_config_fails_before_any_step() {
    let mut config = SimConfig::default_test();
    config.popularity.alpha = 0.0;

    match SimEngine::build_test("bad-alpha", 1, config) {
        Err(SimError::InvalidConfig { field, .. }) => assert_eq!(field, "popularity.alpha"),
        Err(other) => panic!("expected InvalidConfig, got {other}"),
        Ok(_) => panic!("engine built with alpha = 0"),
    }
}

#[test]
fn unregistered_run_is_rejected() {
    let store = SimStore::in_memory().unwrap();
    store.migrate().unwrap();

    let result = SimEngine::build("ghost".into(), 3, SimConfig::default_test(), store);
    assert!(matches!(result, Err(SimError::RunNotInitialized { ref run_id }) if run_id == "ghost"));
}

#[test]
fn every_step_lands_in_the_event_log() {
    let mut engine = SimEngine::build_test("event-log", 5, SimConfig::default_test()).unwrap();
    seed_customers(&engine.store, 4, day0());
    seed_catalog(&engine.store, 6, 1, day0());

    let events = engine.advance_steps(3).unwrap();
    assert!(matches!(events.first(), Some(SimEvent::StepStarted { step: 1, .. })));
    assert!(matches!(events.last(), Some(SimEvent::StepCompleted { step: 3 })));

    let init = engine.store_events_for_step("event-log", 0).unwrap();
    assert_eq!(init.len(), 1);
    assert_eq!(init[0].event_type, "run_initialized");

    for step in 1..=3 {
        let logged = engine.store_events_for_step("event-log", step).unwrap();
        let types: Vec<_> = logged.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["lifecycle_advanced", "rentals_scheduled"], "step {step}");
        assert!(logged.iter().all(|e| e.subsystem == "rental"));
    }

    assert_eq!(engine.store.last_completed_step("event-log", 0).unwrap(), Some(3));
}

#[test]
fn manual_reconciliation_is_logged_under_the_current_step() {
    let mut engine = SimEngine::build_test("manual-recon", 5, SimConfig::default_test()).unwrap();
    seed_customers(&engine.store, 4, day0());
    seed_catalog(&engine.store, 6, 1, day0());
    engine.advance_steps(2).unwrap();

    let report = engine.run_reconciliation(day(13)).unwrap();
    assert!(report.violations.is_empty());

    let logged = engine.store.events_of_type("manual-recon", "reconciliation_completed").unwrap();
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].step, 2);
    assert_eq!(logged[0].subsystem, "reconciliation");
}

#[test]
fn resume_picks_up_seed_and_step_from_the_store() {
    let (_dir, path, store) = common::file_store("resume-meta", 314);
    let mut engine = SimEngine::build("resume-meta".into(), 314, SimConfig::default_test(), store).unwrap();
    engine.advance_steps(3).unwrap();
    drop(engine);

    let store = SimStore::open(&path).unwrap();
    let engine = SimEngine::resume("resume-meta".into(), SimConfig::default_test(), store).unwrap();
    assert_eq!(engine.seed(), 314);
    assert_eq!(engine.clock.current_step, 3);
}

#[test]
fn rerunning_an_interrupted_step_does_not_double_it() {
    let mut config = SimConfig::default_test();
    config.lifecycle.new_customers_per_step = 3;
    let (_dir, path, store) = common::file_store("rerun-step", 27);
    seed_customers(&store, 8, day0());
    seed_catalog(&store, 40, 2, day0());

    let mut engine = SimEngine::build("rerun-step".into(), 27, config.clone(), store).unwrap();
    engine.advance_steps(2).unwrap();
    let first = engine.last_rental_summary().unwrap();
    assert_eq!(first.allocation_misses, 0, "the step must meet its full volume for this check");

    let loans = engine.store.all_loans().unwrap();
    let customers = engine.store.customer_count().unwrap();
    let lifecycle = engine.store.lifecycle_rows(ShardConfig::default()).unwrap();
    let payments: usize = loans.iter().map(|l| engine.store.payments_for_loan(l.loan_id).unwrap().len()).sum();
    assert_eq!(customers, 14);

    // Every write of step 2 landed but its progress record did not.
    let through = engine.clock.step_end(1);
    engine.store.record_step_completed("rerun-step", 0, 1, through).unwrap();
    drop(engine);

    let store = SimStore::open(&path).unwrap();
    let mut resumed = SimEngine::resume("rerun-step".into(), config, store).unwrap();
    assert_eq!(resumed.clock.current_step, 1);
    resumed.advance_steps(1).unwrap();

    let rerun = resumed.last_rental_summary().unwrap();
    assert_eq!(rerun.loans_committed, 0);
    assert_eq!(rerun.lifecycle.onboarded, 0);
    assert_eq!(rerun.lifecycle.active, first.lifecycle.active);

    let store = &resumed.store;
    assert_eq!(store.all_loans().unwrap(), loans);
    assert_eq!(store.customer_count().unwrap(), customers);
    assert_eq!(store.lifecycle_rows(ShardConfig::default()).unwrap(), lifecycle);
    let payments_after: usize = loans.iter().map(|l| store.payments_for_loan(l.loan_id).unwrap().len()).sum();
    assert_eq!(payments_after, payments);
    assert_eq!(store.last_completed_step("rerun-step", 0).unwrap(), Some(2));
}
