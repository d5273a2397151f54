//! sim-runner: headless runner for the rental simulation.
//!
//! Usage:
//!   sim-runner --seed 12345 --steps 52 --db run.db
//!   sim-runner --db run.db --run-id <id> --steps 26          (resume)
//!   sim-runner --db run.db --shard-index 1 --shard-count 4   (one worker of four)
//!   sim-runner --config sim.json --reconcile-as-of 2006-06-30 --json

use anyhow::{Context, Result};
use chrono::{Days, NaiveDate};
use rental_sim_core::{
    config::SimConfig,
    engine::SimEngine,
    reconciliation_subsystem::ReconciliationReport,
    store::SimStore,
    types::{AccountStanding, ActivityStatus, UnitStatus},
};
use std::collections::BTreeMap;
use std::env;

/// Share of the seeded catalog that is already on the shelf at step 1.
/// The rest is released one title at a time over the run.
const BACK_CATALOG_SHARE: f64 = 0.8;

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let seed = parse_arg(&args, "--seed", 42u64);
    let steps = parse_arg(&args, "--steps", 52u64);
    let catalog_items = parse_arg(&args, "--catalog-items", 200usize);
    let copies = parse_arg(&args, "--copies", 3usize);
    let customers = parse_arg(&args, "--customers", 100usize);
    let json = args.iter().any(|a| a == "--json");
    let db = string_arg(&args, "--db").unwrap_or(":memory:");

    let mut config = match string_arg(&args, "--config") {
        Some(path) => SimConfig::load(path)?,
        None => SimConfig::default(),
    };
    config.shard.index = parse_arg(&args, "--shard-index", config.shard.index);
    config.shard.count = parse_arg(&args, "--shard-count", config.shard.count);
    let reconcile_as_of = string_arg(&args, "--reconcile-as-of")
        .map(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| format!("bad --reconcile-as-of '{s}'")))
        .transpose()?;

    let store = if db == ":memory:" { SimStore::in_memory()? } else { SimStore::open(db)? };
    store.migrate()?;

    let mut engine = match string_arg(&args, "--run-id") {
        Some(run_id) if store.run_seed(run_id)?.is_some() => {
            SimEngine::resume(run_id.to_string(), config, store)?
        }
        requested => {
            let run_id = requested.map(str::to_string).unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            store.insert_run(&run_id, seed, env!("CARGO_PKG_VERSION"), config.start_date)?;
            SimEngine::build(run_id, seed, config, store)?
        }
    };

    if !json {
        println!("rental-sim: sim-runner");
        println!("  run_id:    {}", engine.run_id);
        println!("  seed:      {}", engine.seed());
        println!("  steps:     {steps}");
        println!("  db:        {db}");
        println!("  shard:     {}/{}", engine.config().shard.index, engine.config().shard.count);
        println!();
    }

    seed_store_if_empty(&engine, catalog_items, copies, customers, steps)?;

    engine.advance_steps(steps)?;

    let as_of = reconcile_as_of.unwrap_or_else(|| engine.clock.step_end(engine.clock.current_step));
    let report = engine.run_reconciliation(as_of)?;

    if json {
        print_json_summary(&engine, &report)?;
    } else {
        print_summary(&engine, &report, steps)?;
    }

    // A double checkout or an orphaned open loan fails the run.
    report.into_result()?;
    Ok(())
}

/// Populate a fresh store with a catalog, its units, and an opening
/// customer base. Only shard 0 seeds; other workers expect a seeded store.
fn seed_store_if_empty(
    engine: &SimEngine,
    catalog_items: usize,
    copies: usize,
    customers: usize,
    steps: u64,
) -> Result<()> {
    let store = &engine.store;
    let config = engine.config();
    if config.shard.index != 0 || store.catalog_item_count()? > 0 {
        return Ok(());
    }

    let back_catalog = (catalog_items as f64 * BACK_CATALOG_SHARE).round() as usize;
    let released_before = config.start_date - Days::new(365);
    for i in 0..catalog_items {
        let introduced_on = if i < back_catalog {
            released_before
        } else {
            // Spread new releases evenly over the run's weeks.
            let new_releases = (catalog_items - back_catalog) as u64;
            let week = (i - back_catalog) as u64 * steps.max(1) / new_releases.max(1);
            config.start_date + Days::new(7 * week)
        };
        let item = store.insert_catalog_item(&format!("Title {:05}", i + 1), introduced_on)?;
        for _ in 0..copies {
            store.insert_inventory_unit(item, introduced_on)?;
        }
    }

    let loyal = (customers as f64 * config.lifecycle.loyal_fraction).round() as usize;
    for i in 0..customers {
        store.insert_customer(released_before, i < loyal)?;
    }

    log::info!(
        "seeded {catalog_items} titles ({back_catalog} back catalog) x {copies} copies, {customers} customers"
    );
    Ok(())
}

fn standing_counts(engine: &SimEngine) -> Result<(BTreeMap<&'static str, usize>, f64)> {
    let mut counts = BTreeMap::new();
    let mut outstanding = 0.0;
    for account in engine.store.all_customer_accounts()? {
        *counts.entry(account.standing.as_str()).or_insert(0) += 1;
        outstanding += account.outstanding_balance;
    }
    for standing in [
        AccountStanding::GoodStanding,
        AccountStanding::PastDue,
        AccountStanding::AtRisk,
        AccountStanding::Suspended,
    ] {
        counts.entry(standing.as_str()).or_insert(0);
    }
    Ok((counts, outstanding))
}

fn print_summary(engine: &SimEngine, report: &ReconciliationReport, steps: u64) -> Result<()> {
    let store = &engine.store;
    let loans = store.loan_count()?;
    let (standings, outstanding) = standing_counts(engine)?;

    println!("=== RUN SUMMARY ===");
    println!("  run_id:          {}", engine.run_id);
    println!("  steps run:       {steps}");
    println!("  final step:      {}", engine.clock.current_step);
    println!("  customers:       {}", store.customer_count()?);
    println!("    active:        {}", store.lifecycle_count_by_status(ActivityStatus::Active)?);
    println!("    inactive:      {}", store.lifecycle_count_by_status(ActivityStatus::Inactive)?);
    println!("  loans:           {loans}");
    println!("  open loans:      {}", store.open_loan_count()?);
    println!("  avg weekly:      {:.1}", loans as f64 / steps.max(1) as f64);
    println!("  units on loan:   {}", store.unit_count_by_status(UnitStatus::OnLoan)?);
    println!("  units missing:   {}", store.unit_count_by_status(UnitStatus::Missing)?);

    if let Some(last) = engine.last_rental_summary() {
        println!();
        println!("=== LAST STEP ===");
        println!("  target volume:   {}", last.target_volume);
        println!("  loans committed: {}", last.loans_committed);
        println!("  misses:          {}", last.allocation_misses);
        println!("  lost races:      {}", last.lost_races);
        println!("  returns:         {}", last.returns_recorded);
    }

    println!();
    println!("=== RECONCILIATION as of {} ===", report.as_of);
    println!("  fees upserted:   {}", report.fees_upserted);
    println!("  fees finalized:  {}", report.fees_finalized);
    println!("  accounts:        {}", report.accounts_recomputed);
    println!("  audit events:    {}", report.audit_events_emitted);
    println!("  outstanding:     {outstanding:.2}");
    for (standing, count) in &standings {
        println!("    {standing:<14} {count}");
    }
    if report.violations.is_empty() {
        println!("  integrity:       ok");
    } else {
        println!("  integrity:       {} VIOLATIONS", report.violations.len());
        for v in &report.violations {
            println!("    unit {} loans {:?}", v.unit_id(), v.loan_ids());
        }
    }
    Ok(())
}

fn print_json_summary(engine: &SimEngine, report: &ReconciliationReport) -> Result<()> {
    let store = &engine.store;
    let (standings, outstanding) = standing_counts(engine)?;
    let summary = serde_json::json!({
        "run_id": engine.run_id,
        "seed": engine.seed(),
        "final_step": engine.clock.current_step,
        "customers": {
            "total": store.customer_count()?,
            "active": store.lifecycle_count_by_status(ActivityStatus::Active)?,
            "inactive": store.lifecycle_count_by_status(ActivityStatus::Inactive)?,
        },
        "loans": store.loan_count()?,
        "open_loans": store.open_loan_count()?,
        "reconciliation": {
            "as_of": report.as_of,
            "fees_upserted": report.fees_upserted,
            "fees_finalized": report.fees_finalized,
            "accounts_recomputed": report.accounts_recomputed,
            "audit_events_emitted": report.audit_events_emitted,
            "outstanding_balance": outstanding,
            "standings": standings,
            "integrity_violations": report.violations.len(),
        },
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}

fn string_arg<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2).find(|w| w[0] == flag).map(|w| w[1].as_str())
}
