//! Fixtures shared by the integration tests.
#![allow(dead_code)]

use chrono::{Days, NaiveDate};
use rental_sim_core::{
    store::SimStore,
    types::{CatalogItemId, CustomerId, UnitId},
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Monday 2024-01-01, the first day of step 1 under `SimConfig::default_test()`.
pub fn day0() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
}

pub fn day(offset: u64) -> NaiveDate {
    day0() + Days::new(offset)
}

/// `items` catalog items with `copies` units each, all introduced on `on`.
pub fn seed_catalog(
    store: &SimStore,
    items: usize,
    copies: usize,
    on: NaiveDate,
) -> Vec<(CatalogItemId, Vec<UnitId>)> {
    (0..items)
        .map(|i| {
            let item = store
                .insert_catalog_item(&format!("Title {i:04}"), on)
                .expect("insert catalog item");
            let units = (0..copies)
                .map(|_| store.insert_inventory_unit(item, on).expect("insert unit"))
                .collect();
            (item, units)
        })
        .collect()
}

pub fn seed_customers(store: &SimStore, n: usize, on: NaiveDate) -> Vec<CustomerId> {
    (0..n)
        .map(|_| store.insert_customer(on, false).expect("insert customer"))
        .collect()
}

/// A migrated file-backed store in a fresh temp directory. Keep the
/// directory alive for as long as the store is used.
pub fn file_store(run_id: &str, seed: u64) -> (tempfile::TempDir, String, SimStore) {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("rental-sim.db").to_string_lossy().to_string();
    let store = SimStore::open(&path).expect("open file store");
    store.migrate().expect("migration");
    store.insert_run(run_id, seed, "test", day0()).expect("insert run");
    (dir, path, store)
}
