//! Availability index: the units believed available, grouped by item.
//!
//! Loaded once per step and kept current as this worker claims and
//! releases units. Another worker can make an entry stale at any moment,
//! so the index only nominates units; the conditional claim in the store
//! is what decides.

use crate::{
    store::AvailableUnitRow,
    types::{CatalogItemId, UnitId},
};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default)]
pub struct AvailabilityIndex {
    by_item: BTreeMap<CatalogItemId, BTreeSet<UnitId>>,
    units:   usize,
}

impl AvailabilityIndex {
    pub fn from_rows(rows: &[AvailableUnitRow]) -> Self {
        let mut index = Self::default();
        for row in rows {
            index.release(row.catalog_item_id, row.unit_id);
        }
        index
    }

    pub fn has_stock(&self, item: CatalogItemId) -> bool {
        self.by_item.get(&item).is_some_and(|units| !units.is_empty())
    }

    /// The unit to hand out for `item`: always the lowest unit id, so sibling
    /// ties resolve the same way on every run.
    pub fn pick_unit(&self, item: CatalogItemId) -> Option<UnitId> {
        self.by_item.get(&item).and_then(|units| units.first().copied())
    }

    /// Drop a unit, whether this worker claimed it or lost it to another.
    pub fn remove(&mut self, item: CatalogItemId, unit: UnitId) {
        if let Some(units) = self.by_item.get_mut(&item) {
            if units.remove(&unit) {
                self.units -= 1;
            }
            if units.is_empty() {
                self.by_item.remove(&item);
            }
        }
    }

    /// A returned unit is available again.
    pub fn release(&mut self, item: CatalogItemId, unit: UnitId) {
        if self.by_item.entry(item).or_default().insert(unit) {
            self.units += 1;
        }
    }

    pub fn unit_count(&self) -> usize {
        self.units
    }

    pub fn item_count(&self) -> usize {
        self.by_item.len()
    }
}
