//! Popularity weighter: turns rental history into a selection distribution.
//!
//! Design:
//!   - Rank items by rental count descending; ties break on catalog item id
//!     ascending so the ranking is a pure function of its inputs.
//!   - Base weight for rank r (0-based) is 1 / (r+1)^alpha.
//!   - Items introduced within the boost window get a multiplier falling
//!     linearly from the boost factor at day 0 to 1.0 at the window's end.
//!   - Weights are normalized; a cumulative table supports O(log n) draws.

use crate::{
    config::PopularityConfig,
    rng::SubsystemRng,
    store::CatalogPopularityRow,
    types::CatalogItemId,
};
use chrono::NaiveDate;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedItem {
    pub catalog_item_id: CatalogItemId,
    /// Normalized selection probability.
    pub probability:     f64,
}

#[derive(Debug, Clone)]
pub struct PopularityWeighter {
    alpha:        f64,
    boost_days:   i64,
    boost_factor: f64,
}

impl PopularityWeighter {
    pub fn new(config: &PopularityConfig) -> Self {
        Self {
            alpha:        config.alpha,
            boost_days:   config.new_item_boost_days,
            boost_factor: config.new_item_boost_factor,
        }
    }

    /// Rank-only weight before normalization.
    pub fn rank_weight(&self, rank: usize) -> f64 {
        1.0 / ((rank + 1) as f64).powf(self.alpha)
    }

    /// New-item multiplier for an item `days_since_intro` days old.
    pub fn boost_multiplier(&self, days_since_intro: i64) -> f64 {
        if days_since_intro < 0 || days_since_intro >= self.boost_days {
            return 1.0;
        }
        let elapsed = days_since_intro as f64 / self.boost_days as f64;
        self.boost_factor - elapsed * (self.boost_factor - 1.0)
    }

    /// Build the distribution over every item released by `as_of`.
    pub fn weigh(&self, items: &[CatalogPopularityRow], as_of: NaiveDate) -> PopularityDistribution {
        let mut ranked: Vec<&CatalogPopularityRow> =
            items.iter().filter(|i| i.introduced_on <= as_of).collect();
        ranked.sort_by(|a, b| {
            b.rental_count
                .cmp(&a.rental_count)
                .then(a.catalog_item_id.cmp(&b.catalog_item_id))
        });

        let raw: Vec<f64> = ranked
            .iter()
            .enumerate()
            .map(|(rank, item)| {
                let age = (as_of - item.introduced_on).num_days();
                self.rank_weight(rank) * self.boost_multiplier(age)
            })
            .collect();
        let total: f64 = raw.iter().sum();

        let entries: Vec<WeightedItem> = ranked
            .iter()
            .zip(&raw)
            .map(|(item, w)| WeightedItem {
                catalog_item_id: item.catalog_item_id,
                probability:     if total > 0.0 { w / total } else { 0.0 },
            })
            .collect();

        PopularityDistribution::from_entries(entries)
    }
}

/// A normalized distribution over catalog items, in rank order.
#[derive(Debug, Clone, Default)]
pub struct PopularityDistribution {
    entries:    Vec<WeightedItem>,
    cumulative: Vec<f64>,
    position:   HashMap<CatalogItemId, usize>,
}

impl PopularityDistribution {
    fn from_entries(entries: Vec<WeightedItem>) -> Self {
        let mut running = 0.0;
        let cumulative = entries
            .iter()
            .map(|e| {
                running += e.probability;
                running
            })
            .collect();
        let position = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.catalog_item_id, i))
            .collect();
        Self { entries, cumulative, position }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Items in rank order, most popular first.
    pub fn entries(&self) -> &[WeightedItem] {
        &self.entries
    }

    pub fn probability(&self, id: CatalogItemId) -> f64 {
        self.position
            .get(&id)
            .map(|&i| self.entries[i].probability)
            .unwrap_or(0.0)
    }

    /// Share of total mass held by the top `fraction` of ranked items.
    pub fn top_share(&self, fraction: f64) -> f64 {
        let n = ((self.entries.len() as f64) * fraction).round() as usize;
        self.entries.iter().take(n).map(|e| e.probability).sum()
    }

    /// Draw one item from the full distribution.
    pub fn sample(&self, rng: &mut SubsystemRng) -> Option<CatalogItemId> {
        let total = *self.cumulative.last()?;
        if total <= 0.0 {
            return None;
        }
        let roll = rng.next_f64() * total;
        let idx = self
            .cumulative
            .partition_point(|c| *c <= roll)
            .min(self.entries.len() - 1);
        Some(self.entries[idx].catalog_item_id)
    }

    /// Draw one item, considering only those for which `eligible` holds.
    /// Walks the whole distribution; returns None when nothing is eligible.
    pub fn sample_where(
        &self,
        rng: &mut SubsystemRng,
        mut eligible: impl FnMut(&WeightedItem) -> bool,
    ) -> Option<CatalogItemId> {
        let candidates: Vec<&WeightedItem> = self.entries.iter().filter(|e| eligible(e)).collect();
        let weights: Vec<f64> = candidates.iter().map(|e| e.probability).collect();
        rng.weighted_index(&weights).map(|i| candidates[i].catalog_item_id)
    }
}
