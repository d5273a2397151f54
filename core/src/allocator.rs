//! Inventory allocator: picks a unit for a customer on a given day.
//!
//! Design:
//!   - Per step, load the popularity distribution, the availability index
//!     and the recency window once, as batches. Nothing in the per-rental
//!     path issues a query except the claim itself.
//!   - Eligible = item has an available unit AND the customer has not
//!     rented the item within the recency window.
//!   - The claim is the store's conditional commit. A lost claim drops the
//!     unit from the index and draws again; attempts are bounded.

use crate::{
    availability::AvailabilityIndex,
    config::{AllocationStrategy, SimConfig},
    error::SimResult,
    popularity::{PopularityDistribution, PopularityWeighter, WeightedItem},
    rng::SubsystemRng,
    store::{ClaimOutcome, NewLoan, SimStore},
    types::{CatalogItemId, CustomerId, LoanId, UnitId},
};
use chrono::{Days, NaiveDate};
use std::collections::HashMap;

// ── Recency window ───────────────────────────────────────────────────────────

/// Which items each customer rented recently, built from one batch query.
#[derive(Debug, Clone, Default)]
pub struct RecencyWindow {
    days:        i64,
    by_customer: HashMap<CustomerId, Vec<(CatalogItemId, NaiveDate)>>,
}

impl RecencyWindow {
    /// Covers every day of the step starting at `step_start` and ending
    /// at `step_end`, plus `days` days of history before it.
    pub fn load(store: &SimStore, days: i64, step_start: NaiveDate, step_end: NaiveDate) -> SimResult<Self> {
        let mut window = Self { days, by_customer: HashMap::new() };
        if days <= 0 {
            return Ok(window);
        }
        let from = step_start - Days::new(days as u64);
        for rental in store.rentals_between(from, step_end)? {
            window.record(rental.customer_id, rental.catalog_item_id, rental.start_date);
        }
        Ok(window)
    }

    /// True if `customer` rented `item` within the `days` days up to `on`.
    pub fn excludes(&self, customer: CustomerId, item: CatalogItemId, on: NaiveDate) -> bool {
        if self.days <= 0 {
            return false;
        }
        let Some(rentals) = self.by_customer.get(&customer) else {
            return false;
        };
        let from = on - Days::new(self.days as u64);
        rentals
            .iter()
            .any(|(rented, date)| *rented == item && *date >= from && *date <= on)
    }

    pub fn record(&mut self, customer: CustomerId, item: CatalogItemId, on: NaiveDate) {
        if self.days > 0 {
            self.by_customer.entry(customer).or_default().push((item, on));
        }
    }
}

// ── Outcomes ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissReason {
    /// Nothing in stock passes the customer's eligibility rules.
    NoEligibleInventory,
    /// Every attempt either found no candidate or lost its claim.
    AttemptsExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationOutcome {
    Allocated {
        loan_id:         LoanId,
        unit_id:         UnitId,
        catalog_item_id: CatalogItemId,
    },
    Miss(MissReason),
}

#[derive(Debug, Clone, Copy)]
pub struct LoanRequest {
    pub customer_id: CustomerId,
    pub date:        NaiveDate,
    pub due_back_on: Option<NaiveDate>,
    pub rental_price: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationStats {
    pub allocated:  u64,
    pub misses:     u64,
    pub lost_races: u64,
}

// ── Allocator ────────────────────────────────────────────────────────────────

pub struct Allocator {
    strategy:     AllocationStrategy,
    max_attempts: u32,
    distribution: PopularityDistribution,
    availability: AvailabilityIndex,
    recency:      RecencyWindow,
    stats:        AllocationStats,
}

impl Allocator {
    pub fn new(
        config: &SimConfig,
        distribution: PopularityDistribution,
        availability: AvailabilityIndex,
        recency: RecencyWindow,
    ) -> Self {
        Self {
            strategy: config.allocation.strategy,
            max_attempts: config.allocation.max_attempts,
            distribution,
            availability,
            recency,
            stats: AllocationStats::default(),
        }
    }

    /// Load everything one step of allocation needs.
    pub fn prepare(
        store: &SimStore,
        config: &SimConfig,
        step_start: NaiveDate,
        step_end: NaiveDate,
    ) -> SimResult<Self> {
        let weighter = PopularityWeighter::new(&config.popularity);
        let distribution = weighter.weigh(&store.catalog_popularity(step_start)?, step_start);
        let availability = AvailabilityIndex::from_rows(&store.available_units(step_start)?);
        let recency = RecencyWindow::load(
            store,
            config.allocation.recency_exclusion_days,
            step_start,
            step_end,
        )?;
        log::debug!(
            "allocator prepared: items={} in_stock_items={} available_units={}",
            distribution.len(),
            availability.item_count(),
            availability.unit_count(),
        );
        Ok(Self::new(config, distribution, availability, recency))
    }

    pub fn stats(&self) -> AllocationStats {
        self.stats
    }

    /// A unit came back; it may be handed out again this step.
    pub fn release(&mut self, item: CatalogItemId, unit: UnitId) {
        self.availability.release(item, unit);
    }

    /// Pick, claim and commit one loan for the request.
    pub fn allocate(
        &mut self,
        store: &SimStore,
        request: &LoanRequest,
        rng: &mut SubsystemRng,
    ) -> SimResult<AllocationOutcome> {
        for _ in 0..self.max_attempts {
            let Some(item) = self.choose_item(request.customer_id, request.date, rng) else {
                if matches!(self.strategy, AllocationStrategy::Exhaustive) || self.availability.unit_count() == 0 {
                    return Ok(self.miss(MissReason::NoEligibleInventory));
                }
                continue;
            };
            let Some(unit) = self.availability.pick_unit(item) else {
                continue;
            };

            let loan = NewLoan {
                customer_id:     request.customer_id,
                unit_id:         unit,
                catalog_item_id: item,
                start_date:      request.date,
                due_back_on:     request.due_back_on,
                rental_price:    request.rental_price,
            };
            match store.commit_loan(&loan)? {
                ClaimOutcome::Committed(loan_id) => {
                    self.availability.remove(item, unit);
                    self.recency.record(request.customer_id, item, request.date);
                    self.stats.allocated += 1;
                    return Ok(AllocationOutcome::Allocated {
                        loan_id,
                        unit_id: unit,
                        catalog_item_id: item,
                    });
                }
                ClaimOutcome::Lost => {
                    self.availability.remove(item, unit);
                    self.stats.lost_races += 1;
                }
            }
        }
        Ok(self.miss(MissReason::AttemptsExhausted))
    }

    fn miss(&mut self, reason: MissReason) -> AllocationOutcome {
        self.stats.misses += 1;
        AllocationOutcome::Miss(reason)
    }

    fn choose_item(&self, customer: CustomerId, date: NaiveDate, rng: &mut SubsystemRng) -> Option<CatalogItemId> {
        match self.strategy {
            AllocationStrategy::Exhaustive => self
                .distribution
                .sample_where(rng, |item| self.is_eligible(customer, item, date)),
            AllocationStrategy::Sampled { candidates } => (0..candidates)
                .filter_map(|_| self.distribution.sample(rng))
                .find(|id| {
                    self.availability.has_stock(*id) && !self.recency.excludes(customer, *id, date)
                }),
        }
    }

    fn is_eligible(&self, customer: CustomerId, item: &WeightedItem, date: NaiveDate) -> bool {
        self.availability.has_stock(item.catalog_item_id)
            && !self.recency.excludes(customer, item.catalog_item_id, date)
    }
}
