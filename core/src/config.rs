use crate::{
    error::{SimError, SimResult},
    types::CustomerId,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

// ── Popularity ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PopularityConfig {
    /// Zipf exponent applied to rental-count rank.
    pub alpha: f64,
    pub new_item_boost_days: i64,
    pub new_item_boost_factor: f64,
}

impl Default for PopularityConfig {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            new_item_boost_days: 90,
            new_item_boost_factor: 2.0,
        }
    }
}

// ── Allocation ───────────────────────────────────────────────────────────────

/// How the allocator finds an eligible catalog item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AllocationStrategy {
    /// Build the full eligible set and draw from it. Never reports a false miss.
    Exhaustive,
    /// Draw `candidates` items from the unfiltered distribution and keep the
    /// first eligible one. Avoids touching the whole catalog per draw, at the
    /// cost of occasionally missing when eligible stock exists.
    Sampled { candidates: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationConfig {
    pub recency_exclusion_days: i64,
    pub strategy: AllocationStrategy,
    /// Upper bound on draw + claim attempts per unit of volume.
    pub max_attempts: u32,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            recency_exclusion_days: 30,
            strategy: AllocationStrategy::Exhaustive,
            max_attempts: 5,
        }
    }
}

// ── Customer lifecycle ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub churn_probability: f64,
    pub reactivation_probability: f64,
    /// Consecutive steps without a rental before an active customer goes inactive.
    pub inactivity_threshold_steps: u32,
    pub new_customers_per_step: u32,
    /// Share of new customers that are never subject to the churn draw.
    pub loyal_fraction: f64,
    /// Tenure (in steps) before a customer becomes eligible for churn.
    pub churn_grace_steps: u32,
    /// Opening steps of a run during which nobody churns.
    pub ramp_up_steps: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            churn_probability: 0.40,
            reactivation_probability: 0.10,
            inactivity_threshold_steps: 5,
            new_customers_per_step: 10,
            loyal_fraction: 0.15,
            churn_grace_steps: 5,
            ramp_up_steps: 8,
        }
    }
}

// ── Demand ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PhaseConfig {
    pub weeks: u32,
    /// Added to the volume multiplier for every week spent in the phase.
    pub weekly_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseMultipliers {
    pub growth: PhaseConfig,
    pub plateau: PhaseConfig,
    pub decline: PhaseConfig,
    pub reactivation: PhaseConfig,
}

impl Default for PhaseMultipliers {
    fn default() -> Self {
        Self {
            growth:       PhaseConfig { weeks: 104, weekly_rate: 0.025 },
            plateau:      PhaseConfig { weeks: 208, weekly_rate: 0.0 },
            decline:      PhaseConfig { weeks: 104, weekly_rate: -0.005 },
            reactivation: PhaseConfig { weeks: 104, weekly_rate: 0.015 },
        }
    }
}

impl PhaseMultipliers {
    /// Every phase contributes nothing: volume stays at the base rate.
    pub fn flat() -> Self {
        let flat = PhaseConfig { weeks: 1, weekly_rate: 0.0 };
        Self { growth: flat, plateau: flat, decline: flat, reactivation: flat }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WeekdayShiftConfig {
    /// Steps during which the weekend-heavy day shares apply unchanged.
    pub weekend_heavy_steps: u32,
    /// Steps over which shares move linearly toward weekday-heavy.
    pub shift_steps: u32,
}

impl Default for WeekdayShiftConfig {
    fn default() -> Self {
        Self { weekend_heavy_steps: 8, shift_steps: 16 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemandConfig {
    /// Target rentals per step before any multiplier.
    pub base_volume: f64,
    pub phase_multipliers: PhaseMultipliers,
    /// Indexed by calendar month, January first.
    pub seasonal_multipliers: [f64; 12],
    /// Per simulated day.
    pub spike_probability: f64,
    pub spike_multiplier: f64,
    pub weekday_shift: WeekdayShiftConfig,
    /// Lower bound on the phase multiplier so long declines never reach zero.
    pub min_phase_multiplier: f64,
}

impl Default for DemandConfig {
    fn default() -> Self {
        Self {
            base_volume: 500.0,
            phase_multipliers: PhaseMultipliers::default(),
            seasonal_multipliers: [
                1.20, 0.90, 1.10, 1.15, 1.20, 1.80,
                2.00, 1.90, 1.30, 1.25, 1.40, 1.60,
            ],
            spike_probability: 0.05,
            spike_multiplier: 4.0,
            weekday_shift: WeekdayShiftConfig::default(),
            min_phase_multiplier: 0.1,
        }
    }
}

// ── Returns and payments ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReturnConfig {
    pub duration_days: Vec<i64>,
    pub duration_weights: Vec<f64>,
    pub late_return_probability: f64,
    pub late_days_max: i64,
    /// Probability that a loan is never returned.
    pub lost_probability: f64,
    /// Probability that a Thursday–Sunday return is pulled to the next Monday.
    pub early_week_bias: f64,
    pub rental_price_min: f64,
    pub rental_price_max: f64,
    pub late_fee_full_payment_probability: f64,
    pub late_fee_partial_payment_probability: f64,
}

impl Default for ReturnConfig {
    fn default() -> Self {
        Self {
            duration_days: vec![3, 4, 5, 6, 7],
            duration_weights: vec![0.3, 0.3, 0.2, 0.1, 0.1],
            late_return_probability: 0.10,
            late_days_max: 10,
            lost_probability: 0.02,
            early_week_bias: 0.5,
            rental_price_min: 2.99,
            rental_price_max: 15.99,
            late_fee_full_payment_probability: 0.6,
            late_fee_partial_payment_probability: 0.2,
        }
    }
}

// ── Late fees and receivables ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LateFeeConfig {
    pub late_fee_rate_per_day: f64,
    pub grace_period_days: i64,
    /// Fee records overdue longer than this are written off. None disables.
    pub write_off_after_days: Option<i64>,
}

impl Default for LateFeeConfig {
    fn default() -> Self {
        Self {
            late_fee_rate_per_day: 1.50,
            grace_period_days: 0,
            write_off_after_days: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArStatusThresholds {
    /// More overdue loans than this moves a customer to at_risk.
    pub at_risk_overdue_count: i64,
    /// Balance above this suspends the account.
    pub suspend_balance_ceiling: f64,
    /// More overdue loans than this suspends the account.
    pub suspend_overdue_ceiling: i64,
}

impl Default for ArStatusThresholds {
    fn default() -> Self {
        Self {
            at_risk_overdue_count: 2,
            suspend_balance_ceiling: 100.0,
            suspend_overdue_ceiling: 5,
        }
    }
}

// ── Worker sharding ──────────────────────────────────────────────────────────

/// Partition of customers driven by one worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardConfig {
    pub index: u32,
    pub count: u32,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self { index: 0, count: 1 }
    }
}

impl ShardConfig {
    /// Whether this worker handles the customer. Matches the store's
    /// `customer_id % count = index` filter.
    pub fn owns(&self, customer_id: CustomerId) -> bool {
        customer_id.rem_euclid(self.count.max(1) as i64) == self.index as i64
    }
}

// ── Top-level config ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub start_date: NaiveDate,
    pub popularity: PopularityConfig,
    pub allocation: AllocationConfig,
    pub lifecycle: LifecycleConfig,
    pub demand: DemandConfig,
    pub returns: ReturnConfig,
    pub late_fees: LateFeeConfig,
    pub ar_status_thresholds: ArStatusThresholds,
    pub shard: ShardConfig,
    /// Run a reconciliation pass as of the last day of every step.
    pub reconcile_each_step: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            start_date: NaiveDate::from_ymd_opt(2005, 5, 23).unwrap_or_default(),
            popularity: PopularityConfig::default(),
            allocation: AllocationConfig::default(),
            lifecycle: LifecycleConfig::default(),
            demand: DemandConfig::default(),
            returns: ReturnConfig::default(),
            late_fees: LateFeeConfig::default(),
            ar_status_thresholds: ArStatusThresholds::default(),
            shard: ShardConfig::default(),
            reconcile_each_step: false,
        }
    }
}

impl SimConfig {
    /// Load from a JSON file. Missing sections and fields take defaults.
    /// In tests, use SimConfig::default_test().
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let config: SimConfig = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Cannot parse {path}: {e}"))?;
        config.validate()?;
        Ok(config)
    }

    /// Small, flat, spike-free configuration. Volume is exactly
    /// `base_volume` every step, and nobody joins or churns unless a
    /// test asks for it.
    pub fn default_test() -> Self {
        Self {
            start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap_or_default(),
            lifecycle: LifecycleConfig {
                churn_probability: 0.0,
                reactivation_probability: 0.0,
                new_customers_per_step: 0,
                ramp_up_steps: 0,
                ..LifecycleConfig::default()
            },
            demand: DemandConfig {
                base_volume: 10.0,
                phase_multipliers: PhaseMultipliers::flat(),
                seasonal_multipliers: [1.0; 12],
                spike_probability: 0.0,
                ..DemandConfig::default()
            },
            returns: ReturnConfig {
                late_return_probability: 0.0,
                lost_probability: 0.0,
                early_week_bias: 0.0,
                ..ReturnConfig::default()
            },
            ..SimConfig::default()
        }
    }

    /// Reject configurations that would make any step meaningless.
    /// Called before the first step runs.
    pub fn validate(&self) -> SimResult<()> {
        let p = &self.popularity;
        check(p.alpha > 0.0 && p.alpha.is_finite(), "popularity.alpha", "must be > 0")?;
        check(p.new_item_boost_days > 0, "popularity.new_item_boost_days", "must be > 0")?;
        check(p.new_item_boost_factor >= 1.0, "popularity.new_item_boost_factor", "must be >= 1.0")?;

        let a = &self.allocation;
        check(a.recency_exclusion_days >= 0, "allocation.recency_exclusion_days", "must be >= 0")?;
        check(a.max_attempts >= 1, "allocation.max_attempts", "must be >= 1")?;
        if let AllocationStrategy::Sampled { candidates } = a.strategy {
            check(candidates >= 1, "allocation.strategy.candidates", "must be >= 1")?;
        }

        let l = &self.lifecycle;
        probability(l.churn_probability, "lifecycle.churn_probability")?;
        probability(l.reactivation_probability, "lifecycle.reactivation_probability")?;
        probability(l.loyal_fraction, "lifecycle.loyal_fraction")?;
        check(l.inactivity_threshold_steps >= 1, "lifecycle.inactivity_threshold_steps", "must be >= 1")?;

        let d = &self.demand;
        check(d.base_volume >= 0.0 && d.base_volume.is_finite(), "demand.base_volume", "must be >= 0")?;
        check(
            d.seasonal_multipliers.iter().all(|m| *m >= 0.0 && m.is_finite()),
            "demand.seasonal_multipliers",
            "must all be >= 0",
        )?;
        probability(d.spike_probability, "demand.spike_probability")?;
        check(d.spike_multiplier >= 1.0, "demand.spike_multiplier", "must be >= 1.0")?;
        check(d.min_phase_multiplier >= 0.0, "demand.min_phase_multiplier", "must be >= 0")?;

        let r = &self.returns;
        check(!r.duration_days.is_empty(), "returns.duration_days", "must not be empty")?;
        check(
            r.duration_days.len() == r.duration_weights.len(),
            "returns.duration_weights",
            "must have one weight per duration",
        )?;
        check(r.duration_days.iter().all(|d| *d >= 1), "returns.duration_days", "must all be >= 1")?;
        check(
            r.duration_weights.iter().all(|w| *w >= 0.0) && r.duration_weights.iter().sum::<f64>() > 0.0,
            "returns.duration_weights",
            "must be non-negative with a positive sum",
        )?;
        probability(r.late_return_probability, "returns.late_return_probability")?;
        check(r.late_days_max >= 1, "returns.late_days_max", "must be >= 1")?;
        probability(r.lost_probability, "returns.lost_probability")?;
        probability(r.early_week_bias, "returns.early_week_bias")?;
        check(
            r.rental_price_min >= 0.0 && r.rental_price_max >= r.rental_price_min,
            "returns.rental_price_max",
            "must be >= rental_price_min >= 0",
        )?;
        probability(r.late_fee_full_payment_probability, "returns.late_fee_full_payment_probability")?;
        probability(r.late_fee_partial_payment_probability, "returns.late_fee_partial_payment_probability")?;
        check(
            r.late_fee_full_payment_probability + r.late_fee_partial_payment_probability <= 1.0,
            "returns.late_fee_partial_payment_probability",
            "plus full payment probability must be <= 1.0",
        )?;

        let f = &self.late_fees;
        check(
            f.late_fee_rate_per_day >= 0.0 && f.late_fee_rate_per_day.is_finite(),
            "late_fees.late_fee_rate_per_day",
            "must be >= 0",
        )?;
        check(f.grace_period_days >= 0, "late_fees.grace_period_days", "must be >= 0")?;
        if let Some(days) = f.write_off_after_days {
            check(days > f.grace_period_days, "late_fees.write_off_after_days", "must exceed the grace period")?;
        }

        let t = &self.ar_status_thresholds;
        check(t.at_risk_overdue_count >= 0, "ar_status_thresholds.at_risk_overdue_count", "must be >= 0")?;
        check(
            t.suspend_overdue_ceiling >= t.at_risk_overdue_count,
            "ar_status_thresholds.suspend_overdue_ceiling",
            "must be >= at_risk_overdue_count",
        )?;
        check(t.suspend_balance_ceiling > 0.0, "ar_status_thresholds.suspend_balance_ceiling", "must be > 0")?;

        check(self.shard.count >= 1, "shard.count", "must be >= 1")?;
        check(self.shard.index < self.shard.count, "shard.index", "must be < shard.count")?;
        Ok(())
    }
}

fn check(ok: bool, field: &'static str, reason: &str) -> SimResult<()> {
    if ok {
        Ok(())
    } else {
        Err(SimError::InvalidConfig { field, reason: reason.to_string() })
    }
}

fn probability(p: f64, field: &'static str) -> SimResult<()> {
    check((0.0..=1.0).contains(&p), field, "must be within [0, 1]")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        SimConfig::default().validate().unwrap();
        SimConfig::default_test().validate().unwrap();
    }

    #[test]
    fn non_positive_alpha_is_rejected() {
        let mut config = SimConfig::default_test();
        config.popularity.alpha = 0.0;
        match config.validate() {
            Err(SimError::InvalidConfig { field, .. }) => assert_eq!(field, "popularity.alpha"),
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
    }

    #[test]
    fn negative_fee_rate_is_rejected() {
        let mut config = SimConfig::default_test();
        config.late_fees.late_fee_rate_per_day = -1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn mismatched_duration_weights_are_rejected() {
        let mut config = SimConfig::default_test();
        config.returns.duration_weights.pop();
        assert!(config.validate().is_err());
    }

    #[test]
    fn shard_index_must_fall_inside_count() {
        let mut config = SimConfig::default_test();
        config.shard = ShardConfig { index: 2, count: 2 };
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let json = r#"{ "popularity": { "alpha": 1.2 }, "late_fees": { "grace_period_days": 2 } }"#;
        let config: SimConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.popularity.alpha, 1.2);
        assert_eq!(config.popularity.new_item_boost_days, 90);
        assert_eq!(config.late_fees.grace_period_days, 2);
        assert_eq!(config.late_fees.late_fee_rate_per_day, 1.50);
        config.validate().unwrap();
    }

    #[test]
    fn sampled_strategy_parses_from_tagged_json() {
        let json = r#"{ "allocation": { "strategy": { "kind": "sampled", "candidates": 16 } } }"#;
        let config: SimConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.allocation.strategy, AllocationStrategy::Sampled { candidates: 16 });
    }
}
