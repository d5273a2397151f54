//! Demand model: how many rentals each day of a step should produce.
//!
//! target(step) = base_volume × phase(step) × season(month of step start)
//!
//! The weekly target is split over the seven days by day-of-week shares
//! (largest remainder, so the days always sum to the target), then each
//! day may independently become a spike day.

use crate::{
    config::{DemandConfig, PhaseConfig},
    rng::SubsystemRng,
    types::Step,
};
use chrono::{Datelike, Days, NaiveDate};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusinessPhase {
    Growth,
    Plateau,
    Decline,
    Reactivation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayPlan {
    pub date:   NaiveDate,
    pub volume: u64,
    pub spike:  bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeekPlan {
    pub phase:         BusinessPhase,
    pub target_volume: u64,
    pub days:          Vec<DayPlan>,
}

impl WeekPlan {
    pub fn total_volume(&self) -> u64 {
        self.days.iter().map(|d| d.volume).sum()
    }
}

pub struct DemandModel<'a> {
    config: &'a DemandConfig,
}

impl<'a> DemandModel<'a> {
    pub fn new(config: &'a DemandConfig) -> Self {
        Self { config }
    }

    fn phases(&self) -> [(BusinessPhase, PhaseConfig); 4] {
        let p = &self.config.phase_multipliers;
        [
            (BusinessPhase::Growth, p.growth),
            (BusinessPhase::Plateau, p.plateau),
            (BusinessPhase::Decline, p.decline),
            (BusinessPhase::Reactivation, p.reactivation),
        ]
    }

    /// Phase containing `step`. Runs past the last phase stay in it.
    pub fn phase_for(&self, step: Step) -> BusinessPhase {
        let mut end: Step = 0;
        for (phase, cfg) in self.phases() {
            end += cfg.weeks as Step;
            if step <= end {
                return phase;
            }
        }
        BusinessPhase::Reactivation
    }

    /// 1 + the weekly rates accumulated over every week up to `step`.
    /// Continuous across phase boundaries; flat after the last phase.
    pub fn phase_multiplier(&self, step: Step) -> f64 {
        let mut remaining = step;
        let mut modifier = 0.0;
        for (_, cfg) in self.phases() {
            let weeks = remaining.min(cfg.weeks as Step);
            modifier += weeks as f64 * cfg.weekly_rate;
            remaining -= weeks;
            if remaining == 0 {
                break;
            }
        }
        (1.0 + modifier).max(self.config.min_phase_multiplier)
    }

    pub fn seasonal_multiplier(&self, date: NaiveDate) -> f64 {
        self.config.seasonal_multipliers[date.month0() as usize]
    }

    pub fn target_volume(&self, step: Step, step_start: NaiveDate) -> u64 {
        let raw = self.config.base_volume
            * self.phase_multiplier(step)
            * self.seasonal_multiplier(step_start);
        raw.round().max(0.0) as u64
    }

    /// Day-of-week shares, Monday first, summing to 1.
    ///
    /// Weekend-heavy while the business is new, then shifting linearly
    /// toward weekday-heavy.
    pub fn day_shares(&self, step: Step) -> [f64; 7] {
        let shift = &self.config.weekday_shift;
        let raw = if step <= shift.weekend_heavy_steps as Step {
            [0.10, 0.10, 0.10, 0.10, 0.15, 0.20, 0.15]
        } else {
            let since = (step - shift.weekend_heavy_steps as Step) as f64;
            let progress = (since / shift.shift_steps.max(1) as f64).min(1.0);
            let weekday = 0.12 + 0.08 * progress;
            let weekend = 0.15 - 0.05 * progress;
            [weekday, weekday, weekday, weekday + 0.01, weekend, weekend, weekend - 0.01]
        };
        let total: f64 = raw.iter().sum();
        raw.map(|s| s / total)
    }

    /// Plan the seven days of `step`.
    pub fn plan_week(&self, step: Step, step_start: NaiveDate, rng: &mut SubsystemRng) -> WeekPlan {
        let target = self.target_volume(step, step_start);
        let shares = self.day_shares(step);
        let base = apportion(target, &shares);

        let days = base
            .iter()
            .enumerate()
            .map(|(offset, &volume)| {
                let date = step_start + Days::new(offset as u64);
                let spike = rng.chance(self.config.spike_probability);
                let volume = if spike {
                    (volume as f64 * self.config.spike_multiplier).round() as u64
                } else {
                    volume
                };
                DayPlan { date, volume, spike }
            })
            .collect();

        WeekPlan { phase: self.phase_for(step), target_volume: target, days }
    }
}

/// Split `total` into integer parts proportional to `shares`, largest
/// remainder first, ties to the earlier index.
pub fn apportion(total: u64, shares: &[f64]) -> Vec<u64> {
    let sum: f64 = shares.iter().sum();
    if shares.is_empty() || sum <= 0.0 {
        return vec![0; shares.len()];
    }
    let exact: Vec<f64> = shares.iter().map(|s| total as f64 * s / sum).collect();
    let mut parts: Vec<u64> = exact.iter().map(|e| e.floor() as u64).collect();
    let assigned: u64 = parts.iter().sum();

    let mut order: Vec<usize> = (0..shares.len()).collect();
    order.sort_by(|&a, &b| {
        let ra = exact[a] - exact[a].floor();
        let rb = exact[b] - exact[b].floor();
        rb.partial_cmp(&ra).unwrap_or(std::cmp::Ordering::Equal).then(a.cmp(&b))
    });
    for &i in order.iter().cycle().take(total.saturating_sub(assigned) as usize) {
        parts[i] += 1;
    }
    parts
}
