//! Time-based priors
//!
//! Pure functions of elapsed session minutes: the probability of being awake,
//! the ultradian REM propensity, and the prior-scaled awake threshold.

use crate::config::{AwakePriorConfig, DynamicThresholdConfig, RemPropensityConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Source of the awake prior used by the awake gate
pub trait AwakePrior {
    /// Probability of being awake `minutes` after session start
    fn awake_prior(&self, minutes: f64) -> f64;
}

impl AwakePrior for AwakePriorConfig {
    fn awake_prior(&self, minutes: f64) -> f64 {
        if let Some(step) = self.steps.iter().find(|s| minutes < s.until_minutes) {
            return step.prior;
        }
        let tail_start = self.steps.last().map(|s| s.until_minutes).unwrap_or(0.0);
        (self.tail_base + self.tail_slope_per_minute * (minutes - tail_start)).min(self.tail_cap)
    }
}

/// Awake prior learned per fixed-width time bin.
///
/// Unpopulated bins resolve to the nearest populated bin, ties going to the
/// earlier bin. With no populated bins at all, `empty_default` applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinnedAwakePrior {
    pub bin_minutes: f64,
    pub bins: BTreeMap<u32, f64>,
    pub empty_default: f64,
}

impl BinnedAwakePrior {
    pub fn new(bin_minutes: f64, bins: BTreeMap<u32, f64>, empty_default: f64) -> Self {
        Self {
            bin_minutes,
            bins,
            empty_default,
        }
    }

    /// Bin index for elapsed minutes (negative minutes clamp to bin 0)
    pub fn bin_index(&self, minutes: f64) -> u32 {
        if minutes <= 0.0 || !minutes.is_finite() {
            return 0;
        }
        (minutes / self.bin_minutes).floor().min(f64::from(u32::MAX)) as u32
    }

    /// Nearest populated bin to `bin`
    pub fn nearest_bin(&self, bin: u32) -> Option<u32> {
        let below = self.bins.range(..=bin).next_back().map(|(k, _)| *k);
        let above = self.bins.range(bin..).next().map(|(k, _)| *k);
        match (below, above) {
            (Some(b), Some(a)) => Some(if bin - b <= a - bin { b } else { a }),
            (Some(b), None) => Some(b),
            (None, Some(a)) => Some(a),
            (None, None) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }
}

impl AwakePrior for BinnedAwakePrior {
    fn awake_prior(&self, minutes: f64) -> f64 {
        self.nearest_bin(self.bin_index(minutes))
            .and_then(|bin| self.bins.get(&bin).copied())
            .unwrap_or(self.empty_default)
    }
}

/// Awake prior actually used by a classifier: learned bins when available,
/// otherwise the configured piecewise table
#[derive(Debug, Clone, PartialEq)]
pub enum AwakePriorModel {
    Piecewise(AwakePriorConfig),
    Learned(BinnedAwakePrior),
}

impl AwakePrior for AwakePriorModel {
    fn awake_prior(&self, minutes: f64) -> f64 {
        match self {
            AwakePriorModel::Piecewise(table) => table.awake_prior(minutes),
            AwakePriorModel::Learned(bins) => bins.awake_prior(minutes),
        }
    }
}

/// Ultradian REM propensity.
///
/// Zero before sleep latency. Afterwards the baseline grows with the cycle
/// index (capped) and is multiplied up in the late phase of each cycle.
pub fn rem_propensity(minutes: f64, config: &RemPropensityConfig) -> f64 {
    if !(minutes >= config.sleep_latency_minutes) {
        return 0.0;
    }
    let cycle = (minutes / config.cycle_minutes).floor();
    let position = (minutes % config.cycle_minutes) / config.cycle_minutes;
    let base = (config.base + cycle * config.growth_per_cycle).min(config.cap);
    if position >= config.late_phase_start {
        base * config.late_multiplier
    } else {
        base * config.early_multiplier
    }
}

/// Awake threshold scaled by the awake prior.
///
/// Both cut points are exclusive: a prior of exactly `high_prior_cut` or
/// `low_prior_cut` leaves the base threshold unchanged.
pub fn dynamic_awake_threshold(base: f64, prior: f64, config: &DynamicThresholdConfig) -> f64 {
    if prior > config.high_prior_cut {
        base * config.high_prior_multiplier
    } else if prior < config.low_prior_cut {
        base * config.low_prior_multiplier
    } else {
        base
    }
}
