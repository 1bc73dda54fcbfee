//! Streaming feature extraction
//!
//! Per heart-rate sample this module derives:
//! - RMSSD over the recent heart-rate buffer
//! - CV (coefficient of variation) over the RMSSD history
//! - Mean absolute successive difference (the awake signal)
//! - Elapsed minutes since the session start
//!
//! All buffers are bounded `VecDeque`s, so work per sample is constant.

use crate::config::FeatureConfig;
use crate::types::{minutes_between, HeartRateSample};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Features derived for one sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleFeatures {
    pub rmssd: f64,
    pub cv: f64,
    /// Mean absolute successive HR difference over the last differences
    pub mean_diff: f64,
    pub elapsed_minutes: f64,
    /// Heart-rate buffer contents after this sample, oldest first
    pub recent_hr: Vec<f64>,
}

impl SampleFeatures {
    /// Whether every scalar feature is finite
    pub fn is_finite(&self) -> bool {
        self.rmssd.is_finite()
            && self.cv.is_finite()
            && self.mean_diff.is_finite()
            && self.elapsed_minutes.is_finite()
    }

    /// Whether the awake signal is backed by at least one successive difference
    pub fn has_variability(&self) -> bool {
        self.recent_hr.len() >= 2
    }
}

/// Per-session feature extractor holding the bounded buffers
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    config: FeatureConfig,
    session_start: DateTime<Utc>,
    recent_hr: VecDeque<f64>,
    rmssd_history: VecDeque<f64>,
}

impl FeatureExtractor {
    /// Create an extractor anchored at `session_start`
    pub fn new(config: FeatureConfig, session_start: DateTime<Utc>) -> Self {
        Self {
            recent_hr: VecDeque::with_capacity(config.hr_buffer_capacity),
            rmssd_history: VecDeque::with_capacity(config.rmssd_history_capacity),
            config,
            session_start,
        }
    }

    pub fn session_start(&self) -> DateTime<Utc> {
        self.session_start
    }

    /// Push one sample and derive its features
    pub fn push(&mut self, sample: &HeartRateSample) -> SampleFeatures {
        push_bounded(
            &mut self.recent_hr,
            f64::from(sample.bpm),
            self.config.hr_buffer_capacity,
        );

        let rmssd = compute_rmssd(&self.recent_hr).unwrap_or(self.config.rmssd_sentinel);
        let mean_diff = compute_mean_diff(&self.recent_hr, self.config.mean_diff_window);

        push_bounded(
            &mut self.rmssd_history,
            rmssd,
            self.config.rmssd_history_capacity,
        );

        let cv = compute_cv(&self.rmssd_history, &self.config);
        let elapsed_minutes = minutes_between(self.session_start, sample.timestamp);

        SampleFeatures {
            rmssd,
            cv,
            mean_diff,
            elapsed_minutes,
            recent_hr: self.recent_hr.iter().copied().collect(),
        }
    }

    /// Clear all buffers and re-anchor at a new session start
    pub fn reset(&mut self, session_start: DateTime<Utc>) {
        self.recent_hr.clear();
        self.rmssd_history.clear();
        self.session_start = session_start;
    }
}

fn push_bounded(buffer: &mut VecDeque<f64>, value: f64, capacity: usize) {
    buffer.push_back(value);
    while buffer.len() > capacity {
        buffer.pop_front();
    }
}

/// Root mean square of successive differences.
///
/// The divisor is the number of differences (`n - 1` for `n` values).
/// Returns `None` with fewer than two values.
pub fn compute_rmssd(values: &VecDeque<f64>) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let (sum_sq, count) =
        successive_diffs(values).fold((0.0, 0usize), |(sum, n), d| (sum + d * d, n + 1));
    Some((sum_sq / count as f64).sqrt())
}

/// Mean absolute successive difference over the last `window` differences.
///
/// Zero with fewer than two values.
pub fn compute_mean_diff(values: &VecDeque<f64>, window: usize) -> f64 {
    if values.len() < 2 || window == 0 {
        return 0.0;
    }
    let diffs: Vec<f64> = successive_diffs(values).map(f64::abs).collect();
    let tail = &diffs[diffs.len().saturating_sub(window)..];
    tail.iter().sum::<f64>() / tail.len() as f64
}

/// Coefficient of variation (population std / mean) of the RMSSD history.
///
/// Falls back to `cv_default` when the history is shorter than
/// `cv_min_history` or its mean is below `cv_min_mean`.
pub fn compute_cv(history: &VecDeque<f64>, config: &FeatureConfig) -> f64 {
    if history.len() < config.cv_min_history || history.is_empty() {
        return config.cv_default;
    }
    let n = history.len() as f64;
    let mean = history.iter().sum::<f64>() / n;
    if mean < config.cv_min_mean {
        return config.cv_default;
    }
    let variance = history.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt() / mean
}

fn successive_diffs(values: &VecDeque<f64>) -> impl Iterator<Item = f64> + '_ {
    values
        .iter()
        .zip(values.iter().skip(1))
        .map(|(prev, next)| next - prev)
}
