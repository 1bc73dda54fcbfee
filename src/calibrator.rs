//! Adaptive calibration
//!
//! Learns, from labelled history, the parameters the streaming classifier
//! otherwise takes from defaults:
//! - per-time-bin awake priors (awake minutes / recorded minutes per bin)
//! - the stage transition matrix (consecutive stage records)
//! - the mean-diff awake threshold, from the separation of the awake and
//!   sleep mean-diff distributions
//!
//! Sessions are accumulated independently and merged, so the pass runs in
//! parallel across sessions.

use crate::config::{CalibrationConfig, ClassifierConfig};
use crate::error::ComputeError;
use crate::features::FeatureExtractor;
use crate::priors::{AwakePriorModel, BinnedAwakePrior};
use crate::session::align_samples;
use crate::smoother::TransitionMatrix;
use crate::types::{minutes_between, HeartRateSample, Session, Stage};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Parameters learned from history, consumed as immutable configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnedParameters {
    pub awake_prior: BinnedAwakePrior,
    pub transition_matrix: TransitionMatrix,
    pub mean_diff_threshold: f64,
    pub awake_mean_diff: f64,
    pub sleep_mean_diff: f64,
}

impl Default for LearnedParameters {
    fn default() -> Self {
        Self::defaults(&CalibrationConfig::default())
    }
}

impl LearnedParameters {
    /// Parameters used when nothing has been learned
    pub fn defaults(config: &CalibrationConfig) -> Self {
        Self {
            awake_prior: BinnedAwakePrior::new(
                config.bin_minutes,
                BTreeMap::new(),
                config.empty_bin_prior,
            ),
            transition_matrix: TransitionMatrix::default(),
            mean_diff_threshold: config.default_threshold,
            awake_mean_diff: config.default_awake_mean_diff,
            sleep_mean_diff: config.default_sleep_mean_diff,
        }
    }

    /// Awake prior to hand to the decision machine.
    ///
    /// Without any learned bin the configured piecewise table is used.
    pub fn awake_prior_model(&self, config: &ClassifierConfig) -> AwakePriorModel {
        if self.awake_prior.is_empty() {
            AwakePriorModel::Piecewise(config.awake_prior.clone())
        } else {
            AwakePriorModel::Learned(self.awake_prior.clone())
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ComputeError> {
        let params: Self = serde_json::from_str(json)?;
        if !params.transition_matrix.is_row_stochastic(1e-6) {
            return Err(ComputeError::ParseError(
                "Invalid learned parameters: transition rows must sum to 1".to_string(),
            ));
        }
        if !(params.awake_prior.bin_minutes > 0.0) {
            return Err(ComputeError::ParseError(
                "Invalid learned parameters: bin_minutes must be positive".to_string(),
            ));
        }
        Ok(params)
    }

    pub fn to_json(&self) -> Result<String, ComputeError> {
        serde_json::to_string_pretty(self).map_err(|e| ComputeError::EncodingError(e.to_string()))
    }
}

/// Whether a parameter came from data or from a default
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterSource {
    Learned,
    Defaulted,
}

/// Provenance of one transition-matrix row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRowReport {
    pub from: Stage,
    pub observations: u64,
    pub source: ParameterSource,
}

/// What calibration learned and what it defaulted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationReport {
    pub sessions_used: usize,
    pub sessions_skipped: usize,
    pub samples: usize,
    pub awake_observations: usize,
    pub sleep_observations: usize,
    pub threshold: ParameterSource,
    pub awake_mean_diff: ParameterSource,
    pub sleep_mean_diff: ParameterSource,
    pub transition_rows: Vec<TransitionRowReport>,
    /// Bins with recorded time
    pub learned_bins: Vec<u32>,
    /// Bins inside the learned range that resolve to a neighbouring bin
    pub fallback_bins: Vec<u32>,
}

impl CalibrationReport {
    /// True when nothing fell back to a default
    pub fn is_fully_learned(&self) -> bool {
        self.threshold == ParameterSource::Learned
            && self.awake_mean_diff == ParameterSource::Learned
            && self.sleep_mean_diff == ParameterSource::Learned
            && self
                .transition_rows
                .iter()
                .all(|row| row.source == ParameterSource::Learned)
            && self.fallback_bins.is_empty()
            && !self.learned_bins.is_empty()
    }
}

/// Per-session calibration statistics; merging is associative and commutative
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalibrationAccumulator {
    awake_minutes: BTreeMap<u32, f64>,
    total_minutes: BTreeMap<u32, f64>,
    transitions: [[u64; 3]; 3],
    awake_diffs: Vec<f64>,
    sleep_diffs: Vec<f64>,
    sessions: usize,
    samples: usize,
}

impl CalibrationAccumulator {
    /// Accumulate one labelled session
    pub fn observe_session(
        session: &Session,
        samples: &[HeartRateSample],
        config: &ClassifierConfig,
    ) -> Self {
        let mut acc = Self {
            sessions: 1,
            ..Self::default()
        };
        let bin_minutes = config.calibration.bin_minutes;
        let start = session.start_time();

        let mut previous: Option<Stage> = None;
        for record in session.records() {
            let label = record.label();
            if let Some(prev) = previous {
                acc.transitions[prev.index()][label.index()] += 1;
            }
            previous = Some(label);

            let from = minutes_between(start, record.start_time);
            let to = minutes_between(start, record.end_time);
            for (bin, minutes) in bin_overlaps(from, to, bin_minutes) {
                *acc.total_minutes.entry(bin).or_default() += minutes;
                if label == Stage::Awake {
                    *acc.awake_minutes.entry(bin).or_default() += minutes;
                }
            }
        }

        let mut extractor = FeatureExtractor::new(config.features.clone(), start);
        for labelled in align_samples(session, samples) {
            acc.samples += 1;
            let features = extractor.push(&labelled.sample);
            if !features.has_variability() || !features.mean_diff.is_finite() {
                continue;
            }
            if labelled.actual.is_sleep() {
                acc.sleep_diffs.push(features.mean_diff);
            } else {
                acc.awake_diffs.push(features.mean_diff);
            }
        }

        acc
    }

    /// Combine two accumulators
    pub fn merge(mut self, other: Self) -> Self {
        for (bin, minutes) in other.awake_minutes {
            *self.awake_minutes.entry(bin).or_default() += minutes;
        }
        for (bin, minutes) in other.total_minutes {
            *self.total_minutes.entry(bin).or_default() += minutes;
        }
        for (row, other_row) in self.transitions.iter_mut().zip(other.transitions.iter()) {
            for (count, other_count) in row.iter_mut().zip(other_row.iter()) {
                *count += other_count;
            }
        }
        self.awake_diffs.extend(other.awake_diffs);
        self.sleep_diffs.extend(other.sleep_diffs);
        self.sessions += other.sessions;
        self.samples += other.samples;
        self
    }

    /// Turn accumulated statistics into parameters and a provenance report
    pub fn finish(
        mut self,
        config: &CalibrationConfig,
        sessions_skipped: usize,
    ) -> (LearnedParameters, CalibrationReport) {
        let mut bins = BTreeMap::new();
        for (bin, total) in &self.total_minutes {
            if *total > 0.0 {
                let awake = self.awake_minutes.get(bin).copied().unwrap_or(0.0);
                bins.insert(*bin, awake / total);
            }
        }
        let learned_bins: Vec<u32> = bins.keys().copied().collect();
        let fallback_bins: Vec<u32> = match (learned_bins.first(), learned_bins.last()) {
            (Some(first), Some(last)) => {
                (*first..=*last).filter(|b| !bins.contains_key(b)).collect()
            }
            _ => Vec::new(),
        };
        if learned_bins.is_empty() {
            tracing::warn!("no recorded time, awake prior falls back to the piecewise table");
        } else if !fallback_bins.is_empty() {
            tracing::info!(
                bins = ?fallback_bins,
                "empty awake prior bins resolve to nearest populated bin"
            );
        }

        let (transition_matrix, defaulted_rows) = TransitionMatrix::from_counts(&self.transitions);
        let transition_rows: Vec<TransitionRowReport> = Stage::ALL
            .iter()
            .map(|from| TransitionRowReport {
                from: *from,
                observations: self.transitions[from.index()].iter().sum(),
                source: source(!defaulted_rows[from.index()]),
            })
            .collect();
        for row in transition_rows.iter().filter(|r| r.source == ParameterSource::Defaulted) {
            tracing::info!(from = %row.from, "no observed transitions, row defaulted to uniform");
        }

        self.awake_diffs.sort_by(f64::total_cmp);
        self.sleep_diffs.sort_by(f64::total_cmp);

        let awake_mean = mean(&self.awake_diffs);
        let sleep_mean = mean(&self.sleep_diffs);

        let threshold = match (awake_mean, sleep_mean) {
            (Some(_), Some(sleep_mean)) => {
                let sleep_pct = percentile(&self.sleep_diffs, config.sleep_percentile);
                let awake_pct = percentile(&self.awake_diffs, config.awake_percentile);
                let floor =
                    sleep_mean + config.floor_std_multiplier * sample_std(&self.sleep_diffs);
                Some(((sleep_pct + awake_pct) / 2.0).max(floor))
            }
            _ => None,
        };
        if threshold.is_none() {
            tracing::warn!(
                awake = self.awake_diffs.len(),
                sleep = self.sleep_diffs.len(),
                default = config.default_threshold,
                "awake and sleep mean_diff both needed, threshold defaulted"
            );
        }

        let params = LearnedParameters {
            awake_prior: BinnedAwakePrior::new(config.bin_minutes, bins, config.empty_bin_prior),
            transition_matrix,
            mean_diff_threshold: threshold.unwrap_or(config.default_threshold),
            awake_mean_diff: awake_mean.unwrap_or(config.default_awake_mean_diff),
            sleep_mean_diff: sleep_mean.unwrap_or(config.default_sleep_mean_diff),
        };

        let report = CalibrationReport {
            sessions_used: self.sessions,
            sessions_skipped,
            samples: self.samples,
            awake_observations: self.awake_diffs.len(),
            sleep_observations: self.sleep_diffs.len(),
            threshold: source(threshold.is_some()),
            awake_mean_diff: source(awake_mean.is_some()),
            sleep_mean_diff: source(sleep_mean.is_some()),
            transition_rows,
            learned_bins,
            fallback_bins,
        };

        (params, report)
    }
}

/// Offline calibrator over labelled sessions
pub struct AdaptiveCalibrator {
    config: ClassifierConfig,
}

impl AdaptiveCalibrator {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    /// Learn parameters from labelled sessions.
    ///
    /// Sessions with fewer than `min_session_records` records are skipped.
    /// `samples` must be sorted by time.
    pub fn calibrate(
        &self,
        sessions: &[Session],
        samples: &[HeartRateSample],
    ) -> (LearnedParameters, CalibrationReport) {
        let min_records = self.config.min_session_records;
        let skipped = sessions.iter().filter(|s| s.len() < min_records).count();

        let acc = sessions
            .par_iter()
            .filter(|s| s.len() >= min_records)
            .map(|s| CalibrationAccumulator::observe_session(s, samples, &self.config))
            .reduce(CalibrationAccumulator::default, CalibrationAccumulator::merge);

        let (params, report) = acc.finish(&self.config.calibration, skipped);
        tracing::info!(
            sessions = report.sessions_used,
            skipped = report.sessions_skipped,
            samples = report.samples,
            threshold = params.mean_diff_threshold,
            fully_learned = report.is_fully_learned(),
            "calibration complete"
        );
        (params, report)
    }
}

fn source(learned: bool) -> ParameterSource {
    if learned {
        ParameterSource::Learned
    } else {
        ParameterSource::Defaulted
    }
}

/// Minutes of `[from, to)` falling in each bin
fn bin_overlaps(from: f64, to: f64, bin_minutes: f64) -> Vec<(u32, f64)> {
    let from = from.max(0.0);
    if !(to > from) {
        return Vec::new();
    }
    let first = (from / bin_minutes).floor() as u32;
    let last = (to / bin_minutes).ceil() as u32;
    (first..last)
        .filter_map(|bin| {
            let lo = f64::from(bin) * bin_minutes;
            let hi = lo + bin_minutes;
            let overlap = to.min(hi) - from.max(lo);
            (overlap > 0.0).then_some((bin, overlap))
        })
        .collect()
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Sample standard deviation; 1.0 for a single value
fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 1.0;
    }
    let m = values.iter().sum::<f64>() / values.len() as f64;
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

/// Element at `floor(len * p)` of sorted values
fn percentile(sorted: &[f64], p: f64) -> f64 {
    let idx = ((sorted.len() as f64 * p).floor() as usize).min(sorted.len().saturating_sub(1));
    sorted.get(idx).copied().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::priors::AwakePrior;
    use crate::session::SessionSegmenter;
    use crate::types::{SleepStage, StageRecord};
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 23, 0, 0).unwrap()
    }

    fn record(stage: SleepStage, start_min: i64, end_min: i64) -> StageRecord {
        StageRecord::new(
            stage,
            t0() + Duration::minutes(start_min),
            t0() + Duration::minutes(end_min),
        )
    }

    fn night() -> Vec<StageRecord> {
        vec![
            record(SleepStage::Awake, 0, 15),
            record(SleepStage::Light, 15, 45),
            record(SleepStage::Deep, 45, 80),
            record(SleepStage::Rem, 80, 95),
            record(SleepStage::Light, 95, 120),
            record(SleepStage::Awake, 120, 130),
        ]
    }

    /// One sample per minute; jumpy HR while awake, steady while asleep
    fn samples_for(records: &[StageRecord]) -> Vec<HeartRateSample> {
        let mut samples = Vec::new();
        for (i, r) in records.iter().enumerate() {
            let mut t = r.start_time;
            let mut k = 0u16;
            // skip the shared boundary instant of later records
            if i > 0 {
                t += Duration::seconds(30);
            }
            while t < r.end_time {
                let bpm = if r.stage == SleepStage::Awake {
                    70 + (k % 2) * 8
                } else {
                    58 + (k % 2)
                };
                samples.push(HeartRateSample::new(t, bpm));
                t += Duration::minutes(1);
                k += 1;
            }
        }
        samples
    }

    #[test]
    fn test_bin_overlaps() {
        assert_eq!(bin_overlaps(10.0, 70.0, 30.0), vec![(0, 20.0), (1, 30.0), (2, 10.0)]);
        assert_eq!(bin_overlaps(30.0, 60.0, 30.0), vec![(1, 30.0)]);
        assert!(bin_overlaps(40.0, 40.0, 30.0).is_empty());
    }

    #[test]
    fn test_percentile_and_std() {
        let sorted = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile(&sorted, 0.75), 4.0);
        assert_eq!(percentile(&sorted, 0.25), 2.0);
        assert_eq!(sample_std(&[5.0]), 1.0);
        assert!((sample_std(&[1.0, 3.0]) - 2.0_f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_calibrate_learns_all_parameters() {
        let records = night();
        let samples = samples_for(&records);
        let sessions = SessionSegmenter::default().segment(&records).unwrap();

        let (params, report) =
            AdaptiveCalibrator::new(ClassifierConfig::default()).calibrate(&sessions, &samples);

        assert_eq!(report.sessions_used, 1);
        assert_eq!(report.sessions_skipped, 0);
        assert_eq!(report.threshold, ParameterSource::Learned);
        assert!(report.awake_observations > 0 && report.sleep_observations > 0);
        assert_eq!(report.learned_bins, vec![0, 1, 2, 3, 4]);

        // bin 0: 15 awake minutes out of 30
        assert!((params.awake_prior.bins[&0] - 0.5).abs() < 1e-9);
        // bin 4 (120..130): all awake
        assert!((params.awake_prior.bins[&4] - 1.0).abs() < 1e-9);

        // awake HR jumps by 8, sleep HR by 1
        assert!(params.mean_diff_threshold > params.sleep_mean_diff);
        assert!(params.awake_mean_diff > params.sleep_mean_diff);

        assert!(params.transition_matrix.is_row_stochastic(1e-9));
        assert_eq!(params.transition_matrix.probability(Stage::Rem, Stage::Nrem), 1.0);
        assert_eq!(params.transition_matrix.probability(Stage::Awake, Stage::Nrem), 1.0);
    }

    #[test]
    fn test_short_sessions_are_skipped() {
        let records = vec![record(SleepStage::Light, 0, 30), record(SleepStage::Rem, 30, 40)];
        let samples = samples_for(&records);
        let sessions = SessionSegmenter::default().segment(&records).unwrap();

        let (params, report) =
            AdaptiveCalibrator::new(ClassifierConfig::default()).calibrate(&sessions, &samples);
        assert_eq!(report.sessions_used, 0);
        assert_eq!(report.sessions_skipped, 1);
        assert!(params.awake_prior.is_empty());
        assert_eq!(params.mean_diff_threshold, 3.0);
        assert_eq!(params.transition_matrix, TransitionMatrix::uniform());
        assert!(!report.is_fully_learned());
    }

    #[test]
    fn test_degenerate_data_defaults_threshold() {
        // no awake records at all
        let records = vec![
            record(SleepStage::Light, 0, 30),
            record(SleepStage::Deep, 30, 60),
            record(SleepStage::Light, 60, 90),
            record(SleepStage::Rem, 90, 100),
            record(SleepStage::Light, 100, 130),
        ];
        let samples = samples_for(&records);
        let sessions = SessionSegmenter::default().segment(&records).unwrap();

        let (params, report) =
            AdaptiveCalibrator::new(ClassifierConfig::default()).calibrate(&sessions, &samples);
        assert_eq!(report.threshold, ParameterSource::Defaulted);
        assert_eq!(report.awake_mean_diff, ParameterSource::Defaulted);
        assert_eq!(report.sleep_mean_diff, ParameterSource::Learned);
        assert_eq!(params.mean_diff_threshold, 3.0);
        assert_eq!(params.awake_mean_diff, 5.0);

        let awake_row = &report.transition_rows[Stage::Awake.index()];
        assert_eq!(awake_row.source, ParameterSource::Defaulted);
        assert_eq!(params.transition_matrix.row(Stage::Awake), [1.0 / 3.0; 3]);
    }

    #[test]
    fn test_merge_matches_single_pass() {
        let mut records = night();
        let second: Vec<StageRecord> = night()
            .into_iter()
            .map(|r| {
                StageRecord::new(
                    r.stage,
                    r.start_time + Duration::hours(24),
                    r.end_time + Duration::hours(24),
                )
            })
            .collect();
        records.extend(second);
        let samples = samples_for(&records);
        let config = ClassifierConfig::default();
        let sessions = SessionSegmenter::default().segment(&records).unwrap();
        assert_eq!(sessions.len(), 2);

        let a = CalibrationAccumulator::observe_session(&sessions[0], &samples, &config);
        let b = CalibrationAccumulator::observe_session(&sessions[1], &samples, &config);
        let ab = a.clone().merge(b.clone()).finish(&config.calibration, 0);
        let ba = b.merge(a).finish(&config.calibration, 0);
        assert_eq!(ab.0, ba.0);
        assert_eq!(ab.1.sessions_used, 2);
    }

    #[test]
    fn test_params_json_roundtrip_and_prior_model() {
        let config = ClassifierConfig::default();
        let defaults = LearnedParameters::default();
        assert!(matches!(defaults.awake_prior_model(&config), AwakePriorModel::Piecewise(_)));

        let json = defaults.to_json().unwrap();
        assert_eq!(LearnedParameters::from_json(&json).unwrap(), defaults);

        let bad = json.replace("0.89", "0.99");
        assert!(LearnedParameters::from_json(&bad).is_err());
    }

    #[test]
    fn test_empty_bins_use_piecewise_prior() {
        let config = ClassifierConfig::default();
        let prior = LearnedParameters::defaults(&config.calibration).awake_prior_model(&config);
        assert_eq!(prior.awake_prior(15.0), 0.35);
        assert_eq!(prior.awake_prior(45.0), 0.01);
        assert_eq!(prior.awake_prior(120.0), 0.10);
    }

    #[test]
    fn test_unpopulated_bin_uses_nearest_learned_bin() {
        let config = ClassifierConfig::default();
        let mut params = LearnedParameters::defaults(&config.calibration);
        params.awake_prior.bins.insert(2, 0.4);
        params.awake_prior.bins.insert(6, 0.2);

        let prior = params.awake_prior_model(&config);
        assert!(matches!(prior, AwakePriorModel::Learned(_)));
        // bin 1 and bin 4 resolve to bin 2 (bin 4 is a tie, the earlier bin wins)
        assert_eq!(prior.awake_prior(45.0), 0.4);
        assert_eq!(prior.awake_prior(125.0), 0.4);
        assert_eq!(prior.awake_prior(160.0), 0.2);
        assert_eq!(prior.awake_prior(600.0), 0.2);
    }
}
