//! Pipeline orchestration
//!
//! This module provides the public API for Synheart Hypnos. It runs the full
//! pipeline from a raw telemetry export to classifications, learned
//! parameters, or an evaluation report:
//! raw records → sanitize → segment → (calibrate / learn) → classify → evaluate.

use crate::calibrator::{AdaptiveCalibrator, CalibrationReport, LearnedParameters};
use crate::classifier::StageClassifier;
use crate::config::{ClassifierConfig, ScoringTerms};
use crate::error::ComputeError;
use crate::evaluation::{ConfusionMatrix, EvaluationMetrics};
use crate::features::{FeatureExtractor, SampleFeatures};
use crate::hmm::{EmissionReport, HmmDecoder};
use crate::schema::{RawRecordAdapter, SanitizeReport};
use crate::session::{align_samples, SessionSegmenter};
use crate::types::{Classification, HeartRateSample, Session, Stage, StageRecord};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Classify the heart-rate stream of a raw export.
///
/// # Arguments
/// * `raw_json` - Export document with `hrSamples` (stages are ignored)
/// * `config` - Classifier configuration
/// * `params` - Learned parameters, or `None` for defaults
///
/// # Example
/// ```ignore
/// let labels = classify_export(&export_json, &ClassifierConfig::default(), None)?;
/// ```
pub fn classify_export(
    raw_json: &str,
    config: &ClassifierConfig,
    params: Option<LearnedParameters>,
) -> Result<Vec<Classification>, ComputeError> {
    let input = RawRecordAdapter::load_export(raw_json)?;
    let classifier = match params {
        Some(params) => StageClassifier::with_parameters(config.clone(), params),
        None => StageClassifier::new(config.clone()),
    };
    Ok(classifier.classify_stream(&input.samples))
}

/// Learn parameters from a labelled raw export.
pub fn calibrate_export(
    raw_json: &str,
    config: &ClassifierConfig,
) -> Result<(LearnedParameters, CalibrationReport), ComputeError> {
    let input = RawRecordAdapter::load_export(raw_json)?;
    let sessions = SessionSegmenter::new(config.session_gap_hours).segment(&input.records)?;
    Ok(AdaptiveCalibrator::new(config.clone()).calibrate(&sessions, &input.samples))
}

/// Evaluate a classifier mode against the labels of a raw export.
///
/// # Example
/// ```ignore
/// let report = evaluate_export(&export_json, &config, EvaluationMode::Streaming, true)?;
/// println!("accuracy {:.3}", report.metrics.accuracy);
/// ```
pub fn evaluate_export(
    raw_json: &str,
    config: &ClassifierConfig,
    mode: EvaluationMode,
    learn: bool,
) -> Result<EvaluationReport, ComputeError> {
    let input = RawRecordAdapter::load_export(raw_json)?;
    let mut report = Evaluator::new(config.clone(), mode)
        .with_learning(learn)
        .evaluate(&input.records, &input.samples)?;
    report.input = Some(input.report);
    Ok(report)
}

/// Which classifier an evaluation runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationMode {
    /// Streaming decision machine (optionally smoothed)
    Streaming,
    /// Batch HMM / Viterbi decoding
    Hmm,
}

impl EvaluationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvaluationMode::Streaming => "streaming",
            EvaluationMode::Hmm => "hmm",
        }
    }
}

/// Outcome of one evaluated session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionResult {
    pub index: usize,
    pub start_time: DateTime<Utc>,
    pub samples: usize,
    pub confusion: ConfusionMatrix,
}

/// Aggregate evaluation report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub mode: EvaluationMode,
    pub terms: ScoringTerms,
    pub sessions_evaluated: usize,
    pub sessions_skipped: usize,
    pub samples: usize,
    pub confusion: ConfusionMatrix,
    pub metrics: EvaluationMetrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calibration: Option<CalibrationReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emissions: Option<EmissionReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<SanitizeReport>,
    pub sessions: Vec<SessionResult>,
}

/// A streaming configuration compared by [`Evaluator::compare`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub label: String,
    pub terms: ScoringTerms,
    /// Overrides the learned (or default) mean-diff threshold
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
}

impl Variant {
    pub fn new(label: impl Into<String>, terms: ScoringTerms) -> Self {
        Self {
            label: label.into(),
            terms,
            threshold: None,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    /// Baseline, each optional term on its own, and all terms together
    pub fn presets() -> Vec<Variant> {
        let only = |time_prior_blend, dynamic_threshold, transition_smoothing| ScoringTerms {
            time_prior_blend,
            dynamic_threshold,
            transition_smoothing,
        };
        vec![
            Variant::new("baseline", ScoringTerms::baseline()),
            Variant::new("time_prior_blend", only(true, false, false)),
            Variant::new("transition_smoothing", only(false, false, true)),
            Variant::new("dynamic_threshold", only(false, true, false)),
            Variant::new("full", ScoringTerms::full()),
        ]
    }

    /// Every preset at every threshold
    pub fn threshold_grid(thresholds: &[f64]) -> Vec<Variant> {
        Self::presets()
            .into_iter()
            .flat_map(|preset| {
                thresholds
                    .iter()
                    .map(move |t| preset.clone().with_threshold(*t))
            })
            .collect()
    }
}

/// Metrics of one variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonRow {
    pub variant: Variant,
    pub samples: usize,
    pub confusion: ConfusionMatrix,
    pub metrics: EvaluationMetrics,
}

/// Side-by-side evaluation of streaming variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonReport {
    pub sessions_evaluated: usize,
    pub sessions_skipped: usize,
    /// Aligned samples scored per variant
    pub samples: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calibration: Option<CalibrationReport>,
    pub rows: Vec<ComparisonRow>,
}

enum Model {
    Streaming(StageClassifier),
    Hmm(HmmDecoder),
}

/// Runs a classifier over labelled sessions and scores it
pub struct Evaluator {
    config: ClassifierConfig,
    mode: EvaluationMode,
    learn: bool,
}

impl Evaluator {
    pub fn new(config: ClassifierConfig, mode: EvaluationMode) -> Self {
        Self {
            config,
            mode,
            learn: true,
        }
    }

    /// Whether to learn parameters from the evaluated sessions first
    pub fn with_learning(mut self, learn: bool) -> Self {
        self.learn = learn;
        self
    }

    /// Segment, optionally learn, classify and score.
    ///
    /// Sessions with fewer than `min_session_records` records are skipped.
    /// `records` and `samples` must be sorted by time.
    pub fn evaluate(
        &self,
        records: &[StageRecord],
        samples: &[HeartRateSample],
    ) -> Result<EvaluationReport, ComputeError> {
        let sessions = SessionSegmenter::new(self.config.session_gap_hours).segment(records)?;
        let (eligible, skipped) = self.eligible_sessions(&sessions);

        let mut calibration = None;
        let mut emissions = None;
        let model = match self.mode {
            EvaluationMode::Streaming => {
                let classifier = if self.learn {
                    let (params, report) =
                        AdaptiveCalibrator::new(self.config.clone()).calibrate(&sessions, samples);
                    calibration = Some(report);
                    StageClassifier::with_parameters(self.config.clone(), params)
                } else {
                    StageClassifier::new(self.config.clone())
                };
                Model::Streaming(classifier)
            }
            EvaluationMode::Hmm => {
                let decoder = if self.learn {
                    let (decoder, report) = HmmDecoder::learn(&self.config, &sessions, samples);
                    emissions = Some(report);
                    decoder
                } else {
                    HmmDecoder::new(&self.config)
                };
                Model::Hmm(decoder)
            }
        };

        let results = self.score_sessions(&model, &eligible, samples);
        let (confusion, samples_total) = totals(&results);

        let report = EvaluationReport {
            mode: self.mode,
            terms: self.config.terms,
            sessions_evaluated: results.len(),
            sessions_skipped: skipped,
            samples: samples_total,
            metrics: confusion.metrics(),
            confusion,
            calibration,
            emissions,
            input: None,
            sessions: results,
        };

        tracing::info!(
            mode = self.mode.as_str(),
            sessions = report.sessions_evaluated,
            skipped = report.sessions_skipped,
            samples = report.samples,
            accuracy = report.metrics.accuracy,
            rem_f1 = report.metrics.rem_f1,
            "evaluation complete"
        );
        Ok(report)
    }

    /// Evaluate streaming variants side by side over the same sessions.
    ///
    /// Parameters are learned once (unless learning is off) and shared by
    /// every variant; a variant's `threshold` overrides the mean-diff
    /// threshold. The evaluator's mode is not used: variants are always
    /// streaming configurations.
    ///
    /// # Example
    /// ```ignore
    /// let variants = Variant::threshold_grid(&[2.5, 3.0, 3.5]);
    /// let report = Evaluator::new(config, EvaluationMode::Streaming)
    ///     .compare(&variants, &records, &samples)?;
    /// ```
    pub fn compare(
        &self,
        variants: &[Variant],
        records: &[StageRecord],
        samples: &[HeartRateSample],
    ) -> Result<ComparisonReport, ComputeError> {
        let sessions = SessionSegmenter::new(self.config.session_gap_hours).segment(records)?;
        let (eligible, skipped) = self.eligible_sessions(&sessions);

        let (params, calibration) = if self.learn {
            let (params, report) =
                AdaptiveCalibrator::new(self.config.clone()).calibrate(&sessions, samples);
            (params, Some(report))
        } else {
            (LearnedParameters::defaults(&self.config.calibration), None)
        };

        let rows: Vec<ComparisonRow> = variants
            .iter()
            .map(|variant| {
                let mut params = params.clone();
                if let Some(threshold) = variant.threshold {
                    params.mean_diff_threshold = threshold;
                }
                let config = self.config.clone().with_terms(variant.terms);
                let model = Model::Streaming(StageClassifier::with_parameters(config, params));
                let results = self.score_sessions(&model, &eligible, samples);
                let (confusion, samples_total) = totals(&results);
                tracing::debug!(
                    variant = %variant.label,
                    threshold = ?variant.threshold,
                    accuracy = confusion.metrics().accuracy,
                    "variant evaluated"
                );
                ComparisonRow {
                    variant: variant.clone(),
                    samples: samples_total,
                    metrics: confusion.metrics(),
                    confusion,
                }
            })
            .collect();

        tracing::info!(
            variants = rows.len(),
            sessions = eligible.len(),
            skipped,
            "comparison complete"
        );

        Ok(ComparisonReport {
            sessions_evaluated: eligible.len(),
            sessions_skipped: skipped,
            samples: rows.first().map(|r| r.samples).unwrap_or(0),
            calibration,
            rows,
        })
    }

    /// Sessions long enough to evaluate, and the number skipped
    fn eligible_sessions<'a>(&self, sessions: &'a [Session]) -> (Vec<&'a Session>, usize) {
        let (eligible, skipped): (Vec<&Session>, Vec<&Session>) = sessions
            .iter()
            .partition(|s| s.len() >= self.config.min_session_records);
        for session in &skipped {
            tracing::debug!(
                session = session.index(),
                records = session.len(),
                "session too short, skipped"
            );
        }
        (eligible, skipped.len())
    }

    fn score_sessions(
        &self,
        model: &Model,
        sessions: &[&Session],
        samples: &[HeartRateSample],
    ) -> Vec<SessionResult> {
        sessions
            .par_iter()
            .map(|session| self.evaluate_session(model, session, samples))
            .collect()
    }

    fn evaluate_session(
        &self,
        model: &Model,
        session: &Session,
        samples: &[HeartRateSample],
    ) -> SessionResult {
        let labelled = align_samples(session, samples);
        let actual: Vec<Stage> = labelled.iter().map(|l| l.actual).collect();

        let predicted: Vec<Stage> = match model {
            Model::Streaming(classifier) => {
                let mut state = classifier.start_session(session.start_time());
                labelled.iter().map(|l| state.push(&l.sample).predicted_stage).collect()
            }
            Model::Hmm(decoder) => {
                let mut extractor =
                    FeatureExtractor::new(self.config.features.clone(), session.start_time());
                let observations: Vec<SampleFeatures> =
                    labelled.iter().map(|l| extractor.push(&l.sample)).collect();
                decoder.decode(&observations)
            }
        };

        let mut confusion = ConfusionMatrix::new();
        for (a, p) in actual.iter().zip(predicted.iter()) {
            confusion.record(*a, *p);
        }
        tracing::debug!(
            session = session.index(),
            samples = labelled.len(),
            correct = confusion.correct(),
            "session evaluated"
        );

        SessionResult {
            index: session.index(),
            start_time: session.start_time(),
            samples: labelled.len(),
            confusion,
        }
    }
}

fn totals(results: &[SessionResult]) -> (ConfusionMatrix, usize) {
    let confusion = results
        .iter()
        .fold(ConfusionMatrix::new(), |acc, r| acc.merge(r.confusion));
    (confusion, results.iter().map(|r| r.samples).sum())
}
