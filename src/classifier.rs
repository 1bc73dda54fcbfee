//! Streaming stage classifier
//!
//! `StageClassifier` holds the immutable configuration and learned
//! parameters; `SessionClassifier` is the per-session state (feature buffers,
//! debounce automata, previous label) created fresh for every session.

use crate::calibrator::LearnedParameters;
use crate::config::ClassifierConfig;
use crate::decision::{MachineState, StageDecisionMachine};
use crate::features::FeatureExtractor;
use crate::session::{SampleSession, SessionSegmenter};
use crate::smoother::TransitionSmoother;
use crate::types::{Classification, Diagnostics, HeartRateSample};
use chrono::{DateTime, Utc};
use rayon::prelude::*;

/// Factory for per-session classifiers
#[derive(Debug, Clone)]
pub struct StageClassifier {
    config: ClassifierConfig,
    params: LearnedParameters,
}

impl StageClassifier {
    /// Classifier with default (unlearned) parameters
    pub fn new(config: ClassifierConfig) -> Self {
        let params = LearnedParameters::defaults(&config.calibration);
        Self { config, params }
    }

    pub fn with_parameters(config: ClassifierConfig, params: LearnedParameters) -> Self {
        Self { config, params }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    pub fn parameters(&self) -> &LearnedParameters {
        &self.params
    }

    /// Fresh state for a session starting at `start`
    pub fn start_session(&self, start: DateTime<Utc>) -> SessionClassifier {
        let mut machine = StageDecisionMachine::new(
            &self.config,
            self.params.awake_prior_model(&self.config),
            self.params.mean_diff_threshold,
        );
        if self.config.terms.transition_smoothing {
            machine = machine.with_smoother(TransitionSmoother::new(
                self.params.transition_matrix,
                &self.config.smoother,
            ));
        }
        SessionClassifier {
            extractor: FeatureExtractor::new(self.config.features.clone(), start),
            machine,
        }
    }

    /// Classify one session's samples in order
    pub fn classify_session(
        &self,
        start: DateTime<Utc>,
        samples: &[HeartRateSample],
    ) -> Vec<Classification> {
        let mut session = self.start_session(start);
        samples.iter().map(|s| session.push(s)).collect()
    }

    /// Classify an unlabelled, sorted heart-rate stream.
    ///
    /// The stream is split into sessions at long gaps; sessions are classified
    /// in parallel and the output keeps input order.
    pub fn classify_stream(&self, samples: &[HeartRateSample]) -> Vec<Classification> {
        let sessions =
            SessionSegmenter::new(self.config.session_gap_hours).segment_samples(samples);
        tracing::debug!(sessions = sessions.len(), samples = samples.len(), "classifying stream");
        sessions
            .par_iter()
            .map(|s: &SampleSession| self.classify_session(s.start_time, &s.samples))
            .collect::<Vec<_>>()
            .into_iter()
            .flatten()
            .collect()
    }
}

/// Mutable state of one streaming pass
#[derive(Debug, Clone)]
pub struct SessionClassifier {
    extractor: FeatureExtractor,
    machine: StageDecisionMachine,
}

impl SessionClassifier {
    /// Classify the next sample of the session
    pub fn push(&mut self, sample: &HeartRateSample) -> Classification {
        let features = self.extractor.push(sample);
        let decision = self.machine.step(&features);
        Classification {
            timestamp: sample.timestamp,
            predicted_stage: decision.stage,
            diagnostics: Diagnostics {
                rmssd: features.rmssd,
                cv: features.cv,
                mean_diff: features.mean_diff,
                awake_score: decision.awake_score,
                rem_score: decision.rem_score,
                elapsed_minutes: features.elapsed_minutes,
                smoothed: decision.smoothed,
                data_quality: decision.data_quality,
            },
        }
    }

    pub fn state(&self) -> MachineState {
        self.machine.state()
    }

    pub fn session_start(&self) -> DateTime<Utc> {
        self.extractor.session_start()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScoringTerms;
    use crate::types::Stage;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 23, 0, 0).unwrap()
    }

    fn steady(count: i64, every_minutes: i64, bpm: u16) -> Vec<HeartRateSample> {
        (0..count)
            .map(|i| HeartRateSample::new(t0() + Duration::minutes(i * every_minutes), bpm))
            .collect()
    }

    #[test]
    fn test_eight_identical_samples() {
        let classifier = StageClassifier::new(ClassifierConfig::default());
        let out = classifier.classify_session(t0(), &steady(8, 5, 58));

        assert_eq!(out.len(), 8);
        assert_eq!(out[0].diagnostics.rmssd, 10.0);
        assert!(out[1..].iter().all(|c| c.diagnostics.rmssd == 0.0));
        assert!(out[..2].iter().all(|c| c.diagnostics.cv == 0.5));
        // the sentinel keeps the history mean above zero, so CV never reaches the REM bonus
        assert!(out[2..].iter().all(|c| c.diagnostics.cv >= 0.20));
        assert!(out.iter().all(|c| c.predicted_stage == Stage::Nrem));
        assert_eq!(out[7].diagnostics.elapsed_minutes, 35.0);
    }

    #[test]
    fn test_steady_night_past_latency_stays_nrem() {
        // every 5 min for 3h: propensity alone never clears the REM cutoff
        let classifier = StageClassifier::new(ClassifierConfig::default());
        let out = classifier.classify_session(t0(), &steady(36, 5, 58));
        assert!(out.iter().all(|c| c.predicted_stage == Stage::Nrem));
        assert!(out
            .iter()
            .filter(|c| c.diagnostics.elapsed_minutes < 70.0)
            .all(|c| c.diagnostics.rem_score == 0.0));
    }

    #[test]
    fn test_sessions_do_not_share_state() {
        let classifier = StageClassifier::new(ClassifierConfig::default());
        let mut samples = steady(10, 5, 58);
        let later = t0() + Duration::hours(12);
        samples.push(HeartRateSample::new(later, 90));
        samples.push(HeartRateSample::new(later + Duration::minutes(5), 58));

        let out = classifier.classify_stream(&samples);
        assert_eq!(out.len(), 12);
        // the 11th sample starts a fresh session
        assert_eq!(out[10].diagnostics.elapsed_minutes, 0.0);
        assert_eq!(out[10].diagnostics.rmssd, 10.0);
        assert_eq!(out[11].diagnostics.mean_diff, 32.0);
    }

    #[test]
    fn test_new_session_state_is_initial() {
        let classifier =
            StageClassifier::new(ClassifierConfig::default().with_terms(ScoringTerms::baseline()));
        let session = classifier.start_session(t0());
        let state = session.state();
        assert_eq!(state.previous, Stage::Nrem);
        assert_eq!(session.session_start(), t0());
    }

    proptest! {
        #[test]
        fn prop_no_rem_before_latency_end_to_end(
            bpms in proptest::collection::vec(40u16..160, 1..60),
            gaps in proptest::collection::vec(1i64..6, 60),
            blend in any::<bool>(),
            dynamic in any::<bool>(),
            smoothing in any::<bool>(),
            cutoff in 0.0f64..0.5,
            latency in 10.0f64..120.0,
        ) {
            let mut config = ClassifierConfig::default().with_terms(ScoringTerms {
                time_prior_blend: blend,
                dynamic_threshold: dynamic,
                transition_smoothing: smoothing,
            });
            config.rem_gate.score_cutoff = cutoff;
            config.rem_gate.debounce_count = 1;
            config.rem_propensity.sleep_latency_minutes = latency;

            let mut t = t0();
            let samples: Vec<HeartRateSample> = bpms
                .iter()
                .zip(gaps.iter())
                .map(|(bpm, gap)| {
                    t += Duration::minutes(*gap);
                    HeartRateSample::new(t, *bpm)
                })
                .collect();

            let out = StageClassifier::new(config).classify_session(t0(), &samples);
            for c in out {
                if c.diagnostics.elapsed_minutes < latency {
                    prop_assert_ne!(c.predicted_stage, Stage::Rem);
                }
            }
        }
    }
}
