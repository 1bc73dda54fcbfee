//! Stage decision state machine
//!
//! Consumes per-sample features and time priors and emits one of
//! Awake / NREM / REM per sample:
//!
//! 1. Awake gate: either a blend of the normalized HR-variability signal with
//!    the awake prior, or a debounced over-threshold counter.
//! 2. REM gate: only past sleep latency; `rem_score` mixes the ultradian
//!    propensity with a CV stability bonus and must be confirmed by a debounce.
//! 3. Optional transition smoothing of the raw label.
//! 4. Sticky REM: a REM episode persists while the hysteresis score (the REM
//!    score without the strong-CV bonus) stays above the hysteresis cutoff.
//!
//! The counters are explicit debounce automata rather than raw integers.

use crate::config::{
    AwakeGateConfig, ClassifierConfig, DynamicThresholdConfig, RemGateConfig, RemPropensityConfig,
};
use crate::features::SampleFeatures;
use crate::priors::{dynamic_awake_threshold, rem_propensity, AwakePrior, AwakePriorModel};
use crate::smoother::TransitionSmoother;
use crate::types::{DataQuality, Stage};
use serde::{Deserialize, Serialize};

/// State of a debounce automaton
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "count")]
pub enum DebounceState {
    /// No pending signal
    Idle,
    /// Consecutive signals seen so far, always below the requirement
    Accumulating(u32),
    /// Requirement reached; stays confirmed while signals continue
    Confirmed,
}

/// Confirms a signal only after `required` consecutive observations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Debounce {
    required: u32,
    state: DebounceState,
}

impl Debounce {
    pub fn new(required: u32) -> Self {
        Self {
            required: required.max(1),
            state: DebounceState::Idle,
        }
    }

    /// Feed one observation; returns whether the signal is confirmed
    pub fn observe(&mut self, signal: bool) -> bool {
        self.state = if !signal {
            DebounceState::Idle
        } else {
            let seen = match self.state {
                DebounceState::Idle => 1,
                DebounceState::Accumulating(n) => n + 1,
                DebounceState::Confirmed => self.required,
            };
            if seen >= self.required {
                DebounceState::Confirmed
            } else {
                DebounceState::Accumulating(seen)
            }
        };
        self.is_confirmed()
    }

    pub fn reset(&mut self) {
        self.state = DebounceState::Idle;
    }

    pub fn is_confirmed(&self) -> bool {
        self.state == DebounceState::Confirmed
    }

    pub fn state(&self) -> DebounceState {
        self.state
    }
}

/// How the awake threshold responds to the awake prior
#[derive(Debug, Clone, PartialEq)]
pub enum ThresholdPolicy {
    Fixed,
    PriorScaled(DynamicThresholdConfig),
}

impl ThresholdPolicy {
    pub fn threshold(&self, base: f64, prior: f64) -> f64 {
        match self {
            ThresholdPolicy::Fixed => base,
            ThresholdPolicy::PriorScaled(config) => dynamic_awake_threshold(base, prior, config),
        }
    }
}

/// Strategy used by the awake gate
#[derive(Debug, Clone, PartialEq)]
pub enum AwakeGate {
    /// `signal_weight * hr_signal + prior_weight * prior > score_cutoff`
    Blended,
    /// `mean_diff > threshold` confirmed over consecutive samples
    Consecutive(Debounce),
}

/// Output of one decision step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub stage: Stage,
    pub awake_score: f64,
    pub awake_prior: f64,
    pub awake_threshold: f64,
    pub rem_score: f64,
    /// Elapsed time has reached sleep latency
    pub rem_allowed: bool,
    /// The transition smoother vetoed the raw label
    pub smoothed: bool,
    pub data_quality: DataQuality,
}

/// Snapshot of the mutable classifier state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineState {
    pub awake: Option<DebounceState>,
    pub rem: DebounceState,
    pub previous: Stage,
}

/// Per-session decision state machine
#[derive(Debug, Clone)]
pub struct StageDecisionMachine {
    awake_config: AwakeGateConfig,
    rem_config: RemGateConfig,
    propensity: RemPropensityConfig,
    prior: AwakePriorModel,
    base_threshold: f64,
    threshold_policy: ThresholdPolicy,
    awake_gate: AwakeGate,
    rem_debounce: Debounce,
    smoother: Option<TransitionSmoother>,
    previous: Stage,
}

impl StageDecisionMachine {
    /// Build a machine for one session.
    ///
    /// `base_threshold` is the mean-diff threshold, learned or default.
    pub fn new(config: &ClassifierConfig, prior: AwakePriorModel, base_threshold: f64) -> Self {
        let threshold_policy = if config.terms.dynamic_threshold {
            ThresholdPolicy::PriorScaled(config.awake_gate.dynamic.clone())
        } else {
            ThresholdPolicy::Fixed
        };
        let awake_gate = if config.terms.time_prior_blend {
            AwakeGate::Blended
        } else {
            AwakeGate::Consecutive(Debounce::new(config.awake_gate.debounce_count))
        };
        Self {
            awake_config: config.awake_gate.clone(),
            rem_config: config.rem_gate.clone(),
            propensity: config.rem_propensity.clone(),
            prior,
            base_threshold,
            threshold_policy,
            awake_gate,
            rem_debounce: Debounce::new(config.rem_gate.debounce_count),
            smoother: None,
            previous: Stage::Nrem,
        }
    }

    /// Veto improbable transitions with `smoother`
    pub fn with_smoother(mut self, smoother: TransitionSmoother) -> Self {
        self.smoother = Some(smoother);
        self
    }

    pub fn previous(&self) -> Stage {
        self.previous
    }

    pub fn state(&self) -> MachineState {
        MachineState {
            awake: match &self.awake_gate {
                AwakeGate::Blended => None,
                AwakeGate::Consecutive(debounce) => Some(debounce.state()),
            },
            rem: self.rem_debounce.state(),
            previous: self.previous,
        }
    }

    /// Sleep latency in minutes
    pub fn sleep_latency(&self) -> f64 {
        self.propensity.sleep_latency_minutes
    }

    /// REM score for the given elapsed time and CV (zero before latency)
    pub fn rem_score(&self, minutes: f64, cv: f64) -> f64 {
        self.score(minutes, cv, true)
    }

    /// Score held against the hysteresis cutoff: the REM score without the
    /// strong-CV bonus
    pub fn hysteresis_score(&self, minutes: f64, cv: f64) -> f64 {
        self.score(minutes, cv, false)
    }

    fn score(&self, minutes: f64, cv: f64, strong_bonus: bool) -> f64 {
        if !(minutes >= self.propensity.sleep_latency_minutes) {
            return 0.0;
        }
        let config = &self.rem_config;
        let mut score = config.propensity_weight * rem_propensity(minutes, &self.propensity);
        if cv < config.cv_threshold {
            score += config.cv_bonus;
        }
        if strong_bonus && cv < config.cv_threshold * config.strong_cv_fraction {
            score += config.strong_cv_bonus;
        }
        score
    }

    /// Classify one sample and record the emitted label.
    ///
    /// Order: gates produce a raw label, the smoother (if any) may veto it,
    /// then sticky-REM hysteresis applies against the previous label.
    pub fn step(&mut self, features: &SampleFeatures) -> Decision {
        let mut decision = if features.is_finite() {
            self.evaluate(features)
        } else {
            self.fallback(features)
        };

        if decision.data_quality == DataQuality::Ok {
            if let Some(smoother) = &self.smoother {
                let smoothed = smoother.smooth_constrained(
                    self.previous,
                    decision.stage,
                    decision.rem_allowed,
                );
                decision.stage = smoothed.stage;
                decision.smoothed = smoothed.vetoed;
            }
            if decision.rem_allowed
                && decision.stage == Stage::Nrem
                && self.previous == Stage::Rem
                && self.hysteresis_score(features.elapsed_minutes, features.cv)
                    > self.rem_config.hysteresis_cutoff
            {
                decision.stage = Stage::Rem;
            }
        }

        self.previous = decision.stage;
        decision
    }

    /// Raw gate output; advances the debounce automata
    fn evaluate(&mut self, features: &SampleFeatures) -> Decision {
        let minutes = features.elapsed_minutes;
        let rem_allowed = minutes >= self.propensity.sleep_latency_minutes;
        let awake_prior = self.prior.awake_prior(minutes);
        let awake_threshold = self.threshold_policy.threshold(self.base_threshold, awake_prior);

        let hr_signal = ((features.mean_diff - awake_threshold + self.awake_config.signal_offset)
            / self.awake_config.signal_span)
            .clamp(0.0, 1.0);

        let (awake, awake_score) = match &mut self.awake_gate {
            AwakeGate::Blended => {
                let score = self.awake_config.signal_weight * hr_signal
                    + self.awake_config.prior_weight * awake_prior;
                (score > self.awake_config.score_cutoff, score)
            }
            AwakeGate::Consecutive(debounce) => {
                (debounce.observe(features.mean_diff > awake_threshold), hr_signal)
            }
        };

        let rem_score = self.rem_score(minutes, features.cv);

        let stage = if awake {
            self.rem_debounce.reset();
            Stage::Awake
        } else if !rem_allowed {
            self.rem_debounce.reset();
            Stage::Nrem
        } else if self.rem_debounce.observe(rem_score > self.rem_config.score_cutoff) {
            Stage::Rem
        } else {
            Stage::Nrem
        };

        Decision {
            stage,
            awake_score,
            awake_prior,
            awake_threshold,
            rem_score,
            rem_allowed,
            smoothed: false,
            data_quality: DataQuality::Ok,
        }
    }

    fn fallback(&self, features: &SampleFeatures) -> Decision {
        tracing::warn!(
            rmssd = features.rmssd,
            cv = features.cv,
            mean_diff = features.mean_diff,
            elapsed_minutes = features.elapsed_minutes,
            previous = %self.previous,
            "non-finite features, carrying previous label"
        );
        let rem_allowed = features.elapsed_minutes >= self.propensity.sleep_latency_minutes;
        let stage = if self.previous == Stage::Rem && !rem_allowed {
            Stage::Nrem
        } else {
            self.previous
        };
        Decision {
            stage,
            awake_score: 0.0,
            awake_prior: 0.0,
            awake_threshold: self.base_threshold,
            rem_score: 0.0,
            rem_allowed,
            smoothed: false,
            data_quality: DataQuality::NonFiniteFeature,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScoringTerms;
    use crate::smoother::TransitionMatrix;
    use proptest::prelude::*;

    fn machine(config: &ClassifierConfig) -> StageDecisionMachine {
        StageDecisionMachine::new(
            config,
            AwakePriorModel::Piecewise(config.awake_prior.clone()),
            config.calibration.default_threshold,
        )
    }

    fn features(minutes: f64, cv: f64, mean_diff: f64) -> SampleFeatures {
        SampleFeatures {
            rmssd: 1.0,
            cv,
            mean_diff,
            elapsed_minutes: minutes,
            recent_hr: vec![58.0, 58.0],
        }
    }

    #[test]
    fn test_debounce_automaton() {
        let mut debounce = Debounce::new(2);
        assert!(!debounce.observe(true));
        assert_eq!(debounce.state(), DebounceState::Accumulating(1));
        assert!(debounce.observe(true));
        assert!(debounce.observe(true));
        assert!(!debounce.observe(false));
        assert_eq!(debounce.state(), DebounceState::Idle);

        let mut single = Debounce::new(1);
        assert!(single.observe(true));
    }

    #[test]
    fn test_initial_state_is_nrem() {
        let m = machine(&ClassifierConfig::default());
        assert_eq!(m.previous(), Stage::Nrem);
        assert_eq!(m.state().rem, DebounceState::Idle);
    }

    #[test]
    fn test_rem_confirmed_on_second_qualifying_sample() {
        let mut m = machine(&ClassifierConfig::default());
        // cv 0.1 -> both bonuses, plus propensity at minute 75
        assert!(m.rem_score(75.0, 0.1) > 0.25);
        assert_eq!(m.step(&features(75.0, 0.1, 0.0)).stage, Stage::Nrem);
        assert_eq!(m.step(&features(80.0, 0.1, 0.0)).stage, Stage::Rem);
    }

    #[test]
    fn test_rem_forced_off_before_latency() {
        let mut m = machine(&ClassifierConfig::default());
        for minute in [40.0, 45.0, 50.0, 55.0] {
            let decision = m.step(&features(minute, 0.01, 0.0));
            assert_eq!(decision.stage, Stage::Nrem);
            assert_eq!(decision.rem_score, 0.0);
            assert!(!decision.rem_allowed);
        }
    }

    #[test]
    fn test_hysteresis_keeps_rem() {
        let mut m = machine(&ClassifierConfig::default());
        m.step(&features(160.0, 0.1, 0.0));
        assert_eq!(m.step(&features(165.0, 0.1, 0.0)).stage, Stage::Rem);

        // score 0.18: below the REM cutoff, above the hysteresis cutoff
        let sticky = m.step(&features(170.0, 0.5, 0.0));
        assert!((sticky.rem_score - 0.18).abs() < 1e-9);
        assert_eq!(sticky.stage, Stage::Rem);

        // early in the next cycle the score collapses
        assert_eq!(m.step(&features(185.0, 0.5, 0.0)).stage, Stage::Nrem);
    }

    #[test]
    fn test_hysteresis_ignores_strong_cv_bonus() {
        let mut config = ClassifierConfig::default();
        config.rem_gate.cv_bonus = 0.0;
        config.rem_gate.strong_cv_bonus = 0.3;
        config.rem_gate.score_cutoff = 0.4;
        let mut m = machine(&config);
        m.step(&features(160.0, 0.1, 0.0));
        assert_eq!(m.step(&features(165.0, 0.1, 0.0)).stage, Stage::Rem);

        // early in cycle 2: 0.039 propensity plus the strong bonus gives 0.339,
        // below the REM cutoff; without the strong bonus it is below 0.15 too
        let next = m.step(&features(185.0, 0.1, 0.0));
        assert!((next.rem_score - 0.339).abs() < 1e-9);
        assert!((m.hysteresis_score(185.0, 0.1) - 0.039).abs() < 1e-9);
        assert_eq!(next.stage, Stage::Nrem);
    }

    #[test]
    fn test_blended_awake_gate() {
        let mut m = machine(&ClassifierConfig::default());
        // prior 0.33 at minute 75 -> threshold 2.55; mean_diff 6 saturates the signal
        let decision = m.step(&features(75.0, 0.5, 6.0));
        assert_eq!(decision.stage, Stage::Awake);
        assert!((decision.awake_threshold - 2.55).abs() < 1e-9);
        assert!((decision.awake_score - (0.7 + 0.3 * 0.33)).abs() < 1e-9);

        // prior alone never clears the cutoff
        assert_eq!(m.step(&features(80.0, 0.5, 0.0)).stage, Stage::Nrem);
    }

    #[test]
    fn test_awake_resets_rem_debounce() {
        let mut m = machine(&ClassifierConfig::default());
        m.step(&features(75.0, 0.1, 0.0));
        assert_eq!(m.state().rem, DebounceState::Accumulating(1));
        assert_eq!(m.step(&features(80.0, 0.1, 8.0)).stage, Stage::Awake);
        assert_eq!(m.state().rem, DebounceState::Idle);
        assert_eq!(m.step(&features(85.0, 0.1, 0.0)).stage, Stage::Nrem);
    }

    #[test]
    fn test_hysteresis_does_not_override_awake() {
        let mut m = machine(&ClassifierConfig::default());
        m.step(&features(160.0, 0.1, 0.0));
        assert_eq!(m.step(&features(165.0, 0.1, 0.0)).stage, Stage::Rem);
        assert_eq!(m.step(&features(170.0, 0.1, 9.0)).stage, Stage::Awake);
    }

    #[test]
    fn test_consecutive_awake_gate() {
        let mut config = ClassifierConfig::default().with_terms(ScoringTerms::baseline());
        config.awake_gate.debounce_count = 2;
        let mut m = machine(&config);
        assert_eq!(m.state().awake, Some(DebounceState::Idle));

        assert_eq!(m.step(&features(10.0, 0.5, 4.0)).stage, Stage::Nrem);
        assert_eq!(m.step(&features(15.0, 0.5, 4.0)).stage, Stage::Awake);
        // fixed threshold: mean_diff equal to the threshold is not a signal
        assert_eq!(m.step(&features(20.0, 0.5, 3.0)).stage, Stage::Nrem);
    }

    #[test]
    fn test_non_finite_features_carry_previous_label() {
        let mut m = machine(&ClassifierConfig::default());
        m.step(&features(160.0, 0.1, 0.0));
        m.step(&features(165.0, 0.1, 0.0));
        let decision = m.step(&features(170.0, f64::NAN, 0.0));
        assert_eq!(decision.stage, Stage::Rem);
        assert_eq!(decision.data_quality, DataQuality::NonFiniteFeature);
    }

    #[test]
    fn test_hysteresis_survives_smoothing() {
        let config = ClassifierConfig::default();
        let mut m = machine(&config).with_smoother(TransitionSmoother::new(
            TransitionMatrix::default(),
            &config.smoother,
        ));
        m.step(&features(160.0, 0.1, 0.0));
        assert_eq!(m.step(&features(165.0, 0.1, 0.0)).stage, Stage::Rem);

        // REM -> REM has probability 0 and is vetoed, then hysteresis restores it
        let next = m.step(&features(170.0, 0.1, 0.0));
        assert!(next.smoothed);
        assert_eq!(next.stage, Stage::Rem);
    }

    #[test]
    fn test_smoother_vetoes_awake_to_awake() {
        let config = ClassifierConfig::default();
        let mut m = machine(&config).with_smoother(TransitionSmoother::new(
            TransitionMatrix::default(),
            &config.smoother,
        ));
        assert_eq!(m.step(&features(75.0, 0.5, 8.0)).stage, Stage::Awake);
        let second = m.step(&features(80.0, 0.5, 8.0));
        assert!(second.smoothed);
        assert_eq!(second.stage, Stage::Nrem);
    }

    proptest! {
        #[test]
        fn prop_no_rem_before_latency(
            steps in proptest::collection::vec((0.0f64..70.0, 0.0f64..2.0, 0.0f64..10.0), 1..40),
            cutoff in -1.0f64..1.0,
            hysteresis in -1.0f64..1.0,
            debounce in 1u32..4,
            blend in any::<bool>(),
            smoothing in any::<bool>(),
        ) {
            let mut config = ClassifierConfig::default();
            config.terms.time_prior_blend = blend;
            config.rem_gate.score_cutoff = cutoff;
            config.rem_gate.hysteresis_cutoff = hysteresis;
            config.rem_gate.debounce_count = debounce;
            let mut m = machine(&config);
            if smoothing {
                m = m.with_smoother(TransitionSmoother::new(
                    TransitionMatrix::uniform(),
                    &config.smoother,
                ));
            }

            let mut minutes: Vec<f64> = steps.iter().map(|s| s.0).collect();
            minutes.sort_by(f64::total_cmp);
            for (minute, (_, cv, mean_diff)) in minutes.iter().zip(steps.iter()) {
                let decision = m.step(&features(*minute, *cv, *mean_diff));
                prop_assert_ne!(decision.stage, Stage::Rem);
            }
        }
    }
}
