//! Classifier configuration
//!
//! Every tunable of the pipeline lives here as an immutable value that is
//! passed into constructors. Defaults reproduce the values found by analysing
//! a year of single-user Fitbit / Health Connect exports.
//!
//! All structs deserialize with `#[serde(default)]`, so a JSON file only
//! needs to carry the fields it overrides.

use crate::error::ComputeError;
use crate::smoother::TransitionMatrix;
use serde::{Deserialize, Serialize};

/// Default gap (hours) that splits two sessions
pub const DEFAULT_SESSION_GAP_HOURS: f64 = 4.0;

/// Sessions with fewer records are skipped for training and evaluation
pub const DEFAULT_MIN_SESSION_RECORDS: usize = 5;

/// Default minimum sleep latency before REM is plausible (minutes)
pub const DEFAULT_SLEEP_LATENCY_MINUTES: f64 = 70.0;

/// Default ultradian cycle length (minutes)
pub const DEFAULT_CYCLE_MINUTES: f64 = 90.0;

/// Which optional scoring terms are active.
///
/// This is the single switch that replaces the baseline / option A / B / C /
/// combined classifier forks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringTerms {
    /// Blend the HR-variability signal with the time-based awake prior
    /// (otherwise a consecutive-signal counter decides)
    pub time_prior_blend: bool,
    /// Scale the awake threshold by the time-based awake prior
    pub dynamic_threshold: bool,
    /// Veto improbable transitions with the transition matrix
    pub transition_smoothing: bool,
}

impl Default for ScoringTerms {
    fn default() -> Self {
        Self::full()
    }
}

impl ScoringTerms {
    /// Fixed threshold, counter-based awake gate, no smoothing
    pub fn baseline() -> Self {
        Self {
            time_prior_blend: false,
            dynamic_threshold: false,
            transition_smoothing: false,
        }
    }

    /// All terms active
    pub fn full() -> Self {
        Self {
            time_prior_blend: true,
            dynamic_threshold: true,
            transition_smoothing: true,
        }
    }
}

/// Streaming feature extraction parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Capacity of the recent heart-rate buffer
    pub hr_buffer_capacity: usize,
    /// Capacity of the RMSSD history buffer
    pub rmssd_history_capacity: usize,
    /// Number of most recent successive differences averaged into mean_diff
    pub mean_diff_window: usize,
    /// RMSSD reported while fewer than two heart-rate values are buffered
    pub rmssd_sentinel: f64,
    /// CV reported while the history is too short or its mean too small
    pub cv_default: f64,
    /// Minimum RMSSD history length before CV is computed
    pub cv_min_history: usize,
    /// Minimum RMSSD history mean before CV is computed
    pub cv_min_mean: f64,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            hr_buffer_capacity: 20,
            rmssd_history_capacity: 10,
            mean_diff_window: 10,
            rmssd_sentinel: 10.0,
            cv_default: 0.5,
            cv_min_history: 3,
            cv_min_mean: 0.1,
        }
    }
}

/// One step of the piecewise awake prior: applies while `minutes < until_minutes`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriorStep {
    pub until_minutes: f64,
    pub prior: f64,
}

/// Piecewise awake prior over elapsed session minutes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AwakePriorConfig {
    /// Steps in ascending `until_minutes` order
    pub steps: Vec<PriorStep>,
    /// Prior at the start of the tail (after the last step)
    pub tail_base: f64,
    /// Tail growth per minute past the last step
    pub tail_slope_per_minute: f64,
    /// Upper bound of the tail
    pub tail_cap: f64,
}

impl Default for AwakePriorConfig {
    fn default() -> Self {
        Self {
            steps: vec![
                PriorStep { until_minutes: 30.0, prior: 0.35 },
                PriorStep { until_minutes: 60.0, prior: 0.01 },
                PriorStep { until_minutes: 90.0, prior: 0.33 },
                PriorStep { until_minutes: 330.0, prior: 0.10 },
                PriorStep { until_minutes: 360.0, prior: 0.30 },
            ],
            tail_base: 0.30,
            tail_slope_per_minute: 0.003,
            tail_cap: 0.65,
        }
    }
}

/// Ultradian REM propensity parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemPropensityConfig {
    pub sleep_latency_minutes: f64,
    pub cycle_minutes: f64,
    /// Baseline propensity in cycle 0
    pub base: f64,
    /// Baseline growth per completed cycle
    pub growth_per_cycle: f64,
    /// Baseline cap
    pub cap: f64,
    /// Fraction of a cycle after which the late (REM-rich) phase begins
    pub late_phase_start: f64,
    pub late_multiplier: f64,
    pub early_multiplier: f64,
}

impl Default for RemPropensityConfig {
    fn default() -> Self {
        Self {
            sleep_latency_minutes: DEFAULT_SLEEP_LATENCY_MINUTES,
            cycle_minutes: DEFAULT_CYCLE_MINUTES,
            base: 0.10,
            growth_per_cycle: 0.08,
            cap: 0.35,
            late_phase_start: 0.65,
            late_multiplier: 2.0,
            early_multiplier: 0.3,
        }
    }
}

/// Prior-driven scaling of the awake threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicThresholdConfig {
    /// Priors strictly above this lower the threshold
    pub high_prior_cut: f64,
    /// Priors strictly below this raise the threshold
    pub low_prior_cut: f64,
    pub high_prior_multiplier: f64,
    pub low_prior_multiplier: f64,
}

impl Default for DynamicThresholdConfig {
    fn default() -> Self {
        Self {
            high_prior_cut: 0.25,
            low_prior_cut: 0.05,
            high_prior_multiplier: 0.85,
            low_prior_multiplier: 1.3,
        }
    }
}

/// Awake gate parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AwakeGateConfig {
    /// Weight of the normalized HR-variability signal in the blended score
    pub signal_weight: f64,
    /// Weight of the awake prior in the blended score
    pub prior_weight: f64,
    /// Blended score must exceed this to emit Awake
    pub score_cutoff: f64,
    /// Signal = clamp((mean_diff - threshold + offset) / span, 0, 1)
    pub signal_offset: f64,
    pub signal_span: f64,
    /// Consecutive over-threshold samples required in counter mode
    pub debounce_count: u32,
    pub dynamic: DynamicThresholdConfig,
}

impl Default for AwakeGateConfig {
    fn default() -> Self {
        Self {
            signal_weight: 0.7,
            prior_weight: 0.3,
            score_cutoff: 0.4,
            signal_offset: 1.5,
            signal_span: 3.0,
            debounce_count: 1,
            dynamic: DynamicThresholdConfig::default(),
        }
    }
}

/// REM gate parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemGateConfig {
    /// Weight of the ultradian propensity in rem_score
    pub propensity_weight: f64,
    /// CV below this contributes `cv_bonus`
    pub cv_threshold: f64,
    pub cv_bonus: f64,
    /// CV below `cv_threshold * strong_cv_fraction` adds `strong_cv_bonus`
    pub strong_cv_fraction: f64,
    pub strong_cv_bonus: f64,
    /// rem_score must exceed this to count as a REM signal
    pub score_cutoff: f64,
    /// A REM episode persists while rem_score exceeds this
    pub hysteresis_cutoff: f64,
    /// Consecutive REM signals required before REM is emitted
    pub debounce_count: u32,
}

impl Default for RemGateConfig {
    fn default() -> Self {
        Self {
            propensity_weight: 0.5,
            cv_threshold: 0.20,
            cv_bonus: 0.25,
            strong_cv_fraction: 0.7,
            strong_cv_bonus: 0.15,
            score_cutoff: 0.25,
            hysteresis_cutoff: 0.15,
            debounce_count: 2,
        }
    }
}

/// Transition smoother parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmootherConfig {
    /// Transitions with probability strictly below this are vetoed
    pub probability_floor: f64,
}

impl Default for SmootherConfig {
    fn default() -> Self {
        Self {
            probability_floor: 0.12,
        }
    }
}

/// Offline calibration parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Width of awake-prior time bins (minutes)
    pub bin_minutes: f64,
    /// Prior used when no bin at all is populated
    pub empty_bin_prior: f64,
    /// Percentile of the sleep mean_diff distribution
    pub sleep_percentile: f64,
    /// Percentile of the awake mean_diff distribution
    pub awake_percentile: f64,
    /// Threshold floor = sleep_mean + multiplier * sleep_std
    pub floor_std_multiplier: f64,
    pub default_threshold: f64,
    pub default_awake_mean_diff: f64,
    pub default_sleep_mean_diff: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            bin_minutes: 30.0,
            empty_bin_prior: 0.1,
            sleep_percentile: 0.75,
            awake_percentile: 0.25,
            floor_std_multiplier: 1.0,
            default_threshold: 3.0,
            default_awake_mean_diff: 5.0,
            default_sleep_mean_diff: 1.5,
        }
    }
}

/// Gaussian parameters of one feature
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Gaussian {
    pub mean: f64,
    pub std_dev: f64,
}

impl Gaussian {
    pub const fn new(mean: f64, std_dev: f64) -> Self {
        Self { mean, std_dev }
    }
}

/// Default emission parameters for one stage
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageEmission {
    pub cv: Gaussian,
    pub rmssd: Gaussian,
}

/// HMM decoder parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HmmConfig {
    /// Emission defaults indexed by `Stage::index`
    pub default_emissions: [StageEmission; 3],
    /// Initial state probabilities indexed by `Stage::index`
    pub initial_probabilities: [f64; 3],
    pub transitions: TransitionMatrix,
    /// Minimum observations of a stage before its emissions are learned
    pub min_observations: usize,
    pub cv_std_floor: f64,
    pub rmssd_std_floor: f64,
    /// Smallest std used inside the density
    pub density_std_floor: f64,
    /// Added to probabilities before taking logs
    pub log_epsilon: f64,
    /// REM emission multiplier before sleep latency
    pub rem_pre_latency_factor: f64,
    /// REM emission multiplier between latency and the end of cycle 0
    pub rem_first_cycle_factor: f64,
    pub rem_cycle_base: f64,
    pub rem_cycle_growth: f64,
    pub rem_cycle_cap: f64,
}

impl Default for HmmConfig {
    fn default() -> Self {
        Self {
            default_emissions: [
                StageEmission {
                    cv: Gaussian::new(0.40, 0.25),
                    rmssd: Gaussian::new(3.5, 2.0),
                },
                StageEmission {
                    cv: Gaussian::new(0.45, 0.30),
                    rmssd: Gaussian::new(3.0, 2.5),
                },
                StageEmission {
                    cv: Gaussian::new(0.20, 0.15),
                    rmssd: Gaussian::new(2.5, 1.5),
                },
            ],
            initial_probabilities: [0.3, 0.7, 0.0],
            transitions: TransitionMatrix::new([
                [0.01, 0.89, 0.10],
                [0.43, 0.37, 0.20],
                [0.49, 0.51, 0.001],
            ]),
            min_observations: 5,
            cv_std_floor: 0.05,
            rmssd_std_floor: 0.5,
            density_std_floor: 0.01,
            log_epsilon: 1e-10,
            rem_pre_latency_factor: 0.001,
            rem_first_cycle_factor: 0.3,
            rem_cycle_base: 0.5,
            rem_cycle_growth: 0.25,
            rem_cycle_cap: 1.5,
        }
    }
}

/// Complete configuration surface of the classifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub session_gap_hours: f64,
    pub min_session_records: usize,
    pub terms: ScoringTerms,
    pub features: FeatureConfig,
    pub awake_prior: AwakePriorConfig,
    pub rem_propensity: RemPropensityConfig,
    pub awake_gate: AwakeGateConfig,
    pub rem_gate: RemGateConfig,
    pub smoother: SmootherConfig,
    pub calibration: CalibrationConfig,
    pub hmm: HmmConfig,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            session_gap_hours: DEFAULT_SESSION_GAP_HOURS,
            min_session_records: DEFAULT_MIN_SESSION_RECORDS,
            terms: ScoringTerms::default(),
            features: FeatureConfig::default(),
            awake_prior: AwakePriorConfig::default(),
            rem_propensity: RemPropensityConfig::default(),
            awake_gate: AwakeGateConfig::default(),
            rem_gate: RemGateConfig::default(),
            smoother: SmootherConfig::default(),
            calibration: CalibrationConfig::default(),
            hmm: HmmConfig::default(),
        }
    }
}

impl ClassifierConfig {
    /// Same configuration with different scoring terms
    pub fn with_terms(mut self, terms: ScoringTerms) -> Self {
        self.terms = terms;
        self
    }

    /// Sleep latency shared by the REM gate and the HMM emission model
    pub fn sleep_latency_minutes(&self) -> f64 {
        self.rem_propensity.sleep_latency_minutes
    }

    /// Load configuration from JSON (missing fields take defaults)
    pub fn from_json(json: &str) -> Result<Self, ComputeError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to pretty JSON
    pub fn to_json(&self) -> Result<String, ComputeError> {
        serde_json::to_string_pretty(self).map_err(|e| ComputeError::EncodingError(e.to_string()))
    }

    /// Reject configurations the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ComputeError> {
        let invalid = |msg: &str| Err(ComputeError::ParseError(format!("Invalid config: {msg}")));

        if !(self.session_gap_hours.is_finite() && self.session_gap_hours > 0.0) {
            return invalid("session_gap_hours must be positive");
        }
        if self.features.hr_buffer_capacity < 2 {
            return invalid("hr_buffer_capacity must be at least 2");
        }
        if self.features.rmssd_history_capacity == 0 || self.features.mean_diff_window == 0 {
            return invalid("buffer capacities must be non-zero");
        }
        if !(self.rem_propensity.cycle_minutes > 0.0) {
            return invalid("cycle_minutes must be positive");
        }
        if !(self.calibration.bin_minutes > 0.0) {
            return invalid("bin_minutes must be positive");
        }
        if self.rem_gate.debounce_count == 0 || self.awake_gate.debounce_count == 0 {
            return invalid("debounce counts must be at least 1");
        }
        if self
            .awake_prior
            .steps
            .windows(2)
            .any(|w| w[1].until_minutes < w[0].until_minutes)
        {
            return invalid("awake prior steps must be sorted by until_minutes");
        }
        Ok(())
    }
}
