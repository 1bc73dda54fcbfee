//! Synheart Hypnos - Streaming sleep stage classification from heart rate
//!
//! Hypnos labels each heart-rate reading of a night as Awake, NREM or REM
//! through a deterministic pipeline: raw records → sanitize → session
//! segmentation → streaming features → awake/REM gates → transition
//! smoothing → REM hysteresis.
//!
//! ## Modules
//!
//! - **Streaming classifier**: per-sample decisions with bounded state
//! - **Calibration**: learn awake priors, transitions and thresholds from
//!   labelled nights
//! - **HMM decoder**: batch Viterbi decoding over a whole session
//! - **Evaluation**: confusion matrices and REM/awake metrics against labels

pub mod calibrator;
pub mod classifier;
pub mod config;
pub mod decision;
pub mod encoder;
pub mod error;
pub mod evaluation;
pub mod features;
pub mod hmm;
pub mod pipeline;
pub mod priors;
pub mod schema;
pub mod session;
pub mod smoother;
pub mod types;

pub use calibrator::{AdaptiveCalibrator, CalibrationReport, LearnedParameters};
pub use classifier::{SessionClassifier, StageClassifier};
pub use config::{ClassifierConfig, ScoringTerms};
pub use encoder::ReportEncoder;
pub use error::ComputeError;
pub use evaluation::{ConfusionMatrix, EvaluationMetrics};
pub use hmm::HmmDecoder;
pub use pipeline::{
    calibrate_export, classify_export, evaluate_export, ComparisonReport, EvaluationMode,
    EvaluationReport, Evaluator, Variant,
};
pub use types::{Classification, HeartRateSample, SleepStage, Stage, StageRecord};

// Schema exports
pub use schema::{RawRecord, RawRecordAdapter, SCHEMA_VERSION};

/// Hypnos version embedded in all output payloads
pub const HYPNOS_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name for output payloads
pub const PRODUCER_NAME: &str = "synheart-hypnos";
