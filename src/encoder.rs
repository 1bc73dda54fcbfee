//! Output encoding
//!
//! Wraps classifications and reports with producer metadata. Classifications
//! stream as NDJSON (one labelled sample per line); reports and learned
//! parameters are single pretty-printed JSON documents.

use crate::calibrator::{CalibrationReport, LearnedParameters};
use crate::error::ComputeError;
use crate::pipeline::{ComparisonReport, EvaluationReport};
use crate::types::{Classification, Diagnostics, Stage};
use crate::{HYPNOS_VERSION, PRODUCER_NAME};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Output schema version
pub const OUTPUT_SCHEMA_VERSION: &str = "sleep.stage.v1";

/// Producer metadata attached to every payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Producer {
    pub name: String,
    pub version: String,
    pub instance_id: String,
}

/// One NDJSON line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationRecord {
    pub schema_version: String,
    pub producer: Producer,
    pub timestamp: DateTime<Utc>,
    pub predicted_stage: Stage,
    pub diagnostics: Diagnostics,
}

/// Report document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportEnvelope<T> {
    pub schema_version: String,
    pub producer: Producer,
    pub computed_at_utc: DateTime<Utc>,
    pub report: T,
}

/// Learned parameters together with how they were obtained
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationOutput {
    pub parameters: LearnedParameters,
    pub provenance: CalibrationReport,
}

/// Encoder for classifier output
pub struct ReportEncoder {
    instance_id: String,
}

impl Default for ReportEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ReportEncoder {
    /// Create a new encoder with a unique instance ID
    pub fn new() -> Self {
        Self {
            instance_id: Uuid::new_v4().to_string(),
        }
    }

    /// Create an encoder with a specific instance ID
    pub fn with_instance_id(instance_id: String) -> Self {
        Self { instance_id }
    }

    fn producer(&self) -> Producer {
        Producer {
            name: PRODUCER_NAME.to_string(),
            version: HYPNOS_VERSION.to_string(),
            instance_id: self.instance_id.clone(),
        }
    }

    pub fn encode_classification(&self, classification: &Classification) -> ClassificationRecord {
        ClassificationRecord {
            schema_version: OUTPUT_SCHEMA_VERSION.to_string(),
            producer: self.producer(),
            timestamp: classification.timestamp,
            predicted_stage: classification.predicted_stage,
            diagnostics: classification.diagnostics,
        }
    }

    /// Encode classifications as NDJSON (trailing newline when non-empty)
    pub fn encode_ndjson(
        &self,
        classifications: &[Classification],
    ) -> Result<String, ComputeError> {
        let mut out = String::new();
        for c in classifications {
            let line = serde_json::to_string(&self.encode_classification(c))
                .map_err(ComputeError::JsonError)?;
            out.push_str(&line);
            out.push('\n');
        }
        Ok(out)
    }

    fn envelope<T: Serialize>(&self, report: T) -> Result<String, ComputeError> {
        let envelope = ReportEnvelope {
            schema_version: OUTPUT_SCHEMA_VERSION.to_string(),
            producer: self.producer(),
            computed_at_utc: Utc::now(),
            report,
        };
        serde_json::to_string_pretty(&envelope).map_err(ComputeError::JsonError)
    }

    pub fn encode_evaluation(&self, report: &EvaluationReport) -> Result<String, ComputeError> {
        self.envelope(report)
    }

    pub fn encode_comparison(&self, report: &ComparisonReport) -> Result<String, ComputeError> {
        self.envelope(report)
    }

    pub fn encode_calibration(
        &self,
        params: &LearnedParameters,
        report: &CalibrationReport,
    ) -> Result<String, ComputeError> {
        self.envelope(CalibrationOutput {
            parameters: params.clone(),
            provenance: report.clone(),
        })
    }
}

/// Extract learned parameters from either a bare parameter document or a
/// calibration envelope written by [`ReportEncoder::encode_calibration`]
pub fn decode_parameters(json: &str) -> Result<LearnedParameters, ComputeError> {
    let value: serde_json::Value = serde_json::from_str(json)?;
    let inner = value
        .get("report")
        .and_then(|r| r.get("parameters"))
        .cloned()
        .unwrap_or(value);
    LearnedParameters::from_json(&inner.to_string())
}
