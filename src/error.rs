//! Error types for Synheart Hypnos

use thiserror::Error;

use crate::schema::ValidationError;

/// Errors that can occur during classification, calibration or decoding
#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("Failed to parse telemetry payload: {0}")]
    ParseError(String),

    #[error("Invalid JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Structural validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Encoding error: {0}")]
    EncodingError(String),

    #[error("Insufficient data for computation: {0}")]
    InsufficientData(String),
}
