//! sleep.raw_record.v1 schema definition
//!
//! Telemetry arrives in one of two shapes:
//! - An export document with `hrSamples` and `sleepStages` arrays
//! - NDJSON where each line is a record tagged with `kind`
//!
//! Raw records keep timestamps as strings so that a single unparseable value
//! drops one record instead of failing the whole document.

use crate::types::{HeartRateSample, SleepStage, StageRecord};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current schema version
pub const SCHEMA_VERSION: &str = "sleep.raw_record.v1";

/// Highest heart rate accepted as physiological
pub const MAX_PLAUSIBLE_BPM: f64 = 300.0;

/// Raw heart-rate reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawHeartRate {
    /// RFC 3339 timestamp (naive timestamps are read as UTC)
    pub time: String,
    /// Beats per minute
    #[serde(default)]
    pub bpm: Option<f64>,
}

/// Raw ground-truth stage interval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawStage {
    /// Vendor label: awake, wake, light, deep or rem
    pub stage: String,
    pub start_time: String,
    pub end_time: String,
}

/// Export document (Fitbit / Health Connect dump)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawExport {
    #[serde(default)]
    pub hr_samples: Vec<RawHeartRate>,
    #[serde(default)]
    pub sleep_stages: Vec<RawStage>,
}

/// Single NDJSON line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RawRecord {
    HeartRate(RawHeartRate),
    Stage(RawStage),
}

/// Reason a raw record was dropped
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "issue", content = "detail")]
pub enum RecordIssue {
    #[error("Unparseable timestamp: {0}")]
    UnparseableTimestamp(String),

    #[error("Invalid heart rate: {0:?}")]
    InvalidBpm(Option<f64>),

    #[error("Unknown stage label: {0}")]
    UnknownStage(String),
}

/// Structural violations of the telemetry contract
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("Empty input: no stage records to segment")]
    EmptyInput,

    #[error("Stage record {index} ends before it starts ({start} > {end})")]
    InvertedInterval {
        index: usize,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("Stage record {index} starts before its predecessor")]
    OutOfOrder { index: usize },
}

impl RawHeartRate {
    /// Convert to a typed sample; bpm is rounded to the nearest integer
    pub fn parse(&self) -> Result<HeartRateSample, RecordIssue> {
        let timestamp = parse_timestamp(&self.time)?;
        match self.bpm {
            Some(bpm)
                if bpm.is_finite() && bpm.round() >= 1.0 && bpm.round() <= MAX_PLAUSIBLE_BPM =>
            {
                Ok(HeartRateSample::new(timestamp, bpm.round() as u16))
            }
            other => Err(RecordIssue::InvalidBpm(other)),
        }
    }
}

impl RawStage {
    /// Convert to a typed record.
    ///
    /// Inverted intervals pass through here; they are a structural error
    /// reported by the segmenter, not a malformed record.
    pub fn parse(&self) -> Result<StageRecord, RecordIssue> {
        let stage = SleepStage::parse(&self.stage)
            .ok_or_else(|| RecordIssue::UnknownStage(self.stage.clone()))?;
        let start = parse_timestamp(&self.start_time)?;
        let end = parse_timestamp(&self.end_time)?;
        Ok(StageRecord::new(stage, start, end))
    }
}

/// Parse an RFC 3339 timestamp, falling back to a naive ISO 8601 timestamp in UTC
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, RecordIssue> {
    let trimmed = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|_| RecordIssue::UnparseableTimestamp(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_deserialize_export() {
        let json = r#"{
            "hrSamples": [{"time": "2024-01-15T23:05:00Z", "bpm": 58}],
            "sleepStages": [{
                "stage": "light",
                "startTime": "2024-01-15T23:00:00Z",
                "endTime": "2024-01-15T23:30:00Z"
            }]
        }"#;
        let export: RawExport = serde_json::from_str(json).unwrap();
        assert_eq!(export.hr_samples.len(), 1);
        assert_eq!(export.sleep_stages[0].stage, "light");
    }

    #[test]
    fn test_deserialize_tagged_record() {
        let line = r#"{"kind": "heart_rate", "time": "2024-01-15T23:05:00Z", "bpm": 61.0}"#;
        let record: RawRecord = serde_json::from_str(line).unwrap();
        assert!(matches!(record, RawRecord::HeartRate(_)));
    }

    #[test]
    fn test_parse_heart_rate() {
        let raw = RawHeartRate {
            time: "2024-01-15T23:05:00+01:00".to_string(),
            bpm: Some(57.6),
        };
        let sample = raw.parse().unwrap();
        assert_eq!(sample.bpm, 58);
        assert_eq!(
            sample.timestamp,
            Utc.with_ymd_and_hms(2024, 1, 15, 22, 5, 0).unwrap()
        );
    }

    #[test]
    fn test_parse_naive_timestamp_as_utc() {
        let ts = parse_timestamp("2024-01-15T23:05:00.250").unwrap();
        assert_eq!(ts.timestamp_millis() % 1000, 250);
    }

    #[test]
    fn test_rejects_bad_bpm() {
        for bpm in [Some(0.0), Some(-40.0), Some(f64::NAN), Some(450.0), None] {
            let raw = RawHeartRate {
                time: "2024-01-15T23:05:00Z".to_string(),
                bpm,
            };
            assert!(matches!(raw.parse(), Err(RecordIssue::InvalidBpm(_))));
        }
    }

    #[test]
    fn test_rejects_bad_timestamp() {
        let raw = RawHeartRate {
            time: "yesterday".to_string(),
            bpm: Some(60.0),
        };
        assert!(matches!(
            raw.parse(),
            Err(RecordIssue::UnparseableTimestamp(_))
        ));
    }

    #[test]
    fn test_parse_stage() {
        let raw = RawStage {
            stage: "REM".to_string(),
            start_time: "2024-01-16T01:00:00Z".to_string(),
            end_time: "2024-01-16T01:20:00Z".to_string(),
        };
        let record = raw.parse().unwrap();
        assert_eq!(record.stage, SleepStage::Rem);

        let unknown = RawStage {
            stage: "restless".to_string(),
            ..raw
        };
        assert!(matches!(
            unknown.parse(),
            Err(RecordIssue::UnknownStage(_))
        ));
    }
}
