//! Adapter for converting sleep.raw_record.v1 into typed, ordered streams
//!
//! Malformed records are dropped (never fatal) and reported, so a caller can
//! judge how much of the input survived.

use crate::error::ComputeError;
use crate::schema::raw_record::*;
use crate::types::{HeartRateSample, StageRecord};
use serde::{Deserialize, Serialize};

/// Adapter for converting raw telemetry to typed streams
pub struct RawRecordAdapter;

impl RawRecordAdapter {
    /// Parse an export document (`hrSamples` / `sleepStages`)
    pub fn parse_export(json: &str) -> Result<RawExport, ComputeError> {
        let export: RawExport = serde_json::from_str(json)?;
        Ok(export)
    }

    /// Parse NDJSON (newline-delimited JSON) containing tagged records
    pub fn parse_ndjson(ndjson: &str) -> Result<RawExport, ComputeError> {
        let mut export = RawExport::default();
        for (line_num, line) in ndjson.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<RawRecord>(trimmed) {
                Ok(RawRecord::HeartRate(hr)) => export.hr_samples.push(hr),
                Ok(RawRecord::Stage(stage)) => export.sleep_stages.push(stage),
                Err(e) => {
                    return Err(ComputeError::ParseError(format!(
                        "Failed to parse line {}: {}",
                        line_num + 1,
                        e
                    )));
                }
            }
        }
        Ok(export)
    }

    /// Drop malformed records and sort both streams chronologically
    pub fn sanitize(export: &RawExport) -> SanitizedInput {
        let mut report = SanitizeReport {
            hr_total: export.hr_samples.len(),
            stage_total: export.sleep_stages.len(),
            ..Default::default()
        };

        let mut samples: Vec<HeartRateSample> = Vec::with_capacity(export.hr_samples.len());
        for (index, raw) in export.hr_samples.iter().enumerate() {
            match raw.parse() {
                Ok(sample) => samples.push(sample),
                Err(issue) => report.dropped.push(DroppedRecord {
                    stream: RecordStream::HeartRate,
                    index,
                    issue,
                }),
            }
        }

        let mut records: Vec<StageRecord> = Vec::with_capacity(export.sleep_stages.len());
        for (index, raw) in export.sleep_stages.iter().enumerate() {
            match raw.parse() {
                Ok(record) => records.push(record),
                Err(issue) => report.dropped.push(DroppedRecord {
                    stream: RecordStream::Stage,
                    index,
                    issue,
                }),
            }
        }

        samples.sort_by_key(|s| s.timestamp);
        records.sort_by_key(|r| r.start_time);

        if !report.dropped.is_empty() {
            tracing::warn!(
                dropped = report.dropped.len(),
                hr_total = report.hr_total,
                stage_total = report.stage_total,
                "dropped malformed telemetry records"
            );
        }

        SanitizedInput {
            samples,
            records,
            report,
        }
    }

    /// Parse and sanitize an export document in one step
    pub fn load_export(json: &str) -> Result<SanitizedInput, ComputeError> {
        Ok(Self::sanitize(&Self::parse_export(json)?))
    }

    /// Parse and sanitize NDJSON in one step
    pub fn load_ndjson(ndjson: &str) -> Result<SanitizedInput, ComputeError> {
        Ok(Self::sanitize(&Self::parse_ndjson(ndjson)?))
    }
}

/// Which input stream a record came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStream {
    HeartRate,
    Stage,
}

/// A record removed during sanitizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedRecord {
    pub stream: RecordStream,
    /// Index within its stream in the raw input
    pub index: usize,
    pub issue: RecordIssue,
}

/// Summary of sanitizing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SanitizeReport {
    pub hr_total: usize,
    pub stage_total: usize,
    pub dropped: Vec<DroppedRecord>,
}

impl SanitizeReport {
    pub fn hr_dropped(&self) -> usize {
        self.count(RecordStream::HeartRate)
    }

    pub fn stage_dropped(&self) -> usize {
        self.count(RecordStream::Stage)
    }

    fn count(&self, stream: RecordStream) -> usize {
        self.dropped.iter().filter(|d| d.stream == stream).count()
    }
}

/// Typed, time-ordered input streams
#[derive(Debug, Clone)]
pub struct SanitizedInput {
    pub samples: Vec<HeartRateSample>,
    pub records: Vec<StageRecord>,
    pub report: SanitizeReport,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SleepStage;

    fn sample_export_json() -> &'static str {
        r#"{
            "hrSamples": [
                {"time": "2024-01-15T23:10:00Z", "bpm": 60},
                {"time": "not-a-time", "bpm": 61},
                {"time": "2024-01-15T23:05:00Z", "bpm": 58},
                {"time": "2024-01-15T23:15:00Z", "bpm": 0}
            ],
            "sleepStages": [
                {"stage": "deep",
                 "startTime": "2024-01-15T23:30:00Z", "endTime": "2024-01-16T00:00:00Z"},
                {"stage": "light",
                 "startTime": "2024-01-15T23:00:00Z", "endTime": "2024-01-15T23:30:00Z"},
                {"stage": "snoring",
                 "startTime": "2024-01-16T00:00:00Z", "endTime": "2024-01-16T00:10:00Z"}
            ]
        }"#
    }

    #[test]
    fn test_sanitize_drops_and_sorts() {
        let input = RawRecordAdapter::load_export(sample_export_json()).unwrap();

        assert_eq!(input.samples.len(), 2);
        assert!(input.samples[0].timestamp < input.samples[1].timestamp);
        assert_eq!(input.samples[0].bpm, 58);

        assert_eq!(input.records.len(), 2);
        assert_eq!(input.records[0].stage, SleepStage::Light);

        assert_eq!(input.report.hr_total, 4);
        assert_eq!(input.report.hr_dropped(), 2);
        assert_eq!(input.report.stage_dropped(), 1);
    }

    #[test]
    fn test_parse_ndjson() {
        let ndjson = r#"
{"kind": "heart_rate", "time": "2024-01-15T23:05:00Z", "bpm": 58}
{"kind":"stage","stage":"light","startTime":"2024-01-15T23:00:00Z","endTime":"2024-01-15T23:30:00Z"}

{"kind": "heart_rate", "time": "2024-01-15T23:10:00Z", "bpm": 59}
"#;
        let input = RawRecordAdapter::load_ndjson(ndjson).unwrap();
        assert_eq!(input.samples.len(), 2);
        assert_eq!(input.records.len(), 1);
        assert!(input.report.dropped.is_empty());
    }

    #[test]
    fn test_ndjson_reports_line_number() {
        let ndjson = concat!(
            "{\"kind\": \"heart_rate\", \"time\": \"2024-01-15T23:05:00Z\", \"bpm\": 58}\n",
            "{oops}\n",
        );
        match RawRecordAdapter::parse_ndjson(ndjson) {
            Err(ComputeError::ParseError(msg)) => assert!(msg.contains("line 2")),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_json() {
        assert!(RawRecordAdapter::parse_export("not valid json").is_err());
    }
}
