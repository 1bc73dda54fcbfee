//! Session segmentation
//!
//! Splits chronologically ordered telemetry into sessions separated by long
//! gaps, and aligns heart-rate samples with the stage records they fall in.

use crate::error::ComputeError;
use crate::schema::ValidationError;
use crate::types::{minutes_between, HeartRateSample, Session, Stage, StageRecord};
use chrono::{DateTime, Utc};

/// Session segmenter over stage records
pub struct SessionSegmenter {
    gap_hours: f64,
}

impl SessionSegmenter {
    /// Create a segmenter with the given gap threshold (hours)
    pub fn new(gap_hours: f64) -> Self {
        Self { gap_hours }
    }

    /// Partition sorted stage records into sessions.
    ///
    /// A new session starts whenever the gap between the previous record's end
    /// and the current record's start exceeds the threshold. Every record lands
    /// in exactly one session, in input order.
    pub fn segment(&self, records: &[StageRecord]) -> Result<Vec<Session>, ComputeError> {
        validate_records(records)?;

        let gap_minutes = self.gap_hours * 60.0;
        let mut sessions = Vec::new();
        let mut current: Vec<StageRecord> = vec![records[0]];

        for pair in records.windows(2) {
            let (prev, record) = (pair[0], pair[1]);
            if minutes_between(prev.end_time, record.start_time) > gap_minutes {
                sessions.push(Session {
                    index: sessions.len(),
                    records: std::mem::take(&mut current),
                });
            }
            current.push(record);
        }
        sessions.push(Session {
            index: sessions.len(),
            records: current,
        });

        tracing::debug!(
            records = records.len(),
            sessions = sessions.len(),
            gap_hours = self.gap_hours,
            "segmented stage records"
        );

        Ok(sessions)
    }

    /// Partition a sorted heart-rate stream into sessions (no labels).
    ///
    /// Used for live classification, where the session start is the first
    /// sample after a gap.
    pub fn segment_samples(&self, samples: &[HeartRateSample]) -> Vec<SampleSession> {
        let gap_minutes = self.gap_hours * 60.0;
        let mut sessions: Vec<SampleSession> = Vec::new();

        for sample in samples {
            let split = match sessions.last() {
                Some(session) => match session.samples.last() {
                    Some(last) => minutes_between(last.timestamp, sample.timestamp) > gap_minutes,
                    None => false,
                },
                None => true,
            };
            if split {
                sessions.push(SampleSession {
                    index: sessions.len(),
                    start_time: sample.timestamp,
                    samples: Vec::new(),
                });
            }
            if let Some(session) = sessions.last_mut() {
                session.samples.push(*sample);
            }
        }

        sessions
    }
}

impl Default for SessionSegmenter {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_SESSION_GAP_HOURS)
    }
}

/// Heart-rate samples of one unlabelled session
#[derive(Debug, Clone, PartialEq)]
pub struct SampleSession {
    pub index: usize,
    pub start_time: DateTime<Utc>,
    pub samples: Vec<HeartRateSample>,
}

/// A heart-rate sample paired with the ground-truth label it falls under
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LabelledSample {
    pub sample: HeartRateSample,
    pub actual: Stage,
}

/// Assign each sample to the first record of `session` whose closed interval
/// contains it.
///
/// `samples` must be sorted. Samples outside every record (including those in
/// gaps between records) are not returned, and no sample is returned twice
/// even when adjacent records share a boundary instant.
pub fn align_samples(session: &Session, samples: &[HeartRateSample]) -> Vec<LabelledSample> {
    let first = samples.partition_point(|s| s.timestamp < session.start_time());
    let mut cursor = first;
    let mut aligned = Vec::new();

    for record in session.records() {
        while cursor < samples.len() && samples[cursor].timestamp < record.start_time {
            cursor += 1;
        }
        while cursor < samples.len() && record.contains(samples[cursor].timestamp) {
            aligned.push(LabelledSample {
                sample: samples[cursor],
                actual: record.label(),
            });
            cursor += 1;
        }
    }

    aligned
}

/// Non-empty, each interval forward, starts non-decreasing
pub(crate) fn validate_records(records: &[StageRecord]) -> Result<(), ValidationError> {
    if records.is_empty() {
        return Err(ValidationError::EmptyInput);
    }
    for (index, record) in records.iter().enumerate() {
        if record.end_time < record.start_time {
            return Err(ValidationError::InvertedInterval {
                index,
                start: record.start_time,
                end: record.end_time,
            });
        }
        if index > 0 && record.start_time < records[index - 1].start_time {
            return Err(ValidationError::OutOfOrder { index });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SleepStage;
    use chrono::{Duration, TimeZone};

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

    #[test]
    fn test_single_session() {
        let records = vec![
            record(SleepStage::Light, 0, 30),
            record(SleepStage::Deep, 30, 60),
            record(SleepStage::Rem, 60, 80),
        ];
        let sessions = SessionSegmenter::default().segment(&records).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].len(), 3);
        assert_eq!(sessions[0].start_time(), t0());
        assert_eq!(sessions[0].end_time(), t0() + Duration::minutes(80));
    }

    #[test]
    fn test_gap_splits_sessions() {
        let records = vec![
            record(SleepStage::Light, 0, 30),
            // exactly 4h gap stays in the same session
            record(SleepStage::Light, 270, 300),
            // 4h + 1min gap splits
            record(SleepStage::Deep, 541, 560),
        ];
        let sessions = SessionSegmenter::new(4.0).segment(&records).unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].len(), 2);
        assert_eq!(sessions[1].len(), 1);
        assert_eq!(sessions[1].index(), 1);

        let total: usize = sessions.iter().map(|s| s.len()).sum();
        assert_eq!(total, records.len());
    }

    #[test]
    fn test_empty_input_is_validation_error() {
        let result = SessionSegmenter::default().segment(&[]);
        assert!(matches!(
            result,
            Err(ComputeError::Validation(ValidationError::EmptyInput))
        ));
    }

    #[test]
    fn test_inverted_interval_is_validation_error() {
        let records = vec![record(SleepStage::Light, 0, 30), record(SleepStage::Rem, 40, 35)];
        let result = SessionSegmenter::default().segment(&records);
        assert!(matches!(
            result,
            Err(ComputeError::Validation(ValidationError::InvertedInterval { index: 1, .. }))
        ));
    }

    #[test]
    fn test_out_of_order_is_validation_error() {
        let records = vec![record(SleepStage::Light, 30, 60), record(SleepStage::Rem, 0, 20)];
        let result = SessionSegmenter::default().segment(&records);
        assert!(matches!(
            result,
            Err(ComputeError::Validation(ValidationError::OutOfOrder { index: 1 }))
        ));
    }

    #[test]
    fn test_align_samples_once_per_sample() {
        let records = vec![
            record(SleepStage::Awake, 0, 10),
            record(SleepStage::Light, 10, 20),
            record(SleepStage::Rem, 30, 40),
        ];
        let session = SessionSegmenter::default()
            .segment(&records)
            .unwrap()
            .remove(0);

        let samples: Vec<HeartRateSample> = [-5, 0, 5, 10, 15, 25, 35, 45]
            .iter()
            .map(|m| HeartRateSample::new(t0() + Duration::minutes(*m), 60))
            .collect();

        let aligned = align_samples(&session, &samples);
        let labels: Vec<Stage> = aligned.iter().map(|a| a.actual).collect();
        // minute 10 sits on a shared boundary and goes to the first record
        assert_eq!(
            labels,
            vec![Stage::Awake, Stage::Awake, Stage::Awake, Stage::Nrem, Stage::Rem]
        );
    }

    #[test]
    fn test_segment_samples() {
        let samples: Vec<HeartRateSample> = [0, 5, 10, 400, 405]
            .iter()
            .map(|m| HeartRateSample::new(t0() + Duration::minutes(*m), 60))
            .collect();
        let sessions = SessionSegmenter::new(4.0).segment_samples(&samples);
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].samples.len(), 3);
        assert_eq!(sessions[1].start_time, t0() + Duration::minutes(400));
        assert!(SessionSegmenter::default().segment_samples(&[]).is_empty());
    }
}
