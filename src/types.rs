//! Core types for the Synheart Hypnos pipeline
//!
//! This module defines the data structures that flow through each stage of the
//! pipeline: heart-rate samples and ground-truth stage records coming in,
//! sessions partitioning them, and per-sample classifications going out.

use crate::schema::ValidationError;
use crate::session::validate_records;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Three-class sleep stage emitted by every classifier in this crate
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Awake,
    Nrem,
    Rem,
}

impl Stage {
    /// Number of stages (matrix dimension)
    pub const COUNT: usize = 3;

    /// All stages in matrix index order
    pub const ALL: [Stage; 3] = [Stage::Awake, Stage::Nrem, Stage::Rem];

    /// Tie-break order for argmax decisions.
    ///
    /// NREM wins ties because it is the majority stage of any night; Awake
    /// beats REM because REM is the stage with a latency constraint.
    pub const PRIORITY: [Stage; 3] = [Stage::Nrem, Stage::Awake, Stage::Rem];

    /// Row/column index of this stage in 3x3 matrices
    pub fn index(&self) -> usize {
        match self {
            Stage::Awake => 0,
            Stage::Nrem => 1,
            Stage::Rem => 2,
        }
    }

    /// Create a stage from a matrix index
    pub fn from_index(idx: usize) -> Option<Self> {
        match idx {
            0 => Some(Stage::Awake),
            1 => Some(Stage::Nrem),
            2 => Some(Stage::Rem),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Awake => "awake",
            Stage::Nrem => "nrem",
            Stage::Rem => "rem",
        }
    }

    /// Awake vs. asleep (NREM and REM)
    pub fn is_sleep(&self) -> bool {
        !matches!(self, Stage::Awake)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Four-class stage label as recorded by the wearable vendor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SleepStage {
    Awake,
    Light,
    Deep,
    Rem,
}

impl SleepStage {
    /// Collapse Light and Deep into NREM
    pub fn normalize(&self) -> Stage {
        match self {
            SleepStage::Awake => Stage::Awake,
            SleepStage::Light | SleepStage::Deep => Stage::Nrem,
            SleepStage::Rem => Stage::Rem,
        }
    }

    /// Parse a vendor label (case-insensitive)
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "awake" | "wake" => Some(SleepStage::Awake),
            "light" => Some(SleepStage::Light),
            "deep" => Some(SleepStage::Deep),
            "rem" => Some(SleepStage::Rem),
            _ => None,
        }
    }
}

/// A single heart-rate reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartRateSample {
    /// Reading time (UTC)
    pub timestamp: DateTime<Utc>,
    /// Heart rate (beats per minute)
    pub bpm: u16,
}

impl HeartRateSample {
    pub fn new(timestamp: DateTime<Utc>, bpm: u16) -> Self {
        Self { timestamp, bpm }
    }
}

/// Ground-truth stage interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Vendor stage label
    pub stage: SleepStage,
    /// Interval start (UTC)
    pub start_time: DateTime<Utc>,
    /// Interval end (UTC), never before `start_time` once validated
    pub end_time: DateTime<Utc>,
}

impl StageRecord {
    pub fn new(stage: SleepStage, start_time: DateTime<Utc>, end_time: DateTime<Utc>) -> Self {
        Self {
            stage,
            start_time,
            end_time,
        }
    }

    /// Three-class label of this record
    pub fn label(&self) -> Stage {
        self.stage.normalize()
    }

    /// Whether `t` lies in the closed interval `[start_time, end_time]`
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start_time <= t && t <= self.end_time
    }
}

/// A maximal run of stage records not separated by a long gap.
///
/// Created by the segmenter and read-only afterwards. Its start anchors every
/// elapsed-minutes computation for the samples it contains. Deserializing
/// applies the same record checks as segmentation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SessionRecords")]
pub struct Session {
    pub(crate) index: usize,
    pub(crate) records: Vec<StageRecord>,
}

#[derive(Deserialize)]
struct SessionRecords {
    index: usize,
    records: Vec<StageRecord>,
}

impl TryFrom<SessionRecords> for Session {
    type Error = ValidationError;

    fn try_from(raw: SessionRecords) -> Result<Self, Self::Error> {
        validate_records(&raw.records)?;
        Ok(Session {
            index: raw.index,
            records: raw.records,
        })
    }
}

impl Session {
    /// Position of this session in segmenter output
    pub fn index(&self) -> usize {
        self.index
    }

    /// Records in chronological order (never empty)
    pub fn records(&self) -> &[StageRecord] {
        &self.records
    }

    /// Session start: start of the first record
    pub fn start_time(&self) -> DateTime<Utc> {
        self.records[0].start_time
    }

    /// Session end: latest record end
    pub fn end_time(&self) -> DateTime<Utc> {
        self.records
            .iter()
            .map(|r| r.end_time)
            .max()
            .unwrap_or_else(|| self.start_time())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Elapsed minutes between session start and `t`
    pub fn elapsed_minutes(&self, t: DateTime<Utc>) -> f64 {
        minutes_between(self.start_time(), t)
    }
}

/// Data quality markers attached to a classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataQuality {
    /// Features were finite and used as-is
    Ok,
    /// A feature was NaN/infinite; the previous label was carried forward
    NonFiniteFeature,
}

/// Per-sample diagnostics surfaced alongside the label
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub rmssd: f64,
    pub cv: f64,
    pub mean_diff: f64,
    pub awake_score: f64,
    pub rem_score: f64,
    pub elapsed_minutes: f64,
    /// The transition smoother replaced the raw label
    pub smoothed: bool,
    pub data_quality: DataQuality,
}

/// Output of the streaming classifier for one sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub timestamp: DateTime<Utc>,
    pub predicted_stage: Stage,
    pub diagnostics: Diagnostics,
}

/// Minutes from `from` to `to` (negative if `to` is earlier)
pub fn minutes_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 60_000.0
}
