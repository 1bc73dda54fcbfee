//! Evaluation metrics
//!
//! Confusion matrix of actual vs. predicted stages and the metrics derived
//! from it. Matrices from independent sessions merge by summation.

use crate::types::Stage;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

/// Counts indexed `[actual][predicted]` by `Stage::index`.
///
/// Serializes as `{actual: {predicted: count}}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfusionMatrix {
    counts: [[u64; 3]; 3],
}

impl ConfusionMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, actual: Stage, predicted: Stage) {
        self.counts[actual.index()][predicted.index()] += 1;
    }

    pub fn count(&self, actual: Stage, predicted: Stage) -> u64 {
        self.counts[actual.index()][predicted.index()]
    }

    /// Sum of every cell
    pub fn total(&self) -> u64 {
        self.counts.iter().flatten().sum()
    }

    /// Samples whose actual label is `stage`
    pub fn actual_total(&self, stage: Stage) -> u64 {
        self.counts[stage.index()].iter().sum()
    }

    /// Samples predicted as `stage`
    pub fn predicted_total(&self, stage: Stage) -> u64 {
        self.counts.iter().map(|row| row[stage.index()]).sum()
    }

    pub fn correct(&self) -> u64 {
        Stage::ALL.iter().map(|s| self.count(*s, *s)).sum()
    }

    pub fn merge(mut self, other: Self) -> Self {
        for (row, other_row) in self.counts.iter_mut().zip(other.counts.iter()) {
            for (cell, other_cell) in row.iter_mut().zip(other_row.iter()) {
                *cell += other_cell;
            }
        }
        self
    }

    pub fn metrics(&self) -> EvaluationMetrics {
        EvaluationMetrics::from_confusion(self)
    }
}

impl Serialize for ConfusionMatrix {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(Stage::COUNT))?;
        for actual in Stage::ALL {
            let row: BTreeMap<&str, u64> = Stage::ALL
                .iter()
                .map(|predicted| (predicted.as_str(), self.count(actual, *predicted)))
                .collect();
            map.serialize_entry(actual.as_str(), &row)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ConfusionMatrix {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let nested: BTreeMap<Stage, BTreeMap<Stage, u64>> = BTreeMap::deserialize(deserializer)?;
        let mut matrix = ConfusionMatrix::default();
        for (actual, row) in nested {
            for (predicted, count) in row {
                matrix.counts[actual.index()][predicted.index()] = count;
            }
        }
        Ok(matrix)
    }
}

/// Metrics derived from a confusion matrix.
///
/// Ratios with a zero denominator are reported as 0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvaluationMetrics {
    pub accuracy: f64,
    pub rem_sensitivity: f64,
    pub rem_specificity: f64,
    pub rem_precision: f64,
    pub rem_f1: f64,
    pub awake_sensitivity: f64,
    pub awake_precision: f64,
}

impl EvaluationMetrics {
    pub fn from_confusion(cm: &ConfusionMatrix) -> Self {
        let rem_tp = cm.count(Stage::Rem, Stage::Rem);
        let rem_fn = cm.actual_total(Stage::Rem) - rem_tp;
        let rem_fp = cm.predicted_total(Stage::Rem) - rem_tp;
        let rem_tn = cm.total() - rem_tp - rem_fn - rem_fp;

        let rem_sensitivity = ratio(rem_tp, rem_tp + rem_fn);
        let rem_precision = ratio(rem_tp, rem_tp + rem_fp);
        let rem_f1 = if rem_precision + rem_sensitivity > 0.0 {
            2.0 * rem_precision * rem_sensitivity / (rem_precision + rem_sensitivity)
        } else {
            0.0
        };

        let awake_tp = cm.count(Stage::Awake, Stage::Awake);

        Self {
            accuracy: ratio(cm.correct(), cm.total()),
            rem_sensitivity,
            rem_specificity: ratio(rem_tn, rem_tn + rem_fp),
            rem_precision,
            rem_f1,
            awake_sensitivity: ratio(awake_tp, cm.actual_total(Stage::Awake)),
            awake_precision: ratio(awake_tp, cm.predicted_total(Stage::Awake)),
        }
    }
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}
