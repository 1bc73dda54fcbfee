//! Transition smoothing
//!
//! A deterministic veto layer over the decision machine's output: a label
//! whose transition probability from the previous label falls below a floor
//! is replaced by the most probable successor of the previous label.

use crate::config::SmootherConfig;
use crate::types::Stage;
use serde::{Deserialize, Serialize};

/// Row-stochastic 3x3 transition matrix indexed by `Stage::index`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransitionMatrix([[f64; 3]; 3]);

impl Default for TransitionMatrix {
    /// Empirical night-to-night transition frequencies
    fn default() -> Self {
        Self([[0.00, 0.89, 0.11], [0.43, 0.37, 0.20], [0.49, 0.51, 0.00]])
    }
}

impl TransitionMatrix {
    pub const fn new(rows: [[f64; 3]; 3]) -> Self {
        Self(rows)
    }

    /// Every transition equally likely
    pub fn uniform() -> Self {
        Self([[1.0 / 3.0; 3]; 3])
    }

    /// Normalize transition counts row by row.
    ///
    /// Rows without observations fall back to uniform 1/3; the returned flags
    /// mark those rows.
    pub fn from_counts(counts: &[[u64; 3]; 3]) -> (Self, [bool; 3]) {
        let mut rows = [[0.0; 3]; 3];
        let mut defaulted = [false; 3];
        for (from, row) in counts.iter().enumerate() {
            let total: u64 = row.iter().sum();
            if total == 0 {
                rows[from] = [1.0 / 3.0; 3];
                defaulted[from] = true;
            } else {
                for (to, count) in row.iter().enumerate() {
                    rows[from][to] = *count as f64 / total as f64;
                }
            }
        }
        (Self(rows), defaulted)
    }

    pub fn probability(&self, from: Stage, to: Stage) -> f64 {
        self.0[from.index()][to.index()]
    }

    pub fn row(&self, from: Stage) -> [f64; 3] {
        self.0[from.index()]
    }

    pub fn rows(&self) -> &[[f64; 3]; 3] {
        &self.0
    }

    /// Most probable successor of `from` among stages accepted by `allowed`.
    ///
    /// Ties resolve in `Stage::PRIORITY` order. Returns `None` only when no
    /// stage is allowed.
    pub fn argmax_where(&self, from: Stage, allowed: impl Fn(Stage) -> bool) -> Option<Stage> {
        let row = self.row(from);
        let mut best: Option<Stage> = None;
        for stage in Stage::PRIORITY {
            if !allowed(stage) {
                continue;
            }
            match best {
                Some(current) if row[stage.index()] <= row[current.index()] => {}
                _ => best = Some(stage),
            }
        }
        best
    }

    /// Most probable successor of `from`
    pub fn argmax(&self, from: Stage) -> Stage {
        self.argmax_where(from, |_| true).unwrap_or(Stage::Nrem)
    }

    /// Whether each row sums to 1 within `tolerance`
    pub fn is_row_stochastic(&self, tolerance: f64) -> bool {
        self.0
            .iter()
            .all(|row| (row.iter().sum::<f64>() - 1.0).abs() <= tolerance)
    }
}

/// Result of smoothing one label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmoothedLabel {
    pub stage: Stage,
    /// The raw transition fell below the floor and was replaced
    pub vetoed: bool,
}

/// Transition smoother with an injected matrix
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionSmoother {
    matrix: TransitionMatrix,
    floor: f64,
}

impl TransitionSmoother {
    pub fn new(matrix: TransitionMatrix, config: &SmootherConfig) -> Self {
        Self {
            matrix,
            floor: config.probability_floor,
        }
    }

    pub fn matrix(&self) -> &TransitionMatrix {
        &self.matrix
    }

    /// Veto `raw` if `P(previous -> raw)` is below the floor
    pub fn smooth(&self, previous: Stage, raw: Stage) -> SmoothedLabel {
        self.smooth_constrained(previous, raw, true)
    }

    /// As [`smooth`](Self::smooth), but a veto never substitutes REM when
    /// `rem_allowed` is false (before sleep latency).
    pub fn smooth_constrained(
        &self,
        previous: Stage,
        raw: Stage,
        rem_allowed: bool,
    ) -> SmoothedLabel {
        if self.matrix.probability(previous, raw) >= self.floor {
            return SmoothedLabel {
                stage: raw,
                vetoed: false,
            };
        }
        let stage = self
            .matrix
            .argmax_where(previous, |s| rem_allowed || s != Stage::Rem)
            .unwrap_or(raw);
        SmoothedLabel {
            stage,
            vetoed: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_matrix_is_row_stochastic() {
        assert!(TransitionMatrix::default().is_row_stochastic(1e-9));
        assert!(TransitionMatrix::uniform().is_row_stochastic(1e-9));
    }

    #[test]
    fn test_from_counts_with_uniform_fallback() {
        let counts = [[0, 3, 1], [0, 0, 0], [2, 2, 0]];
        let (matrix, defaulted) = TransitionMatrix::from_counts(&counts);
        assert_eq!(defaulted, [false, true, false]);
        assert_eq!(matrix.probability(Stage::Awake, Stage::Nrem), 0.75);
        assert_eq!(matrix.row(Stage::Nrem), [1.0 / 3.0; 3]);
        assert_eq!(matrix.probability(Stage::Rem, Stage::Awake), 0.5);
        assert!(matrix.is_row_stochastic(1e-9));
    }

    #[test]
    fn test_argmax_tie_break_priority() {
        let matrix = TransitionMatrix::new([
            [0.5, 0.5, 0.0],
            [0.4, 0.2, 0.4],
            [0.5, 0.0, 0.5],
        ]);
        assert_eq!(matrix.argmax(Stage::Awake), Stage::Nrem);
        assert_eq!(matrix.argmax(Stage::Nrem), Stage::Awake);
        assert_eq!(matrix.argmax(Stage::Rem), Stage::Awake);
        assert_eq!(TransitionMatrix::uniform().argmax(Stage::Rem), Stage::Nrem);
    }

    #[test]
    fn test_smoother_vetoes_rem_to_rem() {
        let smoother =
            TransitionSmoother::new(TransitionMatrix::default(), &SmootherConfig::default());
        let smoothed = smoother.smooth(Stage::Rem, Stage::Rem);
        assert!(smoothed.vetoed);
        assert_eq!(smoothed.stage, Stage::Nrem);

        let kept = smoother.smooth(Stage::Nrem, Stage::Rem);
        assert!(!kept.vetoed);
        assert_eq!(kept.stage, Stage::Rem);
    }

    #[test]
    fn test_constrained_veto_never_substitutes_rem() {
        let matrix = TransitionMatrix::new([
            [0.05, 0.15, 0.80],
            [0.3, 0.4, 0.3],
            [0.3, 0.4, 0.3],
        ]);
        let smoother = TransitionSmoother::new(matrix, &SmootherConfig::default());
        assert_eq!(smoother.smooth(Stage::Awake, Stage::Awake).stage, Stage::Rem);
        let constrained = smoother.smooth_constrained(Stage::Awake, Stage::Awake, false);
        assert!(constrained.vetoed);
        assert_eq!(constrained.stage, Stage::Nrem);
    }

    fn stage_strategy() -> impl Strategy<Value = Stage> {
        (0usize..3).prop_map(|i| Stage::from_index(i).unwrap())
    }

    proptest! {
        #[test]
        fn prop_veto_iff_below_floor(
            raw_rows in proptest::collection::vec(proptest::collection::vec(0.0f64..1.0, 3), 3),
            floor in 0.0f64..0.5,
            previous in stage_strategy(),
            raw in stage_strategy(),
        ) {
            let mut rows = [[0.0; 3]; 3];
            for (i, row) in raw_rows.iter().enumerate() {
                let total: f64 = row.iter().sum::<f64>().max(1e-9);
                for (j, v) in row.iter().enumerate() {
                    rows[i][j] = v / total;
                }
            }
            let matrix = TransitionMatrix::new(rows);
            let config = SmootherConfig { probability_floor: floor };
            let smoother = TransitionSmoother::new(matrix, &config);
            let smoothed = smoother.smooth(previous, raw);
            let below = matrix.probability(previous, raw) < floor;
            prop_assert_eq!(smoothed.vetoed, below);
            if below {
                prop_assert_eq!(smoothed.stage, matrix.argmax(previous));
            } else {
                prop_assert_eq!(smoothed.stage, raw);
            }
        }
    }
}
