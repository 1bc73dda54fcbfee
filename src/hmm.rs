//! HMM decoding
//!
//! Batch alternative to the streaming decision machine. Emissions are the
//! product of per-stage Gaussian densities over CV and RMSSD, scaled for REM
//! by a time factor; Viterbi runs in the log domain over a whole session.

use crate::calibrator::ParameterSource;
use crate::config::{ClassifierConfig, Gaussian, HmmConfig, StageEmission};
use crate::features::{FeatureExtractor, SampleFeatures};
use crate::session::align_samples;
use crate::types::{HeartRateSample, Session, Stage};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Provenance of one stage's emission parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEmissionReport {
    pub stage: Stage,
    pub observations: usize,
    pub source: ParameterSource,
    pub emission: StageEmission,
}

/// Which emission parameters were learned vs. defaulted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmissionReport {
    pub sessions_used: usize,
    pub sessions_skipped: usize,
    pub stages: Vec<StageEmissionReport>,
}

/// Per-stage feature observations; merging concatenates
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmissionAccumulator {
    cv: [Vec<f64>; 3],
    rmssd: [Vec<f64>; 3],
    sessions: usize,
}

impl EmissionAccumulator {
    pub fn observe_session(
        session: &Session,
        samples: &[HeartRateSample],
        config: &ClassifierConfig,
    ) -> Self {
        let mut acc = Self {
            sessions: 1,
            ..Self::default()
        };
        let mut extractor = FeatureExtractor::new(config.features.clone(), session.start_time());
        for labelled in align_samples(session, samples) {
            let features = extractor.push(&labelled.sample);
            if !features.has_variability() || !features.is_finite() {
                continue;
            }
            let idx = labelled.actual.index();
            acc.cv[idx].push(features.cv);
            acc.rmssd[idx].push(features.rmssd);
        }
        acc
    }

    pub fn merge(mut self, other: Self) -> Self {
        for idx in 0..Stage::COUNT {
            self.cv[idx].extend_from_slice(&other.cv[idx]);
            self.rmssd[idx].extend_from_slice(&other.rmssd[idx]);
        }
        self.sessions += other.sessions;
        self
    }
}

/// Viterbi decoder with Gaussian emissions
#[derive(Debug, Clone, PartialEq)]
pub struct HmmDecoder {
    config: HmmConfig,
    sleep_latency_minutes: f64,
    cycle_minutes: f64,
    emissions: [StageEmission; 3],
}

impl HmmDecoder {
    /// Decoder with the configured default emissions
    pub fn new(config: &ClassifierConfig) -> Self {
        Self::with_emissions(config, config.hmm.default_emissions)
    }

    pub fn with_emissions(config: &ClassifierConfig, emissions: [StageEmission; 3]) -> Self {
        Self {
            config: config.hmm.clone(),
            sleep_latency_minutes: config.rem_propensity.sleep_latency_minutes,
            cycle_minutes: config.rem_propensity.cycle_minutes,
            emissions,
        }
    }

    /// Learn emission parameters from labelled sessions.
    ///
    /// Stages with fewer than `min_observations` observations keep the
    /// configured defaults.
    pub fn learn(
        config: &ClassifierConfig,
        sessions: &[Session],
        samples: &[HeartRateSample],
    ) -> (Self, EmissionReport) {
        let min_records = config.min_session_records;
        let skipped = sessions.iter().filter(|s| s.len() < min_records).count();

        let acc = sessions
            .par_iter()
            .filter(|s| s.len() >= min_records)
            .map(|s| EmissionAccumulator::observe_session(s, samples, config))
            .reduce(EmissionAccumulator::default, EmissionAccumulator::merge);

        let hmm = &config.hmm;
        let mut emissions = hmm.default_emissions;
        let mut stages = Vec::with_capacity(Stage::COUNT);

        for stage in Stage::ALL {
            let idx = stage.index();
            let observations = acc.cv[idx].len();
            let source = if observations >= hmm.min_observations {
                emissions[idx] = StageEmission {
                    cv: fit_gaussian(&acc.cv[idx], hmm.cv_std_floor),
                    rmssd: fit_gaussian(&acc.rmssd[idx], hmm.rmssd_std_floor),
                };
                ParameterSource::Learned
            } else {
                tracing::warn!(
                    stage = %stage,
                    observations,
                    required = hmm.min_observations,
                    "too few observations, emission defaults kept"
                );
                ParameterSource::Defaulted
            };
            tracing::debug!(
                stage = %stage,
                cv_mean = emissions[idx].cv.mean,
                cv_std = emissions[idx].cv.std_dev,
                rmssd_mean = emissions[idx].rmssd.mean,
                rmssd_std = emissions[idx].rmssd.std_dev,
                observations,
                "emission parameters"
            );
            stages.push(StageEmissionReport {
                stage,
                observations,
                source,
                emission: emissions[idx],
            });
        }

        let report = EmissionReport {
            sessions_used: acc.sessions,
            sessions_skipped: skipped,
            stages,
        };
        (Self::with_emissions(config, emissions), report)
    }

    pub fn emissions(&self) -> &[StageEmission; 3] {
        &self.emissions
    }

    /// REM emission multiplier at `minutes` (1.0 for other stages)
    pub fn time_factor(&self, stage: Stage, minutes: f64) -> f64 {
        if stage != Stage::Rem {
            return 1.0;
        }
        let hmm = &self.config;
        if !(minutes >= self.sleep_latency_minutes) {
            hmm.rem_pre_latency_factor
        } else if minutes < self.cycle_minutes {
            hmm.rem_first_cycle_factor
        } else {
            let cycle = (minutes / self.cycle_minutes).floor();
            (hmm.rem_cycle_base + cycle * hmm.rem_cycle_growth).min(hmm.rem_cycle_cap)
        }
    }

    /// Log emission probability of `features` under `stage`.
    ///
    /// Non-finite features emit uniformly (log probability 0 for every stage).
    pub fn emission_log_prob(&self, stage: Stage, features: &SampleFeatures) -> f64 {
        if !features.is_finite() {
            return 0.0;
        }
        let emission = &self.emissions[stage.index()];
        let floor = self.config.density_std_floor;
        let p = gaussian_pdf(features.cv, &emission.cv, floor)
            * gaussian_pdf(features.rmssd, &emission.rmssd, floor)
            * self.time_factor(stage, features.elapsed_minutes);
        (p + self.config.log_epsilon).ln()
    }

    /// Most likely stage sequence for a whole session
    pub fn decode(&self, observations: &[SampleFeatures]) -> Vec<Stage> {
        let Some(first) = observations.first() else {
            return Vec::new();
        };
        let eps = self.config.log_epsilon;
        let log_trans: Vec<[f64; 3]> = Stage::ALL
            .iter()
            .map(|from| {
                let row = self.config.transitions.row(*from);
                [(row[0] + eps).ln(), (row[1] + eps).ln(), (row[2] + eps).ln()]
            })
            .collect();

        let non_finite = observations.iter().filter(|o| !o.is_finite()).count();
        if non_finite > 0 {
            tracing::warn!(non_finite, "non-finite features decoded with uniform emissions");
        }

        let mut scores = [0.0; 3];
        for stage in Stage::ALL {
            scores[stage.index()] = (self.config.initial_probabilities[stage.index()] + eps).ln()
                + self.emission_log_prob(stage, first);
        }

        let mut backpointers: Vec<[usize; 3]> =
            Vec::with_capacity(observations.len().saturating_sub(1));
        for obs in &observations[1..] {
            let mut next = [f64::NEG_INFINITY; 3];
            let mut pointers = [Stage::Nrem.index(); 3];
            for curr in Stage::ALL {
                let (best_prev, best_score) = best_by_priority(|prev| {
                    scores[prev.index()] + log_trans[prev.index()][curr.index()]
                });
                next[curr.index()] = best_score + self.emission_log_prob(curr, obs);
                pointers[curr.index()] = best_prev.index();
            }
            scores = next;
            backpointers.push(pointers);
        }

        let (last, _) = best_by_priority(|s| scores[s.index()]);
        let mut path = Vec::with_capacity(observations.len());
        let mut state = last.index();
        path.push(last);
        for pointers in backpointers.iter().rev() {
            state = pointers[state];
            path.push(Stage::from_index(state).unwrap_or(Stage::Nrem));
        }
        path.reverse();
        path
    }
}

/// Argmax over stages in priority order; ties keep the earlier stage
fn best_by_priority(score: impl Fn(Stage) -> f64) -> (Stage, f64) {
    let mut best = (Stage::PRIORITY[0], score(Stage::PRIORITY[0]));
    for stage in &Stage::PRIORITY[1..] {
        let s = score(*stage);
        if s > best.1 {
            best = (*stage, s);
        }
    }
    best
}

fn gaussian_pdf(x: f64, g: &Gaussian, std_floor: f64) -> f64 {
    let sigma = g.std_dev.max(std_floor);
    let z = (x - g.mean) / sigma;
    (-0.5 * z * z).exp() / (sigma * (2.0 * PI).sqrt())
}

/// Mean and floored sample standard deviation
fn fit_gaussian(values: &[f64], std_floor: f64) -> Gaussian {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let std_dev = if values.len() > 1 {
        (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
    } else {
        0.0
    };
    Gaussian::new(mean, std_dev.max(std_floor))
}
