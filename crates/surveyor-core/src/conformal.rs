//! Mondrian (per-stratum) split conformal calibration.
//!
//! Each stratum owns a pool of conformity scores `|predicted − actual|`.
//! Given a new prediction `p` and miscoverage `α`, the calibrated set is
//! `[p − q, p + q] ∩ [0, 1]` where `q` is the finite-sample conformal
//! quantile of the stratum's scores:
//!
//! ```text
//!   k = ceil((n + 1) · (1 − α)),  clamped to [1, n]
//!   q = s_(k)                     (k-th smallest score, nearest rank)
//! ```
//!
//! For exchangeable calibration pairs this gives `P(y ∈ set) ≥ 1 − α`.
//! Strata with fewer than `min_samples` scores are *uncalibrated*: they get
//! the full `[0, 1]` interval and must not authorize automation.
//!
//! Stratum keys are opaque; the calibrator never parses them.

use std::collections::{HashMap, VecDeque};
use std::sync::{OnceLock, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::store::CalibrationRecord;

/// Default minimum pool size before a stratum counts as calibrated.
pub const MIN_SAMPLES: usize = 100;

/// One labelled outcome, as emitted to the calibration sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConformityRecord {
    pub stratum: String,
    pub predicted_probability: f64,
    pub actual_outcome: bool,
    pub conformity_score: f64,
    pub timestamp_ms: u64,
}

/// Calibrated interval for one prediction. Derived on demand, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationResult {
    pub stratum: String,
    pub prediction_set: (f64, f64),
    pub coverage_level: f64,
    pub sample_count: usize,
    /// Conformal quantile used; `None` when uncalibrated.
    pub quantile: Option<f64>,
    pub uncalibrated: bool,
}

impl CalibrationResult {
    pub fn width(&self) -> f64 {
        self.prediction_set.1 - self.prediction_set.0
    }

    pub fn contains(&self, outcome: bool) -> bool {
        let y = if outcome { 1.0 } else { 0.0 };
        self.prediction_set.0 <= y && y <= self.prediction_set.1
    }
}

/// Finite-sample nearest-rank conformal quantile of an ascending slice.
///
/// Returns `None` for an empty slice.
pub fn conformal_quantile(sorted: &[f64], alpha: f64) -> Option<f64> {
    let n = sorted.len();
    if n == 0 {
        return None;
    }
    let rank = ((n as f64 + 1.0) * (1.0 - alpha)).ceil() as usize;
    let k = rank.clamp(1, n);
    Some(sorted[k - 1])
}

#[derive(Default)]
struct StratumPool {
    scores: VecDeque<f64>,
    /// Ascending copy of `scores`, built on first `calibrate` after a change.
    sorted: OnceLock<Vec<f64>>,
}

impl StratumPool {
    fn push(&mut self, score: f64, window: usize) {
        self.scores.push_back(score);
        while self.scores.len() > window {
            self.scores.pop_front();
        }
        self.sorted = OnceLock::new();
    }

    fn sorted(&self) -> &[f64] {
        self.sorted.get_or_init(|| {
            let mut v: Vec<f64> = self.scores.iter().copied().collect();
            v.sort_by(f64::total_cmp);
            v
        })
    }
}

/// Thread-safe per-stratum conformal calibrator.
pub struct MondrianCalibrator {
    pools: RwLock<HashMap<String, StratumPool>>,
    min_samples: usize,
    window: usize,
}

impl MondrianCalibrator {
    /// `window` bounds how many recent scores each stratum keeps.
    pub fn new(min_samples: usize, window: usize) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            min_samples,
            window: window.max(1),
        }
    }

    pub fn min_samples(&self) -> usize {
        self.min_samples
    }

    /// Calibrated interval around `predicted` at miscoverage `alpha`.
    pub fn calibrate(&self, stratum: &str, predicted: f64, alpha: f64) -> Result<CalibrationResult> {
        if !predicted.is_finite() || !(0.0..=1.0).contains(&predicted) {
            return Err(EngineError::MalformedFeatures(format!(
                "predicted probability must be in [0, 1], got {predicted}"
            )));
        }
        if !alpha.is_finite() || alpha <= 0.0 || alpha >= 1.0 {
            return Err(EngineError::InvalidConfig(format!(
                "miscoverage alpha must be in (0, 1), got {alpha}"
            )));
        }

        let pools = self.pools.read().unwrap_or_else(PoisonError::into_inner);
        let pool = pools.get(stratum);
        let n = pool.map_or(0, |p| p.scores.len());

        if n < self.min_samples || n == 0 {
            return Ok(CalibrationResult {
                stratum: stratum.to_string(),
                prediction_set: (0.0, 1.0),
                coverage_level: 1.0 - alpha,
                sample_count: n,
                quantile: None,
                uncalibrated: true,
            });
        }

        let q = pool.and_then(|p| conformal_quantile(p.sorted(), alpha));
        let set = match q {
            Some(q) => ((predicted - q).clamp(0.0, 1.0), (predicted + q).clamp(0.0, 1.0)),
            None => (0.0, 1.0),
        };
        Ok(CalibrationResult {
            stratum: stratum.to_string(),
            prediction_set: set,
            coverage_level: 1.0 - alpha,
            sample_count: n,
            quantile: q,
            uncalibrated: false,
        })
    }

    /// Append a labelled outcome to the stratum's pool. The sorted view is
    /// rebuilt lazily on the next [`calibrate`](Self::calibrate).
    pub fn record(&self, stratum: &str, predicted: f64, actual: bool) -> Result<ConformityRecord> {
        if !predicted.is_finite() || !(0.0..=1.0).contains(&predicted) {
            return Err(EngineError::InvalidFeedback(format!(
                "predicted probability must be in [0, 1], got {predicted}"
            )));
        }
        let y = if actual { 1.0 } else { 0.0 };
        let score = (predicted - y).abs();

        let mut pools = self.pools.write().unwrap_or_else(PoisonError::into_inner);
        pools
            .entry(stratum.to_string())
            .or_default()
            .push(score, self.window);

        Ok(ConformityRecord {
            stratum: stratum.to_string(),
            predicted_probability: predicted,
            actual_outcome: actual,
            conformity_score: score,
            timestamp_ms: crate::unix_millis(),
        })
    }

    pub fn sample_count(&self, stratum: &str) -> usize {
        let pools = self.pools.read().unwrap_or_else(PoisonError::into_inner);
        pools.get(stratum).map_or(0, |p| p.scores.len())
    }

    /// Known strata with their pool sizes, sorted by key.
    pub fn strata(&self) -> Vec<(String, usize)> {
        let pools = self.pools.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<_> = pools
            .iter()
            .map(|(k, p)| (k.clone(), p.scores.len()))
            .collect();
        out.sort();
        out
    }

    pub fn snapshot(&self, stratum: &str) -> Option<CalibrationRecord> {
        let pools = self.pools.read().unwrap_or_else(PoisonError::into_inner);
        pools.get(stratum).map(|p| CalibrationRecord {
            stratum: stratum.to_string(),
            conformity_scores: p.scores.iter().copied().collect(),
            sample_count: p.scores.len(),
            log_offset: 0,
        })
    }

    pub fn snapshots(&self) -> Vec<CalibrationRecord> {
        self.strata()
            .into_iter()
            .filter_map(|(k, _)| self.snapshot(&k))
            .collect()
    }

    /// Replace a stratum's pool with a persisted record.
    pub fn restore(&self, record: &CalibrationRecord) -> Result<()> {
        if let Some(&bad) = record.conformity_scores.iter().find(|&&s| !valid_score(s)) {
            return Err(EngineError::Store(format!(
                "calibration record '{}' holds invalid score {bad}",
                record.stratum
            )));
        }
        let mut pool = StratumPool::default();
        for &s in &record.conformity_scores {
            pool.push(s, self.window);
        }
        let mut pools = self.pools.write().unwrap_or_else(PoisonError::into_inner);
        pools.insert(record.stratum.clone(), pool);
        Ok(())
    }

    /// Re-apply a logged outcome without recomputing its score.
    pub fn replay(&self, record: &ConformityRecord) -> Result<()> {
        if !valid_score(record.conformity_score) {
            return Err(EngineError::Store(format!(
                "conformity record for '{}' holds invalid score {}",
                record.stratum, record.conformity_score
            )));
        }
        let mut pools = self.pools.write().unwrap_or_else(PoisonError::into_inner);
        pools
            .entry(record.stratum.clone())
            .or_default()
            .push(record.conformity_score, self.window);
        Ok(())
    }
}

fn valid_score(s: f64) -> bool {
    s.is_finite() && (0.0..=1.0).contains(&s)
}
