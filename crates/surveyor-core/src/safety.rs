//! Per-stratum false-negative-rate monitor.
//!
//! Only automated decisions carry automation risk, so escalations never move
//! the counters. A stratum with no automation history reports an FNR of 0:
//! it has not yet shown risk, and the critic's reward-confidence and
//! calibration gates are what keep it from being trusted early.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::bandit::Arm;
use crate::store::FnrRecord;

/// Default FNR at or above which automation is vetoed.
pub const FNR_LIMIT: f64 = 0.05;

/// Counters for one stratum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FnrState {
    pub total_automated: u64,
    pub false_negatives: u64,
}

impl FnrState {
    pub fn fnr(&self) -> f64 {
        if self.total_automated == 0 {
            0.0
        } else {
            self.false_negatives as f64 / self.total_automated as f64
        }
    }
}

/// Thread-safe FNR tracker.
#[derive(Default)]
pub struct FnrTracker {
    strata: RwLock<HashMap<String, FnrState>>,
}

impl FnrTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of an enacted decision.
    ///
    /// `judgment_flagged` is whether the machine judgment flagged the hazard;
    /// a present hazard that was not flagged is a miss. Returns the stratum's
    /// state after the update.
    pub fn record_outcome(
        &self,
        stratum: &str,
        arm: Arm,
        critical_hazard_present: bool,
        judgment_flagged: bool,
    ) -> FnrState {
        let mut strata = self.strata.write().unwrap_or_else(PoisonError::into_inner);
        let state = strata.entry(stratum.to_string()).or_default();
        if arm == Arm::Automate {
            state.total_automated += 1;
            if critical_hazard_present && !judgment_flagged {
                state.false_negatives += 1;
                log::warn!(
                    "automated false negative in stratum '{stratum}' (fnr now {:.4})",
                    state.fnr()
                );
            }
        }
        *state
    }

    pub fn state(&self, stratum: &str) -> FnrState {
        let strata = self.strata.read().unwrap_or_else(PoisonError::into_inner);
        strata.get(stratum).copied().unwrap_or_default()
    }

    /// FNR for `stratum`; exactly 0 when nothing has been automated.
    pub fn fnr(&self, stratum: &str) -> f64 {
        self.state(stratum).fnr()
    }

    pub fn snapshot(&self, stratum: &str) -> FnrRecord {
        let s = self.state(stratum);
        FnrRecord {
            stratum: stratum.to_string(),
            total_automated: s.total_automated,
            false_negatives: s.false_negatives,
        }
    }

    pub fn snapshots(&self) -> Vec<FnrRecord> {
        let strata = self.strata.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<FnrRecord> = strata
            .iter()
            .map(|(k, s)| FnrRecord {
                stratum: k.clone(),
                total_automated: s.total_automated,
                false_negatives: s.false_negatives,
            })
            .collect();
        out.sort_by(|a, b| a.stratum.cmp(&b.stratum));
        out
    }

    /// Replace a stratum's counters. Records with more false negatives than
    /// automated decisions are clamped so `fnr` stays within [0, 1].
    pub fn restore(&self, record: &FnrRecord) {
        let mut strata = self.strata.write().unwrap_or_else(PoisonError::into_inner);
        strata.insert(
            record.stratum.clone(),
            FnrState {
                total_automated: record.total_automated,
                false_negatives: record.false_negatives.min(record.total_automated),
            },
        );
    }
}
