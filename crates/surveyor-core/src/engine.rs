//! The decision engine: one owned object holding all shared state.
//!
//! ```text
//! evaluate:   evidence ─► fuse ─► calibrate ─► context ─► critic.decide ─► shadow ─► Decision
//!                                                   │
//!                                                   └─► pending[assessment_id]
//!
//! feedback:   OutcomeReport ─► pending lookup ─► calibrator.record
//!                                             ─► critic.update (RLS)
//!                                             ─► fnr.record_outcome
//!                                             ─► stores
//! ```
//!
//! Evaluations only take read locks. Feedback is serialized through a single
//! mutex so updates for a stratum apply in report order; the model update is
//! computed on a copy and swapped in only once every fallible step has
//! succeeded.
//!
//! Per outcome, the stores see one log line and one FNR record. Calibration
//! pools are checkpointed every `calibrationCheckpointEvery` outcomes, and a
//! restore replays the log tail each checkpoint does not cover.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bandit::{Arm, BanditModel, SafeBanditCritic};
use crate::config::EngineConfig;
use crate::conformal::MondrianCalibrator;
use crate::context::{self, ContextVector, SituationalFeatures};
use crate::decision::Decision;
use crate::error::{EngineError, Result};
use crate::fusion::{self, EvidenceSample, SourceWeights};
use crate::safety::{FnrState, FnrTracker};
use crate::shadow::apply_shadow;
use crate::store::{EngineStores, ModelSnapshot};

/// What the engine remembers about an evaluated, not yet labelled assessment.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingAssessment {
    pub stratum: String,
    pub context: ContextVector,
    pub fusion_mean: f64,
    /// Whether the machine judgment flagged a hazard.
    pub judgment_flagged: bool,
    pub underlying_arm: Arm,
}

/// A labelled outcome for a previously evaluated assessment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeReport {
    pub assessment_id: Uuid,
    pub stratum: String,
    /// The arm the caller actually enacted.
    pub decision_arm: Arm,
    pub actual_outcome: bool,
    pub critical_hazard_present: bool,
}

/// Result of applying one [`OutcomeReport`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackSummary {
    pub assessment_id: Uuid,
    pub stratum: String,
    pub reward: f64,
    pub safety_violation: bool,
    pub fnr: FnrState,
    pub calibration_samples: usize,
    pub observation_count: u64,
    pub model_version: u64,
    /// False when a store write failed; in-memory state is still updated.
    pub persisted: bool,
}

/// Per-stratum view for audits and the HTTP surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StratumSummary {
    pub stratum: String,
    pub sample_count: usize,
    pub calibrated: bool,
    pub total_automated: u64,
    pub false_negatives: u64,
    pub fnr: f64,
    pub automation_vetoed: bool,
}

/// Insertion-ordered, bounded map of pending assessments.
struct PendingTable {
    entries: HashMap<Uuid, PendingAssessment>,
    order: VecDeque<Uuid>,
    capacity: usize,
}

impl PendingTable {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn insert(&mut self, id: Uuid, pending: PendingAssessment) {
        while self.entries.len() >= self.capacity {
            match self.order.pop_front() {
                Some(old) => {
                    if self.entries.remove(&old).is_some() {
                        log::debug!("pending table full, evicted {old}");
                    }
                }
                None => break,
            }
        }
        self.entries.insert(id, pending);
        self.order.push_back(id);
        // Labelled ids leave stale entries in `order`; compact occasionally.
        if self.order.len() > self.capacity.saturating_mul(2) {
            let entries = &self.entries;
            self.order.retain(|id| entries.contains_key(id));
        }
    }

    fn get(&self, id: &Uuid) -> Option<&PendingAssessment> {
        self.entries.get(id)
    }

    fn remove(&mut self, id: &Uuid) -> Option<PendingAssessment> {
        self.entries.remove(id)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Writer-side bookkeeping, guarded by the feedback mutex.
struct FeedbackState {
    model_version: u64,
    updates_since_snapshot: u64,
    /// Records in the calibration store's append log.
    log_len: u64,
    /// Strata whose pool changed since their last checkpoint.
    dirty_strata: HashSet<String>,
    outcomes_since_checkpoint: u64,
}

pub struct DecisionEngine {
    config: EngineConfig,
    weights: SourceWeights,
    calibrator: MondrianCalibrator,
    critic: RwLock<SafeBanditCritic>,
    fnr: FnrTracker,
    pending: Mutex<PendingTable>,
    feedback: Mutex<FeedbackState>,
    stores: EngineStores,
}

impl DecisionEngine {
    /// Engine with in-memory stores and a fresh `λ·I` model.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::build(config, EngineStores::memory())
    }

    /// Engine backed by `stores`, restoring whatever state they hold.
    ///
    /// A model snapshot that fails validation is an error rather than a
    /// silent reset: an operator should decide whether to discard it.
    pub fn with_stores(config: EngineConfig, stores: EngineStores) -> Result<Self> {
        let engine = Self::build(config, stores)?;
        engine.restore()?;
        Ok(engine)
    }

    fn build(config: EngineConfig, stores: EngineStores) -> Result<Self> {
        config.validate()?;
        let model = BanditModel::new(
            config.ridge_lambda,
            config.reward_confidence_beta,
            config.safety_confidence_gamma,
        )?;
        Ok(Self {
            weights: config.source_weights()?,
            calibrator: MondrianCalibrator::new(
                config.min_calibration_samples,
                config.calibration_window,
            ),
            critic: RwLock::new(SafeBanditCritic::new(model, config.critic_params())),
            fnr: FnrTracker::new(),
            pending: Mutex::new(PendingTable::new(config.max_pending)),
            feedback: Mutex::new(FeedbackState {
                model_version: 0,
                updates_since_snapshot: 0,
                log_len: 0,
                dirty_strata: HashSet::new(),
                outcomes_since_checkpoint: 0,
            }),
            stores,
            config,
        })
    }

    fn restore(&self) -> Result<()> {
        let mut feedback = self.feedback.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(snapshot) = self.stores.model.load_latest()? {
            let mut model = BanditModel::from_snapshot(&snapshot)?;
            // Confidence multipliers are operator settings, not learned state.
            model.beta = self.config.reward_confidence_beta;
            model.gamma = self.config.safety_confidence_gamma;
            log::info!(
                "restored model v{} ({} observations)",
                snapshot.version,
                model.observation_count
            );
            self.critic
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .replace_model(model);
            feedback.model_version = snapshot.version;
        }

        let checkpoints = self.stores.calibration.load_all()?;
        let mut offsets: HashMap<&str, u64> = HashMap::new();
        for record in &checkpoints {
            self.calibrator.restore(record)?;
            offsets.insert(record.stratum.as_str(), record.log_offset);
        }
        let log = self.stores.calibration.load_log()?;
        let log_len = log.len() as u64;
        if let Some((stratum, offset)) = offsets.iter().find(|&(_, &o)| o > log_len) {
            log::warn!(
                "checkpoint for '{stratum}' covers {offset} records but the log holds {log_len}"
            );
        }
        let mut replayed = 0usize;
        for (i, record) in log.iter().enumerate() {
            let offset = offsets.get(record.stratum.as_str()).copied().unwrap_or(0);
            if i as u64 >= offset {
                self.calibrator.replay(record)?;
                feedback.dirty_strata.insert(record.stratum.clone());
                replayed += 1;
            }
        }
        feedback.log_len = log_len;

        let fnr = self.stores.fnr.load_all()?;
        for record in &fnr {
            self.fnr.restore(record);
        }
        if !checkpoints.is_empty() || replayed > 0 || !fnr.is_empty() {
            log::info!(
                "restored {} calibration checkpoints (+{replayed} logged outcomes), {} FNR records",
                checkpoints.len(),
                fnr.len()
            );
        }
        Ok(())
    }

    /// Write a checkpoint for every calibration pool changed since its last
    /// one. Runs automatically every `calibrationCheckpointEvery` outcomes.
    pub fn checkpoint(&self) -> Result<()> {
        let mut feedback = self.feedback.lock().unwrap_or_else(PoisonError::into_inner);
        self.save_checkpoints(&mut feedback)
    }

    fn save_checkpoints(&self, feedback: &mut FeedbackState) -> Result<()> {
        let mut first_err = None;
        let strata: Vec<String> = feedback.dirty_strata.drain().collect();
        for stratum in strata {
            let Some(mut record) = self.calibrator.snapshot(&stratum) else {
                continue;
            };
            record.log_offset = feedback.log_len;
            if let Err(e) = self.stores.calibration.save(&record) {
                log::warn!("failed to checkpoint calibration pool '{stratum}': {e}");
                feedback.dirty_strata.insert(stratum);
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        feedback.outcomes_since_checkpoint = 0;
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Evaluate one assessment, propagating per-assessment failures.
    ///
    /// `stratum` overrides the key derived from `features`.
    pub fn try_evaluate(
        &self,
        evidence: &[EvidenceSample],
        features: &SituationalFeatures,
        stratum: Option<&str>,
    ) -> Result<Decision> {
        let stratum = resolve_stratum(features, stratum);
        let fused = fusion::fuse(evidence, &self.weights)?;
        let calibration = self
            .calibrator
            .calibrate(&stratum, fused.mean, self.config.alpha())?;
        let x = context::build_context(&fused, &calibration, features)?;

        let threshold = self
            .config
            .safety_threshold(features.damage_category.as_deref());
        let fnr = self.fnr.fnr(&stratum);
        let verdict = self
            .critic
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .decide(&x, &calibration, threshold, fnr);

        let id = Uuid::new_v4();
        let decision = Decision::from_verdict(id, &verdict, &calibration, &fused);
        log::debug!(
            "{id} [{stratum}] {} ({}): safety_ucb={:.4} reward_ucb={:.4}",
            decision.arm,
            decision.reason,
            decision.safety_ucb,
            decision.reward_ucb
        );

        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                PendingAssessment {
                    stratum,
                    context: x,
                    fusion_mean: fused.mean,
                    judgment_flagged: context::judgment_flags_hazard(&fused, features),
                    underlying_arm: verdict.arm,
                },
            );

        Ok(apply_shadow(decision, self.config.shadow_mode_enabled))
    }

    /// Evaluate one assessment. Never fails: any error yields an escalation.
    pub fn evaluate(
        &self,
        evidence: &[EvidenceSample],
        features: &SituationalFeatures,
        stratum: Option<&str>,
    ) -> Decision {
        match self.try_evaluate(evidence, features, stratum) {
            Ok(decision) => decision,
            Err(e) => {
                let stratum = resolve_stratum(features, stratum);
                log::warn!("evaluation failed in stratum '{stratum}', escalating: {e}");
                let decision = Decision::failed(Uuid::new_v4(), &stratum, &e.to_string());
                apply_shadow(decision, self.config.shadow_mode_enabled)
            }
        }
    }

    /// Apply a labelled outcome to the calibrator, critic and FNR monitor.
    ///
    /// Rejected reports leave every piece of state untouched.
    pub fn submit_outcome(&self, report: &OutcomeReport) -> Result<FeedbackSummary> {
        let mut feedback = self.feedback.lock().unwrap_or_else(PoisonError::into_inner);

        let pending = {
            let table = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            match table.get(&report.assessment_id) {
                Some(p) => p.clone(),
                None => {
                    log::warn!("rejected outcome for unknown assessment {}", report.assessment_id);
                    return Err(EngineError::UnknownAssessment(
                        report.assessment_id.to_string(),
                    ));
                }
            }
        };
        if pending.stratum != report.stratum {
            log::warn!(
                "rejected outcome for {}: stratum '{}' != '{}'",
                report.assessment_id,
                report.stratum,
                pending.stratum
            );
            return Err(EngineError::StratumMismatch {
                expected: pending.stratum,
                got: report.stratum.clone(),
            });
        }

        let missed = report.critical_hazard_present && !pending.judgment_flagged;
        let agrees = pending.judgment_flagged == report.actual_outcome;
        let reward = if agrees && !missed { 1.0 } else { 0.0 };

        // Fallible model step on a copy; committed below.
        let mut critic = self
            .critic
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        critic.update(&pending.context, report.decision_arm, reward, missed)?;

        let conformity = self.calibrator.record(
            &pending.stratum,
            pending.fusion_mean,
            report.actual_outcome,
        )?;
        let observation_count = critic.model().observation_count;
        *self.critic.write().unwrap_or_else(PoisonError::into_inner) = critic;
        let fnr = self.fnr.record_outcome(
            &pending.stratum,
            report.decision_arm,
            report.critical_hazard_present,
            pending.judgment_flagged,
        );
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&report.assessment_id);

        if report.decision_arm != pending.underlying_arm {
            log::debug!(
                "{} enacted {} while the rule chose {}",
                report.assessment_id,
                report.decision_arm,
                pending.underlying_arm
            );
        }

        // Persistence: each table independently; failures are reported in
        // the summary and logged, never rolled back.
        let mut persisted = true;
        let mut note = |what: &str, r: Result<()>| {
            if let Err(e) = r {
                persisted = false;
                log::warn!("failed to persist {what} for '{}': {e}", pending.stratum);
            }
        };
        let appended = self.stores.calibration.append(&conformity);
        if appended.is_ok() {
            feedback.log_len += 1;
        }
        note("conformity record", appended);
        note("FNR record", self.stores.fnr.save(&self.fnr.snapshot(&pending.stratum)));

        feedback.dirty_strata.insert(pending.stratum.clone());
        feedback.outcomes_since_checkpoint += 1;
        if feedback.outcomes_since_checkpoint >= self.config.calibration_checkpoint_every {
            note("calibration checkpoint", self.save_checkpoints(&mut feedback));
        }

        feedback.updates_since_snapshot += 1;
        if feedback.updates_since_snapshot >= self.config.snapshot_every {
            let version = feedback.model_version + 1;
            let snapshot = self.model_snapshot_at(version);
            match self.stores.model.save(&snapshot) {
                Ok(()) => {
                    feedback.model_version = version;
                    feedback.updates_since_snapshot = 0;
                    log::info!("persisted model v{version} ({observation_count} observations)");
                }
                Err(e) => {
                    persisted = false;
                    log::warn!("failed to persist model v{version}: {e}");
                }
            }
        }

        Ok(FeedbackSummary {
            assessment_id: report.assessment_id,
            stratum: pending.stratum.clone(),
            reward,
            safety_violation: missed,
            fnr,
            calibration_samples: self.calibrator.sample_count(&pending.stratum),
            observation_count,
            model_version: feedback.model_version,
            persisted,
        })
    }

    fn model_snapshot_at(&self, version: u64) -> ModelSnapshot {
        self.critic
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .model()
            .to_snapshot(version)
    }

    /// Current model state, tagged with the last persisted version.
    pub fn model_snapshot(&self) -> ModelSnapshot {
        let version = self
            .feedback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .model_version;
        self.model_snapshot_at(version)
    }

    pub fn fnr(&self, stratum: &str) -> FnrState {
        self.fnr.state(stratum)
    }

    pub fn calibration_samples(&self, stratum: &str) -> usize {
        self.calibrator.sample_count(stratum)
    }

    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn pending(&self, id: &Uuid) -> Option<PendingAssessment> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Every stratum seen by the calibrator or the FNR monitor, sorted.
    pub fn strata(&self) -> Vec<StratumSummary> {
        let mut keys: Vec<String> = self
            .calibrator
            .strata()
            .into_iter()
            .map(|(k, _)| k)
            .chain(self.fnr.snapshots().into_iter().map(|r| r.stratum))
            .collect();
        keys.sort();
        keys.dedup();
        let min = self.calibrator.min_samples();
        keys.into_iter()
            .map(|stratum| {
                let samples = self.calibrator.sample_count(&stratum);
                let state = self.fnr.state(&stratum);
                StratumSummary {
                    sample_count: samples,
                    calibrated: samples >= min,
                    total_automated: state.total_automated,
                    false_negatives: state.false_negatives,
                    fnr: state.fnr(),
                    automation_vetoed: state.fnr() >= self.config.fnr_limit,
                    stratum,
                }
            })
            .collect()
    }
}

fn resolve_stratum(features: &SituationalFeatures, stratum: Option<&str>) -> String {
    match stratum {
        Some(s) if !s.trim().is_empty() => s.to_string(),
        _ => context::stratum_key(features),
    }
}
