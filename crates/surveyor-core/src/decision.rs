//! The canonical decision record returned to callers and logged for learning.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bandit::{Arm, CriticVerdict, DecisionRule};
use crate::conformal::CalibrationResult;
use crate::fusion::FusionResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub assessment_id: Uuid,
    /// Arm to enact. Always `escalate` when shadow mode applied.
    pub arm: Arm,
    /// Arm chosen by the decision rule before any shadow override.
    pub underlying_arm: Arm,
    pub rule: DecisionRule,
    pub reason: String,
    pub safety_ucb: f64,
    pub reward_ucb: f64,
    pub cp_stratum: String,
    pub cp_prediction_set: (f64, f64),
    pub cp_uncalibrated: bool,
    pub fusion_mean: f64,
    pub fusion_variance: f64,
    pub exploration: bool,
    pub shadow_mode_applied: bool,
    pub decided_at_ms: u64,
}

impl Decision {
    pub(crate) fn from_verdict(
        assessment_id: Uuid,
        verdict: &CriticVerdict,
        calibration: &CalibrationResult,
        fusion: &FusionResult,
    ) -> Self {
        Self {
            assessment_id,
            arm: verdict.arm,
            underlying_arm: verdict.arm,
            rule: verdict.rule,
            reason: verdict.rule.reason().to_string(),
            safety_ucb: verdict.score.safety_ucb(),
            reward_ucb: verdict.score.reward_ucb(),
            cp_stratum: calibration.stratum.clone(),
            cp_prediction_set: calibration.prediction_set,
            cp_uncalibrated: calibration.uncalibrated,
            fusion_mean: fusion.mean,
            fusion_variance: fusion.variance,
            exploration: verdict.exploration,
            shadow_mode_applied: false,
            decided_at_ms: crate::unix_millis(),
        }
    }

    /// Escalation produced when an assessment could not be evaluated.
    /// Both bounds are reported as 0 and `rule` is `Failure`.
    pub fn failed(assessment_id: Uuid, stratum: &str, error: &str) -> Self {
        Self {
            assessment_id,
            arm: Arm::Escalate,
            underlying_arm: Arm::Escalate,
            rule: DecisionRule::Failure,
            reason: format!("{}: {error}", DecisionRule::Failure.reason()),
            safety_ucb: 0.0,
            reward_ucb: 0.0,
            cp_stratum: stratum.to_string(),
            cp_prediction_set: (0.0, 1.0),
            cp_uncalibrated: true,
            fusion_mean: 0.0,
            fusion_variance: 0.0,
            exploration: false,
            shadow_mode_applied: false,
            decided_at_ms: crate::unix_millis(),
        }
    }

    pub fn is_automated(&self) -> bool {
        self.arm == Arm::Automate
    }
}
