//! Safe linear contextual bandit critic.
//!
//! Two ridge-regression models over the 12-slot context, both predicting the
//! outcome of choosing **automate**:
//! - reward model `θ` with design matrix `A` (target: automation was correct),
//! - safety model `φ` with design matrix `B` (target: automation would have
//!   missed a critical hazard).
//!
//! Upper confidence bounds:
//!
//! ```text
//!   reward_ucb = θ·x + β·sqrt(xᵀA⁻¹x)
//!   safety_ucb = φ·x + γ·sqrt(xᵀB⁻¹x)
//! ```
//!
//! The decision rule is evaluated strictly in this order, first match wins:
//!
//! | rule | condition                     | arm      |
//! |------|-------------------------------|----------|
//! | a    | `safety_ucb > threshold`      | escalate |
//! | b    | `fnr(stratum) ≥ fnr_limit`    | escalate |
//! | b′   | stratum uncalibrated          | escalate |
//! | c    | `reward_ucb > reward_cutoff`  | automate |
//! | d    | otherwise                     | escalate |
//!
//! Safety always outranks reward. Updates are recursive least squares with
//! Sherman–Morrison inverse maintenance, so each observation costs O(d²) and
//! `A`, `B` stay symmetric positive-definite from their `λ·I` start.

use serde::{Deserialize, Serialize};

use crate::conformal::CalibrationResult;
use crate::context::ContextVector;
use crate::error::{EngineError, Result};
use crate::linalg::{self, DIM, Matrix, Vector};
use crate::store::ModelSnapshot;

/// Action taken for an assessment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arm {
    Automate,
    Escalate,
}

impl std::fmt::Display for Arm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Automate => write!(f, "automate"),
            Self::Escalate => write!(f, "escalate"),
        }
    }
}

impl std::str::FromStr for Arm {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "automate" => Ok(Self::Automate),
            "escalate" => Ok(Self::Escalate),
            other => Err(EngineError::InvalidFeedback(format!("unknown arm '{other}'"))),
        }
    }
}

/// Which rule produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionRule {
    SafetyBound,
    FnrConstraint,
    Uncalibrated,
    RewardFavorable,
    InsufficientReward,
    /// Evaluation failed before the critic ran.
    Failure,
}

impl DecisionRule {
    pub fn arm(self) -> Arm {
        match self {
            Self::RewardFavorable => Arm::Automate,
            _ => Arm::Escalate,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Self::SafetyBound => "safety bound exceeded",
            Self::FnrConstraint => "stratum FNR constraint",
            Self::Uncalibrated => "stratum uncalibrated",
            Self::RewardFavorable => "reward bound favorable",
            Self::InsufficientReward => "insufficient reward confidence",
            Self::Failure => "evaluation failed",
        }
    }
}

/// Point estimates and exploration bonuses for one context.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UcbScore {
    pub reward_point: f64,
    pub reward_bonus: f64,
    pub safety_point: f64,
    pub safety_bonus: f64,
}

impl UcbScore {
    pub fn reward_ucb(&self) -> f64 {
        self.reward_point + self.reward_bonus
    }

    pub fn safety_ucb(&self) -> f64 {
        self.safety_point + self.safety_bonus
    }
}

/// Output of [`SafeBanditCritic::decide`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CriticVerdict {
    pub arm: Arm,
    pub rule: DecisionRule,
    pub score: UcbScore,
    /// The reward bonus dominated the point estimate by more than the margin.
    pub exploration: bool,
}

/// Learned state: one reward model and one safety model.
#[derive(Debug, Clone, PartialEq)]
pub struct BanditModel {
    pub theta: Vector,
    pub phi: Vector,
    pub a: Matrix,
    pub b: Matrix,
    a_inv: Matrix,
    b_inv: Matrix,
    pub beta: f64,
    pub gamma: f64,
    pub lambda: f64,
    pub observation_count: u64,
}

impl BanditModel {
    /// Fresh model with `A = B = λ·I` and zero weights.
    ///
    /// Rejects `λ ≤ 0` here so a singular model can never reach an update.
    pub fn new(lambda: f64, beta: f64, gamma: f64) -> Result<Self> {
        if !lambda.is_finite() || lambda <= 0.0 {
            return Err(EngineError::SingularModel(lambda));
        }
        for (name, v) in [("beta", beta), ("gamma", gamma)] {
            if !v.is_finite() || v < 0.0 {
                return Err(EngineError::InvalidConfig(format!(
                    "{name} must be finite and >= 0, got {v}"
                )));
            }
        }
        Ok(Self {
            theta: linalg::zeros(),
            phi: linalg::zeros(),
            a: linalg::scaled_identity(lambda),
            b: linalg::scaled_identity(lambda),
            a_inv: linalg::scaled_identity(1.0 / lambda),
            b_inv: linalg::scaled_identity(1.0 / lambda),
            beta,
            gamma,
            lambda,
            observation_count: 0,
        })
    }

    pub fn a_inv(&self) -> &Matrix {
        &self.a_inv
    }

    pub fn b_inv(&self) -> &Matrix {
        &self.b_inv
    }

    pub fn score(&self, x: &Vector) -> UcbScore {
        UcbScore {
            reward_point: linalg::dot(&self.theta, x),
            reward_bonus: self.beta * linalg::quad_form(&self.a_inv, x).max(0.0).sqrt(),
            safety_point: linalg::dot(&self.phi, x),
            safety_bonus: self.gamma * linalg::quad_form(&self.b_inv, x).max(0.0).sqrt(),
        }
    }

    /// One RLS step on both models. Inputs are validated before anything is
    /// touched, so a rejected call leaves the model unchanged.
    pub fn update(&mut self, x: &Vector, reward: f64, safety_target: f64) -> Result<()> {
        if x.iter().any(|v| !v.is_finite()) {
            return Err(EngineError::InvalidFeedback(
                "context vector is not finite".to_string(),
            ));
        }
        if !reward.is_finite() || !safety_target.is_finite() {
            return Err(EngineError::InvalidFeedback(format!(
                "reward {reward} / safety target {safety_target} must be finite"
            )));
        }

        rls_step(&mut self.a, &mut self.a_inv, &mut self.theta, x, reward);
        rls_step(&mut self.b, &mut self.b_inv, &mut self.phi, x, safety_target);
        self.observation_count += 1;
        Ok(())
    }

    pub fn to_snapshot(&self, version: u64) -> ModelSnapshot {
        ModelSnapshot {
            theta: self.theta.to_vec(),
            phi: self.phi.to_vec(),
            a: linalg::matrix_to_rows(&self.a),
            b: linalg::matrix_to_rows(&self.b),
            beta: self.beta,
            gamma: self.gamma,
            lambda: self.lambda,
            observation_count: self.observation_count,
            version,
            updated_at: crate::unix_millis(),
        }
    }

    /// Rebuild from a persisted snapshot, validating dimensions and
    /// positive-definiteness. Inverses are recomputed from `A` and `B`.
    pub fn from_snapshot(snapshot: &ModelSnapshot) -> Result<Self> {
        let mut model = Self::new(snapshot.lambda, snapshot.beta, snapshot.gamma)?;
        model.theta = linalg::vector_from_slice("theta", &snapshot.theta)?;
        model.phi = linalg::vector_from_slice("phi", &snapshot.phi)?;
        model.a = linalg::matrix_from_rows("A", &snapshot.a)?;
        model.b = linalg::matrix_from_rows("B", &snapshot.b)?;
        if model.theta.iter().chain(model.phi.iter()).any(|v| !v.is_finite()) {
            return Err(EngineError::Store("model weights are not finite".to_string()));
        }
        for (name, m) in [("A", &model.a), ("B", &model.b)] {
            if !linalg::is_symmetric(m, 1e-9) {
                return Err(EngineError::Store(format!("{name} is not symmetric")));
            }
        }
        model.a_inv = linalg::invert_spd(&model.a)
            .ok_or_else(|| EngineError::Store("A is not positive-definite".to_string()))?;
        model.b_inv = linalg::invert_spd(&model.b)
            .ok_or_else(|| EngineError::Store("B is not positive-definite".to_string()))?;
        model.observation_count = snapshot.observation_count;
        Ok(model)
    }
}

/// `M ← M + xxᵀ`, `M⁻¹` by Sherman–Morrison, `w ← w + M⁻¹x(y − w·x)`.
fn rls_step(m: &mut Matrix, m_inv: &mut Matrix, w: &mut Vector, x: &Vector, y: f64) {
    let err = y - linalg::dot(w, x);
    linalg::add_outer(m, x);
    linalg::sherman_morrison(m_inv, x);
    let gain = linalg::mat_vec(m_inv, x);
    for (wi, gi) in w.iter_mut().zip(gain.iter()) {
        *wi += gi * err;
    }
}

/// Critic settings that are not part of the learned state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CriticParams {
    pub fnr_limit: f64,
    pub reward_threshold: f64,
    pub exploration_margin: f64,
}

impl Default for CriticParams {
    fn default() -> Self {
        Self {
            fnr_limit: 0.05,
            reward_threshold: 0.5,
            exploration_margin: 0.1,
        }
    }
}

/// The bandit model plus the safety-first decision rule.
#[derive(Debug, Clone)]
pub struct SafeBanditCritic {
    model: BanditModel,
    params: CriticParams,
}

impl SafeBanditCritic {
    pub fn new(model: BanditModel, params: CriticParams) -> Self {
        Self { model, params }
    }

    pub fn model(&self) -> &BanditModel {
        &self.model
    }

    pub fn params(&self) -> CriticParams {
        self.params
    }

    pub fn replace_model(&mut self, model: BanditModel) {
        self.model = model;
    }

    pub fn score(&self, x: &ContextVector) -> UcbScore {
        self.model.score(x.as_array())
    }

    /// Apply the ordered decision rule. Read-only.
    pub fn decide(
        &self,
        x: &ContextVector,
        calibration: &CalibrationResult,
        safety_threshold: f64,
        fnr: f64,
    ) -> CriticVerdict {
        let score = self.score(x);

        let rule = if score.safety_ucb() > safety_threshold {
            DecisionRule::SafetyBound
        } else if fnr >= self.params.fnr_limit {
            DecisionRule::FnrConstraint
        } else if calibration.uncalibrated {
            DecisionRule::Uncalibrated
        } else if score.reward_ucb() > self.params.reward_threshold {
            DecisionRule::RewardFavorable
        } else {
            DecisionRule::InsufficientReward
        };

        let exploration =
            score.reward_bonus > score.reward_point.abs() + self.params.exploration_margin;

        CriticVerdict {
            arm: rule.arm(),
            rule,
            score,
            exploration,
        }
    }

    /// RLS update from a labelled outcome.
    ///
    /// Both models predict what automation would have yielded, so both learn
    /// from every label regardless of the arm that was enacted; `arm` is kept
    /// for logging.
    pub fn update(
        &mut self,
        x: &ContextVector,
        arm: Arm,
        reward: f64,
        safety_violation: bool,
    ) -> Result<()> {
        let target = if safety_violation { 1.0 } else { 0.0 };
        self.model.update(x.as_array(), reward, target)?;
        log::debug!(
            "critic update #{} (arm={arm}, reward={reward:.3}, violation={safety_violation})",
            self.model.observation_count
        );
        Ok(())
    }
}
