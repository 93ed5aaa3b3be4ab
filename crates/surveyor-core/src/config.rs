//! Engine configuration: one typed struct, validated eagerly.
//!
//! Loaded from JSON with camelCase keys; every field has a default so a
//! partial document is valid:
//!
//! ```json
//! { "shadowModeEnabled": true, "ridgeLambda": 1.0,
//!   "safetyThresholdByCategory": { "structural": 0.02 },
//!   "sourceWeightsPath": "fusion_weights.json" }
//! ```
//!
//! `sourceWeightsPath` names a trained-weights file; entries in
//! `sourceWeights` override it per source. A relative path is resolved
//! against the directory of the config file it came from.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::bandit::CriticParams;
use crate::error::{EngineError, Result};
use crate::fusion::SourceWeights;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Compute and log decisions but always enact `escalate`.
    pub shadow_mode_enabled: bool,
    /// Safety-UCB ceiling per damage category.
    pub safety_threshold_by_category: HashMap<String, f64>,
    /// Ceiling for categories absent from the map.
    pub default_safety_threshold: f64,
    pub min_calibration_samples: usize,
    /// Target conformal coverage `1 − α`.
    pub coverage_level: f64,
    pub reward_confidence_beta: f64,
    pub safety_confidence_gamma: f64,
    /// Ridge regularization; must be > 0.
    pub ridge_lambda: f64,
    pub fnr_limit: f64,
    pub reward_threshold: f64,
    pub exploration_margin: f64,
    /// Most recent conformity scores kept per stratum.
    pub calibration_window: usize,
    /// Evaluated-but-unlabelled assessments kept for feedback.
    pub max_pending: usize,
    /// Persist a model snapshot every N updates.
    pub snapshot_every: u64,
    /// Checkpoint changed calibration pools every N outcomes; outcomes in
    /// between are recovered from the append log.
    pub calibration_checkpoint_every: u64,
    pub source_weights: HashMap<String, f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_weights_path: Option<PathBuf>,
    pub default_source_weight: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shadow_mode_enabled: false,
            safety_threshold_by_category: HashMap::new(),
            default_safety_threshold: 0.1,
            min_calibration_samples: crate::conformal::MIN_SAMPLES,
            coverage_level: 0.95,
            reward_confidence_beta: 1.0,
            safety_confidence_gamma: 1.0,
            ridge_lambda: 1.0,
            fnr_limit: crate::safety::FNR_LIMIT,
            reward_threshold: 0.5,
            exploration_margin: 0.1,
            calibration_window: 10_000,
            max_pending: 100_000,
            snapshot_every: 1,
            calibration_checkpoint_every: 1_000,
            source_weights: HashMap::new(),
            source_weights_path: None,
            default_source_weight: 1.0,
        }
    }
}

fn invalid(msg: String) -> EngineError {
    EngineError::InvalidConfig(msg)
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(json).map_err(|e| invalid(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| invalid(format!("{}: {e}", path.display())))?;
        let mut cfg: Self = serde_json::from_str(&json)
            .map_err(|e| invalid(format!("{}: {e}", path.display())))?;
        if let (Some(weights), Some(base)) = (&cfg.source_weights_path, path.parent()) {
            if weights.is_relative() {
                cfg.source_weights_path = Some(base.join(weights));
            }
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject every value that would make the engine unsafe or singular.
    pub fn validate(&self) -> Result<()> {
        if !self.ridge_lambda.is_finite() || self.ridge_lambda <= 0.0 {
            return Err(EngineError::SingularModel(self.ridge_lambda));
        }
        if !(self.coverage_level > 0.0 && self.coverage_level < 1.0) {
            return Err(invalid(format!(
                "coverageLevel must be in (0, 1), got {}",
                self.coverage_level
            )));
        }
        if self.min_calibration_samples == 0 {
            return Err(invalid("minCalibrationSamples must be >= 1".to_string()));
        }
        if self.calibration_window < self.min_calibration_samples {
            return Err(invalid(format!(
                "calibrationWindow ({}) must be >= minCalibrationSamples ({})",
                self.calibration_window, self.min_calibration_samples
            )));
        }
        for (name, v) in [
            ("rewardConfidenceBeta", self.reward_confidence_beta),
            ("safetyConfidenceGamma", self.safety_confidence_gamma),
            ("explorationMargin", self.exploration_margin),
        ] {
            if !v.is_finite() || v < 0.0 {
                return Err(invalid(format!("{name} must be finite and >= 0, got {v}")));
            }
        }
        for (name, v) in [
            ("fnrLimit", self.fnr_limit),
            ("rewardThreshold", self.reward_threshold),
            ("defaultSafetyThreshold", self.default_safety_threshold),
        ] {
            if !v.is_finite() || !(0.0..=1.0).contains(&v) {
                return Err(invalid(format!("{name} must be in [0, 1], got {v}")));
            }
        }
        for (cat, &v) in &self.safety_threshold_by_category {
            if !v.is_finite() || !(0.0..=1.0).contains(&v) {
                return Err(invalid(format!(
                    "safetyThresholdByCategory[{cat}] must be in [0, 1], got {v}"
                )));
            }
        }
        if self.max_pending == 0 {
            return Err(invalid("maxPending must be >= 1".to_string()));
        }
        if self.snapshot_every == 0 {
            return Err(invalid("snapshotEvery must be >= 1".to_string()));
        }
        if self.calibration_checkpoint_every == 0 {
            return Err(invalid("calibrationCheckpointEvery must be >= 1".to_string()));
        }
        self.source_weights()?;
        Ok(())
    }

    /// Miscoverage `α = 1 − coverageLevel`.
    pub fn alpha(&self) -> f64 {
        1.0 - self.coverage_level
    }

    /// Safety ceiling for a damage category (case-insensitive).
    pub fn safety_threshold(&self, category: Option<&str>) -> f64 {
        let Some(cat) = category else {
            return self.default_safety_threshold;
        };
        let cat = cat.trim();
        self.safety_threshold_by_category
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(cat))
            .map(|(_, &v)| v)
            .unwrap_or(self.default_safety_threshold)
    }

    /// Trained weights from `sourceWeightsPath` (if any) with the inline
    /// `sourceWeights` applied on top.
    pub fn source_weights(&self) -> Result<SourceWeights> {
        let base = match &self.source_weights_path {
            Some(path) => SourceWeights::load(path, self.default_source_weight)?,
            None => SourceWeights::new(HashMap::new(), self.default_source_weight)?,
        };
        base.with_overrides(&self.source_weights)
    }

    pub fn critic_params(&self) -> CriticParams {
        CriticParams {
            fnr_limit: self.fnr_limit,
            reward_threshold: self.reward_threshold,
            exploration_margin: self.exploration_margin,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = EngineConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.min_calibration_samples, 100);
        assert_eq!(cfg.coverage_level, 0.95);
        assert!(!cfg.shadow_mode_enabled);
        assert!((cfg.alpha() - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_zero_lambda_is_singular() {
        let cfg = EngineConfig {
            ridge_lambda: 0.0,
            ..Default::default()
        };
        assert_eq!(cfg.validate(), Err(EngineError::SingularModel(0.0)));
        let err = EngineConfig::from_json(r#"{"ridgeLambda": -2.0}"#).unwrap_err();
        assert_eq!(err, EngineError::SingularModel(-2.0));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg = EngineConfig::from_json(
            r#"{"shadowModeEnabled": true,
                "safetyThresholdByCategory": {"Structural": 0.02},
                "sourceWeights": {"sam3": 0.6}}"#,
        )
        .unwrap();
        assert!(cfg.shadow_mode_enabled);
        assert_eq!(cfg.ridge_lambda, 1.0);
        assert_eq!(cfg.safety_threshold(Some("structural")), 0.02);
        assert_eq!(cfg.safety_threshold(Some("cosmetic")), 0.1);
        assert_eq!(cfg.safety_threshold(None), 0.1);
        assert_eq!(cfg.source_weights().unwrap().weight_for("sam3"), 0.6);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(EngineConfig::from_json(r#"{"ridgeLamda": 1.0}"#).is_err());
    }

    #[test]
    fn test_range_checks() {
        let cases = [
            r#"{"coverageLevel": 1.0}"#,
            r#"{"coverageLevel": 0.0}"#,
            r#"{"minCalibrationSamples": 0}"#,
            r#"{"calibrationWindow": 10}"#,
            r#"{"rewardConfidenceBeta": -1.0}"#,
            r#"{"fnrLimit": 1.5}"#,
            r#"{"safetyThresholdByCategory": {"x": -0.1}}"#,
            r#"{"maxPending": 0}"#,
            r#"{"snapshotEvery": 0}"#,
            r#"{"calibrationCheckpointEvery": 0}"#,
            r#"{"sourceWeights": {"bad": -1.0}}"#,
        ];
        for json in cases {
            assert!(EngineConfig::from_json(json).is_err(), "{json} accepted");
        }
    }

    #[test]
    fn test_json_round_trip() {
        let cfg = EngineConfig {
            shadow_mode_enabled: true,
            ..Default::default()
        };
        let back = EngineConfig::from_json(&cfg.to_json().unwrap()).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn test_load_from_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("engine.json");
        std::fs::write(&path, r#"{"coverageLevel": 0.9}"#).unwrap();
        let cfg = EngineConfig::load(&path).unwrap();
        assert_eq!(cfg.coverage_level, 0.9);
        assert!(EngineConfig::load(&tmp.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_weights_file_resolved_next_to_config() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("fusion_weights.json"),
            r#"{"sam3": 0.5, "gpt4": 0.3, "sceneGraph": 0.2}"#,
        )
        .unwrap();
        let path = tmp.path().join("engine.json");
        std::fs::write(
            &path,
            r#"{"sourceWeightsPath": "fusion_weights.json", "sourceWeights": {"gpt4": 0.4}}"#,
        )
        .unwrap();

        let cfg = EngineConfig::load(&path).unwrap();
        assert_eq!(
            cfg.source_weights_path.as_deref(),
            Some(tmp.path().join("fusion_weights.json").as_path())
        );
        let w = cfg.source_weights().unwrap();
        assert_eq!(w.weight_for("sam3"), 0.5);
        assert_eq!(w.weight_for("sceneGraph"), 0.2);
        assert_eq!(w.weight_for("gpt4"), 0.4);
        assert_eq!(w.weight_for("other"), 1.0);

        let back = EngineConfig::from_json(&cfg.to_json().unwrap()).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn test_missing_weights_file_is_invalid() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("engine.json");
        std::fs::write(&path, r#"{"sourceWeightsPath": "nope.json"}"#).unwrap();
        assert!(matches!(
            EngineConfig::load(&path),
            Err(EngineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_huge_max_pending_is_accepted() {
        let cfg = EngineConfig::from_json(r#"{"maxPending": 18446744073709551615}"#).unwrap();
        assert_eq!(cfg.max_pending, usize::MAX);
    }
}
