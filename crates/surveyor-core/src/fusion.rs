//! Evidence fusion: independent per-detector probabilities → one belief.
//!
//! The fused mean is the source-weighted average of detector probabilities.
//! Its variance splits into:
//! - **aleatoric**: `Σ(w²·p·(1−p)) / (Σw)²`, the Bernoulli noise each
//!   detector carries on its own;
//! - **epistemic**: the weighted variance of the detector probabilities
//!   around the fused mean, weighting each detector by `weight · confidence`.
//!
//! Source weights are configuration (usually the output of an offline
//! training job), never learned here.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// One detector's output for one assessment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceSample {
    pub probability: f64,
    pub confidence: f64,
    pub source_id: String,
}

impl EvidenceSample {
    pub fn new(source_id: impl Into<String>, probability: f64, confidence: f64) -> Self {
        Self {
            probability,
            confidence,
            source_id: source_id.into(),
        }
    }
}

/// Fused belief for one assessment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FusionResult {
    pub mean: f64,
    /// Always `epistemic + aleatoric`.
    pub variance: f64,
    pub epistemic: f64,
    pub aleatoric: f64,
    /// Effective weight used per source (summed if a source repeats).
    pub weights: BTreeMap<String, f64>,
    /// `mean ± 2σ`, clamped to [0, 1].
    pub confidence_interval: (f64, f64),
}

/// Per-source fusion weights with a fallback for unknown detectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceWeights {
    weights: HashMap<String, f64>,
    default_weight: f64,
}

impl Default for SourceWeights {
    fn default() -> Self {
        Self {
            weights: HashMap::new(),
            default_weight: 1.0,
        }
    }
}

impl SourceWeights {
    pub fn new(weights: HashMap<String, f64>, default_weight: f64) -> Result<Self> {
        check_weight("default", default_weight)?;
        for (name, &w) in &weights {
            check_weight(name, w)?;
        }
        Ok(Self {
            weights,
            default_weight,
        })
    }

    /// Parse a trained-weights document: a flat JSON object of
    /// `source_id → weight`, e.g. `{"sam3": 0.5, "gpt4": 0.3, "sceneGraph": 0.2}`.
    pub fn from_json(json: &str, default_weight: f64) -> Result<Self> {
        let weights: HashMap<String, f64> = serde_json::from_str(json)
            .map_err(|e| EngineError::InvalidConfig(format!("fusion weights: {e}")))?;
        Self::new(weights, default_weight)
    }

    pub fn load(path: &Path, default_weight: f64) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            EngineError::InvalidConfig(format!("fusion weights {}: {e}", path.display()))
        })?;
        Self::from_json(&json, default_weight)
    }

    /// Apply per-source overrides on top of these weights.
    pub fn with_overrides(mut self, overrides: &HashMap<String, f64>) -> Result<Self> {
        for (name, &w) in overrides {
            check_weight(name, w)?;
            self.weights.insert(name.clone(), w);
        }
        Ok(self)
    }

    pub fn weight_for(&self, source_id: &str) -> f64 {
        self.weights
            .get(source_id)
            .copied()
            .unwrap_or(self.default_weight)
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

fn check_weight(name: &str, w: f64) -> Result<()> {
    if !w.is_finite() || w < 0.0 {
        return Err(EngineError::InvalidConfig(format!(
            "fusion weight for '{name}' must be finite and >= 0, got {w}"
        )));
    }
    Ok(())
}

fn check_unit(field: &str, source: &str, v: f64) -> Result<()> {
    if !v.is_finite() || !(0.0..=1.0).contains(&v) {
        return Err(EngineError::MalformedFeatures(format!(
            "{field} for source '{source}' must be in [0, 1], got {v}"
        )));
    }
    Ok(())
}

/// Fuse detector samples into a single mean/variance belief.
pub fn fuse(samples: &[EvidenceSample], weights: &SourceWeights) -> Result<FusionResult> {
    if samples.is_empty() {
        return Err(EngineError::InsufficientEvidence(
            "no detector samples supplied".to_string(),
        ));
    }
    for s in samples {
        check_unit("probability", &s.source_id, s.probability)?;
        check_unit("confidence", &s.source_id, s.confidence)?;
    }

    let w: Vec<f64> = samples
        .iter()
        .map(|s| weights.weight_for(&s.source_id))
        .collect();
    let total: f64 = w.iter().sum();
    if total <= 0.0 {
        return Err(EngineError::InsufficientEvidence(
            "all detector samples carry zero weight".to_string(),
        ));
    }

    let mean = samples
        .iter()
        .zip(&w)
        .map(|(s, wi)| wi * s.probability)
        .sum::<f64>()
        / total;

    let aleatoric = samples
        .iter()
        .zip(&w)
        .map(|(s, wi)| wi * wi * s.probability * (1.0 - s.probability))
        .sum::<f64>()
        / (total * total);

    // Disagreement weights: source weight scaled by stated confidence. If
    // every detector reports zero confidence, fall back to plain weights.
    let mut dw: Vec<f64> = samples
        .iter()
        .zip(&w)
        .map(|(s, wi)| wi * s.confidence)
        .collect();
    let mut dw_total: f64 = dw.iter().sum();
    if dw_total <= 0.0 {
        dw.clone_from(&w);
        dw_total = total;
    }
    let epistemic = samples
        .iter()
        .zip(&dw)
        .map(|(s, wi)| wi * (s.probability - mean).powi(2))
        .sum::<f64>()
        / dw_total;

    let variance = epistemic + aleatoric;
    let sd = variance.sqrt();
    let confidence_interval = (
        (mean - 2.0 * sd).clamp(0.0, 1.0),
        (mean + 2.0 * sd).clamp(0.0, 1.0),
    );

    let mut per_source = BTreeMap::new();
    for (s, wi) in samples.iter().zip(&w) {
        *per_source.entry(s.source_id.clone()).or_insert(0.0) += wi;
    }

    Ok(FusionResult {
        mean,
        variance,
        epistemic,
        aleatoric,
        weights: per_source,
        confidence_interval,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn test_empty_is_insufficient() {
        let err = fuse(&[], &SourceWeights::default()).unwrap_err();
        assert!(matches!(err, EngineError::InsufficientEvidence(_)));
    }

    #[test]
    fn test_single_sample_has_no_epistemic() {
        let r = fuse(
            &[EvidenceSample::new("sam3", 0.8, 0.9)],
            &SourceWeights::default(),
        )
        .unwrap();
        assert!(close(r.mean, 0.8));
        assert_eq!(r.epistemic, 0.0);
        assert!(close(r.aleatoric, 0.8 * 0.2));
        assert!(close(r.variance, r.epistemic + r.aleatoric));
    }

    #[test]
    fn test_weighted_mean_and_variance_decomposition() {
        let weights = SourceWeights::from_json(r#"{"sam3": 3.0, "gpt4": 1.0}"#, 1.0).unwrap();
        let samples = [
            EvidenceSample::new("sam3", 0.9, 1.0),
            EvidenceSample::new("gpt4", 0.5, 1.0),
        ];
        let r = fuse(&samples, &weights).unwrap();
        assert!(close(r.mean, (3.0 * 0.9 + 0.5) / 4.0));
        let aleatoric = (9.0 * 0.9 * 0.1 + 1.0 * 0.5 * 0.5) / 16.0;
        assert!(close(r.aleatoric, aleatoric));
        let epistemic = (3.0 * (0.9 - r.mean).powi(2) + (0.5 - r.mean).powi(2)) / 4.0;
        assert!(close(r.epistemic, epistemic));
        assert!(close(r.variance, r.epistemic + r.aleatoric));
        assert_eq!(r.weights.get("sam3"), Some(&3.0));
    }

    #[test]
    fn test_confidence_scales_disagreement_only() {
        let confident = [
            EvidenceSample::new("a", 0.9, 1.0),
            EvidenceSample::new("b", 0.6, 1.0),
            EvidenceSample::new("c", 0.1, 1.0),
        ];
        let unsure_outlier = [
            EvidenceSample::new("a", 0.9, 1.0),
            EvidenceSample::new("b", 0.6, 1.0),
            EvidenceSample::new("c", 0.1, 0.1),
        ];
        let hi = fuse(&confident, &SourceWeights::default()).unwrap();
        let lo = fuse(&unsure_outlier, &SourceWeights::default()).unwrap();

        // Mean and aleatoric depend on source weights alone.
        let mean = (0.9 + 0.6 + 0.1) / 3.0;
        assert!(close(hi.mean, mean));
        assert!(close(lo.mean, mean));
        assert!(close(hi.aleatoric, lo.aleatoric));

        let d = [0.9 - mean, 0.6 - mean, 0.1 - mean];
        let hi_expected = (d[0].powi(2) + d[1].powi(2) + d[2].powi(2)) / 3.0;
        let lo_expected = (d[0].powi(2) + d[1].powi(2) + 0.1 * d[2].powi(2)) / 2.1;
        assert!(close(hi.epistemic, hi_expected));
        assert!(close(lo.epistemic, lo_expected));
        assert!(lo.epistemic < hi.epistemic);
    }

    #[test]
    fn test_zero_confidence_falls_back_to_weights() {
        let samples = [
            EvidenceSample::new("a", 0.9, 0.0),
            EvidenceSample::new("b", 0.1, 0.0),
        ];
        let r = fuse(&samples, &SourceWeights::default()).unwrap();
        assert!(close(r.epistemic, 0.16));
    }

    #[test]
    fn test_interval_is_clamped() {
        let samples = [
            EvidenceSample::new("a", 1.0, 1.0),
            EvidenceSample::new("b", 0.0, 1.0),
        ];
        let r = fuse(&samples, &SourceWeights::default()).unwrap();
        assert_eq!(r.confidence_interval, (0.0, 1.0));
        let sd = r.variance.sqrt();
        assert!(close(r.confidence_interval.0, (r.mean - 2.0 * sd).max(0.0)));
    }

    #[test]
    fn test_rejects_out_of_range_inputs() {
        for bad in [f64::NAN, -0.1, 1.5, f64::INFINITY] {
            let err = fuse(
                &[EvidenceSample::new("a", bad, 0.5)],
                &SourceWeights::default(),
            )
            .unwrap_err();
            assert!(matches!(err, EngineError::MalformedFeatures(_)));
        }
    }

    #[test]
    fn test_zero_total_weight_is_insufficient() {
        let weights = SourceWeights::from_json(r#"{"muted": 0.0}"#, 1.0).unwrap();
        let err = fuse(&[EvidenceSample::new("muted", 0.5, 0.5)], &weights).unwrap_err();
        assert!(matches!(err, EngineError::InsufficientEvidence(_)));
    }

    #[test]
    fn test_weights_json_validation() {
        assert!(SourceWeights::from_json(r#"{"a": -1.0}"#, 1.0).is_err());
        assert!(SourceWeights::from_json("not json", 1.0).is_err());
        assert!(SourceWeights::from_json("{}", f64::NAN).is_err());
        let w = SourceWeights::from_json(r#"{"sam3": 0.5, "sceneGraph": 0.2}"#, 0.7).unwrap();
        assert_eq!(w.len(), 2);
        assert_eq!(w.weight_for("sceneGraph"), 0.2);
        assert_eq!(w.weight_for("unknown"), 0.7);
    }

    #[test]
    fn test_trained_weights_file_with_overrides() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("fusion_weights.json");
        std::fs::write(&path, r#"{"sam3": 0.5, "gpt4": 0.3, "sceneGraph": 0.2}"#).unwrap();

        let w = SourceWeights::load(&path, 1.0).unwrap();
        assert_eq!(w.len(), 3);
        assert_eq!(w.weight_for("gpt4"), 0.3);

        let overrides = HashMap::from([("gpt4".to_string(), 0.9)]);
        let w = w.with_overrides(&overrides).unwrap();
        assert_eq!(w.weight_for("gpt4"), 0.9);
        assert_eq!(w.weight_for("sam3"), 0.5);

        let bad = HashMap::from([("gpt4".to_string(), f64::NAN)]);
        assert!(SourceWeights::default().with_overrides(&bad).is_err());
        let err = SourceWeights::load(&tmp.path().join("missing.json"), 1.0).unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
    }
}
