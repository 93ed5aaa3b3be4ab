//! Situational metadata, stratum keys, and the 12-slot context vector.

use serde::{Deserialize, Serialize};

use crate::conformal::CalibrationResult;
use crate::error::{EngineError, Result};
use crate::fusion::FusionResult;
use crate::linalg::{DIM, Vector};

/// Fused mean at or above which a judgment is treated as flagging damage.
pub const CRITICAL_CANDIDATE_THRESHOLD: f64 = 0.5;

/// Flat situational record supplied by the caller alongside detector output.
///
/// Numeric features are optional on the wire so that a missing value is
/// reported as [`EngineError::MalformedFeatures`] instead of silently
/// defaulting to zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SituationalFeatures {
    pub property_category: Option<String>,
    pub damage_category: Option<String>,
    pub region: Option<String>,
    pub region_code: Option<f64>,
    pub lighting_quality: Option<f64>,
    pub image_clarity: Option<f64>,
    pub property_age_years: Option<f64>,
    pub damage_site_count: Option<u32>,
    pub detector_disagreement: Option<f64>,
    pub ood_score: Option<f64>,
    /// Upstream flagged this as a possible critical hazard.
    pub critical_candidate: bool,
}

/// Property age cohort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgeBucket {
    Under10,
    From10To25,
    From25To50,
    Over50,
    Unknown,
}

impl AgeBucket {
    pub fn from_years(years: Option<f64>) -> Self {
        match years {
            Some(y) if y.is_finite() && y >= 0.0 => {
                if y < 10.0 {
                    Self::Under10
                } else if y < 25.0 {
                    Self::From10To25
                } else if y < 50.0 {
                    Self::From25To50
                } else {
                    Self::Over50
                }
            }
            _ => Self::Unknown,
        }
    }

    /// Ordinal used in the context vector. `Unknown` never reaches it because
    /// a missing or negative age is rejected first.
    pub fn index(self) -> f64 {
        match self {
            Self::Under10 => 0.0,
            Self::From10To25 => 1.0,
            Self::From25To50 => 2.0,
            Self::Over50 | Self::Unknown => 3.0,
        }
    }
}

impl std::fmt::Display for AgeBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Under10 => write!(f, "age_0_10"),
            Self::From10To25 => write!(f, "age_10_25"),
            Self::From25To50 => write!(f, "age_25_50"),
            Self::Over50 => write!(f, "age_50_plus"),
            Self::Unknown => write!(f, "age_unknown"),
        }
    }
}

fn key_part(v: Option<&str>) -> String {
    match v.map(str::trim) {
        Some(s) if !s.is_empty() => s.to_lowercase().replace('|', "_"),
        _ => "unknown".to_string(),
    }
}

/// Build the calibration cohort key for an assessment.
///
/// Total over its input: every combination of present/missing metadata maps
/// to exactly one key, and equal metadata always yields the same key.
pub fn stratum_key(features: &SituationalFeatures) -> String {
    format!(
        "{}|{}|{}|{}",
        key_part(features.property_category.as_deref()),
        AgeBucket::from_years(features.property_age_years),
        key_part(features.region.as_deref()),
        key_part(features.damage_category.as_deref()),
    )
}

/// Ordered 12-slot feature vector consumed by the critic.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContextVector(pub Vector);

impl ContextVector {
    pub const FUSION_MEAN: usize = 0;
    pub const FUSION_VARIANCE: usize = 1;
    pub const PREDICTION_SET_WIDTH: usize = 2;
    pub const CRITICAL_CANDIDATE: usize = 3;
    pub const LIGHTING_QUALITY: usize = 4;
    pub const IMAGE_CLARITY: usize = 5;
    pub const PROPERTY_AGE: usize = 6;
    pub const PROPERTY_AGE_BUCKET: usize = 7;
    pub const DAMAGE_SITE_COUNT: usize = 8;
    pub const DETECTOR_DISAGREEMENT: usize = 9;
    pub const OOD_SCORE: usize = 10;
    pub const REGION_CODE: usize = 11;

    pub fn as_array(&self) -> &Vector {
        &self.0
    }

    pub fn get(&self, slot: usize) -> f64 {
        self.0[slot]
    }

    /// Wrap a raw vector, rejecting non-finite entries.
    pub fn from_array(values: Vector) -> Result<Self> {
        if let Some(i) = values.iter().position(|v| !v.is_finite()) {
            return Err(EngineError::MalformedFeatures(format!(
                "context slot {i} is not finite"
            )));
        }
        Ok(Self(values))
    }
}

fn required(name: &str, v: Option<f64>) -> Result<f64> {
    match v {
        None => Err(EngineError::MalformedFeatures(format!("{name} missing"))),
        Some(x) if !x.is_finite() => Err(EngineError::MalformedFeatures(format!(
            "{name} is not finite"
        ))),
        Some(x) => Ok(x),
    }
}

/// Whether the machine judgment flags a (possibly critical) hazard.
pub fn judgment_flags_hazard(fusion: &FusionResult, features: &SituationalFeatures) -> bool {
    features.critical_candidate || fusion.mean >= CRITICAL_CANDIDATE_THRESHOLD
}

/// Assemble the context vector. Pure and deterministic.
pub fn build_context(
    fusion: &FusionResult,
    calibration: &CalibrationResult,
    features: &SituationalFeatures,
) -> Result<ContextVector> {
    let lighting = required("lightingQuality", features.lighting_quality)?;
    let clarity = required("imageClarity", features.image_clarity)?;
    let age = required("propertyAgeYears", features.property_age_years)?;
    if age < 0.0 {
        return Err(EngineError::MalformedFeatures(format!(
            "propertyAgeYears must be >= 0, got {age}"
        )));
    }
    let sites = features
        .damage_site_count
        .ok_or_else(|| EngineError::MalformedFeatures("damageSiteCount missing".to_string()))?;
    let disagreement = required("detectorDisagreement", features.detector_disagreement)?;
    let ood = required("oodScore", features.ood_score)?;
    let region = required("regionCode", features.region_code)?;

    let (low, high) = calibration.prediction_set;
    let mut x = [0.0; DIM];
    x[ContextVector::FUSION_MEAN] = fusion.mean;
    x[ContextVector::FUSION_VARIANCE] = fusion.variance;
    x[ContextVector::PREDICTION_SET_WIDTH] = high - low;
    x[ContextVector::CRITICAL_CANDIDATE] = if judgment_flags_hazard(fusion, features) {
        1.0
    } else {
        0.0
    };
    x[ContextVector::LIGHTING_QUALITY] = lighting;
    x[ContextVector::IMAGE_CLARITY] = clarity;
    x[ContextVector::PROPERTY_AGE] = age;
    x[ContextVector::PROPERTY_AGE_BUCKET] = AgeBucket::from_years(Some(age)).index();
    x[ContextVector::DAMAGE_SITE_COUNT] = f64::from(sites);
    x[ContextVector::DETECTOR_DISAGREEMENT] = disagreement;
    x[ContextVector::OOD_SCORE] = ood;
    x[ContextVector::REGION_CODE] = region;

    ContextVector::from_array(x)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::BTreeMap;

    pub(crate) fn sample_features() -> SituationalFeatures {
        SituationalFeatures {
            property_category: Some("Residential".to_string()),
            damage_category: Some("water".to_string()),
            region: Some("north".to_string()),
            region_code: Some(3.0),
            lighting_quality: Some(0.8),
            image_clarity: Some(0.9),
            property_age_years: Some(32.0),
            damage_site_count: Some(2),
            detector_disagreement: Some(0.1),
            ood_score: Some(0.05),
            critical_candidate: false,
        }
    }

    fn fusion(mean: f64) -> FusionResult {
        FusionResult {
            mean,
            variance: 0.02,
            epistemic: 0.01,
            aleatoric: 0.01,
            weights: BTreeMap::new(),
            confidence_interval: (0.0, 1.0),
        }
    }

    fn calibration() -> CalibrationResult {
        CalibrationResult {
            stratum: "s".to_string(),
            prediction_set: (0.6, 0.9),
            coverage_level: 0.95,
            sample_count: 200,
            quantile: Some(0.15),
            uncalibrated: false,
        }
    }

    #[test]
    fn test_slots_have_fixed_positions() {
        let x = build_context(&fusion(0.75), &calibration(), &sample_features()).unwrap();
        assert_eq!(x.get(ContextVector::FUSION_MEAN), 0.75);
        assert_eq!(x.get(ContextVector::FUSION_VARIANCE), 0.02);
        assert!((x.get(ContextVector::PREDICTION_SET_WIDTH) - 0.3).abs() < 1e-12);
        assert_eq!(x.get(ContextVector::CRITICAL_CANDIDATE), 1.0);
        assert_eq!(x.get(ContextVector::PROPERTY_AGE), 32.0);
        assert_eq!(x.get(ContextVector::PROPERTY_AGE_BUCKET), 2.0);
        assert_eq!(x.get(ContextVector::DAMAGE_SITE_COUNT), 2.0);
        assert_eq!(x.get(ContextVector::REGION_CODE), 3.0);
    }

    #[test]
    fn test_deterministic() {
        let a = build_context(&fusion(0.3), &calibration(), &sample_features()).unwrap();
        let b = build_context(&fusion(0.3), &calibration(), &sample_features()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.get(ContextVector::CRITICAL_CANDIDATE), 0.0);
    }

    #[test]
    fn test_caller_flag_marks_critical_candidate() {
        let mut f = sample_features();
        f.critical_candidate = true;
        let x = build_context(&fusion(0.1), &calibration(), &f).unwrap();
        assert_eq!(x.get(ContextVector::CRITICAL_CANDIDATE), 1.0);
    }

    #[test]
    fn test_missing_feature_is_malformed() {
        let mut f = sample_features();
        f.ood_score = None;
        let err = build_context(&fusion(0.5), &calibration(), &f).unwrap_err();
        assert_eq!(err, EngineError::MalformedFeatures("oodScore missing".into()));

        let mut f = sample_features();
        f.damage_site_count = None;
        assert!(build_context(&fusion(0.5), &calibration(), &f).is_err());
    }

    #[test]
    fn test_non_finite_inputs_rejected() {
        let mut f = sample_features();
        f.lighting_quality = Some(f64::NAN);
        assert!(build_context(&fusion(0.5), &calibration(), &f).is_err());

        let mut bad = fusion(0.5);
        bad.variance = f64::INFINITY;
        assert!(build_context(&bad, &calibration(), &sample_features()).is_err());
    }

    #[test]
    fn test_negative_age_is_malformed() {
        let mut f = sample_features();
        f.property_age_years = Some(-3.0);
        let err = build_context(&fusion(0.5), &calibration(), &f).unwrap_err();
        assert!(matches!(err, EngineError::MalformedFeatures(ref m) if m.contains("propertyAgeYears")));
        f.property_age_years = Some(0.0);
        let x = build_context(&fusion(0.5), &calibration(), &f).unwrap();
        assert_eq!(x.get(ContextVector::PROPERTY_AGE_BUCKET), AgeBucket::Under10.index());
    }

    #[test]
    fn test_stratum_key_is_total_and_stable() {
        let f = sample_features();
        assert_eq!(stratum_key(&f), "residential|age_25_50|north|water");
        assert_eq!(stratum_key(&f), stratum_key(&f.clone()));
        assert_eq!(
            stratum_key(&SituationalFeatures::default()),
            "unknown|age_unknown|unknown|unknown"
        );
        let mut odd = f;
        odd.region = Some("  a|b ".to_string());
        odd.property_age_years = Some(f64::NAN);
        assert_eq!(stratum_key(&odd), "residential|age_unknown|a_b|water");
    }

    #[test]
    fn test_age_buckets() {
        assert_eq!(AgeBucket::from_years(Some(0.0)), AgeBucket::Under10);
        assert_eq!(AgeBucket::from_years(Some(10.0)), AgeBucket::From10To25);
        assert_eq!(AgeBucket::from_years(Some(49.9)), AgeBucket::From25To50);
        assert_eq!(AgeBucket::from_years(Some(120.0)), AgeBucket::Over50);
        assert_eq!(AgeBucket::from_years(Some(-3.0)), AgeBucket::Unknown);
        assert_eq!(AgeBucket::from_years(None), AgeBucket::Unknown);
    }
}
