//! Synthetic assessment stream: each stratum has a fixed judgment accuracy,
//! the engine learns online from every outcome, and the run ends with the
//! coverage/FNR audit battery per stratum.

use std::collections::BTreeMap;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use surveyor_core::{DecisionEngine, EvidenceSample, OutcomeReport, SituationalFeatures};
use surveyor_tests::StratumAudit;

/// (property, damage, region, region code, property age, judgment accuracy)
const PROFILES: [(&str, &str, &str, f64, f64, f64); 8] = [
    ("residential", "water", "north", 1.0, 8.0, 0.99),
    ("residential", "roof", "south", 2.0, 20.0, 0.97),
    ("commercial", "fire", "east", 3.0, 35.0, 0.93),
    ("commercial", "structural", "west", 4.0, 70.0, 0.85),
    ("residential", "hail", "central", 5.0, 8.0, 0.96),
    ("industrial", "water", "coastal", 6.0, 20.0, 0.90),
    ("industrial", "structural", "mountain", 7.0, 35.0, 0.80),
    ("commercial", "roof", "valley", 8.0, 70.0, 0.70),
];

const DETECTORS: [&str; 3] = ["sam3", "gpt4", "sceneGraph"];

/// Share of assessments whose true outcome is positive.
const POSITIVE_RATE: f64 = 0.3;

pub struct SimulateCommandConfig<'a> {
    pub assessments: usize,
    pub strata: usize,
    pub hazard_share: f64,
    pub seed: u64,
    pub config_path: Option<&'a str>,
    pub state_dir: Option<&'a str>,
    pub output_path: Option<&'a str>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StratumOutcome {
    pub stratum: String,
    pub judgment_accuracy: f64,
    pub assessments: usize,
    pub automated: u64,
    pub false_negatives: u64,
    pub exploration: usize,
    /// Per labelled outcome with a calibrated set: was it inside?
    pub covered: Vec<bool>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationReport {
    pub assessments: usize,
    pub automated: u64,
    pub false_negatives: u64,
    pub rejected_outcomes: usize,
    pub strata: Vec<StratumOutcome>,
}

fn features(rng: &mut StdRng, profile: usize, probs: &[f64]) -> SituationalFeatures {
    let (property, damage, region, code, age, _) = PROFILES[profile];
    let max = probs.iter().copied().fold(f64::MIN, f64::max);
    let min = probs.iter().copied().fold(f64::MAX, f64::min);
    SituationalFeatures {
        property_category: Some(property.to_string()),
        damage_category: Some(damage.to_string()),
        region: Some(region.to_string()),
        region_code: Some(code),
        lighting_quality: Some(rng.random_range(0.5..1.0)),
        image_clarity: Some(rng.random_range(0.5..1.0)),
        property_age_years: Some(age),
        damage_site_count: Some(rng.random_range(1..=5)),
        detector_disagreement: Some(max - min),
        ood_score: Some(rng.random_range(0.0..0.2)),
        critical_candidate: false,
    }
}

/// Drive `engine` through `assessments` synthetic cases.
pub fn simulate(
    engine: &DecisionEngine,
    assessments: usize,
    strata: usize,
    hazard_share: f64,
    seed: u64,
) -> SimulationReport {
    let strata = strata.clamp(1, PROFILES.len());
    let mut rng = StdRng::seed_from_u64(seed);
    let mut per_stratum: BTreeMap<String, StratumOutcome> = BTreeMap::new();
    let mut report = SimulationReport {
        assessments,
        ..Default::default()
    };

    for _ in 0..assessments {
        let profile = rng.random_range(0..strata);
        let accuracy = PROFILES[profile].5;

        let actual = rng.random_bool(POSITIVE_RATE);
        let judged_positive = if rng.random_bool(accuracy) { actual } else { !actual };
        let center: f64 = if judged_positive { 0.8 } else { 0.15 };
        let evidence: Vec<EvidenceSample> = DETECTORS
            .iter()
            .map(|id| {
                let p = (center + rng.random_range(-0.1f64..0.1)).clamp(0.0, 1.0);
                EvidenceSample::new(*id, p, rng.random_range(0.6..1.0))
            })
            .collect();
        let probs: Vec<f64> = evidence.iter().map(|e| e.probability).collect();
        let situational = features(&mut rng, profile, &probs);
        let hazard = actual && rng.random_bool(hazard_share.clamp(0.0, 1.0));

        let decision = engine.evaluate(&evidence, &situational, None);
        let entry = per_stratum
            .entry(decision.cp_stratum.clone())
            .or_insert_with(|| StratumOutcome {
                stratum: decision.cp_stratum.clone(),
                judgment_accuracy: accuracy,
                ..Default::default()
            });
        entry.assessments += 1;
        if decision.exploration {
            entry.exploration += 1;
        }
        if !decision.cp_uncalibrated {
            let y = if actual { 1.0 } else { 0.0 };
            let (lo, hi) = decision.cp_prediction_set;
            entry.covered.push(lo <= y && y <= hi);
        }

        let outcome = OutcomeReport {
            assessment_id: decision.assessment_id,
            stratum: decision.cp_stratum.clone(),
            decision_arm: decision.arm,
            actual_outcome: actual,
            critical_hazard_present: hazard,
        };
        match engine.submit_outcome(&outcome) {
            Ok(summary) => {
                if decision.is_automated() {
                    entry.automated += 1;
                    report.automated += 1;
                    if summary.safety_violation {
                        entry.false_negatives += 1;
                        report.false_negatives += 1;
                    }
                }
            }
            Err(e) => {
                log::warn!("outcome for {} rejected: {e}", decision.assessment_id);
                report.rejected_outcomes += 1;
            }
        }
    }

    report.strata = per_stratum.into_values().collect();
    report
}

pub fn run(cfg: SimulateCommandConfig<'_>) {
    let config = super::load_config(cfg.config_path);
    let target_coverage = config.coverage_level;
    let fnr_limit = config.fnr_limit;
    let engine = super::make_engine(config, cfg.state_dir);

    println!(
        "🧪 Simulating {} assessments across {} strata (seed {})...\n",
        cfg.assessments,
        cfg.strata.clamp(1, PROFILES.len()),
        cfg.seed
    );
    let t0 = Instant::now();
    let report = simulate(
        &engine,
        cfg.assessments,
        cfg.strata,
        cfg.hazard_share,
        cfg.seed,
    );
    let elapsed = t0.elapsed().as_secs_f64();
    if cfg.state_dir.is_some() {
        if let Err(e) = engine.checkpoint() {
            eprintln!("Failed to checkpoint calibration pools: {e}");
        }
    }

    println!("{}", "=".repeat(96));
    println!(
        "{:<42} {:>5} {:>6} {:>7} {:>6} {:>8} {:>8} {:>6}",
        "Stratum", "Acc", "N", "Auto%", "FN", "FNR", "Cover", "Score"
    );
    println!("{}", "-".repeat(96));

    let mut failures = Vec::new();
    for s in &report.strata {
        let audit = StratumAudit {
            stratum: s.stratum.clone(),
            covered: s.covered.clone(),
            target_coverage,
            total_automated: s.automated,
            false_negatives: s.false_negatives,
            fnr_limit,
        };
        let results = surveyor_tests::run_stratum_audit(&audit);
        let score = surveyor_tests::calculate_quality_score(&results);
        let auto_pct = 100.0 * s.automated as f64 / s.assessments.max(1) as f64;
        let fnr = if s.automated == 0 {
            0.0
        } else {
            s.false_negatives as f64 / s.automated as f64
        };
        let cover = if s.covered.is_empty() {
            "—".to_string()
        } else {
            let hits = s.covered.iter().filter(|&&c| c).count();
            format!("{:.4}", hits as f64 / s.covered.len() as f64)
        };
        println!(
            "  {:<40} {:>5.2} {:>6} {:>6.1}% {:>6} {:>8.4} {:>8} {:>6.0}",
            super::truncate(&s.stratum, 40),
            s.judgment_accuracy,
            s.assessments,
            auto_pct,
            s.false_negatives,
            fnr,
            cover,
            score
        );
        failures.extend(
            results
                .into_iter()
                .filter(|r| !r.passed && r.p_value.is_some())
                .map(|r| (s.stratum.clone(), r)),
        );
    }

    let model = engine.model_snapshot();
    println!("{}", "-".repeat(96));
    println!(
        "  automated {}/{} ({:.1}%), false negatives {}, model v{} ({} observations) [{:.1}s]",
        report.automated,
        report.assessments,
        100.0 * report.automated as f64 / report.assessments.max(1) as f64,
        report.false_negatives,
        model.version,
        model.observation_count,
        elapsed
    );
    if report.rejected_outcomes > 0 {
        println!("  {} outcomes rejected (see log)", report.rejected_outcomes);
    }
    if !failures.is_empty() {
        println!("\n  Audit failures:");
        for (stratum, r) in &failures {
            println!("  {}", super::truncate(stratum, 60));
            println!("    {}", super::result_row(r));
        }
    }

    if let Some(path) = cfg.output_path {
        let json = serde_json::to_string_pretty(&report).unwrap_or_else(|e| super::fail(e));
        match std::fs::write(path, json) {
            Ok(()) => println!("\n📄 Summary saved to: {path}"),
            Err(e) => eprintln!("Failed to write summary to {path}: {e}"),
        }
    }
}
