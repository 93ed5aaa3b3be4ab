//! Integration tests for surveyor-core.
//!
//! These drive the full loop through the public API:
//! evaluate → outcome → learn → evaluate, with in-memory and JSON stores.

use std::sync::Arc;

use surveyor_core::{
    Arm, DecisionEngine, DecisionRule, EngineConfig, EngineStores, EvidenceSample, FnrRecord,
    MemoryCalibrationStore, OutcomeReport, SituationalFeatures, linalg,
};

fn features() -> SituationalFeatures {
    SituationalFeatures {
        property_category: Some("residential".into()),
        damage_category: Some("water".into()),
        region: Some("north".into()),
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

fn evidence() -> Vec<EvidenceSample> {
    vec![
        EvidenceSample::new("sam3", 0.9, 0.9),
        EvidenceSample::new("gpt4", 0.9, 0.8),
        EvidenceSample::new("sceneGraph", 0.9, 0.6),
    ]
}

/// Feed `n` assessments whose machine judgment always turns out correct.
fn train(engine: &DecisionEngine, n: usize) {
    for _ in 0..n {
        let d = engine.evaluate(&evidence(), &features(), None);
        engine
            .submit_outcome(&OutcomeReport {
                assessment_id: d.assessment_id,
                stratum: d.cp_stratum.clone(),
                decision_arm: d.arm,
                actual_outcome: true,
                critical_hazard_present: false,
            })
            .unwrap();
    }
}

// ---------------------------------------------------------------------------
// Learning loop
// ---------------------------------------------------------------------------

#[test]
fn reliable_stratum_earns_automation() {
    let engine = DecisionEngine::new(EngineConfig::default()).unwrap();

    let first = engine.evaluate(&evidence(), &features(), None);
    assert_eq!(first.arm, Arm::Escalate);

    train(&engine, 50);
    let d = engine.evaluate(&evidence(), &features(), None);
    assert_eq!(d.arm, Arm::Escalate, "stratum below 100 samples must escalate");
    assert!(d.cp_uncalibrated);

    train(&engine, 350);
    let d = engine.evaluate(&evidence(), &features(), None);
    assert!(!d.cp_uncalibrated);
    assert_eq!(d.rule, DecisionRule::RewardFavorable, "{}", d.reason);
    assert_eq!(d.arm, Arm::Automate);
    assert!(d.safety_ucb <= 0.1);
    assert!(d.reward_ucb > 0.5);
    assert!(d.cp_prediction_set.1 - d.cp_prediction_set.0 <= 0.2 + 1e-9);
}

#[test]
fn covariance_stays_positive_definite() {
    let engine = DecisionEngine::new(EngineConfig::default()).unwrap();
    train(&engine, 250);
    let snap = engine.model_snapshot();
    let a = linalg::matrix_from_rows("A", &snap.a).unwrap();
    let b = linalg::matrix_from_rows("B", &snap.b).unwrap();
    assert!(linalg::is_symmetric(&a, 1e-9));
    assert!(linalg::cholesky(&a).is_some());
    assert!(linalg::cholesky(&b).is_some());
}

// ---------------------------------------------------------------------------
// Safety gates on a trained model
// ---------------------------------------------------------------------------

#[test]
fn safety_bound_outranks_reward() {
    let stores = EngineStores::memory();
    let engine = DecisionEngine::with_stores(EngineConfig::default(), stores.clone()).unwrap();
    train(&engine, 400);
    assert!(engine.evaluate(&evidence(), &features(), None).is_automated());

    let mut cfg = EngineConfig::default();
    cfg.safety_threshold_by_category.insert("water".into(), 0.0);
    let strict = DecisionEngine::with_stores(cfg, stores).unwrap();
    let d = strict.evaluate(&evidence(), &features(), None);
    assert_eq!(d.arm, Arm::Escalate);
    assert_eq!(d.reason, "safety bound exceeded");
    assert!(d.reward_ucb > 0.5);
}

#[test]
fn fnr_at_limit_vetoes_automation() {
    let stores = EngineStores::memory();
    let engine = DecisionEngine::with_stores(EngineConfig::default(), stores.clone()).unwrap();
    train(&engine, 400);
    let stratum = engine.evaluate(&evidence(), &features(), None).cp_stratum;

    stores
        .fnr
        .save(&FnrRecord {
            stratum: stratum.clone(),
            total_automated: 20,
            false_negatives: 1,
        })
        .unwrap();
    let vetoed = DecisionEngine::with_stores(EngineConfig::default(), stores.clone()).unwrap();
    let d = vetoed.evaluate(&evidence(), &features(), None);
    assert_eq!(d.rule, DecisionRule::FnrConstraint);
    assert_eq!(d.reason, "stratum FNR constraint");

    // Dropping back below the limit restores automation.
    stores
        .fnr
        .save(&FnrRecord {
            stratum,
            total_automated: 21,
            false_negatives: 1,
        })
        .unwrap();
    let cleared = DecisionEngine::with_stores(EngineConfig::default(), stores).unwrap();
    assert!(cleared.evaluate(&evidence(), &features(), None).is_automated());
}

#[test]
fn automated_misses_trip_the_monitor() {
    let engine = DecisionEngine::new(EngineConfig::default()).unwrap();
    train(&engine, 400);

    // Judgment says "fine" but a hazard was present.
    let quiet = vec![EvidenceSample::new("sam3", 0.1, 0.9)];
    let stratum = engine.evaluate(&evidence(), &features(), None).cp_stratum;
    let mut misses = 0;
    while engine.fnr(&stratum).fnr() < 0.05 {
        misses += 1;
        assert!(misses < 100, "FNR never reached the limit");
        let d = engine.evaluate(&quiet, &features(), Some(&stratum));
        engine
            .submit_outcome(&OutcomeReport {
                assessment_id: d.assessment_id,
                stratum: stratum.clone(),
                decision_arm: Arm::Automate,
                actual_outcome: true,
                critical_hazard_present: true,
            })
            .unwrap();
    }
    for _ in 0..5 {
        assert!(!engine.evaluate(&evidence(), &features(), None).is_automated());
    }
}

#[test]
fn shadow_mode_keeps_underlying_rationale() {
    let stores = EngineStores::memory();
    let engine = DecisionEngine::with_stores(EngineConfig::default(), stores.clone()).unwrap();
    train(&engine, 400);
    let live = engine.evaluate(&evidence(), &features(), None);
    assert!(live.is_automated());

    let cfg = EngineConfig {
        shadow_mode_enabled: true,
        ..Default::default()
    };
    let shadow = DecisionEngine::with_stores(cfg, stores).unwrap();
    let d = shadow.evaluate(&evidence(), &features(), None);
    assert_eq!(d.arm, Arm::Escalate);
    assert!(d.shadow_mode_applied);
    assert_eq!(d.underlying_arm, Arm::Automate);
    assert_eq!(d.reason, live.reason);
    assert!((d.reward_ucb - live.reward_ucb).abs() < 1e-6);
    assert!((d.safety_ucb - live.safety_ucb).abs() < 1e-6);
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[test]
fn json_state_directory_survives_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let before = {
        let stores = EngineStores::json_dir(tmp.path()).unwrap();
        let engine = DecisionEngine::with_stores(EngineConfig::default(), stores).unwrap();
        train(&engine, 120);
        engine.evaluate(&evidence(), &features(), None)
    };
    assert!(tmp.path().join("model.json").exists());
    assert!(tmp.path().join("conformity.jsonl").exists());

    let stores = EngineStores::json_dir(tmp.path()).unwrap();
    let engine = DecisionEngine::with_stores(EngineConfig::default(), stores).unwrap();
    assert_eq!(engine.model_snapshot().version, 120);
    assert_eq!(engine.calibration_samples(&before.cp_stratum), 120);
    let after = engine.evaluate(&evidence(), &features(), None);
    assert_eq!(after.arm, before.arm);
    assert!((after.reward_ucb - before.reward_ucb).abs() < 1e-6);
}

#[test]
fn json_restart_replays_log_after_checkpoint() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = EngineConfig {
        calibration_checkpoint_every: 50,
        ..Default::default()
    };
    let stratum = {
        let stores = EngineStores::json_dir(tmp.path()).unwrap();
        let engine = DecisionEngine::with_stores(cfg.clone(), stores).unwrap();
        train(&engine, 120);
        engine.evaluate(&evidence(), &features(), None).cp_stratum
    };

    let stores = EngineStores::json_dir(tmp.path()).unwrap();
    let checkpoints = stores.calibration.load_all().unwrap();
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0].log_offset, 100);
    assert_eq!(checkpoints[0].sample_count, 100);

    let engine = DecisionEngine::with_stores(cfg, stores).unwrap();
    assert_eq!(engine.calibration_samples(&stratum), 120);
}

#[test]
fn strata_summary_lists_every_cohort() {
    let engine = DecisionEngine::new(EngineConfig::default()).unwrap();
    train(&engine, 3);
    let mut other = features();
    other.region = Some("south".into());
    let d = engine.evaluate(&evidence(), &other, None);
    engine
        .submit_outcome(&OutcomeReport {
            assessment_id: d.assessment_id,
            stratum: d.cp_stratum.clone(),
            decision_arm: d.arm,
            actual_outcome: false,
            critical_hazard_present: false,
        })
        .unwrap();

    let strata = engine.strata();
    assert_eq!(strata.len(), 2);
    assert!(strata.iter().all(|s| !s.calibrated));
    assert_eq!(strata.iter().map(|s| s.sample_count).sum::<usize>(), 4);
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[test]
fn concurrent_feedback_applies_every_outcome_in_order() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 150;

    let calibration = Arc::new(MemoryCalibrationStore::default());
    let stores = EngineStores {
        calibration: calibration.clone(),
        ..EngineStores::memory()
    };
    let engine = DecisionEngine::with_stores(EngineConfig::default(), stores).unwrap();

    // Each thread owns one stratum and remembers the order it reported in.
    let submitted: Vec<Vec<f64>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let engine = &engine;
                scope.spawn(move || {
                    let stratum = format!("S{t}");
                    let mut means = Vec::with_capacity(ROUNDS);
                    for i in 0..ROUNDS {
                        let p = 0.2 + (i % 60) as f64 / 100.0;
                        let samples = [
                            EvidenceSample::new("sam3", p, 0.9),
                            EvidenceSample::new("gpt4", p, 0.7),
                        ];
                        let d = engine.evaluate(&samples, &features(), Some(&stratum));
                        assert_ne!(d.rule, DecisionRule::Failure, "{}", d.reason);
                        engine
                            .submit_outcome(&OutcomeReport {
                                assessment_id: d.assessment_id,
                                stratum: d.cp_stratum.clone(),
                                decision_arm: d.arm,
                                actual_outcome: p >= 0.5,
                                critical_hazard_present: false,
                            })
                            .unwrap();
                        means.push(d.fusion_mean);
                    }
                    means
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let total = (THREADS * ROUNDS) as u64;
    let model = engine.model_snapshot();
    assert_eq!(model.observation_count, total);
    assert_eq!(model.version, total);
    assert_eq!(engine.pending_count(), 0);

    let log = calibration.appended();
    assert_eq!(log.len() as u64, total);
    for (t, means) in submitted.iter().enumerate() {
        let stratum = format!("S{t}");
        assert_eq!(engine.calibration_samples(&stratum), ROUNDS);
        let logged: Vec<f64> = log
            .iter()
            .filter(|r| r.stratum == stratum)
            .map(|r| r.predicted_probability)
            .collect();
        assert_eq!(&logged, means, "{stratum} applied out of order");
    }
}
