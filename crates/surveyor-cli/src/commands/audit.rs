//! Offline audit of a state directory.
//!
//! Coverage is measured by replaying `conformity.jsonl` in order: each
//! labelled outcome is checked against the conformal quantile of the scores
//! that preceded it in its stratum, exactly as the engine would have seen
//! them. FNR counters come from the FNR store.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;

use surveyor_core::{ConformityRecord, EngineConfig, EngineStores, conformal_quantile};
use surveyor_tests::{StratumAudit, TestResult};

/// Rolling per-stratum replay state.
#[derive(Default)]
struct Replay {
    window: VecDeque<f64>,
    sorted: Vec<f64>,
    covered: Vec<bool>,
}

impl Replay {
    fn observe(&mut self, score: f64, min_samples: usize, window: usize, alpha: f64) {
        if self.sorted.len() >= min_samples {
            if let Some(q) = conformal_quantile(&self.sorted, alpha) {
                self.covered.push(score <= q);
            }
        }
        let at = self.sorted.partition_point(|&s| s < score);
        self.sorted.insert(at, score);
        self.window.push_back(score);
        while self.window.len() > window {
            if let Some(old) = self.window.pop_front() {
                let at = self.sorted.partition_point(|&s| s < old);
                self.sorted.remove(at);
            }
        }
    }
}

/// Replay a conformity log into per-stratum coverage outcomes.
fn replay(records: &[ConformityRecord], config: &EngineConfig) -> BTreeMap<String, Vec<bool>> {
    let mut strata: BTreeMap<String, Replay> = BTreeMap::new();
    for r in records {
        strata.entry(r.stratum.clone()).or_default().observe(
            r.conformity_score,
            config.min_calibration_samples,
            config.calibration_window,
            config.alpha(),
        );
    }
    strata.into_iter().map(|(k, v)| (k, v.covered)).collect()
}

pub fn run(state_dir: &str, config_path: Option<&str>, output_path: Option<&str>) {
    let config = super::load_config(config_path);
    let dir = Path::new(state_dir);
    if !dir.is_dir() {
        super::fail(format!("state directory '{state_dir}' does not exist"));
    }
    let stores = EngineStores::json_dir(dir).unwrap_or_else(|e| super::fail(e));

    let records = stores.calibration.load_log().unwrap_or_else(|e| super::fail(e));
    let coverage = replay(&records, &config);
    let fnr = stores.fnr.load_all().unwrap_or_else(|e| super::fail(e));

    let mut audits: BTreeMap<String, StratumAudit> = BTreeMap::new();
    for (stratum, covered) in coverage {
        audits.insert(
            stratum.clone(),
            StratumAudit {
                stratum,
                covered,
                target_coverage: config.coverage_level,
                fnr_limit: config.fnr_limit,
                ..Default::default()
            },
        );
    }
    for r in fnr {
        let entry = audits.entry(r.stratum.clone()).or_insert_with(|| StratumAudit {
            stratum: r.stratum.clone(),
            target_coverage: config.coverage_level,
            fnr_limit: config.fnr_limit,
            ..Default::default()
        });
        entry.total_automated = r.total_automated;
        entry.false_negatives = r.false_negatives;
    }

    if audits.is_empty() {
        super::fail(format!("no outcomes recorded under '{state_dir}'"));
    }

    println!(
        "🔬 Auditing {} strata from {} labelled outcomes...\n",
        audits.len(),
        records.len()
    );

    let mut all = Vec::new();
    for audit in audits.values() {
        let results = surveyor_tests::run_stratum_audit(audit);
        let score = surveyor_tests::calculate_quality_score(&results);
        println!("{} → {score:.0}/100", super::truncate(&audit.stratum, 60));
        for r in &results {
            println!("  {}", super::result_row(r));
        }
        all.push((audit.stratum.clone(), results));
    }

    let flat: Vec<TestResult> = all.iter().flat_map(|(_, r)| r.iter().cloned()).collect();
    let passed = flat.iter().filter(|r| r.passed).count();
    println!(
        "\n{passed}/{} checks passed, overall {:.0}/100",
        flat.len(),
        surveyor_tests::calculate_quality_score(&flat)
    );

    if let Some(path) = output_path {
        let report = generate_report(state_dir, &all);
        if let Err(e) = std::fs::write(path, &report) {
            eprintln!("Failed to write report to {path}: {e}");
        } else {
            println!("\n📄 Report saved to: {path}");
        }
    }
}

fn generate_report(state_dir: &str, results: &[(String, Vec<TestResult>)]) -> String {
    let mut report = String::new();
    report.push_str("# Surveyor — Coverage & FNR Audit\n\n");
    report.push_str(&format!("State: `{state_dir}`\n\n"));

    for (stratum, tests) in results {
        let score = surveyor_tests::calculate_quality_score(tests);
        let passed = tests.iter().filter(|r| r.passed).count();
        report.push_str(&format!("## {stratum}\n\n"));
        report.push_str(&format!(
            "- Score: {:.1}/100\n- Passed: {}/{}\n\n",
            score,
            passed,
            tests.len()
        ));
        report.push_str("| Test | P | Grade | p-value | Statistic | Details |\n");
        report.push_str("|------|---|-------|---------|-----------|--------|\n");
        for t in tests {
            let ok = if t.passed { "✓" } else { "✗" };
            let pval = t
                .p_value
                .map(|p| format!("{p:.6}"))
                .unwrap_or_else(|| "—".to_string());
            report.push_str(&format!(
                "| {} | {} | {} | {} | {:.4} | {} |\n",
                t.name, ok, t.grade, pval, t.statistic, t.details
            ));
        }
        report.push_str("\n---\n\n");
    }
    report
}
