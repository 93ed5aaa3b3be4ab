//! Statistical audit battery for the decision engine.
//!
//! Checks the two guarantees the engine makes from outcome logs alone:
//! conformal prediction sets cover the realised outcome at the target rate,
//! and automated decisions keep their false-negative rate under the limit.
//! Each test returns a [`TestResult`] with a p-value (where applicable), a
//! pass/fail determination and a letter grade (A through F).

use statrs::distribution::{Beta, Binomial, ContinuousCDF, DiscreteCDF};

// ═══════════════════════════════════════════════════════════════════════════════
// Core types
// ═══════════════════════════════════════════════════════════════════════════════

/// Result of a single audit test.
#[derive(Debug, Clone)]
pub struct TestResult {
    pub name: String,
    pub passed: bool,
    pub p_value: Option<f64>,
    pub statistic: f64,
    pub details: String,
    pub grade: char,
}

impl TestResult {
    /// Assign a letter grade based on p-value.
    ///
    /// - A: p >= 0.1
    /// - B: p >= 0.01
    /// - C: p >= 0.001
    /// - D: p >= 0.0001
    /// - F: otherwise or None
    pub fn grade_from_p(p: Option<f64>) -> char {
        match p {
            Some(p) if p >= 0.1 => 'A',
            Some(p) if p >= 0.01 => 'B',
            Some(p) if p >= 0.001 => 'C',
            Some(p) if p >= 0.0001 => 'D',
            _ => 'F',
        }
    }

    /// Determine pass/fail from p-value against a threshold (default 0.01).
    pub fn pass_from_p(p: Option<f64>, threshold: f64) -> bool {
        match p {
            Some(p) => p >= threshold,
            None => false,
        }
    }
}

/// Labelled history for one stratum.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct StratumAudit {
    pub stratum: String,
    /// Whether each labelled outcome fell inside its prediction set.
    pub covered: Vec<bool>,
    pub target_coverage: f64,
    pub total_automated: u64,
    pub false_negatives: u64,
    pub fnr_limit: f64,
}

/// Minimum labelled outcomes before coverage is tested.
pub const MIN_COVERAGE_SAMPLES: usize = 30;

// ═══════════════════════════════════════════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════════════════════════════════════════

/// Return a failing `TestResult` when data is too short.
fn insufficient(name: &str, needed: usize, got: usize) -> TestResult {
    TestResult {
        name: name.to_string(),
        passed: false,
        p_value: None,
        statistic: 0.0,
        details: format!("Insufficient data: need {needed}, got {got}"),
        grade: 'F',
    }
}

fn invalid(name: &str, details: String) -> TestResult {
    TestResult {
        name: name.to_string(),
        passed: false,
        p_value: None,
        statistic: 0.0,
        details,
        grade: 'F',
    }
}

/// `P(X ≤ k)` for `X ~ Binomial(n, p)`.
fn binomial_cdf(k: u64, n: u64, p: f64) -> Option<f64> {
    Binomial::new(p, n).ok().map(|d| d.cdf(k))
}

/// `P(X ≥ k)` for `X ~ Binomial(n, p)`.
fn binomial_upper_tail(k: u64, n: u64, p: f64) -> Option<f64> {
    if k == 0 {
        return Some(1.0);
    }
    binomial_cdf(k - 1, n, p).map(|c| (1.0 - c).clamp(0.0, 1.0))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Intervals
// ═══════════════════════════════════════════════════════════════════════════════

/// One-sided Clopper–Pearson upper bound on an FNR at `confidence`.
///
/// Exact for binomial counts; returns 1.0 when nothing was automated or
/// every automation was a miss.
pub fn fnr_upper_bound(total_automated: u64, false_negatives: u64, confidence: f64) -> f64 {
    let k = false_negatives.min(total_automated);
    if total_automated == 0 || k == total_automated {
        return 1.0;
    }
    match Beta::new((k + 1) as f64, (total_automated - k) as f64) {
        Ok(dist) => dist.inverse_cdf(confidence.clamp(0.0, 1.0)),
        Err(_) => 1.0,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

/// Empirical coverage of the conformal prediction sets.
///
/// One-sided exact binomial test of `H0: coverage ≥ target`; the p-value is
/// `P(X ≤ covered | n, target)`.
pub fn coverage_test(covered: &[bool], target: f64) -> TestResult {
    let name = "Conformal Coverage";
    let n = covered.len();
    if n < MIN_COVERAGE_SAMPLES {
        return insufficient(name, MIN_COVERAGE_SAMPLES, n);
    }
    if !(target > 0.0 && target < 1.0) {
        return invalid(name, format!("target coverage must be in (0, 1), got {target}"));
    }
    let hits = covered.iter().filter(|&&c| c).count() as u64;
    let Some(p) = binomial_cdf(hits, n as u64, target) else {
        return invalid(name, "binomial distribution rejected parameters".to_string());
    };
    let rate = hits as f64 / n as f64;
    TestResult {
        name: name.to_string(),
        passed: TestResult::pass_from_p(Some(p), 0.01),
        p_value: Some(p),
        statistic: rate,
        details: format!("covered={hits}/{n} ({rate:.4}), target={target:.4}"),
        grade: TestResult::grade_from_p(Some(p)),
    }
}

/// Whether automation has kept its false-negative rate within `limit`.
///
/// One-sided exact binomial test of `H0: fnr ≤ limit`; the p-value is
/// `P(X ≥ false_negatives | total_automated, limit)`. The statistic is the
/// 95% Clopper–Pearson upper bound.
pub fn fnr_test(total_automated: u64, false_negatives: u64, limit: f64) -> TestResult {
    let name = "Automation FNR";
    if total_automated == 0 {
        return TestResult {
            name: name.to_string(),
            passed: true,
            p_value: None,
            statistic: 0.0,
            details: "no automated decisions".to_string(),
            grade: 'A',
        };
    }
    if !(limit > 0.0 && limit < 1.0) {
        return invalid(name, format!("FNR limit must be in (0, 1), got {limit}"));
    }
    let k = false_negatives.min(total_automated);
    let Some(p) = binomial_upper_tail(k, total_automated, limit) else {
        return invalid(name, "binomial distribution rejected parameters".to_string());
    };
    let upper = fnr_upper_bound(total_automated, k, 0.95);
    let fnr = k as f64 / total_automated as f64;
    TestResult {
        name: name.to_string(),
        passed: TestResult::pass_from_p(Some(p), 0.01),
        p_value: Some(p),
        statistic: upper,
        details: format!(
            "misses={k}/{total_automated} (fnr={fnr:.4}, 95% upper={upper:.4}), limit={limit:.4}"
        ),
        grade: TestResult::grade_from_p(Some(p)),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Test battery
// ═══════════════════════════════════════════════════════════════════════════════

/// Run every audit test for one stratum.
pub fn run_stratum_audit(audit: &StratumAudit) -> Vec<TestResult> {
    vec![
        coverage_test(&audit.covered, audit.target_coverage),
        fnr_test(audit.total_automated, audit.false_negatives, audit.fnr_limit),
    ]
}

/// Calculate overall quality score (0-100) from test results.
///
/// Each grade maps to a score: A=100, B=75, C=50, D=25, F=0.
/// Returns the average across all tests.
pub fn calculate_quality_score(results: &[TestResult]) -> f64 {
    if results.is_empty() {
        return 0.0;
    }
    let total: f64 = results
        .iter()
        .map(|r| match r.grade {
            'A' => 100.0,
            'B' => 75.0,
            'C' => 50.0,
            'D' => 25.0,
            _ => 0.0,
        })
        .sum();
    total / results.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coverage(hits: usize, n: usize) -> Vec<bool> {
        (0..n).map(|i| i < hits).collect()
    }

    #[test]
    fn test_grade_from_p() {
        assert_eq!(TestResult::grade_from_p(Some(0.5)), 'A');
        assert_eq!(TestResult::grade_from_p(Some(0.05)), 'B');
        assert_eq!(TestResult::grade_from_p(Some(0.005)), 'C');
        assert_eq!(TestResult::grade_from_p(Some(0.0005)), 'D');
        assert_eq!(TestResult::grade_from_p(Some(0.00000001)), 'F');
        assert_eq!(TestResult::grade_from_p(None), 'F');
    }

    #[test]
    fn test_pass_from_p() {
        assert!(TestResult::pass_from_p(Some(0.05), 0.01));
        assert!(!TestResult::pass_from_p(Some(0.005), 0.01));
        assert!(!TestResult::pass_from_p(None, 0.01));
    }

    #[test]
    fn test_binomial_tails() {
        // Bin(2, 0.5): P(X ≤ 0) = 0.25, P(X ≥ 2) = 0.25.
        assert!((binomial_cdf(0, 2, 0.5).unwrap() - 0.25).abs() < 1e-12);
        assert!((binomial_upper_tail(2, 2, 0.5).unwrap() - 0.25).abs() < 1e-12);
        assert_eq!(binomial_upper_tail(0, 10, 0.3), Some(1.0));
    }

    // -----------------------------------------------------------------------
    // Coverage
    // -----------------------------------------------------------------------

    #[test]
    fn test_coverage_insufficient() {
        let result = coverage_test(&coverage(10, 10), 0.95);
        assert!(!result.passed);
        assert!(result.details.contains("Insufficient"));
    }

    #[test]
    fn test_coverage_at_target_passes() {
        let result = coverage_test(&coverage(190, 200), 0.95);
        assert!(result.passed, "{}", result.details);
        assert!((result.statistic - 0.95).abs() < 1e-12);
    }

    #[test]
    fn test_coverage_well_below_target_fails() {
        let result = coverage_test(&coverage(160, 200), 0.95);
        assert!(!result.passed);
        assert_eq!(result.grade, 'F');
    }

    #[test]
    fn test_coverage_rejects_bad_target() {
        assert!(!coverage_test(&coverage(50, 50), 1.0).passed);
    }

    // -----------------------------------------------------------------------
    // FNR
    // -----------------------------------------------------------------------

    #[test]
    fn test_fnr_upper_bound() {
        assert_eq!(fnr_upper_bound(0, 0, 0.95), 1.0);
        assert_eq!(fnr_upper_bound(5, 5, 0.95), 1.0);
        // Zero misses: upper bound is 1 − (1 − c)^(1/n).
        let expected = 1.0 - 0.05f64.powf(1.0 / 100.0);
        assert!((fnr_upper_bound(100, 0, 0.95) - expected).abs() < 1e-6);
        // More misses, higher bound.
        assert!(fnr_upper_bound(100, 3, 0.95) > fnr_upper_bound(100, 1, 0.95));
    }

    #[test]
    fn test_fnr_no_automation_passes() {
        let result = fnr_test(0, 0, 0.05);
        assert!(result.passed);
        assert!(result.p_value.is_none());
    }

    #[test]
    fn test_fnr_clean_history_passes() {
        let result = fnr_test(500, 5, 0.05);
        assert!(result.passed, "{}", result.details);
        assert!(result.statistic < 0.05);
    }

    #[test]
    fn test_fnr_breach_fails() {
        let result = fnr_test(200, 30, 0.05);
        assert!(!result.passed);
        assert!(result.statistic > 0.1);
    }

    // -----------------------------------------------------------------------
    // Battery
    // -----------------------------------------------------------------------

    #[test]
    fn test_stratum_audit() {
        let audit = StratumAudit {
            stratum: "residential|age_25_50|north|water".into(),
            covered: coverage(97, 100),
            target_coverage: 0.95,
            total_automated: 80,
            false_negatives: 0,
            fnr_limit: 0.05,
        };
        let results = run_stratum_audit(&audit);
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.passed));
        assert_eq!(calculate_quality_score(&results), 100.0);
    }

    #[test]
    fn test_quality_score() {
        let results = vec![
            TestResult {
                name: "A".into(),
                passed: true,
                p_value: Some(0.5),
                statistic: 0.0,
                details: String::new(),
                grade: 'A',
            },
            TestResult {
                name: "F".into(),
                passed: false,
                p_value: Some(0.0),
                statistic: 0.0,
                details: String::new(),
                grade: 'F',
            },
        ];
        let score = calculate_quality_score(&results);
        assert!((score - 50.0).abs() < 0.01);
    }

    #[test]
    fn test_calculate_quality_score_empty() {
        assert_eq!(calculate_quality_score(&[]), 0.0);
    }
}
