pub mod audit;
pub mod config;
pub mod evaluate;
pub mod serve;
pub mod simulate;

use std::path::Path;

use surveyor_core::{DecisionEngine, EngineConfig, EngineStores};

/// Print an error and exit non-zero.
pub fn fail(msg: impl std::fmt::Display) -> ! {
    eprintln!("Error: {msg}");
    std::process::exit(1);
}

/// Load a config file, or defaults when no path is given.
pub fn load_config(path: Option<&str>) -> EngineConfig {
    match path {
        Some(p) => EngineConfig::load(Path::new(p)).unwrap_or_else(|e| fail(e)),
        None => EngineConfig::default(),
    }
}

/// Build an engine, backed by JSON stores when a state directory is given.
pub fn make_engine(config: EngineConfig, state_dir: Option<&str>) -> DecisionEngine {
    let result = match state_dir {
        Some(dir) => EngineStores::json_dir(Path::new(dir))
            .and_then(|stores| DecisionEngine::with_stores(config, stores)),
        None => DecisionEngine::new(config),
    };
    result.unwrap_or_else(|e| fail(e))
}

/// Render a test result row with a pass mark.
pub fn result_row(t: &surveyor_tests::TestResult) -> String {
    let ok = if t.passed { "✓" } else { "✗" };
    let pval = t
        .p_value
        .map(|p| format!("{p:.4}"))
        .unwrap_or_else(|| "—".to_string());
    format!(
        "{ok} {:<20} {:>5} {:>8} {:>8.4}  {}",
        t.name, t.grade, pval, t.statistic, t.details
    )
}

/// Clip long stratum keys for table output.
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{head}…")
    }
}
