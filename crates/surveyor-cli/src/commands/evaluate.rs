use std::io::Read;

use serde::Deserialize;
use surveyor_core::{Decision, EvidenceSample, SituationalFeatures};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EvaluateInput {
    evidence: Vec<EvidenceSample>,
    #[serde(default)]
    situational: SituationalFeatures,
    stratum: Option<String>,
}

fn read_input(input: &str) -> std::io::Result<String> {
    if input == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        Ok(buf)
    } else {
        std::fs::read_to_string(input)
    }
}

pub fn run(input: &str, config_path: Option<&str>, state_dir: Option<&str>, json: bool) {
    let raw = read_input(input).unwrap_or_else(|e| super::fail(format!("{input}: {e}")));
    let request: EvaluateInput =
        serde_json::from_str(&raw).unwrap_or_else(|e| super::fail(format!("{input}: {e}")));

    let engine = super::make_engine(super::load_config(config_path), state_dir);
    let decision = engine.evaluate(
        &request.evidence,
        &request.situational,
        request.stratum.as_deref(),
    );

    if json {
        match serde_json::to_string_pretty(&decision) {
            Ok(s) => println!("{s}"),
            Err(e) => super::fail(e),
        }
    } else {
        print_decision(&decision);
    }
}

fn print_decision(d: &Decision) {
    let arm = if d.is_automated() { "AUTOMATE" } else { "ESCALATE" };
    println!("{arm}  ({})", d.reason);
    if d.shadow_mode_applied {
        println!("  shadow mode applied; rule chose {}", d.underlying_arm);
    }
    println!("  assessment     {}", d.assessment_id);
    println!("  stratum        {}", d.cp_stratum);
    println!(
        "  fusion         mean={:.4} variance={:.4}",
        d.fusion_mean, d.fusion_variance
    );
    println!(
        "  prediction set [{:.4}, {:.4}]{}",
        d.cp_prediction_set.0,
        d.cp_prediction_set.1,
        if d.cp_uncalibrated { " (uncalibrated)" } else { "" }
    );
    println!("  safety UCB     {:.4}", d.safety_ucb);
    println!(
        "  reward UCB     {:.4}{}",
        d.reward_ucb,
        if d.exploration { " (exploration)" } else { "" }
    );
}
