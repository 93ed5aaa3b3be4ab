//! # surveyor-core
//!
//! **Decide when a machine judgment may stand on its own.**
//!
//! `surveyor-core` is a safety-constrained online decision engine. For every
//! damage assessment it decides whether to auto-accept the machine-generated
//! judgment (`automate`) or route it to a human reviewer (`escalate`), and it
//! learns from labelled outcomes as they arrive.
//!
//! ## Quick Start
//!
//! ```no_run
//! use surveyor_core::{DecisionEngine, EngineConfig, EvidenceSample, SituationalFeatures};
//!
//! let engine = DecisionEngine::new(EngineConfig::default()).unwrap();
//! let evidence = [
//!     EvidenceSample::new("sam3", 0.82, 0.9),
//!     EvidenceSample::new("gpt4", 0.74, 0.7),
//! ];
//! let decision = engine.evaluate(&evidence, &SituationalFeatures::default(), None);
//! println!("{} ({})", decision.arm, decision.reason);
//! ```
//!
//! ## Architecture
//!
//! Evidence → Fusion → Conformal calibration (per stratum) → Context vector
//! → Safe bandit critic (+ FNR monitor) → Shadow mode → [`Decision`]
//!
//! Feedback flows backward: each [`OutcomeReport`] appends to the stratum's
//! conformity pool, takes one recursive-least-squares step on the reward and
//! safety models, and updates the stratum's false-negative rate.
//!
//! Failure to decide confidently is always an escalation: missing evidence,
//! malformed features, uncalibrated strata and elevated FNR all route to a
//! human.

pub mod bandit;
pub mod config;
pub mod conformal;
pub mod context;
pub mod decision;
pub mod engine;
pub mod error;
pub mod fusion;
pub mod linalg;
pub mod safety;
pub mod shadow;
pub mod store;

pub use bandit::{Arm, BanditModel, CriticParams, CriticVerdict, DecisionRule, SafeBanditCritic, UcbScore};
pub use config::EngineConfig;
pub use conformal::{CalibrationResult, ConformityRecord, MIN_SAMPLES, MondrianCalibrator, conformal_quantile};
pub use context::{AgeBucket, ContextVector, SituationalFeatures, build_context, stratum_key};
pub use decision::Decision;
pub use engine::{DecisionEngine, FeedbackSummary, OutcomeReport, PendingAssessment, StratumSummary};
pub use error::{EngineError, Result};
pub use fusion::{EvidenceSample, FusionResult, SourceWeights, fuse};
pub use safety::{FNR_LIMIT, FnrState, FnrTracker};
pub use shadow::apply_shadow;
pub use store::{
    CalibrationRecord, CalibrationStore, EngineStores, FnrRecord, FnrStore, JsonCalibrationStore,
    JsonFnrStore, JsonModelStore, MemoryCalibrationStore, MemoryFnrStore, MemoryModelStore,
    ModelSnapshot, ModelStore,
};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Milliseconds since the Unix epoch; 0 if the clock is before it.
pub(crate) fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
