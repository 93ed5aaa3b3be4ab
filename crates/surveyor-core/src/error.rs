//! Error taxonomy for the decision core.
//!
//! Per-assessment errors ([`EngineError::InsufficientEvidence`],
//! [`EngineError::MalformedFeatures`]) are fatal to that assessment only and
//! degrade to an escalation in [`crate::engine::DecisionEngine::evaluate`].
//! [`EngineError::SingularModel`] and [`EngineError::InvalidConfig`] can only
//! surface at construction time.

/// Errors produced by the decision core.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    /// No usable detector samples were supplied.
    #[error("insufficient evidence: {0}")]
    InsufficientEvidence(String),

    /// A situational feature is missing or non-finite.
    #[error("malformed features: {0}")]
    MalformedFeatures(String),

    /// Ridge regularization would leave the covariance matrices singular.
    #[error("singular model: ridge lambda must be finite and > 0, got {0}")]
    SingularModel(f64),

    /// A configuration value failed validation.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// A persisted record does not have the compile-time dimensionality.
    #[error("dimension mismatch in {field}: expected {expected}, got {got}")]
    DimensionMismatch {
        field: &'static str,
        expected: usize,
        got: usize,
    },

    /// Feedback referenced an assessment the engine has no record of.
    #[error("unknown assessment: {0}")]
    UnknownAssessment(String),

    /// Feedback named a different stratum than the one evaluated.
    #[error("stratum mismatch: assessment was evaluated under '{expected}', feedback says '{got}'")]
    StratumMismatch { expected: String, got: String },

    /// Feedback payload is unusable (non-finite reward, etc.).
    #[error("invalid feedback: {0}")]
    InvalidFeedback(String),

    /// A persistence sink failed.
    #[error("store error: {0}")]
    Store(String),
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        Self::Store(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Store(e.to_string())
    }
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, EngineError>;
