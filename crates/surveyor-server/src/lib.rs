//! HTTP decision server.
//!
//! Thin JSON front-end over a shared [`DecisionEngine`]: callers post
//! assessments to `/api/v1/evaluate` and labelled outcomes to
//! `/api/v1/outcome`. Evaluation failures still answer 200 with an
//! `escalate` decision; only malformed feedback is an HTTP error.

use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use surveyor_core::{
    Decision, DecisionEngine, EngineError, EvidenceSample, FeedbackSummary, ModelSnapshot,
    OutcomeReport, SituationalFeatures, StratumSummary,
};

/// Shared server state.
struct AppState {
    engine: Arc<DecisionEngine>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EvaluateRequest {
    evidence: Vec<EvidenceSample>,
    #[serde(default)]
    situational: SituationalFeatures,
    /// Overrides the stratum derived from `situational`.
    stratum: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    success: bool,
    error: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: String,
    shadow_mode: bool,
    observations: u64,
    model_version: u64,
    pending: usize,
    strata: usize,
    vetoed_strata: usize,
}

#[derive(Debug, Serialize)]
struct StrataResponse {
    strata: Vec<StratumSummary>,
    total: usize,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::UnknownAssessment(_) => StatusCode::NOT_FOUND,
        EngineError::StratumMismatch { .. } => StatusCode::CONFLICT,
        EngineError::InvalidFeedback(_) | EngineError::MalformedFeatures(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        EngineError::InsufficientEvidence(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn api_error(err: EngineError) -> ApiError {
    (
        status_for(&err),
        Json(ErrorResponse {
            success: false,
            error: err.to_string(),
        }),
    )
}

async fn handle_evaluate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EvaluateRequest>,
) -> Json<Decision> {
    let decision =
        state
            .engine
            .evaluate(&req.evidence, &req.situational, req.stratum.as_deref());
    Json(decision)
}

async fn handle_outcome(
    State(state): State<Arc<AppState>>,
    Json(report): Json<OutcomeReport>,
) -> Result<Json<FeedbackSummary>, ApiError> {
    // Store writes are blocking file I/O for the JSON stores.
    let engine = Arc::clone(&state.engine);
    let result = tokio::task::spawn_blocking(move || engine.submit_outcome(&report))
        .await
        .map_err(|e| api_error(EngineError::Store(format!("feedback task failed: {e}"))))?;
    result.map(Json).map_err(|e| {
        log::warn!("outcome rejected: {e}");
        api_error(e)
    })
}

async fn handle_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let strata = state.engine.strata();
    let vetoed = strata.iter().filter(|s| s.automation_vetoed).count();
    let model = state.engine.model_snapshot();
    Json(HealthResponse {
        status: if vetoed == 0 {
            "healthy".to_string()
        } else {
            "degraded".to_string()
        },
        shadow_mode: state.engine.config().shadow_mode_enabled,
        observations: model.observation_count,
        model_version: model.version,
        pending: state.engine.pending_count(),
        strata: strata.len(),
        vetoed_strata: vetoed,
    })
}

async fn handle_strata(State(state): State<Arc<AppState>>) -> Json<StrataResponse> {
    let strata = state.engine.strata();
    let total = strata.len();
    Json(StrataResponse { strata, total })
}

async fn handle_model(State(state): State<Arc<AppState>>) -> Json<ModelSnapshot> {
    Json(state.engine.model_snapshot())
}

async fn handle_index(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": "Surveyor Decision Server",
        "version": surveyor_core::VERSION,
        "shadowMode": state.engine.config().shadow_mode_enabled,
        "endpoints": {
            "/": "This API index",
            "/api/v1/evaluate": {
                "method": "POST",
                "description": "Decide automate/escalate for one assessment",
                "body": {
                    "evidence": "[{sourceId, probability, confidence}, ...]",
                    "situational": "Situational features (camelCase)",
                    "stratum": "Optional stratum key override",
                }
            },
            "/api/v1/outcome": {
                "method": "POST",
                "description": "Submit a labelled outcome for a previous assessment",
                "body": {
                    "assessmentId": "UUID returned by /api/v1/evaluate",
                    "stratum": "Stratum the assessment was evaluated under",
                    "decisionArm": "automate | escalate (as enacted)",
                    "actualOutcome": "bool",
                    "criticalHazardPresent": "bool",
                }
            },
            "/strata": "Per-stratum calibration and FNR state",
            "/model": "Current bandit model snapshot",
            "/health": "Health check",
        }
    }))
}

/// Build the axum router.
fn build_router(engine: Arc<DecisionEngine>) -> Router {
    let state = Arc::new(AppState { engine });

    Router::new()
        .route("/", get(handle_index))
        .route("/api/v1/evaluate", post(handle_evaluate))
        .route("/api/v1/outcome", post(handle_outcome))
        .route("/health", get(handle_health))
        .route("/strata", get(handle_strata))
        .route("/model", get(handle_model))
        .with_state(state)
}

/// Run the HTTP decision server until the listener fails.
pub async fn run_server(engine: Arc<DecisionEngine>, host: &str, port: u16) -> std::io::Result<()> {
    let app = build_router(engine);
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("listening on http://{addr}");
    axum::serve(listener, app).await
}
