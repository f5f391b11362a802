//! Run lifecycle HTTP handlers.
//!
//! Endpoints:
//! - POST   /api/v1/runs                    - Start a run
//! - GET    /api/v1/runs                    - List stored runs
//! - POST   /api/v1/runs/replay             - Start a run from a saved scenario
//! - DELETE /api/v1/runs/{id}               - Delete a run
//! - POST   /api/v1/runs/{id}/advance       - Run until blocked or one step
//! - POST   /api/v1/runs/{id}/cancel        - Cancel an in-flight advance
//! - POST   /api/v1/runs/{id}/choose        - Pick an outcome
//! - POST   /api/v1/runs/{id}/choice        - Answer a choice
//! - POST   /api/v1/runs/{id}/evidence      - Submit evidence or approval
//! - GET    /api/v1/runs/{id}/variables     - Merged variables and captures
//! - GET    /api/v1/runs/{id}/manifest      - Outline, pending step, stack
//! - POST   /api/v1/runs/{id}/scenario      - Save a replay scenario

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;

use axum::Json;
use axum::extract::{Path, State};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use runbook_core::runbook::engine::{AdvanceMode, AdvanceResult};
use runbook_core::runbook::routing::OutcomeSelector;
use runbook_core::service::runbook::{Manifest, RunSummary};
use runbook_infra::filesystem::LocalFileSystem;
use runbook_types::session::{RunMode, SessionSummary};

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct StartRunRequest {
    pub workflow: PathBuf,
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct ReplayRequest {
    /// Scenario file or the directory holding `scenario.json`.
    pub scenario: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct AdvanceRequest {
    /// Stop after one step instead of running until blocked.
    #[serde(default)]
    pub step: bool,
}

#[derive(Debug, Deserialize)]
pub struct ChooseRequest {
    /// Outcome index or state name.
    pub outcome: OutcomeSelector,
}

#[derive(Debug, Deserialize)]
pub struct ChoiceRequest {
    pub variable: String,
    pub value: String,
}

#[derive(Debug, Deserialize)]
pub struct EvidenceRequest {
    pub step_id: String,
    #[serde(default)]
    pub evidence: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct ScenarioRequest {
    /// Defaults to `{data_dir}/scenarios/{run_id}`.
    pub dir: Option<PathBuf>,
}

/// Parse a UUID from a path parameter, returning a 400 error on invalid format.
fn parse_uuid(s: &str) -> Result<Uuid, AppError> {
    s.parse::<Uuid>()
        .map_err(|_| AppError::Validation(format!("Invalid UUID: {s}")))
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// POST /api/v1/runs - Start a run.
pub async fn start_run(
    State(state): State<AppState>,
    Json(body): Json<StartRunRequest>,
) -> Result<Json<ApiResponse<RunSummary>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let summary = state
        .runbook_service
        .start(&body.workflow, body.variables, RunMode::Live)
        .await?;

    tracing::info!(run_id = %summary.run_id, workflow = %summary.workflow.display(), "run started over HTTP");

    let link = format!("/api/v1/runs/{}", summary.run_id);
    let resp = ApiResponse::success(summary, request_id, elapsed_ms(start))
        .with_link("advance", &format!("{link}/advance"))
        .with_link("manifest", &format!("{link}/manifest"));
    Ok(Json(resp))
}

/// POST /api/v1/runs/replay - Start a run answered from a saved scenario.
pub async fn replay_run(
    State(state): State<AppState>,
    Json(body): Json<ReplayRequest>,
) -> Result<Json<ApiResponse<RunSummary>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let summary = state.runbook_service.replay(&body.scenario).await?;

    let link = format!("/api/v1/runs/{}", summary.run_id);
    let resp = ApiResponse::success(summary, request_id, elapsed_ms(start))
        .with_link("advance", &format!("{link}/advance"));
    Ok(Json(resp))
}

/// GET /api/v1/runs - List stored runs, newest first.
pub async fn list_runs(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<SessionSummary>>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let runs = state.runbook_service.list_runs().await?;

    let resp = ApiResponse::success(runs, request_id, elapsed_ms(start))
        .with_link("self", "/api/v1/runs");
    Ok(Json(resp))
}

/// DELETE /api/v1/runs/{id} - Delete a stored run.
pub async fn delete_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();
    let run_id = parse_uuid(&id)?;

    state.runbook_service.delete_run(run_id).await?;

    let resp = ApiResponse::success(
        serde_json::json!({ "deleted": true, "run_id": run_id }),
        request_id,
        elapsed_ms(start),
    );
    Ok(Json(resp))
}

/// POST /api/v1/runs/{id}/advance - Run until the operator is needed, or
/// by one step.
pub async fn advance_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<AdvanceRequest>>,
) -> Result<Json<ApiResponse<AdvanceResult>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();
    let run_id = parse_uuid(&id)?;

    let step = body.is_some_and(|Json(body)| body.step);
    let mode = if step {
        AdvanceMode::SingleStep
    } else {
        AdvanceMode::UntilBlocked
    };

    let result = state.runbook_service.advance(run_id, mode).await?;

    let resp = ApiResponse::success(result, request_id, elapsed_ms(start))
        .with_link("manifest", &format!("/api/v1/runs/{run_id}/manifest"));
    Ok(Json(resp))
}

/// POST /api/v1/runs/{id}/cancel - Cancel an advance in flight.
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();
    let run_id = parse_uuid(&id)?;

    let cancelled = state.runbook_service.cancel(run_id);

    let resp = ApiResponse::success(
        serde_json::json!({ "cancelled": cancelled, "run_id": run_id }),
        request_id,
        elapsed_ms(start),
    );
    Ok(Json(resp))
}

// ---------------------------------------------------------------------------
// Operator input
// ---------------------------------------------------------------------------

/// POST /api/v1/runs/{id}/choose - Resolve the pending step with an outcome.
pub async fn choose_outcome(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ChooseRequest>,
) -> Result<Json<ApiResponse<AdvanceResult>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();
    let run_id = parse_uuid(&id)?;

    let result = state
        .runbook_service
        .choose_outcome(run_id, &body.outcome)
        .await?;

    Ok(Json(ApiResponse::success(result, request_id, elapsed_ms(start))))
}

/// POST /api/v1/runs/{id}/choice - Answer the pending choice.
pub async fn submit_choice(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ChoiceRequest>,
) -> Result<Json<ApiResponse<AdvanceResult>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();
    let run_id = parse_uuid(&id)?;

    let result = state
        .runbook_service
        .submit_choice(run_id, &body.variable, &body.value)
        .await?;

    Ok(Json(ApiResponse::success(result, request_id, elapsed_ms(start))))
}

/// POST /api/v1/runs/{id}/evidence - Submit evidence, approval, or an
/// acknowledgment.
pub async fn submit_evidence(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<EvidenceRequest>,
) -> Result<Json<ApiResponse<AdvanceResult>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();
    let run_id = parse_uuid(&id)?;

    let result = state
        .runbook_service
        .submit_evidence(run_id, &body.step_id, body.evidence)
        .await?;

    Ok(Json(ApiResponse::success(result, request_id, elapsed_ms(start))))
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// GET /api/v1/runs/{id}/variables - Variables with captures applied.
pub async fn get_variables(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<BTreeMap<String, Value>>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();
    let run_id = parse_uuid(&id)?;

    let variables = state.runbook_service.get_variables(run_id).await?;

    Ok(Json(ApiResponse::success(variables, request_id, elapsed_ms(start))))
}

/// GET /api/v1/runs/{id}/manifest - Where the run stands.
pub async fn get_manifest(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Manifest>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();
    let run_id = parse_uuid(&id)?;

    let manifest = state.runbook_service.get_manifest(run_id).await?;

    let resp = ApiResponse::success(manifest, request_id, elapsed_ms(start))
        .with_link("self", &format!("/api/v1/runs/{run_id}/manifest"))
        .with_link("variables", &format!("/api/v1/runs/{run_id}/variables"));
    Ok(Json(resp))
}

/// POST /api/v1/runs/{id}/scenario - Save the run as a replay scenario.
pub async fn save_scenario(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<ScenarioRequest>>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();
    let run_id = parse_uuid(&id)?;

    let dir = body
        .and_then(|Json(body)| body.dir)
        .unwrap_or_else(|| LocalFileSystem::scenario_dir(&state.data_dir, &run_id));

    let path = state.runbook_service.save_scenario(run_id, &dir).await?;

    let resp = ApiResponse::success(
        serde_json::json!({ "run_id": run_id, "path": path }),
        request_id,
        elapsed_ms(start),
    );
    Ok(Json(resp))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uuid_rejects_garbage() {
        assert!(matches!(parse_uuid("nope"), Err(AppError::Validation(_))));
        let id = Uuid::now_v7();
        assert_eq!(parse_uuid(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn test_choose_request_accepts_index_or_state() {
        let by_index: ChooseRequest = serde_json::from_str(r#"{"outcome": 1}"#).unwrap();
        assert_eq!(by_index.outcome, OutcomeSelector::Index(1));

        let by_state: ChooseRequest = serde_json::from_str(r#"{"outcome": "fixed"}"#).unwrap();
        assert_eq!(by_state.outcome, OutcomeSelector::State("fixed".to_string()));
    }

    #[test]
    fn test_evidence_request_defaults() {
        let body: EvidenceRequest = serde_json::from_str(r#"{"step_id": "verify"}"#).unwrap();
        assert_eq!(body.step_id, "verify");
        assert!(body.evidence.is_empty());
    }
}
