//! Application error type mapping to HTTP status codes and envelope format.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use runbook_core::runbook::checkpoint::CheckpointError;
use runbook_core::runbook::definition::RunbookError;
use runbook_core::runbook::engine::EngineError;
use runbook_core::runbook::scenario::ScenarioError;
use runbook_core::runbook::session::SessionError;
use runbook_core::service::runbook::ServiceError;

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    Service(ServiceError),
    /// Malformed request.
    Validation(String),
}

impl From<ServiceError> for AppError {
    fn from(e: ServiceError) -> Self {
        AppError::Service(e)
    }
}

impl AppError {
    /// Status code and machine-readable code for this error.
    pub fn classify(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Service(ServiceError::Checkpoint(CheckpointError::RunNotFound(_))) => {
                (StatusCode::NOT_FOUND, "RUN_NOT_FOUND")
            }
            AppError::Service(ServiceError::Checkpoint(CheckpointError::Resume(_))) => {
                (StatusCode::CONFLICT, "RESUME_FAILED")
            }
            AppError::Service(ServiceError::Engine(e)) => classify_engine(e),
            AppError::Service(ServiceError::Scenario(ScenarioError::Invalid(_))) => {
                (StatusCode::BAD_REQUEST, "INVALID_SCENARIO")
            }
            AppError::Service(ServiceError::Scenario(ScenarioError::Io(e)))
                if e.kind() == std::io::ErrorKind::NotFound =>
            {
                (StatusCode::NOT_FOUND, "SCENARIO_NOT_FOUND")
            }
            AppError::Service(_) => (StatusCode::INTERNAL_SERVER_ERROR, "RUN_ERROR"),
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
        }
    }

    fn message(&self) -> String {
        match self {
            AppError::Service(e) => e.to_string(),
            AppError::Validation(msg) => msg.clone(),
        }
    }
}

fn classify_engine(e: &EngineError) -> (StatusCode, &'static str) {
    match e {
        EngineError::Load(RunbookError::NotFound(_)) => {
            (StatusCode::NOT_FOUND, "RUNBOOK_NOT_FOUND")
        }
        EngineError::Load(RunbookError::ParseError(_) | RunbookError::ValidationError(_)) => {
            (StatusCode::BAD_REQUEST, "INVALID_RUNBOOK")
        }
        EngineError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
        EngineError::NoPendingInput
        | EngineError::StepMismatch { .. }
        | EngineError::RunFinished(_)
        | EngineError::Session(SessionError::PendingConflict { .. }) => {
            (StatusCode::CONFLICT, "RUN_STATE_CONFLICT")
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "ENGINE_ERROR"),
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.classify();
        let message = self.message();

        if status.is_server_error() {
            tracing::error!(code, error = %message, "request failed");
        }

        let body = json!({
            "data": null,
            "meta": {
                "request_id": "",
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "response_time_ms": 0
            },
            "errors": [{
                "code": code,
                "message": message,
            }]
        });

        (
            status,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}
