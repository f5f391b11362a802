//! Axum router configuration with middleware.
//!
//! All routes are under `/api/v1/`.
//! Middleware: CORS, tracing.

use axum::Router;
use axum::routing::{delete, get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::state::AppState;

/// Build the complete API router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        // Lifecycle
        .route(
            "/runs",
            post(handlers::runs::start_run).get(handlers::runs::list_runs),
        )
        .route("/runs/replay", post(handlers::runs::replay_run))
        .route("/runs/{id}", delete(handlers::runs::delete_run))
        .route("/runs/{id}/advance", post(handlers::runs::advance_run))
        .route("/runs/{id}/cancel", post(handlers::runs::cancel_run))
        // Operator input
        .route("/runs/{id}/choose", post(handlers::runs::choose_outcome))
        .route("/runs/{id}/choice", post(handlers::runs::submit_choice))
        .route("/runs/{id}/evidence", post(handlers::runs::submit_evidence))
        // Queries
        .route("/runs/{id}/variables", get(handlers::runs::get_variables))
        .route("/runs/{id}/manifest", get(handlers::runs::get_manifest))
        .route("/runs/{id}/scenario", post(handlers::runs::save_scenario));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/health", get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health - Simple health check endpoint.
async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
