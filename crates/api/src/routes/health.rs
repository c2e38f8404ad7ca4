use axum::extract::State;
use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

/// Health check response payload.
#[derive(Serialize)]
pub struct HealthResponse {
    /// `ok` when the engine answers its probe, `degraded` otherwise.
    pub status: &'static str,
    /// Crate version from Cargo.toml.
    pub version: &'static str,
    /// Supervisor state: stopped, starting, ready or crashed.
    pub engine_state: &'static str,
    pub comfyui_running: bool,
    pub comfyui_responsive: bool,
    /// Whether `/remote/run` has credentials to work with.
    pub remote_configured: bool,
    pub restarts: u32,
}

/// GET /health -- returns service version and engine health.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let supervisor = &state.supervisor;
    let comfyui_running = supervisor.is_process_alive().await;
    let comfyui_responsive = supervisor.is_responsive().await;

    let status = if comfyui_responsive { "ok" } else { "degraded" };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        engine_state: supervisor.state().as_str(),
        comfyui_running,
        comfyui_responsive,
        remote_configured: state.runpod.is_some(),
        restarts: supervisor.restart_count().await,
    })
}

/// Mount health check routes.
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
