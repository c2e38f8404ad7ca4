pub mod health;

use axum::routing::post;
use axum::Router;

use crate::handlers;
use crate::state::AppState;

/// Job submission routes.
///
/// ```text
/// POST /run           execute on the local engine
/// POST /remote/run    execute on the RunPod queue
/// ```
pub fn job_routes() -> Router<AppState> {
    Router::new()
        .route("/run", post(handlers::run::run))
        .route("/remote/run", post(handlers::remote::remote_run))
}
