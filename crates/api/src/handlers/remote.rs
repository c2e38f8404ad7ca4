//! `POST /remote/run`: execute a workflow on the RunPod queue and bring
//! the results back to this worker.

use axum::extract::State;
use axum::Json;
use comfyrun_cloud::transport::RemoteTransport;
use comfyrun_core::error::CoreError;
use comfyrun_pipeline::collector::{collect_ordered, ArtifactOrder};
use comfyrun_pipeline::executor::execute;

use super::{prepare_graph, JobInput, RunRequest, RunResponse};
use crate::error::{AppResult, ErrorReport};
use crate::state::AppState;

/// POST /remote/run
///
/// Reference images travel with the job. Results always come back
/// inline; unless the request asks for base64 they are written to the
/// local output directory and returned as paths, ordered by the depth of
/// the node that saved them.
pub async fn remote_run(
    State(state): State<AppState>,
    Json(request): Json<RunRequest>,
) -> Result<Json<RunResponse>, ErrorReport> {
    match run_remote(&state, request.input).await {
        Ok(response) => Ok(Json(response)),
        Err(e) => {
            tracing::error!(error = %e, "Remote job failed");
            Err(ErrorReport::new(e))
        }
    }
}

async fn run_remote(state: &AppState, input: JobInput) -> AppResult<RunResponse> {
    let client = state.runpod.clone().ok_or_else(|| {
        CoreError::Configuration("RUNPOD_API_KEY and RUNPOD_ENDPOINT_ID are not configured".into())
    })?;

    let graph = prepare_graph(&input)?;
    let order = ArtifactOrder::from_graph(&graph)?;

    let transport = RemoteTransport::new(client)
        .with_reference_images(input.reference_images)
        .with_return_base64(true);
    let policy = state.config.execution_policy();

    let outcome = execute(&transport, graph, &policy).await?;
    outcome.status.to_failure(policy.timeout.as_secs())?;

    let output_dir = &state.config.paths.comfyui_output;
    let return_base64 = input.return_base64.unwrap_or(false);
    let artifacts = collect_ordered(&outcome.status, return_base64, output_dir, &order).await;

    tracing::info!(
        job_id = %outcome.job.id,
        images = artifacts.len(),
        polls = outcome.polls,
        "Remote job completed",
    );
    Ok(RunResponse::success(outcome.job.id, artifacts))
}
