//! `POST /run`: execute a workflow on the local, supervised engine.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::Json;
use base64::Engine;
use comfyrun_comfyui::transport::LocalTransport;
use comfyrun_core::error::CoreError;
use comfyrun_core::validation::{resolve_within, validate_graph};
use comfyrun_pipeline::collector::{collect_ordered, ArtifactOrder};
use comfyrun_pipeline::executor::execute;
use comfyrun_worker::supervisor::GenerationProbe;

use super::{prepare_graph, JobInput, RunRequest, RunResponse};
use crate::background::spawn_output_cleanup;
use crate::error::{AppResult, ErrorReport};
use crate::state::AppState;

/// POST /run
///
/// Start the engine if needed, save reference images, validate, execute,
/// and return the collected images. Errors carry the engine's state and
/// recent log lines.
pub async fn run(
    State(state): State<AppState>,
    Json(request): Json<RunRequest>,
) -> Result<Json<RunResponse>, ErrorReport> {
    match run_local(&state, request.input).await {
        Ok(response) => Ok(Json(response)),
        Err(e) => {
            tracing::error!(error = %e, "Local job failed");
            Err(ErrorReport::new(e).with_system_state(&state.supervisor).await)
        }
    }
}

async fn run_local(state: &AppState, input: JobInput) -> AppResult<RunResponse> {
    let graph = prepare_graph(&input)?;

    if !state.supervisor.ensure_running().await {
        return Err(CoreError::EngineUnresponsive("Failed to start ComfyUI server".into()).into());
    }

    let config = &state.config;
    save_reference_images(&config.paths.comfyui_input, &input.reference_images).await?;
    validate_graph(&graph, &config.validation_roots())?;
    let order = ArtifactOrder::from_graph(&graph)?;

    // Prompts do not survive an engine restart: pin the health check to
    // the process this job is submitted to.
    let probe = GenerationProbe::pin(state.supervisor.clone()).await;
    let output_dir = config.paths.comfyui_output.clone();
    let transport = LocalTransport::new(state.comfyui.clone(), output_dir.clone())
        .with_health_probe(Arc::new(probe));
    let policy = config.execution_policy();

    let outcome = execute(&transport, graph, &policy).await?;
    outcome.status.to_failure(policy.timeout.as_secs())?;

    let return_base64 = input.return_base64.unwrap_or(config.handler.return_base64);
    let artifacts = collect_ordered(&outcome.status, return_base64, &output_dir, &order).await;

    spawn_output_cleanup(output_dir, Duration::from_secs(config.handler.cleanup_age_secs));

    tracing::info!(
        prompt_id = %outcome.job.id,
        images = artifacts.len(),
        polls = outcome.polls,
        "Local job completed",
    );
    Ok(RunResponse::success(outcome.job.id, artifacts))
}

/// Decode and write reference images under `input_dir`, creating
/// subdirectories. Paths that would leave `input_dir` are rejected.
pub(crate) async fn save_reference_images(
    input_dir: &Path,
    images: &BTreeMap<String, String>,
) -> Result<(), CoreError> {
    if images.is_empty() {
        return Ok(());
    }
    tracing::info!(count = images.len(), "Saving reference images");

    for (relative, encoded) in images {
        let path = resolve_within(input_dir, relative)?;
        let bytes = base64::prelude::BASE64_STANDARD
            .decode(encoded.trim())
            .map_err(|e| CoreError::validation(format!("Reference image {relative} is not valid base64: {e}")))?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CoreError::Internal(format!("Cannot create {}: {e}", parent.display())))?;
        }
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| CoreError::Internal(format!("Cannot write {}: {e}", path.display())))?;
        tracing::debug!(path = %path.display(), bytes = bytes.len(), "Saved reference image");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[tokio::test]
    async fn reference_images_land_in_subdirectories() {
        let tmp = tempfile::tempdir().unwrap();
        let images = BTreeMap::from([(
            "refs/face.png".to_string(),
            base64::prelude::BASE64_STANDARD.encode(b"face"),
        )]);

        save_reference_images(tmp.path(), &images).await.unwrap();
        assert_eq!(std::fs::read(tmp.path().join("refs/face.png")).unwrap(), b"face");
    }

    #[tokio::test]
    async fn traversal_and_bad_base64_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();

        let escape = BTreeMap::from([("../evil.png".to_string(), String::new())]);
        assert_matches!(
            save_reference_images(tmp.path(), &escape).await,
            Err(CoreError::Validation(_))
        );

        let garbage = BTreeMap::from([("ok.png".to_string(), "***".to_string())]);
        assert_matches!(
            save_reference_images(tmp.path(), &garbage).await,
            Err(CoreError::Validation(msgs)) if msgs[0].contains("ok.png")
        );
    }
}
