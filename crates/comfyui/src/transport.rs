//! [`JobTransport`] for a local ComfyUI engine.

use std::path::PathBuf;
use std::sync::Arc;

use comfyrun_core::error::CoreError;
use comfyrun_core::graph::TaskGraph;
use comfyrun_core::job::{HealthProbe, JobStatus, JobTransport};
use comfyrun_core::types::JobId;

use crate::api::{ComfyUIApi, ComfyUIApiError};
use crate::history::status_from_history;

/// Submits graphs to `POST /prompt` and polls `GET /history/{id}`.
///
/// Health checks are delegated to an optional [`HealthProbe`], normally
/// the process supervisor, so a crashed engine is noticed mid-job.
pub struct LocalTransport {
    api: ComfyUIApi,
    output_dir: PathBuf,
    client_id: String,
    health: Option<Arc<dyn HealthProbe>>,
}

impl LocalTransport {
    pub fn new(api: ComfyUIApi, output_dir: PathBuf) -> Self {
        Self {
            api,
            output_dir,
            client_id: uuid::Uuid::new_v4().to_string(),
            health: None,
        }
    }

    /// Attach a health probe consulted between polls.
    pub fn with_health_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.health = Some(probe);
        self
    }
}

#[async_trait::async_trait]
impl JobTransport for LocalTransport {
    async fn submit(&self, graph: &TaskGraph) -> Result<JobId, CoreError> {
        let workflow = serde_json::to_value(graph)
            .map_err(|e| CoreError::Internal(format!("Failed to serialize workflow: {e}")))?;

        match self.api.submit_workflow(&workflow, &self.client_id).await {
            Ok(resp) => {
                tracing::info!(
                    prompt_id = %resp.prompt_id,
                    queue_position = resp.number,
                    nodes = graph.len(),
                    "Workflow queued on ComfyUI",
                );
                Ok(resp.prompt_id)
            }
            Err(ComfyUIApiError::ApiError { status, body }) => Err(CoreError::Submission(format!(
                "ComfyUI rejected the workflow ({status}): {body}"
            ))),
            Err(e) => Err(CoreError::Submission(e.to_string())),
        }
    }

    async fn poll_status(&self, job_id: &str) -> Result<JobStatus, CoreError> {
        let history = self.api.get_history(job_id).await?;
        status_from_history(&history, job_id, &self.output_dir).map_err(|e| {
            CoreError::Internal(format!("Malformed history for prompt {job_id}: {e}"))
        })
    }

    async fn health_check(&self) -> Option<bool> {
        match &self.health {
            Some(probe) => Some(probe.is_healthy().await),
            None => None,
        }
    }
}
