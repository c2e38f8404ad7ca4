//! [`JobTransport`] for the RunPod queue.

use std::collections::BTreeMap;

use comfyrun_core::error::CoreError;
use comfyrun_core::graph::TaskGraph;
use comfyrun_core::job::{JobStatus, JobTransport};
use comfyrun_core::types::JobId;

use crate::client::{RunInput, RunPodClient, RunPodError};
use crate::status::map_status;

/// One remote job's transport: the client plus the per-request
/// reference images and output mode sent along with the workflow.
///
/// There is no engine to health-check on this side, so
/// [`health_check`](JobTransport::health_check) stays `None`.
pub struct RemoteTransport {
    client: RunPodClient,
    reference_images: BTreeMap<String, String>,
    return_base64: bool,
}

impl RemoteTransport {
    pub fn new(client: RunPodClient) -> Self {
        Self {
            client,
            reference_images: BTreeMap::new(),
            return_base64: true,
        }
    }

    pub fn with_reference_images(mut self, images: BTreeMap<String, String>) -> Self {
        self.reference_images = images;
        self
    }

    pub fn with_return_base64(mut self, return_base64: bool) -> Self {
        self.return_base64 = return_base64;
        self
    }
}

#[async_trait::async_trait]
impl JobTransport for RemoteTransport {
    async fn submit(&self, graph: &TaskGraph) -> Result<JobId, CoreError> {
        let workflow = serde_json::to_value(graph)
            .map_err(|e| CoreError::Internal(format!("Failed to serialize workflow: {e}")))?;

        let input = RunInput {
            workflow: &workflow,
            reference_images: &self.reference_images,
            return_base64: self.return_base64,
        };

        match self.client.run(input).await {
            Ok(resp) => {
                tracing::info!(
                    job_id = %resp.id,
                    queue_status = resp.status.as_deref().unwrap_or("unknown"),
                    endpoint = %self.client.endpoint_url(),
                    reference_images = self.reference_images.len(),
                    "Workflow queued on RunPod",
                );
                Ok(resp.id)
            }
            Err(RunPodError::ApiError { status, body }) => Err(CoreError::Submission(format!(
                "RunPod rejected the job ({status}): {body}"
            ))),
            Err(e) => Err(CoreError::Submission(e.to_string())),
        }
    }

    async fn poll_status(&self, job_id: &str) -> Result<JobStatus, CoreError> {
        let response = self.client.status(job_id).await?;
        Ok(map_status(job_id, &response))
    }
}
