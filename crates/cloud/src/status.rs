//! Mapping of RunPod job states and outputs onto [`JobStatus`].

use comfyrun_core::job::{Artifact, ArtifactPayload, JobStatus};

use crate::client::StatusResponse;

/// Map a status response to the shared status model.
///
/// | RunPod                 | JobStatus   |
/// |------------------------|-------------|
/// | `IN_QUEUE`, `QUEUED`   | `Queued`    |
/// | `IN_PROGRESS`          | `Running`   |
/// | `COMPLETED`            | `Succeeded` |
/// | `FAILED`, `TIMED_OUT`  | `Failed`    |
/// | `CANCELLED`            | `Cancelled` |
///
/// Unknown states are treated as still running.
pub fn map_status(job_id: &str, response: &StatusResponse) -> JobStatus {
    match response.status.as_str() {
        "IN_QUEUE" | "QUEUED" => JobStatus::Queued,
        "IN_PROGRESS" => JobStatus::Running,
        "COMPLETED" => JobStatus::Succeeded(output_artifacts(job_id, response.output.as_ref())),
        "FAILED" => JobStatus::Failed(error_text(response.error.as_ref())),
        "TIMED_OUT" => JobStatus::Failed(format!(
            "RunPod job timed out: {}",
            error_text(response.error.as_ref())
        )),
        "CANCELLED" => JobStatus::Cancelled,
        other => {
            tracing::warn!(job_id, status = other, "Unknown RunPod status, treating as running");
            JobStatus::Running
        }
    }
}

/// Extract inline images from a completed job's `output`.
///
/// `output` is either `{"images": [...]}` or a bare list. Each item is
/// a base64 string or an object with `filename` and `data` (or `image`).
/// Items in any other shape are skipped.
pub fn output_artifacts(job_id: &str, output: Option<&serde_json::Value>) -> Vec<Artifact> {
    let images = match output {
        Some(serde_json::Value::Object(obj)) => obj.get("images").and_then(|v| v.as_array()),
        Some(serde_json::Value::Array(items)) => Some(items),
        _ => None,
    };
    let Some(images) = images else {
        tracing::warn!(job_id, "RunPod output has no image list");
        return Vec::new();
    };

    images
        .iter()
        .enumerate()
        .filter_map(|(index, item)| {
            let fallback = || format!("output_{job_id}_{index:03}.png");
            let (name, data) = match item {
                serde_json::Value::String(data) => (fallback(), data.clone()),
                serde_json::Value::Object(obj) => {
                    let data = obj
                        .get("data")
                        .or_else(|| obj.get("image"))
                        .and_then(|v| v.as_str())?;
                    let name = obj
                        .get("filename")
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                        .unwrap_or_else(fallback);
                    (name, data.to_string())
                }
                _ => {
                    tracing::warn!(job_id, index, "Skipping RunPod output item with unexpected shape");
                    return None;
                }
            };
            Some(Artifact {
                name,
                node_id: None,
                payload: ArtifactPayload::Base64(data),
            })
        })
        .collect()
}

fn error_text(error: Option<&serde_json::Value>) -> String {
    match error {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Null) | None => "Unknown error".to_string(),
        Some(other) => other.to_string(),
    }
}
