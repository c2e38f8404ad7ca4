//! ComfyUI history records and their mapping to [`JobStatus`].
//!
//! `GET /history/{prompt_id}` returns `{}` until the prompt has finished
//! (or failed), then an object keyed by the prompt id:
//!
//! ```json
//! { "<id>": {
//!     "status": { "completed": true, "status_str": "success", "messages": [] },
//!     "outputs": { "9": { "images": [{ "filename": "a_00001_.png", "subfolder": "", "type": "output" }] } }
//! } }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use comfyrun_core::job::{Artifact, ArtifactPayload, JobStatus};
use serde::Deserialize;

/// `status_str` value ComfyUI reports for a failed prompt.
const STATUS_ERROR: &str = "error";

/// Image `type` for files written to the output directory.
const OUTPUT_TYPE: &str = "output";

/// One prompt's history entry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryEntry {
    #[serde(default)]
    pub status: HistoryStatus,
    #[serde(default)]
    pub outputs: BTreeMap<String, NodeOutput>,
}

/// Execution status block of a history entry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryStatus {
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub status_str: String,
    /// `[event_name, payload]` pairs recorded during execution.
    #[serde(default)]
    pub messages: Vec<serde_json::Value>,
}

/// Outputs produced by a single node.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeOutput {
    #[serde(default)]
    pub images: Vec<OutputImage>,
}

/// An image file written by a node.
#[derive(Debug, Clone, Deserialize)]
pub struct OutputImage {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    /// `output` for saved images, `temp` for previews.
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

/// Interpret a `/history/{prompt_id}` response.
///
/// * Missing entry: still queued or running.
/// * `status_str == "error"`: failed, with the engine's error messages.
/// * `completed`: succeeded, with one path artifact per saved image
///   resolved against `output_dir`. Preview images are skipped.
/// * Anything else: running.
pub fn status_from_history(
    history: &serde_json::Value,
    prompt_id: &str,
    output_dir: &Path,
) -> Result<JobStatus, serde_json::Error> {
    let Some(raw) = history.get(prompt_id) else {
        return Ok(JobStatus::Queued);
    };
    let entry: HistoryEntry = serde_json::from_value(raw.clone())?;

    if entry.status.status_str == STATUS_ERROR {
        return Ok(JobStatus::Failed(error_message(&entry.status.messages)));
    }

    if !entry.status.completed {
        return Ok(JobStatus::Running);
    }

    let artifacts = entry
        .outputs
        .iter()
        .flat_map(|(node_id, output)| {
            output
                .images
                .iter()
                .filter(|img| img.kind.as_deref().map_or(true, |k| k == OUTPUT_TYPE))
                .map(move |img| Artifact {
                    name: img.filename.clone(),
                    node_id: Some(node_id.clone()),
                    payload: ArtifactPayload::Path(
                        output_dir.join(&img.subfolder).join(&img.filename),
                    ),
                })
        })
        .collect();

    Ok(JobStatus::Succeeded(artifacts))
}

/// Pull a readable message out of ComfyUI's status messages.
///
/// Prefers the `exception_message` of an `execution_error` event and
/// falls back to the raw message list.
fn error_message(messages: &[serde_json::Value]) -> String {
    let exception = messages.iter().find_map(|msg| {
        let pair = msg.as_array()?;
        if pair.first()?.as_str()? != "execution_error" {
            return None;
        }
        let data = pair.get(1)?;
        let text = data.get("exception_message")?.as_str()?;
        Some(match data.get("node_id").and_then(|n| n.as_str()) {
            Some(node) => format!("node {node}: {}", text.trim()),
            None => text.trim().to_string(),
        })
    });

    exception.unwrap_or_else(|| {
        if messages.is_empty() {
            "Unknown error".to_string()
        } else {
            serde_json::Value::Array(messages.to_vec()).to_string()
        }
    })
}
