//! Request handlers for the job endpoints.
//!
//! Both endpoints accept the RunPod worker input envelope:
//!
//! ```json
//! { "input": {
//!     "workflow": { "...": "API-format graph" },
//!     "reference_images": { "refs/face.png": "<base64>" },
//!     "return_base64": true,
//!     "target_nodes": ["9"]
//! } }
//! ```

pub mod remote;
pub mod run;

use std::collections::BTreeMap;

use comfyrun_core::error::CoreError;
use comfyrun_core::graph::{parse_graph, trim, TaskGraph};
use comfyrun_core::job::{Artifact, ArtifactPayload};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// Request body of `POST /run` and `POST /remote/run`.
#[derive(Debug, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub input: JobInput,
}

#[derive(Debug, Default, Deserialize)]
pub struct JobInput {
    pub workflow: Option<serde_json::Value>,
    /// Relative path -> base64 image, saved into the engine input directory.
    #[serde(default)]
    pub reference_images: BTreeMap<String, String>,
    /// Overrides the configured default.
    pub return_base64: Option<bool>,
    /// Run only these nodes and what they depend on.
    pub target_nodes: Option<Vec<String>>,
}

/// Successful job response.
#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub status: &'static str,
    pub prompt_id: String,
    pub images: Vec<ImageResult>,
    pub image_count: usize,
}

impl RunResponse {
    pub fn success(prompt_id: String, artifacts: Vec<Artifact>) -> Self {
        let images: Vec<ImageResult> = artifacts.into_iter().map(ImageResult::from).collect();
        Self {
            status: "success",
            prompt_id,
            image_count: images.len(),
            images,
        }
    }
}

/// One output image: inline `data` or a `path` on the worker.
#[derive(Debug, Serialize)]
pub struct ImageResult {
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl From<Artifact> for ImageResult {
    fn from(artifact: Artifact) -> Self {
        let (data, path) = match artifact.payload {
            ArtifactPayload::Base64(data) => (Some(data), None),
            ArtifactPayload::Path(path) => (None, Some(path.display().to_string())),
        };
        Self {
            filename: artifact.name,
            node_id: artifact.node_id,
            data,
            path,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared steps
// ---------------------------------------------------------------------------

/// Parse the request workflow, restricted to `target_nodes` when given.
pub(crate) fn prepare_graph(input: &JobInput) -> AppResult<TaskGraph> {
    let workflow = input
        .workflow
        .as_ref()
        .filter(|w| !w.is_null())
        .ok_or_else(|| AppError::BadRequest("Missing 'workflow' in input".into()))?;

    let graph = parse_graph(workflow)?;

    let Some(targets) = &input.target_nodes else {
        return Ok(graph);
    };
    if targets.is_empty() {
        return Err(AppError::BadRequest("'target_nodes' must not be empty".into()));
    }
    let missing: Vec<String> = targets
        .iter()
        .filter(|id| !graph.contains_key(id.as_str()))
        .map(|id| format!("Target node not found: {id}"))
        .collect();
    if !missing.is_empty() {
        return Err(CoreError::Validation(missing).into());
    }

    let trimmed = trim(&graph, targets);
    tracing::info!(
        nodes = graph.len(),
        kept = trimmed.len(),
        ?targets,
        "Trimmed workflow to target nodes",
    );
    Ok(trimmed)
}
