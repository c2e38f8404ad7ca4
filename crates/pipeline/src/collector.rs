//! Result collection: materialize a successful job's artifacts in the
//! requested form and order them by execution depth.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

use base64::Engine;
use comfyrun_core::error::CoreError;
use comfyrun_core::graph::{depths, output_prefix_depths, TaskGraph};
use comfyrun_core::job::{Artifact, ArtifactPayload, JobStatus};
use comfyrun_core::types::NodeId;
use comfyrun_core::validation::resolve_within;
use regex::Regex;

/// Depth given to artifacts that cannot be traced back to a node.
pub const UNKNOWN_DEPTH: u32 = 999;

/// `<prefix>_<counter>_.png`, the file name pattern of `SaveImage`.
static SAVED_IMAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(.+?)_\d+_\.png$").expect("valid regex"));

/// Depth lookup for artifacts of one graph.
///
/// Artifacts that carry a node id use that node's depth. Artifacts that
/// only carry a file name (remote results) are matched to a `SaveImage`
/// node through its `filename_prefix`.
#[derive(Debug, Clone, Default)]
pub struct ArtifactOrder {
    node_depths: BTreeMap<NodeId, u32>,
    prefix_depths: BTreeMap<String, u32>,
}

impl ArtifactOrder {
    pub fn from_graph(graph: &TaskGraph) -> Result<Self, CoreError> {
        Ok(Self {
            node_depths: depths(graph)?,
            prefix_depths: output_prefix_depths(graph)?,
        })
    }

    pub fn depth_of(&self, artifact: &Artifact) -> u32 {
        if let Some(depth) = artifact
            .node_id
            .as_ref()
            .and_then(|id| self.node_depths.get(id))
        {
            return *depth;
        }
        self.prefix_depth(&artifact.name).unwrap_or(UNKNOWN_DEPTH)
    }

    /// Sort by depth, then by name.
    pub fn sort(&self, artifacts: &mut [Artifact]) {
        artifacts.sort_by(|a, b| {
            self.depth_of(a)
                .cmp(&self.depth_of(b))
                .then_with(|| a.name.cmp(&b.name))
        });
    }

    fn prefix_depth(&self, name: &str) -> Option<u32> {
        let file_name = name.rsplit('/').next().unwrap_or(name);
        let prefix = SAVED_IMAGE_RE.captures(file_name)?.get(1)?.as_str();
        if let Some(depth) = self.prefix_depths.get(prefix) {
            return Some(*depth);
        }
        // Prefixes may carry a subfolder ("portraits/hero"), file names do not.
        self.prefix_depths
            .iter()
            .find(|(key, _)| key.rsplit('/').next() == Some(prefix))
            .map(|(_, depth)| *depth)
    }
}

/// Materialize the artifacts of a successful status.
///
/// * `want_base64`: path artifacts are read and encoded inline.
/// * otherwise: inline artifacts are decoded and written under
///   `output_dir`, and a path is returned.
///
/// Artifacts that cannot be read, decoded or written are logged and
/// dropped. Any status other than `Succeeded` yields nothing.
pub async fn collect(status: &JobStatus, want_base64: bool, output_dir: &Path) -> Vec<Artifact> {
    let JobStatus::Succeeded(artifacts) = status else {
        return Vec::new();
    };

    let mut collected = Vec::with_capacity(artifacts.len());
    for artifact in artifacts {
        let payload = match (&artifact.payload, want_base64) {
            (ArtifactPayload::Path(path), true) => match tokio::fs::read(path).await {
                Ok(bytes) => ArtifactPayload::Base64(base64::prelude::BASE64_STANDARD.encode(bytes)),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Output image not readable, skipping");
                    continue;
                }
            },
            (ArtifactPayload::Base64(data), false) => {
                match persist(output_dir, &artifact.name, data).await {
                    Ok(path) => ArtifactPayload::Path(path),
                    Err(e) => {
                        tracing::warn!(name = %artifact.name, error = %e, "Failed to save output image, skipping");
                        continue;
                    }
                }
            }
            (payload, _) => payload.clone(),
        };

        collected.push(Artifact {
            name: artifact.name.clone(),
            node_id: artifact.node_id.clone(),
            payload,
        });
    }

    tracing::debug!(count = collected.len(), want_base64, "Collected output images");
    collected
}

/// Collect, then order by the graph's execution depth.
pub async fn collect_ordered(
    status: &JobStatus,
    want_base64: bool,
    output_dir: &Path,
    order: &ArtifactOrder,
) -> Vec<Artifact> {
    let mut artifacts = collect(status, want_base64, output_dir).await;
    order.sort(&mut artifacts);
    artifacts
}

async fn persist(output_dir: &Path, name: &str, data: &str) -> Result<std::path::PathBuf, CoreError> {
    let bytes = base64::prelude::BASE64_STANDARD
        .decode(data.trim())
        .map_err(|e| CoreError::Internal(format!("Invalid base64 image data: {e}")))?;
    let path = resolve_within(output_dir, name)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| CoreError::Internal(format!("Cannot create {}: {e}", parent.display())))?;
    }
    tokio::fs::write(&path, &bytes)
        .await
        .map_err(|e| CoreError::Internal(format!("Cannot write {}: {e}", path.display())))?;
    tracing::debug!(path = %path.display(), bytes = bytes.len(), "Saved output image");
    Ok(path)
}
