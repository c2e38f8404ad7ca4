//! Pre-submission checks that a graph's file references exist.
//!
//! Runs before a job is queued so that a missing checkpoint surfaces as
//! one clear validation error instead of an opaque engine failure
//! minutes later.

use std::path::{Path, PathBuf};

use crate::error::CoreError;
use crate::graph::TaskGraph;

/// Checkpoint loader node class type in ComfyUI.
const LOAD_CHECKPOINT_CLASS: &str = "CheckpointLoaderSimple";

/// LoRA loader node class type.
const LOAD_LORA_CLASS: &str = "LoraLoader";

/// Load image node class type.
const LOAD_IMAGE_CLASS: &str = "LoadImage";

/// Directories that file references are resolved against.
#[derive(Debug, Clone)]
pub struct ValidationRoots {
    /// Models root containing `checkpoints/`, `loras/`, ...
    pub models_dir: PathBuf,
    /// Engine input directory for `LoadImage`.
    pub input_dir: PathBuf,
}

/// Collect every missing model or input image referenced by the graph.
///
/// Returns an empty list when the graph is valid.
pub fn find_missing_files(graph: &TaskGraph, roots: &ValidationRoots) -> Vec<String> {
    let mut errors = Vec::new();

    for node in graph.values() {
        let (input, dir, label) = match node.class_type.as_str() {
            LOAD_CHECKPOINT_CLASS => ("ckpt_name", roots.models_dir.join("checkpoints"), "Checkpoint"),
            LOAD_LORA_CLASS => ("lora_name", roots.models_dir.join("loras"), "LoRA"),
            LOAD_IMAGE_CLASS => ("image", roots.input_dir.clone(), "Input image"),
            _ => continue,
        };

        if let Some(name) = node.literal_str(input).filter(|n| !n.is_empty()) {
            if !dir.join(name).exists() {
                errors.push(format!("{label} not found: {name}"));
            }
        }
    }

    errors
}

/// Fail with every violation at once if any referenced file is missing.
pub fn validate_graph(graph: &TaskGraph, roots: &ValidationRoots) -> Result<(), CoreError> {
    let errors = find_missing_files(graph, roots);
    if errors.is_empty() {
        tracing::info!(nodes = graph.len(), "Workflow validation passed");
        return Ok(());
    }

    tracing::warn!(count = errors.len(), ?errors, "Workflow validation failed");
    Err(CoreError::Validation(errors))
}

/// Resolve a caller-supplied relative path inside `root`.
///
/// Rejects absolute paths and any `..` component so that uploaded
/// reference images cannot escape the input directory.
pub fn resolve_within(root: &Path, relative: &str) -> Result<PathBuf, CoreError> {
    let rel = Path::new(relative);
    let escapes = rel.is_absolute()
        || rel
            .components()
            .any(|c| !matches!(c, std::path::Component::Normal(_) | std::path::Component::CurDir));

    if relative.is_empty() || escapes {
        return Err(CoreError::validation(format!(
            "Invalid reference image path: {relative}"
        )));
    }
    Ok(root.join(rel))
}
