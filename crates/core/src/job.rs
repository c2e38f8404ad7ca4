//! Job model and the transport capability shared by the local engine
//! and the remote queue.

use std::path::PathBuf;

use serde::Serialize;

use crate::error::CoreError;
use crate::graph::TaskGraph;
use crate::types::{JobId, Timestamp};

/// A submitted graph. Created once by the executor, never mutated.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub graph: TaskGraph,
    pub submitted_at: Timestamp,
}

/// Where an artifact's bytes live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactPayload {
    /// File on disk (typically inside the engine's output directory).
    Path(PathBuf),
    /// Bytes carried inline, base64-encoded.
    Base64(String),
}

/// One output produced by a job (usually an image).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    /// File name as reported by the engine.
    pub name: String,
    /// Node that produced the artifact, when the transport reports it.
    pub node_id: Option<String>,
    pub payload: ArtifactPayload,
}

/// Observed state of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded(Vec<Artifact>),
    Failed(String),
    Cancelled,
    TimedOut,
}

impl JobStatus {
    /// A terminal status never transitions again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Queued | JobStatus::Running)
    }

    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded(_) => "succeeded",
            JobStatus::Failed(_) => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::TimedOut => "timed_out",
        }
    }

    /// Turn a non-success terminal status into the matching error.
    ///
    /// `Succeeded` and the non-terminal statuses return `Ok(())`.
    pub fn to_failure(&self, timeout_secs: u64) -> Result<(), CoreError> {
        match self {
            JobStatus::Failed(message) => Err(CoreError::ExecutionFailed(message.clone())),
            JobStatus::Cancelled => Err(CoreError::ExecutionFailed("Job cancelled".into())),
            JobStatus::TimedOut => Err(CoreError::Timeout { secs: timeout_secs }),
            _ => Ok(()),
        }
    }
}

/// Submission and status protocol spoken by an execution backend.
///
/// Implemented once for a local ComfyUI engine and once for the RunPod
/// serverless queue. The polling algorithm itself lives in the pipeline
/// crate and is shared by both.
#[async_trait::async_trait]
pub trait JobTransport: Send + Sync {
    /// Queue a graph and return the backend's job id.
    ///
    /// Rejections map to [`CoreError::Submission`].
    async fn submit(&self, graph: &TaskGraph) -> Result<JobId, CoreError>;

    /// Current status of a previously submitted job.
    async fn poll_status(&self, job_id: &str) -> Result<JobStatus, CoreError>;

    /// Engine liveness, if this backend supervises one.
    ///
    /// `None` means no health check is configured.
    async fn health_check(&self) -> Option<bool> {
        None
    }
}

/// Answers "is the engine alive right now?" without side effects.
///
/// Implemented by the ComfyUI HTTP client (liveness endpoint) and by the
/// process supervisor (process alive and liveness endpoint).
#[async_trait::async_trait]
pub trait HealthProbe: Send + Sync {
    async fn is_healthy(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Succeeded(vec![]).is_terminal());
        assert!(JobStatus::Failed("x".into()).is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(JobStatus::TimedOut.is_terminal());
    }

    #[test]
    fn failures_map_to_error_kinds() {
        assert_matches!(
            JobStatus::Failed("oom".into()).to_failure(300),
            Err(CoreError::ExecutionFailed(msg)) if msg == "oom"
        );
        assert_matches!(
            JobStatus::TimedOut.to_failure(300),
            Err(CoreError::Timeout { secs: 300 })
        );
        assert_matches!(JobStatus::Succeeded(vec![]).to_failure(300), Ok(()));
    }

    #[test]
    fn artifact_payload_serializes_tagged() {
        let artifact = Artifact {
            name: "out.png".into(),
            node_id: Some("9".into()),
            payload: ArtifactPayload::Base64("AAAA".into()),
        };
        let json = serde_json::to_value(&artifact).unwrap();
        assert_eq!(json["payload"]["base64"], "AAAA");
        assert_eq!(json["node_id"], "9");
    }
}
