//! Submit-and-poll state machine.
//!
//! One algorithm drives every [`JobTransport`]:
//!
//! 1. Submit. A rejection ends the job with [`CoreError::Submission`].
//! 2. Until the timeout: sleep `min(poll_interval, remaining)`, poll,
//!    stop on a terminal status. Retryable transport errors are logged
//!    and polling continues. Between polls, if the transport has a health
//!    check and `health_check_interval` has passed since the last one,
//!    check it. An unhealthy engine ends the job with
//!    [`CoreError::EngineUnresponsive`].
//! 3. No terminal status before the timeout: [`JobStatus::TimedOut`].

use std::time::Duration;

use chrono::Utc;
use comfyrun_core::error::CoreError;
use comfyrun_core::graph::TaskGraph;
use comfyrun_core::job::{Job, JobStatus, JobTransport};
use tokio::time::Instant;

use crate::tracker::StatusTracker;

/// Timing knobs for one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionPolicy {
    /// Budget measured from successful submission.
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// Minimum spacing between transport health checks.
    pub health_check_interval: Duration,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(2),
            health_check_interval: Duration::from_secs(5),
        }
    }
}

/// Result of [`execute`]: the job, its final status, and how many polls
/// it took.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job: Job,
    pub status: JobStatus,
    pub polls: u32,
}

/// Submit `graph` through `transport` and poll until terminal or timeout.
///
/// A timeout is not an error here: the outcome carries
/// [`JobStatus::TimedOut`]. Use [`JobStatus::to_failure`] to turn
/// non-success outcomes into errors.
pub async fn execute(
    transport: &dyn JobTransport,
    graph: TaskGraph,
    policy: &ExecutionPolicy,
) -> Result<JobOutcome, CoreError> {
    let id = transport.submit(&graph).await.map_err(|e| match e {
        CoreError::Submission(_) => e,
        other => CoreError::Submission(other.to_string()),
    })?;

    let job = Job {
        id,
        graph,
        submitted_at: Utc::now(),
    };
    tracing::info!(job_id = %job.id, nodes = job.graph.len(), "Job submitted");

    let started = Instant::now();
    let mut last_health_check = started;
    let mut tracker = StatusTracker::new();
    let mut polls = 0u32;

    while started.elapsed() < policy.timeout {
        let remaining = policy.timeout.saturating_sub(started.elapsed());
        tokio::time::sleep(policy.poll_interval.min(remaining)).await;

        polls += 1;
        match transport.poll_status(&job.id).await {
            Ok(status) => {
                let status = tracker.observe(status);
                if status.is_terminal() {
                    tracing::info!(
                        job_id = %job.id,
                        status = status.label(),
                        polls,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Job reached terminal status",
                    );
                    return Ok(JobOutcome { job, status, polls });
                }
                tracing::debug!(job_id = %job.id, status = status.label(), polls, "Job not finished");
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!(job_id = %job.id, error = %e, "Status poll failed, retrying");
            }
            Err(e) => return Err(e),
        }

        if last_health_check.elapsed() > policy.health_check_interval {
            if let Some(healthy) = transport.health_check().await {
                last_health_check = Instant::now();
                if !healthy {
                    tracing::error!(job_id = %job.id, "Engine failed health check during execution");
                    return Err(CoreError::EngineUnresponsive(format!(
                        "Engine stopped responding while job {} was running",
                        job.id
                    )));
                }
            }
        }
    }

    let status = tracker.observe(JobStatus::TimedOut);
    tracing::warn!(
        job_id = %job.id,
        timeout_secs = policy.timeout.as_secs(),
        polls,
        "Job timed out",
    );
    Ok(JobOutcome { job, status, polls })
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use assert_matches::assert_matches;
    use comfyrun_core::graph::parse_graph;
    use comfyrun_core::types::JobId;
    use serde_json::json;

    use super::*;

    // ---------------------------------------------------------------
    // Scripted transport
    // ---------------------------------------------------------------

    /// Replays a scripted list of poll results; repeats `fallback` once
    /// the script runs out.
    struct Scripted {
        submit_error: Mutex<Option<CoreError>>,
        polls: Mutex<VecDeque<Result<JobStatus, CoreError>>>,
        fallback: JobStatus,
        health: Option<bool>,
        health_checks: AtomicUsize,
    }

    impl Scripted {
        fn new(polls: Vec<Result<JobStatus, CoreError>>, fallback: JobStatus) -> Self {
            Self {
                submit_error: Mutex::new(None),
                polls: Mutex::new(polls.into()),
                fallback,
                health: None,
                health_checks: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl JobTransport for Scripted {
        async fn submit(&self, _graph: &TaskGraph) -> Result<JobId, CoreError> {
            let error = self.submit_error.lock().unwrap().take();
            match error {
                Some(e) => Err(e),
                None => Ok("job-1".into()),
            }
        }

        async fn poll_status(&self, _job_id: &str) -> Result<JobStatus, CoreError> {
            let next = self.polls.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok(self.fallback.clone()))
        }

        async fn health_check(&self) -> Option<bool> {
            self.health_checks.fetch_add(1, Ordering::SeqCst);
            self.health
        }
    }

    fn graph() -> TaskGraph {
        parse_graph(&json!({ "1": { "class_type": "SaveImage", "inputs": {} } })).unwrap()
    }

    fn policy(timeout_secs: u64, poll_secs: u64, health_ms: u64) -> ExecutionPolicy {
        ExecutionPolicy {
            timeout: Duration::from_secs(timeout_secs),
            poll_interval: Duration::from_secs(poll_secs),
            health_check_interval: Duration::from_millis(health_ms),
        }
    }

    fn assert_elapsed_about(start: Instant, secs: u64) {
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(secs), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(secs) + Duration::from_millis(100), "{elapsed:?}");
    }

    // ---------------------------------------------------------------
    // Terminal outcomes
    // ---------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_two_queued_polls() {
        let transport = Scripted::new(
            vec![Ok(JobStatus::Queued), Ok(JobStatus::Queued)],
            JobStatus::Succeeded(vec![]),
        );

        let outcome = execute(&transport, graph(), &policy(10, 1, 5_000)).await.unwrap();
        assert_eq!(outcome.status, JobStatus::Succeeded(vec![]));
        assert_eq!(outcome.polls, 3);
        assert_eq!(outcome.job.id, "job-1");
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_at_budget() {
        let transport = Scripted::new(vec![], JobStatus::Running);
        let start = Instant::now();

        let outcome = execute(&transport, graph(), &policy(5, 1, 60_000)).await.unwrap();

        assert_eq!(outcome.status, JobStatus::TimedOut);
        assert_elapsed_about(start, 5);
        assert_matches!(outcome.status.to_failure(5), Err(CoreError::Timeout { secs: 5 }));
    }

    #[tokio::test(start_paused = true)]
    async fn last_sleep_is_clamped_to_remaining_budget() {
        let transport = Scripted::new(vec![], JobStatus::Queued);
        let start = Instant::now();

        let outcome = execute(&transport, graph(), &policy(5, 2, 60_000)).await.unwrap();

        assert_eq!(outcome.status, JobStatus::TimedOut);
        assert_eq!(outcome.polls, 3);
        assert_elapsed_about(start, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_and_cancelled_are_terminal() {
        let failed = Scripted::new(vec![Ok(JobStatus::Running)], JobStatus::Failed("oom".into()));
        let outcome = execute(&failed, graph(), &policy(10, 1, 60_000)).await.unwrap();
        assert_eq!(outcome.status, JobStatus::Failed("oom".into()));

        let cancelled = Scripted::new(vec![], JobStatus::Cancelled);
        let outcome = execute(&cancelled, graph(), &policy(10, 1, 60_000)).await.unwrap();
        assert_eq!(outcome.status, JobStatus::Cancelled);
        assert_eq!(outcome.polls, 1);
    }

    // ---------------------------------------------------------------
    // Errors
    // ---------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn retryable_poll_errors_keep_polling() {
        let transport = Scripted::new(
            vec![
                Err(CoreError::Transport { message: "reset".into(), retryable: true }),
                Ok(JobStatus::Running),
            ],
            JobStatus::Succeeded(vec![]),
        );

        let outcome = execute(&transport, graph(), &policy(10, 1, 60_000)).await.unwrap();
        assert_eq!(outcome.polls, 3);
        assert_eq!(outcome.status, JobStatus::Succeeded(vec![]));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_poll_error_propagates() {
        let transport = Scripted::new(
            vec![Err(CoreError::Transport { message: "401".into(), retryable: false })],
            JobStatus::Running,
        );

        assert_matches!(
            execute(&transport, graph(), &policy(10, 1, 60_000)).await,
            Err(CoreError::Transport { retryable: false, .. })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn submission_failure_is_not_retried() {
        let transport = Scripted {
            submit_error: Mutex::new(Some(CoreError::Transport {
                message: "refused".into(),
                retryable: true,
            })),
            ..Scripted::new(vec![], JobStatus::Running)
        };

        assert_matches!(
            execute(&transport, graph(), &policy(10, 1, 60_000)).await,
            Err(CoreError::Submission(msg)) if msg.contains("refused")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_engine_aborts() {
        let transport = Scripted {
            health: Some(false),
            ..Scripted::new(vec![], JobStatus::Running)
        };
        let start = Instant::now();

        assert_matches!(
            execute(&transport, graph(), &policy(30, 1, 2_500)).await,
            Err(CoreError::EngineUnresponsive(_))
        );
        assert_elapsed_about(start, 3);
        assert_eq!(transport.health_checks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn health_checks_are_spaced_by_interval() {
        let transport = Scripted {
            health: Some(true),
            ..Scripted::new(vec![], JobStatus::Running)
        };

        let outcome = execute(&transport, graph(), &policy(10, 1, 2_500)).await.unwrap();
        assert_eq!(outcome.status, JobStatus::TimedOut);
        // Checks after polls 3, 6 and 9.
        assert_eq!(transport.health_checks.load(Ordering::SeqCst), 3);
    }
}
