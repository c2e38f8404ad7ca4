//! Status monotonicity guard.

use comfyrun_core::job::JobStatus;

/// Records the statuses observed for one job.
///
/// Once a terminal status has been seen, a later non-terminal one is a
/// transport contract violation and is turned into `Failed`. Backward
/// steps between non-terminal statuses (`Running` -> `Queued`) are
/// logged and accepted.
#[derive(Debug, Default)]
pub struct StatusTracker {
    last: Option<JobStatus>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `status` and return the status the caller should act on.
    pub fn observe(&mut self, status: JobStatus) -> JobStatus {
        let status = match &self.last {
            Some(prev) if prev.is_terminal() && !status.is_terminal() => {
                tracing::error!(
                    from = prev.label(),
                    to = status.label(),
                    "Job status left a terminal state",
                );
                JobStatus::Failed(format!(
                    "Status regressed from {} to {}",
                    prev.label(),
                    status.label()
                ))
            }
            Some(JobStatus::Running) if status == JobStatus::Queued => {
                tracing::warn!("Job status went from running back to queued");
                status
            }
            _ => status,
        };

        self.last = Some(status.clone());
        status
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn forward_progress_passes_through() {
        let mut tracker = StatusTracker::new();
        assert_eq!(tracker.observe(JobStatus::Queued), JobStatus::Queued);
        assert_eq!(tracker.observe(JobStatus::Running), JobStatus::Running);
        assert_eq!(
            tracker.observe(JobStatus::Succeeded(vec![])),
            JobStatus::Succeeded(vec![])
        );
    }

    #[test]
    fn running_back_to_queued_is_tolerated() {
        let mut tracker = StatusTracker::new();
        tracker.observe(JobStatus::Running);
        assert_eq!(tracker.observe(JobStatus::Queued), JobStatus::Queued);
    }

    #[test]
    fn leaving_terminal_becomes_failed() {
        let mut tracker = StatusTracker::new();
        tracker.observe(JobStatus::Cancelled);
        assert_matches!(
            tracker.observe(JobStatus::Running),
            JobStatus::Failed(msg) if msg.contains("cancelled") && msg.contains("running")
        );
        assert_matches!(tracker.observe(JobStatus::Queued), JobStatus::Failed(_));
    }
}
