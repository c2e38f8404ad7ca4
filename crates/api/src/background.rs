//! Background tasks.
//!
//! Each function is meant to be spawned via `tokio::spawn`. Long-running
//! loops accept a [`CancellationToken`] for graceful shutdown.

use std::path::PathBuf;
use std::time::Duration;

use comfyrun_pipeline::cleanup::cleanup_outputs;
use tokio_util::sync::CancellationToken;

/// How often the periodic output sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(600);

/// Fire-and-forget sweep after a job's results have been collected.
pub fn spawn_output_cleanup(dir: PathBuf, max_age: Duration) {
    tokio::spawn(async move {
        let removed = cleanup_outputs(&dir, max_age).await;
        tracing::debug!(dir = %dir.display(), removed, "Post-job output cleanup done");
    });
}

/// Periodically sweep `dir` until `cancel` is triggered.
///
/// Covers outputs left behind by jobs that failed before collection.
pub async fn run_output_sweep(dir: PathBuf, max_age: Duration, cancel: CancellationToken) {
    tracing::info!(
        dir = %dir.display(),
        max_age_secs = max_age.as_secs(),
        interval_secs = SWEEP_INTERVAL.as_secs(),
        "Output sweep started",
    );

    let mut interval = tokio::time::interval(SWEEP_INTERVAL);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Output sweep stopping");
                break;
            }
            _ = interval.tick() => {
                let removed = cleanup_outputs(&dir, max_age).await;
                if removed > 0 {
                    tracing::info!(removed, "Output sweep: purged old files");
                } else {
                    tracing::debug!("Output sweep: nothing to purge");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sweep_stops_on_cancel() {
        let tmp = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_output_sweep(
            tmp.path().to_path_buf(),
            Duration::from_secs(3600),
            cancel.clone(),
        ));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("sweep did not stop")
            .unwrap();
    }
}
