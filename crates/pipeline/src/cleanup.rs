//! Age-based sweep of the engine output directory.

use std::path::Path;
use std::time::{Duration, SystemTime};

/// Delete regular files directly under `dir` older than `max_age`.
///
/// Best effort: a missing directory counts as nothing to do, and files
/// that cannot be inspected or removed are logged and skipped.
/// Subdirectories are left alone. Returns the number of files removed.
pub async fn cleanup_outputs(dir: &Path, max_age: Duration) -> usize {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return 0,
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "Output cleanup: cannot read directory");
            return 0;
        }
    };

    let now = SystemTime::now();
    let mut removed = 0;

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "Output cleanup: directory listing failed");
                break;
            }
        };
        let path = entry.path();

        let modified = match entry.metadata().await {
            Ok(meta) if meta.is_file() => meta.modified(),
            Ok(_) => continue,
            Err(e) => Err(e),
        };
        let age = match modified {
            Ok(modified) => now.duration_since(modified).unwrap_or_default(),
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "Output cleanup: cannot stat file");
                continue;
            }
        };

        if age > max_age {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    removed += 1;
                    tracing::debug!(path = %path.display(), age_secs = age.as_secs(), "Removed old output");
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Output cleanup: remove failed");
                }
            }
        }
    }

    if removed > 0 {
        tracing::info!(dir = %dir.display(), removed, "Output cleanup finished");
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn age_file(path: &Path, age: Duration) {
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    #[tokio::test]
    async fn removes_only_old_top_level_files() {
        let tmp = tempfile::tempdir().unwrap();
        let old = tmp.path().join("old.png");
        let fresh = tmp.path().join("fresh.png");
        let nested_dir = tmp.path().join("batch");
        let nested = nested_dir.join("nested.png");
        std::fs::write(&old, b"x").unwrap();
        std::fs::write(&fresh, b"x").unwrap();
        std::fs::create_dir(&nested_dir).unwrap();
        std::fs::write(&nested, b"x").unwrap();
        age_file(&old, Duration::from_secs(7200));
        age_file(&nested, Duration::from_secs(7200));

        let removed = cleanup_outputs(tmp.path(), Duration::from_secs(3600)).await;

        assert_eq!(removed, 1);
        assert!(!old.exists());
        assert!(fresh.exists());
        assert!(nested.exists());
    }

    #[tokio::test]
    async fn missing_directory_is_a_no_op() {
        let tmp = tempfile::tempdir().unwrap();
        let removed = cleanup_outputs(&tmp.path().join("absent"), Duration::from_secs(1)).await;
        assert_eq!(removed, 0);
    }
}
