//! Deferred deletion of artifacts and the stale-file sweep.
//!
//! Every download arms a one-shot timer. Timers live only in memory, so the
//! sweep run at startup (and before each new download) collects whatever a
//! crashed or stopped process left behind.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use tokio::{task::JoinHandle, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{error::Error, store::ArtifactStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionOutcome {
    Removed,
    AlreadyGone,
    Failed,
    Cancelled,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: Vec<String>,
    pub kept: usize,
}

/// Spawns detached deletion timers. Cloning shares the same shutdown token.
#[derive(Debug, Clone, Default)]
pub struct ExpiryScheduler {
    shutdown: CancellationToken,
}

/// Handle to one armed timer. Dropping it leaves the timer running.
#[derive(Debug)]
pub struct ScheduledDeletion {
    cancel: CancellationToken,
    task: JoinHandle<DeletionOutcome>,
}

impl ScheduledDeletion {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the timer to fire or be cancelled.
    pub async fn wait(self) -> DeletionOutcome {
        self.task.await.unwrap_or(DeletionOutcome::Cancelled)
    }
}

impl ExpiryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms a one-shot deletion of `path` after `delay`.
    ///
    /// The timer never reports to a caller: a missing file is a no-op and any
    /// other failure is logged.
    pub fn schedule_deletion(&self, path: PathBuf, delay: Duration) -> ScheduledDeletion {
        debug!("Scheduled deletion of {:?} in {}s", path, delay.as_secs());
        let cancel = self.shutdown.child_token();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Deletion of {:?} cancelled", path);
                        DeletionOutcome::Cancelled
                    }
                    _ = tokio::time::sleep(delay) => remove_artifact(&path).await,
                }
            }
        });

        ScheduledDeletion { cancel, task }
    }

    /// Cancels every pending timer. Files they guarded are left for the
    /// next sweep.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

async fn remove_artifact(path: &Path) -> DeletionOutcome {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            info!("Cleaned up: {:?}", file_name(path));
            DeletionOutcome::Removed
        }
        Err(error) if error.kind() == ErrorKind::NotFound => DeletionOutcome::AlreadyGone,
        Err(source) => {
            let error = Error::CleanupFailure {
                path: path.display().to_string(),
                source,
            };
            warn!("{error}");
            DeletionOutcome::Failed
        }
    }
}

/// Removes every store entry older than `max_age`.
pub async fn sweep_stale(store: &ArtifactStore, max_age: Duration) -> SweepReport {
    sweep_stale_at(store, max_age, Utc::now()).await
}

/// [`sweep_stale`] against an explicit clock reading.
pub async fn sweep_stale_at(
    store: &ArtifactStore,
    max_age: Duration,
    now: DateTime<Utc>,
) -> SweepReport {
    let mut report = SweepReport::default();
    let names = match store.list_names().await {
        Ok(names) => names,
        Err(error) => {
            warn!("Could not open store {:?} for sweeping: {error}", store.root());
            return report;
        }
    };
    let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);

    for name in names {
        let path = store.root().join(&name);
        let metadata = match tokio::fs::symlink_metadata(&path).await {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == ErrorKind::NotFound => continue,
            Err(error) => {
                warn!("Could not read metadata of {:?}: {error}", path);
                continue;
            }
        };

        let Some(born_at) = creation_time(&metadata) else {
            warn!("No timestamp available for {:?}", path);
            continue;
        };
        let age = (now - born_at).max(chrono::Duration::zero());
        if age <= max_age {
            report.kept += 1;
            continue;
        }

        let removal = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };

        match removal {
            Ok(()) => {
                info!("Cleaned old file: {name}");
                report.removed.push(name);
            }
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(source) => {
                let error = Error::CleanupFailure {
                    path: path.display().to_string(),
                    source,
                };
                warn!("{error}");
            }
        }
    }

    report
}

/// Birth time where the filesystem records one, modification time otherwise.
fn creation_time(metadata: &std::fs::Metadata) -> Option<DateTime<Utc>> {
    metadata
        .created()
        .or_else(|_| metadata.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test(start_paused = true)]
    async fn file_is_removed_after_delay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ab12cd34_clip.mp4");
        std::fs::write(&path, b"data").unwrap();

        let scheduler = ExpiryScheduler::new();
        let handle = scheduler.schedule_deletion(path.clone(), Duration::from_secs(300));
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_secs(299)).await;
        tokio::task::yield_now().await;
        assert!(path.exists());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(handle.wait().await, DeletionOutcome::Removed);
        assert!(!path.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn deleting_twice_or_missing_file_is_a_no_op() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ab12cd34_clip.mp4");
        std::fs::write(&path, b"data").unwrap();

        let scheduler = ExpiryScheduler::new();
        let never_created =
            scheduler.schedule_deletion(dir.path().join("zz99zz99_none.mp4"), Duration::from_secs(5));
        let first = scheduler.schedule_deletion(path.clone(), Duration::from_secs(10));
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(never_created.wait().await, DeletionOutcome::AlreadyGone);
        assert_eq!(first.wait().await, DeletionOutcome::Removed);

        let second = scheduler.schedule_deletion(path.clone(), Duration::from_secs(10));
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(second.wait().await, DeletionOutcome::AlreadyGone);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_keeps_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ab12cd34_clip.mp4");
        std::fs::write(&path, b"data").unwrap();

        let scheduler = ExpiryScheduler::new();
        let handle = scheduler.schedule_deletion(path.clone(), Duration::from_secs(60));
        handle.cancel();

        tokio::time::advance(Duration::from_secs(120)).await;
        assert_eq!(handle.wait().await, DeletionOutcome::Cancelled);
        assert!(path.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_pending_timers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ab12cd34_clip.mp4");
        std::fs::write(&path, b"data").unwrap();

        let scheduler = ExpiryScheduler::new();
        let handle = scheduler.schedule_deletion(path.clone(), Duration::from_secs(60));
        scheduler.clone().shutdown();

        assert_eq!(handle.wait().await, DeletionOutcome::Cancelled);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn sweep_removes_only_files_past_threshold() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).await.unwrap();
        std::fs::write(store.root().join("ab12cd34_old.mp4"), b"old").unwrap();

        let max_age = Duration::from_secs(1800);

        let report = sweep_stale_at(&store, max_age, Utc::now()).await;
        assert!(report.removed.is_empty());
        assert_eq!(report.kept, 1);

        let later = Utc::now() + chrono::Duration::minutes(31);
        let report = sweep_stale_at(&store, max_age, later).await;
        assert_eq!(report.removed, vec!["ab12cd34_old.mp4".to_string()]);
        assert!(store.list_names().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sweep_of_missing_store_is_harmless() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open(dir.path().join("store")).await.unwrap();
        std::fs::remove_dir(store.root()).unwrap();

        let report = sweep_stale(&store, Duration::from_secs(1)).await;
        assert_eq!(report, SweepReport::default());
    }
}
