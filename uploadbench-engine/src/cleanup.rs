//! Removal of transient run state.
//!
//! Every run leaves behind at most one scratch directory per worker and one start marker, all
//! directly below the working directory and named after the owning process:
//!
//! - `uploadbench-<pid>-<worker>/` for file-backed payloads
//! - `uploadbench-<pid>.start` for the barrier release marker
//!
//! The [`CleanupManager`] runs after every run outcome. Besides the state of its own run, it
//! removes leftovers of earlier runs whose process no longer exists. Failures are logged and
//! counted, never returned.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::pool::WorkerPool;
use crate::store::StoreConnector;
use crate::worker::WorkerId;

const PREFIX: &str = "uploadbench-";
const MARKER_SUFFIX: &str = ".start";

/// Location of a worker's scratch directory.
pub fn scratch_dir(working_dir: &Path, pid: u32, worker_id: WorkerId) -> PathBuf {
    working_dir.join(format!("{PREFIX}{pid}-{worker_id}"))
}

/// Location of the start marker of a run.
pub fn start_marker(working_dir: &Path, pid: u32) -> PathBuf {
    working_dir.join(format!("{PREFIX}{pid}{MARKER_SUFFIX}"))
}

/// Extracts the owning process id from an entry name, if it belongs to a run.
fn owner_pid(name: &str) -> Option<u32> {
    let rest = name.strip_prefix(PREFIX)?;
    let pid = match rest.strip_suffix(MARKER_SUFFIX) {
        Some(pid) => pid,
        None => {
            let (pid, worker) = rest.split_once('-')?;
            worker.parse::<usize>().ok()?;
            pid
        }
    };
    pid.parse().ok()
}

/// What the cleanup managed to do.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CleanupReport {
    /// Worker threads that were joined.
    pub workers_joined: usize,
    /// Scratch directories and markers that were removed.
    pub removed: Vec<PathBuf>,
    /// Number of steps that failed.
    pub failures: usize,
}

/// Tears down a run after any outcome.
#[derive(Debug)]
pub struct CleanupManager {
    working_dir: PathBuf,
    pid: u32,
}

impl CleanupManager {
    /// Creates a manager for runs of this process below `working_dir`.
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            pid: std::process::id(),
        }
    }

    /// Stops all workers, revokes the connector and removes transient files.
    pub async fn run(
        &self,
        pool: WorkerPool,
        connector: Arc<dyn StoreConnector>,
    ) -> CleanupReport {
        let mut report = CleanupReport::default();

        match tokio::task::spawn_blocking(move || pool.shutdown()).await {
            Ok(joined) => report.workers_joined = joined,
            Err(error) => {
                tracing::warn!(
                    error = &error as &dyn std::error::Error,
                    "failed to join workers"
                );
                report.failures += 1;
            }
        }

        connector.revoke();
        self.sweep(&mut report).await;

        tracing::debug!(
            workers_joined = report.workers_joined,
            removed = report.removed.len(),
            failures = report.failures,
            "cleanup finished"
        );
        report
    }

    /// Removes scratch directories and markers of this process and of dead processes.
    pub async fn sweep(&self, report: &mut CleanupReport) {
        let mut entries = match tokio::fs::read_dir(&self.working_dir).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return,
            Err(error) => {
                tracing::warn!(
                    path = %self.working_dir.display(),
                    error = &error as &dyn std::error::Error,
                    "failed to list working directory"
                );
                report.failures += 1;
                return;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(error) => {
                    tracing::warn!(
                        error = &error as &dyn std::error::Error,
                        "failed to read working directory entry"
                    );
                    report.failures += 1;
                    break;
                }
            };

            let name = entry.file_name();
            let Some(pid) = name.to_str().and_then(owner_pid) else {
                continue;
            };
            if pid != self.pid && process_alive(pid) {
                continue;
            }

            let path = entry.path();
            match remove(&path).await {
                Ok(()) => {
                    if pid != self.pid {
                        tracing::info!(path = %path.display(), pid, "removed orphaned run state");
                    }
                    report.removed.push(path);
                }
                Err(error) if error.kind() == io::ErrorKind::NotFound => (),
                Err(error) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = &error as &dyn std::error::Error,
                        "failed to remove run state"
                    );
                    report.failures += 1;
                }
            }
        }
    }
}

async fn remove(path: &Path) -> io::Result<()> {
    let metadata = tokio::fs::symlink_metadata(path).await?;
    if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    // Without a liveness check, leftovers of other processes are kept.
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[test]
    fn entry_names() {
        let dir = Path::new("/work");
        assert_eq!(
            scratch_dir(dir, 42, WorkerId(7)),
            Path::new("/work/uploadbench-42-7")
        );
        assert_eq!(start_marker(dir, 42), Path::new("/work/uploadbench-42.start"));

        assert_eq!(owner_pid("uploadbench-42-7"), Some(42));
        assert_eq!(owner_pid("uploadbench-42.start"), Some(42));
        assert_eq!(owner_pid("uploadbench-42"), None);
        assert_eq!(owner_pid("uploadbench-x-1"), None);
        assert_eq!(owner_pid("other-42-7"), None);
    }

    #[tokio::test]
    async fn sweeps_own_and_orphaned_state() {
        let tempdir = tempfile::tempdir().unwrap();
        let dir = tempdir.path();
        let pid = std::process::id();

        let own = scratch_dir(dir, pid, WorkerId(0));
        std::fs::create_dir_all(own.join("nested")).unwrap();
        std::fs::write(own.join("nested/block"), b"x").unwrap();
        std::fs::write(start_marker(dir, pid), b"now").unwrap();

        // Process ids are bounded well below this on every supported platform.
        let orphan = scratch_dir(dir, 999_999_999, WorkerId(3));
        std::fs::create_dir_all(&orphan).unwrap();

        let unrelated = dir.join("keep-me");
        std::fs::write(&unrelated, b"x").unwrap();

        let mut report = CleanupReport::default();
        CleanupManager::new(dir).sweep(&mut report).await;

        assert_eq!(report.removed.len(), 3);
        assert_eq!(report.failures, 0);
        assert!(!own.exists());
        assert!(!orphan.exists());
        assert!(!start_marker(dir, pid).exists());
        assert!(unrelated.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn keeps_state_of_live_processes() {
        let tempdir = tempfile::tempdir().unwrap();
        // The init process is always alive.
        let foreign = scratch_dir(tempdir.path(), 1, WorkerId(0));
        std::fs::create_dir_all(&foreign).unwrap();

        let mut report = CleanupReport::default();
        CleanupManager::new(tempdir.path()).sweep(&mut report).await;

        assert!(report.removed.is_empty());
        assert!(foreign.exists());
    }

    #[tokio::test]
    async fn missing_working_dir_is_fine() {
        let tempdir = tempfile::tempdir().unwrap();
        let mut report = CleanupReport::default();
        CleanupManager::new(tempdir.path().join("missing"))
            .sweep(&mut report)
            .await;
        assert_eq!(report, CleanupReport::default());
    }

    #[tokio::test]
    async fn revokes_connector() {
        #[derive(Debug, Default)]
        struct Revocable(std::sync::atomic::AtomicBool);

        #[async_trait::async_trait]
        impl StoreConnector for Revocable {
            async fn connect(&self) -> crate::error::StoreResult<crate::store::BoxedStore> {
                Ok(Box::new(InMemoryStore::new()))
            }

            fn revoke(&self) {
                self.0.store(true, std::sync::atomic::Ordering::SeqCst);
            }
        }

        let tempdir = tempfile::tempdir().unwrap();
        let config = crate::BenchmarkParams {
            block_size_kib: 1,
            files: Some(2),
            workers: Some(2),
            working_dir: tempdir.path().to_owned(),
            ..Default::default()
        }
        .resolve_with_cores(2)
        .unwrap()
        .config;

        let connector = Arc::new(Revocable::default());
        let mut pool = WorkerPool::new(config);
        pool.launch(connector.clone()).unwrap();

        let report = CleanupManager::new(tempdir.path())
            .run(pool, connector.clone())
            .await;

        assert_eq!(report.workers_joined, 2);
        assert!(connector.0.load(std::sync::atomic::Ordering::SeqCst));
    }
}
