//! Two-phase readiness barrier.
//!
//! In the gather phase the orchestrator records every worker that reported readiness. Once all
//! expected workers have arrived, [`ReadinessBarrier::release`] publishes a start marker file for
//! external observers and broadcasts [`StartSignal::Start`] to every [`StartGate`]. Workers
//! waiting on a gate wake up together, so the start skew is bounded by scheduling latency only.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime};

use tokio::sync::watch;

use crate::error::RunError;
use crate::worker::WorkerId;

/// The signal observed by workers waiting on the barrier.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StartSignal {
    /// The barrier has not been released yet.
    Waiting,
    /// All workers were ready; uploads may begin. Carries the release time.
    Start(Instant),
    /// The run was aborted before the barrier was released.
    Abort,
}

/// The orchestrator side of the barrier.
#[derive(Debug)]
pub struct ReadinessBarrier {
    expected: usize,
    arrived: BTreeSet<WorkerId>,
    marker: PathBuf,
    sender: watch::Sender<StartSignal>,
}

impl ReadinessBarrier {
    /// Creates a barrier for `expected` workers that publishes `marker` on release.
    pub fn new(expected: usize, marker: impl Into<PathBuf>) -> Self {
        let (sender, _) = watch::channel(StartSignal::Waiting);
        Self {
            expected,
            arrived: BTreeSet::new(),
            marker: marker.into(),
            sender,
        }
    }

    /// Returns a new gate for a worker.
    pub fn gate(&self) -> StartGate {
        StartGate {
            receiver: self.sender.subscribe(),
        }
    }

    /// Records that a worker is ready. Returns `true` once all expected workers have arrived.
    ///
    /// Repeated arrivals of the same worker are counted once.
    pub fn arrive(&mut self, worker_id: WorkerId) -> bool {
        self.arrived.insert(worker_id);
        self.is_complete()
    }

    /// Number of distinct workers that reported readiness.
    pub fn arrived(&self) -> usize {
        self.arrived.len()
    }

    /// Returns `true` once all expected workers have arrived.
    pub fn is_complete(&self) -> bool {
        self.arrived.len() >= self.expected
    }

    /// Location of the start marker file.
    pub fn marker(&self) -> &Path {
        &self.marker
    }

    /// Publishes the start marker and releases all waiting workers.
    ///
    /// Returns the release time. Every worker observes a start time at or after this instant.
    pub async fn release(&self) -> Result<Instant, RunError> {
        write_marker(&self.marker).await.map_err(|cause| RunError::StartMarker {
            path: self.marker.clone(),
            cause,
        })?;

        let released_at = Instant::now();
        self.sender.send_replace(StartSignal::Start(released_at));
        tracing::debug!(marker = %self.marker.display(), "barrier released");
        Ok(released_at)
    }

    /// Releases all waiting workers without starting uploads.
    ///
    /// Has no effect once the barrier was released.
    pub fn abort(&self) {
        self.sender.send_if_modified(|signal| {
            if *signal == StartSignal::Waiting {
                *signal = StartSignal::Abort;
                true
            } else {
                false
            }
        });
    }
}

async fn write_marker(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let timestamp = humantime::format_rfc3339(SystemTime::now());
    tokio::fs::write(path, format!("{timestamp}\n")).await
}

/// The worker side of the barrier.
#[derive(Clone, Debug)]
pub struct StartGate {
    receiver: watch::Receiver<StartSignal>,
}

impl StartGate {
    /// Waits until the barrier is released or aborted.
    ///
    /// Returns the release time, or `None` if the run was aborted or the barrier was dropped
    /// before release.
    pub async fn wait(&mut self) -> Option<Instant> {
        let signal = self
            .receiver
            .wait_for(|signal| *signal != StartSignal::Waiting)
            .await
            .ok()
            .map(|signal| *signal)?;

        match signal {
            StartSignal::Start(at) => Some(at),
            StartSignal::Waiting | StartSignal::Abort => None,
        }
    }

    /// Resolves once the run is aborted or the barrier is dropped.
    ///
    /// Never resolves after a release, so it can be raced against work that precedes the barrier.
    pub async fn aborted(&mut self) {
        let _ = self
            .receiver
            .wait_for(|signal| *signal == StartSignal::Abort)
            .await;
    }
}
