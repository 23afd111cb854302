//! Worker units.
//!
//! A worker owns a dedicated OS thread with its own single-threaded tokio runtime. It receives an
//! immutable [`WorkerAssignment`] when spawned, opens its own storage connection, prepares all of
//! its payloads and then waits on the [`StartGate`]. Once released it uploads its payloads strictly
//! in sequence, timing each call. The only way a worker talks to the orchestrator is through
//! [`WorkerEvent`]s.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::aggregate::{UploadOutcome, UploadSample};
use crate::barrier::StartGate;
use crate::config::PayloadSource;
use crate::error::{PreparationError, display_chain};
use crate::payload::{ContentGenerator, KeyGenerator, Payload};
use crate::state::RunState;
use crate::store::{BoxedStore, StoreConnector};

/// Identifies a worker within a run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The immutable share of a run assigned to one worker.
#[derive(Clone, Debug)]
pub struct WorkerAssignment {
    /// Identity of the worker.
    pub id: WorkerId,
    /// Number of payloads to upload.
    pub files: usize,
    /// Size of every payload in bytes.
    pub block_size: usize,
    /// Where payloads are kept until uploaded.
    pub source: PayloadSource,
    /// Private scratch directory for file-backed payloads.
    pub scratch_dir: PathBuf,
    /// Prefix of the generated object keys.
    pub key_prefix: String,
    /// Additional attempts for a failed upload.
    pub upload_retries: u32,
    /// Nice value applied to the worker thread.
    pub nice: i32,
}

/// Messages from workers to the orchestrator.
#[derive(Debug)]
pub enum WorkerEvent {
    /// All payloads are prepared and the worker waits on the barrier.
    Ready(WorkerId),
    /// Preparation failed. The worker will not upload anything.
    PreparationFailed {
        /// The failed worker.
        worker_id: WorkerId,
        /// Diagnostic message.
        message: String,
    },
    /// The worker observed the barrier release and starts uploading.
    Started {
        /// The started worker.
        worker_id: WorkerId,
        /// When the worker observed the release.
        at: Instant,
    },
    /// The worker terminated. Always the last event of a worker.
    Finished(WorkerReport),
}

/// The result of a worker, emitted when it terminates.
#[derive(Clone, Debug)]
pub struct WorkerReport {
    /// Identity of the worker.
    pub worker_id: WorkerId,
    /// Terminal state, either `Completed` or `Failed`.
    pub state: RunState,
    /// One sample per issued upload, in upload order.
    pub samples: Vec<UploadSample>,
    /// When the worker left the barrier.
    pub started_at: Option<Instant>,
    /// When the last upload returned.
    pub finished_at: Option<Instant>,
    /// Diagnostic message of a failed worker.
    pub error: Option<String>,
}

impl WorkerReport {
    /// Creates the report of a worker that failed without uploading.
    pub fn failed(worker_id: WorkerId, error: impl Into<String>) -> Self {
        Self {
            worker_id,
            state: RunState::Failed,
            samples: Vec::new(),
            started_at: None,
            finished_at: None,
            error: Some(error.into()),
        }
    }
}

/// A single worker unit, ready to be spawned onto its own thread.
#[derive(Debug)]
pub struct Worker {
    assignment: WorkerAssignment,
    connector: Arc<dyn StoreConnector>,
    gate: StartGate,
    events: UnboundedSender<WorkerEvent>,
    state: RunState,
}

impl Worker {
    /// Creates a worker in the `Preparing` state.
    pub fn new(
        assignment: WorkerAssignment,
        connector: Arc<dyn StoreConnector>,
        gate: StartGate,
        events: UnboundedSender<WorkerEvent>,
    ) -> Self {
        Self {
            assignment,
            connector,
            gate,
            events,
            state: RunState::Preparing,
        }
    }

    /// Spawns the worker onto a dedicated thread.
    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name(format!("upload-worker-{}", self.assignment.id))
            .spawn(move || self.run_blocking())
    }

    fn run_blocking(self) {
        let worker_id = self.assignment.id;
        elevate_priority(worker_id, self.assignment.nice);

        let events = self.events.clone();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build();

        let report = match runtime {
            Ok(runtime) => runtime.block_on(self.run()),
            Err(cause) => {
                let message = display_chain(&PreparationError::Runtime(cause));
                let _ = events.send(WorkerEvent::PreparationFailed {
                    worker_id,
                    message: message.clone(),
                });
                WorkerReport::failed(worker_id, message)
            }
        };

        // The orchestrator may already be gone if the run was aborted.
        let _ = events.send(WorkerEvent::Finished(report));
    }

    /// Prepares, waits for the barrier and uploads. Returns the final report.
    pub async fn run(mut self) -> WorkerReport {
        let worker_id = self.assignment.id;

        // An abort while preparing stops payload generation right away.
        let mut abort = self.gate.clone();
        let prepared = tokio::select! {
            prepared = self.prepare() => Some(prepared),
            () = abort.aborted() => None,
        };

        let (store, payloads) = match prepared {
            Some(Ok(prepared)) => prepared,
            None => {
                tracing::debug!(%worker_id, "run aborted while preparing");
                self.remove_scratch().await;
                return self.fail("aborted while preparing");
            }
            Some(Err(error)) => {
                tracing::error!(
                    %worker_id,
                    error = &error as &dyn std::error::Error,
                    "worker preparation failed"
                );
                let message = display_chain(&error);
                self.send(WorkerEvent::PreparationFailed {
                    worker_id,
                    message: message.clone(),
                });
                self.remove_scratch().await;
                return self.fail(message);
            }
        };

        self.transition(RunState::AwaitingBarrier);
        self.send(WorkerEvent::Ready(worker_id));

        if self.gate.wait().await.is_none() {
            tracing::debug!(%worker_id, "run aborted before start");
            drop(payloads);
            self.remove_scratch().await;
            return self.fail("aborted before the barrier was released");
        }

        let started_at = Instant::now();
        self.transition(RunState::Running);
        self.send(WorkerEvent::Started {
            worker_id,
            at: started_at,
        });

        let samples = self.upload_all(&store, &payloads).await;
        let finished_at = Instant::now();

        drop(payloads);
        self.remove_scratch().await;
        self.transition(RunState::Completed);

        tracing::debug!(
            %worker_id,
            uploads = samples.len(),
            elapsed = ?finished_at.duration_since(started_at),
            "worker completed"
        );

        WorkerReport {
            worker_id,
            state: self.state,
            samples,
            started_at: Some(started_at),
            finished_at: Some(finished_at),
            error: None,
        }
    }

    async fn prepare(&self) -> Result<(BoxedStore, Vec<Payload>), PreparationError> {
        let assignment = &self.assignment;
        let store = self
            .connector
            .connect()
            .await
            .map_err(PreparationError::Connect)?;

        let mut generator = match assignment.source {
            PayloadSource::Memory => ContentGenerator::in_memory(assignment.block_size),
            PayloadSource::Filesystem => {
                ContentGenerator::on_disk(assignment.block_size, &assignment.scratch_dir)
            }
        };
        let payloads = generator.generate_all(assignment.files).await?;

        tracing::debug!(
            worker_id = %assignment.id,
            store = store.name(),
            payloads = payloads.len(),
            "worker prepared"
        );
        Ok((store, payloads))
    }

    async fn upload_all(&self, store: &BoxedStore, payloads: &[Payload]) -> Vec<UploadSample> {
        let worker_id = self.assignment.id;
        let mut keys = KeyGenerator::new(self.assignment.key_prefix.as_str());
        let mut samples = Vec::with_capacity(payloads.len());

        for payload in payloads {
            let key = keys.next_key();
            let start = Instant::now();

            let mut result = store.put_object(&key, payload).await;
            let mut attempt = 0;
            while result.is_err() && attempt < self.assignment.upload_retries {
                attempt += 1;
                tracing::debug!(%worker_id, %key, attempt, "retrying upload");
                result = store.put_object(&key, payload).await;
            }

            let elapsed = start.elapsed();
            let outcome = match result {
                Ok(()) => UploadOutcome::Success,
                Err(error) => {
                    tracing::warn!(
                        %worker_id,
                        %key,
                        error = &error as &dyn std::error::Error,
                        "upload failed"
                    );
                    UploadOutcome::Failed(display_chain(&error))
                }
            };

            samples.push(UploadSample {
                worker_id,
                elapsed,
                outcome,
            });
        }

        samples
    }

    async fn remove_scratch(&self) {
        if self.assignment.source != PayloadSource::Filesystem {
            return;
        }
        let dir = &self.assignment.scratch_dir;
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => (),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => (),
            Err(error) => tracing::warn!(
                worker_id = %self.assignment.id,
                path = %dir.display(),
                error = &error as &dyn std::error::Error,
                "failed to remove scratch directory"
            ),
        }
    }

    fn fail(&mut self, message: impl Into<String>) -> WorkerReport {
        self.transition(RunState::Failed);
        WorkerReport::failed(self.assignment.id, message)
    }

    fn transition(&mut self, next: RunState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid transition {} -> {next}",
            self.state
        );
        tracing::trace!(worker_id = %self.assignment.id, from = %self.state, to = %next);
        self.state = next;
    }

    fn send(&self, event: WorkerEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!(worker_id = %self.assignment.id, "orchestrator is gone");
        }
    }
}

#[cfg(unix)]
fn elevate_priority(worker_id: WorkerId, nice: i32) {
    // With `PRIO_PROCESS` and `who == 0` Linux applies the value to the calling thread only.
    // SAFETY: `setpriority` takes plain integers and reads or writes no memory of ours. Failure
    // is reported through the return value and `errno`.
    let result = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, nice) };
    if result != 0 {
        let error = std::io::Error::last_os_error();
        tracing::debug!(
            %worker_id,
            nice,
            error = &error as &dyn std::error::Error,
            "could not elevate worker priority"
        );
    }
}

#[cfg(not(unix))]
fn elevate_priority(worker_id: WorkerId, nice: i32) {
    tracing::debug!(%worker_id, nice, "worker priority elevation is not supported");
}
