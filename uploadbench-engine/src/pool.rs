//! The worker pool manager.
//!
//! The pool launches one [`Worker`] per share of files and tracks the state of every worker from
//! the events they send. It never blocks on a single worker: every wait is a loop over incoming
//! events and a periodic status tick, which also detects worker threads that terminated without
//! reporting.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{Interval, MissedTickBehavior};

use crate::barrier::ReadinessBarrier;
use crate::cleanup;
use crate::config::BenchmarkConfig;
use crate::error::RunError;
use crate::state::RunState;
use crate::store::StoreConnector;
use crate::worker::{Worker, WorkerAssignment, WorkerEvent, WorkerId, WorkerReport};

/// Launches workers and tracks their lifecycle.
#[derive(Debug)]
pub struct WorkerPool {
    config: BenchmarkConfig,
    barrier: ReadinessBarrier,
    sender: Option<UnboundedSender<WorkerEvent>>,
    events: UnboundedReceiver<WorkerEvent>,
    handles: BTreeMap<WorkerId, JoinHandle<()>>,
    states: BTreeMap<WorkerId, RunState>,
    reports: BTreeMap<WorkerId, WorkerReport>,
}

impl WorkerPool {
    /// Creates a pool for the given run. No worker is started yet.
    pub fn new(config: BenchmarkConfig) -> Self {
        let marker = cleanup::start_marker(&config.working_dir, std::process::id());
        let barrier = ReadinessBarrier::new(config.workers, marker);
        let (sender, events) = mpsc::unbounded_channel();

        Self {
            config,
            barrier,
            sender: Some(sender),
            events,
            handles: BTreeMap::new(),
            states: BTreeMap::new(),
            reports: BTreeMap::new(),
        }
    }

    /// The coarse state of the run, derived from all worker states.
    pub fn run_state(&self) -> RunState {
        RunState::aggregate(self.states.values().copied())
    }

    /// Spawns one worker per share of files.
    ///
    /// Can only be called once. If spawning a worker fails, the workers launched so far keep
    /// running until [`shutdown`](Self::shutdown).
    pub fn launch(&mut self, connector: Arc<dyn StoreConnector>) -> Result<(), RunError> {
        let Some(sender) = self.sender.take() else {
            return Ok(());
        };

        let pid = std::process::id();
        for (index, files) in self.config.shares().into_iter().enumerate() {
            let id = WorkerId(index);
            let assignment = WorkerAssignment {
                id,
                files,
                block_size: self.config.block_size as usize,
                source: self.config.source,
                scratch_dir: cleanup::scratch_dir(&self.config.working_dir, pid, id),
                key_prefix: self.config.tuning.key_prefix.clone(),
                upload_retries: self.config.tuning.upload_retries,
                nice: self.config.tuning.worker_nice,
            };

            let worker = Worker::new(
                assignment,
                connector.clone(),
                self.barrier.gate(),
                sender.clone(),
            );
            let handle = worker
                .spawn()
                .map_err(|cause| RunError::Spawn { worker_id: id, cause })?;

            self.handles.insert(id, handle);
            self.states.insert(id, RunState::Preparing);
        }

        tracing::info!(
            workers = self.config.workers,
            files = self.config.files,
            block_size = self.config.block_size,
            "launched workers"
        );
        Ok(())
    }

    /// Waits until every worker reported readiness.
    ///
    /// Returns early with an error as soon as one worker fails to prepare or terminates, or when
    /// the readiness timeout elapses. Remaining workers are not waited for.
    pub async fn await_ready(&mut self) -> Result<(), RunError> {
        let timeout = self.config.tuning.readiness_timeout;
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut status = self.status_interval();

        while !self.barrier.is_complete() {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event)?,
                    None => return Err(self.first_lost()),
                },
                _ = status.tick() => {
                    self.log_status();
                    if let Some(worker_id) = self.lost_workers().into_iter().next() {
                        return Err(RunError::WorkerLost { worker_id });
                    }
                }
                _ = &mut deadline => return Err(RunError::ReadinessTimeout(timeout)),
            }
        }

        tracing::info!(workers = self.barrier.arrived(), "all workers ready");
        Ok(())
    }

    /// Releases the barrier and returns the release time.
    pub async fn release(&mut self) -> Result<Instant, RunError> {
        self.barrier.release().await
    }

    /// Waits until every worker terminated and returns their reports in worker order.
    ///
    /// Workers that terminated without a report are recorded as failed.
    pub async fn await_completion(&mut self) -> Vec<WorkerReport> {
        let mut status = self.status_interval();

        while !self.is_terminal() {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => {
                        if let Err(error) = self.handle_event(event) {
                            tracing::error!(
                                error = &error as &dyn std::error::Error,
                                "worker failed after the barrier"
                            );
                        }
                    }
                    None => {
                        for worker_id in self.pending_workers() {
                            self.record_lost(worker_id);
                        }
                    }
                },
                _ = status.tick() => {
                    self.log_status();
                    for worker_id in self.lost_workers() {
                        self.record_lost(worker_id);
                    }
                }
            }
        }

        let mut reports = std::mem::take(&mut self.reports);
        self.states
            .keys()
            .map(|id| {
                reports
                    .remove(id)
                    .unwrap_or_else(|| WorkerReport::failed(*id, "worker terminated without report"))
            })
            .collect()
    }

    /// Aborts the barrier and joins every worker thread.
    ///
    /// Blocks the calling thread. Returns the number of joined workers.
    pub fn shutdown(mut self) -> usize {
        self.barrier.abort();

        let mut joined = 0;
        for (worker_id, handle) in std::mem::take(&mut self.handles) {
            match handle.join() {
                Ok(()) => joined += 1,
                Err(_) => tracing::error!(%worker_id, "worker thread panicked"),
            }
        }
        joined
    }

    fn handle_event(&mut self, event: WorkerEvent) -> Result<(), RunError> {
        match event {
            WorkerEvent::Ready(worker_id) => {
                self.set_state(worker_id, RunState::AwaitingBarrier);
                self.barrier.arrive(worker_id);
                tracing::debug!(
                    %worker_id,
                    ready = self.barrier.arrived(),
                    total = self.config.workers,
                    "worker ready"
                );
            }
            WorkerEvent::PreparationFailed { worker_id, message } => {
                self.set_state(worker_id, RunState::Failed);
                return Err(RunError::WorkerPreparation { worker_id, message });
            }
            WorkerEvent::Started { worker_id, .. } => {
                self.set_state(worker_id, RunState::Running);
            }
            WorkerEvent::Finished(report) => {
                let worker_id = report.worker_id;
                self.set_state(worker_id, report.state);
                self.reports.insert(worker_id, report);
            }
        }
        Ok(())
    }

    fn set_state(&mut self, worker_id: WorkerId, next: RunState) {
        if let Some(state) = self.states.get_mut(&worker_id) {
            if *state != next && state.can_transition_to(next) {
                *state = next;
            }
        }
    }

    fn record_lost(&mut self, worker_id: WorkerId) {
        tracing::error!(%worker_id, "worker terminated without reporting");
        self.set_state(worker_id, RunState::Failed);
    }

    /// Workers whose thread has exited while their state is not terminal.
    ///
    /// Drains pending events first, since a worker sends its last event right before exiting.
    fn lost_workers(&mut self) -> Vec<WorkerId> {
        let exited: Vec<_> = self
            .handles
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(id, _)| *id)
            .collect();
        if exited.is_empty() {
            return Vec::new();
        }

        while let Ok(event) = self.events.try_recv() {
            if let Err(error) = self.handle_event(event) {
                tracing::debug!(error = &error as &dyn std::error::Error, "late worker event");
            }
        }

        exited
            .into_iter()
            .filter(|id| self.states.get(id).is_some_and(|state| !state.is_terminal()))
            .collect()
    }

    fn pending_workers(&self) -> Vec<WorkerId> {
        self.states
            .iter()
            .filter(|(_, state)| !state.is_terminal())
            .map(|(id, _)| *id)
            .collect()
    }

    fn first_lost(&self) -> RunError {
        let worker_id = self
            .states
            .iter()
            .find(|(_, state)| **state == RunState::Preparing)
            .map(|(id, _)| *id)
            .unwrap_or(WorkerId(0));
        RunError::WorkerLost { worker_id }
    }

    fn is_terminal(&self) -> bool {
        self.states.values().all(|state| state.is_terminal())
    }

    fn status_interval(&self) -> Interval {
        let mut interval = tokio::time::interval(self.config.tuning.status_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    }

    fn log_status(&self) {
        let mut counts = BTreeMap::new();
        for state in self.states.values() {
            *counts.entry(state.to_string()).or_insert(0usize) += 1;
        }
        tracing::debug!(state = %self.run_state(), workers = ?counts, "pool status");
    }
}
