use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tracing_subscriber::EnvFilter;
use uploadbench_engine::cleanup;
use uploadbench_engine::config::{AveragingMode, PayloadSource};
use uploadbench_engine::error::{StoreError, StoreResult};
use uploadbench_engine::sampler::NetworkCounter;
use uploadbench_engine::state::RunState;
use uploadbench_engine::store::{BoxedStore, InMemoryStore, StoreConnector};
use uploadbench_engine::worker::WorkerId;
use uploadbench_engine::{BenchmarkConfig, BenchmarkParams, RunError};

fn init_tracing() {
    let env_filter = EnvFilter::new("ERROR")
        .add_directive("uploadbench_engine=TRACE".parse().unwrap());

    tracing_subscriber::fmt::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_test_writer()
        .compact()
        .try_init()
        .ok();
}

/// Pretends a constant stream of bytes leaves the host.
#[derive(Debug, Default)]
struct SteadyCounter {
    total: u64,
}

impl NetworkCounter for SteadyCounter {
    fn bytes_sent(&mut self) -> io::Result<u64> {
        self.total += 64 * 1024;
        Ok(self.total)
    }
}

/// Refuses the first connection and never completes any other.
#[derive(Debug, Default)]
struct StallingConnector {
    refuse_first: bool,
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl StoreConnector for StallingConnector {
    async fn connect(&self) -> StoreResult<BoxedStore> {
        if self.refuse_first && self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(StoreError::MissingCredentials("stalling"));
        }
        std::future::pending().await
    }
}

/// Brings down the worker thread that tries to connect.
#[derive(Debug)]
struct PanickingConnector;

#[async_trait::async_trait]
impl StoreConnector for PanickingConnector {
    async fn connect(&self) -> StoreResult<BoxedStore> {
        panic!("connector exploded");
    }
}

fn config(
    working_dir: &Path,
    source: PayloadSource,
    files: usize,
    workers: usize,
) -> BenchmarkConfig {
    let mut params = BenchmarkParams {
        block_size_kib: 16,
        files: Some(files),
        workers: Some(workers),
        source,
        working_dir: working_dir.to_owned(),
        ..Default::default()
    };
    params.tuning.status_interval = Duration::from_millis(50);
    params.tuning.sample_interval = Duration::from_millis(10);
    params.tuning.worker_nice = 0;
    params.resolve_with_cores(4).unwrap().config
}

fn leftovers(working_dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(working_dir) else {
        return Vec::new();
    };
    entries
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("uploadbench-"))
        .collect()
}

#[tokio::test]
async fn memory_run_uploads_every_file() {
    init_tracing();
    let tempdir = tempfile::tempdir().unwrap();
    let store = InMemoryStore::new().with_latency(Duration::from_millis(5));
    let config = config(tempdir.path(), PayloadSource::Memory, 40, 4);

    let outcome = uploadbench_engine::run(
        &config,
        Arc::new(store.clone()),
        Box::new(SteadyCounter::default()),
    )
    .await
    .unwrap();

    assert_eq!(outcome.workers.len(), 4);
    for (worker, files) in outcome.workers.iter().zip(config.shares()) {
        assert_eq!(worker.state, RunState::Completed);
        assert_eq!(worker.samples.len(), files);
        assert!(worker.started_at.unwrap() >= outcome.released_at);
    }

    let report = outcome.report;
    assert_eq!(report.uploads_succeeded, 40);
    assert!(report.is_comparable());
    assert!(report.wall_clock > Duration::ZERO);
    assert!(report.average().megabytes_per_second() > 0.0);
    assert!(report.peak >= report.sampled_average);
    assert_eq!(store.object_count(), 40);
    assert_eq!(store.stored_bytes(), config.total_bytes());
}

#[tokio::test]
async fn filesystem_run_cleans_up() {
    init_tracing();
    let tempdir = tempfile::tempdir().unwrap();
    let working_dir = tempdir.path().join("work");
    let store = InMemoryStore::new();
    let mut config = config(&working_dir, PayloadSource::Filesystem, 9, 3);
    config.tuning.averaging = AveragingMode::WorkerTime;

    let outcome = uploadbench_engine::run(
        &config,
        Arc::new(store.clone()),
        Box::new(SteadyCounter::default()),
    )
    .await
    .unwrap();

    assert_eq!(outcome.report.uploads_succeeded, 9);
    assert_eq!(store.object_count(), 9);
    assert_eq!(leftovers(&working_dir), Vec::<String>::new());
}

#[tokio::test]
async fn preparation_failure_aborts_and_cleans_up() {
    init_tracing();
    let tempdir = tempfile::tempdir().unwrap();
    let working_dir = tempdir.path();
    let store = InMemoryStore::new();
    let config = config(working_dir, PayloadSource::Filesystem, 8, 4);

    // A file where worker 2 expects its scratch directory makes its preparation fail.
    let blocked = cleanup::scratch_dir(working_dir, std::process::id(), WorkerId(2));
    std::fs::write(&blocked, b"in the way").unwrap();

    let err = uploadbench_engine::run(
        &config,
        Arc::new(store.clone()),
        Box::new(SteadyCounter::default()),
    )
    .await
    .unwrap_err();

    assert!(matches!(
        err,
        RunError::WorkerPreparation {
            worker_id: WorkerId(2),
            ..
        }
    ));
    assert_eq!(store.object_count(), 0);
    assert_eq!(leftovers(working_dir), Vec::<String>::new());
}

#[tokio::test]
async fn failed_uploads_degrade_the_report() {
    init_tracing();
    let tempdir = tempfile::tempdir().unwrap();
    let store = InMemoryStore::new().failing_every(4);
    let config = config(tempdir.path(), PayloadSource::Memory, 16, 2);

    let outcome = uploadbench_engine::run(
        &config,
        Arc::new(store.clone()),
        Box::new(SteadyCounter::default()),
    )
    .await
    .unwrap();

    let report = outcome.report;
    assert_eq!(report.uploads_succeeded + report.uploads_failed, 16);
    assert_eq!(report.uploads_failed, 4);
    assert!(!report.is_comparable());
    assert_eq!(store.object_count(), 12);

    let samples: usize = outcome.workers.iter().map(|w| w.samples.len()).sum();
    assert_eq!(samples, 16);
}

#[tokio::test]
async fn readiness_timeout() {
    init_tracing();
    let tempdir = tempfile::tempdir().unwrap();
    let mut config = config(tempdir.path(), PayloadSource::Filesystem, 4, 2);
    config.tuning.readiness_timeout = Duration::from_millis(100);

    let result = tokio::time::timeout(
        Duration::from_secs(30),
        uploadbench_engine::run(
            &config,
            Arc::new(StallingConnector::default()),
            Box::new(SteadyCounter::default()),
        ),
    )
    .await
    .expect("stalled workers must be aborted");

    assert!(matches!(
        result,
        Err(RunError::ReadinessTimeout(timeout)) if timeout == Duration::from_millis(100)
    ));
    assert_eq!(leftovers(tempdir.path()), Vec::<String>::new());
}

#[tokio::test]
async fn preparation_failure_does_not_wait_for_siblings() {
    init_tracing();
    let tempdir = tempfile::tempdir().unwrap();
    let config = config(tempdir.path(), PayloadSource::Memory, 4, 4);
    let connector = Arc::new(StallingConnector {
        refuse_first: true,
        ..Default::default()
    });

    let start = Instant::now();
    let result = tokio::time::timeout(
        Duration::from_secs(30),
        uploadbench_engine::run(
            &config,
            connector.clone(),
            Box::new(SteadyCounter::default()),
        ),
    )
    .await
    .expect("stalled siblings must be aborted");

    assert!(matches!(result, Err(RunError::WorkerPreparation { .. })));
    assert!(start.elapsed() < Duration::from_secs(10));
    assert!(connector.calls.load(Ordering::SeqCst) >= 1);
    assert_eq!(leftovers(tempdir.path()), Vec::<String>::new());
}

#[tokio::test]
async fn lost_worker_aborts_and_cleans_up() {
    init_tracing();
    let tempdir = tempfile::tempdir().unwrap();
    let config = config(tempdir.path(), PayloadSource::Filesystem, 6, 3);

    let result = tokio::time::timeout(
        Duration::from_secs(30),
        uploadbench_engine::run(
            &config,
            Arc::new(PanickingConnector),
            Box::new(SteadyCounter::default()),
        ),
    )
    .await
    .expect("lost workers must not hang the run");

    assert!(matches!(result, Err(RunError::WorkerLost { .. })));
    assert_eq!(leftovers(tempdir.path()), Vec::<String>::new());
}
