use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::aggregate::{BenchmarkReport, ResultAggregator};
use crate::cleanup::CleanupManager;
use crate::config::BenchmarkConfig;
use crate::error::RunError;
use crate::pool::WorkerPool;
use crate::sampler::{NetworkCounter, ThroughputSampler};
use crate::store::StoreConnector;
use crate::worker::WorkerReport;

/// The result of a completed run.
#[derive(Debug)]
pub struct RunOutcome {
    /// The aggregated report.
    pub report: BenchmarkReport,
    /// When the barrier was released.
    pub released_at: Instant,
    /// The reports of all workers, in worker order.
    pub workers: Vec<WorkerReport>,
}

/// Executes a full benchmark run.
///
/// Launches the workers, waits for all of them to become ready, releases the barrier and samples
/// network throughput until every worker terminated. Cleanup runs after every outcome, and its
/// failures never replace the result of the run.
pub async fn run(
    config: &BenchmarkConfig,
    connector: Arc<dyn StoreConnector>,
    counter: Box<dyn NetworkCounter>,
) -> Result<RunOutcome, RunError> {
    let mut pool = WorkerPool::new(config.clone());
    let result = drive(config, &mut pool, connector.clone(), counter).await;

    let cleanup = CleanupManager::new(&config.working_dir);
    let report = cleanup.run(pool, connector).await;
    if report.failures > 0 {
        tracing::warn!(failures = report.failures, "cleanup was incomplete");
    }

    result
}

async fn drive(
    config: &BenchmarkConfig,
    pool: &mut WorkerPool,
    connector: Arc<dyn StoreConnector>,
    counter: Box<dyn NetworkCounter>,
) -> Result<RunOutcome, RunError> {
    pool.launch(connector)?;
    pool.await_ready().await?;

    let released_at = pool.release().await?;
    tracing::info!("barrier released, uploading");

    let cancel = CancellationToken::new();
    let sampler = ThroughputSampler::new(counter, config.tuning.sample_interval);
    let sampling = tokio::spawn(sampler.run(cancel.clone()));

    let workers = pool.await_completion().await;
    cancel.cancel();
    let samples = match sampling.await {
        Ok(samples) => samples,
        Err(error) => {
            tracing::warn!(
                error = &error as &dyn std::error::Error,
                "throughput sampler failed"
            );
            Vec::new()
        }
    };

    let mut aggregator = ResultAggregator::new(config);
    for worker in &workers {
        if let Some(error) = &worker.error {
            tracing::error!(worker_id = %worker.worker_id, %error, "worker failed");
        }
        aggregator.add_worker(worker);
    }
    for sample in samples {
        aggregator.add_throughput(sample);
    }

    let report = aggregator.finish(released_at);
    tracing::info!(
        average = %report.average(),
        peak = %report.peak,
        failed = report.uploads_failed,
        "benchmark finished"
    );

    Ok(RunOutcome {
        report,
        released_at,
        workers,
    })
}
