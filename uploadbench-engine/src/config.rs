//! Resolution of raw run parameters into an immutable [`BenchmarkConfig`].
//!
//! Block size, file count and worker count are resolved once before any worker starts. Unset
//! counts are derived from the block size and the number of logical cores:
//!
//! - workers: `min(48 × 512 / blockSizeKiB, cores × 6)`, at least one
//! - files: enough blocks to upload roughly 1 GiB
//!
//! The resolved config is shared read-only with every component of the run.

use std::path::PathBuf;
use std::thread::available_parallelism;
use std::time::Duration;

use bytesize::ByteSize;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Volume uploaded by a run when the file count is derived.
const TARGET_VOLUME: u64 = 1024 * 1024 * 1024;
/// Worker budget at the reference block size.
const WORKER_BUDGET: f64 = 48.0;
/// Block size in KiB at which [`WORKER_BUDGET`] workers are started.
const REFERENCE_BLOCK_KIB: f64 = 512.0;
/// Upper bound of workers per logical core.
const WORKERS_PER_CORE: usize = 6;

/// Default block size in KiB.
pub const DEFAULT_BLOCK_SIZE_KIB: u64 = 2048;
/// Projected payload volume from which a run has to be confirmed explicitly.
pub const DEFAULT_CONFIRM_THRESHOLD: ByteSize = ByteSize::gib(2);

/// Where generated payloads live until they are uploaded.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadSource {
    /// Payloads are kept as byte buffers in memory.
    #[default]
    Memory,
    /// Payloads are written to a scratch directory and uploaded from there.
    Filesystem,
}

/// How files that do not divide evenly across workers are handled.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemainderPolicy {
    /// The first `files % workers` workers upload one extra file.
    #[default]
    Distribute,
    /// Refuse to run unless the file count divides evenly.
    Reject,
}

/// Which duration the headline average throughput is computed over.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AveragingMode {
    /// Time from barrier release until the last worker finished.
    #[default]
    WallClock,
    /// Sum of all upload times divided by the worker count.
    ///
    /// This assumes the sequential uploads of all workers overlap evenly and is kept for
    /// comparison with results of earlier tooling.
    WorkerTime,
}

/// Knobs of a run that do not influence sizing.
#[derive(Clone, Debug)]
pub struct Tuning {
    /// Prefix of every uploaded object key.
    pub key_prefix: String,
    /// Which average is reported as the headline figure.
    pub averaging: AveragingMode,
    /// Additional attempts for a failed upload. Zero keeps failures fail-fast.
    pub upload_retries: u32,
    /// Nice value every worker thread tries to apply to itself.
    pub worker_nice: i32,
    /// Interval at which the pool polls worker status.
    pub status_interval: Duration,
    /// Interval of the network throughput sampler.
    pub sample_interval: Duration,
    /// Time to wait for all workers to become ready.
    pub readiness_timeout: Duration,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            key_prefix: "uploadbench".into(),
            averaging: AveragingMode::default(),
            upload_retries: 0,
            worker_nice: -10,
            status_interval: Duration::from_secs(2),
            sample_interval: Duration::from_secs(2),
            readiness_timeout: Duration::from_secs(600),
        }
    }
}

/// Raw, partially specified parameters of a run.
#[derive(Clone, Debug)]
pub struct BenchmarkParams {
    /// Size of every payload in KiB.
    pub block_size_kib: u64,
    /// Number of files to upload. Derived from the block size when unset.
    pub files: Option<usize>,
    /// Number of concurrent workers. Derived from block size and cores when unset.
    pub workers: Option<usize>,
    /// Where payloads are kept before uploading.
    pub source: PayloadSource,
    /// Scratch directory for file-backed payloads and the start marker.
    pub working_dir: PathBuf,
    /// Handling of files that do not divide evenly across workers.
    pub remainder: RemainderPolicy,
    /// Projected volume from which the run must be confirmed.
    pub confirm_threshold: ByteSize,
    /// Remaining knobs, passed through unchanged.
    pub tuning: Tuning,
}

impl Default for BenchmarkParams {
    fn default() -> Self {
        Self {
            block_size_kib: DEFAULT_BLOCK_SIZE_KIB,
            files: None,
            workers: None,
            source: PayloadSource::default(),
            working_dir: PathBuf::from("/tmp/uploadbench"),
            remainder: RemainderPolicy::default(),
            confirm_threshold: DEFAULT_CONFIRM_THRESHOLD,
            tuning: Tuning::default(),
        }
    }
}

/// The outcome of resolving [`BenchmarkParams`].
#[derive(Debug)]
pub struct Resolution {
    /// The immutable config of the run.
    pub config: BenchmarkConfig,
    /// Bytes held in memory or on disk once all payloads are prepared.
    pub projected_volume: ByteSize,
    /// Whether the projected volume exceeds the confirmation threshold.
    pub requires_confirmation: bool,
}

impl BenchmarkParams {
    /// Resolves the parameters using the logical core count of this host.
    pub fn resolve(self) -> Result<Resolution, ConfigError> {
        let cores = available_parallelism().map(|n| n.get()).unwrap_or(1);
        self.resolve_with_cores(cores)
    }

    /// Resolves the parameters assuming the given number of logical cores.
    pub fn resolve_with_cores(self, cores: usize) -> Result<Resolution, ConfigError> {
        if self.block_size_kib == 0 {
            return Err(ConfigError::ZeroBlockSize);
        }
        let block_size = self
            .block_size_kib
            .checked_mul(1024)
            .filter(|bytes| usize::try_from(*bytes).is_ok())
            .ok_or(ConfigError::BlockSizeTooLarge(self.block_size_kib))?;

        let workers = self
            .workers
            .unwrap_or_else(|| default_workers(self.block_size_kib, cores));
        let files = self.files.unwrap_or_else(|| default_files(block_size));

        if files == 0 {
            return Err(ConfigError::ZeroFiles);
        }
        if workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if workers > files {
            return Err(ConfigError::TooManyWorkers { workers, files });
        }
        if self.remainder == RemainderPolicy::Reject && files % workers != 0 {
            return Err(ConfigError::Indivisible { workers, files });
        }
        if self.source == PayloadSource::Filesystem && self.working_dir.as_os_str().is_empty() {
            return Err(ConfigError::MissingWorkingDirectory);
        }

        let volume = u64::try_from(files)
            .ok()
            .and_then(|files| block_size.checked_mul(files))
            .ok_or(ConfigError::VolumeTooLarge { block_size, files })?;
        let projected_volume = ByteSize::b(volume);
        let requires_confirmation = projected_volume >= self.confirm_threshold;
        if requires_confirmation {
            tracing::warn!(
                %projected_volume,
                source = ?self.source,
                "benchmark will hold a large payload volume"
            );
        }

        let config = BenchmarkConfig {
            block_size,
            files,
            workers,
            source: self.source,
            working_dir: self.working_dir,
            remainder: self.remainder,
            tuning: self.tuning,
        };

        Ok(Resolution {
            config,
            projected_volume,
            requires_confirmation,
        })
    }
}

fn default_workers(block_size_kib: u64, cores: usize) -> usize {
    let by_block_size = (WORKER_BUDGET * REFERENCE_BLOCK_KIB / block_size_kib as f64) as usize;
    by_block_size.min(cores * WORKERS_PER_CORE).max(1)
}

fn default_files(block_size: u64) -> usize {
    TARGET_VOLUME.div_ceil(block_size) as usize
}

/// The immutable configuration of a single benchmark run.
#[derive(Clone, Debug)]
pub struct BenchmarkConfig {
    /// Size of every payload in bytes.
    pub block_size: u64,
    /// Total number of files uploaded by the run.
    pub files: usize,
    /// Number of concurrent workers.
    pub workers: usize,
    /// Where payloads are kept before uploading.
    pub source: PayloadSource,
    /// Scratch directory for file-backed payloads and the start marker.
    pub working_dir: PathBuf,
    /// Handling of files that do not divide evenly across workers.
    pub remainder: RemainderPolicy,
    /// Remaining knobs of the run.
    pub tuning: Tuning,
}

impl BenchmarkConfig {
    /// Returns the number of files assigned to every worker, indexed by worker.
    pub fn shares(&self) -> Vec<usize> {
        let base = self.files / self.workers;
        let remainder = self.files % self.workers;
        (0..self.workers)
            .map(|worker| if worker < remainder { base + 1 } else { base })
            .collect()
    }

    /// Total number of payload bytes uploaded by the run.
    ///
    /// Saturates for configs that were not produced by [`BenchmarkParams::resolve`].
    pub fn total_bytes(&self) -> u64 {
        self.block_size.saturating_mul(self.files as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(block_size_kib: u64) -> BenchmarkParams {
        BenchmarkParams {
            block_size_kib,
            ..Default::default()
        }
    }

    #[test]
    fn defaults_for_reference_block_size() {
        let resolution = params(2048).resolve_with_cores(4).unwrap();
        let config = resolution.config;

        assert_eq!(config.block_size, 2 * 1024 * 1024);
        assert_eq!(config.workers, 12);
        assert_eq!(config.files, 512);
        assert_eq!(config.total_bytes(), TARGET_VOLUME);
        assert!(!resolution.requires_confirmation);
    }

    #[test]
    fn workers_capped_by_cores() {
        let config = params(256).resolve_with_cores(4).unwrap().config;
        assert_eq!(config.workers, 24);

        let config = params(256).resolve_with_cores(32).unwrap().config;
        assert_eq!(config.workers, 96);
    }

    #[test]
    fn huge_blocks_keep_one_worker() {
        let config = params(64 * 1024).resolve_with_cores(8).unwrap().config;
        assert_eq!(config.workers, 1);
        assert_eq!(config.files, 16);
    }

    #[test]
    fn resolved_counts_are_sane() {
        for cores in [1, 2, 7, 64] {
            for shift in 0..22 {
                let resolution = params(1 << shift).resolve_with_cores(cores).unwrap();
                let config = resolution.config;
                assert!(config.workers >= 1, "block {} KiB", 1 << shift);
                assert!(config.files >= config.workers, "block {} KiB", 1 << shift);
                assert_eq!(config.shares().iter().sum::<usize>(), config.files);
            }
        }
    }

    #[test]
    fn too_many_workers() {
        let params = BenchmarkParams {
            files: Some(4),
            workers: Some(8),
            ..params(2048)
        };
        let err = params.resolve_with_cores(4).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::TooManyWorkers {
                workers: 8,
                files: 4
            }
        ));
    }

    #[test]
    fn zero_counts_fail() {
        let zero_files = BenchmarkParams {
            files: Some(0),
            ..params(2048)
        };
        assert!(matches!(
            zero_files.resolve_with_cores(4),
            Err(ConfigError::ZeroFiles)
        ));

        let zero_workers = BenchmarkParams {
            workers: Some(0),
            ..params(2048)
        };
        assert!(matches!(
            zero_workers.resolve_with_cores(4),
            Err(ConfigError::ZeroWorkers)
        ));

        assert!(matches!(
            params(0).resolve_with_cores(4),
            Err(ConfigError::ZeroBlockSize)
        ));
    }

    #[test]
    fn remainder_is_distributed() {
        let params = BenchmarkParams {
            files: Some(10),
            workers: Some(4),
            ..params(2048)
        };
        let config = params.resolve_with_cores(4).unwrap().config;
        assert_eq!(config.shares(), vec![3, 3, 2, 2]);
    }

    #[test]
    fn remainder_is_rejected() {
        let params = BenchmarkParams {
            files: Some(10),
            workers: Some(4),
            remainder: RemainderPolicy::Reject,
            ..params(2048)
        };
        assert!(matches!(
            params.resolve_with_cores(4),
            Err(ConfigError::Indivisible {
                workers: 4,
                files: 10
            })
        ));
    }

    #[test]
    fn large_runs_require_confirmation() {
        let params = BenchmarkParams {
            files: Some(1024),
            ..params(2048)
        };
        let resolution = params.resolve_with_cores(4).unwrap();
        assert_eq!(resolution.projected_volume, ByteSize::gib(2));
        assert!(resolution.requires_confirmation);
    }

    #[test]
    fn oversized_blocks_are_rejected() {
        let kib = u64::MAX / 1024 + 1;
        assert!(matches!(
            params(kib).resolve_with_cores(4),
            Err(ConfigError::BlockSizeTooLarge(size)) if size == kib
        ));
    }

    #[test]
    fn oversized_volume_is_rejected() {
        let params = BenchmarkParams {
            files: Some(usize::MAX),
            workers: Some(1),
            ..params(2048)
        };
        assert!(matches!(
            params.resolve_with_cores(4),
            Err(ConfigError::VolumeTooLarge { files: usize::MAX, .. })
        ));
    }

    #[test]
    fn filesystem_needs_working_dir() {
        let params = BenchmarkParams {
            source: PayloadSource::Filesystem,
            working_dir: PathBuf::new(),
            ..params(2048)
        };
        assert!(matches!(
            params.resolve_with_cores(4),
            Err(ConfigError::MissingWorkingDirectory)
        ));
    }
}
