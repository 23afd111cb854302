//! Error types of the benchmark engine.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::worker::WorkerId;

/// Errors raised while resolving raw parameters into a [`BenchmarkConfig`](crate::BenchmarkConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The block size resolved to zero bytes.
    #[error("block size must be positive")]
    ZeroBlockSize,

    /// The block size in bytes does not fit into memory addresses of this host.
    #[error("block size of {0} KiB is too large")]
    BlockSizeTooLarge(u64),

    /// The total payload volume of the run does not fit into 64 bits.
    #[error("{files} files of {block_size} bytes exceed the addressable payload volume")]
    VolumeTooLarge {
        /// The resolved block size in bytes.
        block_size: u64,
        /// The resolved file count.
        files: usize,
    },

    /// The number of files resolved to zero.
    #[error("number of files must be positive")]
    ZeroFiles,

    /// The number of workers resolved to zero.
    #[error("number of workers must be positive")]
    ZeroWorkers,

    /// More workers than files were requested, leaving some workers without work.
    #[error("{workers} workers exceed the {files} files to upload")]
    TooManyWorkers {
        /// The resolved worker count.
        workers: usize,
        /// The resolved file count.
        files: usize,
    },

    /// The file count is not divisible by the worker count and remainders are rejected.
    #[error("{files} files cannot be divided evenly across {workers} workers")]
    Indivisible {
        /// The resolved worker count.
        workers: usize,
        /// The resolved file count.
        files: usize,
    },

    /// Payloads are file-backed but no working directory was given.
    #[error("a working directory is required to upload from the filesystem")]
    MissingWorkingDirectory,
}

/// Errors returned by storage collaborators.
#[derive(Debug, Error)]
pub enum StoreError {
    /// IO errors related to payload files or a filesystem target.
    #[error("i/o error")]
    Io(#[from] io::Error),

    /// The target requires credentials that were not provided or have been revoked.
    #[error("missing credentials for {0}")]
    MissingCredentials(&'static str),

    /// A request to the remote store failed.
    ///
    /// These can be network errors encountered when sending the request, but can also indicate
    /// errors returned by the service itself.
    #[error("{context}")]
    Request {
        /// What the store was doing when the request failed.
        context: String,
        /// The underlying client error.
        #[source]
        cause: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A failure injected by the in-memory store.
    #[error("simulated failure for `{0}`")]
    Simulated(String),
}

impl StoreError {
    /// Wraps a client error together with a description of the failed request.
    pub fn request<E>(context: impl Into<String>, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Request {
            context: context.into(),
            cause: Box::new(cause),
        }
    }
}

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Renders an error followed by all of its sources, separated by `: `.
pub fn display_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

/// Errors that move a worker from `Preparing` straight to `Failed`.
#[derive(Debug, Error)]
pub enum PreparationError {
    /// The worker could not build its own async runtime.
    #[error("failed to build worker runtime")]
    Runtime(#[source] io::Error),

    /// The worker could not open a connection to the storage target.
    #[error("failed to connect to storage")]
    Connect(#[source] StoreError),

    /// The scratch directory could not be created.
    #[error("failed to create scratch directory {path}")]
    Scratch {
        /// The scratch directory of the worker.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        cause: io::Error,
    },

    /// A payload could not be written to disk.
    #[error("failed to write payload {path}")]
    Write {
        /// The payload file that could not be written.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        cause: io::Error,
    },
}

/// Structural errors that abort a benchmark run without a report.
#[derive(Debug, Error)]
pub enum RunError {
    /// A worker reported a failure while preparing its payloads.
    #[error("worker {worker_id} failed to prepare: {message}")]
    WorkerPreparation {
        /// The failed worker.
        worker_id: WorkerId,
        /// The diagnostic reported by the worker.
        message: String,
    },

    /// A worker thread terminated before reporting readiness.
    #[error("worker {worker_id} terminated before becoming ready")]
    WorkerLost {
        /// The lost worker.
        worker_id: WorkerId,
    },

    /// Not all workers became ready in time.
    #[error("workers did not become ready within {0:?}")]
    ReadinessTimeout(Duration),

    /// A worker thread could not be spawned.
    #[error("failed to spawn worker {worker_id}")]
    Spawn {
        /// The worker that could not be spawned.
        worker_id: WorkerId,
        /// The underlying IO error.
        #[source]
        cause: io::Error,
    },

    /// The start marker could not be written when releasing the barrier.
    #[error("failed to publish start marker {path}")]
    StartMarker {
        /// Location of the start marker.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        cause: io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_names_every_cause_once() {
        let error = PreparationError::Connect(StoreError::request(
            "failed to open payload file",
            io::Error::new(io::ErrorKind::NotFound, "no such file"),
        ));

        assert_eq!(
            display_chain(&error),
            "failed to connect to storage: failed to open payload file: no such file"
        );
    }
}
