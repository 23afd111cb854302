//! Errors of the command line surface and their exit codes.

use std::process::ExitCode;

use thiserror::Error;
use uploadbench_engine::error::StoreError;
use uploadbench_engine::{ConfigError, RunError};

/// Errors raised while checking the environment or preparing the storage target.
#[derive(Debug, Error)]
pub enum SetupError {
    /// The bucket could not be listed or created.
    #[error("failed to prepare bucket `{bucket}`")]
    Bucket {
        /// The bucket, or target directory, that was checked.
        bucket: String,
        /// The underlying storage error.
        #[source]
        cause: StoreError,
    },

    /// Something the benchmark needs is not available.
    #[error("missing dependency: {0}")]
    MissingDependency(String),

    /// Something in the environment would distort or break the benchmark.
    #[error("incompatible environment: {0}")]
    Incompatible(String),
}

/// Top-level error of a command.
#[derive(Debug, Error)]
pub enum CliError {
    /// The benchmark parameters are invalid.
    #[error("invalid configuration")]
    Config(#[from] ConfigError),

    /// The operator declined to start a large run.
    #[error("benchmark declined")]
    Declined,

    /// Setup or preflight checks failed.
    #[error(transparent)]
    Setup(#[from] SetupError),

    /// A worker failed or terminated before the barrier was released.
    #[error(transparent)]
    Preparation(RunError),

    /// The run failed for another structural reason.
    #[error("benchmark failed")]
    Run(#[source] RunError),

    /// Any other failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<RunError> for CliError {
    fn from(error: RunError) -> Self {
        match error {
            error @ (RunError::WorkerPreparation { .. } | RunError::WorkerLost { .. }) => {
                Self::Preparation(error)
            }
            error => Self::Run(error),
        }
    }
}

impl CliError {
    /// The process exit code for this error.
    ///
    /// | code | meaning                         |
    /// |------|---------------------------------|
    /// | 1    | generic failure                 |
    /// | 2    | bucket check or creation failed |
    /// | 3    | required dependency missing     |
    /// | 4    | incompatible environment        |
    /// | 5    | worker preparation failed       |
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Setup(SetupError::Bucket { .. }) => 2,
            Self::Setup(SetupError::MissingDependency(_)) => 3,
            Self::Setup(SetupError::Incompatible(_)) => 4,
            Self::Preparation(_) => 5,
            Self::Config(_) | Self::Declined | Self::Run(_) | Self::Other(_) => 1,
        }
    }
}

impl From<&CliError> for ExitCode {
    fn from(error: &CliError) -> Self {
        ExitCode::from(error.exit_code())
    }
}
