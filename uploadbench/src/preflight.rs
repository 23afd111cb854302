//! Environment checks performed before any payload is generated.

use std::io;
use std::path::{Path, PathBuf};

use uploadbench_engine::sampler::InterfaceCounter;

use crate::config::{Benchmark, Storage};
use crate::error::SetupError;

/// Verifies that the storage target can be used by the benchmark.
///
/// S3 targets need both access key and secret key. A filesystem target must not live inside the
/// working directory.
pub fn check_storage(storage: &Storage, benchmark: &Benchmark) -> Result<(), SetupError> {
    match storage {
        Storage::S3(s3) => {
            if !s3.has_credentials() {
                return Err(SetupError::MissingDependency(
                    "S3 credentials, set `storage.access_key` and `storage.secret_key`".into(),
                ));
            }
        }
        Storage::FileSystem { path } => {
            let target = absolute(path);
            let working_dir = absolute(&benchmark.working_dir);
            if target.starts_with(&working_dir) {
                return Err(SetupError::Incompatible(format!(
                    "filesystem target {} is inside the working directory {}",
                    target.display(),
                    working_dir.display()
                )));
            }
        }
    }

    Ok(())
}

/// Opens the network counter used by the throughput sampler.
pub fn network_counter(benchmark: &Benchmark) -> Result<InterfaceCounter, SetupError> {
    let counter = InterfaceCounter::new(benchmark.network_interface.clone()).map_err(|error| {
        match error.kind() {
            io::ErrorKind::Unsupported => SetupError::Incompatible(error.to_string()),
            _ => SetupError::MissingDependency(error.to_string()),
        }
    })?;

    tracing::debug!(
        interface = ?benchmark.network_interface,
        available = ?counter.interfaces(),
        "sampling network interfaces"
    );
    Ok(counter)
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_owned())
}
