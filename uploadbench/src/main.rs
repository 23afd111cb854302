//! Measures the parallel upload throughput of an object storage target.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

use std::process::ExitCode;

fn main() -> ExitCode {
    uploadbench::cli::execute()
}
