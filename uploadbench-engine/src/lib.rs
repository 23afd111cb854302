//! The benchmark engine drives many concurrent uploads against a single object storage target
//! and reports the throughput the host is able to sustain.
//!
//! A run starts from a resolved [`BenchmarkConfig`]. The [`pool`] launches one
//! [`worker`] per share of files; every worker prepares its payloads, reports readiness and
//! waits on the [`barrier`]. Once all workers are ready the barrier is released, workers upload
//! their payloads sequentially while the [`sampler`] records the bytes leaving the network
//! interface, and the [`aggregate`] module turns both streams into a [`BenchmarkReport`].
//! The [`cleanup`] manager runs after every outcome.
//!
//! Storage targets are abstracted behind [`store::ObjectStore`], with implementations for
//! S3-compatible services, the local filesystem, and an in-memory store for tests.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod aggregate;
pub mod barrier;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod payload;
pub mod pool;
pub mod sampler;
pub mod state;
pub mod store;
pub mod worker;

mod run;

pub use crate::aggregate::{BenchmarkReport, Throughput};
pub use crate::config::{BenchmarkConfig, BenchmarkParams, Resolution};
pub use crate::error::{ConfigError, RunError};
pub use crate::run::{RunOutcome, run};
