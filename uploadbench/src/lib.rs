//! Command line frontend of the upload benchmark.
//!
//! This wraps [`uploadbench_engine`] with configuration loading, storage setup, observability and
//! report rendering.

pub mod cli;
pub mod config;
pub mod error;
pub mod observability;
pub mod preflight;
pub mod report;
pub mod setup;
