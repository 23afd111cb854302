//! Aggregation of upload timings and network samples into a [`BenchmarkReport`].
//!
//! Megabytes are binary: 1 MB = 2^20 bytes, and 1 MB/s = 8 Mbps.
//!
//! Two averages are computed for every run:
//!
//! - **wall clock**: successfully uploaded bytes divided by the time from barrier release until
//!   the last worker finished.
//! - **worker time**: successfully uploaded bytes divided by `sum(elapsed) / workers`. This treats
//!   the summed upload time of all workers as if their sequential uploads overlapped evenly.
//!
//! Failed uploads contribute neither bytes nor time. A report with any failed upload is not
//! comparable to other runs.

use std::fmt;
use std::time::{Duration, Instant};

use bytesize::ByteSize;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use sketches_ddsketch::DDSketch;

use crate::config::{AveragingMode, BenchmarkConfig, PayloadSource};
use crate::sampler::ThroughputSample;
use crate::worker::{WorkerId, WorkerReport};

const MEGABYTE: f64 = 1024.0 * 1024.0;

/// Result of a single upload call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UploadOutcome {
    /// The store accepted the object.
    Success,
    /// The upload failed after all attempts, with the last error message.
    Failed(String),
}

/// Timing of a single upload, emitted by a worker once the call returned.
#[derive(Clone, Debug)]
pub struct UploadSample {
    /// The worker that issued the upload.
    pub worker_id: WorkerId,
    /// Wall time of the upload call, including retries.
    pub elapsed: Duration,
    /// Whether the upload succeeded.
    pub outcome: UploadOutcome,
}

impl UploadSample {
    /// Returns `true` if the upload succeeded.
    pub fn is_success(&self) -> bool {
        self.outcome == UploadOutcome::Success
    }
}

/// A data rate, stored in bytes per second.
#[derive(Clone, Copy, Debug, Default, PartialEq, PartialOrd)]
pub struct Throughput {
    bytes_per_second: f64,
}

impl Throughput {
    /// Computes the rate of transferring `bytes` within `duration`.
    ///
    /// A zero duration yields a zero rate.
    pub fn new(bytes: u64, duration: Duration) -> Self {
        Self::from_seconds(bytes, duration.as_secs_f64())
    }

    /// Creates a rate from bits per second.
    pub fn from_bits_per_second(bits_per_second: f64) -> Self {
        Self {
            bytes_per_second: bits_per_second / 8.0,
        }
    }

    fn from_seconds(bytes: u64, seconds: f64) -> Self {
        if seconds <= 0.0 {
            return Self::default();
        }
        Self {
            bytes_per_second: bytes as f64 / seconds,
        }
    }

    /// The rate in MB/s.
    pub fn megabytes_per_second(self) -> f64 {
        self.bytes_per_second / MEGABYTE
    }

    /// The rate in Mbps.
    pub fn megabits_per_second(self) -> f64 {
        self.megabytes_per_second() * 8.0
    }
}

impl fmt::Display for Throughput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.2} MB/s ({:.2} Mbps)",
            self.megabytes_per_second(),
            self.megabits_per_second()
        )
    }
}

impl Serialize for Throughput {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Throughput", 2)?;
        state.serialize_field("megabytes_per_second", &self.megabytes_per_second())?;
        state.serialize_field("megabits_per_second", &self.megabits_per_second())?;
        state.end()
    }
}

/// Latency distribution of successful uploads.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct LatencySummary {
    /// Mean upload time.
    #[serde(with = "humantime_serde")]
    pub avg: Duration,
    /// Median upload time.
    #[serde(with = "humantime_serde")]
    pub p50: Duration,
    /// 90th percentile upload time.
    #[serde(with = "humantime_serde")]
    pub p90: Duration,
    /// 99th percentile upload time.
    #[serde(with = "humantime_serde")]
    pub p99: Duration,
}

/// The final result of a completed run.
#[derive(Clone, Debug, Serialize)]
pub struct BenchmarkReport {
    /// Size of every payload.
    pub block_size: ByteSize,
    /// Number of files the run was configured with.
    pub files: usize,
    /// Number of concurrent workers.
    pub workers: usize,
    /// Where payloads were kept before uploading.
    pub source: PayloadSource,
    /// Number of uploads that succeeded.
    pub uploads_succeeded: usize,
    /// Number of uploads that failed after all attempts.
    pub uploads_failed: usize,
    /// Which average is the headline figure.
    pub averaging: AveragingMode,
    /// Time from barrier release until the last worker finished.
    #[serde(with = "humantime_serde")]
    pub wall_clock: Duration,
    /// Average throughput over [`wall_clock`](Self::wall_clock).
    pub average_wall_clock: Throughput,
    /// Average throughput over summed upload time divided by the worker count.
    pub average_worker_time: Throughput,
    /// Highest throughput observed by the network sampler.
    pub peak: Throughput,
    /// Mean throughput observed by the network sampler.
    pub sampled_average: Throughput,
    /// Latency of successful uploads, if there were any.
    pub latency: Option<LatencySummary>,
    /// All network samples in the order they were taken.
    pub samples: Vec<ThroughputSample>,
}

impl BenchmarkReport {
    /// The headline average throughput, selected by [`averaging`](Self::averaging).
    pub fn average(&self) -> Throughput {
        match self.averaging {
            AveragingMode::WallClock => self.average_wall_clock,
            AveragingMode::WorkerTime => self.average_worker_time,
        }
    }

    /// Returns `true` if every upload succeeded, so the result can be compared to other runs.
    pub fn is_comparable(&self) -> bool {
        self.uploads_failed == 0
    }
}

/// Collects worker results and network samples of a run.
pub struct ResultAggregator {
    block_size: u64,
    files: usize,
    workers: usize,
    source: PayloadSource,
    averaging: AveragingMode,

    succeeded: usize,
    failed: usize,
    upload_time: Duration,
    latency: DDSketch,
    last_finish: Option<Instant>,
    samples: Vec<ThroughputSample>,
}

impl fmt::Debug for ResultAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultAggregator")
            .field("succeeded", &self.succeeded)
            .field("failed", &self.failed)
            .field("upload_time", &self.upload_time)
            .field("samples", &self.samples.len())
            .finish_non_exhaustive()
    }
}

impl ResultAggregator {
    /// Creates an empty aggregator for a run with the given config.
    pub fn new(config: &BenchmarkConfig) -> Self {
        Self {
            block_size: config.block_size,
            files: config.files,
            workers: config.workers,
            source: config.source,
            averaging: config.tuning.averaging,

            succeeded: 0,
            failed: 0,
            upload_time: Duration::ZERO,
            latency: DDSketch::default(),
            last_finish: None,
            samples: Vec::new(),
        }
    }

    /// Adds the timing of a single upload.
    pub fn add_upload(&mut self, sample: &UploadSample) {
        if sample.is_success() {
            self.succeeded += 1;
            self.upload_time += sample.elapsed;
            self.latency.add(sample.elapsed.as_secs_f64());
        } else {
            self.failed += 1;
        }
    }

    /// Adds all uploads of a worker and the time it finished.
    pub fn add_worker(&mut self, report: &WorkerReport) {
        for sample in &report.samples {
            self.add_upload(sample);
        }
        if let Some(finished_at) = report.finished_at {
            self.last_finish = Some(match self.last_finish {
                Some(last) => last.max(finished_at),
                None => finished_at,
            });
        }
    }

    /// Adds a network throughput sample.
    pub fn add_throughput(&mut self, sample: ThroughputSample) {
        self.samples.push(sample);
    }

    /// Computes the report of a run whose barrier was released at `released_at`.
    pub fn finish(self, released_at: Instant) -> BenchmarkReport {
        let bytes = self.block_size * self.succeeded as u64;

        let wall_clock = self
            .last_finish
            .map(|last| last.saturating_duration_since(released_at))
            .unwrap_or_default();
        let average_wall_clock = Throughput::new(bytes, wall_clock);

        let worker_seconds = self.upload_time.as_secs_f64() / self.workers.max(1) as f64;
        let average_worker_time = Throughput::from_seconds(bytes, worker_seconds);

        let peak = self
            .samples
            .iter()
            .map(|sample| Throughput::from_bits_per_second(sample.bits_per_second()))
            .fold(Throughput::default(), |max, rate| {
                if rate > max { rate } else { max }
            });

        let sampled_bytes = self.samples.iter().map(|s| s.bytes_sent).sum();
        let sampled_time = self.samples.iter().map(|s| s.interval).sum();
        let sampled_average = Throughput::new(sampled_bytes, sampled_time);

        let latency = summarize(&self.latency);

        BenchmarkReport {
            block_size: ByteSize::b(self.block_size),
            files: self.files,
            workers: self.workers,
            source: self.source,
            uploads_succeeded: self.succeeded,
            uploads_failed: self.failed,
            averaging: self.averaging,
            wall_clock,
            average_wall_clock,
            average_worker_time,
            peak,
            sampled_average,
            latency,
            samples: self.samples,
        }
    }
}

fn summarize(sketch: &DDSketch) -> Option<LatencySummary> {
    let count = sketch.count();
    if count == 0 {
        return None;
    }

    let quantile = |q| {
        let seconds = sketch.quantile(q).ok().flatten().unwrap_or_default();
        Duration::from_secs_f64(seconds.max(0.0))
    };

    Some(LatencySummary {
        avg: Duration::from_secs_f64(sketch.sum().unwrap_or_default() / count as f64),
        p50: quantile(0.5),
        p90: quantile(0.9),
        p99: quantile(0.99),
    })
}
