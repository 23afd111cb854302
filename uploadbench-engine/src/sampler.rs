//! Sampling of network throughput while uploads are running.
//!
//! The sampler reads a cumulative bytes-sent counter at a fixed interval and records the delta
//! between consecutive readings. This measures what actually leaves the host, independent of the
//! per-upload timings recorded by workers.

use std::fmt;
use std::io;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use sysinfo::Networks;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// A read-only source of cumulative transmitted bytes.
pub trait NetworkCounter: fmt::Debug + Send + 'static {
    /// Returns the total number of bytes sent so far.
    ///
    /// The value must be monotonic for the duration of a run. Its origin is arbitrary.
    fn bytes_sent(&mut self) -> io::Result<u64>;
}

/// Reads transmitted bytes of network interfaces through the operating system.
pub struct InterfaceCounter {
    networks: Networks,
    interface: Option<String>,
}

impl InterfaceCounter {
    /// Creates a counter for the named interface, or for all non-loopback interfaces.
    ///
    /// Fails if the platform does not expose network counters or the interface does not exist.
    pub fn new(interface: Option<String>) -> io::Result<Self> {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "network counters are not available on this platform",
            ));
        }

        let networks = Networks::new_with_refreshed_list();
        if let Some(name) = &interface {
            if !networks.list().contains_key(name) {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("network interface `{name}` does not exist"),
                ));
            }
        }

        Ok(Self {
            networks,
            interface,
        })
    }

    /// Names of the interfaces visible to this counter.
    pub fn interfaces(&self) -> Vec<String> {
        let mut names: Vec<_> = self.networks.list().keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for InterfaceCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterfaceCounter")
            .field("interface", &self.interface)
            .finish_non_exhaustive()
    }
}

impl NetworkCounter for InterfaceCounter {
    fn bytes_sent(&mut self) -> io::Result<u64> {
        self.networks.refresh(true);
        let list = self.networks.list();

        match &self.interface {
            Some(name) => list
                .get(name)
                .map(|data| data.total_transmitted())
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("network interface `{name}` disappeared"),
                    )
                }),
            None => Ok(list
                .iter()
                .filter(|(name, _)| !is_loopback(name))
                .map(|(_, data)| data.total_transmitted())
                .sum()),
        }
    }
}

fn is_loopback(name: &str) -> bool {
    name == "lo" || name.starts_with("lo0") || name.eq_ignore_ascii_case("loopback")
}

/// One interval measurement of transmitted bytes.
#[derive(Clone, Debug, Serialize)]
pub struct ThroughputSample {
    /// When the interval ended.
    #[serde(with = "humantime_serde")]
    pub timestamp: SystemTime,
    /// The measured length of the interval.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Bytes sent within the interval.
    pub bytes_sent: u64,
}

impl ThroughputSample {
    /// The rate of the interval in bits per second.
    pub fn bits_per_second(&self) -> f64 {
        let seconds = self.interval.as_secs_f64();
        if seconds <= 0.0 {
            return 0.0;
        }
        self.bytes_sent as f64 * 8.0 / seconds
    }
}

/// Periodically samples a [`NetworkCounter`] until cancelled.
#[derive(Debug)]
pub struct ThroughputSampler {
    counter: Box<dyn NetworkCounter>,
    interval: Duration,
}

impl ThroughputSampler {
    /// Creates a sampler reading `counter` every `interval`.
    pub fn new(counter: Box<dyn NetworkCounter>, interval: Duration) -> Self {
        Self { counter, interval }
    }

    /// Samples until `cancel` fires and returns all samples in order.
    ///
    /// A partial interval at cancellation is discarded. Failed counter reads are logged and
    /// the affected interval is skipped.
    pub async fn run(mut self, cancel: CancellationToken) -> Vec<ThroughputSample> {
        let mut samples = Vec::new();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut previous = self.read().map(|bytes| (Instant::now(), bytes));

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => (),
            }

            let now = Instant::now();
            let current = self.read();
            if let (Some((before_at, before)), Some(after)) = (previous, current) {
                let sample = ThroughputSample {
                    timestamp: SystemTime::now(),
                    interval: now.duration_since(before_at),
                    bytes_sent: after.saturating_sub(before),
                };
                tracing::debug!(
                    bytes_sent = sample.bytes_sent,
                    mbps = sample.bits_per_second() / 1_000_000.0,
                    "network sample"
                );
                samples.push(sample);
            }
            previous = current.map(|bytes| (now, bytes));
        }

        samples
    }

    fn read(&mut self) -> Option<u64> {
        match self.counter.bytes_sent() {
            Ok(bytes) => Some(bytes),
            Err(error) => {
                tracing::warn!(
                    error = &error as &dyn std::error::Error,
                    "failed to read network counter"
                );
                None
            }
        }
    }
}
