//! Configuration for the upload benchmark.
//!
//! Configuration is layered from the following sources, with later sources taking precedence:
//!
//! 1. Defaults
//! 2. YAML configuration file (specified via `-c` or `--config` flag)
//! 3. Environment variables (prefixed with `UB__`)
//! 4. Command line flags of the `setup` and `run` commands
//!
//! # Environment Variables
//!
//! Environment variables use `UB__` as a prefix and double underscores (`__`) to denote nested
//! configuration structures. For example:
//!
//! - `UB__STORAGE__TYPE=s3` selects an S3-compatible target
//! - `UB__STORAGE__BUCKET=bench` sets the target bucket
//! - `UB__BENCHMARK__BLOCK_SIZE_KB=512` sets the block size
//!
//! # YAML Configuration File
//!
//! ```yaml
//! storage:
//!   type: s3
//!   region: eu-central-1
//!   endpoint: http://localhost:9000
//!   bucket: bench
//!   path_style: true
//!
//! benchmark:
//!   block_size_kb: 512
//!   working_dir: /var/tmp/uploadbench
//! ```

use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use bytesize::ByteSize;
use figment::providers::{Env, Format, Serialized, Yaml};
use secrecy::{CloneableSecret, ExposeSecret, SecretBox, SecretString, SerializableSecret};
use secrecy::zeroize::Zeroize;
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use uploadbench_engine::BenchmarkParams;
use uploadbench_engine::config::{
    AveragingMode, DEFAULT_BLOCK_SIZE_KIB, DEFAULT_CONFIRM_THRESHOLD, PayloadSource,
    RemainderPolicy, Tuning,
};
use uploadbench_engine::store::S3Config;

/// Environment variable prefix for all configuration options.
const ENV_PREFIX: &str = "UB__";

/// Newtype around `String` that protects against accidental logging of secrets in the
/// configuration. Use with [`secrecy::SecretBox`].
#[derive(Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigSecret(String);

impl ConfigSecret {
    /// Returns the secret as string slice.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for ConfigSecret {
    fn from(str: &str) -> Self {
        ConfigSecret(str.to_string())
    }
}

impl fmt::Debug for ConfigSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[redacted]")
    }
}

impl CloneableSecret for ConfigSecret {}
impl SerializableSecret for ConfigSecret {}
impl Zeroize for ConfigSecret {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}

fn expose(secret: &Option<SecretBox<ConfigSecret>>) -> Option<SecretString> {
    secret
        .as_ref()
        .map(|secret| SecretString::from(secret.expose_secret().as_str().to_owned()))
}

/// Connection parameters of an S3-compatible target.
#[derive(Debug, Deserialize, Serialize)]
pub struct S3Storage {
    /// Region of the bucket.
    ///
    /// # Environment Variable
    ///
    /// `UB__STORAGE__REGION`
    pub region: String,

    /// Custom endpoint URL, for example `http://localhost:9000` for MinIO.
    ///
    /// Uses the AWS endpoint of the region when unset.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Name of the target bucket.
    ///
    /// # Environment Variable
    ///
    /// `UB__STORAGE__BUCKET`
    pub bucket: String,

    /// Access key ID.
    ///
    /// # Environment Variable
    ///
    /// `UB__STORAGE__ACCESS_KEY`
    #[serde(default)]
    pub access_key: Option<SecretBox<ConfigSecret>>,

    /// Secret access key.
    ///
    /// # Environment Variable
    ///
    /// `UB__STORAGE__SECRET_KEY`
    #[serde(default)]
    pub secret_key: Option<SecretBox<ConfigSecret>>,

    /// Address buckets as path component instead of subdomain. Required by most self-hosted
    /// services.
    #[serde(default)]
    pub path_style: bool,
}

impl S3Storage {
    /// Builds the connector config of the engine.
    pub fn to_config(&self) -> S3Config {
        S3Config {
            region: self.region.clone(),
            endpoint: self.endpoint.clone(),
            bucket: self.bucket.clone(),
            access_key: expose(&self.access_key),
            secret_key: expose(&self.secret_key),
            path_style: self.path_style,
        }
    }

    /// Returns `true` if both access key and secret key are set.
    pub fn has_credentials(&self) -> bool {
        self.access_key.is_some() && self.secret_key.is_some()
    }
}

/// The storage target of the benchmark.
///
/// The `type` field in YAML or `__TYPE` in environment variables determines which variant is used.
#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Storage {
    /// S3-compatible object storage (type `"s3"`).
    ///
    /// ```yaml
    /// storage:
    ///   type: s3
    ///   region: us-east-1
    ///   bucket: bench
    ///   access_key: AKIA...
    ///   secret_key: ...
    /// ```
    S3(S3Storage),

    /// Local filesystem target (type `"filesystem"`).
    ///
    /// Benchmarks the local disk path without involving the network.
    ///
    /// ```yaml
    /// storage:
    ///   type: filesystem
    ///   path: /mnt/target
    /// ```
    FileSystem {
        /// Directory receiving all uploaded objects.
        path: PathBuf,
    },
}

impl Default for Storage {
    fn default() -> Self {
        Storage::S3(S3Storage {
            region: "us-east-1".into(),
            endpoint: None,
            bucket: "uploadbench".into(),
            access_key: None,
            secret_key: None,
            path_style: false,
        })
    }
}

/// Parameters of a benchmark run.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Benchmark {
    /// Size of every payload in KiB.
    ///
    /// # Default
    ///
    /// `2048`
    pub block_size_kb: u64,

    /// Number of files to upload. Derived to upload roughly 1 GiB when unset.
    pub files: Option<usize>,

    /// Number of concurrent workers. Derived from block size and core count when unset.
    pub workers: Option<usize>,

    /// Write payloads to the working directory and upload from there instead of from memory.
    pub filesystem: bool,

    /// Scratch directory for file-backed payloads and the start marker.
    ///
    /// # Default
    ///
    /// `/tmp/uploadbench`
    pub working_dir: PathBuf,

    /// Prefix of every uploaded object key.
    pub key_prefix: String,

    /// Projected payload volume from which the run must be confirmed.
    ///
    /// # Default
    ///
    /// `2 GiB`
    pub confirm_threshold: ByteSize,

    /// Handling of file counts that do not divide evenly across workers.
    pub remainder: RemainderPolicy,

    /// Which average is reported as the headline throughput.
    pub averaging: AveragingMode,

    /// Additional attempts for a failed upload.
    pub upload_retries: u32,

    /// Nice value the worker threads try to apply to themselves. Negative values usually require
    /// elevated privileges; failing to apply it is not an error.
    pub worker_nice: i32,

    /// Interval at which worker status is polled.
    #[serde(with = "humantime_serde")]
    pub status_interval: Duration,

    /// Interval of network throughput samples.
    #[serde(with = "humantime_serde")]
    pub sample_interval: Duration,

    /// Time to wait for all workers to finish preparing.
    #[serde(with = "humantime_serde")]
    pub readiness_timeout: Duration,

    /// Network interface to sample. All non-loopback interfaces are summed when unset.
    pub network_interface: Option<String>,
}

impl Default for Benchmark {
    fn default() -> Self {
        let tuning = Tuning::default();
        let params = BenchmarkParams::default();

        Self {
            block_size_kb: DEFAULT_BLOCK_SIZE_KIB,
            files: None,
            workers: None,
            filesystem: false,
            working_dir: params.working_dir,
            key_prefix: tuning.key_prefix,
            confirm_threshold: DEFAULT_CONFIRM_THRESHOLD,
            remainder: params.remainder,
            averaging: tuning.averaging,
            upload_retries: tuning.upload_retries,
            worker_nice: tuning.worker_nice,
            status_interval: tuning.status_interval,
            sample_interval: tuning.sample_interval,
            readiness_timeout: tuning.readiness_timeout,
            network_interface: None,
        }
    }
}

impl Benchmark {
    /// Converts this section into unresolved engine parameters.
    pub fn params(&self) -> BenchmarkParams {
        BenchmarkParams {
            block_size_kib: self.block_size_kb,
            files: self.files,
            workers: self.workers,
            source: if self.filesystem {
                PayloadSource::Filesystem
            } else {
                PayloadSource::Memory
            },
            working_dir: self.working_dir.clone(),
            remainder: self.remainder,
            confirm_threshold: self.confirm_threshold,
            tuning: Tuning {
                key_prefix: self.key_prefix.clone(),
                averaging: self.averaging,
                upload_retries: self.upload_retries,
                worker_nice: self.worker_nice,
                status_interval: self.status_interval,
                sample_interval: self.sample_interval,
                readiness_timeout: self.readiness_timeout,
            },
        }
    }
}

/// Log output format.
///
/// Controls how log messages are formatted. The format can be explicitly specified or
/// auto-detected based on whether output is to a TTY.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect the best format.
    ///
    /// This chooses [`LogFormat::Pretty`] for TTY, otherwise [`LogFormat::Simplified`].
    Auto,

    /// Pretty printing with colors.
    ///
    /// ```text
    ///  INFO  uploadbench_engine::pool > launched workers
    /// ```
    Pretty,

    /// Simplified plain text output.
    ///
    /// ```text
    /// 2020-12-04T12:10:32Z [uploadbench_engine::pool] INFO: launched workers
    /// ```
    Simplified,

    /// Dump out JSON lines.
    Json,
}

mod display_fromstr {
    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
        T: std::fmt::Display,
    {
        serializer.collect_str(&value)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        D: serde::Deserializer<'de>,
        T: std::str::FromStr,
        <T as std::str::FromStr>::Err: std::fmt::Display,
    {
        use serde::Deserialize;
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Logging configuration. Logs are always written to stderr.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Logging {
    /// Minimum log level to output.
    ///
    /// The `RUST_LOG` environment variable provides more granular control per module if needed.
    ///
    /// # Default
    ///
    /// `INFO`
    ///
    /// # Environment Variable
    ///
    /// `UB__LOGGING__LEVEL`
    #[serde(with = "display_fromstr")]
    pub level: LevelFilter,

    /// Log output format.
    ///
    /// # Environment Variable
    ///
    /// `UB__LOGGING__FORMAT`
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// [Sentry](https://sentry.io/) error reporting. Disabled unless a DSN is provided.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Sentry {
    /// Sentry DSN.
    ///
    /// # Environment Variable
    ///
    /// `UB__SENTRY__DSN`
    pub dsn: Option<SecretBox<ConfigSecret>>,

    /// Environment name attached to all events.
    pub environment: Option<Cow<'static, str>>,

    /// Sample rate of error events, between `0.0` and `1.0`.
    pub sample_rate: f32,
}

impl Sentry {
    /// Returns whether Sentry is enabled.
    pub fn is_enabled(&self) -> bool {
        self.dsn.is_some()
    }
}

impl Default for Sentry {
    fn default() -> Self {
        Self {
            dsn: None,
            environment: None,
            sample_rate: 1.0,
        }
    }
}

/// Main configuration struct.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// The storage target.
    pub storage: Storage,
    /// Parameters of benchmark runs.
    pub benchmark: Benchmark,
    /// Logging configuration.
    pub logging: Logging,
    /// Sentry configuration.
    pub sentry: Sentry,
}

/// Storage values passed on the command line.
#[derive(Debug, Default, Serialize)]
pub struct StorageOverrides {
    /// Region of an S3 target.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Endpoint of an S3 target.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Bucket of an S3 target.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    /// Access key ID of an S3 target.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,
    /// Secret access key of an S3 target.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
}

/// Benchmark values passed on the command line.
#[derive(Debug, Default, Serialize)]
pub struct BenchmarkOverrides {
    /// See [`Benchmark::block_size_kb`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_size_kb: Option<u64>,
    /// See [`Benchmark::filesystem`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filesystem: Option<bool>,
    /// See [`Benchmark::working_dir`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    /// See [`Benchmark::files`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<usize>,
    /// See [`Benchmark::workers`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,
}

/// Command line values, merged on top of all other configuration sources.
#[derive(Debug, Default, Serialize)]
pub struct Overrides {
    /// Storage values.
    pub storage: StorageOverrides,
    /// Benchmark values.
    pub benchmark: BenchmarkOverrides,
}

impl Config {
    /// Loads configuration from the provided arguments.
    ///
    /// Configuration is merged in the following order (later overrides earlier):
    /// 1. Default values
    /// 2. YAML configuration file (if provided in `path`)
    /// 3. Environment variables (prefixed with `UB__`)
    /// 4. Command line overrides
    pub fn load(path: Option<&Path>, overrides: &Overrides) -> Result<Self> {
        let mut figment = figment::Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .merge(Serialized::defaults(overrides))
            .extract()?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults() {
        figment::Jail::expect_with(|_jail| {
            let config = Config::load(None, &Overrides::default()).unwrap();

            assert!(matches!(config.storage, Storage::S3(_)));
            assert_eq!(config.benchmark.block_size_kb, 2048);
            assert_eq!(config.benchmark.working_dir, Path::new("/tmp/uploadbench"));
            assert_eq!(config.benchmark.confirm_threshold, ByteSize::gib(2));
            assert_eq!(config.benchmark.readiness_timeout, Duration::from_secs(600));
            assert_eq!(config.logging.level, LevelFilter::INFO);
            assert!(!config.sentry.is_enabled());

            Ok(())
        });
    }

    #[test]
    fn configurable_via_env() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("UB__STORAGE__TYPE", "s3");
            jail.set_env("UB__STORAGE__REGION", "eu-central-1");
            jail.set_env("UB__STORAGE__BUCKET", "bench");
            jail.set_env("UB__STORAGE__ACCESS_KEY", "access");
            jail.set_env("UB__STORAGE__SECRET_KEY", "secret");
            jail.set_env("UB__BENCHMARK__BLOCK_SIZE_KB", "512");
            jail.set_env("UB__BENCHMARK__SAMPLE_INTERVAL", "500ms");
            jail.set_env("UB__BENCHMARK__AVERAGING", "worker_time");
            jail.set_env("UB__LOGGING__LEVEL", "debug");
            jail.set_env("UB__SENTRY__DSN", "abcde");

            let config = Config::load(None, &Overrides::default()).unwrap();

            let Storage::S3(s3) = &config.storage else {
                panic!("expected s3 storage");
            };
            assert_eq!(s3.region, "eu-central-1");
            assert_eq!(s3.bucket, "bench");
            assert_eq!(
                s3.access_key.as_ref().unwrap().expose_secret().as_str(),
                "access"
            );

            let params = config.benchmark.params();
            assert_eq!(params.block_size_kib, 512);
            assert_eq!(params.tuning.sample_interval, Duration::from_millis(500));
            assert_eq!(params.tuning.averaging, AveragingMode::WorkerTime);
            assert_eq!(config.logging.level, LevelFilter::DEBUG);
            assert!(config.sentry.is_enabled());

            Ok(())
        });
    }

    #[test]
    fn configurable_via_yaml() {
        let mut tempfile = tempfile::NamedTempFile::new().unwrap();
        tempfile
            .write_all(
                br#"
            storage:
                type: filesystem
                path: /mnt/target
            benchmark:
                filesystem: true
                working_dir: /var/tmp/bench
                confirm_threshold: 8 GiB
                remainder: reject
            logging:
                format: json
            "#,
            )
            .unwrap();

        figment::Jail::expect_with(|_jail| {
            let config = Config::load(Some(tempfile.path()), &Overrides::default()).unwrap();

            let Storage::FileSystem { path } = &config.storage else {
                panic!("expected filesystem storage");
            };
            assert_eq!(path, Path::new("/mnt/target"));

            let params = config.benchmark.params();
            assert_eq!(params.source, PayloadSource::Filesystem);
            assert_eq!(params.working_dir, Path::new("/var/tmp/bench"));
            assert_eq!(params.confirm_threshold, ByteSize::gib(8));
            assert_eq!(params.remainder, RemainderPolicy::Reject);
            assert_eq!(config.logging.format, LogFormat::Json);

            Ok(())
        });
    }

    #[test]
    fn overrides_take_precedence() {
        let mut tempfile = tempfile::NamedTempFile::new().unwrap();
        tempfile
            .write_all(
                br#"
            storage:
                type: s3
                region: us-west-2
                bucket: from-yaml
            benchmark:
                workers: 4
            "#,
            )
            .unwrap();

        figment::Jail::expect_with(|jail| {
            jail.set_env("UB__STORAGE__BUCKET", "from-env");
            jail.set_env("UB__BENCHMARK__WORKERS", "8");

            let overrides = Overrides {
                storage: StorageOverrides {
                    bucket: Some("from-cli".into()),
                    secret_key: Some("secret".into()),
                    ..Default::default()
                },
                benchmark: BenchmarkOverrides {
                    files: Some(100),
                    ..Default::default()
                },
            };
            let config = Config::load(Some(tempfile.path()), &overrides).unwrap();

            let Storage::S3(s3) = &config.storage else {
                panic!("expected s3 storage");
            };
            let s3 = s3.to_config();
            assert_eq!(s3.region, "us-west-2");
            assert_eq!(s3.bucket, "from-cli");
            assert!(s3.access_key.is_none());
            assert_eq!(s3.secret_key.unwrap().expose_secret(), "secret");

            assert_eq!(config.benchmark.workers, Some(8));
            assert_eq!(config.benchmark.files, Some(100));

            Ok(())
        });
    }

    #[test]
    fn storage_overrides_keep_the_configured_type() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("UB__STORAGE__TYPE", "filesystem");
            jail.set_env("UB__STORAGE__PATH", "/mnt/target");

            let overrides = Overrides {
                storage: StorageOverrides {
                    bucket: Some("from-cli".into()),
                    ..Default::default()
                },
                ..Default::default()
            };
            let config = Config::load(None, &overrides).unwrap();

            let Storage::FileSystem { path } = &config.storage else {
                panic!("expected filesystem storage");
            };
            assert_eq!(path, Path::new("/mnt/target"));

            Ok(())
        });
    }

    #[test]
    fn secrets_are_redacted() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("UB__STORAGE__SECRET_KEY", "hunter2");
            let config = Config::load(None, &Overrides::default()).unwrap();
            assert!(!format!("{config:?}").contains("hunter2"));
            Ok(())
        });
    }
}
