use std::io::{BufRead, IsTerminal, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use argh::FromArgs;
use uploadbench_engine::Resolution;
use uploadbench_engine::store::{LocalFsConnector, S3Connector, StoreConnector};
use yansi::Paint;

use crate::config::{BenchmarkOverrides, Config, Overrides, Storage, StorageOverrides};
use crate::error::{CliError, SetupError};
use crate::{observability, preflight, report, setup};

/// Parallel object storage upload throughput benchmark.
#[derive(Debug, FromArgs)]
struct Args {
    /// path to the YAML configuration file
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,

    #[argh(subcommand)]
    command: Command,
}

#[derive(Debug, FromArgs)]
#[argh(subcommand)]
enum Command {
    Setup(SetupCommand),
    Run(RunCommand),
    Version(VersionCommand),
}

/// check credentials and create the target bucket if it does not exist
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "setup")]
struct SetupCommand {
    /// region of the bucket
    #[argh(option)]
    region: Option<String>,

    /// custom S3 endpoint URL
    #[argh(option)]
    endpoint: Option<String>,

    /// name of the bucket
    #[argh(option)]
    bucket: Option<String>,

    /// access key ID
    #[argh(option)]
    access_key: Option<String>,

    /// secret access key
    #[argh(option)]
    secret_key: Option<String>,
}

/// run the upload benchmark
///
/// Unset counts are derived from the block size and the number of cores.
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "run")]
struct RunCommand {
    /// size of every upload in KiB (default 2048)
    #[argh(option)]
    block_size_kb: Option<u64>,

    /// write payloads to the working directory and upload from there
    #[argh(switch)]
    filesystem: bool,

    /// scratch directory for payload files (default /tmp/uploadbench)
    #[argh(option)]
    working_dir: Option<PathBuf>,

    /// number of files to upload
    #[argh(option)]
    files: Option<usize>,

    /// number of concurrent workers
    #[argh(option)]
    workers: Option<usize>,

    /// start large runs without asking for confirmation
    #[argh(switch, short = 'y')]
    yes: bool,

    /// also write the report as JSON to this path
    #[argh(option, short = 'o')]
    output: Option<PathBuf>,
}

/// print the uploadbench version
#[derive(Default, Debug, FromArgs)]
#[argh(subcommand, name = "version")]
struct VersionCommand {}

impl Command {
    fn overrides(&self) -> Overrides {
        match self {
            Command::Setup(command) => Overrides {
                storage: StorageOverrides {
                    region: command.region.clone(),
                    endpoint: command.endpoint.clone(),
                    bucket: command.bucket.clone(),
                    access_key: command.access_key.clone(),
                    secret_key: command.secret_key.clone(),
                },
                benchmark: BenchmarkOverrides::default(),
            },
            Command::Run(command) => Overrides {
                storage: StorageOverrides::default(),
                benchmark: BenchmarkOverrides {
                    block_size_kb: command.block_size_kb,
                    filesystem: command.filesystem.then_some(true),
                    working_dir: command.working_dir.clone(),
                    files: command.files,
                    workers: command.workers,
                },
            },
            Command::Version(_) => Overrides::default(),
        }
    }
}

/// Bootstrap the runtime and execute the CLI command.
pub fn execute() -> ExitCode {
    let args: Args = argh::from_env();

    // Special switch to just print the version and exit.
    if let Command::Version(_) = args.command {
        println!("uploadbench {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    match execute_command(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            let code = ExitCode::from(&error);
            eprintln!("{} {:#}", "error:".bold().red(), anyhow::Error::new(error));
            code
        }
    }
}

fn execute_command(args: Args) -> Result<(), CliError> {
    let overrides = args.command.overrides();
    let config = Config::load(args.config.as_deref(), &overrides)?;

    // Sentry should be initialized before creating the async runtime.
    let _sentry_guard = observability::init_sentry(&config);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("main-rt")
        .enable_all()
        .build()
        .context("failed to build the async runtime")?;
    let _runtime_guard = runtime.enter();

    observability::init_tracing(&config);
    tracing::debug!(?config);

    let result = runtime.block_on(async move {
        match args.command {
            Command::Setup(_) => setup::setup(&config).await,
            Command::Run(command) => run(config, command).await,
            Command::Version(_) => Ok(()),
        }
    });

    if let Err(error) = &result {
        tracing::error!(
            error = error as &dyn std::error::Error,
            exit_code = error.exit_code(),
            "command failed"
        );
    }
    result
}

async fn run(config: Config, command: RunCommand) -> Result<(), CliError> {
    preflight::check_storage(&config.storage, &config.benchmark)?;
    let counter = preflight::network_counter(&config.benchmark)?;

    let resolution = config.benchmark.params().resolve()?;
    if resolution.requires_confirmation && !command.yes {
        confirm(&resolution)?;
    }

    let connector = connect(&config.storage).await?;
    let benchmark = resolution.config;
    tracing::info!(
        workers = benchmark.workers,
        files = benchmark.files,
        block_size = benchmark.block_size,
        source = ?benchmark.source,
        "starting benchmark"
    );

    let outcome = uploadbench_engine::run(&benchmark, connector, Box::new(counter)).await?;
    report::print_report(&outcome.report);

    if let Some(path) = &command.output {
        report::write_json(path, &outcome.report)
            .with_context(|| format!("failed to write report to {}", path.display()))?;
    }

    Ok(())
}

async fn connect(storage: &Storage) -> Result<Arc<dyn StoreConnector>, CliError> {
    match storage {
        Storage::S3(s3) => Ok(Arc::new(S3Connector::new(s3.to_config()))),
        Storage::FileSystem { path } => {
            let connector = LocalFsConnector::new(path);
            connector
                .ensure_root()
                .await
                .map_err(|cause| SetupError::Bucket {
                    bucket: path.display().to_string(),
                    cause,
                })?;
            Ok(Arc::new(connector))
        }
    }
}

/// Asks the operator to confirm a run with a large payload volume.
///
/// Without an interactive terminal, large runs must be confirmed with `--yes`.
fn confirm(resolution: &Resolution) -> Result<(), CliError> {
    let volume = resolution.projected_volume;
    let stdin = std::io::stdin();
    if !stdin.is_terminal() {
        eprintln!("the benchmark prepares {volume} of payloads, pass --yes to start it anyway");
        return Err(CliError::Declined);
    }

    eprint!(
        "the benchmark prepares {} of payloads. Continue? [y/N] ",
        volume.bold()
    );
    std::io::stderr().flush().context("failed to prompt")?;

    let mut answer = String::new();
    stdin
        .lock()
        .read_line(&mut answer)
        .context("failed to read confirmation")?;

    match answer.trim() {
        "y" | "Y" | "yes" => Ok(()),
        _ => Err(CliError::Declined),
    }
}
