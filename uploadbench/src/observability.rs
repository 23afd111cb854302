use std::env;
use std::io::IsTerminal;

use secrecy::ExposeSecret;
use sentry::integrations::tracing as sentry_tracing;
use tracing::Level;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, Layer, prelude::*};

use crate::config::{Config, LogFormat};

/// Initializes Sentry if a DSN is configured.
///
/// The returned guard flushes pending events when dropped.
pub fn init_sentry(config: &Config) -> Option<sentry::ClientInitGuard> {
    let dsn = config.sentry.dsn.as_ref()?;

    Some(sentry::init(sentry::ClientOptions {
        dsn: dsn.expose_secret().as_str().parse().ok(),
        environment: config.sentry.environment.clone(),
        sample_rate: config.sentry.sample_rate,
        release: sentry::release_name!(),
        ..Default::default()
    }))
}

/// Installs the global tracing subscriber.
pub fn init_tracing(config: &Config) {
    // Warnings and errors become events, info messages are kept as breadcrumbs.
    let sentry_layer = config.sentry.is_enabled().then(|| {
        sentry_tracing::layer().event_filter(|metadata| match *metadata.level() {
            Level::ERROR | Level::WARN => sentry_tracing::EventFilter::Event,
            Level::INFO => sentry_tracing::EventFilter::Breadcrumb,
            Level::DEBUG | Level::TRACE => sentry_tracing::EventFilter::Ignore,
        })
    });

    let (level, env_filter) = parse_rust_log(config.logging.level);

    let format = match config.logging.format {
        LogFormat::Auto if std::io::stderr().is_terminal() => LogFormat::Pretty,
        LogFormat::Auto => LogFormat::Simplified,
        format => format,
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true);
    let fmt_layer = match format {
        LogFormat::Json => fmt_layer.json().flatten_event(true).boxed(),
        LogFormat::Simplified => fmt_layer.with_ansi(false).compact().boxed(),
        LogFormat::Pretty | LogFormat::Auto => fmt_layer.with_ansi(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(level))
        .with(sentry_layer)
        .with(env_filter)
        .init();
}

/// Determines the effective level and the maximum verbosity filter.
///
/// A plain level in `RUST_LOG` replaces the configured level. Any other value is used literally
/// as filter directive.
pub fn parse_rust_log(configured: LevelFilter) -> (LevelFilter, EnvFilter) {
    let level = match env::var(EnvFilter::DEFAULT_ENV) {
        Ok(value) => match value.parse::<Level>() {
            Ok(level) => LevelFilter::from_level(level),
            Err(_) => return (LevelFilter::TRACE, EnvFilter::new(value)),
        },
        Err(_) => configured,
    };

    // This is the maximum verbosity that will be logged, we filter this down to `level`.
    let env_filter = EnvFilter::new(
        "INFO,\
        aws_config=WARN,\
        aws_smithy_runtime=WARN,\
        uploadbench=TRACE,\
        uploadbench_engine=TRACE,\
        ",
    );

    (level, env_filter)
}
