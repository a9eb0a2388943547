//! Console and file logging
//!
//! Console output goes to stderr so a workload inheriting stdout keeps it to
//! itself. File output is always JSON.

use std::io;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::config::{FileLoggingConfig, LogFormat, LoggingConfig, RotationStrategy};
use crate::error::{ObservabilityError, Result};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Keeps the background file writer alive; dropping it flushes pending lines
pub struct LogGuard {
    _guard: Option<WorkerGuard>,
}

impl LogGuard {
    fn new(guard: Option<WorkerGuard>) -> Self {
        Self { _guard: guard }
    }

    /// Whether file output is active
    pub fn has_file_writer(&self) -> bool {
        self._guard.is_some()
    }
}

/// Install the global subscriber described by `config`.
///
/// `RUST_LOG` overrides the configured level and directives. Fails if a
/// global subscriber is already set.
pub fn init_logging(config: &LoggingConfig) -> Result<LogGuard> {
    let filter = env_filter(config, std::env::var("RUST_LOG").ok().as_deref())?;

    let mut layers: Vec<BoxedLayer> = vec![console_layer(config)];
    let guard = match &config.file {
        Some(file) => {
            let (layer, guard) = file_layer(config, file);
            layers.push(layer);
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| ObservabilityError::LoggingInit(e.to_string()))?;

    Ok(LogGuard::new(guard))
}

fn env_filter(config: &LoggingConfig, rust_log: Option<&str>) -> Result<EnvFilter> {
    let directives = match rust_log {
        Some(env) if !env.trim().is_empty() => env.to_string(),
        _ => config.directives(),
    };
    EnvFilter::try_new(&directives).map_err(|e| ObservabilityError::Filter {
        directives,
        reason: e.to_string(),
    })
}

fn console_layer(config: &LoggingConfig) -> BoxedLayer {
    let layer = fmt::layer()
        .with_writer(io::stderr)
        .with_target(config.include_target)
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_span_events(FmtSpan::CLOSE);

    match config.format {
        LogFormat::Pretty => layer.pretty().boxed(),
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Compact => layer.compact().boxed(),
    }
}

fn file_layer(config: &LoggingConfig, file: &FileLoggingConfig) -> (BoxedLayer, WorkerGuard) {
    let appender = match file.rotation {
        RotationStrategy::Daily => tracing_appender::rolling::daily(&file.directory, &file.prefix),
        RotationStrategy::Hourly => {
            tracing_appender::rolling::hourly(&file.directory, &file.prefix)
        }
        RotationStrategy::Never => tracing_appender::rolling::never(&file.directory, &file.prefix),
    };
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(config.include_target)
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_span_events(FmtSpan::CLOSE)
        .json()
        .boxed();

    (layer, guard)
}
