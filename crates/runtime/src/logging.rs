//! Structured logging setup with tracing.

use seqcache_core::LoggingConfig;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    prelude::*,
};

/// Logging format options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable text format.
    Text,
    /// JSON format for structured logging.
    #[default]
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}")),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => f.write_str("text"),
            Self::Json => f.write_str("json"),
        }
    }
}

/// Initialize the logging subsystem.
///
/// `RUST_LOG`, when set, overrides `level`. Cache spans are closed with
/// their timing so prepare/apply/state I/O durations show up in the log.
///
/// # Arguments
/// * `level` - Log level filter (e.g., "info", "debug", "kv_memory=trace")
/// * `format` - Output format (text or JSON)
///
/// # Returns
/// `false` if a global subscriber was already installed.
///
/// # Example
/// ```ignore
/// use runtime::logging::{init_logging, LogFormat};
/// init_logging("info", LogFormat::Json);
/// ```
pub fn init_logging(level: &str, format: LogFormat) -> bool {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Text => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_span_events(FmtSpan::CLOSE),
            );

            tracing::subscriber::set_global_default(subscriber).is_ok()
        }
        LogFormat::Json => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_span_events(FmtSpan::CLOSE),
            );

            tracing::subscriber::set_global_default(subscriber).is_ok()
        }
    }
}

/// Initialize logging from the `runtime.logging` section of a config file.
///
/// An unknown format falls back to JSON.
pub fn init_logging_from_config(config: &LoggingConfig) -> bool {
    let format = config.format.parse().unwrap_or_default();
    init_logging(&config.level, format)
}

/// Initialize logging from environment variables.
///
/// Uses:
/// - `RUST_LOG` for log level (default: "info")
/// - `LOG_FORMAT` for format (default: "json")
pub fn init_logging_from_env() -> bool {
    let level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let format: LogFormat = std::env::var("LOG_FORMAT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_default();

    init_logging(&level, format)
}
