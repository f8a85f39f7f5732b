//! Subscriber setup for the `tracing` output of every queue worker.
//!
//! RUST_LOG overrides the `[logging]` section; without either, `info` in
//! the pretty format. Worker threads are named `pktring-q{N}`, and every line
//! carries that name so interleaved queues stay readable.

use crate::config::LoggingLock;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Level and format as written in the `[logging]` section.
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    pub level: String,
    pub format: String,
}

impl LogConfig {
    pub fn new() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl From<&LoggingLock> for LogConfig {
    fn from(lock: &LoggingLock) -> Self {
        Self {
            level: lock.level.clone(),
            format: lock.format.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Pretty,
    Compact,
    Json,
}

impl LogFormat {
    /// Unknown names fall back to pretty; validation has already warned.
    fn parse(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Pretty,
        }
    }
}

fn parse_level(level: &str) -> Level {
    level.trim().parse().unwrap_or(Level::INFO)
}

fn filter_for(config: Option<&LogConfig>) -> EnvFilter {
    if std::env::var_os(EnvFilter::DEFAULT_ENV).is_some() {
        return EnvFilter::from_default_env();
    }
    let level = config.map_or(Level::INFO, |c| parse_level(&c.level));
    EnvFilter::new(level.as_str())
}

/// Installs the global subscriber.
///
/// Only the first call installs one; later calls are no-ops.
pub fn init_logging(config: Option<&LogConfig>) {
    let filter = filter_for(config);
    let format = config.map_or(LogFormat::Pretty, |c| LogFormat::parse(&c.format));
    let registry = tracing_subscriber::registry().with(filter);

    // A subscriber installed earlier (tests, embedding programs) stays.
    let _ = match format {
        LogFormat::Json => tracing::subscriber::set_global_default(
            registry.with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_thread_names(true)
                    .with_span_events(FmtSpan::CLOSE),
            ),
        ),
        LogFormat::Compact => tracing::subscriber::set_global_default(
            registry.with(tracing_subscriber::fmt::layer().compact().with_thread_names(true)),
        ),
        LogFormat::Pretty => tracing::subscriber::set_global_default(
            registry.with(tracing_subscriber::fmt::layer().with_thread_names(true)),
        ),
    };
}
