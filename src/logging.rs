//! Structured logging setup
//!
//! The library itself only emits `tracing` events and spans; installing a subscriber
//! is left to the embedding application. This module offers the standard setup used
//! by the `qtrk` binary and by tests:
//! - Pretty, compact or JSON output
//! - `RUST_LOG` environment filter, falling back to the configured level
//! - Thread names on every line (workers are named `qtrk-worker-N`)
//! - Written to stderr, stdout stays free for result output
//!
//! # Example
//! ```no_run
//! use qtrk::{config::TrackerConfig, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TrackerConfig::load_from("config/tracker.toml")?;
//! logging::init_from_config(&config)?;
//! tracing::info!("tracker starting");
//! # Ok(())
//! # }
//! ```

use crate::config::TrackerConfig;
use crate::error::{TrackerError, TrackerResult};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter, Layer,
};

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Pretty-printed format with colors (for development)
    Pretty,
    /// Compact single-line format without colors
    Compact,
    /// JSON format for log aggregation
    Json,
}

/// Logging configuration options
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is not set
    pub level: Level,
    /// Output format
    pub format: LogFormat,
    /// Whether to include span close events (with busy/idle timings)
    pub with_span_events: bool,
    /// Whether to include thread names
    pub with_thread_names: bool,
    /// Whether to enable ANSI colors (Pretty format only)
    pub with_ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Compact,
            with_span_events: false,
            with_thread_names: true,
            with_ansi: true,
        }
    }
}

impl LoggingConfig {
    /// Logging config with a custom level
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Logging config from the tracker configuration's `log_level`
    pub fn from_tracker_config(config: &TrackerConfig) -> TrackerResult<Self> {
        Ok(Self::new(parse_log_level(&config.log_level)?))
    }

    /// Set output format
    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable span close events
    #[must_use]
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Enable or disable ANSI colors
    #[must_use]
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Initialize logging from the tracker configuration.
pub fn init_from_config(config: &TrackerConfig) -> TrackerResult<()> {
    init(LoggingConfig::from_tracker_config(config)?)
}

/// Install the global subscriber.
///
/// Idempotent: if a global subscriber is already installed (tests, embedding
/// applications) this returns `Ok(())`.
pub fn init(config: LoggingConfig) -> TrackerResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    let span_events = if config.with_span_events {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let result = match config.format {
        LogFormat::Pretty => {
            let fmt_layer = fmt::layer()
                .pretty()
                .with_span_events(span_events)
                .with_thread_names(config.with_thread_names)
                .with_writer(std::io::stderr)
                .with_ansi(config.with_ansi)
                .with_filter(env_filter);
            tracing_subscriber::registry().with(fmt_layer).try_init()
        }
        LogFormat::Compact => {
            let fmt_layer = fmt::layer()
                .compact()
                .with_span_events(span_events)
                .with_thread_names(config.with_thread_names)
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .with_filter(env_filter);
            tracing_subscriber::registry().with(fmt_layer).try_init()
        }
        LogFormat::Json => {
            let fmt_layer = fmt::layer()
                .json()
                .with_span_events(span_events)
                .with_thread_names(config.with_thread_names)
                .with_writer(std::io::stderr)
                .with_filter(env_filter);
            tracing_subscriber::registry().with(fmt_layer).try_init()
        }
    };

    result.or_else(already_initialized_is_ok)
}

fn already_initialized_is_ok(err: TryInitError) -> TrackerResult<()> {
    // Expected in tests and when the host application installed its own subscriber
    let message = err.to_string();
    if message.contains("already been set") || message.contains("already initialized") {
        Ok(())
    } else {
        Err(TrackerError::Logging(message))
    }
}

/// Parse log level string into tracing Level
pub fn parse_log_level(level: &str) -> TrackerResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(TrackerError::InvalidConfig(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        ))),
    }
}
