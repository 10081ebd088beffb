//! Structured logging system using tracing crate
//!
//! ## Log Format Options
//!
//! The output format is selected with the `LOG_FORMAT` environment variable:
//!
//! - `json` - Structured JSON for log aggregation
//! - `pretty` - Multi-line, coloured output for development
//! - `compact` - Single-line, coloured output for a device console
//!
//! ## Environment Variables
//!
//! - `LOG_LEVEL`: ERROR, WARN, INFO, DEBUG or TRACE (default INFO)
//! - `LOG_FORMAT`: json, pretty or compact (default compact)
//! - `LOG_SPANS`: emit span open/close events (default false)
//! - `RUST_LOG`: full filter override
//!
//! ```bash
//! LOG_FORMAT=json LOG_LEVEL=DEBUG cloud-link -c device.toml run
//! ```

use std::env;
use tracing::Level;
use tracing_subscriber::{filter::Directive, fmt, prelude::*, EnvFilter};

/// Dependencies whose chatter is capped at `warn`
const QUIET_TARGETS: [&str; 3] = ["rumqttc=warn", "rustls=warn", "tokio=warn"];

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    Json,
    Pretty,
    #[default]
    Compact,
}

impl LogFormat {
    /// Parse a format name, falling back to compact
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "pretty" => LogFormat::Pretty,
            _ => LogFormat::Compact,
        }
    }
}

/// Logging options resolved from the environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingSettings {
    pub level: Level,
    pub format: LogFormat,
    pub include_spans: bool,
    /// Raw `RUST_LOG` value, replacing the level-based filter when set
    pub filter_override: Option<String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::default(),
            include_spans: false,
            filter_override: None,
        }
    }
}

impl LoggingSettings {
    /// Resolve settings through `lookup` (usually `std::env::var`)
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            level: lookup("LOG_LEVEL")
                .map(|v| parse_level(&v))
                .unwrap_or(defaults.level),
            format: lookup("LOG_FORMAT")
                .map(|v| LogFormat::parse(&v))
                .unwrap_or(defaults.format),
            include_spans: lookup("LOG_SPANS")
                .map(|v| v.trim().eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.include_spans),
            filter_override: lookup("RUST_LOG").filter(|v| !v.trim().is_empty()),
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Filter for these settings: `RUST_LOG` wins, otherwise level plus quiet dependencies
    pub fn filter(&self) -> EnvFilter {
        if let Some(directives) = &self.filter_override {
            return EnvFilter::new(directives);
        }

        QUIET_TARGETS
            .iter()
            .filter_map(|d| d.parse::<Directive>().ok())
            .fold(EnvFilter::new(self.level.to_string()), |filter, directive| {
                filter.add_directive(directive)
            })
    }
}

fn parse_level(s: &str) -> Level {
    match s.trim().to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

/// Install the global subscriber
pub fn init_logging(settings: &LoggingSettings) {
    let span_events = if settings.include_spans {
        fmt::format::FmtSpan::NEW | fmt::format::FmtSpan::CLOSE
    } else {
        fmt::format::FmtSpan::NONE
    };
    let subscriber = tracing_subscriber::registry().with(settings.filter());

    match settings.format {
        LogFormat::Json => {
            let fmt_layer = fmt::layer().json().with_span_events(span_events);
            subscriber.with(fmt_layer).init();
        }
        LogFormat::Pretty => {
            let fmt_layer = fmt::layer()
                .pretty()
                .with_ansi(true)
                .with_span_events(span_events);
            subscriber.with(fmt_layer).init();
        }
        LogFormat::Compact => {
            let fmt_layer = fmt::layer()
                .compact()
                .with_ansi(true)
                .with_target(false)
                .with_span_events(span_events);
            subscriber.with(fmt_layer).init();
        }
    }
}

/// Initialize logging from environment variables
pub fn init_default_logging() {
    init_logging(&LoggingSettings::from_env());
}

/// Span around one connection attempt
#[macro_export]
macro_rules! connection_span {
    ($($field:tt)*) => {
        tracing::info_span!("cloud_connect", $($field)*)
    };
}

/// Span around one outbound publish
#[macro_export]
macro_rules! publish_span {
    ($($field:tt)*) => {
        tracing::debug_span!("cloud_publish", $($field)*)
    };
}

pub use {connection_span, publish_span};
