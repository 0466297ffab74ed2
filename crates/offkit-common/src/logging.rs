//! Logging configuration and setup.
//!
//! By default only the `offkit_*` crates log at the configured level;
//! everything else (reqwest, hyper, rusqlite) is held at `warn`. Set
//! `OFFKIT_LOG` to a full filter string to override that, e.g.
//! `OFFKIT_LOG=offkit_sw=trace,reqwest=debug`.

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Environment variable holding a filter that replaces the defaults.
pub const LOG_ENV: &str = "OFFKIT_LOG";

/// Crates whose events pass at the configured level.
const OFFKIT_TARGETS: [&str; 3] = ["offkit_common", "offkit_net", "offkit_sw"];

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, human-readable.
    #[default]
    Pretty,
    /// One line per event.
    Compact,
    /// One JSON object per event.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Level for the `offkit_*` crates.
    pub level: Level,
    /// Level for every other crate.
    pub dependency_level: Level,
    pub format: LogFormat,
    /// Include source file and line.
    pub include_location: bool,
    /// Log span open and close.
    pub include_span_events: bool,
    /// Full filter string replacing the generated directives.
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            dependency_level: Level::WARN,
            format: LogFormat::Pretty,
            include_location: false,
            include_span_events: false,
            filter: None,
        }
    }
}

impl LogConfig {
    /// Verbose output for local debugging of the worker.
    pub fn debug() -> Self {
        Self {
            level: Level::DEBUG,
            include_location: true,
            include_span_events: true,
            ..Default::default()
        }
    }

    /// JSON lines at `info`, for hosts that ship logs elsewhere.
    pub fn production() -> Self {
        Self {
            format: LogFormat::Json,
            ..Default::default()
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Filter directives, e.g. `warn,offkit_common=info,offkit_net=info,offkit_sw=info`.
    pub fn directives(&self) -> String {
        if let Some(ref custom) = self.filter {
            return custom.clone();
        }
        let level = self.level.as_str().to_ascii_lowercase();
        let mut directives = self.dependency_level.as_str().to_ascii_lowercase();
        for target in OFFKIT_TARGETS {
            directives.push_str(&format!(",{target}={level}"));
        }
        directives
    }

    /// `OFFKIT_LOG` wins over the configuration; a malformed filter falls
    /// back to the generated directives.
    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_env(LOG_ENV)
            .or_else(|_| EnvFilter::try_new(self.directives()))
            .unwrap_or_else(|_| EnvFilter::new(self.level.as_str()))
    }
}

/// Install the global subscriber. Calling it again is a no-op.
pub fn init_logging(config: LogConfig) {
    let filter = config.env_filter();

    let span_events = if config.include_span_events {
        FmtSpan::ENTER | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    // Exactly one of the three layers is present.
    let pretty = (config.format == LogFormat::Pretty).then(|| {
        fmt::layer()
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .with_span_events(span_events.clone())
    });
    let compact = (config.format == LogFormat::Compact).then(|| {
        fmt::layer()
            .compact()
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .with_span_events(span_events.clone())
    });
    let json = (config.format == LogFormat::Json).then(|| {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_events(span_events.clone())
    });

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(pretty)
        .with(compact)
        .with(json)
        .try_init();

    match installed {
        Ok(()) => tracing::debug!(
            format = ?config.format,
            directives = %config.directives(),
            "Logging initialized"
        ),
        Err(_) => tracing::debug!("Global subscriber already installed"),
    }
}

/// Route logs through the libtest capture writer.
///
/// Honours `OFFKIT_LOG`; otherwise the `offkit_*` crates log at `debug`.
pub fn init_test_logging() {
    let config = LogConfig {
        level: Level::DEBUG,
        ..Default::default()
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(config.env_filter())
        .with_test_writer()
        .try_init();
}
