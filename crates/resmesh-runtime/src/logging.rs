//! Logging setup over `tracing-subscriber`.
//!
//! Every request is dispatched inside a `request` span carrying its subject,
//! so enabling span events shows the life of each request on its group lane.
//!
//! # Configuration-Based Initialization
//!
//! ```rust,ignore
//! use resmesh_runtime::{config::load_config, logging};
//!
//! let config = load_config()?;
//! logging::init_from_config(&config.logging);
//! ```
//!
//! # Manual Initialization
//!
//! ```rust,ignore
//! use resmesh_runtime::logging::{LoggingBuilder, SpanEvents};
//!
//! LoggingBuilder::new()
//!     .directive("resmesh_framework=debug")
//!     .span_events(SpanEvents::LIFECYCLE)
//!     .init();
//! ```

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use tracing::warn;
use tracing_appender::rolling;
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::{LogFormat, LogOutput, LogRotation, LoggingConfig, SpanEventConfig};

/// Span lifecycle events to log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpanEvents {
    pub new: bool,
    pub enter: bool,
    pub exit: bool,
    pub close: bool,
}

impl SpanEvents {
    /// No span events.
    pub const NONE: Self = Self {
        new: false,
        enter: false,
        exit: false,
        close: false,
    };

    /// Creation and close, one pair of lines per request.
    pub const LIFECYCLE: Self = Self {
        new: true,
        enter: false,
        exit: false,
        close: true,
    };

    /// Every transition. Lane hand-offs show up as exit/enter pairs.
    pub const FULL: Self = Self {
        new: true,
        enter: true,
        exit: true,
        close: true,
    };

    fn to_fmt_span(self) -> fmt::format::FmtSpan {
        let mut span = fmt::format::FmtSpan::NONE;
        if self.new {
            span |= fmt::format::FmtSpan::NEW;
        }
        if self.enter {
            span |= fmt::format::FmtSpan::ENTER;
        }
        if self.exit {
            span |= fmt::format::FmtSpan::EXIT;
        }
        if self.close {
            span |= fmt::format::FmtSpan::CLOSE;
        }
        span
    }
}

impl From<&SpanEventConfig> for SpanEvents {
    fn from(config: &SpanEventConfig) -> Self {
        Self {
            new: config.new,
            enter: config.enter,
            exit: config.exit,
            close: config.close,
        }
    }
}

/// Initializes logging from configuration.
///
/// Does nothing if a global subscriber is already installed.
pub fn init_from_config(config: &LoggingConfig) {
    let _ = LoggingBuilder::from_config(config).try_init();
}

// =============================================================================
// LoggingBuilder
// =============================================================================

/// A builder for the global subscriber.
#[derive(Debug, Default)]
pub struct LoggingBuilder {
    directives: Vec<String>,
    level: Option<tracing::Level>,
    span_events: SpanEvents,
    format: LogFormat,
    output: LogOutput,
    with_target: bool,
    with_thread_ids: bool,
    with_file: bool,
    with_line_number: bool,
    file_path: Option<PathBuf>,
    rotation: LogRotation,
}

impl LoggingBuilder {
    /// Creates a builder with compact stdout output at `info`.
    pub fn new() -> Self {
        Self {
            with_target: true,
            ..Default::default()
        }
    }

    /// Creates a builder from configuration.
    pub fn from_config(config: &LoggingConfig) -> Self {
        let mut builder = Self::new()
            .with_level(config.level.to_tracing_level())
            .format(config.format)
            .output(config.output)
            .span_events(SpanEvents::from(&config.span_events))
            .with_thread_ids(config.thread_ids)
            .with_file(config.file_location)
            .with_line_number(config.file_location)
            .rotation(config.rotation);
        builder.file_path.clone_from(&config.file_path);

        let mut filters: Vec<_> = config.filters.iter().collect();
        filters.sort_by(|a, b| a.0.cmp(b.0));
        for (module, level) in filters {
            builder = builder.directive(&format!("{module}={level}"));
        }
        builder
    }

    /// Sets the base level.
    pub fn with_level(mut self, level: tracing::Level) -> Self {
        self.level = Some(level);
        self
    }

    /// Adds a filter directive such as `resmesh_transport=trace`.
    pub fn directive(mut self, directive: &str) -> Self {
        self.directives.push(directive.to_string());
        self
    }

    /// Sets the span events to log.
    pub fn span_events(mut self, events: SpanEvents) -> Self {
        self.span_events = events;
        self
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }

    pub fn with_target(mut self, enabled: bool) -> Self {
        self.with_target = enabled;
        self
    }

    pub fn with_thread_ids(mut self, enabled: bool) -> Self {
        self.with_thread_ids = enabled;
        self
    }

    pub fn with_file(mut self, enabled: bool) -> Self {
        self.with_file = enabled;
        self
    }

    pub fn with_line_number(mut self, enabled: bool) -> Self {
        self.with_line_number = enabled;
        self
    }

    /// Sets the log file for file output.
    pub fn file_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    /// Sets the log file rotation.
    pub fn rotation(mut self, rotation: LogRotation) -> Self {
        self.rotation = rotation;
        self
    }

    /// `RUST_LOG` if set, else the base level, plus the directives.
    fn build_filter(&self) -> EnvFilter {
        let base = self.level.unwrap_or(tracing::Level::INFO).to_string().to_lowercase();
        let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&base));
        for directive in &self.directives {
            match directive.parse() {
                Ok(d) => filter = filter.add_directive(d),
                Err(e) => eprintln!("Ignoring invalid log directive '{directive}': {e}"),
            }
        }
        filter
    }

    /// Installs the global subscriber. Does nothing if one is installed.
    pub fn init(self) {
        let _ = self.try_init();
    }

    /// Installs the global subscriber.
    pub fn try_init(self) -> Result<(), TryInitError> {
        let filter = self.build_filter();
        let span_events = self.span_events.to_fmt_span();

        macro_rules! configure_layer {
            ($layer:expr) => {
                $layer
                    .with_span_events(span_events.clone())
                    .with_target(self.with_target)
                    .with_thread_ids(self.with_thread_ids)
                    .with_file(self.with_file)
                    .with_line_number(self.with_line_number)
            };
        }

        macro_rules! init_with_writer {
            ($writer:expr) => {
                match self.format {
                    #[cfg(feature = "json-log")]
                    LogFormat::Json => tracing_subscriber::registry()
                        .with(configure_layer!(fmt::layer().json().with_writer($writer)))
                        .with(filter)
                        .try_init(),
                    LogFormat::Compact => tracing_subscriber::registry()
                        .with(configure_layer!(fmt::layer().compact().with_writer($writer)))
                        .with(filter)
                        .try_init(),
                    LogFormat::Full => tracing_subscriber::registry()
                        .with(configure_layer!(fmt::layer().with_writer($writer)))
                        .with(filter)
                        .try_init(),
                    LogFormat::Pretty => tracing_subscriber::registry()
                        .with(configure_layer!(fmt::layer().pretty().with_writer($writer)))
                        .with(filter)
                        .try_init(),
                }
            };
        }

        match self.output {
            LogOutput::Stdout => init_with_writer!(std::io::stdout),
            LogOutput::Stderr => init_with_writer!(std::io::stderr),
            LogOutput::File => match &self.file_path {
                Some(path) => {
                    let dir = path.parent().unwrap_or_else(|| Path::new("."));
                    let file = path.file_name().unwrap_or_else(|| OsStr::new("resmesh.log"));
                    let appender = match self.rotation {
                        LogRotation::Never => rolling::never(dir, file),
                        LogRotation::Hourly => rolling::hourly(dir, file),
                        LogRotation::Daily => rolling::daily(dir, file),
                    };
                    init_with_writer!(appender)
                }
                None => {
                    let result = init_with_writer!(std::io::stdout);
                    warn!("File output requested without a file path, logging to stdout");
                    result
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LogLevel, SpanEventConfig};
    use std::collections::HashMap;

    #[test]
    fn test_from_config() {
        let config = LoggingConfig {
            level: LogLevel::Debug,
            filters: HashMap::from([
                ("resmesh_transport".to_string(), LogLevel::Warn),
                ("resmesh_framework".to_string(), LogLevel::Trace),
            ]),
            span_events: SpanEventConfig {
                new: true,
                close: true,
                ..Default::default()
            },
            file_location: true,
            ..Default::default()
        };

        let builder = LoggingBuilder::from_config(&config);
        assert_eq!(builder.level, Some(tracing::Level::DEBUG));
        assert_eq!(
            builder.directives,
            vec!["resmesh_framework=trace", "resmesh_transport=warn"]
        );
        assert_eq!(builder.span_events, SpanEvents::LIFECYCLE);
        assert!(builder.with_file && builder.with_line_number);
        assert!(builder.with_target);
    }

    #[test]
    fn test_span_event_flags() {
        assert_eq!(SpanEvents::NONE.to_fmt_span(), fmt::format::FmtSpan::NONE);
        assert_eq!(SpanEvents::FULL.to_fmt_span(), fmt::format::FmtSpan::FULL);
    }
}
