//! Configuration schema definitions.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use resmesh_framework::{AccessFallback, OverflowPolicy, SchedulerOptions, ServiceOptions};
use serde::{Deserialize, Serialize};

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResmeshConfig {
    /// The served service.
    #[serde(default)]
    pub service: ServiceConfig,

    /// Logging setup.
    #[serde(default)]
    pub logging: LoggingConfig,
}

// =============================================================================
// Service
// =============================================================================

/// Service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name, the first token of every resource it owns.
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Queue group shared by instances of the service.
    #[serde(default)]
    pub queue_group: Option<String>,

    /// Maximum number of groups handled at the same time.
    #[serde(default)]
    pub worker_limit: Option<usize>,

    /// Maximum number of pending requests per group.
    #[serde(default)]
    pub max_queue_depth: Option<usize>,

    /// What happens when a group queue is full.
    #[serde(default)]
    pub overflow: OverflowPolicy,

    /// Access reply for resources without an access handler.
    #[serde(default)]
    pub access_fallback: AccessFallback,

    /// Resource patterns announced on reset.
    #[serde(default)]
    pub owned_resources: Option<Vec<String>>,

    /// Access patterns announced on reset.
    #[serde(default)]
    pub owned_access: Option<Vec<String>>,

    /// Publish `system.reset` when serving starts.
    #[serde(default = "default_true")]
    pub reset_on_serve: bool,

    /// Buffer size of inbound subscriptions.
    #[serde(default = "default_inbound_buffer")]
    pub inbound_buffer: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            queue_group: None,
            worker_limit: None,
            max_queue_depth: None,
            overflow: OverflowPolicy::default(),
            access_fallback: AccessFallback::default(),
            owned_resources: None,
            owned_access: None,
            reset_on_serve: true,
            inbound_buffer: default_inbound_buffer(),
        }
    }
}

impl ServiceConfig {
    /// Converts to framework service options.
    pub fn to_options(&self) -> ServiceOptions {
        ServiceOptions {
            queue_group: self.queue_group.clone(),
            scheduler: SchedulerOptions {
                worker_limit: self.worker_limit,
                max_queue_depth: self.max_queue_depth,
                overflow: self.overflow,
            },
            access_fallback: self.access_fallback,
            owned_resources: self.owned_resources.clone(),
            owned_access: self.owned_access.clone(),
            no_reset_on_serve: !self.reset_on_serve,
        }
    }
}

fn default_service_name() -> String {
    "resmesh".to_string()
}

fn default_true() -> bool {
    true
}

fn default_inbound_buffer() -> usize {
    1024
}

// =============================================================================
// Logging
// =============================================================================

/// Log verbosity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Returns the level as a filter directive string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    /// Converts to the `tracing` level.
    pub fn to_tracing_level(self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Full,
    Pretty,
    #[cfg(feature = "json-log")]
    Json,
}

/// Log destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
    File,
}

/// Rotation of the log file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    #[default]
    Never,
    Hourly,
    Daily,
}

/// Which span lifecycle events are logged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpanEventConfig {
    pub new: bool,
    pub enter: bool,
    pub exit: bool,
    pub close: bool,
}

/// Logging settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Base level. `RUST_LOG` takes precedence when set.
    pub level: LogLevel,
    pub format: LogFormat,
    pub output: LogOutput,
    /// Log file, required for file output.
    pub file_path: Option<PathBuf>,
    pub rotation: LogRotation,
    /// Per-module levels, e.g. `resmesh_framework = "debug"`.
    pub filters: HashMap<String, LogLevel>,
    pub span_events: SpanEventConfig,
    pub thread_ids: bool,
    /// Include file names and line numbers.
    pub file_location: bool,
}
