//! Configuration module for the resmesh runtime.
//!
//! This module provides layered configuration loading and validation for
//! the served service and the logging setup.

pub mod error;
pub mod loader;
pub mod schema;
pub mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigLoader, Profile, load_config, load_config_from_file};
pub use schema::{
    LogFormat, LogLevel, LogOutput, LogRotation, LoggingConfig, ResmeshConfig, ServiceConfig,
    SpanEventConfig,
};
pub use validation::validate_config;
