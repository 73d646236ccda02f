//! Configuration validation utilities.

use resmesh_core::validate_subject_pattern;

use super::error::{ConfigError, ConfigResult};
use super::schema::{LogOutput, LoggingConfig, ResmeshConfig, ServiceConfig};

/// Validates the entire configuration.
pub fn validate_config(config: &ResmeshConfig) -> ConfigResult<()> {
    validate_service_config(&config.service)?;
    validate_logging_config(&config.logging)?;
    Ok(())
}

/// Validates service settings.
fn validate_service_config(service: &ServiceConfig) -> ConfigResult<()> {
    let name = &service.name;
    if name.is_empty() {
        return Err(ConfigError::missing_field("service.name"));
    }
    if name.contains(['.', '*', '>']) || name.chars().any(char::is_whitespace) {
        return Err(ConfigError::InvalidServiceName(name.clone()));
    }

    if service.worker_limit == Some(0) {
        return Err(ConfigError::validation("Worker limit must be greater than 0"));
    }
    if service.max_queue_depth == Some(0) {
        return Err(ConfigError::validation("Queue depth must be greater than 0"));
    }
    if service.inbound_buffer == 0 {
        return Err(ConfigError::validation("Inbound buffer must be greater than 0"));
    }
    if service.queue_group.as_deref() == Some("") {
        return Err(ConfigError::validation("Queue group cannot be empty"));
    }

    let owned = service.owned_resources.iter().chain(service.owned_access.iter());
    for pattern in owned.flatten() {
        validate_subject_pattern(pattern).map_err(|reason| ConfigError::InvalidPattern {
            pattern: pattern.clone(),
            reason,
        })?;
    }

    Ok(())
}

/// Validates logging settings.
fn validate_logging_config(logging: &LoggingConfig) -> ConfigResult<()> {
    if logging.output == LogOutput::File && logging.file_path.is_none() {
        return Err(ConfigError::missing_field("logging.file_path"));
    }
    if let Some(module) = logging.filters.keys().find(|m| m.is_empty() || m.contains('=')) {
        return Err(ConfigError::validation(format!(
            "Invalid log filter module: '{module}'"
        )));
    }
    Ok(())
}
