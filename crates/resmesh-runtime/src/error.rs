//! Runtime error types.

use resmesh_framework::{RegistrationError, ServiceError};
use thiserror::Error;

use crate::config::ConfigError;

/// Errors that can occur during runtime operations.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Loading or validating the configuration failed.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A handler could not be registered.
    #[error("Failed to register handler: {0}")]
    Registration(#[from] RegistrationError),

    /// Serving failed.
    #[error("Service error: {0}")]
    Service(#[from] ServiceError),
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
