//! Error types for the resmesh framework.

use resmesh_core::{PatternError, TransportError};
use thiserror::Error;

/// Errors raised while registering handlers. These abort service startup.
#[derive(Debug, Clone, Error)]
pub enum RegistrationError {
    /// The resource pattern or group template is malformed.
    #[error(transparent)]
    Pattern(#[from] PatternError),

    /// The pattern is ambiguous with an already registered one.
    #[error("conflicting registration for '{pattern}': {reason}")]
    ConflictingRegistration {
        /// The pattern being registered.
        pattern: String,
        /// What it conflicts with.
        reason: String,
    },

    /// A group template references a tag that is not a placeholder of the pattern.
    #[error("group template '{template}' of '{pattern}' references unknown tag '{tag}'")]
    UnknownGroupTag {
        /// The pattern being registered.
        pattern: String,
        /// The group template.
        template: String,
        /// The unbound tag.
        tag: String,
    },

    /// The service name cannot prefix resource names.
    #[error("invalid service name '{0}'")]
    InvalidServiceName(String),
}

/// Errors raised when a task cannot be queued on a group lane.
#[derive(Debug, Clone, Error)]
pub enum SchedulerError {
    /// The lane already holds the configured maximum of pending tasks.
    #[error("queue of group '{group}' is full ({depth} pending)")]
    QueueFull {
        /// The group key.
        group: String,
        /// Number of pending tasks.
        depth: usize,
    },
}

/// Errors raised when emitting an event.
#[derive(Debug, Clone, Error)]
pub enum EventError {
    /// The custom event name is empty, reserved or contains separators.
    #[error("invalid event name: {0}")]
    InvalidName(String),

    /// A collection index is out of range.
    #[error("index {idx} out of range for collection of length {len}")]
    OutOfRange {
        /// The requested index.
        idx: usize,
        /// The collection length.
        len: usize,
    },

    /// The resource already exists.
    #[error("resource '{0}' is already created")]
    AlreadyCreated(String),

    /// The resource does not exist.
    #[error("resource '{0}' is not created")]
    NotCreated(String),

    /// The event does not fit the resource type.
    #[error("{event} event not applicable to resource '{rid}'")]
    TypeMismatch {
        /// The event name.
        event: &'static str,
        /// The resource ID.
        rid: String,
    },

    /// Event data cannot represent a resource value.
    #[error("invalid event data: {0}")]
    InvalidData(String),

    /// A token event was requested without a connection ID.
    #[error("missing connection ID")]
    MissingCid,

    /// The connection ID cannot be used in a subject.
    #[error("invalid connection ID '{0}'")]
    InvalidCid(String),

    /// The resource context is not running on its group lane.
    #[error("resource '{0}' is not bound to its group lane")]
    Detached(String),

    /// An apply function refused the event.
    #[error("event rejected: {0}")]
    Rejected(String),

    /// The payload could not be encoded.
    #[error("failed to encode event: {0}")]
    Encode(String),

    /// Publishing the event failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl EventError {
    /// Creates a rejection error for apply functions.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected(reason.into())
    }
}

/// Errors raised by [`Service`](crate::Service) operations.
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    /// No handler is registered for the resource.
    #[error("no handler for resource '{0}'")]
    NotFound(String),

    /// The resource name is malformed.
    #[error("invalid resource name: {0}")]
    InvalidResourceName(String),

    /// The task could not be queued.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// The bus failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Publishing an event failed.
    #[error(transparent)]
    Event(#[from] EventError),

    /// `serve` was called on a service that is already serving.
    #[error("service is already serving")]
    AlreadyServing,
}

/// Result type for service operations.
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Result type for event emission.
pub type EventResult<T> = Result<T, EventError>;
