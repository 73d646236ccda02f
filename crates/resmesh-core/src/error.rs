//! Unified error types for the resmesh core.
//!
//! [`ResError`] is the protocol-level error value carried inside error frames.
//! The remaining enums describe failures of the surrounding plumbing: the bus
//! connection, the wire codec, and resource pattern parsing.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

// =============================================================================
// Protocol error codes
// =============================================================================

/// The requested resource or handler does not exist.
pub const CODE_NOT_FOUND: &str = "system.notFound";
/// The call or auth method does not exist on the resource.
pub const CODE_METHOD_NOT_FOUND: &str = "system.methodNotFound";
/// The parameters of a call or auth request are invalid.
pub const CODE_INVALID_PARAMS: &str = "system.invalidParams";
/// The query of a get request is invalid.
pub const CODE_INVALID_QUERY: &str = "system.invalidQuery";
/// The caller is not allowed to access the resource.
pub const CODE_ACCESS_DENIED: &str = "system.accessDenied";
/// An uncaught fault occurred while handling the request.
pub const CODE_INTERNAL_ERROR: &str = "system.internalError";
/// The request timed out.
pub const CODE_TIMEOUT: &str = "system.timeout";

// =============================================================================
// ResError
// =============================================================================

/// A structured protocol error: `{code, message, data?}`.
///
/// Handlers return a `ResError` (through `anyhow`) to produce an error frame
/// with an explicit code. Any other error type is treated as an internal fault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{message} ({code})")]
pub struct ResError {
    /// Dot-separated error code, e.g. `system.notFound`.
    pub code: String,
    /// Human readable message.
    pub message: String,
    /// Optional additional data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResError {
    /// Creates an error with a custom code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            data: None,
        }
    }

    /// Attaches additional data to the error.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// `system.notFound`.
    pub fn not_found() -> Self {
        Self::new(CODE_NOT_FOUND, "Not found")
    }

    /// `system.methodNotFound`.
    pub fn method_not_found() -> Self {
        Self::new(CODE_METHOD_NOT_FOUND, "Method not found")
    }

    /// `system.invalidParams` with the default message.
    pub fn invalid_params() -> Self {
        Self::new(CODE_INVALID_PARAMS, "Invalid parameters")
    }

    /// `system.invalidQuery` with the default message.
    pub fn invalid_query() -> Self {
        Self::new(CODE_INVALID_QUERY, "Invalid query")
    }

    /// `system.accessDenied`.
    pub fn access_denied() -> Self {
        Self::new(CODE_ACCESS_DENIED, "Access denied")
    }

    /// `system.internalError` with the default message.
    pub fn internal() -> Self {
        Self::new(CODE_INTERNAL_ERROR, "Internal error")
    }

    /// `system.internalError` describing the underlying fault.
    pub fn internal_from(reason: impl std::fmt::Display) -> Self {
        Self::new(CODE_INTERNAL_ERROR, format!("Internal error: {reason}"))
    }

    /// `system.timeout`.
    pub fn timeout() -> Self {
        Self::new(CODE_TIMEOUT, "Request timeout")
    }

    /// Returns `true` if the error carries the given code.
    pub fn is(&self, code: &str) -> bool {
        self.code == code
    }
}

// =============================================================================
// Transport Errors
// =============================================================================

/// Errors raised by a bus [`Connection`](crate::transport::Connection).
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// No connection is available.
    #[error("not connected")]
    NotConnected,

    /// The connection has been closed.
    #[error("connection closed")]
    Closed,

    /// Publishing a message failed.
    #[error("failed to publish to '{subject}': {reason}")]
    PublishFailed {
        /// The subject being published to.
        subject: String,
        /// Reason for failure.
        reason: String,
    },

    /// Subscribing failed.
    #[error("failed to subscribe to '{subject}': {reason}")]
    SubscribeFailed {
        /// The subject pattern.
        subject: String,
        /// Reason for failure.
        reason: String,
    },

    /// The subject is not a valid bus subject.
    #[error("invalid subject: '{0}'")]
    InvalidSubject(String),

    /// A request did not receive a reply in time.
    #[error("request to '{subject}' timed out")]
    RequestTimeout {
        /// The request subject.
        subject: String,
    },
}

// =============================================================================
// Protocol Errors
// =============================================================================

/// Errors raised while decoding or encoding protocol messages.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    /// The inbound subject is not a request subject.
    #[error("invalid request subject: '{0}'")]
    InvalidSubject(String),

    /// The payload could not be decoded.
    #[error("failed to decode payload: {0}")]
    Decode(String),

    /// A value could not be encoded.
    #[error("failed to encode payload: {0}")]
    Encode(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            Self::Decode(err.to_string())
        } else {
            Self::Encode(err.to_string())
        }
    }
}

// =============================================================================
// Pattern Errors
// =============================================================================

/// Errors raised while parsing a resource pattern or group template.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    /// The pattern is empty.
    #[error("pattern is empty")]
    Empty,

    /// The pattern contains an empty token (consecutive or trailing separators).
    #[error("pattern '{pattern}' contains an empty token")]
    EmptyToken {
        /// The offending pattern.
        pattern: String,
    },

    /// A full wildcard appears before the last token.
    #[error("pattern '{pattern}' has a full wildcard that is not the last token")]
    MisplacedFullWildcard {
        /// The offending pattern.
        pattern: String,
    },

    /// A token is neither a literal, a placeholder, nor a wildcard.
    #[error("pattern '{pattern}' has an invalid token '{token}'")]
    InvalidToken {
        /// The offending pattern.
        pattern: String,
        /// The offending token.
        token: String,
    },

    /// The same placeholder name is bound twice.
    #[error("pattern '{pattern}' binds placeholder '{name}' more than once")]
    DuplicatePlaceholder {
        /// The offending pattern.
        pattern: String,
        /// The duplicated name.
        name: String,
    },

    /// A group template is malformed.
    #[error("invalid group template '{template}': {reason}")]
    InvalidGroup {
        /// The offending template.
        template: String,
        /// Why it was rejected.
        reason: String,
    },
}

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Result type for codec operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;
