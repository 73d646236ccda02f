//! # Resmesh Core
//!
//! Foundation types of the resmesh resource service framework.
//!
//! This crate holds everything that is shared between the framework, the bus
//! implementations and application code, without any scheduling or dispatch
//! logic of its own:
//!
//! - **Errors**: the protocol error value [`ResError`] and the plumbing error
//!   enums ([`TransportError`], [`ProtocolError`], [`PatternError`])
//! - **Protocol**: request subjects, the inbound [`RequestEnvelope`] and the
//!   outbound reply [`frame`]s
//! - **Events**: [`ResourceEvent`] payloads and protocol value helpers
//!   ([`Ref`], [`DataValue`], [`ResetEvent`])
//! - **Patterns**: [`ResourcePattern`] and [`GroupTemplate`] parsing
//! - **Transport**: the [`Connection`] contract a message bus must fulfil
//!
//! ## Example
//!
//! ```rust,ignore
//! use resmesh_core::{RequestSubject, RequestKind, ResourcePattern};
//!
//! let subject = RequestSubject::parse("call.library.book.42.set")?;
//! assert_eq!(subject.kind, RequestKind::Call);
//! assert_eq!(subject.method.as_deref(), Some("set"));
//!
//! let pattern = ResourcePattern::parse("library.book.$id")?;
//! assert_eq!(pattern.placeholders().collect::<Vec<_>>(), vec!["id"]);
//! ```

pub mod error;
pub mod event;
pub mod pattern;
pub mod protocol;
pub mod transport;

pub use error::{
    CODE_ACCESS_DENIED, CODE_INTERNAL_ERROR, CODE_INVALID_PARAMS, CODE_INVALID_QUERY,
    CODE_METHOD_NOT_FOUND, CODE_NOT_FOUND, CODE_TIMEOUT, PatternError, ProtocolError,
    ProtocolResult, ResError, TransportError, TransportResult,
};
pub use event::{
    DataValue, RESERVED_EVENT_NAMES, Ref, ResetEvent, ResourceEvent, TokenEvent, delete_action,
    is_delete_action, validate_event_name,
};
pub use pattern::{
    GroupTemplate, PathParams, PatternToken, ResourcePattern, validate_resource_name,
    validate_subject_pattern,
};
pub use protocol::{
    RequestEnvelope, RequestKind, RequestSubject, ResponseFrame, SYSTEM_RESET_SUBJECT,
    event_subject, frame, request_subscriptions, token_subject,
};
pub use transport::{BoxedConnection, Connection, InboundMessage, Subscription};

/// Prelude for common imports.
pub mod prelude {
    pub use super::error::ResError;
    pub use super::event::{DataValue, Ref, delete_action};
    pub use super::pattern::PathParams;
    pub use super::protocol::RequestKind;
    pub use super::transport::{BoxedConnection, Connection, InboundMessage};
}
