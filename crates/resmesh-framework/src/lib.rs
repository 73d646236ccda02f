//! # Resmesh Framework
//!
//! Building blocks of a resource service on top of [`resmesh_core`].
//!
//! This layer provides:
//! - [`Handler`] registration with capabilities, sub-methods and apply
//!   functions
//! - Pattern routing with placeholders and wildcards ([`Router`])
//! - Per-group serial execution with bounded concurrency ([`GroupScheduler`])
//! - Request views with single-reply enforcement ([`AccessRequest`],
//!   [`GetRequest`], [`CallRequest`], [`AuthRequest`])
//! - Event emission on [`Resource`] contexts and an optional [`ValueCache`]
//! - The [`Service`] that ties them to a bus [`Connection`](resmesh_core::Connection)

pub mod apply;
pub mod error;
pub mod handler;
pub mod options;
pub mod request;
pub mod resource;
pub mod router;
pub mod scheduler;
pub mod service;

#[cfg(test)]
pub(crate) mod testing;

pub use apply::{CachedValue, ValueCache};
pub use error::{
    EventError, EventResult, RegistrationError, SchedulerError, ServiceError, ServiceResult,
};
pub use handler::{
    ApplyAddFn, ApplyChangeFn, ApplyCreateFn, ApplyCustomFn, ApplyDeleteFn, ApplyFns,
    ApplyRemoveFn, BoxFuture, BoxedRequestHandler, Capabilities, Handler, HandlerEntry,
    HandlerResult, NEW_METHOD, RequestHandler, ResourceType,
};
pub use options::{AccessFallback, ServiceOptions};
pub use request::{AccessRequest, AuthRequest, CallRequest, GetRequest, RequestState};
pub use resource::Resource;
pub use router::{Match, Router};
pub use scheduler::{GroupScheduler, OverflowPolicy, SchedulerOptions, Task};
pub use service::{Service, ServiceBuilder, ServiceHook};

/// Prelude for handler code.
pub mod prelude {
    pub use super::{
        AccessRequest, AuthRequest, CallRequest, GetRequest, Handler, HandlerResult, Resource,
        Service, ServiceOptions, ValueCache,
    };
    pub use resmesh_core::prelude::*;
}
