//! # Resmesh
//!
//! Resource services over a publish/subscribe message bus.
//!
//! ## Overview
//!
//! A service owns every resource whose ID starts with its name. A gateway
//! forwards client requests for those resources as bus requests, and the
//! service answers them through handlers registered per resource pattern.
//! Changes are announced as events the gateway fans out to subscribed
//! clients.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────┐  get/call/auth/access  ┌───────────┐     ┌──────────────────────────────┐
//! │ Gateway │───────────────────────▶│  Service  │────▶│ group "library.book.1" lane  │──▶ handler
//! │         │◀───────────────────────│ (Router)  │────▶│ group "library.book.2" lane  │──▶ handler
//! └─────────┘   replies and events   └───────────┘     └──────────────────────────────┘
//! ```
//!
//! - **Router**: matches resource IDs against patterns with `$placeholders`
//!   and a trailing `>` wildcard
//! - **Handlers**: async functions per request kind and call method
//! - **Lanes**: requests and tasks of one group run one at a time, in order
//! - **Events**: change, add, remove, create, delete, reaccess and custom
//!   events published on `event.<rid>.<name>`
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use resmesh::prelude::*;
//!
//! async fn get_book(req: GetRequest) -> HandlerResult {
//!     let id = req.path_param("id").unwrap_or_default();
//!     req.model(&serde_json::json!({ "id": id })).await;
//!     Ok(())
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = ServiceRuntime::builder()
//!         .build(|service| service.handle("book.$id", Handler::new().get_model(get_book)))?;
//!
//!     let bus = runtime.local_bus();
//!     runtime.run(Arc::new(bus)).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `toml-config` *(default)*: TOML configuration files
//! - `yaml-config`: YAML configuration files
//! - `json-log`: JSON log output
//! - `local-bus` *(default)*: the in-process [`LocalBus`](transport::LocalBus)

pub use resmesh_core as core;
pub use resmesh_framework as framework;
pub use resmesh_runtime as runtime;
pub use resmesh_transport as transport;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use resmesh::prelude::*;
/// ```
pub mod prelude {
    // Runtime - main entry point
    pub use resmesh_runtime::{ResmeshConfig, ServiceRuntime};

    // Service and handler registration
    pub use resmesh_framework::{
        AccessFallback, Handler, HandlerResult, OverflowPolicy, Service, ServiceBuilder,
        ServiceOptions, ValueCache,
    };

    // Request views and resource contexts
    pub use resmesh_framework::{AccessRequest, AuthRequest, CallRequest, GetRequest, Resource};

    // Protocol values
    pub use resmesh_core::{
        BoxedConnection, Connection, DataValue, Ref, ResError, delete_action,
    };

    // In-process bus
    #[cfg(feature = "local-bus")]
    pub use resmesh_transport::LocalBus;
}
