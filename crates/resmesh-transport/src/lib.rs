//! # Resmesh Transport
//!
//! Message bus implementations of the [`Connection`](resmesh_core::Connection)
//! contract defined in `resmesh-core`.
//!
//! ## Features
//!
//! - `local-bus` (default): in-process bus with NATS subject semantics
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────┐
//! │  Service            │  (resmesh-framework)
//! ├─────────────────────┤
//! │  resmesh-core       │  (Connection trait)
//! ├─────────────────────┤
//! │  resmesh-transport  │  <- This crate (implementations)
//! ├─────────────────────┤
//! │  Message bus        │
//! └─────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use resmesh_transport::LocalBus;
//!
//! let bus = LocalBus::new();
//! service.serve(Arc::new(bus.clone())).await?;
//!
//! let reply = bus
//!     .request("get.library.book.1", Vec::new(), Duration::from_secs(3))
//!     .await?;
//! ```

#[cfg(feature = "local-bus")]
pub mod local;

#[cfg(feature = "local-bus")]
pub use local::{LocalBus, subject_matches};
