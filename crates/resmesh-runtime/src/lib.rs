//! Resmesh Runtime - process surface of a resmesh service.
//!
//! This crate provides:
//! - Layered configuration loading (`config`)
//! - Logging setup over `tracing-subscriber` (`logging`)
//! - `ServiceRuntime`, which serves a service until a shutdown signal and
//!   then drains its group lanes
//!
//! ```ignore
//! use std::sync::Arc;
//! use resmesh_runtime::ServiceRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = ServiceRuntime::builder()
//!         .build(|service| service.handle("book.$id", book_handler()))?;
//!
//!     let bus = runtime.local_bus();
//!     runtime.run(Arc::new(bus)).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod runtime;

pub use config::{ConfigError, ConfigLoader, ConfigResult, LoggingConfig, ResmeshConfig, ServiceConfig};
pub use error::{RuntimeError, RuntimeResult};
pub use logging::{LoggingBuilder, SpanEvents};
pub use runtime::{RuntimeBuilder, ServiceRuntime};

// Re-export tracing for use by other crates
pub use tracing;
pub use tracing_subscriber;

/// Logging macros for application code.
pub mod prelude {
    pub use tracing::{Level, debug, error, info, instrument, span, trace, warn};
}
