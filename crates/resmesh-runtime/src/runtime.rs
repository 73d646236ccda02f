//! Process lifecycle of a served service.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use resmesh_runtime::ServiceRuntime;
//!
//! // Service name and options come from resmesh.toml / RESMESH_* variables
//! let runtime = ServiceRuntime::builder()
//!     .profile("production")
//!     .build(|service| service.handle("book.$id", book_handler()))?;
//!
//! let bus = runtime.local_bus();
//! runtime.run(Arc::new(bus)).await?;
//! ```

use std::future::Future;
use std::path::Path;

use resmesh_core::BoxedConnection;
use resmesh_framework::{RegistrationError, Service, ServiceBuilder};
#[cfg(feature = "local-bus")]
use resmesh_transport::LocalBus;
use tokio::signal;
use tracing::{error, info, warn};

use crate::config::{ConfigLoader, ResmeshConfig, validate_config};
use crate::error::RuntimeResult;
use crate::logging;

/// Serves a [`Service`] until a shutdown signal arrives, then drains it.
pub struct ServiceRuntime {
    config: ResmeshConfig,
    service: Service,
}

impl ServiceRuntime {
    /// Wraps an already built service.
    ///
    /// Configuration is still loaded from the current directory, but only
    /// its logging section is used.
    pub fn new(service: Service) -> Self {
        let config = ConfigLoader::new()
            .with_current_dir()
            .load()
            .unwrap_or_else(|e| {
                eprintln!("Warning: Failed to load config ({e}), using defaults");
                ResmeshConfig::default()
            });
        logging::init_from_config(&config.logging);
        info!(service = %service.name(), "Runtime initialized");

        Self { config, service }
    }

    /// Creates a runtime builder for custom configuration loading.
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Builds the service described by `config`.
    ///
    /// `register` adds the handlers to a builder named after
    /// `config.service.name`. The service options are taken from the
    /// configuration afterwards.
    pub fn from_config<F>(config: &ResmeshConfig, register: F) -> RuntimeResult<Self>
    where
        F: FnOnce(ServiceBuilder) -> Result<ServiceBuilder, RegistrationError>,
    {
        validate_config(config)?;
        logging::init_from_config(&config.logging);

        let builder = register(Service::builder(config.service.name.as_str()))?;
        let service = builder.options(config.service.to_options()).build()?;

        info!(
            service = %service.name(),
            patterns = service.patterns().count(),
            log_level = %config.logging.level,
            "Runtime initialized from configuration"
        );
        Ok(Self {
            config: config.clone(),
            service,
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ResmeshConfig {
        &self.config
    }

    /// Returns the served service.
    pub fn service(&self) -> &Service {
        &self.service
    }

    /// Creates an in-process bus sized by `service.inbound_buffer`.
    #[cfg(feature = "local-bus")]
    pub fn local_bus(&self) -> LocalBus {
        LocalBus::with_capacity(self.config.service.inbound_buffer)
    }

    /// Serves on `conn` until Ctrl+C or SIGTERM.
    pub async fn run(&self, conn: BoxedConnection) -> RuntimeResult<()> {
        info!("Press Ctrl+C to stop");
        self.run_until(conn, wait_for_shutdown()).await
    }

    /// Serves on `conn` until `shutdown` completes.
    pub async fn run_until<F>(&self, conn: BoxedConnection, shutdown: F) -> RuntimeResult<()>
    where
        F: Future<Output = ()>,
    {
        self.service.serve(conn).await?;
        shutdown.await;

        info!(service = %self.service.name(), "Stopping service");
        self.service.shutdown().await;
        Ok(())
    }
}

/// Waits for Ctrl+C or SIGTERM.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to register SIGTERM handler");
                wait_for_ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    wait_for_ctrl_c().await;
}

async fn wait_for_ctrl_c() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down"),
        Err(e) => {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    }
}

// =============================================================================
// RuntimeBuilder
// =============================================================================

/// Builder for a [`ServiceRuntime`] with custom configuration loading.
pub struct RuntimeBuilder {
    config_loader: ConfigLoader,
}

impl RuntimeBuilder {
    /// Creates a builder searching the current directory.
    pub fn new() -> Self {
        Self {
            config_loader: ConfigLoader::new().with_current_dir(),
        }
    }

    /// Sets a specific configuration file to load.
    pub fn config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.file(path);
        self
    }

    /// Sets the configuration profile.
    pub fn profile(mut self, profile: impl AsRef<str>) -> Self {
        self.config_loader = self.config_loader.profile(profile);
        self
    }

    /// Adds a search path for configuration files.
    pub fn search_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.search_path(path);
        self
    }

    /// Disables environment variables.
    pub fn without_env(mut self) -> Self {
        self.config_loader = self.config_loader.without_env();
        self
    }

    /// Merges configuration programmatically.
    pub fn merge(mut self, config: ResmeshConfig) -> Self {
        self.config_loader = self.config_loader.merge(config);
        self
    }

    /// Loads the configuration and builds the runtime.
    pub fn build<F>(self, register: F) -> RuntimeResult<ServiceRuntime>
    where
        F: FnOnce(ServiceBuilder) -> Result<ServiceBuilder, RegistrationError>,
    {
        let config = self.config_loader.load()?;
        ServiceRuntime::from_config(&config, register)
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
