//! Configuration loader using figment.
//!
//! Sources are layered, later ones override earlier ones:
//!
//! 1. Built-in defaults
//! 2. Programmatic merges ([`ConfigLoader::merge`])
//! 3. Profile-specific config file (`resmesh.{profile}.toml` / `resmesh.{profile}.yaml`)
//! 4. Main config file (`resmesh.toml` / `resmesh.yaml`)
//! 5. Environment variables (`RESMESH_*`)
//!
//! # Feature Flags
//!
//! - `toml-config` *(default)*: enables TOML configuration files
//! - `yaml-config`: enables YAML configuration files
//!
//! # Environment Variable Mapping
//!
//! Variables use the `RESMESH_` prefix with `__` as the nesting separator:
//!
//! - `RESMESH_SERVICE__NAME=library` → `service.name = "library"`
//! - `RESMESH_SERVICE__MAX_QUEUE_DEPTH=64` → `service.max_queue_depth = 64`
//! - `RESMESH_LOGGING__LEVEL=debug` → `logging.level = "debug"`
//!
//! # Example
//!
//! ```rust,ignore
//! use resmesh_runtime::config::ConfigLoader;
//!
//! let config = ConfigLoader::new().profile("production").load()?;
//!
//! let config = ConfigLoader::new()
//!     .file("./deploy/resmesh.toml")
//!     .without_env()
//!     .load()?;
//! ```

use std::path::{Path, PathBuf};

use figment::Figment;
#[cfg(any(feature = "yaml-config", feature = "toml-config"))]
use figment::providers::Format;
#[cfg(feature = "toml-config")]
use figment::providers::Toml;
#[cfg(feature = "yaml-config")]
use figment::providers::Yaml;
use figment::providers::{Env, Serialized};
use tracing::{debug, info, trace};

use super::error::{ConfigError, ConfigResult};
use super::schema::ResmeshConfig;

/// Prefix of configuration environment variables.
pub const ENV_PREFIX: &str = "RESMESH_";

/// Environment variable selecting the profile.
pub const PROFILE_ENV: &str = "RESMESH_PROFILE";

/// Configuration profile for environment-specific settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Profile {
    /// Development profile (default).
    #[default]
    Development,
    /// Production profile.
    Production,
    /// Custom profile name.
    Custom(String),
}

impl Profile {
    /// Returns the profile name as a string.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Custom(name) => name,
        }
    }

    /// Parses a profile name. `dev` and `prod` are accepted as short forms.
    pub fn parse(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "production" | "prod" => Self::Production,
            "development" | "dev" => Self::Development,
            other => Self::Custom(other.to_string()),
        }
    }

    /// Reads the profile from `RESMESH_PROFILE`, defaulting to development.
    pub fn from_env() -> Self {
        std::env::var(PROFILE_ENV)
            .map(|p| Self::parse(&p))
            .unwrap_or_default()
    }
}

impl std::fmt::Display for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration loader with figment-based multi-source support.
pub struct ConfigLoader {
    figment: Figment,
    profile: Profile,
    search_paths: Vec<PathBuf>,
    load_env: bool,
    config_file: Option<PathBuf>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Creates a loader reading the profile from the environment.
    pub fn new() -> Self {
        Self {
            figment: Figment::new(),
            profile: Profile::from_env(),
            search_paths: Vec::new(),
            load_env: true,
            config_file: None,
        }
    }

    /// Sets the configuration profile.
    pub fn profile(mut self, profile: impl AsRef<str>) -> Self {
        self.profile = Profile::parse(profile.as_ref());
        self
    }

    /// Adds a search path for configuration files.
    pub fn search_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.search_paths.push(path.as_ref().to_path_buf());
        self
    }

    /// Adds the current directory to the search paths.
    pub fn with_current_dir(self) -> Self {
        match std::env::current_dir() {
            Ok(cwd) => self.search_path(cwd),
            Err(_) => self,
        }
    }

    /// Adds the user config directory (`<config>/resmesh`) to the search paths.
    pub fn with_user_config_dir(self) -> Self {
        match dirs::config_dir() {
            Some(dir) => self.search_path(dir.join("resmesh")),
            None => self,
        }
    }

    /// Loads exactly this file instead of searching.
    pub fn file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Enables environment variables (the default).
    pub fn with_env(mut self) -> Self {
        self.load_env = true;
        self
    }

    /// Disables environment variables.
    pub fn without_env(mut self) -> Self {
        self.load_env = false;
        self
    }

    /// Merges configuration programmatically, below files and environment.
    pub fn merge(mut self, config: ResmeshConfig) -> Self {
        self.figment = self.figment.merge(Serialized::defaults(config));
        self
    }

    /// Loads the configuration.
    pub fn load(self) -> ConfigResult<ResmeshConfig> {
        let profile = self.profile.clone();
        let figment = self.build_figment()?;

        let config: ResmeshConfig = figment
            .extract()
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!(
            profile = %profile,
            service = %config.service.name,
            logging_level = %config.logging.level,
            "Configuration loaded"
        );
        Ok(config)
    }

    fn build_figment(mut self) -> ConfigResult<Figment> {
        let mut figment = Figment::from(Serialized::defaults(ResmeshConfig::default()));
        figment = figment.merge(std::mem::take(&mut self.figment));

        if let Some(path) = &self.config_file {
            if !path.exists() {
                return Err(ConfigError::FileNotFound(path.clone()));
            }
            info!(path = %path.display(), "Loading configuration file");
            figment = merge_config_file(figment, path)?;
        } else {
            figment = self.load_config_files(figment);
        }

        if self.load_env {
            trace!(prefix = ENV_PREFIX, "Loading environment variables");
            figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
        }
        Ok(figment)
    }

    fn resolve_search_paths(&self) -> Vec<PathBuf> {
        if !self.search_paths.is_empty() {
            return self.search_paths.clone();
        }
        let mut paths = Vec::new();
        if let Ok(cwd) = std::env::current_dir() {
            paths.push(cwd);
        }
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("resmesh"));
        }
        paths
    }

    /// Merges the first directory's files for one format: the profile file
    /// if present, then the main file. Returns whether a main file was found.
    #[cfg(any(feature = "toml-config", feature = "yaml-config"))]
    fn load_format_files<F>(
        &self,
        mut figment: Figment,
        search_paths: &[PathBuf],
        extensions: &[&str],
        merge_fn: F,
    ) -> (Figment, bool)
    where
        F: Fn(Figment, &Path) -> Figment,
    {
        for dir in search_paths {
            for ext in extensions {
                let profile_path = dir.join(format!("resmesh.{}.{ext}", self.profile));
                if profile_path.exists() {
                    debug!(path = %profile_path.display(), "Loading profile configuration");
                    figment = merge_fn(figment, &profile_path);
                }

                let main_path = dir.join(format!("resmesh.{ext}"));
                if main_path.exists() {
                    info!(path = %main_path.display(), "Loading configuration file");
                    return (merge_fn(figment, &main_path), true);
                }
            }
        }
        (figment, false)
    }

    #[allow(unused_mut)]
    fn load_config_files(&self, mut figment: Figment) -> Figment {
        let search_paths = self.resolve_search_paths();
        let mut found = false;

        #[cfg(feature = "toml-config")]
        {
            let (f, ok) = self.load_format_files(figment, &search_paths, &["toml"], |fig, path| {
                fig.merge(Toml::file(path))
            });
            figment = f;
            found |= ok;
        }

        #[cfg(feature = "yaml-config")]
        {
            let (f, ok) =
                self.load_format_files(figment, &search_paths, &["yaml", "yml"], |fig, path| {
                    fig.merge(Yaml::file(path))
                });
            figment = f;
            found |= ok;
        }

        if !found {
            debug!(paths = ?search_paths, "No configuration file found, using defaults");
        }
        figment
    }
}

fn merge_config_file(figment: Figment, path: &Path) -> ConfigResult<Figment> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    match ext {
        #[cfg(feature = "toml-config")]
        "toml" => Ok(figment.merge(Toml::file(path))),
        #[cfg(feature = "yaml-config")]
        "yaml" | "yml" => Ok(figment.merge(Yaml::file(path))),
        _ => Err(ConfigError::ParseError(format!(
            "Unsupported or disabled configuration file format: .{ext}"
        ))),
    }
}

/// Loads the configuration from the default locations.
pub fn load_config() -> ConfigResult<ResmeshConfig> {
    ConfigLoader::new().load()
}

/// Loads the configuration from `path`, with environment overrides.
pub fn load_config_from_file<P: AsRef<Path>>(path: P) -> ConfigResult<ResmeshConfig> {
    ConfigLoader::new().file(path).load()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;

    #[test]
    fn test_default_config() {
        let config = ConfigLoader::new()
            .search_path(std::env::temp_dir().join("resmesh-missing"))
            .without_env()
            .load()
            .unwrap();

        assert_eq!(config.logging.level.as_str(), "info");
        assert_eq!(config.service.name, "resmesh");
    }

    #[test]
    fn test_programmatic_merge() {
        let mut overrides = ResmeshConfig::default();
        overrides.service.name = "library".into();
        overrides.logging.level = LogLevel::Debug;

        let config = ConfigLoader::new()
            .search_path(std::env::temp_dir().join("resmesh-missing"))
            .without_env()
            .merge(overrides)
            .load()
            .unwrap();

        assert_eq!(config.service.name, "library");
        assert_eq!(config.logging.level, LogLevel::Debug);
    }

    #[test]
    fn test_missing_file() {
        let result = ConfigLoader::new()
            .file("/nonexistent/resmesh.toml")
            .without_env()
            .load();
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[cfg(feature = "toml-config")]
    #[test]
    fn test_profile_file_under_main_file() {
        let dir = std::env::temp_dir().join(format!("resmesh-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("resmesh.toml"),
            "[service]\nname = \"library\"\n",
        )
        .unwrap();
        std::fs::write(
            dir.join("resmesh.production.toml"),
            "[service]\nname = \"ignored\"\nmax_queue_depth = 8\n",
        )
        .unwrap();

        let config = ConfigLoader::new()
            .profile("prod")
            .search_path(&dir)
            .without_env()
            .load()
            .unwrap();
        std::fs::remove_dir_all(&dir).ok();

        assert_eq!(config.service.name, "library");
        assert_eq!(config.service.max_queue_depth, Some(8));
    }

    #[test]
    fn test_profile_parse() {
        assert_eq!(Profile::parse("PROD"), Profile::Production);
        assert_eq!(Profile::parse("dev"), Profile::Development);
        assert_eq!(Profile::parse("staging").as_str(), "staging");
    }
}
