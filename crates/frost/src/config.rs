//! Configuration management for the Frost host.
//!
//! Configuration is read from a TOML file; a default file is written when none
//! exists. Command-line options are applied on top and the result is validated
//! before anything is loaded.

use crate::cli::CliArgs;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use shard_system::shard_api::RemoteRepository;
use shard_system::{ManagerConfig, ResolverConfig};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub resolver: ResolverSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Filesystem layout.
///
/// `shard_directory` and `store_directory` are relative to `data_directory`
/// unless absolute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_data_directory")]
    pub data_directory: String,
    #[serde(default = "default_shard_directory")]
    pub shard_directory: String,
    /// Where local key/value stores are persisted
    #[serde(default = "default_store_directory")]
    pub store_directory: String,
}

fn default_data_directory() -> String {
    "data".to_string()
}

fn default_shard_directory() -> String {
    "shards".to_string()
}

fn default_store_directory() -> String {
    "store".to_string()
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            data_directory: default_data_directory(),
            shard_directory: default_shard_directory(),
            store_directory: default_store_directory(),
        }
    }
}

/// Library resolution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolverSettings {
    /// Local artifact cache, relative to the data directory unless absolute
    #[serde(default = "default_cache_directory")]
    pub cache_directory: String,
    /// Extra default repositories; Maven Central is always tried last
    #[serde(default)]
    pub repositories: Vec<String>,
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_cache_directory() -> String {
    "libraries".to_string()
}

fn default_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            cache_directory: default_cache_directory(),
            repositories: Vec::new(),
            attempts: default_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Logging system configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    #[serde(default = "default_level")]
    pub level: String,
    /// Whether to output logs in JSON format
    #[serde(default)]
    pub json_format: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            json_format: false,
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, writes the default configuration to `path`
    /// and returns it.
    pub async fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let config: AppConfig =
                toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content)
                .await
                .with_context(|| format!("writing default config to {}", path.display()))?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Applies command-line overrides.
    pub fn apply_cli(&mut self, args: &CliArgs) {
        if let Some(data_dir) = &args.data_dir {
            self.server.data_directory = data_dir.to_string_lossy().to_string();
        }
        if let Some(shard_dir) = &args.shard_dir {
            self.server.shard_directory = shard_dir.to_string_lossy().to_string();
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
        if args.json_logs {
            self.logging.json_format = true;
        }
    }

    /// Validates the configuration for consistency and correctness.
    ///
    /// # Returns
    ///
    /// `Ok(())` if the configuration is valid, or an error string describing the issue.
    pub fn validate(&self) -> Result<(), String> {
        if self.server.data_directory.trim().is_empty() {
            return Err("Data directory cannot be empty".to_string());
        }
        if self.server.shard_directory.trim().is_empty() {
            return Err("Shard directory cannot be empty".to_string());
        }
        if self.server.store_directory.trim().is_empty() {
            return Err("Store directory cannot be empty".to_string());
        }
        if self.resolver.cache_directory.trim().is_empty() {
            return Err("Library cache directory cannot be empty".to_string());
        }

        for repository in &self.resolver.repositories {
            if !(repository.starts_with("https://") || repository.starts_with("http://")) {
                return Err(format!("Invalid repository URL: {}", repository));
            }
        }
        if self.resolver.attempts == 0 {
            return Err("Resolver attempts must be at least 1".to_string());
        }
        if self.resolver.timeout_secs == 0 {
            return Err("Resolver timeout must be greater than zero".to_string());
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        Ok(())
    }

    pub fn data_directory(&self) -> PathBuf {
        PathBuf::from(&self.server.data_directory)
    }

    pub fn store_directory(&self) -> PathBuf {
        self.data_directory().join(&self.server.store_directory)
    }

    /// The manager configuration described by this file.
    pub fn to_manager_config(&self) -> ManagerConfig {
        let data_directory = self.data_directory();

        let mut repositories: Vec<RemoteRepository> = self
            .resolver
            .repositories
            .iter()
            .map(RemoteRepository::new)
            .collect();
        let central = RemoteRepository::maven_central();
        if !repositories.iter().any(|repository| repository.url == central.url) {
            repositories.push(central);
        }

        ManagerConfig {
            shard_directory: data_directory.join(&self.server.shard_directory),
            resolver: ResolverConfig {
                local_repository: data_directory.join(&self.resolver.cache_directory),
                default_repositories: repositories,
                attempts: self.resolver.attempts,
                retry_backoff: Duration::from_millis(self.resolver.retry_backoff_ms),
                timeout: Duration::from_secs(self.resolver.timeout_secs),
            },
            data_directory,
        }
    }
}
