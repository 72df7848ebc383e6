use crate::storage::StorageConfig;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Environment variable naming an optional configuration file
pub const CONFIG_PATH_ENV: &str = "COST_STORE_CONFIG";

/// Comma-separated endpoint list that replaces the configured ones
pub const ENDPOINT_OVERRIDE_ENV: &str = "OVERRIDE_STORAGE_ENDPOINT";

const DEFAULT_CONFIG_PATH: &str = "config/cost-event-store.toml";

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Search-engine storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from the embedded defaults, an optional file and
    /// the environment
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&config_path)
    }

    /// Same as [`Config::load`] with an explicit file path
    pub fn load_from(config_path: &str) -> Result<Self, config::ConfigError> {
        let mut config: Config = config::Config::builder()
            // Start with default values
            .add_source(config::File::from_str(
                include_str!("../config/default.toml"),
                config::FileFormat::Toml,
            ))
            // Override with config file if it exists
            .add_source(config::File::with_name(config_path).required(false))
            // Override with environment variables (prefix: COST_STORE_)
            .add_source(
                config::Environment::with_prefix("COST_STORE")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("storage.endpoints"),
            )
            .build()?
            .try_deserialize()?;

        if let Ok(endpoints) = std::env::var(ENDPOINT_OVERRIDE_ENV) {
            config.apply_endpoint_override(&endpoints);
        }

        Ok(config)
    }

    /// Replace the storage endpoints with a comma-separated list.
    /// Blank input leaves them unchanged.
    pub fn apply_endpoint_override(&mut self, endpoints: &str) {
        let endpoints: Vec<String> = endpoints
            .split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(str::to_string)
            .collect();

        if !endpoints.is_empty() {
            info!(endpoints = ?endpoints, "Overriding storage endpoints");
            self.storage.endpoints = endpoints;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default)]
    pub json_logs: bool,

    /// Service name
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
            service_name: default_service_name(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_service_name() -> String {
    "cost-event-store".to_string()
}
