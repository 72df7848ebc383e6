//! Storage configuration

use crate::storage::error::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Search-engine storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Engine endpoints; the first one is used
    pub endpoints: Vec<String>,

    /// API key sent as a bearer token
    pub api_key: Option<String>,

    /// Prefix for daily partition names (`<prefix>-YYYY-MM-DD`)
    pub index_prefix: String,

    /// Delay between connection probes at startup (milliseconds)
    pub connection_interval_ms: u64,

    /// Maximum time to wait for the engine at startup (milliseconds)
    pub connection_timeout_ms: u64,

    /// Per-request HTTP timeout (seconds)
    pub request_timeout_secs: u64,

    /// Default engine-side hit cap for aggregate queries
    pub search_limit: usize,

    /// Attempts per query call
    pub query_max_attempts: u32,

    /// Backoff unit between query attempts (milliseconds)
    pub query_backoff_ms: u64,

    /// Attempts of the settings submit/verify cycle
    pub settings_max_attempts: u32,

    /// Backoff unit while waiting for settings to apply (milliseconds)
    pub settings_backoff_ms: u64,

    /// Pause between creating a partition and configuring it (milliseconds)
    pub index_creation_delay_ms: u64,

    /// Faceting cap applied with the partition settings
    pub max_values_per_facet: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:7700".to_string()],
            api_key: None,
            index_prefix: "finala".to_string(),
            connection_interval_ms: 5_000,
            connection_timeout_ms: 60_000,
            request_timeout_secs: 30,
            search_limit: 1000,
            query_max_attempts: 3,
            query_backoff_ms: 2_000,
            settings_max_attempts: 5,
            settings_backoff_ms: 3_000,
            index_creation_delay_ms: 2_000,
            max_values_per_facet: 100,
        }
    }
}

impl StorageConfig {
    /// First non-blank endpoint, without a trailing slash
    pub fn endpoint(&self) -> StorageResult<String> {
        self.endpoints
            .iter()
            .map(|e| e.trim())
            .find(|e| !e.is_empty())
            .map(|e| e.trim_end_matches('/').to_string())
            .ok_or_else(|| StorageError::Configuration("no storage endpoint configured".to_string()))
    }

    pub fn connection_interval(&self) -> Duration {
        Duration::from_millis(self.connection_interval_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn query_backoff(&self) -> Duration {
        Duration::from_millis(self.query_backoff_ms)
    }

    pub fn settings_backoff(&self) -> Duration {
        Duration::from_millis(self.settings_backoff_ms)
    }

    pub fn index_creation_delay(&self) -> Duration {
        Duration::from_millis(self.index_creation_delay_ms)
    }

    /// Reject configurations the client cannot work with
    pub fn validate(&self) -> StorageResult<()> {
        if self.endpoints.iter().all(|e| e.trim().is_empty()) {
            return Err(StorageError::Configuration(
                "at least one storage endpoint is required".to_string(),
            ));
        }
        if self.index_prefix.is_empty() {
            return Err(StorageError::Configuration("index_prefix must not be empty".to_string()));
        }
        if self.query_max_attempts == 0 || self.settings_max_attempts == 0 {
            return Err(StorageError::Configuration(
                "attempt ceilings must be at least 1".to_string(),
            ));
        }
        if self.search_limit == 0 {
            return Err(StorageError::Configuration("search_limit must be positive".to_string()));
        }
        Ok(())
    }
}

/// Builder for StorageConfig
pub struct StorageConfigBuilder {
    config: StorageConfig,
}

impl StorageConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: StorageConfig::default(),
        }
    }

    pub fn endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.config.endpoints = endpoints;
        self
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.endpoints = vec![endpoint.into()];
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = Some(key.into());
        self
    }

    pub fn index_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.index_prefix = prefix.into();
        self
    }

    pub fn connection(mut self, interval: Duration, timeout: Duration) -> Self {
        self.config.connection_interval_ms = interval.as_millis() as u64;
        self.config.connection_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn search_limit(mut self, limit: usize) -> Self {
        self.config.search_limit = limit;
        self
    }

    pub fn query_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.config.query_max_attempts = attempts;
        self.config.query_backoff_ms = backoff.as_millis() as u64;
        self
    }

    pub fn settings_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.config.settings_max_attempts = attempts;
        self.config.settings_backoff_ms = backoff.as_millis() as u64;
        self
    }

    pub fn index_creation_delay(mut self, delay: Duration) -> Self {
        self.config.index_creation_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Zero every wait; used by tests and the in-memory engine
    pub fn without_delays(mut self) -> Self {
        self.config.connection_interval_ms = 0;
        self.config.query_backoff_ms = 0;
        self.config.settings_backoff_ms = 0;
        self.config.index_creation_delay_ms = 0;
        self
    }

    pub fn build(self) -> StorageConfig {
        self.config
    }
}

impl Default for StorageConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = StorageConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.index_prefix, "finala");
        assert_eq!(config.settings_max_attempts, 5);
        assert_eq!(config.query_max_attempts, 3);
    }

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let config = StorageConfigBuilder::new()
            .endpoint("http://search.internal:7700/")
            .build();
        assert_eq!(config.endpoint().unwrap(), "http://search.internal:7700");
    }

    #[test]
    fn test_endpoint_skips_blank_entries() {
        let config = StorageConfigBuilder::new()
            .endpoints(vec!["".to_string(), "  ".to_string(), " http://b:7700/ ".to_string()])
            .build();
        assert!(config.validate().is_ok());
        assert_eq!(config.endpoint().unwrap(), "http://b:7700");

        let config = StorageConfigBuilder::new().endpoints(vec![" ".to_string()]).build();
        assert!(config.endpoint().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = StorageConfigBuilder::new().endpoints(vec![]).build();
        assert!(matches!(config.validate(), Err(StorageError::Configuration(_))));

        let config = StorageConfigBuilder::new()
            .query_retry(0, Duration::from_millis(1))
            .build();
        assert!(config.validate().is_err());
    }
}
