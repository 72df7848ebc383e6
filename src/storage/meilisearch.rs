//! HTTP search-engine backend speaking the Meilisearch REST API

use crate::storage::config::StorageConfig;
use crate::storage::document::Document;
use crate::storage::engine::{IndexSettings, SearchEngine, SearchRequest};
use crate::storage::error::{StorageError, StorageResult};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Marker the engine puts in the body of a 400 for an unfilterable attribute
const NOT_FILTERABLE_MARKER: &str = "not filterable";

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    hits: Vec<Document>,
}

/// Search engine reached over HTTP
#[derive(Clone)]
pub struct MeilisearchEngine {
    client: Client,
    host: String,
    api_key: Option<String>,
}

impl MeilisearchEngine {
    /// Build the HTTP client without touching the network
    pub fn new(config: &StorageConfig) -> StorageResult<Self> {
        config.validate()?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| {
                StorageError::Configuration(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            host: config.endpoint()?,
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
        })
    }

    /// Build the client and wait until the engine reports healthy.
    ///
    /// Probes every `connection_interval`; gives up with
    /// [`StorageError::ConnectionTimeout`] after `connection_timeout`.
    pub async fn connect(config: &StorageConfig) -> StorageResult<Self> {
        let engine = Self::new(config)?;
        let interval = config.connection_interval();
        let timeout = config.connection_timeout();

        info!(endpoint = %engine.host, "Connecting to search engine");

        let probe = async {
            loop {
                match engine.health().await {
                    Ok(()) => break,
                    Err(e) => {
                        warn!(
                            endpoint = %engine.host,
                            error = %e,
                            retry_in = ?interval,
                            "Could not reach search engine, retrying"
                        );
                        tokio::time::sleep(interval).await;
                    }
                }
            }
        };

        match tokio::time::timeout(timeout, probe).await {
            Ok(()) => {
                info!(endpoint = %engine.host, "Connected to search engine");
                Ok(engine)
            }
            Err(_) => {
                let err = StorageError::ConnectionTimeout(timeout);
                error!(endpoint = %engine.host, error = %err, "Connection error");
                Err(err)
            }
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, format!("{}{}", self.host, path));
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// Turn a non-success response into the matching error
    async fn failure(response: Response) -> StorageError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if status == StatusCode::BAD_REQUEST && body.contains(NOT_FILTERABLE_MARKER) {
            return StorageError::NotFilterable(body);
        }
        StorageError::Engine {
            status: status.as_u16(),
            message: body,
        }
    }

    async fn expect_success(response: Response) -> StorageResult<Response> {
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(Self::failure(response).await)
        }
    }

    /// Like [`expect_success`](Self::expect_success) for calls scoped to one
    /// index: a 404 means the partition does not exist
    async fn expect_index_success(index: &str, response: Response) -> StorageResult<Response> {
        if response.status() == StatusCode::NOT_FOUND {
            return Err(StorageError::PartitionNotFound(index.to_string()));
        }
        Self::expect_success(response).await
    }
}

#[async_trait]
impl SearchEngine for MeilisearchEngine {
    async fn health(&self) -> StorageResult<()> {
        let response = self.request(Method::GET, "/health").send().await?;
        Self::expect_success(response).await.map(|_| ())
    }

    async fn create_index(&self, name: &str, primary_key: &str) -> StorageResult<()> {
        let payload = serde_json::json!({ "uid": name, "primaryKey": primary_key });

        debug!(index = name, "Creating index");
        let response = self
            .request(Method::POST, "/indexes")
            .json(&payload)
            .send()
            .await?;
        Self::expect_success(response).await?;
        Ok(())
    }

    async fn index_exists(&self, name: &str) -> StorageResult<bool> {
        let response = self
            .request(Method::GET, &format!("/indexes/{}", name))
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(Self::failure(response).await),
        }
    }

    async fn delete_index(&self, name: &str) -> StorageResult<bool> {
        let response = self
            .request(Method::DELETE, &format!("/indexes/{}", name))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Self::expect_success(response).await?;
        Ok(true)
    }

    async fn list_indexes(&self) -> StorageResult<Vec<String>> {
        let response = self
            .request(Method::GET, "/indexes?limit=1000")
            .send()
            .await?;
        let body: Value = Self::expect_success(response).await?.json().await?;

        // Newer engines page the list under `results`, older ones return a bare array
        let entries = match &body {
            Value::Array(items) => items.as_slice(),
            Value::Object(map) => match map.get("results") {
                Some(Value::Array(items)) => items.as_slice(),
                _ => {
                    return Err(StorageError::InvalidResponse(format!(
                        "unexpected index listing: {}",
                        body
                    )))
                }
            },
            _ => {
                return Err(StorageError::InvalidResponse(format!(
                    "unexpected index listing: {}",
                    body
                )))
            }
        };

        Ok(entries
            .iter()
            .filter_map(|entry| entry.get("uid").and_then(Value::as_str))
            .map(str::to_string)
            .collect())
    }

    async fn add_document(&self, index: &str, document: &Document) -> StorageResult<()> {
        let response = self
            .request(Method::POST, &format!("/indexes/{}/documents", index))
            .json(&[document])
            .send()
            .await?;
        Self::expect_index_success(index, response).await?;
        Ok(())
    }

    async fn update_settings(&self, index: &str, settings: &IndexSettings) -> StorageResult<()> {
        let response = self
            .request(Method::PATCH, &format!("/indexes/{}/settings", index))
            .json(settings)
            .send()
            .await?;
        Self::expect_index_success(index, response).await?;
        Ok(())
    }

    async fn filterable_attributes(&self, index: &str) -> StorageResult<Vec<String>> {
        let response = self
            .request(
                Method::GET,
                &format!("/indexes/{}/settings/filterable-attributes", index),
            )
            .send()
            .await?;
        let attributes = Self::expect_index_success(index, response)
            .await?
            .json()
            .await?;
        Ok(attributes)
    }

    async fn search(&self, index: &str, request: &SearchRequest) -> StorageResult<Vec<Document>> {
        debug!(
            index,
            query = %request.q,
            filter = request.filter.as_deref().unwrap_or(""),
            limit = request.limit,
            "Searching index"
        );

        let response = self
            .request(Method::POST, &format!("/indexes/{}/search", index))
            .json(request)
            .send()
            .await?;

        // Any other client error means the engine rejected the query itself
        let response = match Self::expect_index_success(index, response).await {
            Ok(response) => response,
            Err(StorageError::Engine { status, message })
                if (400..500).contains(&status) && status != 429 =>
            {
                return Err(StorageError::InvalidQuery(message));
            }
            Err(e) => return Err(e),
        };
        let body: SearchResponse = response.json().await?;
        Ok(body.hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::config::StorageConfigBuilder;

    #[test]
    fn test_new_trims_endpoint_and_ignores_empty_key() {
        let config = StorageConfigBuilder::new()
            .endpoint("http://localhost:7700/")
            .api_key("")
            .build();
        let engine = MeilisearchEngine::new(&config).unwrap();
        assert_eq!(engine.host(), "http://localhost:7700");
        assert!(engine.api_key.is_none());
    }

    #[test]
    fn test_new_rejects_missing_endpoint() {
        let config = StorageConfigBuilder::new().endpoints(vec![]).build();
        assert!(matches!(
            MeilisearchEngine::new(&config),
            Err(StorageError::Configuration(_))
        ));
    }
}
