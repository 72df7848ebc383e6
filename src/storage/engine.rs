//! The narrow interface consumed from the external search engine

use crate::storage::document::{
    Document, DATA_FIELD, EVENT_TYPE_FIELD, EXECUTION_ID_FIELD, ID_FIELD, RESOURCE_NAME_FIELD,
    TIMESTAMP_FIELD,
};
use crate::storage::error::StorageResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Attribute whose presence in the filterable list proves the schema is live
pub const SENTINEL_ATTRIBUTE: &str = EVENT_TYPE_FIELD;

/// Faceting settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacetingSettings {
    pub max_values_per_facet: usize,
}

/// Attribute schema applied to every partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSettings {
    pub searchable_attributes: Vec<String>,
    pub ranking_rules: Vec<String>,
    pub filterable_attributes: Vec<String>,
    pub sortable_attributes: Vec<String>,
    pub faceting: FacetingSettings,
}

impl IndexSettings {
    /// The fixed schema of an event partition
    pub fn for_events(max_values_per_facet: usize) -> Self {
        let owned = |names: &[&str]| names.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        Self {
            searchable_attributes: owned(&[
                RESOURCE_NAME_FIELD,
                EXECUTION_ID_FIELD,
                EVENT_TYPE_FIELD,
                DATA_FIELD,
                "*",
            ]),
            ranking_rules: owned(&[
                "words",
                "typo",
                "proximity",
                "attribute",
                "sort",
                "Timestamp:desc",
                "exactness",
            ]),
            filterable_attributes: owned(&[
                RESOURCE_NAME_FIELD,
                EXECUTION_ID_FIELD,
                EVENT_TYPE_FIELD,
                TIMESTAMP_FIELD,
                ID_FIELD,
            ]),
            sortable_attributes: owned(&[TIMESTAMP_FIELD]),
            faceting: FacetingSettings { max_values_per_facet },
        }
    }
}

/// One search call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchRequest {
    /// Free-text query; empty matches everything
    pub q: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,

    pub limit: usize,
}

impl SearchRequest {
    pub fn new(q: impl Into<String>, filter: Option<String>, limit: usize) -> Self {
        Self {
            q: q.into(),
            filter,
            limit,
        }
    }
}

/// Operations any engine substitute must provide.
///
/// Implementations report an unfilterable attribute with
/// [`StorageError::NotFilterable`](crate::storage::StorageError::NotFilterable)
/// so the client can repair the schema.
#[async_trait]
pub trait SearchEngine: Send + Sync {
    /// Liveness probe
    async fn health(&self) -> StorageResult<()>;

    /// Create an index with the given primary key
    async fn create_index(&self, name: &str, primary_key: &str) -> StorageResult<()>;

    async fn index_exists(&self, name: &str) -> StorageResult<bool>;

    /// Returns `false` when there was nothing to delete
    async fn delete_index(&self, name: &str) -> StorageResult<bool>;

    async fn list_indexes(&self) -> StorageResult<Vec<String>>;

    /// Insert or replace one document keyed by its `id`
    async fn add_document(&self, index: &str, document: &Document) -> StorageResult<()>;

    /// Submit a settings update. Engines may apply it asynchronously.
    async fn update_settings(&self, index: &str, settings: &IndexSettings) -> StorageResult<()>;

    /// Read back the filterable attributes currently in effect
    async fn filterable_attributes(&self, index: &str) -> StorageResult<Vec<String>>;

    async fn search(&self, index: &str, request: &SearchRequest) -> StorageResult<Vec<Document>>;
}
