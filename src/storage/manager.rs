//! Storage façade: the surface offered to the ingestion and query callers

use crate::storage::aggregation::{Execution, ExecutionCost};
use crate::storage::client::SearchClient;
use crate::storage::config::StorageConfig;
use crate::storage::document::{Document, Event};
use crate::storage::engine::SearchEngine;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::ingest::Ingestor;
use crate::storage::meilisearch::MeilisearchEngine;
use crate::storage::partition::PartitionLifecycle;
use crate::storage::query::{QueryEngine, SummaryError, SummaryMap};
use crate::storage::retry::Cancellation;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Time-partitioned event store
pub struct StorageManager {
    client: Arc<SearchClient>,
    partitions: Arc<PartitionLifecycle>,
    ingestor: Ingestor,
    queries: QueryEngine,
    rotation: Mutex<Option<JoinHandle<()>>>,
}

impl StorageManager {
    /// Connect to the HTTP engine and start managing partitions
    pub async fn connect(config: StorageConfig) -> StorageResult<Self> {
        let engine = MeilisearchEngine::connect(&config).await?;
        Self::new(Arc::new(engine), config).await
    }

    /// Establish today's partition over `engine` and start the rotation loop.
    ///
    /// Fails when the initial partition cannot be created and verified.
    pub async fn new(engine: Arc<dyn SearchEngine>, config: StorageConfig) -> StorageResult<Self> {
        let manager = Self::without_rotation(engine, config);

        if !manager.partitions.ensure_current().await {
            return Err(StorageError::PartitionNotFound(
                "could not create initial partition".to_string(),
            ));
        }

        let handle = manager.partitions.spawn_rotation();
        *manager.rotation.lock() = Some(handle);
        info!(
            partition = manager.current_partition().as_deref().unwrap_or_default(),
            "Storage manager ready"
        );
        Ok(manager)
    }

    /// Wire the components without touching the engine; no partition is
    /// current until [`PartitionLifecycle::ensure_current`] succeeds.
    pub fn without_rotation(engine: Arc<dyn SearchEngine>, config: StorageConfig) -> Self {
        let client = Arc::new(SearchClient::new(engine, config));
        let partitions = Arc::new(PartitionLifecycle::new(client.clone()));

        Self {
            ingestor: Ingestor::new(client.clone(), partitions.clone()),
            queries: QueryEngine::new(client.clone(), partitions.clone()),
            client,
            partitions,
            rotation: Mutex::new(None),
        }
    }

    pub fn client(&self) -> &Arc<SearchClient> {
        &self.client
    }

    pub fn partitions(&self) -> &Arc<PartitionLifecycle> {
        &self.partitions
    }

    pub fn queries(&self) -> &QueryEngine {
        &self.queries
    }

    pub fn current_partition(&self) -> Option<String> {
        self.partitions.current()
    }

    /// Store one raw JSON event; `false` when it was dropped or rejected
    pub async fn save(&self, raw: &str) -> bool {
        self.ingestor.save(raw).await
    }

    pub async fn save_event(&self, event: &Event) -> bool {
        self.ingestor.save_event(event).await
    }

    pub async fn get_summary(
        &self,
        execution_id: &str,
        filters: &HashMap<String, String>,
        cancel: &Cancellation,
    ) -> Result<SummaryMap, SummaryError> {
        self.queries.get_summary(execution_id, filters, cancel).await
    }

    pub async fn get_executions(
        &self,
        limit: usize,
        cancel: &Cancellation,
    ) -> StorageResult<Vec<Execution>> {
        self.queries.get_executions(limit, cancel).await
    }

    pub async fn get_resources(
        &self,
        resource_type: &str,
        execution_id: &str,
        filters: &HashMap<String, String>,
        search: &str,
        cancel: &Cancellation,
    ) -> StorageResult<Vec<Document>> {
        self.queries
            .get_resources(resource_type, execution_id, filters, search, cancel)
            .await
    }

    pub async fn get_resource_trends(
        &self,
        resource_type: &str,
        filters: &HashMap<String, String>,
        limit: usize,
        cancel: &Cancellation,
    ) -> StorageResult<Vec<ExecutionCost>> {
        self.queries
            .get_resource_trends(resource_type, filters, limit, cancel)
            .await
    }

    pub async fn get_execution_tags(
        &self,
        execution_id: &str,
        cancel: &Cancellation,
    ) -> StorageResult<BTreeMap<String, Vec<String>>> {
        self.queries.get_execution_tags(execution_id, cancel).await
    }

    /// Stop the rotation loop
    pub fn shutdown(&self) {
        if let Some(handle) = self.rotation.lock().take() {
            handle.abort();
            info!("Partition rotation stopped");
        }
    }
}

impl Drop for StorageManager {
    fn drop(&mut self) {
        if let Some(handle) = self.rotation.get_mut().take() {
            handle.abort();
        }
    }
}
