//! Partition-aware client over a [`SearchEngine`]

use crate::storage::config::StorageConfig;
use crate::storage::document::{Document, ID_FIELD};
use crate::storage::engine::{IndexSettings, SearchEngine, SearchRequest, SENTINEL_ATTRIBUTE};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::filter;
use crate::storage::metrics::STORAGE_METRICS;
use crate::storage::retry::{Attempt, Backoff, Cancellation, RetryPolicy};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Storage client: partition management, writes and retried queries
pub struct SearchClient {
    engine: Arc<dyn SearchEngine>,
    config: StorageConfig,
    settings: IndexSettings,
}

impl SearchClient {
    pub fn new(engine: Arc<dyn SearchEngine>, config: StorageConfig) -> Self {
        let settings = IndexSettings::for_events(config.max_values_per_facet);
        Self {
            engine,
            config,
            settings,
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<dyn SearchEngine> {
        &self.engine
    }

    fn settings_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.config.settings_max_attempts,
            Backoff::Linear(self.config.settings_backoff()),
        )
    }

    fn query_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.config.query_max_attempts,
            Backoff::Linear(self.config.query_backoff()),
        )
    }

    /// Check the engine is reachable
    pub async fn ping(&self) -> StorageResult<()> {
        self.engine.health().await
    }

    /// Make sure the partition exists with the event schema applied.
    ///
    /// Existing partitions are re-configured rather than re-created.
    pub async fn ensure_partition(&self, name: &str) -> StorageResult<()> {
        if self.engine.index_exists(name).await? {
            info!(partition = name, "Partition already exists");
            return self.configure_partition(name, &Cancellation::never()).await;
        }

        info!(partition = name, "Partition does not exist, creating");
        self.engine.create_index(name, ID_FIELD).await?;
        info!(partition = name, "Partition created");

        // The engine registers new indexes asynchronously
        tokio::time::sleep(self.config.index_creation_delay()).await;

        self.configure_partition(name, &Cancellation::never()).await
    }

    pub async fn exists_partition(&self, name: &str) -> StorageResult<bool> {
        self.engine.index_exists(name).await
    }

    /// Remove a partition; `false` when it did not exist
    pub async fn delete_partition(&self, name: &str) -> StorageResult<bool> {
        let deleted = self.engine.delete_index(name).await?;
        if deleted {
            info!(partition = name, "Partition deleted");
        }
        Ok(deleted)
    }

    /// Partitions carrying the configured prefix, sorted by name (and so by day)
    pub async fn list_partitions(&self) -> StorageResult<Vec<String>> {
        let prefix = format!("{}-", self.config.index_prefix);
        let mut names: Vec<String> = self
            .engine
            .list_indexes()
            .await?
            .into_iter()
            .filter(|name| name.starts_with(&prefix))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Write one document. Engine-side validation errors propagate unchanged.
    pub async fn upsert(&self, partition: &str, document: &Document) -> StorageResult<()> {
        self.engine.add_document(partition, document).await
    }

    /// Apply the event schema and wait until the engine reports it live.
    ///
    /// Each attempt submits the settings, waits `attempt × settings_backoff`
    /// and reads back the filterable attributes looking for the sentinel.
    /// Fails with [`StorageError::SettingsNotVerified`] when attempts run out.
    pub async fn configure_partition(
        &self,
        name: &str,
        cancel: &Cancellation,
    ) -> StorageResult<()> {
        let policy = self.settings_policy();

        let result = policy
            .run("configure_partition", cancel, |attempt| async move {
                info!(
                    partition = name,
                    attempt,
                    max_attempts = policy.max_attempts,
                    "Applying partition settings"
                );

                if let Err(e) = self.engine.update_settings(name, &self.settings).await {
                    return if e.is_retryable() {
                        Attempt::Retry(e)
                    } else {
                        Attempt::Fail(e)
                    };
                }

                if let Err(e) = policy.pause(attempt, cancel).await {
                    return Attempt::Fail(e);
                }

                match self.engine.filterable_attributes(name).await {
                    Ok(attributes) if attributes.iter().any(|a| a == SENTINEL_ATTRIBUTE) => {
                        Attempt::Done(())
                    }
                    Ok(attributes) => {
                        debug!(
                            partition = name,
                            filterable = ?attributes,
                            "Sentinel attribute not yet filterable"
                        );
                        Attempt::RetryNow(StorageError::SettingsNotVerified { attempts: attempt })
                    }
                    Err(e) => Attempt::RetryNow(e),
                }
            })
            .await;

        match result {
            Ok(()) => {
                info!(partition = name, "Partition settings verified");
                Ok(())
            }
            Err(StorageError::RetriesExhausted { attempts, last }) => {
                warn!(
                    partition = name,
                    attempts,
                    last_error = %last,
                    "Could not verify partition settings"
                );
                Err(StorageError::SettingsNotVerified { attempts })
            }
            Err(e) => Err(e),
        }
    }

    /// Filtered search with retry.
    ///
    /// On "attribute not filterable" the partition settings are re-applied
    /// once before the next attempt; other transient failures retry
    /// straight away. Cancellation is honored at every retry boundary.
    pub async fn query(
        &self,
        partition: &str,
        text: &str,
        filter_expression: Option<&str>,
        limit: usize,
        cancel: &Cancellation,
    ) -> StorageResult<Vec<Document>> {
        let filter = filter_expression
            .map(filter::normalize)
            .filter(|f| !f.trim().is_empty());
        let request = SearchRequest::new(text, filter, limit);
        let request = &request;
        let repaired = AtomicBool::new(false);
        let repaired = &repaired;

        self.query_policy()
            .run("query", cancel, |attempt| async move {
                match self.engine.search(partition, request).await {
                    Ok(hits) => Attempt::Done(hits),
                    Err(e) if e.is_not_filterable() => {
                        STORAGE_METRICS.record_retry("not_filterable");
                        if !repaired.swap(true, Ordering::SeqCst) {
                            warn!(
                                partition,
                                attempt,
                                "Filterable attributes not configured, repairing partition settings"
                            );
                            match self.configure_partition(partition, cancel).await {
                                Ok(()) => info!(partition, "Partition settings repaired"),
                                Err(fix) => {
                                    warn!(partition, error = %fix, "Failed to repair partition settings")
                                }
                            }
                        }
                        Attempt::Retry(e)
                    }
                    Err(e) if e.is_retryable() => {
                        STORAGE_METRICS.record_retry("transient");
                        Attempt::RetryNow(e)
                    }
                    Err(e) => Attempt::Fail(e),
                }
            })
            .await
    }
}
