//! Aggregate queries over the current partition
//!
//! Every operation has the same shape: build a [`Filter`], fetch raw hits
//! through the [`SearchClient`], fold them with a function from
//! [`aggregation`](crate::storage::aggregation). The `*_in` variants target
//! an explicit partition instead of the current one.

use crate::storage::aggregation::{
    fold_execution_costs, fold_first_seen_executions, fold_latest_status, fold_tags,
    merge_resource_costs, CollectorsSummary, Execution, ExecutionCost,
};
use crate::storage::client::SearchClient;
use crate::storage::document::{
    Document, EventType, EVENT_TYPE_FIELD, EXECUTION_ID_FIELD, RESOURCE_NAME_FIELD,
};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::filter::Filter;
use crate::storage::metrics::STORAGE_METRICS;
use crate::storage::partition::PartitionLifecycle;
use crate::storage::retry::Cancellation;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

/// Summary map keyed by resource type
pub type SummaryMap = HashMap<String, CollectorsSummary>;

/// Summary query failure, carrying whatever was aggregated before it
#[derive(Debug, thiserror::Error)]
#[error("summary incomplete: {source}")]
pub struct SummaryError {
    /// Status-only summary from the first pass
    pub partial: SummaryMap,
    pub source: StorageError,
}

impl SummaryError {
    fn empty(source: StorageError) -> Self {
        Self {
            partial: SummaryMap::new(),
            source,
        }
    }
}

impl From<SummaryError> for StorageError {
    fn from(err: SummaryError) -> Self {
        err.source
    }
}

/// Analytical queries with client-side aggregation
pub struct QueryEngine {
    client: Arc<SearchClient>,
    partitions: Arc<PartitionLifecycle>,
}

impl QueryEngine {
    pub fn new(client: Arc<SearchClient>, partitions: Arc<PartitionLifecycle>) -> Self {
        Self { client, partitions }
    }

    fn current_partition(&self) -> StorageResult<String> {
        self.partitions
            .current()
            .ok_or_else(|| StorageError::PartitionNotFound("no current partition".to_string()))
    }

    fn search_limit(&self) -> usize {
        self.client.config().search_limit
    }

    async fn fetch(
        &self,
        partition: &str,
        text: &str,
        filter: &Filter,
        limit: usize,
        cancel: &Cancellation,
    ) -> StorageResult<Vec<Document>> {
        let expression = filter.to_string();
        let hits = self
            .client
            .query(partition, text, Some(&expression), limit, cancel)
            .await?;
        debug!(partition, filter = %expression, hits = hits.len(), "Query returned");
        Ok(hits)
    }

    /// Per-resource-type summary of one execution.
    ///
    /// Pass one keeps the latest status per resource type; a failure there is
    /// logged and the summary continues without statuses. Pass two folds the
    /// detected resources; its failure is returned with the status-only
    /// summary as [`SummaryError::partial`].
    pub async fn get_summary(
        &self,
        execution_id: &str,
        filters: &HashMap<String, String>,
        cancel: &Cancellation,
    ) -> Result<SummaryMap, SummaryError> {
        let partition = self.current_partition().map_err(SummaryError::empty)?;
        self.get_summary_in(&partition, execution_id, filters, cancel)
            .await
    }

    pub async fn get_summary_in(
        &self,
        partition: &str,
        execution_id: &str,
        filters: &HashMap<String, String>,
        cancel: &Cancellation,
    ) -> Result<SummaryMap, SummaryError> {
        let started = Instant::now();
        let result = self
            .summary(partition, execution_id, filters, cancel)
            .await;
        STORAGE_METRICS.record_query("summary", result.is_ok(), started.elapsed().as_secs_f64());
        result
    }

    async fn summary(
        &self,
        partition: &str,
        execution_id: &str,
        filters: &HashMap<String, String>,
        cancel: &Cancellation,
    ) -> Result<SummaryMap, SummaryError> {
        let execution_id = require("execution id", execution_id).map_err(SummaryError::empty)?;

        let status_filter = event_type_is(EventType::ServiceStatus)
            .and(Filter::eq(EXECUTION_ID_FIELD, execution_id));
        let resource_filter = event_type_is(EventType::ResourceDetected)
            .and(Filter::eq(EXECUTION_ID_FIELD, execution_id))
            .and_all(filters)
            .map_err(SummaryError::empty)?;

        let mut summary = match self
            .fetch(partition, "", &status_filter, self.search_limit(), cancel)
            .await
        {
            Ok(hits) => fold_latest_status(&hits),
            Err(StorageError::Cancelled) => {
                return Err(SummaryError::empty(StorageError::Cancelled))
            }
            Err(e) => {
                warn!(
                    partition,
                    execution_id,
                    error = %e,
                    "Failed to fetch service status for summary"
                );
                SummaryMap::new()
            }
        };

        match self
            .fetch(partition, "", &resource_filter, self.search_limit(), cancel)
            .await
        {
            Ok(hits) => {
                merge_resource_costs(&mut summary, &hits);
                Ok(summary)
            }
            Err(source) => {
                error!(
                    partition,
                    execution_id,
                    error = %source,
                    "Failed to fetch detected resources for summary"
                );
                Err(SummaryError {
                    partial: summary,
                    source,
                })
            }
        }
    }

    /// Distinct executions in order of first appearance; `limit` caps the hits
    /// fetched from the engine (0 means the configured search limit)
    pub async fn get_executions(
        &self,
        limit: usize,
        cancel: &Cancellation,
    ) -> StorageResult<Vec<Execution>> {
        let partition = self.current_partition()?;
        self.get_executions_in(&partition, limit, cancel).await
    }

    pub async fn get_executions_in(
        &self,
        partition: &str,
        limit: usize,
        cancel: &Cancellation,
    ) -> StorageResult<Vec<Execution>> {
        let started = Instant::now();
        let limit = if limit == 0 { self.search_limit() } else { limit };

        let result = self
            .fetch(partition, "", &event_type_is(EventType::ServiceStatus), limit, cancel)
            .await
            .map(|hits| fold_first_seen_executions(&hits));

        if let Err(e) = &result {
            error!(partition, error = %e, "Failed to get executions");
        }
        STORAGE_METRICS.record_query("executions", result.is_ok(), started.elapsed().as_secs_f64());
        result
    }

    /// Raw detected-resource documents of one type within one execution
    pub async fn get_resources(
        &self,
        resource_type: &str,
        execution_id: &str,
        filters: &HashMap<String, String>,
        search: &str,
        cancel: &Cancellation,
    ) -> StorageResult<Vec<Document>> {
        let partition = self.current_partition()?;
        self.get_resources_in(&partition, resource_type, execution_id, filters, search, cancel)
            .await
    }

    pub async fn get_resources_in(
        &self,
        partition: &str,
        resource_type: &str,
        execution_id: &str,
        filters: &HashMap<String, String>,
        search: &str,
        cancel: &Cancellation,
    ) -> StorageResult<Vec<Document>> {
        let started = Instant::now();
        let result: StorageResult<Vec<Document>> = async {
            let filter = event_type_is(EventType::ResourceDetected)
                .and(Filter::eq(EXECUTION_ID_FIELD, require("execution id", execution_id)?))
                .and(Filter::eq(RESOURCE_NAME_FIELD, require("resource type", resource_type)?))
                .and_all(filters)?;
            self.fetch(partition, search, &filter, self.search_limit(), cancel)
                .await
        }
        .await;

        if let Err(e) = &result {
            error!(partition, resource_type, execution_id, error = %e, "Failed to get resources");
        }
        STORAGE_METRICS.record_query("resources", result.is_ok(), started.elapsed().as_secs_f64());
        result
    }

    /// One cost point per execution for a resource type, unordered.
    ///
    /// `limit` is not enforced here: callers sort with
    /// [`sort_by_timestamp`](crate::storage::aggregation::sort_by_timestamp)
    /// and keep as many points as they need.
    pub async fn get_resource_trends(
        &self,
        resource_type: &str,
        filters: &HashMap<String, String>,
        limit: usize,
        cancel: &Cancellation,
    ) -> StorageResult<Vec<ExecutionCost>> {
        let partition = self.current_partition()?;
        self.get_resource_trends_in(&partition, resource_type, filters, limit, cancel)
            .await
    }

    pub async fn get_resource_trends_in(
        &self,
        partition: &str,
        resource_type: &str,
        filters: &HashMap<String, String>,
        limit: usize,
        cancel: &Cancellation,
    ) -> StorageResult<Vec<ExecutionCost>> {
        let started = Instant::now();
        let result: StorageResult<Vec<ExecutionCost>> = async {
            let filter = Filter::eq(RESOURCE_NAME_FIELD, require("resource type", resource_type)?)
                .and(Filter::ne(EVENT_TYPE_FIELD, EventType::ServiceStatus.as_ref()))
                .and_all(filters)?;
            let hits = self
                .fetch(partition, "", &filter, self.search_limit(), cancel)
                .await?;
            Ok(fold_execution_costs(&hits))
        }
        .await;

        match &result {
            Ok(points) => debug!(
                partition,
                resource_type,
                points = points.len(),
                requested = limit,
                "Resource trends computed"
            ),
            Err(e) => error!(partition, resource_type, error = %e, "Failed to get resource trends"),
        }
        STORAGE_METRICS.record_query("trends", result.is_ok(), started.elapsed().as_secs_f64());
        result
    }

    /// Tag values observed within one execution
    pub async fn get_execution_tags(
        &self,
        execution_id: &str,
        cancel: &Cancellation,
    ) -> StorageResult<BTreeMap<String, Vec<String>>> {
        let partition = self.current_partition()?;
        self.get_execution_tags_in(&partition, execution_id, cancel)
            .await
    }

    pub async fn get_execution_tags_in(
        &self,
        partition: &str,
        execution_id: &str,
        cancel: &Cancellation,
    ) -> StorageResult<BTreeMap<String, Vec<String>>> {
        let started = Instant::now();
        let result: StorageResult<BTreeMap<String, Vec<String>>> = async {
            let filter = event_type_is(EventType::ResourceDetected)
                .and(Filter::eq(EXECUTION_ID_FIELD, require("execution id", execution_id)?));
            let hits = self
                .fetch(partition, "", &filter, self.search_limit(), cancel)
                .await?;
            debug!(partition, execution_id, hits = hits.len(), "Processing tags");
            Ok(fold_tags(&hits))
        }
        .await;

        if let Err(e) = &result {
            error!(partition, execution_id, error = %e, "Failed to get execution tags");
        }
        STORAGE_METRICS.record_query("tags", result.is_ok(), started.elapsed().as_secs_f64());
        result
    }
}

fn event_type_is(event_type: EventType) -> Filter {
    Filter::eq(EVENT_TYPE_FIELD, event_type.as_ref())
}

fn require<'a>(what: &str, value: &'a str) -> StorageResult<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(StorageError::InvalidQuery(format!("{} must not be empty", what)));
    }
    Ok(trimmed)
}
