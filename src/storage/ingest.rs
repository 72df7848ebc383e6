//! Best-effort event ingestion into the current partition

use crate::storage::client::SearchClient;
use crate::storage::document::{ensure_document_id, Document, Event};
use crate::storage::metrics::STORAGE_METRICS;
use crate::storage::partition::PartitionLifecycle;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error};

/// Writes single events; at most one attempt per call, outcome as a `bool`
pub struct Ingestor {
    client: Arc<SearchClient>,
    partitions: Arc<PartitionLifecycle>,
}

impl Ingestor {
    pub fn new(client: Arc<SearchClient>, partitions: Arc<PartitionLifecycle>) -> Self {
        Self { client, partitions }
    }

    /// Store one raw JSON event.
    ///
    /// Malformed payloads are dropped and logged. Documents without an `id`
    /// get a synthetic one before the write.
    pub async fn save(&self, raw: &str) -> bool {
        let document = match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                error!(kind = value_kind(&other), "Event payload is not a JSON object");
                STORAGE_METRICS.record_ingest("rejected");
                return false;
            }
            Err(e) => {
                error!(error = %e, "Failed to decode event payload");
                STORAGE_METRICS.record_ingest("rejected");
                return false;
            }
        };

        self.store(document, raw).await
    }

    /// Store a typed event
    pub async fn save_event(&self, event: &Event) -> bool {
        match event.to_document() {
            Ok(document) => {
                let context = format!("{}/{}", event.execution_id, event.resource_name);
                self.store(document, &context).await
            }
            Err(e) => {
                error!(error = %e, "Failed to encode event");
                STORAGE_METRICS.record_ingest("rejected");
                false
            }
        }
    }

    async fn store(&self, mut document: Document, context: &str) -> bool {
        let Some(partition) = self.partitions.current() else {
            error!("No current partition, dropping event");
            STORAGE_METRICS.record_ingest("failed");
            return false;
        };

        let id = ensure_document_id(&mut document);

        match self.client.upsert(&partition, &document).await {
            Ok(()) => {
                debug!(partition = %partition, id = %id, "Event stored");
                STORAGE_METRICS.record_ingest("stored");
                true
            }
            Err(e) => {
                error!(
                    partition = %partition,
                    data = context,
                    error = %e,
                    "Failed to save document"
                );
                STORAGE_METRICS.record_ingest("failed");
                false
            }
        }
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
