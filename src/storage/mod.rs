//! Time-partitioned cost event store over an external search engine
//!
//! Scanner events are written into one index per UTC day (`finala-YYYY-MM-DD`)
//! and analytical queries are answered by fetching raw hits and aggregating
//! them in process, since the engine has no GROUP BY.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │           StorageManager                         │
//! ├─────────────────────────────────────────────────┤
//! │  - save()               - get_summary()         │
//! │  - get_executions()     - get_resources()       │
//! │  - get_resource_trends() - get_execution_tags() │
//! └─────────────────────────────────────────────────┘
//!          │                          │
//!          ▼                          ▼
//! ┌──────────────────┐      ┌──────────────────────┐
//! │    Ingestor      │      │    QueryEngine        │
//! │                  │      │  filter → hits → fold │
//! └──────────────────┘      └──────────────────────┘
//!          │                          │
//!          ▼                          ▼
//! ┌─────────────────────────────────────────────────┐
//! │  PartitionLifecycle (current name, rotation)    │
//! ├─────────────────────────────────────────────────┤
//! │  SearchClient (settings protocol, query retry)  │
//! ├─────────────────────────────────────────────────┤
//! │  SearchEngine: Meilisearch over HTTP | memory   │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use cost_event_store::storage::{Cancellation, StorageConfig, StorageManager};
//! use std::collections::HashMap;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let storage = StorageManager::connect(StorageConfig::default()).await?;
//!
//!     storage.save(r#"{"ExecutionID":"general_1700000000","ResourceName":"aws_ebs",
//!         "EventType":"resource_detected","Data":{"PricePerMonth":12.5}}"#).await;
//!
//!     let summary = storage
//!         .get_summary("general_1700000000", &HashMap::new(), &Cancellation::never())
//!         .await?;
//!     println!("{} resource types", summary.len());
//!
//!     Ok(())
//! }
//! ```

mod aggregation;
mod client;
mod config;
mod document;
mod engine;
mod error;
mod filter;
mod ingest;
mod manager;
mod meilisearch;
mod memory;
pub mod metrics;
mod partition;
mod query;
mod retry;

pub use aggregation::{
    fold_execution_costs, fold_first_seen_executions, fold_latest_status, fold_tags,
    merge_resource_costs, sort_by_timestamp, Category, CollectorsSummary, Execution,
    ExecutionCost,
};
pub use client::SearchClient;
pub use config::{StorageConfig, StorageConfigBuilder};
pub use document::{
    decode_tags, ensure_document_id, extract_timestamp, next_document_id, CollectStatus,
    Document, Event, EventData, EventType, PriceValue, ResourceDetectedData, ServiceStatusData,
};
pub use engine::{IndexSettings, SearchEngine, SearchRequest, SENTINEL_ATTRIBUTE};
pub use error::{StorageError, StorageResult};
pub use filter::{normalize as normalize_filter, Filter};
pub use ingest::Ingestor;
pub use manager::StorageManager;
pub use meilisearch::MeilisearchEngine;
pub use memory::InMemoryEngine;
pub use partition::{duration_until_next_midnight, partition_name, Clock, PartitionLifecycle};
pub use query::{QueryEngine, SummaryError, SummaryMap};
pub use retry::{Attempt, Backoff, CancelHandle, Cancellation, RetryPolicy};
