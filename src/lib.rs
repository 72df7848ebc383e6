//! Cost event store
//!
//! Ingests cost and usage detection events from cloud-resource scanners into
//! daily partitions of an external search engine, and answers aggregate
//! queries (per-run summaries, cost trends, tag facets) by folding raw hits
//! in process. See [`storage`] for the core.

pub mod config;
pub mod error;
pub mod storage;
pub mod telemetry;

pub use config::Config;
pub use error::{AppError, Result};
pub use storage::{StorageConfig, StorageError, StorageManager, StorageResult};
