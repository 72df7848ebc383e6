//! Prometheus metrics for the storage layer

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry, Encoder,
    HistogramVec, IntCounterVec, Registry, TextEncoder,
};

/// Storage metrics collection
pub struct StorageMetrics {
    /// Ingested events by outcome (`stored`, `rejected`, `failed`)
    pub events_ingested: IntCounterVec,

    /// Query operations by outcome
    pub queries_total: IntCounterVec,

    /// Query retries by reason (`not_filterable`, `transient`)
    pub query_retries: IntCounterVec,

    /// Partition rotations by outcome
    pub partition_rotations: IntCounterVec,

    /// Query operation latency in seconds
    pub query_duration: HistogramVec,
}

impl StorageMetrics {
    fn new(registry: &Registry) -> Self {
        Self {
            events_ingested: register_int_counter_vec_with_registry!(
                "cost_store_events_ingested_total",
                "Total number of events submitted for ingestion",
                &["outcome"],
                registry
            )
            .unwrap(),

            queries_total: register_int_counter_vec_with_registry!(
                "cost_store_queries_total",
                "Total number of aggregate query operations",
                &["operation", "outcome"],
                registry
            )
            .unwrap(),

            query_retries: register_int_counter_vec_with_registry!(
                "cost_store_query_retries_total",
                "Total number of retried engine queries",
                &["reason"],
                registry
            )
            .unwrap(),

            partition_rotations: register_int_counter_vec_with_registry!(
                "cost_store_partition_rotations_total",
                "Total number of partition rotation checks",
                &["outcome"],
                registry
            )
            .unwrap(),

            query_duration: register_histogram_vec_with_registry!(
                "cost_store_query_duration_seconds",
                "Aggregate query duration in seconds",
                &["operation"],
                vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0],
                registry
            )
            .unwrap(),
        }
    }

    pub fn record_ingest(&self, outcome: &str) {
        self.events_ingested.with_label_values(&[outcome]).inc();
    }

    pub fn record_query(&self, operation: &str, success: bool, duration_secs: f64) {
        let outcome = if success { "success" } else { "error" };
        self.queries_total
            .with_label_values(&[operation, outcome])
            .inc();
        self.query_duration
            .with_label_values(&[operation])
            .observe(duration_secs);
    }

    pub fn record_retry(&self, reason: &str) {
        self.query_retries.with_label_values(&[reason]).inc();
    }

    pub fn record_rotation(&self, success: bool) {
        let outcome = if success { "success" } else { "error" };
        self.partition_rotations.with_label_values(&[outcome]).inc();
    }
}

lazy_static! {
    /// Registry holding only storage metrics
    pub static ref STORAGE_REGISTRY: Registry = Registry::new();

    /// Global storage metrics instance
    pub static ref STORAGE_METRICS: StorageMetrics = StorageMetrics::new(&STORAGE_REGISTRY);
}

/// Storage metrics in the Prometheus text exposition format
pub fn gather_text() -> String {
    lazy_static::initialize(&STORAGE_METRICS);

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&STORAGE_REGISTRY.gather(), &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::from("# Error encoding metrics\n");
    }

    String::from_utf8(buffer).unwrap_or_else(|e| {
        tracing::error!("Failed to convert metrics to string: {}", e);
        String::from("# Error converting metrics\n")
    })
}
