//! Daily partitions and the midnight rotation loop

use crate::storage::client::SearchClient;
use crate::storage::metrics::STORAGE_METRICS;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Delay before retrying a rotation that failed
const ROTATION_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// Source of the wall-clock time used to pick partitions
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Partition name for a UTC calendar day: `<prefix>-YYYY-MM-DD`
pub fn partition_name(prefix: &str, day: NaiveDate) -> String {
    format!("{}-{}", prefix, day.format("%Y-%m-%d"))
}

/// Time left until the next UTC midnight
pub fn duration_until_next_midnight(now: DateTime<Utc>) -> Duration {
    let next_midnight = now
        .date_naive()
        .succ_opt()
        .map(|tomorrow| tomorrow.and_time(NaiveTime::MIN).and_utc());

    match next_midnight {
        Some(midnight) => (midnight - now).to_std().unwrap_or(Duration::ZERO),
        None => Duration::ZERO,
    }
}

/// Owns the name of the partition every read and write targets.
///
/// Readers take a snapshot of the name; only [`ensure_current`] swaps it,
/// and only after the partition is known to exist and be configured.
///
/// [`ensure_current`]: PartitionLifecycle::ensure_current
pub struct PartitionLifecycle {
    client: Arc<SearchClient>,
    current: RwLock<Option<String>>,
    ensure_lock: Mutex<()>,
    clock: Clock,
}

impl PartitionLifecycle {
    pub fn new(client: Arc<SearchClient>) -> Self {
        Self {
            client,
            current: RwLock::new(None),
            ensure_lock: Mutex::new(()),
            clock: Arc::new(Utc::now),
        }
    }

    /// Replace the wall clock, e.g. to drive rotation across a fixed midnight
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Snapshot of the current partition name, if one was ever established
    pub fn current(&self) -> Option<String> {
        self.current.read().clone()
    }

    /// Make today's partition current. See [`ensure_current_at`].
    ///
    /// [`ensure_current_at`]: PartitionLifecycle::ensure_current_at
    pub async fn ensure_current(&self) -> bool {
        self.ensure_current_at((self.clock)()).await
    }

    /// Make the partition for `now`'s UTC day current.
    ///
    /// Creates and configures it when the name changed or the partition has
    /// gone missing. On failure the previous name stays current and `false`
    /// is returned.
    pub async fn ensure_current_at(&self, now: DateTime<Utc>) -> bool {
        let _guard = self.ensure_lock.lock().await;

        let name = partition_name(&self.client.config().index_prefix, now.date_naive());
        let unchanged = self.current.read().as_deref() == Some(name.as_str());

        let present = if unchanged {
            match self.client.exists_partition(&name).await {
                Ok(exists) => exists,
                Err(e) => {
                    error!(partition = %name, error = %e, "Failed to check if partition exists");
                    return false;
                }
            }
        } else {
            false
        };

        if !present {
            if let Err(e) = self.client.ensure_partition(&name).await {
                error!(partition = %name, error = %e, "Failed to prepare partition");
                return false;
            }
        }

        if !unchanged {
            info!(partition = %name, "Current partition set");
        }
        *self.current.write() = Some(name);
        true
    }

    /// Start the rotation loop on the runtime
    pub fn spawn_rotation(self: &Arc<Self>) -> JoinHandle<()> {
        let lifecycle = Arc::clone(self);
        tokio::spawn(async move { lifecycle.run_rotation().await })
    }

    /// Sleep until the next UTC midnight, then switch partitions; forever
    pub async fn run_rotation(&self) {
        loop {
            let now = (self.clock)();
            let wait = duration_until_next_midnight(now);
            info!(now = %now, duration = ?wait, "Next partition change check in");
            tokio::time::sleep(wait).await;

            while !self.rotate().await {
                tokio::time::sleep(ROTATION_RETRY_INTERVAL).await;
            }
        }
    }

    async fn rotate(&self) -> bool {
        let rotated = self.ensure_current().await;
        STORAGE_METRICS.record_rotation(rotated);
        if !rotated {
            error!(
                retry_in = ?ROTATION_RETRY_INTERVAL,
                "Partition rotation failed, still writing to previous partition"
            );
        }
        rotated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::config::StorageConfigBuilder;
    use crate::storage::engine::SearchEngine;
    use crate::storage::memory::InMemoryEngine;
    use chrono::TimeZone;

    fn lifecycle(engine: Arc<InMemoryEngine>) -> PartitionLifecycle {
        let config = StorageConfigBuilder::new().without_delays().build();
        PartitionLifecycle::new(Arc::new(SearchClient::new(engine, config)))
    }

    #[test]
    fn test_partition_name() {
        let day = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
        assert_eq!(partition_name("finala", day), "finala-2024-03-07");
    }

    #[test]
    fn test_duration_until_next_midnight() {
        let now = Utc.with_ymd_and_hms(2024, 2, 28, 23, 30, 0).unwrap();
        assert_eq!(duration_until_next_midnight(now), Duration::from_secs(30 * 60));

        let midnight = Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap();
        assert_eq!(
            duration_until_next_midnight(midnight),
            Duration::from_secs(24 * 3600)
        );
    }

    #[tokio::test]
    async fn test_ensure_current_is_idempotent() {
        let engine = Arc::new(InMemoryEngine::new());
        let lifecycle = lifecycle(engine.clone());
        let morning = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let evening = Utc.with_ymd_and_hms(2024, 5, 1, 20, 0, 0).unwrap();

        assert!(lifecycle.ensure_current_at(morning).await);
        assert!(lifecycle.ensure_current_at(evening).await);

        assert_eq!(lifecycle.current().as_deref(), Some("finala-2024-05-01"));
        assert_eq!(engine.create_calls(), 1);
    }

    #[tokio::test]
    async fn test_rotation_to_next_day() {
        let engine = Arc::new(InMemoryEngine::new());
        let lifecycle = lifecycle(engine.clone());

        assert!(
            lifecycle
                .ensure_current_at(Utc.with_ymd_and_hms(2024, 5, 1, 23, 59, 59).unwrap())
                .await
        );
        assert!(
            lifecycle
                .ensure_current_at(Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap())
                .await
        );

        assert_eq!(lifecycle.current().as_deref(), Some("finala-2024-05-02"));
        assert_eq!(engine.create_calls(), 2);
    }

    #[tokio::test]
    async fn test_recreates_deleted_partition() {
        let engine = Arc::new(InMemoryEngine::new());
        let lifecycle = lifecycle(engine.clone());
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();

        assert!(lifecycle.ensure_current_at(now).await);
        engine.delete_index("finala-2024-05-01").await.unwrap();
        assert!(lifecycle.ensure_current_at(now).await);
        assert_eq!(engine.create_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotation_loop_switches_at_midnight_and_retries() {
        let engine = Arc::new(InMemoryEngine::new());
        let now = Arc::new(parking_lot::Mutex::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 23, 59, 0).unwrap(),
        ));
        let clock = Arc::clone(&now);
        let lifecycle = Arc::new(
            lifecycle(engine.clone()).with_clock(Arc::new(move || *clock.lock())),
        );
        let rotations = |outcome: &str| {
            STORAGE_METRICS
                .partition_rotations
                .with_label_values(&[outcome])
                .get()
        };

        assert!(lifecycle.ensure_current().await);
        assert_eq!(lifecycle.current().as_deref(), Some("finala-2024-05-01"));
        let (success_before, error_before) = (rotations("success"), rotations("error"));

        // The loop reads the clock once and sleeps the minute left in the day
        let handle = lifecycle.spawn_rotation();
        tokio::time::sleep(Duration::from_secs(1)).await;
        *now.lock() = Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 1).unwrap();
        engine.fail_next_creates(1);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(lifecycle.current().as_deref(), Some("finala-2024-05-01"));
        assert_eq!(rotations("error") - error_before, 1);
        assert_eq!(rotations("success"), success_before);

        tokio::time::sleep(ROTATION_RETRY_INTERVAL).await;
        assert_eq!(lifecycle.current().as_deref(), Some("finala-2024-05-02"));
        assert_eq!(rotations("success") - success_before, 1);
        assert!(engine.index_exists("finala-2024-05-02").await.unwrap());

        handle.abort();
    }

    #[tokio::test]
    async fn test_failure_keeps_previous_partition() {
        let engine = Arc::new(InMemoryEngine::new().with_settings_lag(100));
        let lifecycle = lifecycle(engine.clone());

        assert!(
            !lifecycle
                .ensure_current_at(Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap())
                .await
        );
        assert_eq!(lifecycle.current(), None);
    }
}
