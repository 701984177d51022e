//! Retention Sweep Background Task
//!
//! Bounds the growth of the change log and the dedup ledger:
//!
//! - Every `sweep_interval`, processed records and structural events older
//!   than the structural window are deleted. A session that has not polled
//!   within the window no longer discovers those events by pull.
//! - Every `field_prune_interval`, field-update events older than
//!   `change_retention` are deleted.
//!
//! # Configuration
//!
//! ```rust
//! use tally_api::jobs::RetentionSweepConfig;
//! use std::time::Duration;
//!
//! let config = RetentionSweepConfig {
//!     sweep_interval: Duration::from_secs(120),
//!     structural_window: Duration::from_secs(300),
//!     field_prune_interval: Duration::from_secs(3600),
//!     change_retention: Duration::from_secs(86_400),
//! };
//! ```

use crate::constants::FIELD_PRUNE_INTERVAL_SECS;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tally_core::{now, EventKind, SyncConfig, Timestamp};
use tally_storage::SyncStore;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the retention sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct RetentionSweepConfig {
    /// How often the structural sweep runs (default: 2 minutes)
    pub sweep_interval: Duration,

    /// Age after which processed records and structural events are removed
    /// (default: 5 minutes)
    pub structural_window: Duration,

    /// How often field events are pruned (default: 1 hour)
    pub field_prune_interval: Duration,

    /// Age after which field events are removed (default: 24 hours)
    pub change_retention: Duration,
}

impl Default for RetentionSweepConfig {
    fn default() -> Self {
        Self::from_sync(&SyncConfig::default())
    }
}

impl RetentionSweepConfig {
    /// Derive the sweep schedule from the shared sync settings.
    pub fn from_sync(sync: &SyncConfig) -> Self {
        Self {
            sweep_interval: sync.dedup_sweep_interval,
            structural_window: sync.structural_window,
            field_prune_interval: Duration::from_secs(FIELD_PRUNE_INTERVAL_SECS),
            change_retention: sync.change_retention,
        }
    }

    /// Short intervals for local development.
    pub fn development() -> Self {
        Self {
            sweep_interval: Duration::from_secs(10),
            structural_window: Duration::from_secs(60),
            field_prune_interval: Duration::from_secs(60),
            change_retention: Duration::from_secs(600),
        }
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Counters for sweep activity since startup.
#[derive(Debug, Default)]
pub struct RetentionSweepMetrics {
    /// Processed records deleted
    pub processed_pruned: AtomicU64,

    /// Structural events deleted
    pub structural_pruned: AtomicU64,

    /// Field-update events deleted
    pub field_events_pruned: AtomicU64,

    /// Sweep cycles completed
    pub sweep_cycles: AtomicU64,

    /// Errors encountered while sweeping
    pub sweep_errors: AtomicU64,
}

impl RetentionSweepMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current snapshot of all metrics.
    pub fn snapshot(&self) -> RetentionSweepSnapshot {
        RetentionSweepSnapshot {
            processed_pruned: self.processed_pruned.load(Ordering::Relaxed),
            structural_pruned: self.structural_pruned.load(Ordering::Relaxed),
            field_events_pruned: self.field_events_pruned.load(Ordering::Relaxed),
            sweep_cycles: self.sweep_cycles.load(Ordering::Relaxed),
            sweep_errors: self.sweep_errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of sweep metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionSweepSnapshot {
    pub processed_pruned: u64,
    pub structural_pruned: u64,
    pub field_events_pruned: u64,
    pub sweep_cycles: u64,
    pub sweep_errors: u64,
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Background task that runs both sweeps until shutdown is signalled.
///
/// # Arguments
///
/// * `store` - Store to prune
/// * `config` - Sweep schedule and ages
/// * `shutdown_rx` - Watch receiver for shutdown signal
///
/// # Returns
///
/// Metrics collected during the task's lifetime
pub async fn retention_sweep_task(
    store: Arc<dyn SyncStore>,
    config: RetentionSweepConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<RetentionSweepMetrics> {
    let metrics = Arc::new(RetentionSweepMetrics::new());

    let mut sweep_interval = interval(config.sweep_interval);
    sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut field_interval = interval(config.field_prune_interval);
    field_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        sweep_interval_secs = config.sweep_interval.as_secs(),
        structural_window_secs = config.structural_window.as_secs(),
        change_retention_secs = config.change_retention.as_secs(),
        "Retention sweep task started"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Retention sweep task shutting down");
                    break;
                }
            }

            _ = sweep_interval.tick() => {
                sweep_structural(store.as_ref(), &config, &metrics).await;
            }

            _ = field_interval.tick() => {
                prune_field_events(store.as_ref(), &config, &metrics).await;
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        processed_pruned = snapshot.processed_pruned,
        structural_pruned = snapshot.structural_pruned,
        field_events_pruned = snapshot.field_events_pruned,
        sweep_cycles = snapshot.sweep_cycles,
        sweep_errors = snapshot.sweep_errors,
        "Retention sweep task completed"
    );

    metrics
}

fn cutoff(age: Duration) -> Timestamp {
    now() - chrono::Duration::from_std(age).unwrap_or(chrono::Duration::MAX)
}

/// Delete processed records and structural events older than the window.
pub async fn sweep_structural(
    store: &dyn SyncStore,
    config: &RetentionSweepConfig,
    metrics: &RetentionSweepMetrics,
) {
    let before = cutoff(config.structural_window);

    let processed = match store.prune_processed(before).await {
        Ok(count) => count,
        Err(e) => {
            tracing::error!(error = %e, "Failed to prune processed records");
            metrics.sweep_errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };
    let structural = match store.prune_events(&EventKind::structural(), before).await {
        Ok(count) => count,
        Err(e) => {
            tracing::error!(error = %e, "Failed to prune structural events");
            metrics.sweep_errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    metrics.processed_pruned.fetch_add(processed, Ordering::Relaxed);
    metrics.structural_pruned.fetch_add(structural, Ordering::Relaxed);
    metrics.sweep_cycles.fetch_add(1, Ordering::Relaxed);

    if processed == 0 && structural == 0 {
        tracing::trace!("Structural sweep found nothing to prune");
    } else {
        tracing::debug!(processed, structural, "Structural sweep pruned rows");
    }
}

/// Delete field-update events older than the retention period.
pub async fn prune_field_events(
    store: &dyn SyncStore,
    config: &RetentionSweepConfig,
    metrics: &RetentionSweepMetrics,
) {
    let before = cutoff(config.change_retention);
    match store.prune_events(&[EventKind::FieldUpdate], before).await {
        Ok(0) => tracing::trace!("Field prune found nothing to delete"),
        Ok(count) => {
            metrics.field_events_pruned.fetch_add(count, Ordering::Relaxed);
            tracing::debug!(count, "Pruned field events");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to prune field events");
            metrics.sweep_errors.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::{
        CellValue, EntityId, FieldKey, NewChangeEvent, Origin, SessionId, TenantId, UserId,
    };
    use tally_storage::{ChangeLog, DedupTracker, InMemoryStore};

    fn origin(session: &str) -> Origin {
        Origin::new(TenantId::new(1), SessionId::new(session), UserId::new("u"))
    }

    fn minutes_ago(minutes: i64) -> Timestamp {
        now() - chrono::Duration::minutes(minutes)
    }

    #[test]
    fn test_default_schedule() {
        let config = RetentionSweepConfig::default();
        assert_eq!(config.sweep_interval, Duration::from_secs(120));
        assert_eq!(config.structural_window, Duration::from_secs(300));
        assert_eq!(config.field_prune_interval, Duration::from_secs(3600));
        assert_eq!(config.change_retention, Duration::from_secs(86_400));
    }

    #[tokio::test]
    async fn test_structural_sweep_keeps_recent_and_field_events() {
        let store = InMemoryStore::new();
        let old = NewChangeEvent::structural(&origin("a"), EventKind::NewEntity, EntityId::new(1))
            .at(minutes_ago(10));
        let fresh = NewChangeEvent::structural(&origin("a"), EventKind::NewEntity, EntityId::new(2))
            .at(minutes_ago(1));
        let old_field = NewChangeEvent::field_update(
            &origin("a"),
            FieldKey::expense(1, 2),
            CellValue::Empty,
            CellValue::Number(3.0),
        )
        .at(minutes_ago(10));
        for event in [old, fresh, old_field] {
            store.append(event).await.expect("append should succeed");
        }

        let metrics = RetentionSweepMetrics::new();
        sweep_structural(&store, &RetentionSweepConfig::default(), &metrics).await;

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.structural_pruned, 1);
        assert_eq!(snapshot.sweep_cycles, 1);
        assert_eq!(store.event_count().await, 2);
    }

    #[tokio::test]
    async fn test_processed_records_pruned_after_window() {
        let store = InMemoryStore::new();
        store
            .append(
                NewChangeEvent::structural(&origin("a"), EventKind::NewEntity, EntityId::new(1))
                    .at(minutes_ago(1)),
            )
            .await
            .expect("append should succeed");
        let claimed = store
            .claim_unseen(TenantId::new(1), &SessionId::new("b"), EventKind::NewEntity, minutes_ago(5))
            .await
            .expect("claim should succeed");
        assert_eq!(claimed.len(), 1);
        assert_eq!(store.processed_count().await, 1);

        tokio::time::sleep(Duration::from_millis(5)).await;
        let config = RetentionSweepConfig {
            structural_window: Duration::ZERO,
            ..RetentionSweepConfig::default()
        };
        let metrics = RetentionSweepMetrics::new();
        sweep_structural(&store, &config, &metrics).await;

        assert_eq!(metrics.snapshot().processed_pruned, 1);
        assert_eq!(store.processed_count().await, 0);
    }

    #[tokio::test]
    async fn test_field_prune_respects_retention() {
        let store = InMemoryStore::new();
        let key = FieldKey::attribute(1, "notes");
        let stale = NewChangeEvent::field_update(&origin("a"), key.clone(), CellValue::Empty, "x".into())
            .at(now() - chrono::Duration::hours(30));
        let recent = NewChangeEvent::field_update(&origin("a"), key, CellValue::Empty, "y".into())
            .at(now() - chrono::Duration::hours(2));
        store.append(stale).await.expect("append should succeed");
        store.append(recent).await.expect("append should succeed");

        let metrics = RetentionSweepMetrics::new();
        prune_field_events(&store, &RetentionSweepConfig::default(), &metrics).await;

        assert_eq!(metrics.snapshot().field_events_pruned, 1);
        assert_eq!(store.event_count().await, 1);
    }

    #[tokio::test]
    async fn test_outage_counts_errors() {
        let store = InMemoryStore::new();
        store.set_unavailable(true);
        let metrics = RetentionSweepMetrics::new();
        sweep_structural(&store, &RetentionSweepConfig::default(), &metrics).await;
        prune_field_events(&store, &RetentionSweepConfig::default(), &metrics).await;
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sweep_errors, 2);
        assert_eq!(snapshot.sweep_cycles, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_stops_on_shutdown() {
        let store: Arc<dyn SyncStore> = Arc::new(InMemoryStore::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(retention_sweep_task(
            store,
            RetentionSweepConfig::default(),
            shutdown_rx,
        ));

        tokio::time::sleep(Duration::from_secs(250)).await;
        shutdown_tx.send(true).expect("shutdown send should succeed");
        let metrics = handle.await.expect("task should join");

        // Ticks at 0s, 120s and 240s.
        assert_eq!(metrics.snapshot().sweep_cycles, 3);
    }
}
