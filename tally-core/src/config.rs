//! Configuration types shared by the server and the client.

use crate::error::{ConfigError, TallyError, TallyResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default debounce delay before a buffered edit batch is flushed.
pub const DEFAULT_DEBOUNCE_MS: u64 = 800;

/// Default number of cell updates per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Default look-back window for structural events (5 minutes).
pub const DEFAULT_STRUCTURAL_WINDOW_SECS: u64 = 5 * 60;

/// Default interval of the fast dedup sweep (2 minutes).
pub const DEFAULT_DEDUP_SWEEP_INTERVAL_SECS: u64 = 2 * 60;

/// Default retention for field-update events (24 hours).
pub const DEFAULT_CHANGE_RETENTION_SECS: u64 = 24 * 60 * 60;

/// Default reconciliation poll interval.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;

/// Retry policy with bounded attempts and exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Backoff to wait after the given failed attempt (1-based).
    ///
    /// Returns `None` once `max_attempts` is exhausted.
    pub fn backoff_after(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt >= self.max_attempts {
            return None;
        }
        let factor = self.backoff_multiplier.powi(attempt as i32 - 1);
        let millis = self.initial_backoff.as_millis() as f64 * factor;
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Some(Duration::from_millis(capped as u64))
    }

    pub fn validate(&self) -> TallyResult<()> {
        if self.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", self.max_attempts, "must be > 0"));
        }
        if self.initial_backoff.is_zero() {
            return Err(invalid("retry.initial_backoff", "0", "must be > 0"));
        }
        if self.max_backoff < self.initial_backoff {
            return Err(invalid(
                "retry.max_backoff",
                format!("{:?}", self.max_backoff),
                "must be >= initial_backoff",
            ));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(invalid(
                "retry.backoff_multiplier",
                self.backoff_multiplier,
                "must be >= 1.0",
            ));
        }
        Ok(())
    }
}

/// Synchronization tuning knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Quiet period after the last edit before the buffer is flushed.
    pub debounce: Duration,
    /// Maximum cell updates per transport / apply chunk.
    pub chunk_size: usize,
    /// How far back structural events stay discoverable by pull.
    pub structural_window: Duration,
    /// How often the dedup ledger and expired structural events are swept.
    pub dedup_sweep_interval: Duration,
    /// How long field-update events are retained in the change log.
    pub change_retention: Duration,
    /// Reconciliation poll interval on the client.
    pub poll_interval: Duration,
    pub retry: RetryConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            chunk_size: DEFAULT_CHUNK_SIZE,
            structural_window: Duration::from_secs(DEFAULT_STRUCTURAL_WINDOW_SECS),
            dedup_sweep_interval: Duration::from_secs(DEFAULT_DEDUP_SWEEP_INTERVAL_SECS),
            change_retention: Duration::from_secs(DEFAULT_CHANGE_RETENTION_SECS),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            retry: RetryConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> TallyResult<()> {
        if self.debounce.is_zero() {
            return Err(invalid("debounce", "0", "must be > 0"));
        }
        if self.chunk_size == 0 {
            return Err(invalid("chunk_size", self.chunk_size, "must be > 0"));
        }
        if self.structural_window.is_zero() {
            return Err(invalid("structural_window", "0", "must be > 0"));
        }
        if self.dedup_sweep_interval.is_zero() {
            return Err(invalid("dedup_sweep_interval", "0", "must be > 0"));
        }
        if self.change_retention < self.structural_window {
            return Err(invalid(
                "change_retention",
                format!("{:?}", self.change_retention),
                "must be >= structural_window",
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(invalid("poll_interval", "0", "must be > 0"));
        }
        self.retry.validate()
    }

    /// The structural window as a chrono duration, for timestamp arithmetic.
    pub fn structural_window_chrono(&self) -> chrono::Duration {
        to_chrono(self.structural_window)
    }

    pub fn change_retention_chrono(&self) -> chrono::Duration {
        to_chrono(self.change_retention)
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> TallyError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
    .into()
}
