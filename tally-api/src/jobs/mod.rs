//! Background Jobs for the Tally API
//!
//! - `retention_sweep`: prunes the dedup ledger and aged change events
//!
//! # Usage
//!
//! ```ignore
//! use tally_api::jobs::{retention_sweep_task, RetentionSweepConfig};
//! use tokio::sync::watch;
//!
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! tokio::spawn(retention_sweep_task(store.clone(), RetentionSweepConfig::default(), shutdown_rx));
//!
//! // On shutdown
//! let _ = shutdown_tx.send(true);
//! ```

pub mod retention_sweep;

pub use retention_sweep::{
    retention_sweep_task, RetentionSweepConfig, RetentionSweepMetrics, RetentionSweepSnapshot,
};
