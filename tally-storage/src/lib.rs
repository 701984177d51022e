//! Tally Storage - Persistence Traits and In-Memory Implementation
//!
//! Defines the storage abstraction for the synchronization engine: the
//! append-only change log, the structural-event dedup ledger and the
//! current grid state. The PostgreSQL implementation lives in tally-api.

pub mod change_log;
pub mod dedup;
pub mod grid_store;
pub mod memory;

pub use change_log::{ChangeLog, ChangeQuery};
pub use dedup::DedupTracker;
pub use grid_store::{CellWrite, CellWriteOutcome, GridStore};
pub use memory::InMemoryStore;

/// Everything the server needs from persistence.
pub trait SyncStore: ChangeLog + DedupTracker + GridStore {}

impl<T> SyncStore for T where T: ChangeLog + DedupTracker + GridStore {}
