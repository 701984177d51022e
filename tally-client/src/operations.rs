//! Tracking of multi-part bulk operations.
//!
//! An operation stays pending until its `SYNC_DONE` arrives, however many
//! interim chunks have been applied. Chunks carry their index, so a
//! receiver can tell whether it saw every part once the operation closes.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tally_core::OperationId;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct Progress {
    seen: BTreeSet<usize>,
    chunk_count: usize,
    changes: usize,
    /// Started by this session; its chunks are applied locally, not pushed back.
    own: bool,
    started: Instant,
}

impl Progress {
    fn new(chunk_count: usize, own: bool) -> Self {
        Self {
            seen: BTreeSet::new(),
            chunk_count,
            changes: 0,
            own,
            started: Instant::now(),
        }
    }
}

/// How an operation closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Every announced chunk was received.
    Complete { chunks: usize, total: usize },
    /// Some chunks never arrived; the grid needs reconciling.
    Incomplete { received: usize, expected: usize },
}

impl Completion {
    pub fn is_complete(&self) -> bool {
        matches!(self, Completion::Complete { .. })
    }
}

#[derive(Debug, Default)]
pub struct OperationTracker {
    pending: HashMap<OperationId, Progress>,
}

impl OperationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operation this session started before any chunk arrives.
    pub fn begin(&mut self, operation_id: OperationId, chunk_count: usize) {
        self.pending
            .entry(operation_id)
            .or_insert_with(|| Progress::new(chunk_count, true));
    }

    /// Record an interim chunk. The operation remains pending.
    pub fn on_chunk(
        &mut self,
        operation_id: OperationId,
        chunk_index: usize,
        chunk_count: usize,
        changes: usize,
    ) {
        let progress = self
            .pending
            .entry(operation_id)
            .or_insert_with(|| Progress::new(chunk_count, false));
        progress.chunk_count = progress.chunk_count.max(chunk_count);
        if progress.seen.insert(chunk_index) {
            progress.changes += changes;
        }
        debug!(
            operation_id = %operation_id,
            chunk_index,
            chunk_count,
            "Applied bulk chunk"
        );
    }

    /// Close the operation.
    pub fn on_done(
        &mut self,
        operation_id: OperationId,
        chunk_count: usize,
        total: usize,
    ) -> Completion {
        let (received, own, announced) = self
            .pending
            .remove(&operation_id)
            .map(|p| (p.seen.len(), p.own, p.chunk_count))
            .unwrap_or((0, false, 0));
        let expected = chunk_count.max(announced);
        if own || received >= expected {
            Completion::Complete {
                chunks: chunk_count,
                total,
            }
        } else {
            warn!(
                operation_id = %operation_id,
                received,
                expected,
                "Bulk operation closed with missing chunks"
            );
            Completion::Incomplete { received, expected }
        }
    }

    /// Drop an operation that will never complete (its request failed).
    pub fn forget(&mut self, operation_id: &OperationId) -> bool {
        self.pending.remove(operation_id).is_some()
    }

    pub fn is_pending(&self, operation_id: &OperationId) -> bool {
        self.pending.contains_key(operation_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Changes applied so far for a pending operation.
    pub fn applied_changes(&self, operation_id: &OperationId) -> Option<usize> {
        self.pending.get(operation_id).map(|p| p.changes)
    }

    /// Forget operations whose `SYNC_DONE` never came.
    pub fn expire(&mut self, max_age: Duration) -> Vec<OperationId> {
        let expired: Vec<OperationId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.started.elapsed() >= max_age)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.pending.remove(id);
        }
        expired
    }
}
