//! In-process [`SyncBackend`] for tests and offline runs.

use crate::api_client::SyncBackend;
use crate::error::{ClientError, ClientResult};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tally_api::types::{
    BulkRequest, BulkResponse, CreateEntityRequest, DeleteEntityResponse, FlushRequest,
    FlushResponse, PullCursor, PullResponse,
};
use tally_core::{
    new_operation_id, now, BatchChunker, ChangeEvent, Entity, EntityId, GridSnapshot, TenantId,
};

#[derive(Debug, Default)]
struct MockState {
    snapshot: GridSnapshot,
    queued_events: VecDeque<ChangeEvent>,
    failing_pulls: usize,
    failing_snapshots: usize,
    failing_flushes: usize,
    flush_failure_retryable: bool,
    flush_delay: Duration,
    next_entity_id: i64,
    flushes: Vec<FlushRequest>,
    flush_attempts: usize,
    bulks: Vec<BulkRequest>,
    pulls: Vec<Option<PullCursor>>,
    snapshot_loads: usize,
}

/// Records every call and serves scripted responses.
#[derive(Debug, Default)]
pub struct MockBackend {
    state: Mutex<MockState>,
}

impl MockBackend {
    pub fn new(snapshot: GridSnapshot) -> Self {
        Self {
            state: Mutex::new(MockState {
                snapshot,
                next_entity_id: 10_000,
                ..MockState::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_snapshot(&self, snapshot: GridSnapshot) {
        self.state().snapshot = snapshot;
    }

    /// Serve these events on the next successful pull.
    pub fn queue_events(&self, events: impl IntoIterator<Item = ChangeEvent>) {
        self.state().queued_events.extend(events);
    }

    pub fn fail_pulls(&self, count: usize) {
        self.state().failing_pulls = count;
    }

    pub fn fail_snapshots(&self, count: usize) {
        self.state().failing_snapshots = count;
    }

    pub fn fail_flushes(&self, count: usize, retryable: bool) {
        let mut state = self.state();
        state.failing_flushes = count;
        state.flush_failure_retryable = retryable;
    }

    /// Hold every flush for `delay` before answering.
    pub fn delay_flushes(&self, delay: Duration) {
        self.state().flush_delay = delay;
    }

    /// Successful flush requests, in arrival order.
    pub fn flushes(&self) -> Vec<FlushRequest> {
        self.state().flushes.clone()
    }

    /// All flush attempts, failed ones included.
    pub fn flush_attempts(&self) -> usize {
        self.state().flush_attempts
    }

    pub fn bulks(&self) -> Vec<BulkRequest> {
        self.state().bulks.clone()
    }

    /// The cursor of each pull, failed ones included.
    pub fn pulls(&self) -> Vec<Option<PullCursor>> {
        self.state().pulls.clone()
    }

    /// Successful snapshot loads.
    pub fn snapshot_loads(&self) -> usize {
        self.state().snapshot_loads
    }
}

fn unavailable(retryable: bool) -> ClientError {
    ClientError::Rejected {
        status: if retryable { 503 } else { 400 },
        message: "Scripted failure".to_string(),
        retryable,
    }
}

#[async_trait]
impl SyncBackend for MockBackend {
    async fn flush(&self, request: &FlushRequest) -> ClientResult<FlushResponse> {
        let delay = {
            let mut state = self.state();
            state.flush_attempts += 1;
            state.flush_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if state.failing_flushes > 0 {
            state.failing_flushes -= 1;
            return Err(unavailable(state.flush_failure_retryable));
        }
        state.flushes.push(request.clone());
        Ok(FlushResponse {
            saved: request.changes.len(),
            total: request.changes.len(),
            skipped: 0,
            errors: Vec::new(),
        })
    }

    async fn bulk(&self, request: &BulkRequest) -> ClientResult<BulkResponse> {
        let mut state = self.state();
        state.bulks.push(request.clone());
        Ok(BulkResponse {
            operation_id: request.operation_id.unwrap_or_else(new_operation_id),
            saved: request.changes.len(),
            total: request.changes.len(),
            skipped: 0,
            chunk_count: BatchChunker::default().chunk_count(request.changes.len()),
            errors: Vec::new(),
        })
    }

    async fn pull(&self, cursor: Option<PullCursor>) -> ClientResult<PullResponse> {
        let mut state = self.state();
        state.pulls.push(cursor);
        if state.failing_pulls > 0 {
            state.failing_pulls -= 1;
            return Err(unavailable(true));
        }
        let changes: Vec<ChangeEvent> = state.queued_events.drain(..).collect();
        let cursor = changes
            .iter()
            .max_by_key(|e| (e.created_at, e.id))
            .map(PullCursor::after)
            .or(cursor)
            .unwrap_or_else(|| PullCursor::at(now()));
        Ok(PullResponse { changes, cursor })
    }

    async fn snapshot(&self) -> ClientResult<GridSnapshot> {
        let mut state = self.state();
        if state.failing_snapshots > 0 {
            state.failing_snapshots -= 1;
            return Err(unavailable(true));
        }
        state.snapshot_loads += 1;
        Ok(state.snapshot.clone())
    }

    async fn create_entity(&self, request: &CreateEntityRequest) -> ClientResult<Entity> {
        let mut state = self.state();
        state.next_entity_id += 1;
        let tenant_id = state
            .snapshot
            .rows
            .first()
            .map(|e| e.tenant_id)
            .unwrap_or(TenantId::new(1));
        Ok(Entity {
            id: EntityId::new(state.next_entity_id),
            tenant_id,
            kind: request.kind,
            name: request.name.clone(),
            created_at: now(),
        })
    }

    async fn delete_entity(&self, id: EntityId) -> ClientResult<DeleteEntityResponse> {
        Ok(DeleteEntityResponse {
            entity_id: id,
            deleted: true,
        })
    }
}
