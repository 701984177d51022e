//! Cooperative dispatcher for one logical client session.
//!
//! All grid state is owned here and mutated only from `&mut self` handlers,
//! so edits, pushes, polls and refreshes never interleave mid-update. The
//! only suspension points are network calls and the frame yield between
//! chunks of a large update.

use crate::api_client::SyncBackend;
use crate::autosave::{AutosaveEvent, AutosaveHandle, AutosaveScheduler};
use crate::buffer::ChangeBuffer;
use crate::error::ClientResult;
use crate::events::ClientEvent;
use crate::filter::SessionFilter;
use crate::grid::{ApplyOutcome, BatchApply, Grid};
use crate::operations::{Completion, OperationTracker};
use crate::pacer::FramePacer;
use crate::reconcile::ReconciliationPoller;
use std::sync::Arc;
use std::time::Duration;
use tally_api::types::{BulkRequest, BulkResponse, CreateEntityRequest};
use tally_api::SyncMessage;
use tally_core::{
    new_operation_id, CellChange, CellValue, Entity, EntityId, EntityKind, FieldKey, SessionId,
    SyncConfig,
};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Pending operations older than this are assumed lost.
pub const OPERATION_TIMEOUT: Duration = Duration::from_secs(300);

/// What handling one push message did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// Echo of this session's own mutation.
    Dropped,
    Applied(BatchApply),
    /// The grid was reloaded from a snapshot.
    Refreshed,
    OperationClosed(Completion),
    /// A reconciliation poll ran in response.
    Reconciled(ReconcileReport),
    Ignored,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub applied: BatchApply,
    pub refreshed: bool,
}

pub struct SyncSession {
    backend: Arc<dyn SyncBackend>,
    grid: Grid,
    filter: SessionFilter,
    operations: OperationTracker,
    poller: ReconciliationPoller,
    autosave: AutosaveHandle,
    pacer: FramePacer,
    poll_interval: Duration,
    /// A structural change was seen but the reload has not succeeded yet.
    refresh_pending: bool,
}

impl SyncSession {
    /// Create the session and start its autosave task.
    pub fn new(
        backend: Arc<dyn SyncBackend>,
        session_id: SessionId,
        config: &SyncConfig,
        frame: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<AutosaveEvent>) {
        let (autosave, autosave_events) =
            AutosaveScheduler::from_config(Arc::clone(&backend), config).spawn();
        let session = Self {
            backend,
            grid: Grid::new(),
            filter: SessionFilter::new(session_id),
            operations: OperationTracker::new(),
            poller: ReconciliationPoller::new(),
            autosave,
            pacer: FramePacer::new(config.chunk_size, frame),
            poll_interval: config.poll_interval,
            refresh_pending: false,
        };
        (session, autosave_events)
    }

    pub fn session_id(&self) -> &SessionId {
        self.filter.session_id()
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn operations(&self) -> &OperationTracker {
        &self.operations
    }

    pub fn poller(&self) -> &ReconciliationPoller {
        &self.poller
    }

    pub fn refresh_pending(&self) -> bool {
        self.refresh_pending
    }

    /// Initial load, or a full refresh after a structural change.
    pub async fn load(&mut self) -> ClientResult<()> {
        let snapshot = self.backend.snapshot().await?;
        self.grid.load(snapshot);
        self.refresh_pending = false;
        info!(
            session_id = %self.session_id(),
            rows = self.grid.rows().len(),
            columns = self.grid.columns().len(),
            "Grid loaded"
        );
        Ok(())
    }

    // ========================================================================
    // LOCAL MUTATIONS
    // ========================================================================

    /// Apply a local edit and hand it to autosave. Returns `false` if the
    /// cell is not rendered.
    pub fn edit(&mut self, key: FieldKey, value: CellValue) -> ClientResult<bool> {
        let Some(old_value) = self.grid.local_edit(&key, value.clone()) else {
            return Ok(false);
        };
        self.autosave.record(key, old_value, value)?;
        Ok(true)
    }

    /// Ask autosave to send whatever is buffered now.
    pub fn flush_now(&self) -> ClientResult<()> {
        self.autosave.flush_now()
    }

    /// Apply a large update locally, frame by frame, and persist it as one
    /// multi-part operation.
    ///
    /// The operation closes on the response: the `SYNC_DONE` the server
    /// pushes for it carries this session's id and is dropped as an echo.
    pub async fn bulk_edit(&mut self, changes: Vec<CellChange>) -> ClientResult<BulkResponse> {
        let operation_id = new_operation_id();
        self.operations
            .begin(operation_id, self.pacer.chunker().chunk_count(changes.len()));
        let request = BulkRequest {
            operation_id: Some(operation_id),
            changes,
        };
        self.pacer.apply(&mut self.grid, request.changes.clone()).await;

        match self.backend.bulk(&request).await {
            Ok(response) => {
                let completion = self.operations.on_done(
                    operation_id,
                    response.chunk_count,
                    response.total,
                );
                debug!(
                    operation_id = %operation_id,
                    saved = response.saved,
                    completion = ?completion,
                    "Bulk operation persisted"
                );
                Ok(response)
            }
            Err(err) => {
                self.operations.forget(&operation_id);
                Err(err)
            }
        }
    }

    pub async fn create_entity(&mut self, kind: EntityKind, name: &str) -> ClientResult<Entity> {
        let entity = self
            .backend
            .create_entity(&CreateEntityRequest {
                kind,
                name: name.to_string(),
            })
            .await?;
        self.grid.insert_entity(entity.clone());
        Ok(entity)
    }

    pub async fn delete_entity(&mut self, id: EntityId) -> ClientResult<bool> {
        let response = self.backend.delete_entity(id).await?;
        if response.deleted {
            self.grid.remove_entity(id);
        }
        Ok(response.deleted)
    }

    // ========================================================================
    // INCOMING
    // ========================================================================

    pub async fn handle_event(&mut self, event: ClientEvent) -> ClientResult<Handled> {
        match event {
            ClientEvent::Push(message) => self.handle_message(*message).await,
            ClientEvent::Reconnected { connection } => {
                debug!(connection, "Catching up after connect");
                Ok(Handled::Reconciled(self.reconcile().await?))
            }
            ClientEvent::Disconnected { reason } => {
                info!(reason = %reason, "Push channel disconnected");
                Ok(Handled::Ignored)
            }
            ClientEvent::TransportError(message) => {
                debug!(error = %message, "Push channel error");
                Ok(Handled::Ignored)
            }
        }
    }

    pub async fn handle_message(&mut self, message: SyncMessage) -> ClientResult<Handled> {
        if !self.filter.admit(&message) {
            debug!(event_type = message.event_type(), "Dropped own echo");
            return Ok(Handled::Dropped);
        }

        match message {
            SyncMessage::CellUpdated { change, .. } => {
                let mut result = BatchApply::default();
                match self.grid.apply(&change) {
                    ApplyOutcome::Applied => result.applied = 1,
                    ApplyOutcome::Unchanged => result.unchanged = 1,
                    ApplyOutcome::NotFound => result.missed = 1,
                }
                Ok(Handled::Applied(result))
            }
            SyncMessage::CellsUpdated {
                operation_id,
                chunk_index,
                chunk_count,
                changes,
                ..
            } => {
                let count = changes.len();
                let paced = self.pacer.apply(&mut self.grid, changes).await;
                if let Some(operation_id) = operation_id {
                    self.operations
                        .on_chunk(operation_id, chunk_index, chunk_count, count);
                }
                Ok(Handled::Applied(paced.result))
            }
            SyncMessage::EntityCreated { entity, .. } => {
                let mut result = BatchApply::default();
                if self.grid.insert_entity(entity) {
                    result.applied = 1;
                } else {
                    result.unchanged = 1;
                }
                Ok(Handled::Applied(result))
            }
            SyncMessage::RefreshRequired { reason, .. } => {
                debug!(reason = %reason, "Refresh requested");
                self.load().await?;
                Ok(Handled::Refreshed)
            }
            SyncMessage::SyncDone {
                operation_id,
                chunk_count,
                total,
                ..
            } => {
                let completion = self.operations.on_done(operation_id, chunk_count, total);
                if !completion.is_complete() {
                    self.reconcile().await?;
                }
                Ok(Handled::OperationClosed(completion))
            }
            SyncMessage::Connected { session_id, .. } => {
                debug!(session_id = %session_id, "Server acknowledged connection");
                Ok(Handled::Ignored)
            }
            SyncMessage::Error { message } => {
                warn!(error = %message, "Server reported a push error; reconciling");
                Ok(Handled::Reconciled(self.reconcile().await?))
            }
        }
    }

    /// Pull everything missed since the last successful poll. Field writes
    /// are applied paced; any structural event causes one full reload.
    ///
    /// The poll has already moved the cursor and claimed the structural
    /// events, so a failed reload stays pending and is retried on the next
    /// reconcile, and this poll's field writes are applied regardless.
    pub async fn reconcile(&mut self) -> ClientResult<ReconcileReport> {
        let reconciled = self
            .poller
            .poll(self.backend.as_ref(), &self.filter)
            .await?;
        if reconciled.needs_refresh() {
            self.refresh_pending = true;
        }

        let mut report = ReconcileReport::default();
        if self.refresh_pending {
            match self.load().await {
                // The reload already carries every value the field events would set.
                Ok(()) => report.refreshed = true,
                Err(err) => {
                    warn!(error = %err, "Reload after structural change failed; will retry");
                    if !reconciled.changes.is_empty() {
                        self.pacer.apply(&mut self.grid, reconciled.changes).await;
                    }
                    return Err(err);
                }
            }
        } else if !reconciled.changes.is_empty() {
            report.applied = self.pacer.apply(&mut self.grid, reconciled.changes).await.result;
        }
        Ok(report)
    }

    /// Dispatch events and poll on the interval until `shutdown` flips.
    pub async fn run(
        &mut self,
        mut events: mpsc::Receiver<ClientEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = events.recv() => match event {
                    Some(event) => {
                        if let Err(err) = self.handle_event(event).await {
                            warn!(error = %err, "Failed to handle client event");
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if let Err(err) = self.reconcile().await {
                        warn!(error = %err, "Scheduled reconciliation failed");
                    }
                    for operation_id in self.operations.expire(OPERATION_TIMEOUT) {
                        warn!(operation_id = %operation_id, "Bulk operation never completed");
                    }
                }
            }
        }
        info!(session_id = %self.session_id(), "Session loop stopped");
    }

    /// Stop autosave after a final flush; returns edits that could not be saved.
    pub async fn close(self) -> ChangeBuffer {
        self.autosave.shutdown().await
    }
}
