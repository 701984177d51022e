//! End-to-end behaviour of a client session against a scripted backend.

use std::sync::Arc;
use std::time::Duration;
use tally_api::SyncMessage;
use tally_client::mock::MockBackend;
use tally_client::operations::Completion;
use tally_client::{ClientEvent, Handled, SyncSession};
use tally_core::{
    new_operation_id, CellValue, ChangeEvent, EntityId, EventId, EventKind, NewChangeEvent,
    SessionId, SyncConfig,
};
use tally_storage::GridStore;
use tally_test_utils::fixtures::{expense_changes, origin, seed_grid, tenant_id_default, SeededGrid};
use tally_test_utils::InMemoryStore;
use tokio::sync::{mpsc, watch};

const ME: &str = "session-me";
const OTHER: &str = "session-other";

struct Harness {
    backend: Arc<MockBackend>,
    session: SyncSession,
    grid: SeededGrid,
}

async fn harness(accounts: usize, clients: usize) -> Harness {
    let store = InMemoryStore::new();
    let owner = origin(tenant_id_default(), OTHER);
    let grid = seed_grid(&store, &owner, accounts, clients)
        .await
        .expect("seed should succeed");
    let snapshot = store
        .snapshot(tenant_id_default())
        .await
        .expect("snapshot should succeed");

    let backend = Arc::new(MockBackend::new(snapshot));
    let config = SyncConfig {
        chunk_size: 1000,
        ..SyncConfig::default()
    };
    let (mut session, _autosave_events) =
        SyncSession::new(backend.clone(), SessionId::new(ME), &config, Duration::ZERO);
    session.load().await.expect("load should succeed");
    Harness {
        backend,
        session,
        grid,
    }
}

fn field_event(id: i64, session: &str, grid: &SeededGrid, value: f64) -> ChangeEvent {
    NewChangeEvent::field_update(
        &origin(tenant_id_default(), session),
        grid.expense_key(0, 0),
        CellValue::Empty,
        value.into(),
    )
    .into_event(EventId::new(id))
}

fn structural_event(id: i64, entity: EntityId) -> ChangeEvent {
    NewChangeEvent::structural(&origin(tenant_id_default(), OTHER), EventKind::NewEntity, entity)
        .into_event(EventId::new(id))
}

#[tokio::test]
async fn test_bulk_update_applies_three_chunks_then_completes() {
    let mut h = harness(50, 50).await;
    let other = SessionId::new(OTHER);
    let operation_id = new_operation_id();
    let changes = expense_changes(&h.grid, 2500);
    let before = h.session.grid().revision();

    let chunks: Vec<_> = changes.chunks(1000).map(|c| c.to_vec()).collect();
    assert_eq!(chunks.len(), 3);
    for (index, chunk) in chunks.into_iter().enumerate() {
        let message = SyncMessage::cells_updated(&other, Some(operation_id), index, 3, chunk);
        let handled = h
            .session
            .handle_message(message)
            .await
            .expect("chunk should apply");
        assert!(matches!(handled, Handled::Applied(result) if result.applied > 0));
        // An interim chunk never finishes the operation.
        assert!(h.session.operations().is_pending(&operation_id));
    }
    assert_eq!(h.session.grid().revision(), before + 3);

    let done = SyncMessage::sync_done(&other, operation_id, 3, 2500);
    let handled = h
        .session
        .handle_message(done)
        .await
        .expect("completion should apply");
    assert_eq!(
        handled,
        Handled::OperationClosed(Completion::Complete { chunks: 3, total: 2500 })
    );
    assert!(!h.session.operations().is_pending(&operation_id));
    assert_eq!(h.session.grid().filled_cells(), 2500);
}

#[tokio::test]
async fn test_bulk_edit_closes_own_operation_on_response() {
    let mut h = harness(50, 50).await;
    let changes = expense_changes(&h.grid, 2500);

    let response = h
        .session
        .bulk_edit(changes)
        .await
        .expect("bulk edit should succeed");
    assert_eq!(response.saved, 2500);
    assert_eq!(h.backend.bulks().len(), 1);
    assert_eq!(h.session.grid().filled_cells(), 2500);
    assert_eq!(h.session.operations().pending_count(), 0);

    // The server's completion for this operation is an echo of our own write.
    let echo = SyncMessage::sync_done(&SessionId::new(ME), response.operation_id, 3, 2500);
    let handled = h
        .session
        .handle_message(echo)
        .await
        .expect("handling should succeed");
    assert_eq!(handled, Handled::Dropped);
    assert_eq!(h.session.operations().pending_count(), 0);
}

#[tokio::test]
async fn test_own_messages_are_discarded() {
    let mut h = harness(2, 2).await;
    let key = h.grid.expense_key(0, 0);
    let own = SyncMessage::cell_updated(
        &SessionId::new(ME),
        tally_core::CellChange::new(key.clone(), 42.0.into()),
    );

    let handled = h.session.handle_message(own).await.expect("handling should succeed");
    assert_eq!(handled, Handled::Dropped);
    assert_eq!(h.session.grid().value(&key), Some(&CellValue::Empty));

    let foreign = SyncMessage::cell_updated(
        &SessionId::new(OTHER),
        tally_core::CellChange::new(key.clone(), 42.0.into()),
    );
    h.session.handle_message(foreign).await.expect("handling should succeed");
    assert_eq!(h.session.grid().value(&key), Some(&CellValue::Number(42.0)));
}

#[tokio::test]
async fn test_reconnect_triggers_catch_up_poll() {
    let mut h = harness(2, 2).await;
    h.backend.queue_events([
        field_event(1, OTHER, &h.grid, 7.0),
        field_event(2, ME, &h.grid, 99.0),
    ]);

    let handled = h
        .session
        .handle_event(ClientEvent::Reconnected { connection: 2 })
        .await
        .expect("catch-up should succeed");

    assert!(matches!(handled, Handled::Reconciled(report) if report.applied.applied == 1));
    assert_eq!(h.backend.pulls().len(), 1);
    assert!(h.session.poller().cursor().is_some());
    assert_eq!(
        h.session.grid().value(&h.grid.expense_key(0, 0)),
        Some(&CellValue::Number(7.0))
    );
}

#[tokio::test]
async fn test_structural_events_cause_single_refresh() {
    let mut h = harness(2, 2).await;
    assert_eq!(h.backend.snapshot_loads(), 1);
    h.backend.queue_events([
        structural_event(1, EntityId::new(500)),
        structural_event(2, EntityId::new(501)),
        field_event(3, OTHER, &h.grid, 1.0),
    ]);

    let report = h.session.reconcile().await.expect("reconcile should succeed");
    assert!(report.refreshed);
    assert_eq!(h.backend.snapshot_loads(), 2);

    // Nothing new: no further reload.
    let report = h.session.reconcile().await.expect("reconcile should succeed");
    assert!(!report.refreshed);
    assert_eq!(h.backend.snapshot_loads(), 2);
}

#[tokio::test]
async fn test_failed_poll_keeps_cursor_and_recovers() {
    let mut h = harness(2, 2).await;
    h.backend.fail_pulls(1);
    assert!(h.session.reconcile().await.is_err());
    assert_eq!(h.session.poller().cursor(), None);

    h.backend.queue_events([field_event(1, OTHER, &h.grid, 3.0)]);
    h.session.reconcile().await.expect("reconcile should succeed");
    assert_eq!(
        h.session.grid().value(&h.grid.expense_key(0, 0)),
        Some(&CellValue::Number(3.0))
    );
}

#[tokio::test]
async fn test_failed_reload_is_retried_and_keeps_field_changes() {
    let mut h = harness(2, 2).await;
    h.backend.queue_events([
        structural_event(1, EntityId::new(500)),
        field_event(2, OTHER, &h.grid, 7.0),
    ]);
    h.backend.fail_snapshots(1);

    assert!(h.session.reconcile().await.is_err());
    assert!(h.session.refresh_pending());
    assert_eq!(h.backend.snapshot_loads(), 1);
    assert_eq!(
        h.session.grid().value(&h.grid.expense_key(0, 0)),
        Some(&CellValue::Number(7.0))
    );

    // Nothing new on the next poll, but the reload is still owed.
    let report = h.session.reconcile().await.expect("reconcile should succeed");
    assert!(report.refreshed);
    assert!(!h.session.refresh_pending());
    assert_eq!(h.backend.snapshot_loads(), 2);
    assert_eq!(h.backend.pulls().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_local_edits_are_autosaved() {
    let mut h = harness(2, 2).await;
    let key = h.grid.expense_key(1, 1);

    assert!(h.session.edit(key.clone(), 10.0.into()).expect("edit should succeed"));
    assert!(h.session.edit(key.clone(), 20.0.into()).expect("edit should succeed"));
    assert!(!h
        .session
        .edit(tally_core::FieldKey::expense(9_999, 1), 1.0.into())
        .expect("edit should succeed"));

    tokio::time::sleep(Duration::from_secs(1)).await;
    let flushes = h.backend.flushes();
    assert_eq!(flushes.len(), 1);
    assert_eq!(flushes[0].changes.len(), 1);
    assert_eq!(flushes[0].changes[0].value, CellValue::Number(20.0));

    let unsaved = h.session.close().await;
    assert!(unsaved.is_empty());
}

#[tokio::test]
async fn test_run_loop_dispatches_until_events_close() {
    let mut h = harness(2, 2).await;
    let key = h.grid.expense_key(0, 1);
    let (event_tx, event_rx) = mpsc::channel(16);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let message = SyncMessage::cell_updated(
        &SessionId::new(OTHER),
        tally_core::CellChange::new(key.clone(), 5.0.into()),
    );
    event_tx
        .send(ClientEvent::Push(Box::new(message)))
        .await
        .expect("send should succeed");
    drop(event_tx);

    h.session.run(event_rx, shutdown_rx).await;
    assert_eq!(h.session.grid().value(&key), Some(&CellValue::Number(5.0)));
}

#[tokio::test]
async fn test_run_loop_stops_on_shutdown() {
    let mut h = harness(1, 1).await;
    let (_event_tx, event_rx) = mpsc::channel::<ClientEvent>(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    shutdown_tx.send(true).expect("shutdown should succeed");

    tokio::time::timeout(Duration::from_secs(5), h.session.run(event_rx, shutdown_rx))
        .await
        .expect("loop should stop");
}
