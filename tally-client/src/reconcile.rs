//! Periodic pull that catches up on anything the push channel missed.

use crate::api_client::SyncBackend;
use crate::error::ClientResult;
use crate::filter::SessionFilter;
use tally_api::types::PullCursor;
use tally_core::{CellChange, ChangeEvent, EntityId};
use tracing::{debug, warn};

/// What one poll brought back, already filtered of this session's events.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciled {
    /// Field writes in the order they were made.
    pub changes: Vec<CellChange>,
    /// Entities created or deleted elsewhere.
    pub structural: Vec<EntityId>,
}

impl Reconciled {
    pub fn needs_refresh(&self) -> bool {
        !self.structural.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.structural.is_empty()
    }
}

/// Holds the pull cursor. The cursor only advances after a successful poll,
/// so a failed one is retried from the same point next time.
#[derive(Debug, Clone, Default)]
pub struct ReconciliationPoller {
    cursor: Option<PullCursor>,
}

impl ReconciliationPoller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cursor(cursor: PullCursor) -> Self {
        Self {
            cursor: Some(cursor),
        }
    }

    pub fn cursor(&self) -> Option<PullCursor> {
        self.cursor
    }

    pub async fn poll(
        &mut self,
        backend: &dyn SyncBackend,
        filter: &SessionFilter,
    ) -> ClientResult<Reconciled> {
        let response = match backend.pull(self.cursor).await {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, cursor = ?self.cursor, "Reconciliation poll failed");
                return Err(err);
            }
        };

        let received = response.changes.len();
        let reconciled = split_events(
            response
                .changes
                .into_iter()
                .filter(|event| filter.admit_event(event)),
        );
        self.cursor = Some(response.cursor);
        if received > 0 {
            debug!(
                received,
                changes = reconciled.changes.len(),
                structural = reconciled.structural.len(),
                "Reconciled missed events"
            );
        }
        Ok(reconciled)
    }
}

fn split_events(events: impl Iterator<Item = ChangeEvent>) -> Reconciled {
    let mut reconciled = Reconciled::default();
    for event in events {
        if event.kind.is_structural() {
            reconciled.structural.push(event.entity_id);
        } else if let Some(change) = event.to_cell_change() {
            reconciled.changes.push(change);
        }
    }
    reconciled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBackend;
    use tally_core::{
        now, CellValue, EventId, EventKind, FieldKey, GridSnapshot, NewChangeEvent, Origin, SessionId,
        TenantId, UserId,
    };

    fn origin(session: &str) -> Origin {
        Origin::new(TenantId::new(1), SessionId::new(session), UserId::new("u"))
    }

    fn field_event(id: i64, session: &str, value: f64) -> ChangeEvent {
        NewChangeEvent::field_update(
            &origin(session),
            FieldKey::expense(1, 2),
            CellValue::Empty,
            value.into(),
        )
        .into_event(EventId::new(id))
    }

    #[tokio::test]
    async fn test_cursor_advances_only_on_success() {
        let backend = MockBackend::new(GridSnapshot::default());
        let filter = SessionFilter::new(SessionId::new("me"));
        let mut poller = ReconciliationPoller::new();

        backend.fail_pulls(1);
        assert!(poller.poll(&backend, &filter).await.is_err());
        assert_eq!(poller.cursor(), None);

        let event = field_event(1, "other", 4.0);
        let position = PullCursor::after(&event);
        backend.queue_events([event]);
        let reconciled = poller.poll(&backend, &filter).await.expect("poll should succeed");
        assert_eq!(reconciled.changes.len(), 1);
        assert_eq!(poller.cursor(), Some(position));

        // The next poll resumes from the cursor.
        poller.poll(&backend, &filter).await.expect("poll should succeed");
        assert_eq!(backend.pulls(), vec![None, None, Some(position)]);
    }

    #[tokio::test]
    async fn test_own_and_structural_events_are_split() {
        let backend = MockBackend::new(GridSnapshot::default());
        let filter = SessionFilter::new(SessionId::new("me"));
        let mut poller = ReconciliationPoller::with_cursor(PullCursor::at(now()));

        let structural = NewChangeEvent::structural(&origin("other"), EventKind::NewEntity, EntityId::new(9))
            .into_event(EventId::new(3));
        backend.queue_events([field_event(1, "me", 1.0), field_event(2, "other", 2.0), structural]);

        let reconciled = poller.poll(&backend, &filter).await.expect("poll should succeed");
        assert_eq!(reconciled.changes.len(), 1);
        assert_eq!(reconciled.changes[0].value, CellValue::Number(2.0));
        assert_eq!(reconciled.structural, vec![EntityId::new(9)]);
        assert!(reconciled.needs_refresh());
    }
}
