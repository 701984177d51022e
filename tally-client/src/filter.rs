//! Dropping echoes of this session's own mutations.

use tally_api::SyncMessage;
use tally_core::{ChangeEvent, SessionId};

/// Admits only messages caused by some other session.
///
/// The server already excludes the originating connection, but a session
/// that reconnected (new connection, same session id) or a pull that
/// overlaps a push can still surface its own events.
#[derive(Debug, Clone)]
pub struct SessionFilter {
    own: SessionId,
}

impl SessionFilter {
    pub fn new(own: SessionId) -> Self {
        Self { own }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.own
    }

    /// Connection messages have no origin and are always admitted.
    pub fn admit(&self, message: &SyncMessage) -> bool {
        message.origin().map_or(true, |origin| *origin != self.own)
    }

    pub fn admit_event(&self, event: &ChangeEvent) -> bool {
        event.session_id != self.own
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::{CellChange, FieldKey, OperationId, TenantId};

    #[test]
    fn test_own_mutations_are_dropped() {
        let me = SessionId::new("me");
        let other = SessionId::new("other");
        let filter = SessionFilter::new(me.clone());
        let change = CellChange::new(FieldKey::expense(1, 2), 3.0.into());

        assert!(!filter.admit(&SyncMessage::cell_updated(&me, change.clone())));
        assert!(filter.admit(&SyncMessage::cell_updated(&other, change)));
        assert!(!filter.admit(&SyncMessage::sync_done(&me, OperationId::nil(), 1, 1)));
    }

    #[test]
    fn test_connection_messages_are_admitted() {
        let filter = SessionFilter::new(SessionId::new("me"));
        let connected = SyncMessage::Connected {
            tenant_id: TenantId::new(1),
            session_id: SessionId::new("me"),
            timestamp: tally_core::now(),
        };
        assert!(filter.admit(&connected));
        assert!(filter.admit(&SyncMessage::Error {
            message: "lagged".to_string()
        }));
    }
}
