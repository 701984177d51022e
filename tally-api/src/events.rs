//! Push Message Types
//!
//! Every message sent over the push channel is one variant of
//! [`SyncMessage`]. Mutation messages carry the `sessionId` that caused them
//! so receivers can drop their own echoes even when the connection-level
//! exclusion did not apply (reconnects, broadcast-to-all signals).

use serde::{Deserialize, Serialize};
use tally_core::{
    now, CellChange, Entity, EntityId, OperationId, SessionId, TenantId, Timestamp,
};

/// Message pushed to live sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum SyncMessage {
    // ========================================================================
    // MUTATIONS
    // ========================================================================
    /// One cell changed.
    CellUpdated {
        session_id: SessionId,
        timestamp: Timestamp,
        change: CellChange,
    },

    /// Several cells changed; apply all of them in one grid update.
    ///
    /// Interim chunks of a multi-part operation carry its `operation_id`;
    /// the operation is only complete once `SYNC_DONE` arrives.
    CellsUpdated {
        session_id: SessionId,
        timestamp: Timestamp,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        operation_id: Option<OperationId>,
        chunk_index: usize,
        chunk_count: usize,
        changes: Vec<CellChange>,
    },

    /// An entity was created.
    EntityCreated {
        session_id: SessionId,
        timestamp: Timestamp,
        entity: Entity,
    },

    /// The row or column set changed in a way that needs a full reload.
    RefreshRequired {
        session_id: SessionId,
        timestamp: Timestamp,
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        entity_id: Option<EntityId>,
    },

    /// Every chunk of a multi-part operation has been persisted.
    SyncDone {
        session_id: SessionId,
        timestamp: Timestamp,
        operation_id: OperationId,
        chunk_count: usize,
        total: usize,
    },

    // ========================================================================
    // CONNECTION
    // ========================================================================
    /// First message on every connection.
    Connected {
        tenant_id: TenantId,
        session_id: SessionId,
        timestamp: Timestamp,
    },

    /// Something went wrong on this connection (e.g. the receiver lagged
    /// and pushes were dropped). Receivers should reconcile by pull.
    Error { message: String },
}

impl SyncMessage {
    pub fn cell_updated(origin: &SessionId, change: CellChange) -> Self {
        SyncMessage::CellUpdated {
            session_id: origin.clone(),
            timestamp: now(),
            change,
        }
    }

    pub fn cells_updated(
        origin: &SessionId,
        operation_id: Option<OperationId>,
        chunk_index: usize,
        chunk_count: usize,
        changes: Vec<CellChange>,
    ) -> Self {
        SyncMessage::CellsUpdated {
            session_id: origin.clone(),
            timestamp: now(),
            operation_id,
            chunk_index,
            chunk_count,
            changes,
        }
    }

    pub fn entity_created(origin: &SessionId, entity: Entity) -> Self {
        SyncMessage::EntityCreated {
            session_id: origin.clone(),
            timestamp: now(),
            entity,
        }
    }

    pub fn refresh_required(
        origin: &SessionId,
        reason: impl Into<String>,
        entity_id: Option<EntityId>,
    ) -> Self {
        SyncMessage::RefreshRequired {
            session_id: origin.clone(),
            timestamp: now(),
            reason: reason.into(),
            entity_id,
        }
    }

    pub fn sync_done(
        origin: &SessionId,
        operation_id: OperationId,
        chunk_count: usize,
        total: usize,
    ) -> Self {
        SyncMessage::SyncDone {
            session_id: origin.clone(),
            timestamp: now(),
            operation_id,
            chunk_count,
            total,
        }
    }

    /// Session that caused this message. `None` for connection messages,
    /// which are addressed to the receiver itself.
    pub fn origin(&self) -> Option<&SessionId> {
        match self {
            SyncMessage::CellUpdated { session_id, .. }
            | SyncMessage::CellsUpdated { session_id, .. }
            | SyncMessage::EntityCreated { session_id, .. }
            | SyncMessage::RefreshRequired { session_id, .. }
            | SyncMessage::SyncDone { session_id, .. } => Some(session_id),
            SyncMessage::Connected { .. } | SyncMessage::Error { .. } => None,
        }
    }

    /// Wire name of the message type.
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncMessage::CellUpdated { .. } => "CELL_UPDATED",
            SyncMessage::CellsUpdated { .. } => "CELLS_UPDATED",
            SyncMessage::EntityCreated { .. } => "ENTITY_CREATED",
            SyncMessage::RefreshRequired { .. } => "REFRESH_REQUIRED",
            SyncMessage::SyncDone { .. } => "SYNC_DONE",
            SyncMessage::Connected { .. } => "CONNECTED",
            SyncMessage::Error { .. } => "ERROR",
        }
    }
}
