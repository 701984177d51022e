//! Request and response bodies of the HTTP surface.
//!
//! Shared with the client crate so both ends serialize the same shapes.

use serde::{Deserialize, Serialize};
use tally_core::{
    CellChange, CellValue, ChangeEvent, EntityId, EntityKind, EventId, OperationId,
    PendingChange, SessionId, Timestamp,
};

// ============================================================================
// AUTOSAVE FLUSH
// ============================================================================

/// One buffered edit as sent by the client.
///
/// Key fields are optional on the wire so that one malformed record can be
/// skipped without rejecting the whole batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushRecord {
    #[serde(default)]
    pub entity_id: Option<EntityId>,
    #[serde(default)]
    pub column: Option<String>,
    #[serde(default)]
    pub value: CellValue,
}

impl From<&PendingChange> for FlushRecord {
    fn from(change: &PendingChange) -> Self {
        Self {
            entity_id: Some(change.key.entity_id),
            column: Some(change.key.column.to_string()),
            value: change.new_value.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushRequest {
    pub changes: Vec<FlushRecord>,
}

/// Why a record was not saved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordError {
    /// Position of the record in the request.
    pub index: usize,
    pub reason: String,
}

/// Partial-success report of a flush.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushResponse {
    pub saved: usize,
    pub total: usize,
    /// Valid records not applied because a newer value was already stored.
    pub skipped: usize,
    #[serde(default)]
    pub errors: Vec<RecordError>,
}

impl FlushResponse {
    /// Records rejected by validation.
    pub fn rejected(&self) -> usize {
        self.errors.len()
    }
}

// ============================================================================
// BULK MUTATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkRequest {
    /// Client-chosen id; generated by the server when absent.
    #[serde(default)]
    pub operation_id: Option<OperationId>,
    pub changes: Vec<CellChange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkResponse {
    pub operation_id: OperationId,
    pub saved: usize,
    pub total: usize,
    pub skipped: usize,
    pub chunk_count: usize,
    #[serde(default)]
    pub errors: Vec<RecordError>,
}

// ============================================================================
// ENTITIES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEntityRequest {
    pub kind: EntityKind,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteEntityResponse {
    pub entity_id: EntityId,
    pub deleted: bool,
}

// ============================================================================
// PULL
// ============================================================================

/// Position in the field-event stream, in `(created_at, id)` order.
///
/// Many events can share one timestamp (a whole bulk operation may), so the
/// id of the last event served is part of the position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullCursor {
    pub at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<EventId>,
}

impl PullCursor {
    /// Everything strictly newer than `at`.
    pub fn at(at: Timestamp) -> Self {
        Self { at, event_id: None }
    }

    /// Everything after `event`.
    pub fn after(event: &ChangeEvent) -> Self {
        Self {
            at: event.created_at,
            event_id: Some(event.id),
        }
    }

    /// Query parameters resuming from this position.
    pub fn params(cursor: Option<Self>, session_id: SessionId) -> PullParams {
        PullParams {
            since: cursor.map(|c| c.at),
            after_id: cursor.and_then(|c| c.event_id),
            session_id: Some(session_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullParams {
    /// Cursor; only field events after it are returned.
    #[serde(default)]
    pub since: Option<Timestamp>,
    /// Id of the last event already seen at `since`. Ignored without `since`.
    #[serde(default)]
    pub after_id: Option<EventId>,
    /// Polling session; falls back to the `X-Session-ID` header.
    #[serde(default)]
    pub session_id: Option<SessionId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    /// Events ordered by creation time.
    pub changes: Vec<ChangeEvent>,
    /// Position to resume from on the next poll.
    pub cursor: PullCursor,
}

// ============================================================================
// HEALTH
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub live_sessions: usize,
    pub store: String,
}
