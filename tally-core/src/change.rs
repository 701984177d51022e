//! Change records: client-side pending edits and the durable change log.

use crate::grid::{CellChange, CellValue, ColumnKey, FieldKey};
use crate::identity::{now, EntityId, EventId, SessionId, TenantId, Timestamp, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of an accepted mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    /// A single cell value changed.
    FieldUpdate,
    /// A new entity (row or column) was created.
    NewEntity,
    /// An entity was deleted.
    DeleteEntity,
}

impl EventKind {
    /// Structural events change the row/column set rather than a value.
    pub fn is_structural(&self) -> bool {
        matches!(self, EventKind::NewEntity | EventKind::DeleteEntity)
    }

    /// All structural kinds, in the order the pull endpoint claims them.
    pub fn structural() -> [EventKind; 2] {
        [EventKind::NewEntity, EventKind::DeleteEntity]
    }

    pub fn as_db_str(&self) -> &'static str {
        match self {
            EventKind::FieldUpdate => "FIELD_UPDATE",
            EventKind::NewEntity => "NEW_ENTITY",
            EventKind::DeleteEntity => "DELETE_ENTITY",
        }
    }

    pub fn from_db_str(value: &str) -> Option<Self> {
        match value {
            "FIELD_UPDATE" => Some(EventKind::FieldUpdate),
            "NEW_ENTITY" => Some(EventKind::NewEntity),
            "DELETE_ENTITY" => Some(EventKind::DeleteEntity),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

/// Who caused a mutation: tenant scope, logical session and acting user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Origin {
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub user_id: UserId,
}

impl Origin {
    pub fn new(tenant_id: TenantId, session_id: SessionId, user_id: UserId) -> Self {
        Self {
            tenant_id,
            session_id,
            user_id,
        }
    }
}

/// An edit captured on the originating client and not yet confirmed by the server.
///
/// Lives only in client memory. The buffer holds at most one per `key`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingChange {
    pub key: FieldKey,
    pub old_value: CellValue,
    pub new_value: CellValue,
    pub captured_at: Timestamp,
}

impl PendingChange {
    pub fn new(key: FieldKey, old_value: CellValue, new_value: CellValue) -> Self {
        Self {
            key,
            old_value,
            new_value,
            captured_at: now(),
        }
    }
}

/// A mutation accepted by the server, before the change log assigns its id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewChangeEvent {
    pub tenant_id: TenantId,
    pub kind: EventKind,
    pub entity_id: EntityId,
    pub column: Option<ColumnKey>,
    pub old_value: Option<CellValue>,
    pub new_value: Option<CellValue>,
    pub session_id: SessionId,
    pub user_id: UserId,
    pub created_at: Timestamp,
}

impl NewChangeEvent {
    pub fn field_update(
        origin: &Origin,
        key: FieldKey,
        old_value: CellValue,
        new_value: CellValue,
    ) -> Self {
        Self {
            tenant_id: origin.tenant_id,
            kind: EventKind::FieldUpdate,
            entity_id: key.entity_id,
            column: Some(key.column),
            old_value: Some(old_value),
            new_value: Some(new_value),
            session_id: origin.session_id.clone(),
            user_id: origin.user_id.clone(),
            created_at: now(),
        }
    }

    pub fn structural(origin: &Origin, kind: EventKind, entity_id: EntityId) -> Self {
        Self {
            tenant_id: origin.tenant_id,
            kind,
            entity_id,
            column: None,
            old_value: None,
            new_value: None,
            session_id: origin.session_id.clone(),
            user_id: origin.user_id.clone(),
            created_at: now(),
        }
    }

    pub fn at(mut self, created_at: Timestamp) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn into_event(self, id: EventId) -> ChangeEvent {
        ChangeEvent {
            id,
            tenant_id: self.tenant_id,
            kind: self.kind,
            entity_id: self.entity_id,
            column: self.column,
            old_value: self.old_value,
            new_value: self.new_value,
            session_id: self.session_id,
            user_id: self.user_id,
            created_at: self.created_at,
        }
    }
}

/// Durable, immutable record of one accepted mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub id: EventId,
    pub tenant_id: TenantId,
    #[serde(rename = "eventType")]
    pub kind: EventKind,
    pub entity_id: EntityId,
    #[serde(default, rename = "field", skip_serializing_if = "Option::is_none")]
    pub column: Option<ColumnKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<CellValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<CellValue>,
    pub session_id: SessionId,
    pub user_id: UserId,
    pub created_at: Timestamp,
}

impl ChangeEvent {
    pub fn field_key(&self) -> Option<FieldKey> {
        self.column
            .as_ref()
            .map(|column| FieldKey::new(self.entity_id, column.clone()))
    }

    /// The cell write this event represents, if it is a field update.
    pub fn to_cell_change(&self) -> Option<CellChange> {
        if self.kind != EventKind::FieldUpdate {
            return None;
        }
        let key = self.field_key()?;
        Some(CellChange::new(
            key,
            self.new_value.clone().unwrap_or_default(),
        ))
    }
}

/// Per-session record that a structural event has already been delivered by pull.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedEventRecord {
    pub session_id: SessionId,
    pub event_type: EventKind,
    pub event_id: EventId,
    pub processed_at: Timestamp,
}
