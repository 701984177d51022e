//! Current grid state: entities and cell values per tenant.

use async_trait::async_trait;
use tally_core::{
    CellValue, ChangeEvent, Entity, EntityId, EntityKind, FieldKey, GridSnapshot, Origin,
    TallyResult, TenantId, Timestamp,
};

/// A cell write to apply together with its change event.
#[derive(Debug, Clone, PartialEq)]
pub struct CellWrite {
    pub origin: Origin,
    pub key: FieldKey,
    pub value: CellValue,
    /// Server acceptance time; decides last-write-wins. The change event is
    /// stamped separately when the write commits.
    pub accepted_at: Timestamp,
}

/// Result of a last-write-wins cell write.
#[derive(Debug, Clone, PartialEq)]
pub enum CellWriteOutcome {
    /// The value was stored and this event appended.
    Applied(ChangeEvent),
    /// A newer value is already stored; nothing was committed.
    Superseded { stored_at: Timestamp },
}

impl CellWriteOutcome {
    pub fn applied(self) -> Option<ChangeEvent> {
        match self {
            CellWriteOutcome::Applied(event) => Some(event),
            CellWriteOutcome::Superseded { .. } => None,
        }
    }
}

/// Entity and cell state of the grid.
///
/// Every mutation commits the state change and its change event as one
/// unit: either both are visible or neither is.
#[async_trait]
pub trait GridStore: Send + Sync {
    /// Create an entity and append its `NEW_ENTITY` event.
    async fn create_entity(
        &self,
        origin: &Origin,
        kind: EntityKind,
        name: &str,
    ) -> TallyResult<(Entity, ChangeEvent)>;

    /// Delete an entity with its cells and append a `DELETE_ENTITY` event.
    ///
    /// Fails with `EntityNotFound` if the entity does not exist in the
    /// origin's tenant.
    async fn delete_entity(&self, origin: &Origin, id: EntityId) -> TallyResult<ChangeEvent>;

    async fn get_entity(&self, tenant_id: TenantId, id: EntityId) -> TallyResult<Option<Entity>>;

    /// Store a cell value (last write wins by acceptance time) and append
    /// its `FIELD_UPDATE` event, with the previously stored value as
    /// `old_value`. The event's `created_at` is the commit time, never
    /// earlier than any field event already visible to readers.
    async fn write_cell(&self, write: CellWrite) -> TallyResult<CellWriteOutcome>;

    /// Full grid state of a tenant.
    async fn snapshot(&self, tenant_id: TenantId) -> TallyResult<GridSnapshot>;
}
