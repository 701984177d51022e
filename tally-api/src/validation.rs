//! Per-record validation of incoming cell writes.
//!
//! A record that fails validation is dropped from its batch; the rest of the
//! batch proceeds. Storage failures while validating are not record errors
//! and abort the request.

use std::collections::HashMap;

use tally_core::{
    CellChange, CellValue, ColumnKey, Entity, EntityId, EntityKind, TallyError, TallyResult,
    TenantId, ValidationError,
};
use tally_storage::SyncStore;

use crate::types::FlushRecord;

/// Validates records against one tenant's entities, caching lookups for
/// the lifetime of a request.
pub struct RecordValidator<'a> {
    store: &'a dyn SyncStore,
    tenant_id: TenantId,
    entities: HashMap<EntityId, Option<Entity>>,
}

impl<'a> RecordValidator<'a> {
    pub fn new(store: &'a dyn SyncStore, tenant_id: TenantId) -> Self {
        Self {
            store,
            tenant_id,
            entities: HashMap::new(),
        }
    }

    /// Check a wire record and turn it into a cell change.
    ///
    /// Returns `TallyError::Validation` for a bad record and
    /// `TallyError::Storage` if the entity lookup itself failed.
    pub async fn validate_record(&mut self, record: &FlushRecord) -> TallyResult<CellChange> {
        let entity_id = record
            .entity_id
            .ok_or_else(|| required("entityId"))?;
        let column: ColumnKey = record
            .column
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| required("column"))?
            .parse()?;

        self.validate_cell(entity_id, column, record.value.clone()).await
    }

    /// Check an already-typed cell change.
    pub async fn validate_change(&mut self, change: &CellChange) -> TallyResult<CellChange> {
        self.validate_cell(change.entity_id, change.column.clone(), change.value.clone())
            .await
    }

    async fn validate_cell(
        &mut self,
        entity_id: EntityId,
        column: ColumnKey,
        value: CellValue,
    ) -> TallyResult<CellChange> {
        if entity_id.get() <= 0 {
            return Err(invalid("entityId", format!("must be positive, got {}", entity_id)));
        }
        column.validate()?;

        let row = self.owned_entity(entity_id).await?;
        if row.kind != EntityKind::Account {
            return Err(invalid("entityId", format!("entity {} is not an account row", entity_id)));
        }

        if let ColumnKey::Client(client_id) = &column {
            let client = self.owned_entity(*client_id).await?;
            if client.kind != EntityKind::Client {
                return Err(invalid("column", format!("entity {} is not a client", client_id)));
            }
            if matches!(value, CellValue::Text(_)) {
                return Err(invalid("value", "expense cells hold numbers".to_string()));
            }
        }

        Ok(CellChange {
            entity_id,
            column,
            value,
        })
    }

    /// The entity, if it exists and belongs to the caller's tenant.
    async fn owned_entity(&mut self, id: EntityId) -> TallyResult<Entity> {
        if !self.entities.contains_key(&id) {
            let found = self.store.get_entity(self.tenant_id, id).await?;
            self.entities.insert(id, found);
        }
        self.entities
            .get(&id)
            .and_then(|e| e.clone())
            .ok_or_else(|| TallyError::Validation(ValidationError::ForeignEntity { id }))
    }
}

fn required(field: &str) -> TallyError {
    TallyError::Validation(ValidationError::RequiredFieldMissing {
        field: field.to_string(),
    })
}

fn invalid(field: &str, reason: String) -> TallyError {
    TallyError::Validation(ValidationError::InvalidValue {
        field: field.to_string(),
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::{Origin, SessionId, UserId};
    use tally_storage::{GridStore, InMemoryStore};

    async fn seeded() -> (InMemoryStore, Entity, Entity) {
        let store = InMemoryStore::new();
        let origin = Origin::new(TenantId::new(1), SessionId::new("s"), UserId::new("u"));
        let (account, _) = store
            .create_entity(&origin, EntityKind::Account, "Meta #1")
            .await
            .expect("create account should succeed");
        let (client, _) = store
            .create_entity(&origin, EntityKind::Client, "Acme")
            .await
            .expect("create client should succeed");
        (store, account, client)
    }

    fn record(entity: Option<i64>, column: Option<&str>, value: CellValue) -> FlushRecord {
        FlushRecord {
            entity_id: entity.map(EntityId::new),
            column: column.map(str::to_string),
            value,
        }
    }

    #[tokio::test]
    async fn test_valid_expense_record() {
        let (store, account, client) = seeded().await;
        let mut validator = RecordValidator::new(&store, TenantId::new(1));
        let column = format!("client:{}", client.id);
        let change = validator
            .validate_record(&record(Some(account.id.get()), Some(&column), CellValue::Number(5.0)))
            .await
            .expect("validation should succeed");
        assert_eq!(change.entity_id, account.id);
        assert_eq!(change.column, ColumnKey::Client(client.id));
    }

    #[tokio::test]
    async fn test_missing_keys_are_validation_errors() {
        let (store, account, _) = seeded().await;
        let mut validator = RecordValidator::new(&store, TenantId::new(1));

        let err = validator
            .validate_record(&record(None, Some("field:notes"), CellValue::Empty))
            .await
            .expect_err("missing entity should fail");
        assert!(matches!(err, TallyError::Validation(ValidationError::RequiredFieldMissing { .. })));

        let err = validator
            .validate_record(&record(Some(account.id.get()), None, CellValue::Empty))
            .await
            .expect_err("missing column should fail");
        assert!(matches!(err, TallyError::Validation(ValidationError::RequiredFieldMissing { .. })));
    }

    #[tokio::test]
    async fn test_other_tenant_entity_is_foreign() {
        let (store, account, _) = seeded().await;
        let mut validator = RecordValidator::new(&store, TenantId::new(2));
        let err = validator
            .validate_record(&record(Some(account.id.get()), Some("field:notes"), "x".into()))
            .await
            .expect_err("foreign entity should fail");
        assert!(matches!(err, TallyError::Validation(ValidationError::ForeignEntity { .. })));
    }

    #[tokio::test]
    async fn test_text_rejected_in_expense_cell() {
        let (store, account, client) = seeded().await;
        let mut validator = RecordValidator::new(&store, TenantId::new(1));
        let column = format!("client:{}", client.id);
        let err = validator
            .validate_record(&record(Some(account.id.get()), Some(&column), "lots".into()))
            .await
            .expect_err("text expense should fail");
        assert!(matches!(err, TallyError::Validation(_)));
    }

    #[tokio::test]
    async fn test_client_row_is_not_an_account() {
        let (store, _, client) = seeded().await;
        let mut validator = RecordValidator::new(&store, TenantId::new(1));
        let err = validator
            .validate_record(&record(Some(client.id.get()), Some("field:notes"), "x".into()))
            .await
            .expect_err("client row should fail");
        assert!(matches!(err, TallyError::Validation(ValidationError::InvalidValue { .. })));
    }

    #[tokio::test]
    async fn test_storage_outage_is_not_a_record_error() {
        let (store, account, _) = seeded().await;
        store.set_unavailable(true);
        let mut validator = RecordValidator::new(&store, TenantId::new(1));
        let err = validator
            .validate_record(&record(Some(account.id.get()), Some("field:notes"), "x".into()))
            .await
            .expect_err("outage should fail");
        assert!(matches!(err, TallyError::Storage(_)));
    }
}
