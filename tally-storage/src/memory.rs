//! In-memory store for tests and single-process deployments.
//!
//! Uses tokio::sync::RwLock for safe async access. Each trait method takes
//! the lock once, so a mutation and its change event land together.

use crate::change_log::{ChangeLog, ChangeQuery};
use crate::dedup::DedupTracker;
use crate::grid_store::{CellWrite, CellWriteOutcome, GridStore};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tally_core::{
    now, CellChange, CellValue, ChangeEvent, ColumnKey, Entity, EntityId, EntityKind, EventId,
    EventKind, FieldKey, GridSnapshot, NewChangeEvent, Origin, SessionId, StorageError,
    TallyResult, TenantId, Timestamp, ATTRIBUTE_FIELDS,
};
use tokio::sync::RwLock;

/// In-memory implementation of every storage trait.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<StoreState>,
    unavailable: AtomicBool,
}

#[derive(Debug, Default)]
struct StoreState {
    next_event_id: i64,
    next_entity_id: i64,
    /// Append order, which is also id order.
    events: Vec<ChangeEvent>,
    /// Newest commit stamp handed out.
    last_stamp: Option<Timestamp>,
    /// Processed records keyed by `(session, event type, event id)`.
    processed: HashMap<ProcessedKey, Timestamp>,
    entities: BTreeMap<EntityId, Entity>,
    cells: HashMap<TenantId, BTreeMap<FieldKey, StoredCell>>,
}

type ProcessedKey = (String, EventKind, EventId);

#[derive(Debug, Clone)]
struct StoredCell {
    value: CellValue,
    updated_at: Timestamp,
}

impl StoreState {
    fn push_event(&mut self, event: NewChangeEvent) -> ChangeEvent {
        self.next_event_id += 1;
        let event = event.into_event(EventId::new(self.next_event_id));
        self.events.push(event.clone());
        event
    }

    /// Commit time for a new event: the clock, held back from going
    /// behind a stamp already handed out.
    fn commit_stamp(&mut self) -> Timestamp {
        let stamp = self.last_stamp.map_or_else(now, |last| now().max(last));
        self.last_stamp = Some(stamp);
        stamp
    }

    fn tenant_entity(&self, tenant_id: TenantId, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id).filter(|e| e.tenant_id == tenant_id)
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a storage outage: every call fails with
    /// `StorageError::Unavailable` until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of change events currently retained.
    pub async fn event_count(&self) -> usize {
        self.state.read().await.events.len()
    }

    /// Number of processed records currently retained.
    pub async fn processed_count(&self) -> usize {
        self.state.read().await.processed.len()
    }

    fn check_available(&self) -> TallyResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable {
                reason: "in-memory store marked unavailable".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl ChangeLog for InMemoryStore {
    async fn append(&self, event: NewChangeEvent) -> TallyResult<ChangeEvent> {
        self.check_available()?;
        let mut state = self.state.write().await;
        Ok(state.push_event(event))
    }

    async fn query(&self, query: &ChangeQuery) -> TallyResult<Vec<ChangeEvent>> {
        self.check_available()?;
        let state = self.state.read().await;
        let mut events: Vec<ChangeEvent> = state
            .events
            .iter()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        events.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = query.limit {
            events.truncate(limit);
        }
        Ok(events)
    }

    async fn prune_events(&self, kinds: &[EventKind], before: Timestamp) -> TallyResult<u64> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let before_len = state.events.len();
        state
            .events
            .retain(|e| !(kinds.contains(&e.kind) && e.created_at < before));
        Ok((before_len - state.events.len()) as u64)
    }
}

#[async_trait]
impl DedupTracker for InMemoryStore {
    async fn claim_unseen(
        &self,
        tenant_id: TenantId,
        session_id: &SessionId,
        kind: EventKind,
        window_start: Timestamp,
    ) -> TallyResult<Vec<ChangeEvent>> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let session = session_id.as_str().to_string();

        let mut claimed: Vec<ChangeEvent> = state
            .events
            .iter()
            .filter(|e| {
                e.tenant_id == tenant_id
                    && e.kind == kind
                    && e.created_at > window_start
                    && &e.session_id != session_id
                    && !state.processed.contains_key(&(session.clone(), kind, e.id))
            })
            .cloned()
            .collect();
        claimed.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        if !claimed.is_empty() {
            tracing::debug!(
                tenant_id = %tenant_id,
                session_id = %session_id,
                kind = %kind,
                count = claimed.len(),
                "Claimed structural events"
            );
        }
        let processed_at = now();
        for event in &claimed {
            state
                .processed
                .insert((session.clone(), kind, event.id), processed_at);
        }
        Ok(claimed)
    }

    async fn prune_processed(&self, before: Timestamp) -> TallyResult<u64> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let before_len = state.processed.len();
        state.processed.retain(|_, processed_at| *processed_at >= before);
        Ok((before_len - state.processed.len()) as u64)
    }
}

#[async_trait]
impl GridStore for InMemoryStore {
    async fn create_entity(
        &self,
        origin: &Origin,
        kind: EntityKind,
        name: &str,
    ) -> TallyResult<(Entity, ChangeEvent)> {
        self.check_available()?;
        let mut state = self.state.write().await;
        state.next_entity_id += 1;
        let entity = Entity {
            id: EntityId::new(state.next_entity_id),
            tenant_id: origin.tenant_id,
            kind,
            name: name.to_string(),
            created_at: now(),
        };
        state.entities.insert(entity.id, entity.clone());
        let stamp = state.commit_stamp();
        let event = state.push_event(
            NewChangeEvent::structural(origin, EventKind::NewEntity, entity.id).at(stamp),
        );
        Ok((entity, event))
    }

    async fn delete_entity(&self, origin: &Origin, id: EntityId) -> TallyResult<ChangeEvent> {
        self.check_available()?;
        let mut state = self.state.write().await;
        if state.tenant_entity(origin.tenant_id, id).is_none() {
            return Err(StorageError::EntityNotFound { id }.into());
        }
        state.entities.remove(&id);
        if let Some(cells) = state.cells.get_mut(&origin.tenant_id) {
            cells.retain(|key, _| {
                key.entity_id != id && key.column != ColumnKey::Client(id)
            });
        }
        let stamp = state.commit_stamp();
        Ok(state.push_event(
            NewChangeEvent::structural(origin, EventKind::DeleteEntity, id).at(stamp),
        ))
    }

    async fn get_entity(&self, tenant_id: TenantId, id: EntityId) -> TallyResult<Option<Entity>> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state.tenant_entity(tenant_id, id).cloned())
    }

    async fn write_cell(&self, write: CellWrite) -> TallyResult<CellWriteOutcome> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let tenant_id = write.origin.tenant_id;
        if state.tenant_entity(tenant_id, write.key.entity_id).is_none() {
            return Err(StorageError::EntityNotFound {
                id: write.key.entity_id,
            }
            .into());
        }

        let cells = state.cells.entry(tenant_id).or_default();
        let previous = match cells.get(&write.key) {
            Some(stored) if stored.updated_at > write.accepted_at => {
                return Ok(CellWriteOutcome::Superseded {
                    stored_at: stored.updated_at,
                });
            }
            Some(stored) => stored.value.clone(),
            None => CellValue::Empty,
        };
        cells.insert(
            write.key.clone(),
            StoredCell {
                value: write.value.clone(),
                updated_at: write.accepted_at,
            },
        );

        let stamp = state.commit_stamp();
        let event = NewChangeEvent::field_update(&write.origin, write.key, previous, write.value)
            .at(stamp);
        Ok(CellWriteOutcome::Applied(state.push_event(event)))
    }

    async fn snapshot(&self, tenant_id: TenantId) -> TallyResult<GridSnapshot> {
        self.check_available()?;
        let state = self.state.read().await;
        let tenant_entities: Vec<&Entity> = state
            .entities
            .values()
            .filter(|e| e.tenant_id == tenant_id)
            .collect();

        let rows = tenant_entities
            .iter()
            .filter(|e| e.kind == EntityKind::Account)
            .map(|e| (*e).clone())
            .collect();
        let columns = tenant_entities
            .iter()
            .filter(|e| e.kind == EntityKind::Client)
            .map(|e| ColumnKey::Client(e.id))
            .chain(ATTRIBUTE_FIELDS.iter().map(|f| ColumnKey::field(*f)))
            .collect();
        let cells = state
            .cells
            .get(&tenant_id)
            .map(|cells| {
                cells
                    .iter()
                    .filter(|(_, stored)| !stored.value.is_empty())
                    .map(|(key, stored)| CellChange::new(key.clone(), stored.value.clone()))
                    .collect()
            })
            .unwrap_or_default();

        Ok(GridSnapshot {
            rows,
            columns,
            cells,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tally_core::{TallyError, UserId};

    fn origin(tenant: i64, session: &str) -> Origin {
        Origin::new(TenantId::new(tenant), SessionId::new(session), UserId::new("user"))
    }

    fn epoch() -> Timestamp {
        Timestamp::UNIX_EPOCH
    }

    async fn account(store: &InMemoryStore, origin: &Origin) -> Entity {
        store
            .create_entity(origin, EntityKind::Account, "Search - EU")
            .await
            .expect("create_entity should succeed")
            .0
    }

    #[tokio::test]
    async fn test_append_assigns_monotonic_ids() {
        let store = InMemoryStore::new();
        let s1 = origin(1, "s1");
        let first = store
            .append(NewChangeEvent::structural(&s1, EventKind::NewEntity, EntityId::new(1)))
            .await
            .expect("append should succeed");
        let second = store
            .append(NewChangeEvent::structural(&s1, EventKind::NewEntity, EntityId::new(2)))
            .await
            .expect("append should succeed");
        assert!(second.id > first.id);
    }

    #[tokio::test]
    async fn test_query_is_strictly_newer_and_ordered() {
        let store = InMemoryStore::new();
        let s1 = origin(1, "s1");
        let base = now();
        for offset in [3, 1, 2] {
            store
                .append(
                    NewChangeEvent::structural(&s1, EventKind::NewEntity, EntityId::new(offset))
                        .at(base + Duration::seconds(offset)),
                )
                .await
                .expect("append should succeed");
        }

        let events = store
            .query(&ChangeQuery::since(TenantId::new(1), base + Duration::seconds(1)))
            .await
            .expect("query should succeed");
        let entities: Vec<i64> = events.iter().map(|e| e.entity_id.get()).collect();
        assert_eq!(entities, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_query_resumes_inside_a_timestamp_group() {
        let store = InMemoryStore::new();
        let s1 = origin(1, "s1");
        let stamp = now();
        let mut ids = Vec::new();
        for entity in 1..=3 {
            let event = store
                .append(
                    NewChangeEvent::structural(&s1, EventKind::NewEntity, EntityId::new(entity))
                        .at(stamp),
                )
                .await
                .expect("append should succeed");
            ids.push(event.id);
        }

        let strictly_newer = store
            .query(&ChangeQuery::since(TenantId::new(1), stamp))
            .await
            .expect("query should succeed");
        assert!(strictly_newer.is_empty());

        let resumed = store
            .query(&ChangeQuery::since(TenantId::new(1), stamp).after_event(Some(ids[0])))
            .await
            .expect("query should succeed");
        let resumed_ids: Vec<EventId> = resumed.iter().map(|e| e.id).collect();
        assert_eq!(resumed_ids, ids[1..].to_vec());
    }

    #[tokio::test]
    async fn test_field_events_are_stamped_in_commit_order() {
        let store = InMemoryStore::new();
        let s1 = origin(1, "s1");
        let row = account(&store, &s1).await;

        let first = store
            .write_cell(CellWrite {
                origin: s1.clone(),
                key: FieldKey::new(row.id, ColumnKey::field("notes")),
                value: CellValue::from("first"),
                accepted_at: now(),
            })
            .await
            .expect("write_cell should succeed")
            .applied()
            .expect("write should apply");
        // Accepted earlier but committed later, on another cell.
        let second = store
            .write_cell(CellWrite {
                origin: s1.clone(),
                key: FieldKey::new(row.id, ColumnKey::field("currency")),
                value: CellValue::from("EUR"),
                accepted_at: now() - Duration::hours(1),
            })
            .await
            .expect("write_cell should succeed")
            .applied()
            .expect("write should apply");
        assert!(second.created_at >= first.created_at);

        let query = ChangeQuery::since(TenantId::new(1), first.created_at)
            .after_event(Some(first.id))
            .kinds([EventKind::FieldUpdate]);
        let events = store.query(&query).await.expect("query should succeed");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, second.id);
    }

    #[tokio::test]
    async fn test_query_excludes_own_session_and_other_tenants() {
        let store = InMemoryStore::new();
        for o in [origin(1, "s1"), origin(1, "s2"), origin(2, "s3")] {
            store
                .append(NewChangeEvent::structural(&o, EventKind::NewEntity, EntityId::new(1)))
                .await
                .expect("append should succeed");
        }

        let events = store
            .query(&ChangeQuery::since(TenantId::new(1), epoch()).excluding(SessionId::new("s1")))
            .await
            .expect("query should succeed");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].session_id, SessionId::new("s2"));
    }

    #[tokio::test]
    async fn test_query_kind_filter_and_limit() {
        let store = InMemoryStore::new();
        let s1 = origin(1, "s1");
        let row = account(&store, &s1).await;
        for value in [1.0, 2.0, 3.0] {
            store
                .write_cell(CellWrite {
                    origin: s1.clone(),
                    key: FieldKey::new(row.id, ColumnKey::field("monthly_budget")),
                    value: CellValue::Number(value),
                    accepted_at: now(),
                })
                .await
                .expect("write_cell should succeed");
        }

        let query = ChangeQuery::since(TenantId::new(1), epoch())
            .kinds([EventKind::FieldUpdate])
            .limit(2);
        let events = store.query(&query).await.expect("query should succeed");
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.kind == EventKind::FieldUpdate));
    }

    #[tokio::test]
    async fn test_structural_event_claimed_once_per_session() {
        let store = InMemoryStore::new();
        let s1 = origin(1, "s1");
        let (entity, _) = store
            .create_entity(&s1, EntityKind::Account, "Display - US")
            .await
            .expect("create_entity should succeed");
        let window_start = now() - Duration::minutes(5);
        let s2 = SessionId::new("s2");

        let first = store
            .claim_unseen(TenantId::new(1), &s2, EventKind::NewEntity, window_start)
            .await
            .expect("claim should succeed");
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].entity_id, entity.id);

        let second = store
            .claim_unseen(TenantId::new(1), &s2, EventKind::NewEntity, window_start)
            .await
            .expect("claim should succeed");
        assert!(second.is_empty());

        let other = store
            .claim_unseen(TenantId::new(1), &SessionId::new("s3"), EventKind::NewEntity, window_start)
            .await
            .expect("claim should succeed");
        assert_eq!(other.len(), 1);
        assert_eq!(store.processed_count().await, 2);
    }

    #[tokio::test]
    async fn test_claim_skips_own_and_out_of_window_events() {
        let store = InMemoryStore::new();
        let s1 = origin(1, "s1");
        store
            .append(
                NewChangeEvent::structural(&s1, EventKind::NewEntity, EntityId::new(1))
                    .at(now() - Duration::minutes(10)),
            )
            .await
            .expect("append should succeed");
        store
            .append(NewChangeEvent::structural(&s1, EventKind::NewEntity, EntityId::new(2)))
            .await
            .expect("append should succeed");

        let window_start = now() - Duration::minutes(5);
        let own = store
            .claim_unseen(TenantId::new(1), &SessionId::new("s1"), EventKind::NewEntity, window_start)
            .await
            .expect("claim should succeed");
        assert!(own.is_empty());

        let other = store
            .claim_unseen(TenantId::new(1), &SessionId::new("s2"), EventKind::NewEntity, window_start)
            .await
            .expect("claim should succeed");
        assert_eq!(other.len(), 1);
        assert_eq!(other[0].entity_id, EntityId::new(2));
    }

    #[tokio::test]
    async fn test_prune_processed_and_structural_events() {
        let store = InMemoryStore::new();
        let s1 = origin(1, "s1");
        store
            .create_entity(&s1, EntityKind::Client, "Acme")
            .await
            .expect("create_entity should succeed");
        store
            .claim_unseen(TenantId::new(1), &SessionId::new("s2"), EventKind::NewEntity, epoch())
            .await
            .expect("claim should succeed");

        let cutoff = now() + Duration::seconds(1);
        let processed = store
            .prune_processed(cutoff)
            .await
            .expect("prune_processed should succeed");
        let events = store
            .prune_events(&EventKind::structural(), cutoff)
            .await
            .expect("prune_events should succeed");
        assert_eq!(processed, 1);
        assert_eq!(events, 1);
        assert_eq!(store.event_count().await, 0);
    }

    #[tokio::test]
    async fn test_write_cell_reports_previous_value() {
        let store = InMemoryStore::new();
        let s1 = origin(1, "s1");
        let row = account(&store, &s1).await;
        let key = FieldKey::new(row.id, ColumnKey::field("notes"));

        let write = |value: &str| CellWrite {
            origin: s1.clone(),
            key: key.clone(),
            value: CellValue::from(value),
            accepted_at: now(),
        };
        store
            .write_cell(write("draft"))
            .await
            .expect("write_cell should succeed");
        let event = store
            .write_cell(write("final"))
            .await
            .expect("write_cell should succeed")
            .applied()
            .expect("newer write should apply");

        assert_eq!(event.old_value, Some(CellValue::from("draft")));
        assert_eq!(event.new_value, Some(CellValue::from("final")));
    }

    #[tokio::test]
    async fn test_older_write_is_superseded() {
        let store = InMemoryStore::new();
        let s1 = origin(1, "s1");
        let row = account(&store, &s1).await;
        let key = FieldKey::new(row.id, ColumnKey::field("currency"));
        let newer = now();

        store
            .write_cell(CellWrite {
                origin: s1.clone(),
                key: key.clone(),
                value: CellValue::from("EUR"),
                accepted_at: newer,
            })
            .await
            .expect("write_cell should succeed");
        let before = store.event_count().await;
        let outcome = store
            .write_cell(CellWrite {
                origin: s1.clone(),
                key,
                value: CellValue::from("USD"),
                accepted_at: newer - Duration::seconds(1),
            })
            .await
            .expect("write_cell should succeed");

        assert_eq!(outcome, CellWriteOutcome::Superseded { stored_at: newer });
        assert_eq!(store.event_count().await, before);
    }

    #[tokio::test]
    async fn test_delete_entity_drops_its_cells_and_column() {
        let store = InMemoryStore::new();
        let s1 = origin(1, "s1");
        let row = account(&store, &s1).await;
        let (client, _) = store
            .create_entity(&s1, EntityKind::Client, "Acme")
            .await
            .expect("create_entity should succeed");
        store
            .write_cell(CellWrite {
                origin: s1.clone(),
                key: FieldKey::new(row.id, ColumnKey::Client(client.id)),
                value: CellValue::Number(120.0),
                accepted_at: now(),
            })
            .await
            .expect("write_cell should succeed");

        let event = store
            .delete_entity(&s1, client.id)
            .await
            .expect("delete_entity should succeed");
        assert_eq!(event.kind, EventKind::DeleteEntity);

        let snapshot = store
            .snapshot(TenantId::new(1))
            .await
            .expect("snapshot should succeed");
        assert!(snapshot.cells.is_empty());
        assert!(!snapshot.columns.contains(&ColumnKey::Client(client.id)));
    }

    #[tokio::test]
    async fn test_foreign_tenant_entity_is_not_found() {
        let store = InMemoryStore::new();
        let row = account(&store, &origin(1, "s1")).await;

        let result = store.delete_entity(&origin(2, "s9"), row.id).await;
        assert!(matches!(
            result,
            Err(TallyError::Storage(StorageError::EntityNotFound { .. }))
        ));
        let visible = store
            .get_entity(TenantId::new(2), row.id)
            .await
            .expect("get_entity should succeed");
        assert!(visible.is_none());
    }

    #[tokio::test]
    async fn test_snapshot_orders_client_columns_before_attributes() {
        let store = InMemoryStore::new();
        let s1 = origin(1, "s1");
        account(&store, &s1).await;
        let (client, _) = store
            .create_entity(&s1, EntityKind::Client, "Acme")
            .await
            .expect("create_entity should succeed");

        let snapshot = store
            .snapshot(TenantId::new(1))
            .await
            .expect("snapshot should succeed");
        assert_eq!(snapshot.rows.len(), 1);
        assert_eq!(snapshot.columns[0], ColumnKey::Client(client.id));
        assert_eq!(snapshot.columns.len(), 1 + ATTRIBUTE_FIELDS.len());
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_call() {
        let store = InMemoryStore::new();
        store.set_unavailable(true);
        let result = store
            .append(NewChangeEvent::structural(
                &origin(1, "s1"),
                EventKind::NewEntity,
                EntityId::new(1),
            ))
            .await;
        match result {
            Err(TallyError::Storage(err)) => assert!(err.is_retryable()),
            other => panic!("expected storage error, got {:?}", other),
        }
        store.set_unavailable(false);
        assert!(store.snapshot(TenantId::new(1)).await.is_ok());
    }
}
