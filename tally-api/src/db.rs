//! PostgreSQL Store
//!
//! Implements every storage trait over a deadpool connection pool. Each
//! mutation runs in one transaction together with its change event, and the
//! structural claim is a single statement so concurrent polls by the same
//! session cannot both receive an event.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_postgres::{
    Config, ManagerConfig, Object, Pool, PoolConfig, PoolError, RecyclingMethod, Runtime,
    Transaction,
};
use tally_core::{
    CellChange, CellValue, ChangeEvent, ColumnKey, Entity, EntityId, EntityKind, EventId,
    EventKind, FieldKey, GridSnapshot, NewChangeEvent, Origin, SessionId, StorageError,
    TallyError, TallyResult, TenantId, Timestamp, UserId, ATTRIBUTE_FIELDS,
};
use tally_storage::{
    CellWrite, CellWriteOutcome, ChangeLog, ChangeQuery, DedupTracker, GridStore,
};
use tokio_postgres::types::Json;
use tokio_postgres::{NoTls, Row};
use tracing::debug;

use crate::config::ApiConfig;
use crate::error::{ApiError, ApiResult};

const SCHEMA: &str = include_str!("../sql/schema.sql");

const EVENT_COLUMNS: &str = "e.id, e.tenant_id, e.event_type, e.entity_id, e.column_key, \
     e.old_value, e.new_value, e.session_id, e.user_id, e.created_at";

// ============================================================================
// DATABASE CONFIGURATION
// ============================================================================

/// Database connection configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// PostgreSQL connection string
    pub url: String,
    /// Maximum pool size
    pub max_size: usize,
    /// How long to wait for a pooled connection
    pub timeout: Duration,
}

impl DbConfig {
    /// Database settings of the API configuration, if a URL is configured.
    pub fn from_api_config(config: &ApiConfig) -> Option<Self> {
        config.database_url.as_ref().map(|url| Self {
            url: url.clone(),
            max_size: config.db_pool_size,
            timeout: config.db_timeout,
        })
    }

    /// Create a connection pool from this configuration.
    pub fn create_pool(&self) -> ApiResult<Pool> {
        let mut cfg = Config::new();
        cfg.url = Some(self.url.clone());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let mut pool_cfg = PoolConfig::new(self.max_size);
        pool_cfg.timeouts.wait = Some(self.timeout);
        cfg.pool = Some(pool_cfg);

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| ApiError::database_error(format!("Failed to create pool: {}", e)))?;

        Ok(pool)
    }
}

// ============================================================================
// ERROR MAPPING
// ============================================================================

fn pool_error(err: PoolError) -> TallyError {
    StorageError::Unavailable {
        reason: err.to_string(),
    }
    .into()
}

fn query_error(err: tokio_postgres::Error) -> TallyError {
    if err.is_closed() {
        return StorageError::Unavailable {
            reason: err.to_string(),
        }
        .into();
    }
    StorageError::QueryFailed {
        reason: err.to_string(),
    }
    .into()
}

fn corrupt(what: &str, value: &str) -> TallyError {
    StorageError::QueryFailed {
        reason: format!("unreadable {} '{}'", what, value),
    }
    .into()
}

// ============================================================================
// ROW MAPPING
// ============================================================================

fn event_from_row(row: &Row) -> TallyResult<ChangeEvent> {
    let event_type: String = row.get("event_type");
    let kind = EventKind::from_db_str(&event_type).ok_or_else(|| corrupt("event type", &event_type))?;
    let column = row
        .get::<_, Option<String>>("column_key")
        .map(|raw| raw.parse::<ColumnKey>().map_err(|_| corrupt("column key", &raw)))
        .transpose()?;
    let old_value: Option<Json<CellValue>> = row.get("old_value");
    let new_value: Option<Json<CellValue>> = row.get("new_value");

    Ok(ChangeEvent {
        id: EventId::new(row.get("id")),
        tenant_id: TenantId::new(row.get("tenant_id")),
        kind,
        entity_id: EntityId::new(row.get("entity_id")),
        column,
        old_value: old_value.map(|Json(v)| v),
        new_value: new_value.map(|Json(v)| v),
        session_id: SessionId::new(row.get::<_, String>("session_id")),
        user_id: UserId::new(row.get::<_, String>("user_id")),
        created_at: row.get("created_at"),
    })
}

fn entity_from_row(row: &Row) -> TallyResult<Entity> {
    let kind: String = row.get("kind");
    Ok(Entity {
        id: EntityId::new(row.get("id")),
        tenant_id: TenantId::new(row.get("tenant_id")),
        kind: EntityKind::from_db_str(&kind).ok_or_else(|| corrupt("entity kind", &kind))?,
        name: row.get("name"),
        created_at: row.get("created_at"),
    })
}

async fn insert_event(tx: &Transaction<'_>, event: NewChangeEvent) -> TallyResult<ChangeEvent> {
    let column = event.column.as_ref().map(ColumnKey::to_string);
    let old_value = event.old_value.as_ref().map(Json);
    let new_value = event.new_value.as_ref().map(Json);

    let row = tx
        .query_one(
            "INSERT INTO tally_change_events \
             (tenant_id, event_type, entity_id, column_key, old_value, new_value, session_id, user_id, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING id",
            &[
                &event.tenant_id.get(),
                &event.kind.as_db_str(),
                &event.entity_id.get(),
                &column,
                &old_value,
                &new_value,
                &event.session_id.as_str(),
                &event.user_id.as_str(),
                &event.created_at,
            ],
        )
        .await
        .map_err(|e| {
            TallyError::from(StorageError::AppendFailed {
                reason: e.to_string(),
            })
        })?;

    Ok(event.into_event(EventId::new(row.get(0))))
}

// ============================================================================
// STORE
// ============================================================================

/// PostgreSQL-backed implementation of every storage trait.
#[derive(Clone)]
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Create a store from configuration.
    pub fn from_config(config: &DbConfig) -> ApiResult<Self> {
        let pool = config.create_pool()?;
        Ok(Self::new(pool))
    }

    /// Create the tables and indexes if they do not exist.
    pub async fn bootstrap(&self) -> ApiResult<()> {
        let conn = self.pool.get().await?;
        conn.batch_execute(SCHEMA).await?;
        Ok(())
    }

    /// Get the current pool size for observability.
    pub fn pool_size(&self) -> usize {
        self.pool.status().size
    }

    async fn conn(&self) -> TallyResult<Object> {
        self.pool.get().await.map_err(pool_error)
    }
}

#[async_trait]
impl ChangeLog for PgStore {
    async fn append(&self, event: NewChangeEvent) -> TallyResult<ChangeEvent> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await.map_err(query_error)?;
        let event = insert_event(&tx, event).await?;
        tx.commit().await.map_err(query_error)?;
        Ok(event)
    }

    async fn query(&self, query: &ChangeQuery) -> TallyResult<Vec<ChangeEvent>> {
        let conn = self.conn().await?;
        let exclude = query.exclude_session.as_ref().map(SessionId::as_str);
        let kinds: Vec<&str> = query.kinds.iter().map(EventKind::as_db_str).collect();
        let limit = query.limit.map(|l| l as i64);
        let after_id = query.after_id.map(EventId::get);

        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM tally_change_events e \
             WHERE e.tenant_id = $1 \
               AND (e.created_at > $2 OR (e.created_at = $2 AND $6::BIGINT IS NOT NULL AND e.id > $6)) \
               AND ($3::TEXT IS NULL OR e.session_id <> $3) \
               AND (cardinality($4::TEXT[]) = 0 OR e.event_type = ANY($4)) \
             ORDER BY e.created_at, e.id \
             LIMIT $5"
        );
        let rows = conn
            .query(
                &sql,
                &[
                    &query.tenant_id.get(),
                    &query.since,
                    &exclude,
                    &kinds,
                    &limit,
                    &after_id,
                ],
            )
            .await
            .map_err(query_error)?;

        rows.iter().map(event_from_row).collect()
    }

    async fn prune_events(&self, kinds: &[EventKind], before: Timestamp) -> TallyResult<u64> {
        let conn = self.conn().await?;
        let kinds: Vec<&str> = kinds.iter().map(EventKind::as_db_str).collect();
        conn.execute(
            "DELETE FROM tally_change_events WHERE event_type = ANY($1) AND created_at < $2",
            &[&kinds, &before],
        )
        .await
        .map_err(query_error)
    }
}

#[async_trait]
impl DedupTracker for PgStore {
    async fn claim_unseen(
        &self,
        tenant_id: TenantId,
        session_id: &SessionId,
        kind: EventKind,
        window_start: Timestamp,
    ) -> TallyResult<Vec<ChangeEvent>> {
        let conn = self.conn().await?;
        let sql = format!(
            "WITH candidates AS ( \
                 SELECT e.id FROM tally_change_events e \
                 LEFT JOIN tally_processed_events p \
                   ON p.event_id = e.id AND p.session_id = $2 AND p.event_type = e.event_type \
                 WHERE e.tenant_id = $1 AND e.event_type = $3 \
                   AND e.session_id <> $2 AND e.created_at > $4 \
                   AND p.id IS NULL \
             ), claimed AS ( \
                 INSERT INTO tally_processed_events (session_id, event_type, event_id) \
                 SELECT $2, $3, id FROM candidates \
                 ON CONFLICT (session_id, event_type, event_id) DO NOTHING \
                 RETURNING event_id \
             ) \
             SELECT {EVENT_COLUMNS} FROM tally_change_events e \
             JOIN claimed c ON c.event_id = e.id \
             ORDER BY e.created_at, e.id"
        );
        let rows = conn
            .query(
                &sql,
                &[&tenant_id.get(), &session_id.as_str(), &kind.as_db_str(), &window_start],
            )
            .await
            .map_err(query_error)?;

        let events = rows.iter().map(event_from_row).collect::<TallyResult<Vec<_>>>()?;
        if !events.is_empty() {
            debug!(
                tenant_id = %tenant_id,
                session_id = %session_id,
                kind = %kind,
                count = events.len(),
                "Claimed structural events"
            );
        }
        Ok(events)
    }

    async fn prune_processed(&self, before: Timestamp) -> TallyResult<u64> {
        let conn = self.conn().await?;
        conn.execute(
            "DELETE FROM tally_processed_events WHERE processed_at < $1",
            &[&before],
        )
        .await
        .map_err(query_error)
    }
}

#[async_trait]
impl GridStore for PgStore {
    async fn create_entity(
        &self,
        origin: &Origin,
        kind: EntityKind,
        name: &str,
    ) -> TallyResult<(Entity, ChangeEvent)> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await.map_err(query_error)?;
        let created_at = tally_core::now();

        let row = tx
            .query_one(
                "INSERT INTO tally_entities (tenant_id, kind, name, created_at) \
                 VALUES ($1, $2, $3, $4) \
                 RETURNING id, tenant_id, kind, name, created_at",
                &[&origin.tenant_id.get(), &kind.as_db_str(), &name, &created_at],
            )
            .await
            .map_err(query_error)?;
        let entity = entity_from_row(&row)?;

        let event = insert_event(
            &tx,
            NewChangeEvent::structural(origin, EventKind::NewEntity, entity.id).at(created_at),
        )
        .await?;
        tx.commit().await.map_err(query_error)?;

        Ok((entity, event))
    }

    async fn delete_entity(&self, origin: &Origin, id: EntityId) -> TallyResult<ChangeEvent> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await.map_err(query_error)?;

        let deleted = tx
            .execute(
                "DELETE FROM tally_entities WHERE id = $1 AND tenant_id = $2",
                &[&id.get(), &origin.tenant_id.get()],
            )
            .await
            .map_err(query_error)?;
        if deleted == 0 {
            return Err(StorageError::EntityNotFound { id }.into());
        }

        // Row cells cascade; a client also owns a whole column.
        tx.execute(
            "DELETE FROM tally_cells WHERE tenant_id = $1 AND column_key = $2",
            &[&origin.tenant_id.get(), &ColumnKey::Client(id).to_string()],
        )
        .await
        .map_err(query_error)?;

        let event = insert_event(
            &tx,
            NewChangeEvent::structural(origin, EventKind::DeleteEntity, id),
        )
        .await?;
        tx.commit().await.map_err(query_error)?;
        Ok(event)
    }

    async fn get_entity(&self, tenant_id: TenantId, id: EntityId) -> TallyResult<Option<Entity>> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT id, tenant_id, kind, name, created_at FROM tally_entities \
                 WHERE id = $1 AND tenant_id = $2",
                &[&id.get(), &tenant_id.get()],
            )
            .await
            .map_err(query_error)?;
        row.as_ref().map(entity_from_row).transpose()
    }

    async fn write_cell(&self, write: CellWrite) -> TallyResult<CellWriteOutcome> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await.map_err(query_error)?;
        let tenant = write.origin.tenant_id.get();
        let entity = write.key.entity_id.get();
        let column = write.key.column.to_string();

        // Field events of a tenant commit one at a time, so the stamp taken
        // under the lock orders them the way readers see them appear.
        tx.execute("SELECT pg_advisory_xact_lock($1)", &[&tenant])
            .await
            .map_err(query_error)?;

        let exists = tx
            .query_opt(
                "SELECT 1 FROM tally_entities WHERE id = $1 AND tenant_id = $2 FOR SHARE",
                &[&entity, &tenant],
            )
            .await
            .map_err(query_error)?;
        if exists.is_none() {
            return Err(StorageError::EntityNotFound {
                id: write.key.entity_id,
            }
            .into());
        }

        let stored = tx
            .query_opt(
                "SELECT value, updated_at FROM tally_cells \
                 WHERE tenant_id = $1 AND entity_id = $2 AND column_key = $3 FOR UPDATE",
                &[&tenant, &entity, &column],
            )
            .await
            .map_err(query_error)?;
        let (old_value, stored_at) = match stored {
            Some(row) => {
                let Json(value): Json<CellValue> = row.get("value");
                (value, Some(row.get::<_, Timestamp>("updated_at")))
            }
            None => (CellValue::Empty, None),
        };
        if let Some(stored_at) = stored_at.filter(|at| *at > write.accepted_at) {
            return Ok(CellWriteOutcome::Superseded { stored_at });
        }

        // The guard covers a concurrent first insert of the same cell.
        let upserted = tx
            .execute(
                "INSERT INTO tally_cells (tenant_id, entity_id, column_key, value, updated_at) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (tenant_id, entity_id, column_key) DO UPDATE \
                   SET value = EXCLUDED.value, updated_at = EXCLUDED.updated_at \
                   WHERE tally_cells.updated_at <= EXCLUDED.updated_at",
                &[&tenant, &entity, &column, &Json(&write.value), &write.accepted_at],
            )
            .await
            .map_err(query_error)?;
        if upserted == 0 {
            return Ok(CellWriteOutcome::Superseded {
                stored_at: write.accepted_at,
            });
        }

        let committed_at: Timestamp = tx
            .query_one("SELECT clock_timestamp()", &[])
            .await
            .map_err(query_error)?
            .get(0);
        let event = insert_event(
            &tx,
            NewChangeEvent::field_update(&write.origin, write.key, old_value, write.value)
                .at(committed_at),
        )
        .await?;
        tx.commit().await.map_err(query_error)?;
        Ok(CellWriteOutcome::Applied(event))
    }

    async fn snapshot(&self, tenant_id: TenantId) -> TallyResult<GridSnapshot> {
        let conn = self.conn().await?;
        let entity_rows = conn
            .query(
                "SELECT id, tenant_id, kind, name, created_at FROM tally_entities \
                 WHERE tenant_id = $1 ORDER BY id",
                &[&tenant_id.get()],
            )
            .await
            .map_err(query_error)?;
        let entities = entity_rows
            .iter()
            .map(entity_from_row)
            .collect::<TallyResult<Vec<_>>>()?;

        let columns = entities
            .iter()
            .filter(|e| e.kind == EntityKind::Client)
            .map(|e| ColumnKey::Client(e.id))
            .chain(ATTRIBUTE_FIELDS.iter().map(|f| ColumnKey::field(*f)))
            .collect();
        let rows = entities
            .into_iter()
            .filter(|e| e.kind == EntityKind::Account)
            .collect();

        let cell_rows = conn
            .query(
                "SELECT entity_id, column_key, value FROM tally_cells \
                 WHERE tenant_id = $1 AND value <> 'null'::jsonb \
                 ORDER BY entity_id, column_key",
                &[&tenant_id.get()],
            )
            .await
            .map_err(query_error)?;
        let mut cells = Vec::with_capacity(cell_rows.len());
        for row in &cell_rows {
            let raw: String = row.get("column_key");
            let column = raw.parse::<ColumnKey>().map_err(|_| corrupt("column key", &raw))?;
            let Json(value): Json<CellValue> = row.get("value");
            cells.push(CellChange::new(
                FieldKey::new(EntityId::new(row.get("entity_id")), column),
                value,
            ));
        }

        Ok(GridSnapshot {
            rows,
            columns,
            cells,
        })
    }
}
