//! Shared helpers for driving the router in-process.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tally_api::{create_api_router, ApiConfig, AppState, Fanout, StoreKind};
use tally_core::{
    ChangeEvent, Entity, EntityId, EntityKind, EventKind, GridSnapshot, NewChangeEvent, Origin,
    SessionId, StorageError, SyncConfig, TallyResult, TenantId, Timestamp,
};
use tally_storage::{
    CellWrite, CellWriteOutcome, ChangeLog, ChangeQuery, DedupTracker, GridStore, InMemoryStore,
    SyncStore,
};
use tally_test_utils::fixtures::{origin, seed_grid, SeededGrid};
use tower::ServiceExt;

pub const TENANT: i64 = 1;

pub struct TestApp {
    pub store: Arc<InMemoryStore>,
    pub state: AppState,
    pub router: Router,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_sync(SyncConfig::default())
    }

    pub fn with_sync(sync: SyncConfig) -> Self {
        let store = Arc::new(InMemoryStore::new());
        Self::with_store(store.clone(), store, sync)
    }

    /// Serve from `served`, seeding through `store` underneath it.
    pub fn with_store(
        store: Arc<InMemoryStore>,
        served: Arc<dyn SyncStore>,
        sync: SyncConfig,
    ) -> Self {
        let state = AppState::new(
            served,
            StoreKind::Memory,
            Arc::new(Fanout::new(4096)),
            sync,
        );
        let router = create_api_router(state.clone(), &ApiConfig::default());
        Self {
            store,
            state,
            router,
        }
    }

    pub fn tenant(&self) -> TenantId {
        TenantId::new(TENANT)
    }

    /// Seed rows and columns directly through the store.
    pub async fn seed(&self, accounts: usize, clients: usize) -> SeededGrid {
        seed_grid(self.store.as_ref(), &origin(self.tenant(), "seeder"), accounts, clients)
            .await
            .expect("seed should succeed")
    }

    /// Send a request as `session` of the test tenant.
    pub async fn call(
        &self,
        method: Method,
        uri: &str,
        session: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("x-tenant-id", TENANT.to_string())
            .header("x-user-id", "ops@example.com");
        if let Some(session) = session {
            builder = builder.header("x-session-id", session);
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("request should build");

        send(self.router.clone(), request).await
    }
}

/// Delegates to an in-memory store, failing every cell write once
/// `writes_left` successful writes have been used up.
pub struct FailingWrites {
    inner: Arc<InMemoryStore>,
    writes_left: AtomicUsize,
}

impl FailingWrites {
    pub fn new(inner: Arc<InMemoryStore>, writes_left: usize) -> Self {
        Self {
            inner,
            writes_left: AtomicUsize::new(writes_left),
        }
    }
}

#[async_trait]
impl ChangeLog for FailingWrites {
    async fn append(&self, event: NewChangeEvent) -> TallyResult<ChangeEvent> {
        self.inner.append(event).await
    }

    async fn query(&self, query: &ChangeQuery) -> TallyResult<Vec<ChangeEvent>> {
        self.inner.query(query).await
    }

    async fn prune_events(&self, kinds: &[EventKind], before: Timestamp) -> TallyResult<u64> {
        self.inner.prune_events(kinds, before).await
    }
}

#[async_trait]
impl DedupTracker for FailingWrites {
    async fn claim_unseen(
        &self,
        tenant_id: TenantId,
        session_id: &SessionId,
        kind: EventKind,
        window_start: Timestamp,
    ) -> TallyResult<Vec<ChangeEvent>> {
        self.inner
            .claim_unseen(tenant_id, session_id, kind, window_start)
            .await
    }

    async fn prune_processed(&self, before: Timestamp) -> TallyResult<u64> {
        self.inner.prune_processed(before).await
    }
}

#[async_trait]
impl GridStore for FailingWrites {
    async fn create_entity(
        &self,
        origin: &Origin,
        kind: EntityKind,
        name: &str,
    ) -> TallyResult<(Entity, ChangeEvent)> {
        self.inner.create_entity(origin, kind, name).await
    }

    async fn delete_entity(&self, origin: &Origin, id: EntityId) -> TallyResult<ChangeEvent> {
        self.inner.delete_entity(origin, id).await
    }

    async fn get_entity(&self, tenant_id: TenantId, id: EntityId) -> TallyResult<Option<Entity>> {
        self.inner.get_entity(tenant_id, id).await
    }

    async fn write_cell(&self, write: CellWrite) -> TallyResult<CellWriteOutcome> {
        let granted = self
            .writes_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if !granted {
            return Err(StorageError::Unavailable {
                reason: "scripted write failure".to_string(),
            }
            .into());
        }
        self.inner.write_cell(write).await
    }

    async fn snapshot(&self, tenant_id: TenantId) -> TallyResult<GridSnapshot> {
        self.inner.snapshot(tenant_id).await
    }
}

pub async fn send(router: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router
        .oneshot(request)
        .await
        .expect("router should respond");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body should read");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("body should be JSON")
    };
    (status, value)
}
