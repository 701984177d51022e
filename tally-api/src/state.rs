//! Shared application state for Axum routers.

use std::sync::Arc;
use std::time::Instant;

use tally_core::SyncConfig;
use tally_storage::{InMemoryStore, SyncStore};

use crate::auth::{HeaderTenantResolver, TenantResolver};
use crate::ws::Fanout;

/// Which persistence backend the process is running on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Memory,
    Postgres,
}

impl StoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::Memory => "memory",
            StoreKind::Postgres => "postgres",
        }
    }
}

/// Application-wide state shared across all routes.
///
/// Owned by the server process and handed to every handler; there is no
/// module-level mutable state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SyncStore>,
    /// Live-session registry and push channel.
    pub fanout: Arc<Fanout>,
    pub sync: Arc<SyncConfig>,
    pub resolver: Arc<dyn TenantResolver>,
    pub start_time: Instant,
    pub store_kind: StoreKind,
}

impl AppState {
    pub fn new(
        store: Arc<dyn SyncStore>,
        store_kind: StoreKind,
        fanout: Arc<Fanout>,
        sync: SyncConfig,
    ) -> Self {
        Self {
            store,
            fanout,
            sync: Arc::new(sync),
            resolver: Arc::new(HeaderTenantResolver),
            start_time: Instant::now(),
            store_kind,
        }
    }

    /// State over a fresh in-memory store, for tests and local runs.
    pub fn in_memory(sync: SyncConfig, ws_buffer: usize) -> Self {
        Self::new(
            Arc::new(InMemoryStore::new()),
            StoreKind::Memory,
            Arc::new(Fanout::new(ws_buffer)),
            sync,
        )
    }

    /// Replace the caller-identity resolver.
    pub fn with_resolver(mut self, resolver: Arc<dyn TenantResolver>) -> Self {
        self.resolver = resolver;
        self
    }
}

crate::impl_from_ref!(Arc<dyn SyncStore>, store);
crate::impl_from_ref!(Arc<Fanout>, fanout);
crate::impl_from_ref!(Arc<SyncConfig>, sync);
crate::impl_from_ref!(Arc<dyn TenantResolver>, resolver);
crate::impl_from_ref!(Instant, start_time);
crate::impl_from_ref!(StoreKind, store_kind);
