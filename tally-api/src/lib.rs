//! Tally API - Sync Server for the Expense Grid
//!
//! HTTP endpoints accept debounced cell flushes, bulk updates and
//! structural mutations; a WebSocket channel pushes every accepted change
//! to the other live sessions of the same tenant. Sessions that missed a
//! push reconcile through the change pull endpoint.
//!
//! Persistence goes through the `tally-storage` traits: PostgreSQL via
//! [`db::PgStore`] in production, [`tally_storage::InMemoryStore`] for
//! tests and single-process runs.

#[macro_use]
pub mod macros;

pub mod auth;
pub mod config;
pub mod constants;
pub mod db;
pub mod error;
pub mod events;
pub mod jobs;
pub mod routes;
pub mod state;
pub mod telemetry;
pub mod types;
pub mod validation;
pub mod ws;

// Re-export commonly used types
pub use auth::{AuthContext, HeaderTenantResolver, TenantResolver};
pub use config::ApiConfig;
pub use db::{DbConfig, PgStore};
pub use error::{ApiError, ApiResult, ErrorCode};
pub use events::SyncMessage;
pub use routes::create_api_router;
pub use state::{AppState, StoreKind};
pub use types::*;
pub use ws::{ConnectionId, Fanout};
