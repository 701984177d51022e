//! Constants for the Tally API
//!
//! Centralizing constants makes them easy to find, modify, and test.
//! Synchronization defaults (debounce, chunk size, retention windows) live
//! in `tally_core::config`.

// ============================================================================
// SERVER
// ============================================================================

/// Default bind host
pub const DEFAULT_BIND_HOST: &str = "0.0.0.0";

/// Default HTTP port
pub const DEFAULT_PORT: u16 = 3000;

/// Default capacity of the fanout broadcast channel
pub const DEFAULT_WS_BUFFER: usize = 1024;

// ============================================================================
// CORS
// ============================================================================

/// Default CORS max age in seconds (24 hours)
pub const DEFAULT_CORS_MAX_AGE_SECS: u64 = 86400;

// ============================================================================
// CALLER IDENTITY HEADERS
// ============================================================================

/// Effective owner id, already resolved by the upstream tenant service
pub const TENANT_HEADER: &str = "x-tenant-id";

/// Acting user id
pub const USER_HEADER: &str = "x-user-id";

/// Logical client session id
pub const SESSION_HEADER: &str = "x-session-id";

// ============================================================================
// REQUEST LIMITS
// ============================================================================

/// Maximum records accepted by one autosave flush
pub const MAX_FLUSH_RECORDS: usize = 10_000;

/// Maximum records accepted by one bulk mutation
pub const MAX_BULK_RECORDS: usize = 200_000;

/// Maximum events returned by one pull
pub const MAX_PULL_EVENTS: usize = 5_000;

// ============================================================================
// RETENTION
// ============================================================================

/// How often field-update events are pruned (1 hour)
pub const FIELD_PRUNE_INTERVAL_SECS: u64 = 3600;

// ============================================================================
// DATABASE
// ============================================================================

/// Default connection pool size
pub const DEFAULT_DB_POOL_SIZE: usize = 16;

/// Default pool wait timeout in seconds
pub const DEFAULT_DB_TIMEOUT_SECS: u64 = 30;
