//! API Configuration Module
//!
//! Server settings loaded from environment variables with sensible defaults
//! for development. Synchronization timings are carried as a
//! [`SyncConfig`] so the server and client agree on the same knobs.

use crate::constants::{
    DEFAULT_BIND_HOST, DEFAULT_CORS_MAX_AGE_SECS, DEFAULT_DB_POOL_SIZE, DEFAULT_DB_TIMEOUT_SECS,
    DEFAULT_PORT, DEFAULT_WS_BUFFER,
};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tally_core::{ConfigError, SyncConfig, TallyError, TallyResult};

// ============================================================================
// API CONFIGURATION
// ============================================================================

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    // ========================================================================
    // Listener
    // ========================================================================
    /// Host to bind.
    pub bind_host: String,

    /// Port to bind.
    pub port: u16,

    // ========================================================================
    // CORS Configuration
    // ========================================================================
    /// Allowed CORS origins (comma-separated in env var).
    /// Empty means allow all origins (dev mode).
    pub cors_origins: Vec<String>,

    /// Max age for CORS preflight cache in seconds.
    pub cors_max_age_secs: u64,

    // ========================================================================
    // Fanout
    // ========================================================================
    /// Capacity of the broadcast channel feeding WebSocket connections.
    pub ws_buffer: usize,

    // ========================================================================
    // Persistence
    // ========================================================================
    /// PostgreSQL connection string. `None` selects the in-memory store.
    pub database_url: Option<String>,

    /// Maximum pooled connections.
    pub db_pool_size: usize,

    /// How long a request waits for a pooled connection.
    pub db_timeout: Duration,

    // ========================================================================
    // Synchronization
    // ========================================================================
    pub sync: SyncConfig,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_host: DEFAULT_BIND_HOST.to_string(),
            port: DEFAULT_PORT,
            cors_origins: Vec::new(),
            cors_max_age_secs: DEFAULT_CORS_MAX_AGE_SECS,
            ws_buffer: DEFAULT_WS_BUFFER,
            database_url: None,
            db_pool_size: DEFAULT_DB_POOL_SIZE,
            db_timeout: Duration::from_secs(DEFAULT_DB_TIMEOUT_SECS),
            sync: SyncConfig::default(),
        }
    }
}

impl ApiConfig {
    /// Create ApiConfig from environment variables.
    ///
    /// Environment variables:
    /// - `TALLY_API_BIND`: Bind host (default: 0.0.0.0)
    /// - `PORT` / `TALLY_API_PORT`: Bind port (default: 3000)
    /// - `TALLY_CORS_ORIGINS`: Comma-separated allowed origins (empty = allow all)
    /// - `TALLY_WS_BUFFER`: Fanout channel capacity (default: 1024)
    /// - `TALLY_DATABASE_URL`: PostgreSQL URL (unset = in-memory store)
    /// - `TALLY_DB_POOL_SIZE`, `TALLY_DB_TIMEOUT_SECS`: Pool sizing
    /// - `TALLY_DEBOUNCE_MS`, `TALLY_CHUNK_SIZE`, `TALLY_STRUCTURAL_WINDOW_SECS`,
    ///   `TALLY_SWEEP_INTERVAL_SECS`, `TALLY_CHANGE_RETENTION_SECS`: Sync overrides
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let bind_host = std::env::var("TALLY_API_BIND")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(defaults.bind_host);

        let port = std::env::var("PORT")
            .ok()
            .or_else(|| std::env::var("TALLY_API_PORT").ok())
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.port);

        let cors_origins = std::env::var("TALLY_CORS_ORIGINS")
            .ok()
            .map(|s| {
                s.split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let cors_max_age_secs = env_parse("TALLY_CORS_MAX_AGE_SECS").unwrap_or(defaults.cors_max_age_secs);
        let ws_buffer = env_parse("TALLY_WS_BUFFER").unwrap_or(defaults.ws_buffer);

        let database_url = std::env::var("TALLY_DATABASE_URL")
            .ok()
            .filter(|s| !s.trim().is_empty());
        let db_pool_size = env_parse("TALLY_DB_POOL_SIZE").unwrap_or(defaults.db_pool_size);
        let db_timeout = env_parse("TALLY_DB_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.db_timeout);

        let base = defaults.sync;
        let sync = SyncConfig {
            debounce: env_parse("TALLY_DEBOUNCE_MS")
                .map(Duration::from_millis)
                .unwrap_or(base.debounce),
            chunk_size: env_parse("TALLY_CHUNK_SIZE").unwrap_or(base.chunk_size),
            structural_window: env_parse("TALLY_STRUCTURAL_WINDOW_SECS")
                .map(Duration::from_secs)
                .unwrap_or(base.structural_window),
            dedup_sweep_interval: env_parse("TALLY_SWEEP_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(base.dedup_sweep_interval),
            change_retention: env_parse("TALLY_CHANGE_RETENTION_SECS")
                .map(Duration::from_secs)
                .unwrap_or(base.change_retention),
            ..base
        };

        Self {
            bind_host,
            port,
            cors_origins,
            cors_max_age_secs,
            ws_buffer,
            database_url,
            db_pool_size,
            db_timeout,
            sync,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> TallyResult<()> {
        if self.ws_buffer == 0 {
            return Err(TallyError::Config(ConfigError::InvalidValue {
                field: "ws_buffer".to_string(),
                value: "0".to_string(),
                reason: "must be > 0".to_string(),
            }));
        }
        if self.db_pool_size == 0 {
            return Err(TallyError::Config(ConfigError::InvalidValue {
                field: "db_pool_size".to_string(),
                value: "0".to_string(),
                reason: "must be > 0".to_string(),
            }));
        }
        self.sync.validate()
    }

    /// Resolve the socket address to listen on.
    pub fn bind_addr(&self) -> TallyResult<SocketAddr> {
        let ip: IpAddr = self.bind_host.parse().map_err(|_| {
            TallyError::Config(ConfigError::InvalidValue {
                field: "TALLY_API_BIND".to_string(),
                value: self.bind_host.clone(),
                reason: "not an IP address".to_string(),
            })
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }

    /// Check if running in production mode (strict CORS).
    pub fn is_production(&self) -> bool {
        !self.cors_origins.is_empty()
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}
