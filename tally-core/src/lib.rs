//! Tally Core - Grid Synchronization Types
//!
//! Pure data structures shared by the server and the client. No I/O lives
//! here; storage, transport and scheduling are built on top of these types.

pub mod change;
pub mod chunk;
pub mod config;
pub mod error;
pub mod grid;
pub mod identity;

pub use change::{
    ChangeEvent, EventKind, NewChangeEvent, Origin, PendingChange, ProcessedEventRecord,
};
pub use chunk::BatchChunker;
pub use config::{RetryConfig, SyncConfig};
pub use error::{ConfigError, StorageError, TallyError, TallyResult, ValidationError};
pub use grid::{
    CellChange, CellValue, ColumnKey, Entity, EntityKind, FieldKey, GridSnapshot,
    ATTRIBUTE_FIELDS,
};
pub use identity::{
    new_operation_id, now, EntityId, EventId, OperationId, SessionId, TenantId, Timestamp,
    UserId,
};
