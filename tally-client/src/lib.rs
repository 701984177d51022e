//! Tally client synchronization engine.
//!
//! Keeps a local grid consistent with the server: buffers and autosaves
//! local edits, applies pushed updates, and reconciles by pull whatever the
//! push channel missed.

pub mod api_client;
pub mod autosave;
pub mod buffer;
pub mod config;
pub mod error;
pub mod events;
pub mod filter;
pub mod grid;
pub mod lookup;
pub mod mock;
pub mod operations;
pub mod pacer;
pub mod realtime;
pub mod reconcile;
pub mod session;

pub use api_client::{RestClient, SyncBackend, WsClient};
pub use autosave::{AutosaveEvent, AutosaveHandle, AutosaveScheduler};
pub use buffer::ChangeBuffer;
pub use config::ClientConfig;
pub use error::{ClientError, ClientResult};
pub use events::ClientEvent;
pub use filter::SessionFilter;
pub use grid::{ApplyOutcome, BatchApply, Grid};
pub use lookup::LookupIndex;
pub use operations::{Completion, OperationTracker};
pub use pacer::FramePacer;
pub use reconcile::{Reconciled, ReconciliationPoller};
pub use session::{Handled, ReconcileReport, SyncSession};
