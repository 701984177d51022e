//! Per-session ledger of structural events already delivered by pull.

use async_trait::async_trait;
use tally_core::{ChangeEvent, EventKind, SessionId, TallyResult, TenantId, Timestamp};

/// Idempotency ledger for structural events.
///
/// Structural events stay discoverable for a look-back window instead of
/// "since cursor", so the same poller would otherwise see them on every
/// poll. The tracker hands each event to each session at most once.
#[async_trait]
pub trait DedupTracker: Send + Sync {
    /// Claim the structural events of `kind` newer than `window_start` that
    /// `session_id` has not been handed yet.
    ///
    /// Events caused by `session_id` itself are never returned. Every event
    /// returned is recorded as processed for the session in the same step,
    /// so a concurrent claim by the same session cannot return it again.
    ///
    /// # Arguments
    ///
    /// * `tenant_id` - Tenant whose log is searched
    /// * `session_id` - The polling session
    /// * `kind` - A structural event kind
    /// * `window_start` - Lower bound of the look-back window (exclusive)
    async fn claim_unseen(
        &self,
        tenant_id: TenantId,
        session_id: &SessionId,
        kind: EventKind,
        window_start: Timestamp,
    ) -> TallyResult<Vec<ChangeEvent>>;

    /// Delete processed records written before `before`.
    ///
    /// Returns the number of records removed.
    async fn prune_processed(&self, before: Timestamp) -> TallyResult<u64>;
}
