//! Append-only change log.
//!
//! Every accepted mutation is recorded exactly once. The log is the source of
//! truth for reconciliation: push is best effort, pull reads from here.

use async_trait::async_trait;
use tally_core::{
    ChangeEvent, EventId, EventKind, NewChangeEvent, SessionId, TallyResult, TenantId, Timestamp,
};

/// Parameters of a cursor query against the change log.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeQuery {
    pub tenant_id: TenantId,
    /// Only events strictly newer than this are returned, unless
    /// `after_id` is set.
    pub since: Timestamp,
    /// Also return events stamped exactly `since` whose id is greater.
    /// Together with `since` this is a position in `(created_at, id)` order.
    pub after_id: Option<EventId>,
    /// Events caused by this session are omitted.
    pub exclude_session: Option<SessionId>,
    /// Restrict to these kinds. Empty means every kind.
    pub kinds: Vec<EventKind>,
    pub limit: Option<usize>,
}

impl ChangeQuery {
    pub fn since(tenant_id: TenantId, since: Timestamp) -> Self {
        Self {
            tenant_id,
            since,
            after_id: None,
            exclude_session: None,
            kinds: Vec::new(),
            limit: None,
        }
    }

    /// Resume after `id` within the `since` timestamp.
    pub fn after_event(mut self, id: Option<EventId>) -> Self {
        self.after_id = id;
        self
    }

    /// Whether `event` lies after the `(since, after_id)` position.
    pub fn is_after_position(&self, event: &ChangeEvent) -> bool {
        event.created_at > self.since
            || self
                .after_id
                .map_or(false, |id| event.created_at == self.since && event.id > id)
    }

    pub fn excluding(mut self, session_id: SessionId) -> Self {
        self.exclude_session = Some(session_id);
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = EventKind>) -> Self {
        self.kinds = kinds.into_iter().collect();
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether an event satisfies every filter of this query.
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        event.tenant_id == self.tenant_id
            && self.is_after_position(event)
            && self
                .exclude_session
                .as_ref()
                .map_or(true, |session| &event.session_id != session)
            && (self.kinds.is_empty() || self.kinds.contains(&event.kind))
    }
}

/// Durable, append-only record of accepted mutations.
///
/// # Implementation Notes
///
/// Implementations should:
/// - Assign monotonically increasing ids on append
/// - Stamp field events at commit time so `(created_at, id)` order matches
///   commit order; a reader must never see an event appear behind a
///   position it already passed
/// - Index on `(tenant_id, created_at)`, since `query` runs on every poll
/// - Never update a stored event; only retention pruning removes rows
#[async_trait]
pub trait ChangeLog: Send + Sync {
    /// Persist one accepted mutation and return it with its assigned id.
    async fn append(&self, event: NewChangeEvent) -> TallyResult<ChangeEvent>;

    /// Events matching `query`, ordered by `created_at` then id.
    ///
    /// Never returns an event caused by `query.exclude_session`.
    async fn query(&self, query: &ChangeQuery) -> TallyResult<Vec<ChangeEvent>>;

    /// Delete events of the given kinds created before `before`.
    ///
    /// Returns the number of events removed.
    async fn prune_events(&self, kinds: &[EventKind], before: Timestamp) -> TallyResult<u64>;
}
