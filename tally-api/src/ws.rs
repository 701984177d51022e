//! Live Sessions and Push Fanout
//!
//! Every accepted mutation is pushed to the tenant's other live sessions
//! over WebSocket. Delivery is best effort: the change log is the source of
//! truth and clients reconcile by pull.
//!
//! ## Architecture
//!
//! - One tokio broadcast channel feeds every connection task
//! - Each [`Outbound`] names its tenant and a [`RecipientFilter`]; the
//!   connection task decides whether it is a recipient
//! - The session registry maps connections to logical sessions so a
//!   reconnecting session replaces its previous connection
//! - A lagged receiver is told via an `ERROR` message and falls back to pull

use crate::auth::AuthContext;
use crate::error::{ApiError, ApiResult};
use crate::events::SyncMessage;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tally_core::{now, SessionId, TenantId, Timestamp};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

// ============================================================================
// CONNECTIONS AND FILTERS
// ============================================================================

/// Id of one physical WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Transport-level recipient selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipientFilter {
    /// Every live connection of the tenant.
    All,
    /// Every live connection of the tenant except this one.
    Except(ConnectionId),
}

impl RecipientFilter {
    pub fn admits(&self, connection: ConnectionId) -> bool {
        match self {
            RecipientFilter::All => true,
            RecipientFilter::Except(excluded) => *excluded != connection,
        }
    }
}

/// One message on the fanout channel.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub tenant_id: TenantId,
    pub filter: RecipientFilter,
    pub message: Arc<SyncMessage>,
}

impl Outbound {
    /// Whether the connection should forward this message to its client.
    pub fn is_for(&self, connection: ConnectionId, tenant_id: TenantId) -> bool {
        self.tenant_id == tenant_id && self.filter.admits(connection)
    }
}

/// Registry entry for one live connection.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEntry {
    pub session_id: SessionId,
    pub tenant_id: TenantId,
    pub connected_at: Timestamp,
    pub last_seen: Timestamp,
    pub active: bool,
}

// ============================================================================
// FANOUT
// ============================================================================

/// Live-session registry and push channel.
pub struct Fanout {
    tx: broadcast::Sender<Outbound>,
    connections: DashMap<ConnectionId, SessionEntry>,
    /// Current connection of each logical session.
    current: DashMap<SessionId, ConnectionId>,
    next_id: AtomicU64,
}

impl Fanout {
    /// Create a fanout whose channel buffers `capacity` messages before slow
    /// receivers start lagging.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            connections: DashMap::new(),
            current: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a new connection for `session_id`.
    ///
    /// The receiver is subscribed before the connection becomes visible, so
    /// no message addressed to it can be missed. A previous connection of
    /// the same session stops being its current connection.
    pub fn register(
        &self,
        tenant_id: TenantId,
        session_id: SessionId,
    ) -> (ConnectionId, broadcast::Receiver<Outbound>) {
        let rx = self.tx.subscribe();
        let connection = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let at = now();

        self.connections.insert(
            connection,
            SessionEntry {
                session_id: session_id.clone(),
                tenant_id,
                connected_at: at,
                last_seen: at,
                active: true,
            },
        );
        if let Some(previous) = self.current.insert(session_id.clone(), connection) {
            debug!(
                session_id = %session_id,
                previous = %previous,
                connection = %connection,
                "Session reconnected on a new connection"
            );
        }
        (connection, rx)
    }

    /// Record inbound activity on a connection.
    pub fn touch(&self, connection: ConnectionId) {
        if let Some(mut entry) = self.connections.get_mut(&connection) {
            entry.last_seen = now();
        }
    }

    /// Mark the connection inactive and drop it from the registry.
    pub fn unregister(&self, connection: ConnectionId) -> Option<SessionEntry> {
        if let Some(mut entry) = self.connections.get_mut(&connection) {
            entry.active = false;
        }
        let (_, entry) = self.connections.remove(&connection)?;
        self.current
            .remove_if(&entry.session_id, |_, current| *current == connection);
        Some(entry)
    }

    /// Current connection of a logical session, if it is live.
    pub fn connection_for(&self, session_id: &SessionId) -> Option<ConnectionId> {
        self.current.get(session_id).map(|c| *c)
    }

    pub fn entry(&self, connection: ConnectionId) -> Option<SessionEntry> {
        self.connections.get(&connection).map(|e| e.clone())
    }

    /// Number of live connections.
    pub fn session_count(&self) -> usize {
        self.connections.iter().filter(|e| e.active).count()
    }

    /// Number of live connections of one tenant.
    pub fn tenant_session_count(&self, tenant_id: TenantId) -> usize {
        self.connections
            .iter()
            .filter(|e| e.active && e.tenant_id == tenant_id)
            .count()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Outbound> {
        self.tx.subscribe()
    }

    /// Push to every live connection of the tenant.
    pub fn broadcast_all(&self, tenant_id: TenantId, message: SyncMessage) {
        self.publish(tenant_id, RecipientFilter::All, message);
    }

    /// Push to every live connection of the tenant except `connection`.
    pub fn broadcast_except(
        &self,
        tenant_id: TenantId,
        connection: ConnectionId,
        message: SyncMessage,
    ) {
        self.publish(tenant_id, RecipientFilter::Except(connection), message);
    }

    /// Push to everyone except the current connection of `session_id`.
    ///
    /// A session with no live connection (it mutated over plain HTTP while
    /// its socket was down) gets the message too; its receivers drop it by
    /// the embedded session id.
    pub fn broadcast_except_session(
        &self,
        tenant_id: TenantId,
        session_id: &SessionId,
        message: SyncMessage,
    ) {
        match self.connection_for(session_id) {
            Some(connection) => self.broadcast_except(tenant_id, connection, message),
            None => self.broadcast_all(tenant_id, message),
        }
    }

    fn publish(&self, tenant_id: TenantId, filter: RecipientFilter, message: SyncMessage) {
        let event_type = message.event_type();
        let outbound = Outbound {
            tenant_id,
            filter,
            message: Arc::new(message),
        };
        match self.tx.send(outbound) {
            Ok(receivers) => {
                debug!(
                    tenant_id = %tenant_id,
                    event_type = event_type,
                    receivers = receivers,
                    "Broadcast message"
                );
            }
            Err(_) => {
                debug!(event_type = event_type, "No receivers for message");
            }
        }
    }
}

// ============================================================================
// WEBSOCKET HANDLER
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsParams {
    pub session_id: Option<SessionId>,
}

/// WebSocket upgrade handler.
///
/// ## Protocol
///
/// 1. Client connects with identity headers and `?sessionId=`
/// 2. Connection is registered in the fanout under that session
/// 3. Server sends `CONNECTED`
/// 4. Server streams the tenant's messages, minus the ones this connection
///    caused
/// 5. Any inbound frame refreshes the session's `last_seen`
///
/// ```text
/// GET /api/v1/ws?sessionId=tab-1
/// X-Tenant-ID: 42
/// X-User-ID: ops@example.com
/// Upgrade: websocket
/// ```
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(fanout): State<Arc<Fanout>>,
    Query(params): Query<WsParams>,
    auth: AuthContext,
) -> ApiResult<Response> {
    let session_id = params
        .session_id
        .or(auth.session_id)
        .filter(|s| !s.is_blank())
        .ok_or_else(|| ApiError::missing_field("sessionId"))?;
    let tenant_id = auth.tenant_id;

    info!(
        tenant_id = %tenant_id,
        session_id = %session_id,
        user_id = %auth.user_id,
        "WebSocket connection request"
    );

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, fanout, tenant_id, session_id)))
}

/// Runs for the lifetime of one WebSocket connection.
async fn handle_socket(
    socket: WebSocket,
    fanout: Arc<Fanout>,
    tenant_id: TenantId,
    session_id: SessionId,
) {
    let (connection, mut rx) = fanout.register(tenant_id, session_id.clone());
    info!(
        tenant_id = %tenant_id,
        session_id = %session_id,
        connection = %connection,
        "WebSocket connected"
    );

    let (mut sender, mut receiver) = socket.split();

    let connected = SyncMessage::Connected {
        tenant_id,
        session_id: session_id.clone(),
        timestamp: now(),
    };
    if let Err(e) = send_message(&mut sender, &connected).await {
        error!(connection = %connection, error = %e, "Failed to send Connected message");
        fanout.unregister(connection);
        return;
    }

    let recv_fanout = fanout.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => {
                    debug!(connection = %connection, "Client sent close frame");
                    break;
                }
                Ok(Message::Text(_)) | Ok(Message::Binary(_)) => {
                    recv_fanout.touch(connection);
                    debug!(connection = %connection, "Received client frame (ignored)");
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                    recv_fanout.touch(connection);
                }
                Err(e) => {
                    warn!(connection = %connection, error = %e, "WebSocket receive error");
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(outbound) => {
                        if !outbound.is_for(connection, tenant_id) {
                            continue;
                        }
                        if let Err(e) = send_message(&mut sender, &outbound.message).await {
                            warn!(
                                connection = %connection,
                                session_id = %session_id,
                                error = %e,
                                "Push failed, closing connection"
                            );
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            connection = %connection,
                            skipped = skipped,
                            "Receiver lagged, pushes were dropped"
                        );
                        let lagged = SyncMessage::Error {
                            message: format!("Lagged: {} messages dropped", skipped),
                        };
                        if let Err(e) = send_message(&mut sender, &lagged).await {
                            warn!(connection = %connection, error = %e, "Failed to send Error message");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!(connection = %connection, "Fanout channel closed");
                        break;
                    }
                }
            }

            _ = &mut recv_task => {
                debug!(connection = %connection, "Receiver task finished");
                break;
            }
        }
    }

    recv_task.abort();
    fanout.unregister(connection);
    info!(
        tenant_id = %tenant_id,
        session_id = %session_id,
        connection = %connection,
        "WebSocket disconnected"
    );
}

/// Serialize and send one message as a text frame.
async fn send_message(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    message: &SyncMessage,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(message).map_err(|e| {
        error!(error = %e, "Failed to serialize message");
        axum::Error::new(e)
    })?;

    sender.send(Message::Text(json)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::{CellChange, CellValue, FieldKey};

    fn update(origin: &str) -> SyncMessage {
        SyncMessage::cell_updated(
            &SessionId::new(origin),
            CellChange::new(FieldKey::expense(1, 2), CellValue::Number(1.0)),
        )
    }

    #[test]
    fn test_filter_except_skips_only_that_connection() {
        let a = ConnectionId(1);
        let b = ConnectionId(2);
        assert!(!RecipientFilter::Except(a).admits(a));
        assert!(RecipientFilter::Except(a).admits(b));
        assert!(RecipientFilter::All.admits(a));
    }

    #[test]
    fn test_outbound_scoped_to_tenant() {
        let outbound = Outbound {
            tenant_id: TenantId::new(1),
            filter: RecipientFilter::All,
            message: Arc::new(update("s")),
        };
        assert!(outbound.is_for(ConnectionId(5), TenantId::new(1)));
        assert!(!outbound.is_for(ConnectionId(5), TenantId::new(2)));
    }

    #[test]
    fn test_broadcast_no_receivers() {
        let fanout = Fanout::new(16);
        fanout.broadcast_all(TenantId::new(1), update("s"));
    }

    #[test]
    fn test_reconnect_replaces_current_connection() {
        let fanout = Fanout::new(16);
        let session = SessionId::new("tab-1");
        let (first, _rx1) = fanout.register(TenantId::new(1), session.clone());
        let (second, _rx2) = fanout.register(TenantId::new(1), session.clone());

        assert_ne!(first, second);
        assert_eq!(fanout.connection_for(&session), Some(second));

        fanout.unregister(first);
        assert_eq!(fanout.connection_for(&session), Some(second));
        assert_eq!(fanout.session_count(), 1);

        fanout.unregister(second);
        assert_eq!(fanout.connection_for(&session), None);
        assert_eq!(fanout.session_count(), 0);
    }

    #[test]
    fn test_broadcast_except_session_targets_current_connection() {
        let fanout = Fanout::new(16);
        let tenant = TenantId::new(1);
        let (origin_conn, mut rx) = fanout.register(tenant, SessionId::new("origin"));
        let (other_conn, _rx_other) = fanout.register(tenant, SessionId::new("other"));

        fanout.broadcast_except_session(tenant, &SessionId::new("origin"), update("origin"));

        let outbound = rx.try_recv().expect("message should be queued");
        assert!(!outbound.is_for(origin_conn, tenant));
        assert!(outbound.is_for(other_conn, tenant));
    }

    #[test]
    fn test_broadcast_except_session_without_connection_goes_to_all() {
        let fanout = Fanout::new(16);
        let tenant = TenantId::new(1);
        let (conn, mut rx) = fanout.register(tenant, SessionId::new("watcher"));

        fanout.broadcast_except_session(tenant, &SessionId::new("http-only"), update("http-only"));

        let outbound = rx.try_recv().expect("message should be queued");
        assert_eq!(outbound.filter, RecipientFilter::All);
        assert!(outbound.is_for(conn, tenant));
    }

    #[test]
    fn test_touch_advances_last_seen() {
        let fanout = Fanout::new(16);
        let (conn, _rx) = fanout.register(TenantId::new(3), SessionId::new("s"));
        let before = fanout.entry(conn).expect("entry should exist").last_seen;
        fanout.touch(conn);
        let after = fanout.entry(conn).expect("entry should exist").last_seen;
        assert!(after >= before);
        assert_eq!(fanout.tenant_session_count(TenantId::new(3)), 1);
        assert_eq!(fanout.tenant_session_count(TenantId::new(4)), 0);
    }
}
