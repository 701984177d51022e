//! WebSocket realtime manager with reconnect backoff.
//!
//! Every successful connect is announced with [`ClientEvent::Reconnected`];
//! the session answers it with an immediate reconciliation poll, which
//! recovers whatever was pushed while the connection was down.

use crate::api_client::WsClient;
use crate::config::ReconnectConfig;
use crate::events::ClientEvent;
use futures_util::StreamExt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tally_api::SyncMessage;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Run the connection loop until the receiving side goes away.
pub fn spawn_ws_manager(ws: WsClient, sender: mpsc::Sender<ClientEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let reconnect = ws.reconnect_config().clone();
        let mut backoff = reconnect.initial_ms;
        let mut connections: u64 = 0;
        loop {
            match ws.connect().await {
                Ok(mut stream) => {
                    connections += 1;
                    backoff = reconnect.initial_ms;
                    info!(connection = connections, session_id = %ws.session_id(), "Push channel connected");
                    if sender
                        .send(ClientEvent::Reconnected {
                            connection: connections,
                        })
                        .await
                        .is_err()
                    {
                        return;
                    }

                    while let Some(message) = stream.next().await {
                        match message {
                            Ok(Message::Text(text)) => match serde_json::from_str::<SyncMessage>(&text) {
                                Ok(event) => {
                                    if sender.send(ClientEvent::Push(Box::new(event))).await.is_err() {
                                        return;
                                    }
                                }
                                Err(err) => {
                                    warn!(error = %err, "Undecodable push message");
                                    let _ = sender
                                        .send(ClientEvent::TransportError(format!(
                                            "WS decode error: {}",
                                            err
                                        )))
                                        .await;
                                }
                            },
                            Ok(Message::Close(_)) => break,
                            Ok(_) => {}
                            Err(err) => {
                                let _ = sender.send(ClientEvent::TransportError(err.to_string())).await;
                                break;
                            }
                        }
                    }

                    if sender
                        .send(ClientEvent::Disconnected {
                            reason: "connection closed".to_string(),
                        })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Err(err) => {
                    debug!(error = %err, backoff_ms = backoff, "Push channel connect failed");
                    if sender.send(ClientEvent::TransportError(err.to_string())).await.is_err() {
                        return;
                    }
                }
            }

            let delay = jittered_backoff(backoff, reconnect.jitter_ms);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            backoff = next_backoff(backoff, &reconnect);
        }
    })
}

/// Backoff after `current_ms`, growing by the multiplier up to `max_ms`.
pub fn next_backoff(current_ms: u64, config: &ReconnectConfig) -> u64 {
    let next = (current_ms as f64 * config.multiplier) as u64;
    next.min(config.max_ms)
}

pub fn jittered_backoff(base_ms: u64, jitter_ms: u64) -> u64 {
    if jitter_ms == 0 {
        return base_ms;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_nanos(0))
        .subsec_nanos() as u64;
    let jitter = nanos % jitter_ms;
    base_ms.saturating_add(jitter)
}
