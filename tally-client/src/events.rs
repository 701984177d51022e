//! Event types for the client session loop.

use tally_api::SyncMessage;

#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Message received on the push channel.
    Push(Box<SyncMessage>),
    /// A connection was (re)established. `connection` counts from 1.
    Reconnected { connection: u64 },
    Disconnected { reason: String },
    TransportError(String),
}
