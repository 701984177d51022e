//! Error types for the client engine.

use crate::config::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Server rejected request ({status}): {message}")]
    Rejected {
        status: u16,
        message: String,
        retryable: bool,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Unexpected response: {0}")]
    InvalidResponse(String),
    #[error("Autosave task has stopped")]
    AutosaveStopped,
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

impl ClientError {
    /// Whether repeating the same request later can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Http(err) => {
                err.is_timeout()
                    || err.is_connect()
                    || err.status().is_some_and(|s| s.is_server_error())
            }
            ClientError::WebSocket(_) => true,
            ClientError::Rejected { retryable, .. } => *retryable,
            ClientError::Serde(_)
            | ClientError::Config(_)
            | ClientError::InvalidResponse(_)
            | ClientError::AutosaveStopped => false,
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;
