//! API client layer for the REST and WebSocket endpoints.

use crate::config::{ClientConfig, ConfigError, ReconnectConfig};
use crate::error::{ClientError, ClientResult};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tally_api::constants::{SESSION_HEADER, TENANT_HEADER, USER_HEADER};
use tally_api::error::ApiError as ApiServerError;
use tally_api::types::{
    BulkRequest, BulkResponse, CreateEntityRequest, DeleteEntityResponse, FlushRequest,
    FlushResponse, PullCursor, PullResponse,
};
use tally_core::{Entity, EntityId, GridSnapshot, SessionId};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::WebSocketStream;

pub type WsStream = WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Server operations the sync engine depends on.
///
/// Implemented over HTTP by [`RestClient`]; tests substitute an in-process
/// double.
#[async_trait]
pub trait SyncBackend: Send + Sync {
    async fn flush(&self, request: &FlushRequest) -> ClientResult<FlushResponse>;

    async fn bulk(&self, request: &BulkRequest) -> ClientResult<BulkResponse>;

    /// Events not caused by this session after `cursor`; `None` lets the
    /// server pick its retention horizon.
    async fn pull(&self, cursor: Option<PullCursor>) -> ClientResult<PullResponse>;

    async fn snapshot(&self) -> ClientResult<GridSnapshot>;

    async fn create_entity(&self, request: &CreateEntityRequest) -> ClientResult<Entity>;

    async fn delete_entity(&self, id: EntityId) -> ClientResult<DeleteEntityResponse>;
}

// ============================================================================
// REST
// ============================================================================

#[derive(Clone)]
pub struct RestClient {
    client: reqwest::Client,
    base_url: String,
    session_id: SessionId,
    headers: HeaderMap,
}

impl RestClient {
    pub fn new(config: &ClientConfig, session_id: &SessionId) -> ClientResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            session_id: session_id.clone(),
            headers: identity_headers(config, session_id)?,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T, Q>(&self, path: &str, query: Option<&Q>) -> ClientResult<T>
    where
        T: DeserializeOwned,
        Q: Serialize + ?Sized,
    {
        let mut request = self.client.get(self.url(path)).headers(self.headers.clone());
        if let Some(query) = query {
            request = request.query(query);
        }
        let response = request.send().await?;
        Self::handle_response(response).await
    }

    async fn post_json<T, B>(&self, path: &str, body: &B) -> ClientResult<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let response = self
            .client
            .post(self.url(path))
            .headers(self.headers.clone())
            .json(body)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    async fn delete_json<T: DeserializeOwned>(&self, path: &str) -> ClientResult<T> {
        let response = self
            .client
            .delete(self.url(path))
            .headers(self.headers.clone())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    async fn handle_response<T: DeserializeOwned>(response: reqwest::Response) -> ClientResult<T> {
        let status = response.status();
        if status.is_success() {
            let bytes = response.bytes().await?;
            return Ok(serde_json::from_slice(&bytes)?);
        }

        let text = response.text().await.unwrap_or_default();
        Err(rejection(status.as_u16(), &text))
    }
}

/// Map an error response to `ClientError::Rejected`, using the server's
/// structured body when it has one.
pub(crate) fn rejection(status: u16, body: &str) -> ClientError {
    match serde_json::from_str::<ApiServerError>(body) {
        Ok(api) => ClientError::Rejected {
            status,
            message: api.message,
            retryable: api.retryable || status >= 500,
        },
        Err(_) => ClientError::Rejected {
            status,
            message: body.to_string(),
            retryable: status >= 500,
        },
    }
}

#[async_trait]
impl SyncBackend for RestClient {
    async fn flush(&self, request: &FlushRequest) -> ClientResult<FlushResponse> {
        self.post_json("/api/v1/cells/batch", request).await
    }

    async fn bulk(&self, request: &BulkRequest) -> ClientResult<BulkResponse> {
        self.post_json("/api/v1/cells/bulk", request).await
    }

    async fn pull(&self, cursor: Option<PullCursor>) -> ClientResult<PullResponse> {
        let params = PullCursor::params(cursor, self.session_id.clone());
        self.get_json("/api/v1/changes", Some(&params)).await
    }

    async fn snapshot(&self) -> ClientResult<GridSnapshot> {
        self.get_json::<GridSnapshot, ()>("/api/v1/grid", None).await
    }

    async fn create_entity(&self, request: &CreateEntityRequest) -> ClientResult<Entity> {
        self.post_json("/api/v1/entities", request).await
    }

    async fn delete_entity(&self, id: EntityId) -> ClientResult<DeleteEntityResponse> {
        self.delete_json(&format!("/api/v1/entities/{}", id)).await
    }
}

// ============================================================================
// WEBSOCKET
// ============================================================================

#[derive(Clone)]
pub struct WsClient {
    endpoint: String,
    session_id: SessionId,
    headers: HeaderMap,
    reconnect: ReconnectConfig,
}

impl WsClient {
    pub fn new(config: &ClientConfig, session_id: &SessionId) -> ClientResult<Self> {
        Ok(Self {
            endpoint: config.ws_endpoint.clone(),
            session_id: session_id.clone(),
            headers: identity_headers(config, session_id)?,
            reconnect: config.reconnect.clone(),
        })
    }

    pub async fn connect(&self) -> ClientResult<WsStream> {
        let url = format!("{}?sessionId={}", self.endpoint, self.session_id);
        let mut request = url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        for (name, value) in self.headers.iter() {
            headers.insert(name, value.clone());
        }
        let (stream, _) = tokio_tungstenite::connect_async(request).await?;
        Ok(stream)
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn reconnect_config(&self) -> &ReconnectConfig {
        &self.reconnect
    }
}

fn identity_headers(config: &ClientConfig, session_id: &SessionId) -> ClientResult<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(
        HeaderName::from_static(TENANT_HEADER),
        header_value("tenant_id", &config.tenant_id.to_string())?,
    );
    headers.insert(
        HeaderName::from_static(USER_HEADER),
        header_value("user_id", &config.user_id)?,
    );
    headers.insert(
        HeaderName::from_static(SESSION_HEADER),
        header_value("session_id", session_id.as_str())?,
    );
    Ok(headers)
}

fn header_value(field: &'static str, value: &str) -> ClientResult<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| {
        ClientError::Config(ConfigError::InvalidValue {
            field,
            reason: e.to_string(),
        })
    })
}
