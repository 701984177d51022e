//! Caller identity.
//!
//! Authentication and tenant hierarchy resolution happen upstream. This
//! module only turns an already-resolved request into an [`AuthContext`]
//! through the [`TenantResolver`] seam, so a deployment can plug in its own
//! resolver without touching the handlers.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{FromRef, FromRequestParts};
use axum::http::request::Parts;
use tally_core::{Origin, SessionId, TenantId, UserId};

use crate::constants::{SESSION_HEADER, TENANT_HEADER, USER_HEADER};
use crate::error::{ApiError, ApiResult};

// ============================================================================
// AUTH CONTEXT
// ============================================================================

/// Resolved identity of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    /// Effective owner id every read and write is scoped to.
    pub tenant_id: TenantId,
    pub user_id: UserId,
    /// Logical client session, when the caller sent one.
    pub session_id: Option<SessionId>,
}

impl AuthContext {
    pub fn new(tenant_id: TenantId, user_id: UserId, session_id: Option<SessionId>) -> Self {
        Self {
            tenant_id,
            user_id,
            session_id,
        }
    }

    /// Origin stamp for a mutation. Mutations must name their session so
    /// the writer can recognise its own echoes.
    pub fn require_origin(&self) -> ApiResult<Origin> {
        let session_id = self
            .session_id
            .clone()
            .ok_or_else(|| ApiError::missing_field(SESSION_HEADER))?;
        Ok(Origin::new(self.tenant_id, session_id, self.user_id.clone()))
    }
}

// ============================================================================
// TENANT RESOLVER
// ============================================================================

/// Maps an incoming request to the caller's effective owner id.
#[async_trait]
pub trait TenantResolver: Send + Sync {
    async fn resolve(&self, parts: &Parts) -> ApiResult<AuthContext>;
}

/// Reads identity from headers set by the upstream gateway:
/// `X-Tenant-ID`, `X-User-ID` and optionally `X-Session-ID`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderTenantResolver;

#[async_trait]
impl TenantResolver for HeaderTenantResolver {
    async fn resolve(&self, parts: &Parts) -> ApiResult<AuthContext> {
        let tenant_raw = header(parts, TENANT_HEADER)
            .ok_or_else(|| ApiError::unauthorized("Missing X-Tenant-ID header"))?;
        let tenant_id = tenant_raw
            .parse::<i64>()
            .ok()
            .filter(|id| *id > 0)
            .map(TenantId::new)
            .ok_or_else(|| ApiError::invalid_format(TENANT_HEADER, "positive integer"))?;

        let user_id = header(parts, USER_HEADER)
            .map(UserId::new)
            .ok_or_else(|| ApiError::unauthorized("Missing X-User-ID header"))?;

        let session_id = header(parts, SESSION_HEADER).map(SessionId::new);

        Ok(AuthContext::new(tenant_id, user_id, session_id))
    }
}

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

// ============================================================================
// EXTRACTOR
// ============================================================================

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthContext
where
    S: Send + Sync,
    Arc<dyn TenantResolver>: FromRef<S>,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let resolver = Arc::<dyn TenantResolver>::from_ref(state);
        resolver.resolve(parts).await
    }
}
