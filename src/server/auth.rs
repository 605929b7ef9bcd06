//! API-key authentication.
//!
//! Tenant routes authenticate with an `x-api-key` header; only the sha-256
//! of the key is stored, so a leaked database never yields usable keys.
//! Internal operator routes use a separate shared admin token.

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::IntoResponse,
};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::state::ServerState;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Hex sha-256 of an API key, as stored on the tenant record.
pub fn hash_api_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// The authenticated tenant for a request.
#[derive(Debug)]
pub struct TenantSession {
    pub tenant_id: String,
}

pub enum AuthError {
    AccessDenied,
    InternalError,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> axum::response::Response {
        match self {
            AuthError::AccessDenied => StatusCode::FORBIDDEN.into_response(),
            AuthError::InternalError => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        }
    }
}

#[axum::async_trait]
impl FromRequestParts<ServerState> for TenantSession {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &ServerState,
    ) -> Result<Self, Self::Rejection> {
        let key = parts
            .headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(AuthError::AccessDenied)?;

        let hash = hash_api_key(key);
        match state.store.find_tenant_by_api_key_hash(&hash) {
            Ok(Some(tenant)) => Ok(TenantSession { tenant_id: tenant.id }),
            Ok(None) => {
                debug!("Unknown API key");
                Err(AuthError::AccessDenied)
            }
            Err(e) => {
                debug!("Tenant lookup failed: {}", e);
                Err(AuthError::InternalError)
            }
        }
    }
}

/// Marker extractor for the internal operator routes.
pub struct AdminAuth;

#[axum::async_trait]
impl FromRequestParts<ServerState> for AdminAuth {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &ServerState,
    ) -> Result<Self, Self::Rejection> {
        let Some(expected) = state.config.admin_token.as_deref() else {
            debug!("Internal routes disabled: no admin token configured");
            return Err(AuthError::AccessDenied);
        };

        let provided = parts
            .headers
            .get(ADMIN_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(AuthError::AccessDenied)?;

        if provided == expected {
            Ok(AdminAuth)
        } else {
            Err(AuthError::AccessDenied)
        }
    }
}
