//! Bearer API key authentication and session extraction.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::RequestPartsExt;
use axum_extra::headers::authorization::Bearer;
use axum_extra::headers::Authorization;
use axum_extra::TypedHeader;
use sha2::{Digest, Sha256};
use tracing::debug;

use i2m_models::{JobId, SessionId};
use i2m_store::OwnerCheck;

use crate::error::{ApiError, ApiResult};
use crate::security::parse_session_id;
use crate::state::AppState;

/// Header carrying the browser session id.
pub const SESSION_HEADER: &str = "X-Session-ID";

/// Access level of an authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Admin,
}

/// Authenticated caller extracted from the `Authorization` header.
///
/// The admin key is accepted everywhere the user key is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiCaller {
    pub role: Role,
}

impl ApiCaller {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Caller holding the admin key.
#[derive(Debug, Clone, Copy)]
pub struct AdminCaller;

/// Session id from the `X-Session-ID` header, if sent.
#[derive(Debug, Clone, Default)]
pub struct SessionHeader(pub Option<SessionId>);

/// Compare two secrets without leaking the position of the first mismatch.
///
/// Both sides are hashed first so the comparison length is fixed.
pub fn keys_match(presented: &str, expected: &str) -> bool {
    let a = Sha256::digest(presented.as_bytes());
    let b = Sha256::digest(expected.as_bytes());
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Check that the caller may read a job.
///
/// Admin callers and jobs without an owner pass; a session that is not the
/// owner gets 403.
pub async fn authorize_job(
    state: &AppState,
    caller: &ApiCaller,
    session: &SessionHeader,
    job_id: &JobId,
) -> ApiResult<()> {
    if caller.is_admin() {
        return Ok(());
    }

    match state.jobs.check_owner(job_id, session.0.as_ref()).await? {
        OwnerCheck::Denied => {
            debug!(job_id = %job_id, "Rejected access to job owned by another session");
            Err(ApiError::forbidden("Job belongs to another session"))
        }
        OwnerCheck::Owner | OwnerCheck::Unowned => Ok(()),
    }
}

async fn bearer_token(parts: &mut Parts) -> Option<String> {
    parts
        .extract::<TypedHeader<Authorization<Bearer>>>()
        .await
        .ok()
        .map(|TypedHeader(Authorization(bearer))| bearer.token().to_string())
}

#[axum::async_trait]
impl FromRequestParts<AppState> for ApiCaller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts).await;

        if let (Some(token), Some(admin_key)) = (&token, &state.config.admin_api_key) {
            if keys_match(token, admin_key) {
                return Ok(ApiCaller { role: Role::Admin });
            }
        }

        match (&state.config.api_key, &token) {
            // Auth disabled for user routes
            (None, _) => Ok(ApiCaller { role: Role::User }),
            (Some(_), None) => Err(ApiError::unauthorized("Missing bearer token")),
            (Some(expected), Some(token)) => {
                if keys_match(token, expected) {
                    Ok(ApiCaller { role: Role::User })
                } else {
                    debug!("Rejected request with invalid API key");
                    Err(ApiError::unauthorized("Invalid API key"))
                }
            }
        }
    }
}

#[axum::async_trait]
impl FromRequestParts<AppState> for AdminCaller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(admin_key) = &state.config.admin_api_key else {
            return Err(ApiError::forbidden("Admin access is not configured"));
        };

        let token = bearer_token(parts)
            .await
            .ok_or_else(|| ApiError::unauthorized("Missing bearer token"))?;

        if keys_match(&token, admin_key) {
            return Ok(AdminCaller);
        }

        // A valid user key is authenticated but not allowed here
        match &state.config.api_key {
            Some(user_key) if keys_match(&token, user_key) => {
                Err(ApiError::forbidden("Admin access required"))
            }
            None => Err(ApiError::forbidden("Admin access required")),
            Some(_) => Err(ApiError::unauthorized("Invalid API key")),
        }
    }
}

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for SessionHeader {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        match parts.headers.get(SESSION_HEADER) {
            None => Ok(SessionHeader(None)),
            Some(value) => {
                let raw = value
                    .to_str()
                    .map_err(|_| ApiError::bad_request("Invalid session ID format"))?;
                Ok(SessionHeader(Some(parse_session_id(raw)?)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_match() {
        assert!(keys_match("secret-key", "secret-key"));
        assert!(!keys_match("secret-key", "secret-kez"));
        assert!(!keys_match("", "secret-key"));
        assert!(!keys_match("secret-key-longer", "secret-key"));
    }
}
