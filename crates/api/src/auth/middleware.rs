//! Authentication middleware for Axum

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::state::AppState;

/// Authenticated user extracted from the access token
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub email: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authentication")]
    MissingAuth,
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Invalid secret")]
    InvalidSecret,
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            AuthError::MissingAuth => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                "Authentication required",
            ),
            AuthError::InvalidToken => (
                StatusCode::UNAUTHORIZED,
                "INVALID_TOKEN",
                "Invalid or expired token",
            ),
            AuthError::InvalidSecret => (StatusCode::FORBIDDEN, "FORBIDDEN", "Invalid secret"),
            AuthError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "Internal server error",
            ),
        };

        let body = Json(json!({
            "success": false,
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Extract bearer token from the Authorization header
fn extract_bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

fn secrets_match(provided: &str, expected: &str) -> bool {
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Middleware that requires a valid user access token
///
/// The billing profile is created on first sight of a user.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let Some(token) = extract_bearer_token(&request) else {
        tracing::debug!(path = %path, "require_auth: no bearer token");
        return AuthError::MissingAuth.into_response();
    };

    let auth_user = match state
        .jwt_manager
        .validate_token(token)
        .and_then(|claims| {
            Ok(AuthUser {
                user_id: claims.user_id()?,
                email: claims.email.unwrap_or_default(),
            })
        }) {
        Ok(user) => user,
        Err(err) => {
            tracing::warn!(path = %path, error = %err, "require_auth: authentication failed");
            return err.into_response();
        }
    };

    if let Err(e) = state
        .billing
        .ensure_profile(auth_user.user_id, &auth_user.email)
        .await
    {
        tracing::error!(user_id = %auth_user.user_id, error = %e, "Failed to ensure billing profile");
        return AuthError::Internal(e.to_string()).into_response();
    }

    request.extensions_mut().insert(auth_user);
    next.run(request).await
}

async fn require_secret(
    kind: &'static str,
    expected: &str,
    request: Request,
    next: Next,
) -> Response {
    let rejection = match extract_bearer_token(&request) {
        None => Some(AuthError::MissingAuth),
        Some(provided) if !secrets_match(provided, expected) => Some(AuthError::InvalidSecret),
        Some(_) => None,
    };

    match rejection {
        Some(err) => {
            tracing::warn!(path = %request.uri().path(), kind, error = %err, "Bearer secret rejected");
            err.into_response()
        }
        None => next.run(request).await,
    }
}

/// Middleware guarding `/api/cron/*` with `CRON_SECRET`
pub async fn require_cron_secret(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    require_secret("cron", &state.config.cron_secret, request, next).await
}

/// Middleware guarding `/api/admin/*` with `ADMIN_API_SECRET`
pub async fn require_admin_secret(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    require_secret("admin", &state.config.admin_secret, request, next).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secrets_compare_whole_value() {
        assert!(secrets_match("cron-secret", "cron-secret"));
        assert!(!secrets_match("cron-secre", "cron-secret"));
        assert!(!secrets_match("cron-secret-and-more", "cron-secret"));
        assert!(!secrets_match("", "cron-secret"));
    }

    #[test]
    fn test_bearer_token_extraction() {
        let request = Request::builder()
            .header(AUTHORIZATION, "Bearer abc.def")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(extract_bearer_token(&request), Some("abc.def"));

        let request = Request::builder()
            .header(AUTHORIZATION, "Basic abc")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(extract_bearer_token(&request), None);

        let request = Request::builder()
            .header(AUTHORIZATION, "Bearer ")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(extract_bearer_token(&request), None);
    }
}
