use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use subtle::ConstantTimeEq;

use crate::errors::AppError;
use crate::models::token::AuthContext;
use crate::store::token_store::mask_secret;
use crate::AppState;

/// Constant-time string comparison.
pub fn secrets_match(provided: &str, expected: &str) -> bool {
    !expected.is_empty() && bool::from(provided.as_bytes().ct_eq(expected.as_bytes()))
}

/// `Bearer <secret>` with surrounding whitespace trimmed; `None` when the
/// prefix is missing or the secret is empty.
pub fn bearer_secret(header: &str) -> Option<&str> {
    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Middleware: builds the caller's [`AuthContext`] for the management API and
/// stores it in request extensions.
///
/// * `X-Admin-Key` + `X-User-ID`: full control, acting as that user.
/// * `Authorization: Bearer <api token>`: the token's own scope. Knowledge
///   base and permission are checked per operation.
pub async fn management_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    match authenticate(&state, req.headers()).await {
        Ok(ctx) => {
            req.extensions_mut().insert(ctx);
            next.run(req).await
        }
        Err(e) => e.into_response(),
    }
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<AuthContext, AppError> {
    if let Some(provided) = headers.get("x-admin-key").and_then(|v| v.to_str().ok()) {
        let Some(expected) = state.config.admin_key() else {
            tracing::warn!("management API: admin key not configured");
            return Err(AppError::Unauthorized);
        };
        if !secrets_match(provided, expected) {
            tracing::warn!(provided = %mask_secret(provided), "management API: invalid admin key");
            return Err(AppError::Unauthorized);
        }
        let user_id = headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| AppError::BadRequest("X-User-ID header is required".into()))?;
        return Ok(AuthContext::admin(user_id));
    }

    let secret = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_secret)
        .ok_or(AppError::Unauthorized)?;

    match state.tokens.resolve(secret, "").await? {
        Some(token) => Ok(AuthContext::from_token(&token)),
        None => {
            tracing::warn!(provided = %mask_secret(secret), "management API: unknown api token");
            Err(AppError::Unauthorized)
        }
    }
}
