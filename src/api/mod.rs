use std::sync::Arc;

use axum::{
    http::StatusCode,
    middleware,
    routing::{delete, get, patch, post},
    Router,
};

use crate::middleware::auth::management_auth;
use crate::AppState;

pub mod handlers;

/// Build the token management router.
/// All routes are relative; the caller mounts this under `/api/pro/v1/token`.
pub fn token_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/create", post(handlers::create_token))
        .route("/list", get(handlers::list_tokens))
        .route("/update", patch(handlers::update_token))
        .route("/delete", delete(handlers::delete_token))
        .layer(middleware::from_fn_with_state(state, management_auth))
        .fallback(fallback_404)
}

async fn fallback_404() -> StatusCode {
    StatusCode::NOT_FOUND
}
