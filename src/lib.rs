//! Wiki gateway: API token governance and the OpenAI-compatible chat
//! completions endpoint of the knowledge base.
//!
//! The binary (`wikigate`) and the integration tests in `tests/` both build
//! on this library.

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderName, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

pub mod api;
pub mod cache;
pub mod cli;
pub mod config;
pub mod errors;
pub mod jobs;
pub mod middleware;
pub mod models;
pub mod proxy;
pub mod store;

use cache::TieredCache;
use config::Config;
use proxy::upstream::ChatEngine;
use store::token_store::TokenStore;
use store::{AppSettingsRepo, AuditRepo, TokenRepo};

/// Shared application state passed to handlers and middleware.
pub struct AppState {
    pub config: Config,
    pub tokens: TokenStore,
    pub audit: Arc<dyn AuditRepo>,
    pub apps: Arc<dyn AppSettingsRepo>,
    pub chat: Arc<dyn ChatEngine>,
}

impl AppState {
    pub fn new(
        config: Config,
        cache: TieredCache,
        token_repo: Arc<dyn TokenRepo>,
        audit: Arc<dyn AuditRepo>,
        apps: Arc<dyn AppSettingsRepo>,
        chat: Arc<dyn ChatEngine>,
    ) -> Self {
        let tokens = TokenStore::new(token_repo, cache, config.token_cache_ttl_secs);
        Self {
            config,
            tokens,
            audit,
            apps,
            chat,
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let share = Router::new()
        .route(
            "/v1/chat/completions",
            post(proxy::handler::chat_completions),
        )
        .layer(share_cors());

    Router::new()
        // Health endpoints (no auth)
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }))
        .route("/metrics", get(metrics_handler))
        .nest("/share", share)
        .nest("/api/pro/v1/token", api::token_router(state.clone()))
        .with_state(state)
        .layer(DefaultBodyLimit::max(10 * 1024 * 1024))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(
            middleware::headers::request_id_middleware,
        ))
        .layer(axum::middleware::from_fn(
            middleware::headers::security_headers_middleware,
        ))
}

/// Public chat endpoints are called from any origin.
fn share_cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::ORIGIN,
            header::ACCEPT,
            header::AUTHORIZATION,
            HeaderName::from_static("x-kb-id"),
        ])
}

async fn metrics_handler() -> Response {
    match middleware::metrics::encode_metrics() {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("encode metrics failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
