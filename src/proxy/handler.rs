//! OpenAI-compatible chat completions endpoint.
//!
//! `POST /share/v1/chat/completions` runs one call through:
//! parse → knowledge base header → validation → flattening → app settings →
//! authorization → governance → chat engine → stream or buffer.
//!
//! Every exit path finishes the call's [`AuditGuard`] exactly once.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use futures::stream;
use futures::StreamExt;

use crate::errors::{OpenAIError, OpenAIErrorKind};
use crate::middleware::audit::{AuditGuard, AuditMeta, CallOutcome};
use crate::middleware::auth::{bearer_secret, secrets_match};
use crate::middleware::governance::check_token_governance;
use crate::middleware::headers::{client_ip, request_id};
use crate::models::chat::{AppType, ChatEvent, ChatEventStream, ChatRequest};
use crate::models::openai::ChatCompletionRequest;
use crate::proxy::stream::{
    AccumulatorStep, ChunkEncoder, CompletionAccumulator, CompletionIdentity,
};
use crate::proxy::stream_bridge::bridge_events;
use crate::proxy::transform::flatten_messages;
use crate::AppState;

pub const COMPLETIONS_ENDPOINT: &str = "/share/v1/chat/completions";

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started = Utc::now();
    let kb_id = headers
        .get("x-kb-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or_default()
        .to_string();
    let remote_ip = client_ip(&headers, peer.map(|ConnectInfo(addr)| addr));

    let mut guard = AuditGuard::new(
        state.audit.clone(),
        AuditMeta {
            kb_id: kb_id.clone(),
            endpoint: COMPLETIONS_ENDPOINT.to_string(),
            remote_ip: remote_ip.clone(),
            request_id: request_id(&headers),
            ..Default::default()
        },
        started,
    );

    let req: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            tracing::warn!(error = %e, "parse chat completion request failed");
            return reject(guard, invalid("parse request failed")).await;
        }
    };
    guard.meta_mut().model = req.model.trim().to_string();
    guard.meta_mut().stream = req.stream;

    if kb_id.is_empty() {
        return reject(guard, invalid("X-KB-ID header is required")).await;
    }
    if req.model.trim().is_empty() {
        tracing::warn!(kb_id = %kb_id, "chat completion request without model");
        return reject(guard, invalid("validate request failed")).await;
    }
    if req.messages.is_empty() {
        return reject(guard, invalid("messages cannot be empty")).await;
    }
    let prompt = match flatten_messages(&req.messages) {
        Ok(flat) => flat.render(),
        Err(e) => return reject(guard, invalid(e.to_string())).await,
    };

    let bot = match state.apps.get_app_settings(&kb_id).await {
        Ok(settings) => settings.unwrap_or_default().openai_api_bot_settings,
        Err(e) => {
            tracing::error!(kb_id = %kb_id, error = %e, "load openai api app settings failed");
            return reject(guard, OpenAIError::new(OpenAIErrorKind::Internal, e.to_string())).await;
        }
    };
    if !bot.is_enabled {
        return reject(
            guard,
            OpenAIError::new(OpenAIErrorKind::Forbidden, "API Bot is not enabled"),
        )
        .await;
    }

    let secret = match headers.get(header::AUTHORIZATION).map(|v| v.to_str()) {
        None => return reject(guard, invalid("Authorization header is required")).await,
        Some(Err(_)) => return reject(guard, invalid("Invalid Authorization key format")).await,
        Some(Ok(value)) => match bearer_secret(value) {
            Some(secret) => secret,
            None => return reject(guard, invalid("Invalid Authorization key format")).await,
        },
    };

    let token = match state.tokens.resolve(secret, &kb_id).await {
        Ok(token) => token,
        Err(e) => {
            tracing::warn!(kb_id = %kb_id, error = %e, "resolve api token failed");
            None
        }
    };
    if let Some(t) = &token {
        guard.meta_mut().api_token_id = Some(t.id.clone());
    }

    let by_app_secret = secrets_match(secret, &bot.secret_key);
    if !by_app_secret && token.is_none() {
        return reject(
            guard,
            OpenAIError::new(OpenAIErrorKind::Unauthorized, "Invalid Authorization key"),
        )
        .await;
    }

    if let Some(t) = &token {
        match check_token_governance(state.audit.as_ref(), t, COMPLETIONS_ENDPOINT, started).await {
            Ok(decision) => {
                if let Some(rejection) = decision.rejection() {
                    return reject(guard, rejection).await;
                }
            }
            // fail open
            Err(e) => tracing::warn!(
                token_id = %t.id,
                error = %e,
                "check api token governance failed"
            ),
        }
    }

    let chat_req = ChatRequest {
        message: prompt,
        kb_id: kb_id.clone(),
        app_type: AppType::OpenaiApi,
        remote_ip,
    };
    let events = match state.chat.chat(chat_req).await {
        Ok(events) => events,
        Err(e) => {
            tracing::error!(kb_id = %kb_id, error = %e, "start chat failed");
            return reject(guard, OpenAIError::new(OpenAIErrorKind::Internal, e.to_string())).await;
        }
    };

    let identity = CompletionIdentity::new(guard.meta().model.clone());
    if req.stream {
        stream_response(events, identity, req.include_usage(), guard).await
    } else {
        buffered_response(events, identity, guard).await
    }
}

fn invalid(message: impl Into<String>) -> OpenAIError {
    OpenAIError::new(OpenAIErrorKind::InvalidRequest, message)
}

async fn reject(guard: AuditGuard, err: OpenAIError) -> Response {
    guard.finish(CallOutcome::from(&err)).await;
    err.into_response()
}

/// The first event is read before the response is committed, so an engine
/// that fails right away still gets a JSON error body.
async fn stream_response(
    mut events: ChatEventStream,
    identity: CompletionIdentity,
    include_usage: bool,
    guard: AuditGuard,
) -> Response {
    let first = events.next().await;
    if let Some(ChatEvent::Error(message)) = first {
        return reject(guard, OpenAIError::new(OpenAIErrorKind::Internal, message)).await;
    }
    let events: ChatEventStream = match first {
        Some(event) => stream::once(async move { event }).chain(events).boxed(),
        None => stream::empty().boxed(),
    };

    let body = bridge_events(events, ChunkEncoder::new(identity, include_usage), guard);
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        body,
    )
        .into_response()
}

async fn buffered_response(
    mut events: ChatEventStream,
    identity: CompletionIdentity,
    guard: AuditGuard,
) -> Response {
    let mut acc = CompletionAccumulator::new();
    while let Some(event) = events.next().await {
        match acc.push(event) {
            AccumulatorStep::Continue => {}
            AccumulatorStep::Done => {
                let usage = acc.usage();
                let resp = acc.into_response(identity);
                guard.finish(CallOutcome::success(usage)).await;
                return Json(resp).into_response();
            }
            AccumulatorStep::Failed(message) => {
                return reject(guard, OpenAIError::new(OpenAIErrorKind::Internal, message)).await;
            }
        }
    }

    tracing::warn!("chat engine stream ended without done event");
    guard
        .finish(
            CallOutcome::failure(OpenAIErrorKind::Internal, "stream ended without done event")
                .with_usage(acc.usage()),
        )
        .await;
    StatusCode::INTERNAL_SERVER_ERROR.into_response()
}
