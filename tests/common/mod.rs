//! Shared harness: in-memory stores, a scripted chat engine and request
//! helpers for driving the router with `oneshot`.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use futures::stream::{self, StreamExt};
use tower::ServiceExt;

use wiki_gateway::cache::TieredCache;
use wiki_gateway::config::Config;
use wiki_gateway::models::app::AppSettings;
use wiki_gateway::models::chat::{ChatEvent, ChatEventStream, ChatRequest, TokenUsage};
use wiki_gateway::models::token::{ApiTokenListItem, AuthContext, CreateApiTokenRequest, Permission};
use wiki_gateway::proxy::upstream::ChatEngine;
use wiki_gateway::store::memory::MemoryStore;
use wiki_gateway::store::AppSettingsRepo;
use wiki_gateway::AppState;

pub const KB: &str = "kb-1";
pub const APP_SECRET: &str = "app-secret-123";
pub const ADMIN_KEY: &str = "admin-key-for-tests";

/// Replays a fixed event script and records every request it receives.
#[derive(Clone, Default)]
pub struct ScriptedChatEngine {
    script: Vec<ChatEvent>,
    fail_start: bool,
    pub requests: Arc<Mutex<Vec<ChatRequest>>>,
}

impl ScriptedChatEngine {
    pub fn new(script: Vec<ChatEvent>) -> Self {
        Self {
            script,
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_start: true,
            ..Default::default()
        }
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatEngine for ScriptedChatEngine {
    async fn chat(&self, req: ChatRequest) -> anyhow::Result<ChatEventStream> {
        self.requests.lock().unwrap().push(req);
        if self.fail_start {
            anyhow::bail!("chat engine unavailable");
        }
        Ok(stream::iter(self.script.clone()).boxed())
    }
}

pub fn usage(prompt: i32, completion: i32) -> TokenUsage {
    TokenUsage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: prompt + completion,
    }
}

/// `data("A")`, `data("B")`, `usage(5,3,8)`, `done`
pub fn ab_script() -> Vec<ChatEvent> {
    vec![
        ChatEvent::Data("A".into()),
        ChatEvent::Data("B".into()),
        ChatEvent::Usage(usage(5, 3)),
        ChatEvent::Done,
    ]
}

pub struct Harness {
    pub store: MemoryStore,
    pub engine: ScriptedChatEngine,
    pub state: Arc<AppState>,
    pub app: Router,
}

impl Harness {
    pub async fn new(script: Vec<ChatEvent>) -> Self {
        Self::with_engine(ScriptedChatEngine::new(script)).await
    }

    pub async fn with_engine(engine: ScriptedChatEngine) -> Self {
        let store = MemoryStore::new();
        store
            .put_app_settings(KB, &AppSettings::openai_api(true, APP_SECRET))
            .await
            .unwrap();

        let config = Config {
            admin_key: Some(ADMIN_KEY.into()),
            ..Config::default()
        };
        let shared = Arc::new(store.clone());
        let state = Arc::new(AppState::new(
            config,
            TieredCache::local_only(),
            shared.clone(),
            shared.clone(),
            shared,
            Arc::new(engine.clone()),
        ));
        let app = wiki_gateway::router(state.clone());
        Self {
            store,
            engine,
            state,
            app,
        }
    }

    pub async fn create_token(&self, rpm: i32, quota: i32) -> ApiTokenListItem {
        self.create_token_with(KB, Permission::DataOperate, rpm, quota).await
    }

    pub async fn create_token_with(
        &self,
        kb_id: &str,
        permission: Permission,
        rpm: i32,
        quota: i32,
    ) -> ApiTokenListItem {
        self.state
            .tokens
            .create(
                &AuthContext::admin("owner"),
                CreateApiTokenRequest {
                    kb_id: kb_id.into(),
                    name: "test token".into(),
                    permission,
                    rate_limit_per_minute: rpm,
                    daily_quota: quota,
                },
            )
            .await
            .unwrap()
    }

    pub async fn send(&self, req: Request<Body>) -> (StatusCode, axum::http::HeaderMap, String) {
        let resp = self.app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, headers, String::from_utf8(bytes.to_vec()).unwrap())
    }
}

pub fn completion_request(secret: Option<&str>, body: serde_json::Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/share/v1/chat/completions")
        .header("content-type", "application/json")
        .header("x-kb-id", KB);
    if let Some(secret) = secret {
        builder = builder.header("authorization", format!("Bearer {}", secret));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

pub fn simple_body(stream: bool) -> serde_json::Value {
    serde_json::json!({
        "model": "wiki-model",
        "messages": [{"role": "user", "content": "what is in the wiki?"}],
        "stream": stream,
    })
}

pub fn error_of(body: &str) -> (String, String) {
    let v: serde_json::Value = serde_json::from_str(body).unwrap();
    (
        v["error"]["type"].as_str().unwrap_or_default().to_string(),
        v["error"]["message"].as_str().unwrap_or_default().to_string(),
    )
}

/// JSON payloads of all `data:` frames except the `[DONE]` terminator.
pub fn sse_chunks(body: &str) -> Vec<serde_json::Value> {
    body.split("\n\n")
        .filter_map(|frame| frame.strip_prefix("data: "))
        .filter(|data| *data != "[DONE]")
        .map(|data| serde_json::from_str(data).unwrap())
        .collect()
}
