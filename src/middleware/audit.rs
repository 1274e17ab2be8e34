//! Audit recording for gateway calls.
//!
//! An [`AuditGuard`] is created when a call starts and consumed by
//! [`AuditGuard::finish`] on every exit path. If it is dropped unfinished
//! (the client went away mid-stream) the drop records the call instead, so
//! each call produces exactly one `api_call_audits` row.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::errors::{OpenAIError, OpenAIErrorKind};
use crate::middleware::metrics;
use crate::models::audit::NewApiCallAudit;
use crate::models::chat::TokenUsage;
use crate::store::AuditRepo;

/// What is known about a call before its outcome.
#[derive(Debug, Clone, Default)]
pub struct AuditMeta {
    pub kb_id: String,
    pub api_token_id: Option<String>,
    pub endpoint: String,
    pub model: String,
    pub remote_ip: String,
    pub request_id: Option<String>,
    pub stream: bool,
}

#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub status_code: u16,
    pub error_kind: Option<OpenAIErrorKind>,
    pub error_message: String,
    pub usage: TokenUsage,
}

impl CallOutcome {
    pub fn success(usage: TokenUsage) -> Self {
        Self {
            status_code: 200,
            error_kind: None,
            error_message: String::new(),
            usage,
        }
    }

    pub fn failure(kind: OpenAIErrorKind, message: impl Into<String>) -> Self {
        Self {
            status_code: kind.status_code().as_u16(),
            error_kind: Some(kind),
            error_message: message.into(),
            usage: TokenUsage::default(),
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }
}

impl From<&OpenAIError> for CallOutcome {
    fn from(e: &OpenAIError) -> Self {
        CallOutcome::failure(e.kind, e.message.clone())
    }
}

/// Milliseconds between two instants, never negative.
pub fn latency_ms(started: DateTime<Utc>, finished: DateTime<Utc>) -> i64 {
    (finished - started).num_milliseconds().max(0)
}

pub fn build_audit(
    meta: &AuditMeta,
    started: DateTime<Utc>,
    finished: DateTime<Utc>,
    outcome: &CallOutcome,
) -> NewApiCallAudit {
    NewApiCallAudit {
        kb_id: meta.kb_id.clone(),
        api_token_id: meta.api_token_id.clone(),
        endpoint: meta.endpoint.clone(),
        model: meta.model.clone(),
        status_code: i32::from(outcome.status_code),
        error_type: outcome
            .error_kind
            .map(|k| k.as_str().to_string())
            .unwrap_or_default(),
        error_message: outcome.error_message.clone(),
        prompt_tokens: outcome.usage.prompt_tokens,
        completion_tokens: outcome.usage.completion_tokens,
        total_tokens: outcome.usage.total_tokens,
        latency_ms: latency_ms(started, finished),
        remote_ip: meta.remote_ip.clone(),
        request_id: meta.request_id.clone(),
        created_at: finished,
    }
}

/// Write one audit row. Failures are logged and swallowed.
pub async fn record(
    repo: &dyn AuditRepo,
    meta: &AuditMeta,
    started: DateTime<Utc>,
    outcome: &CallOutcome,
) {
    let finished = Utc::now();
    let audit = build_audit(meta, started, finished, outcome);

    metrics::record_completion(
        outcome.status_code,
        &audit.error_type,
        meta.stream,
        &outcome.usage,
        audit.latency_ms as f64 / 1000.0,
    );

    match repo.insert_audit(&audit).await {
        Ok(()) => tracing::debug!(
            kb_id = %audit.kb_id,
            endpoint = %audit.endpoint,
            status_code = audit.status_code,
            error_kind = %audit.error_type,
            latency_ms = audit.latency_ms,
            "api call audited"
        ),
        Err(e) => tracing::warn!(
            kb_id = %audit.kb_id,
            request_id = ?audit.request_id,
            error = %e,
            "failed to write api call audit"
        ),
    }
}

pub struct AuditGuard {
    repo: Arc<dyn AuditRepo>,
    meta: AuditMeta,
    started: DateTime<Utc>,
    armed: bool,
}

impl AuditGuard {
    pub fn new(repo: Arc<dyn AuditRepo>, meta: AuditMeta, started: DateTime<Utc>) -> Self {
        Self {
            repo,
            meta,
            started,
            armed: true,
        }
    }

    pub fn meta(&self) -> &AuditMeta {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut AuditMeta {
        &mut self.meta
    }

    pub async fn finish(mut self, outcome: CallOutcome) {
        self.armed = false;
        record(self.repo.as_ref(), &self.meta, self.started, &outcome).await;
    }
}

impl Drop for AuditGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;
        let repo = self.repo.clone();
        let meta = std::mem::take(&mut self.meta);
        let started = self.started;
        let outcome = CallOutcome::failure(OpenAIErrorKind::Internal, "client disconnected");

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    record(repo.as_ref(), &meta, started, &outcome).await;
                });
            }
            Err(_) => tracing::warn!(
                kb_id = %meta.kb_id,
                "audit guard dropped outside a runtime; call not audited"
            ),
        }
    }
}
