use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::RwLock;

use super::{AppSettingsRepo, AuditRepo, TokenRepo};
use crate::models::app::AppSettings;
use crate::models::audit::{ApiCallAudit, NewApiCallAudit};
use crate::models::token::{ApiToken, TokenPatch};

/// In-process store used by tests and `--in-memory` development runs.
///
/// Failure switches make the audit paths return errors so degraded-storage
/// behaviour can be exercised.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tokens: Arc<DashMap<String, ApiToken>>,
    apps: Arc<DashMap<String, AppSettings>>,
    audits: Arc<RwLock<Vec<ApiCallAudit>>>,
    audit_seq: Arc<AtomicI64>,
    secret_lookups: Arc<AtomicUsize>,
    fail_counts: Arc<AtomicBool>,
    fail_audit_writes: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_counts(&self, fail: bool) {
        self.fail_counts.store(fail, Ordering::SeqCst);
    }

    pub fn fail_audit_writes(&self, fail: bool) {
        self.fail_audit_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of times durable storage was hit by secret.
    pub fn secret_lookups(&self) -> usize {
        self.secret_lookups.load(Ordering::SeqCst)
    }

    pub async fn audits(&self) -> Vec<ApiCallAudit> {
        self.audits.read().await.clone()
    }

    /// Insert an audit row with an explicit timestamp.
    pub async fn backfill_audit(&self, mut audit: NewApiCallAudit, created_at: DateTime<Utc>) {
        audit.created_at = created_at;
        self.push_audit(&audit).await;
    }

    async fn push_audit(&self, a: &NewApiCallAudit) {
        let id = self.audit_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.audits.write().await.push(ApiCallAudit {
            id,
            kb_id: a.kb_id.clone(),
            api_token_id: a.api_token_id.clone(),
            endpoint: a.endpoint.clone(),
            model: a.model.clone(),
            status_code: a.status_code,
            error_type: a.error_type.clone(),
            error_message: a.error_message.clone(),
            prompt_tokens: a.prompt_tokens,
            completion_tokens: a.completion_tokens,
            total_tokens: a.total_tokens,
            latency_ms: a.latency_ms,
            remote_ip: a.remote_ip.clone(),
            request_id: a.request_id.clone(),
            created_at: a.created_at,
        });
    }
}

fn owned_by(t: &ApiToken, kb_id: &str, user_id: &str) -> bool {
    t.kb_id == kb_id && t.user_id == user_id
}

#[async_trait]
impl TokenRepo for MemoryStore {
    async fn insert_token(&self, token: &ApiToken) -> anyhow::Result<()> {
        if self.tokens.iter().any(|t| t.token == token.token) {
            anyhow::bail!("duplicate token value");
        }
        self.tokens.insert(token.id.clone(), token.clone());
        Ok(())
    }

    async fn get_token_by_secret(&self, secret: &str) -> anyhow::Result<Option<ApiToken>> {
        self.secret_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .tokens
            .iter()
            .find(|t| t.token == secret)
            .map(|t| t.value().clone()))
    }

    async fn get_token(
        &self,
        id: &str,
        kb_id: &str,
        user_id: &str,
    ) -> anyhow::Result<Option<ApiToken>> {
        Ok(self
            .tokens
            .get(id)
            .filter(|t| owned_by(t, kb_id, user_id))
            .map(|t| t.value().clone()))
    }

    async fn list_tokens(&self, kb_id: &str, user_id: &str) -> anyhow::Result<Vec<ApiToken>> {
        let mut rows: Vec<ApiToken> = self
            .tokens
            .iter()
            .filter(|t| owned_by(t, kb_id, user_id))
            .map(|t| t.value().clone())
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn update_token(
        &self,
        id: &str,
        kb_id: &str,
        user_id: &str,
        patch: &TokenPatch,
    ) -> anyhow::Result<bool> {
        match self.tokens.get_mut(id) {
            Some(mut t) if owned_by(&t, kb_id, user_id) => {
                patch.apply(&mut t);
                t.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_token(&self, id: &str, kb_id: &str, user_id: &str) -> anyhow::Result<bool> {
        Ok(self
            .tokens
            .remove_if(id, |_, t| owned_by(t, kb_id, user_id))
            .is_some())
    }
}

#[async_trait]
impl AuditRepo for MemoryStore {
    async fn insert_audit(&self, audit: &NewApiCallAudit) -> anyhow::Result<()> {
        if self.fail_audit_writes.load(Ordering::SeqCst) {
            anyhow::bail!("audit store unavailable");
        }
        self.push_audit(audit).await;
        Ok(())
    }

    async fn count_by_token_since(
        &self,
        api_token_id: &str,
        endpoint: &str,
        since: DateTime<Utc>,
    ) -> anyhow::Result<i64> {
        if self.fail_counts.load(Ordering::SeqCst) {
            anyhow::bail!("audit store unavailable");
        }
        let audits = self.audits.read().await;
        let n = audits
            .iter()
            .filter(|a| a.api_token_id.as_deref() == Some(api_token_id))
            .filter(|a| endpoint.is_empty() || a.endpoint == endpoint)
            .filter(|a| a.created_at >= since)
            .count();
        Ok(n as i64)
    }
}

#[async_trait]
impl AppSettingsRepo for MemoryStore {
    async fn get_app_settings(&self, kb_id: &str) -> anyhow::Result<Option<AppSettings>> {
        Ok(self.apps.get(kb_id).map(|s| s.value().clone()))
    }

    async fn put_app_settings(&self, kb_id: &str, settings: &AppSettings) -> anyhow::Result<()> {
        self.apps.insert(kb_id.to_string(), settings.clone());
        Ok(())
    }
}
