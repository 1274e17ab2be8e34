//! Persistence seams.
//!
//! Each trait is implemented by [`postgres::PgStore`] for deployments and by
//! [`memory::MemoryStore`] for tests and local development.

pub mod memory;
pub mod postgres;
pub mod token_store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::app::AppSettings;
use crate::models::audit::NewApiCallAudit;
use crate::models::token::{ApiToken, TokenPatch};

#[async_trait]
pub trait TokenRepo: Send + Sync {
    async fn insert_token(&self, token: &ApiToken) -> anyhow::Result<()>;

    /// Exact match on the secret value.
    async fn get_token_by_secret(&self, secret: &str) -> anyhow::Result<Option<ApiToken>>;

    async fn get_token(&self, id: &str, kb_id: &str, user_id: &str)
        -> anyhow::Result<Option<ApiToken>>;

    /// Newest first.
    async fn list_tokens(&self, kb_id: &str, user_id: &str) -> anyhow::Result<Vec<ApiToken>>;

    /// Returns `false` when no row matched.
    async fn update_token(
        &self,
        id: &str,
        kb_id: &str,
        user_id: &str,
        patch: &TokenPatch,
    ) -> anyhow::Result<bool>;

    async fn delete_token(&self, id: &str, kb_id: &str, user_id: &str) -> anyhow::Result<bool>;
}

#[async_trait]
pub trait AuditRepo: Send + Sync {
    async fn insert_audit(&self, audit: &NewApiCallAudit) -> anyhow::Result<()>;

    /// Calls by `api_token_id` created at or after `since`. An empty
    /// `endpoint` counts across all endpoints.
    async fn count_by_token_since(
        &self,
        api_token_id: &str,
        endpoint: &str,
        since: DateTime<Utc>,
    ) -> anyhow::Result<i64>;
}

#[async_trait]
pub trait AppSettingsRepo: Send + Sync {
    /// OpenAI-API app of a knowledge base, if one was ever configured.
    async fn get_app_settings(&self, kb_id: &str) -> anyhow::Result<Option<AppSettings>>;

    async fn put_app_settings(&self, kb_id: &str, settings: &AppSettings) -> anyhow::Result<()>;
}
