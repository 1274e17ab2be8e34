use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::{AppSettingsRepo, AuditRepo, TokenRepo};
use crate::models::app::AppSettings;
use crate::models::audit::NewApiCallAudit;
use crate::models::token::{ApiToken, TokenPatch};

const TOKEN_COLUMNS: &str = "id, name, user_id, token, kb_id, permission, \
     rate_limit_per_minute, daily_quota, created_at, updated_at";

/// `app_type` of the OpenAI-compatible API app in `kb_app_settings`.
const OPENAI_API_APP_TYPE: i16 = 4;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl TokenRepo for PgStore {
    async fn insert_token(&self, token: &ApiToken) -> anyhow::Result<()> {
        sqlx::query(
            r#"INSERT INTO api_tokens (id, name, user_id, token, kb_id, permission, rate_limit_per_minute, daily_quota, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"#,
        )
        .bind(&token.id)
        .bind(&token.name)
        .bind(&token.user_id)
        .bind(&token.token)
        .bind(&token.kb_id)
        .bind(token.permission.as_str())
        .bind(token.rate_limit_per_minute)
        .bind(token.daily_quota)
        .bind(token.created_at)
        .bind(token.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_token_by_secret(&self, secret: &str) -> anyhow::Result<Option<ApiToken>> {
        let row = sqlx::query_as::<_, ApiTokenRow>(&format!(
            "SELECT {} FROM api_tokens WHERE token = $1",
            TOKEN_COLUMNS
        ))
        .bind(secret)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ApiToken::try_from).transpose()
    }

    async fn get_token(
        &self,
        id: &str,
        kb_id: &str,
        user_id: &str,
    ) -> anyhow::Result<Option<ApiToken>> {
        let row = sqlx::query_as::<_, ApiTokenRow>(&format!(
            "SELECT {} FROM api_tokens WHERE id = $1 AND kb_id = $2 AND user_id = $3",
            TOKEN_COLUMNS
        ))
        .bind(id)
        .bind(kb_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ApiToken::try_from).transpose()
    }

    async fn list_tokens(&self, kb_id: &str, user_id: &str) -> anyhow::Result<Vec<ApiToken>> {
        let rows = sqlx::query_as::<_, ApiTokenRow>(&format!(
            "SELECT {} FROM api_tokens WHERE kb_id = $1 AND user_id = $2 ORDER BY created_at DESC",
            TOKEN_COLUMNS
        ))
        .bind(kb_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ApiToken::try_from).collect()
    }

    async fn update_token(
        &self,
        id: &str,
        kb_id: &str,
        user_id: &str,
        patch: &TokenPatch,
    ) -> anyhow::Result<bool> {
        // COALESCE keeps columns whose patch field is NULL.
        let result = sqlx::query(
            r#"UPDATE api_tokens SET
                 name = COALESCE($4, name),
                 permission = COALESCE($5, permission),
                 rate_limit_per_minute = COALESCE($6, rate_limit_per_minute),
                 daily_quota = COALESCE($7, daily_quota),
                 updated_at = NOW()
               WHERE id = $1 AND kb_id = $2 AND user_id = $3"#,
        )
        .bind(id)
        .bind(kb_id)
        .bind(user_id)
        .bind(patch.name.as_deref())
        .bind(patch.permission.map(|p| p.as_str()))
        .bind(patch.rate_limit_per_minute)
        .bind(patch.daily_quota)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_token(&self, id: &str, kb_id: &str, user_id: &str) -> anyhow::Result<bool> {
        let result =
            sqlx::query("DELETE FROM api_tokens WHERE id = $1 AND kb_id = $2 AND user_id = $3")
                .bind(id)
                .bind(kb_id)
                .bind(user_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl AuditRepo for PgStore {
    async fn insert_audit(&self, audit: &NewApiCallAudit) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO api_call_audits (
                kb_id, api_token_id, endpoint, model, status_code, error_type, error_message,
                prompt_tokens, completion_tokens, total_tokens, latency_ms, remote_ip,
                request_id, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(&audit.kb_id)
        .bind(&audit.api_token_id)
        .bind(&audit.endpoint)
        .bind(&audit.model)
        .bind(audit.status_code)
        .bind(&audit.error_type)
        .bind(&audit.error_message)
        .bind(audit.prompt_tokens)
        .bind(audit.completion_tokens)
        .bind(audit.total_tokens)
        .bind(audit.latency_ms)
        .bind(&audit.remote_ip)
        .bind(&audit.request_id)
        .bind(audit.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_by_token_since(
        &self,
        api_token_id: &str,
        endpoint: &str,
        since: DateTime<Utc>,
    ) -> anyhow::Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"SELECT COUNT(*) FROM api_call_audits
               WHERE api_token_id = $1 AND created_at >= $2
                 AND ($3 = '' OR endpoint = $3)"#,
        )
        .bind(api_token_id)
        .bind(since)
        .bind(endpoint)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

#[async_trait]
impl AppSettingsRepo for PgStore {
    async fn get_app_settings(&self, kb_id: &str) -> anyhow::Result<Option<AppSettings>> {
        let settings = sqlx::query_scalar::<_, serde_json::Value>(
            "SELECT settings FROM kb_app_settings WHERE kb_id = $1 AND app_type = $2",
        )
        .bind(kb_id)
        .bind(OPENAI_API_APP_TYPE)
        .fetch_optional(&self.pool)
        .await?;
        settings
            .map(|v| serde_json::from_value(v).map_err(anyhow::Error::from))
            .transpose()
    }

    async fn put_app_settings(&self, kb_id: &str, settings: &AppSettings) -> anyhow::Result<()> {
        sqlx::query(
            r#"INSERT INTO kb_app_settings (kb_id, app_type, settings)
               VALUES ($1, $2, $3)
               ON CONFLICT (kb_id, app_type)
               DO UPDATE SET settings = EXCLUDED.settings, updated_at = NOW()"#,
        )
        .bind(kb_id)
        .bind(OPENAI_API_APP_TYPE)
        .bind(serde_json::to_value(settings)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct ApiTokenRow {
    pub id: String,
    pub name: String,
    pub user_id: String,
    pub token: String,
    pub kb_id: String,
    pub permission: String,
    pub rate_limit_per_minute: i32,
    pub daily_quota: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<ApiTokenRow> for ApiToken {
    type Error = anyhow::Error;

    fn try_from(row: ApiTokenRow) -> Result<Self, Self::Error> {
        Ok(ApiToken {
            permission: row.permission.parse()?,
            id: row.id,
            name: row.name,
            user_id: row.user_id,
            token: row.token,
            kb_id: row.kb_id,
            rate_limit_per_minute: row.rate_limit_per_minute,
            daily_quota: row.daily_quota,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
