//! Cached API token lookups and the token management use cases.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use super::TokenRepo;
use crate::cache::TieredCache;
use crate::errors::AppError;
use crate::models::token::{
    generate_token_value, ApiToken, ApiTokenListItem, AuthContext, CreateApiTokenRequest,
    TokenPatch, UpdateApiTokenRequest,
};

pub fn token_cache_key(secret: &str) -> String {
    format!("api_token:{}", secret)
}

/// Mask a secret for logs: `abcd…wxyz`.
pub fn mask_secret(secret: &str) -> String {
    if secret.len() <= 8 || !secret.is_ascii() {
        return "****".to_string();
    }
    format!("{}…{}", &secret[..4], &secret[secret.len() - 4..])
}

#[derive(Clone)]
pub struct TokenStore {
    repo: Arc<dyn TokenRepo>,
    cache: TieredCache,
    ttl_secs: u64,
}

impl TokenStore {
    pub fn new(repo: Arc<dyn TokenRepo>, cache: TieredCache, ttl_secs: u64) -> Self {
        Self {
            repo,
            cache,
            ttl_secs,
        }
    }

    /// Look a token up by its secret value.
    ///
    /// A token bound to another knowledge base than `kb_filter` resolves to
    /// `None`. An empty `kb_filter` skips the check.
    pub async fn resolve(&self, secret: &str, kb_filter: &str) -> anyhow::Result<Option<ApiToken>> {
        if secret.is_empty() {
            return Ok(None);
        }
        let key = token_cache_key(secret);

        let token = match self.cache.get::<ApiToken>(&key).await {
            Some(t) => Some(t),
            None => {
                let found = self.repo.get_token_by_secret(secret).await?;
                if let Some(t) = &found {
                    if let Err(e) = self.cache.set(&key, t, self.ttl_secs).await {
                        tracing::warn!(
                            token = %mask_secret(secret),
                            error = %e,
                            "failed to cache api token"
                        );
                    }
                }
                found
            }
        };

        Ok(token.filter(|t| kb_filter.is_empty() || t.kb_id.is_empty() || t.kb_id == kb_filter))
    }

    pub async fn create(
        &self,
        ctx: &AuthContext,
        req: CreateApiTokenRequest,
    ) -> Result<ApiTokenListItem, AppError> {
        authorize(ctx, &req.kb_id)?;
        let name = req.name.trim();
        if name.is_empty() {
            return Err(AppError::BadRequest("api token name is required".into()));
        }
        check_limits(Some(req.rate_limit_per_minute), Some(req.daily_quota))?;

        let now = Utc::now();
        let token = ApiToken {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            user_id: ctx.user_id.clone(),
            token: generate_token_value(),
            kb_id: req.kb_id,
            permission: req.permission,
            rate_limit_per_minute: req.rate_limit_per_minute,
            daily_quota: req.daily_quota,
            created_at: now,
            updated_at: now,
        };
        self.repo.insert_token(&token).await?;
        tracing::info!(kb_id = %token.kb_id, token_id = %token.id, "api token created");
        Ok(token.into())
    }

    pub async fn list(
        &self,
        ctx: &AuthContext,
        kb_id: &str,
    ) -> Result<Vec<ApiTokenListItem>, AppError> {
        authorize(ctx, kb_id)?;
        let tokens = self.repo.list_tokens(kb_id, &ctx.user_id).await?;
        Ok(tokens.into_iter().map(ApiTokenListItem::from).collect())
    }

    pub async fn update(
        &self,
        ctx: &AuthContext,
        req: UpdateApiTokenRequest,
    ) -> Result<ApiTokenListItem, AppError> {
        authorize(ctx, &req.kb_id)?;
        if !req.has_updates() {
            return Err(AppError::BadRequest("nothing to update".into()));
        }
        let mut patch = TokenPatch::from(&req);
        if let Some(name) = &patch.name {
            let trimmed = name.trim();
            if trimmed.is_empty() {
                return Err(AppError::BadRequest("api token name is required".into()));
            }
            patch.name = Some(trimmed.to_string());
        }
        check_limits(patch.rate_limit_per_minute, patch.daily_quota)?;

        let existing = self
            .repo
            .get_token(&req.id, &req.kb_id, &ctx.user_id)
            .await?
            .ok_or_else(not_found)?;

        if !self
            .repo
            .update_token(&req.id, &req.kb_id, &ctx.user_id, &patch)
            .await?
        {
            return Err(not_found());
        }
        self.invalidate(&existing.token).await;

        let mut updated = existing;
        patch.apply(&mut updated);
        updated.updated_at = Utc::now();
        tracing::info!(kb_id = %updated.kb_id, token_id = %updated.id, "api token updated");
        Ok(updated.into())
    }

    pub async fn delete(&self, ctx: &AuthContext, id: &str, kb_id: &str) -> Result<(), AppError> {
        authorize(ctx, kb_id)?;
        let existing = self
            .repo
            .get_token(id, kb_id, &ctx.user_id)
            .await?
            .ok_or_else(not_found)?;

        if !self.repo.delete_token(id, kb_id, &ctx.user_id).await? {
            return Err(not_found());
        }
        self.invalidate(&existing.token).await;
        tracing::info!(kb_id = %kb_id, token_id = %id, "api token deleted");
        Ok(())
    }

    async fn invalidate(&self, secret: &str) {
        if let Err(e) = self.cache.delete(&token_cache_key(secret)).await {
            tracing::warn!(token = %mask_secret(secret), error = %e, "failed to invalidate api token cache");
        }
    }
}

fn authorize(ctx: &AuthContext, kb_id: &str) -> Result<(), AppError> {
    if kb_id.trim().is_empty() {
        return Err(AppError::BadRequest("kb_id is required".into()));
    }
    if !ctx.can_manage_tokens(kb_id) {
        return Err(AppError::Forbidden("full control permission required".into()));
    }
    Ok(())
}

fn check_limits(rpm: Option<i32>, quota: Option<i32>) -> Result<(), AppError> {
    if rpm.is_some_and(|v| v < 0) {
        return Err(AppError::BadRequest("rate_limit_per_minute must be >= 0".into()));
    }
    if quota.is_some_and(|v| v < 0) {
        return Err(AppError::BadRequest("daily_quota must be >= 0".into()));
    }
    Ok(())
}

fn not_found() -> AppError {
    AppError::NotFound("api token not found".into())
}
