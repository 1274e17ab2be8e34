use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Scope a token (or a user) holds on a knowledge base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    FullControl,
    DocManage,
    DataOperate,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::FullControl => "full_control",
            Permission::DocManage => "doc_manage",
            Permission::DataOperate => "data_operate",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full_control" => Ok(Permission::FullControl),
            "doc_manage" => Ok(Permission::DocManage),
            "data_operate" => Ok(Permission::DataOperate),
            other => anyhow::bail!("unknown permission: {}", other),
        }
    }
}

/// A caller credential bound to one knowledge base.
///
/// `token` is the opaque secret presented as `Authorization: Bearer <token>`.
/// Limits of 0 mean unlimited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiToken {
    pub id: String,
    pub name: String,
    pub user_id: String,
    pub token: String,
    pub kb_id: String,
    pub permission: Permission,
    pub rate_limit_per_minute: i32,
    pub daily_quota: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What the management API returns for a token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiTokenListItem {
    pub id: String,
    pub name: String,
    pub token: String,
    pub permission: Permission,
    pub rate_limit_per_minute: i32,
    pub daily_quota: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ApiToken> for ApiTokenListItem {
    fn from(t: ApiToken) -> Self {
        Self {
            id: t.id,
            name: t.name,
            token: t.token,
            permission: t.permission,
            rate_limit_per_minute: t.rate_limit_per_minute,
            daily_quota: t.daily_quota,
            created_at: t.created_at,
            updated_at: t.updated_at,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateApiTokenRequest {
    pub kb_id: String,
    pub name: String,
    pub permission: Permission,
    #[serde(default)]
    pub rate_limit_per_minute: i32,
    #[serde(default)]
    pub daily_quota: i32,
}

/// Partial update: only supplied fields change.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateApiTokenRequest {
    pub id: String,
    pub kb_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub permission: Option<Permission>,
    #[serde(default)]
    pub rate_limit_per_minute: Option<i32>,
    #[serde(default)]
    pub daily_quota: Option<i32>,
}

impl UpdateApiTokenRequest {
    pub fn has_updates(&self) -> bool {
        self.name.is_some()
            || self.permission.is_some()
            || self.rate_limit_per_minute.is_some()
            || self.daily_quota.is_some()
    }
}

/// Field mask applied by the repositories.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenPatch {
    pub name: Option<String>,
    pub permission: Option<Permission>,
    pub rate_limit_per_minute: Option<i32>,
    pub daily_quota: Option<i32>,
}

impl TokenPatch {
    pub fn apply(&self, token: &mut ApiToken) {
        if let Some(name) = &self.name {
            token.name = name.clone();
        }
        if let Some(permission) = self.permission {
            token.permission = permission;
        }
        if let Some(rpm) = self.rate_limit_per_minute {
            token.rate_limit_per_minute = rpm;
        }
        if let Some(quota) = self.daily_quota {
            token.daily_quota = quota;
        }
    }
}

impl From<&UpdateApiTokenRequest> for TokenPatch {
    fn from(req: &UpdateApiTokenRequest) -> Self {
        Self {
            name: req.name.clone(),
            permission: req.permission,
            rate_limit_per_minute: req.rate_limit_per_minute,
            daily_quota: req.daily_quota,
        }
    }
}

/// 32 bytes from the OS CSPRNG, hex-encoded (64 chars).
pub fn generate_token_value() -> String {
    let mut random_bytes = [0u8; 32];
    OsRng.fill_bytes(&mut random_bytes);
    hex::encode(random_bytes)
}

/// Identity of the caller of a management operation. Built once per request
/// and passed explicitly to everything that authorizes.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthContext {
    pub is_token: bool,
    pub permission: Permission,
    pub user_id: String,
    /// Knowledge base the credential is bound to. Empty for admin callers.
    pub kb_id: String,
}

impl AuthContext {
    pub fn admin(user_id: impl Into<String>) -> Self {
        Self {
            is_token: false,
            permission: Permission::FullControl,
            user_id: user_id.into(),
            kb_id: String::new(),
        }
    }

    pub fn from_token(token: &ApiToken) -> Self {
        Self {
            is_token: true,
            permission: token.permission,
            user_id: token.user_id.clone(),
            kb_id: token.kb_id.clone(),
        }
    }

    /// Token callers may only act on their own knowledge base, and only with
    /// full control.
    pub fn can_manage_tokens(&self, kb_id: &str) -> bool {
        if !self.is_token {
            return self.permission == Permission::FullControl;
        }
        self.kb_id == kb_id && self.permission == Permission::FullControl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(permission: Permission) -> ApiToken {
        ApiToken {
            id: "tok-1".into(),
            name: "ci".into(),
            user_id: "u1".into(),
            token: generate_token_value(),
            kb_id: "kb-1".into(),
            permission,
            rate_limit_per_minute: 0,
            daily_quota: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_generated_token_is_64_hex_chars() {
        let value = generate_token_value();
        assert_eq!(value.len(), 64);
        assert!(value.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(value, generate_token_value());
    }

    #[test]
    fn test_has_updates() {
        let mut req = UpdateApiTokenRequest {
            id: "t".into(),
            kb_id: "kb".into(),
            ..Default::default()
        };
        assert!(!req.has_updates());
        req.daily_quota = Some(0);
        assert!(req.has_updates());
    }

    #[test]
    fn test_patch_applies_only_supplied_fields() {
        let mut t = token(Permission::DocManage);
        let patch = TokenPatch {
            rate_limit_per_minute: Some(5),
            ..Default::default()
        };
        patch.apply(&mut t);
        assert_eq!(t.rate_limit_per_minute, 5);
        assert_eq!(t.permission, Permission::DocManage);
        assert_eq!(t.name, "ci");
    }

    #[test]
    fn test_permission_parse() {
        assert_eq!("doc_manage".parse::<Permission>().unwrap(), Permission::DocManage);
        assert!("owner".parse::<Permission>().is_err());
        let json = serde_json::to_string(&Permission::FullControl).unwrap();
        assert_eq!(json, r#""full_control""#);
    }

    #[test]
    fn test_token_context_is_scoped_to_its_kb() {
        let ctx = AuthContext::from_token(&token(Permission::FullControl));
        assert!(ctx.can_manage_tokens("kb-1"));
        assert!(!ctx.can_manage_tokens("kb-2"));

        let ctx = AuthContext::from_token(&token(Permission::DataOperate));
        assert!(!ctx.can_manage_tokens("kb-1"));

        assert!(AuthContext::admin("u1").can_manage_tokens("any"));
    }
}
