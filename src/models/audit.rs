use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One row per gateway invocation. Never updated once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiCallAudit {
    pub id: i64,
    pub kb_id: String,
    /// `None` when the caller used the knowledge base's own app secret.
    pub api_token_id: Option<String>,
    pub endpoint: String,
    pub model: String,
    pub status_code: i32,
    /// Empty on success.
    pub error_type: String,
    pub error_message: String,
    pub prompt_tokens: i32,
    pub completion_tokens: i32,
    pub total_tokens: i32,
    pub latency_ms: i64,
    pub remote_ip: String,
    pub request_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewApiCallAudit {
    pub kb_id: String,
    pub api_token_id: Option<String>,
    pub endpoint: String,
    pub model: String,
    pub status_code: i32,
    pub error_type: String,
    pub error_message: String,
    pub prompt_tokens: i32,
    pub completion_tokens: i32,
    pub total_tokens: i32,
    pub latency_ms: i64,
    pub remote_ip: String,
    pub request_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NewApiCallAudit {
    pub fn is_success(&self) -> bool {
        self.error_type.is_empty()
    }
}
