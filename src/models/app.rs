use serde::{Deserialize, Serialize};

/// Per-knowledge-base application settings, decoded once at the storage edge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default)]
    pub openai_api_bot_settings: OpenAiApiBotSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpenAiApiBotSettings {
    #[serde(default)]
    pub is_enabled: bool,
    /// Shared app secret. Empty means only API tokens can authorize.
    #[serde(default)]
    pub secret_key: String,
}

impl AppSettings {
    pub fn openai_api(is_enabled: bool, secret_key: impl Into<String>) -> Self {
        Self {
            openai_api_bot_settings: OpenAiApiBotSettings {
                is_enabled,
                secret_key: secret_key.into(),
            },
        }
    }
}
