use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    /// Shared Redis token cache. `None` keeps the cache process-local
    /// (single instance or development).
    pub redis_url: Option<String>,
    /// Key for the token management API. Unset disables the admin path.
    pub admin_key: Option<String>,
    /// Base URL of the chat engine that answers questions.
    pub chat_engine_url: String,
    /// TTL for cached token lookups, in seconds. Default: 1800 (30 min).
    pub token_cache_ttl_secs: u64,
    /// Emit logs as JSON lines.
    pub log_json: bool,
}

impl Config {
    pub fn admin_key(&self) -> Option<&str> {
        self.admin_key.as_deref().filter(|k| !k.is_empty())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8000,
            database_url: "postgres://localhost/wiki".into(),
            redis_url: None,
            admin_key: None,
            chat_engine_url: "http://127.0.0.1:8001".into(),
            token_cache_ttl_secs: 30 * 60,
            log_json: false,
        }
    }
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let defaults = Config::default();
    let admin_key = std::env::var("WIKIGATE_ADMIN_KEY")
        .ok()
        .filter(|k| !k.trim().is_empty());

    if admin_key.is_none() {
        let env_mode = std::env::var("WIKIGATE_ENV")
            .or_else(|_| std::env::var("RUST_ENV"))
            .unwrap_or_default();
        if env_mode == "production" {
            anyhow::bail!(
                "WIKIGATE_ADMIN_KEY is not set. \
                 Set an admin key before running in production."
            );
        }
        eprintln!("⚠️  WIKIGATE_ADMIN_KEY is not set; admin access to the token API is disabled.");
    }

    Ok(Config {
        port: std::env::var("WIKIGATE_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.port),
        database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
        redis_url: std::env::var("REDIS_URL")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty()),
        admin_key,
        chat_engine_url: std::env::var("WIKIGATE_CHAT_ENGINE_URL")
            .unwrap_or(defaults.chat_engine_url),
        token_cache_ttl_secs: std::env::var("WIKIGATE_TOKEN_CACHE_TTL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.token_cache_ttl_secs),
        log_json: std::env::var("WIKIGATE_LOG_JSON")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false),
    })
}
