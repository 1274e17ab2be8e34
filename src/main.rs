use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wiki_gateway::cache::TieredCache;
use wiki_gateway::cli::{self, AppCommands, Commands, TokenCommands};
use wiki_gateway::config::{self, Config};
use wiki_gateway::models::app::AppSettings;
use wiki_gateway::models::token::{AuthContext, CreateApiTokenRequest, UpdateApiTokenRequest};
use wiki_gateway::proxy::upstream::RemoteChatEngine;
use wiki_gateway::store::memory::MemoryStore;
use wiki_gateway::store::postgres::PgStore;
use wiki_gateway::store::token_store::TokenStore;
use wiki_gateway::store::AppSettingsRepo;
use wiki_gateway::{jobs, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::load()?;
    init_tracing(&cfg)?;

    let args = cli::Cli::parse();

    let result = match args.command {
        Some(Commands::Serve { port, in_memory }) => {
            let port = port.unwrap_or(cfg.port);
            run_server(cfg, port, in_memory).await
        }
        Some(Commands::Migrate) => {
            let db = PgStore::connect(&cfg.database_url).await?;
            db.migrate().await?;
            println!("Migrations applied.");
            Ok(())
        }
        Some(Commands::Token { command }) => {
            let db = PgStore::connect(&cfg.database_url).await?;
            let cache = connect_cache(&cfg).await?;
            let tokens = TokenStore::new(Arc::new(db), cache, cfg.token_cache_ttl_secs);
            handle_token_command(command, &tokens).await
        }
        Some(Commands::App { command }) => {
            let db = PgStore::connect(&cfg.database_url).await?;
            handle_app_command(command, &db).await
        }
        None => {
            let port = cfg.port;
            run_server(cfg, port, false).await
        }
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

fn init_tracing(cfg: &Config) -> anyhow::Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    // OTLP export only when a collector is configured.
    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "wiki-gateway"),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)?;
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "wiki_gateway=debug,tower_http=debug".into()),
    );

    let (json_layer, text_layer) = if cfg.log_json {
        (Some(tracing_subscriber::fmt::layer().json()), None)
    } else {
        (None, Some(tracing_subscriber::fmt::layer()))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(telemetry_layer)
        .init();
    Ok(())
}

async fn connect_cache(cfg: &Config) -> anyhow::Result<TieredCache> {
    match &cfg.redis_url {
        Some(url) => {
            tracing::info!("Connecting to Redis...");
            let redis_client = redis::Client::open(url.as_str())?;
            let redis_conn = redis::aio::ConnectionManager::new(redis_client).await?;
            Ok(TieredCache::new(redis_conn))
        }
        None => {
            tracing::warn!("REDIS_URL not set; token cache is process-local");
            Ok(TieredCache::local_only())
        }
    }
}

async fn run_server(cfg: Config, port: u16, in_memory: bool) -> anyhow::Result<()> {
    let cache = connect_cache(&cfg).await?;
    let chat = Arc::new(RemoteChatEngine::new(&cfg.chat_engine_url)?);

    let state = if in_memory {
        tracing::warn!("Running with in-memory storage; data is lost on exit");
        let store = Arc::new(MemoryStore::new());
        AppState::new(cfg, cache.clone(), store.clone(), store.clone(), store, chat)
    } else {
        tracing::info!("Connecting to database...");
        let db = PgStore::connect(&cfg.database_url).await?;

        tracing::info!("Running migrations...");
        db.migrate().await?;

        let db = Arc::new(db);
        AppState::new(cfg, cache.clone(), db.clone(), db.clone(), db, chat)
    };

    let app = wiki_gateway::router(Arc::new(state));

    jobs::cache_sweep::spawn(cache);
    tracing::info!("Background cache sweep started (every 60s)");

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("wiki gateway listening on {}", addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

async fn handle_token_command(cmd: TokenCommands, tokens: &TokenStore) -> anyhow::Result<()> {
    match cmd {
        TokenCommands::Create {
            kb_id,
            name,
            permission,
            rate_limit,
            daily_quota,
            user_id,
        } => {
            let ctx = AuthContext::admin(user_id);
            let token = tokens
                .create(
                    &ctx,
                    CreateApiTokenRequest {
                        kb_id,
                        name,
                        permission,
                        rate_limit_per_minute: rate_limit,
                        daily_quota,
                    },
                )
                .await?;
            println!(
                "Token created:\n  ID:    {}\n  Name:  {}\n  Use:   Authorization: Bearer {}",
                token.id, token.name, token.token
            );
        }
        TokenCommands::List { kb_id, user_id } => {
            let ctx = AuthContext::admin(user_id);
            let list = tokens.list(&ctx, &kb_id).await?;
            if list.is_empty() {
                println!("No tokens found.");
            } else {
                println!(
                    "{:<38} {:<20} {:<14} {:>8} {:>10}",
                    "ID", "NAME", "PERMISSION", "RPM", "DAILY"
                );
                for t in list {
                    println!(
                        "{:<38} {:<20} {:<14} {:>8} {:>10}",
                        t.id, t.name, t.permission, t.rate_limit_per_minute, t.daily_quota
                    );
                }
            }
        }
        TokenCommands::Update {
            id,
            kb_id,
            user_id,
            name,
            permission,
            rate_limit,
            daily_quota,
        } => {
            let ctx = AuthContext::admin(user_id);
            let token = tokens
                .update(
                    &ctx,
                    UpdateApiTokenRequest {
                        id,
                        kb_id,
                        name,
                        permission,
                        rate_limit_per_minute: rate_limit,
                        daily_quota,
                    },
                )
                .await?;
            println!(
                "Token {} updated: permission={} rpm={} daily={}",
                token.id, token.permission, token.rate_limit_per_minute, token.daily_quota
            );
        }
        TokenCommands::Delete { id, kb_id, user_id } => {
            let ctx = AuthContext::admin(user_id);
            tokens.delete(&ctx, &id, &kb_id).await?;
            println!("Token deleted.");
        }
    }
    Ok(())
}

async fn handle_app_command(cmd: AppCommands, apps: &dyn AppSettingsRepo) -> anyhow::Result<()> {
    match cmd {
        AppCommands::Openai {
            kb_id,
            enabled,
            secret_key,
        } => {
            apps.put_app_settings(&kb_id, &AppSettings::openai_api(enabled, secret_key))
                .await?;
            println!(
                "OpenAI API app of {} is now {}.",
                kb_id,
                if enabled { "enabled" } else { "disabled" }
            );
        }
    }
    Ok(())
}
