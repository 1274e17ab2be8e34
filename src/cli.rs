use clap::{Parser, Subcommand};

use crate::models::token::Permission;

/// wikigate: API token governance and OpenAI-compatible chat gateway for the wiki
#[derive(Parser)]
#[command(name = "wikigate", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the gateway server
    Serve {
        /// Port to bind (default: WIKIGATE_PORT or 8000)
        #[arg(short, long)]
        port: Option<u16>,
        /// Keep tokens, audits and app settings in process memory
        #[arg(long)]
        in_memory: bool,
    },

    /// Apply pending database migrations and exit
    Migrate,

    /// Manage API tokens
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },

    /// Manage knowledge base apps
    App {
        #[command(subcommand)]
        command: AppCommands,
    },
}

#[derive(Subcommand)]
pub enum TokenCommands {
    /// Create a new API token
    Create {
        #[arg(long)]
        kb_id: String,
        #[arg(long)]
        name: String,
        #[arg(long, value_parser = parse_permission, default_value = "data_operate")]
        permission: Permission,
        /// Calls per minute, 0 = unlimited
        #[arg(long, default_value_t = 0)]
        rate_limit: i32,
        /// Calls per calendar day, 0 = unlimited
        #[arg(long, default_value_t = 0)]
        daily_quota: i32,
        /// Owner of the token
        #[arg(long)]
        user_id: String,
    },
    /// List a user's tokens on a knowledge base
    List {
        #[arg(long)]
        kb_id: String,
        #[arg(long)]
        user_id: String,
    },
    /// Change name, permission or limits of a token
    Update {
        id: String,
        #[arg(long)]
        kb_id: String,
        #[arg(long)]
        user_id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, value_parser = parse_permission)]
        permission: Option<Permission>,
        #[arg(long)]
        rate_limit: Option<i32>,
        #[arg(long)]
        daily_quota: Option<i32>,
    },
    /// Delete a token
    Delete {
        id: String,
        #[arg(long)]
        kb_id: String,
        #[arg(long)]
        user_id: String,
    },
}

#[derive(Subcommand)]
pub enum AppCommands {
    /// Configure the OpenAI-compatible API app of a knowledge base
    Openai {
        #[arg(long)]
        kb_id: String,
        /// Enable (true) or disable (false) the endpoint
        #[arg(long, action = clap::ArgAction::Set)]
        enabled: bool,
        /// Shared app secret; leave unset to accept API tokens only
        #[arg(long, default_value = "")]
        secret_key: String,
    },
}

fn parse_permission(s: &str) -> Result<Permission, String> {
    s.parse().map_err(|e: anyhow::Error| e.to_string())
}
