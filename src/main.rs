//! # Book Tutor CLI (`tutor`)
//!
//! ## Usage
//!
//! ```bash
//! tutor --config ./config/tutor.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `tutor init` | Create the SQLite database and tables |
//! | `tutor serve` | Start the HTTP API |
//! | `tutor ask "<query>"` | Ask the book assistant from the terminal |
//! | `tutor chapters` | Print the chapter catalog |
//! | `tutor cache purge` | Delete expired cached content |
//!
//! API keys are read from the environment; a `.env` file in the working
//! directory is loaded first if present.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use book_tutor::agent::{self, AgentRequest};
use book_tutor::book::Catalog;
use book_tutor::config::{self, Config};
use book_tutor::context::AppContext;
use book_tutor::rag::{self, RagRequest};
use book_tutor::{cache, db, migrate, profile, server};

/// Book Tutor: an AI study assistant for an educational book.
#[derive(Parser)]
#[command(name = "tutor", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/tutor.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and tables. Safe to run repeatedly.
    Init,

    /// Start the HTTP API on `[server].bind`.
    Serve,

    /// Ask the book assistant a question.
    Ask {
        query: String,

        /// Focus on one chapter (e.g. `chapter-4`).
        #[arg(long)]
        chapter: Option<String>,

        /// Use single-shot retrieval with citations instead of the agent.
        #[arg(long)]
        legacy: bool,

        /// Personalize using this user's stored profile.
        #[arg(long)]
        user: Option<String>,
    },

    /// List the chapter catalog.
    Chapters,

    /// Manage the content cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Delete expired entries.
    Purge,
}

/// Logs go to stderr; `TUTOR_LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let log_format = std::env::var("TUTOR_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if log_format.eq_ignore_ascii_case("json") {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_line_number(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

async fn run_init(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;
    pool.close().await;
    println!("Database initialized at {}", config.db.path.display());
    Ok(())
}

async fn run_ask(
    config: Config,
    query: String,
    chapter: Option<String>,
    legacy: bool,
    user: Option<String>,
) -> Result<()> {
    let ctx = AppContext::from_config(config).await?;
    let profile = match user.as_deref() {
        Some(id) => profile::get_profile(&ctx.pool, id).await?,
        None => None,
    };

    if legacy {
        let answer = rag::query(
            &ctx,
            RagRequest {
                query,
                selected_text: None,
                chapter_id: chapter,
                profile,
                top_k: None,
            },
        )
        .await?;
        println!("{}", answer.answer);
        if !answer.citations.is_empty() {
            println!("\nSources:");
            for c in &answer.citations {
                println!("  [{}] {} ({}, score {:.2})", c.id, c.source, c.chapter, c.score);
            }
        }
    } else {
        let answer = agent::run(
            &ctx,
            AgentRequest {
                query,
                selected_text: None,
                chapter_id: chapter,
                profile,
                history: Vec::new(),
            },
        )
        .await?;
        println!("{}", answer.answer);
        if !answer.tool_calls.is_empty() {
            let tools: Vec<String> = answer
                .tool_calls
                .iter()
                .map(|t| format!("{} ({})", t.tool, t.status.as_str()))
                .collect();
            println!("\nTools: {}", tools.join(", "));
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => run_init(&cfg).await?,
        Commands::Serve => {
            let ctx = AppContext::from_config(cfg).await?;
            server::run_server(ctx).await?;
        }
        Commands::Ask {
            query,
            chapter,
            legacy,
            user,
        } => run_ask(cfg, query, chapter, legacy, user).await?,
        Commands::Chapters => {
            print!("{}", Catalog::from_config(&cfg.book).render_list());
        }
        Commands::Cache {
            action: CacheAction::Purge,
        } => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            let removed = cache::purge_expired(&pool).await?;
            pool.close().await;
            println!("Removed {} expired cache entries", removed);
        }
    }

    Ok(())
}
