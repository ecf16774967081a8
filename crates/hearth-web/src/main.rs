//! Hearth server: streamed agent turns with mid-turn questions.
//!
//! # Usage
//!
//! ```bash
//! OPENROUTER_KEY=sk-... cargo run -p hearth-web
//! OPENROUTER_KEY=sk-... cargo run -p hearth-web -- --model google/gemini-2.5-flash --tier pro
//! OPENROUTER_KEY=sk-... cargo run -p hearth-web -- --port 8080 --keepalive-secs 10
//! ```
//!
//! Start a turn:
//!
//! ```bash
//! curl -N -X POST localhost:3001/threads/t1/turns -H 'content-type: application/json' \
//!     -d '{"message": "Book me a room for Friday"}'
//! ```
//!
//! When a `question_group` line arrives, answer it from another shell:
//!
//! ```bash
//! curl -X POST localhost:3001/ask-user/<group_id>/respond -H 'content-type: application/json' \
//!     -d '{"responses": {"q1": "yes"}}'
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use hearth_rs::prelude::*;
use hearth_web::{AppState, WebConfig, spawn_web};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Streaming agent server with suspendable turns.
#[derive(Parser)]
#[command(about = "Streaming agent server with suspendable turns")]
struct Args {
    /// LLM model to use.
    #[arg(long, default_value = "anthropic/claude-sonnet-4")]
    model: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 3001)]
    port: u16,

    /// Seconds of silence before a keepalive line is written.
    #[arg(long, default_value_t = 20)]
    keepalive_secs: u64,

    /// Context policy tier for new threads (free, standard, pro).
    #[arg(long, default_value = "standard")]
    tier: PolicyTier,

    /// Unanswered question groups older than this are dropped.
    #[arg(long, default_value_t = 3600)]
    question_ttl_secs: u64,

    /// Maximum model calls per turn.
    #[arg(long, default_value_t = 10)]
    max_rounds: u32,
}

#[tokio::main]
async fn main() -> Result<(), String> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let api_key = std::env::var("OPENROUTER_KEY")
        .map_err(|_| "Set OPENROUTER_KEY env var to your OpenRouter API key")?;
    let provider: Arc<dyn LlmProvider> =
        Arc::new(OpenRouterProvider::new(api_key).map_err(|e| e.to_string())?);

    let store: Arc<dyn ItemStore> = Arc::new(InMemoryItemStore::new());
    let factory = SessionFactory::new(store).with_summarizer_provider(provider.clone());

    let suspensions = SuspensionStore::new();
    let ttl = Duration::from_secs(args.question_ttl_secs.max(1));
    let _sweeper = suspensions.spawn_sweeper((ttl / 4).max(Duration::from_secs(1)), ttl);

    let tools = ToolSet::new().with(AskUserTool::new(suspensions.clone()).with_timeout(ttl));
    let runner = TurnRunner::new(
        provider,
        tools,
        TurnConfig::new()
            .with_model(&args.model)
            .with_max_rounds(args.max_rounds),
    );

    let keepalive =
        KeepaliveConfig::default().with_interval(Duration::from_secs(args.keepalive_secs.max(1)));
    let state = AppState::new(runner, factory, suspensions)
        .with_keepalive(keepalive)
        .with_tier(args.tier.clone());

    let config = WebConfig {
        bind_addr: ([127, 0, 0, 1], args.port).into(),
    };
    let addr = spawn_web(state, config).await.map_err(|e| e.to_string())?;
    info!(model = %args.model, tier = ?args.tier, "Serving on http://{addr}");

    tokio::signal::ctrl_c().await.map_err(|e| e.to_string())?;
    info!("Shutting down");
    Ok(())
}
