//! Web Chat Relay
//!
//! Serves an OpenAI-compatible chat endpoint backed by a single browser
//! session connected over WebSocket.

use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use chat_relay::config::RelayConfig;
use chat_relay::server::run_server;

// ──────────────────────────────────────────────────────────────────────────────
// MAIN ENTRY POINT
// ──────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("chat_relay=info,tower_http=info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_line_number(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    let config = RelayConfig::from_env().context("Invalid relay configuration")?;

    println!("\n{}", "═".repeat(60));
    println!("🛰️  Web Chat Relay v{}", env!("CARGO_PKG_VERSION"));
    println!("{}", "═".repeat(60));
    println!("API: http://{} | Producer: ws://{}", config.http_addr, config.producer_addr);
    println!(
        "Completion: {} | Debounce: {}ms | Max generation: {}s",
        config.strategy,
        config.debounce.as_millis(),
        config.max_generation.as_secs()
    );
    println!("{}\n", "═".repeat(60));

    run_server(config).await
}
