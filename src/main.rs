use std::sync::Arc;

use clap::Parser;

use callcore::config::Config;
use callcore::control_api::{build_router, AppState};
use callcore::events::{Component, EventEmitter, EventStore};
use callcore::session::SessionRegistry;
use callcore::telephony::HttpRoomService;
use callcore::webhook::WebhookIngester;

/// Control and observability core for a telephone voice-agent platform.
#[derive(Parser, Debug)]
struct Cli {
    /// Override the address the control HTTP surface binds to.
    #[arg(long)]
    bind_address: Option<String>,

    /// Override the diagnostic log filter (defaults to `RUST_LOG`, then "info").
    #[arg(long)]
    log_filter: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(cli.log_filter.clone().unwrap_or_else(|| {
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string())
        }))
        .init();

    let mut config = Config::from_env()?;
    if let Some(bind_address) = cli.bind_address {
        config.bind_address = bind_address;
    }

    let store = Arc::new(EventStore::new(config.max_events));
    let emitter = EventEmitter::new(Component::ControlPlane, store.clone());
    let sessions = SessionRegistry::new();
    let webhook_ingester = WebhookIngester::new(sessions.clone(), emitter.clone());
    let room_service = Arc::new(HttpRoomService::new(
        config.telephony_url.clone(),
        config.telephony_api_key.clone(),
        config.telephony_api_secret.clone(),
    ));

    let stats_store = store.clone();
    let state = Arc::new(AppState {
        sessions,
        emitter,
        webhook_ingester,
        room_service,
        webhook_secret: config.webhook_secret.clone(),
        event_stats: Box::new(move || stats_store.stats()),
    });

    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    tracing::info!(address = %config.bind_address, "control and observability core listening");
    println!("Endpoints:");
    println!("  GET  /health");
    println!("  POST /webhook");
    println!("  POST /control/call/hangup");
    println!("  GET  /control/sessions");
    println!("  GET  /control/sessions/:session_id");
    println!("  GET  /control/sessions/:session_id/events");

    axum::serve(listener, app).await?;
    Ok(())
}
