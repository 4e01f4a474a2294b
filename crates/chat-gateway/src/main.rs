//! Chat Gateway - Entry point.

use chat_gateway::{
    api::{create_router, AppState},
    config::{Config, LogFormat},
    SessionOrchestrator,
};
use credit_ledger::Ledger;
use std::net::SocketAddr;
use std::sync::Arc;
use stream_relay::RelayRegistry;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() {
    // Load configuration
    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    init_logging(&config);

    info!("Starting Chat Gateway");

    // Open the ledger and settle anything a previous run left active
    let ledger = match Ledger::open(&config.ledger).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to open ledger: {}", e);
            std::process::exit(1);
        }
    };

    match ledger.sessions.recover_orphans().await {
        Ok(0) => {}
        Ok(n) => warn!("Recovered {} orphaned sessions", n),
        Err(e) => error!("Failed to recover orphaned sessions: {}", e),
    }

    // Provider clients for every configured family
    let router = match config.providers.build_router() {
        Ok(r) => r,
        Err(e) => {
            error!("Failed to create provider clients: {}", e);
            std::process::exit(1);
        }
    };
    let providers = router.configured_families();

    let relays = match RelayRegistry::new(config.relay.clone()) {
        Ok(r) => r,
        Err(e) => {
            error!("Invalid relay configuration: {}", e);
            std::process::exit(1);
        }
    };

    let orchestrator =
        SessionOrchestrator::new(ledger, Arc::new(router), relays, config.session.clone());
    let app = create_router(AppState::new(orchestrator, providers));

    // Bind to address
    let addr = SocketAddr::new(
        config
            .server
            .listen_addr
            .parse()
            .unwrap_or([0, 0, 0, 0].into()),
        config.server.port,
    );

    info!("Listening on {}", addr);

    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    // Run server
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {}", e);
        std::process::exit(1);
    }

    info!("Chat Gateway stopped");
}

fn init_logging(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level));

    let registry = tracing_subscriber::registry().with(filter);
    match config.log.format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("Shutdown signal received");
}
