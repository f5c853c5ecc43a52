//! Scrapefleet orchestrator binary.
//!
//! Runs the worker transport, the matching loop, the heartbeat sweeper,
//! and the HTTP admin API.

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use scrapefleet_orchestrator::{
    api, Dispatcher, MemorySink, OrchestratorConfig, OrchestratorError, ProxyPicker, RetryPolicy,
    TaskStore, TransportServer, WorkerRegistry,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialise tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("scrapefleet_orchestrator=info".parse()?),
        )
        .init();

    info!("Scrapefleet orchestrator starting");

    // Load configuration
    let config: OrchestratorConfig = Figment::new()
        .merge(Toml::file("orchestrator.toml"))
        .merge(Env::prefixed("FLEET_").split("_"))
        .extract()
        .map_err(|e| OrchestratorError::Config(e.to_string()))?;

    info!(
        transport_addr = %config.transport.listen_addr,
        api_addr = %config.api.listen_addr,
        "Configuration loaded"
    );

    // Core components
    let registry = Arc::new(WorkerRegistry::new());
    let store = Arc::new(TaskStore::new());
    let sink = Arc::new(MemorySink::new());
    info!("Worker registry and task store initialised");

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        sink,
        RetryPolicy::new(config.retry.clone()),
        config.dispatch.clone(),
        ProxyPicker::new(config.proxies.clone()),
    ));
    info!(
        proxies = config.proxies.len(),
        max_attempts = config.retry.max_attempts,
        "Dispatcher initialised"
    );

    let cancel = CancellationToken::new();

    // Matching loop
    tokio::spawn(Arc::clone(&dispatcher).run(cancel.child_token()));

    // Heartbeat sweeper
    tokio::spawn(Arc::clone(&dispatcher).run_sweeper(
        config.health.sweep_interval,
        config.health.heartbeat_timeout,
        cancel.child_token(),
    ));

    // Worker transport
    let transport = Arc::new(TransportServer::new(
        Arc::clone(&registry),
        Arc::clone(&dispatcher),
        config.health.heartbeat_interval,
    ));
    let transport_listener = TcpListener::bind(config.transport.listen_addr).await?;
    tokio::spawn(transport.run(transport_listener, cancel.child_token()));

    // Admin API
    let state = Arc::new(api::AppState { registry, store });
    let app = api::router(state);
    let api_listener = TcpListener::bind(config.api.listen_addr).await?;
    info!(addr = %config.api.listen_addr, "Admin API listening");

    axum::serve(api_listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    cancel.cancel();

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install shutdown signal handler");
    }
}
