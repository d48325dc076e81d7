mod config;
mod error;
mod forwarder;
mod ipam;
mod mesh;
mod node_client;
mod orchestrator;
mod ports;
mod routes;
mod scheduler;
mod servers;
mod state;
mod store;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::config::Settings;
use crate::forwarder::PortForwarder;
use crate::node_client::NodeClient;
use crate::servers::PanelServers;
use crate::state::AppState;
use crate::store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let settings = Settings::from_env();
    info!(api_port = settings.api_port, data_dir = %settings.data_dir.display(), "starting smite-panel");

    let store = Store::load(&settings.data_dir.join("state.json"));
    let servers = PanelServers::new(&settings.data_dir)?;

    let state = AppState {
        store: Arc::new(Mutex::new(store)),
        node_client: NodeClient::new(),
        servers: Arc::new(Mutex::new(servers)),
        forwarder: Arc::new(tokio::sync::Mutex::new(PortForwarder::new())),
        settings: Arc::new(settings.clone()),
    };

    // Nodes restore their own tunnels independently; this pass only brings
    // the panel-side helpers back and re-asserts what the panel believes
    // is active.
    orchestrator::reconcile_active_tunnels(&state).await;

    let scheduler_task = tokio::spawn(scheduler::run(state.clone()));

    let app = routes::router(state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("0.0.0.0:{}", settings.api_port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("smite-panel API listening on {}", addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down, stopping panel-side helpers");
    scheduler_task.abort();

    state.forwarder.lock().await.cleanup_all().await;
    let servers = state.servers.clone();
    tokio::task::spawn_blocking(move || servers.lock().unwrap().cleanup_all()).await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to install shutdown handler");
    }
}
