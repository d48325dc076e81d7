mod adapters;
mod announce;
mod config;
mod firewall;
mod process;
mod routes;

use std::fs;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::adapters::wireguard::WireGuardAdapter;
use crate::adapters::AdapterManager;
use crate::config::Settings;
use crate::routes::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let settings = Settings::from_env();
    info!(
        name = %settings.node_name,
        role = settings.role.as_str(),
        api_port = settings.api_port,
        "starting smite-node agent"
    );

    // Mesh routing needs forwarding; failing here just means the host has
    // to enable it itself.
    match fs::write("/proc/sys/net/ipv4/ip_forward", "1") {
        Ok(()) => info!("IPv4 forwarding enabled at startup"),
        Err(err) => warn!(error = %err, "failed to enable IPv4 forwarding at startup"),
    }

    let manager = Arc::new(Mutex::new(AdapterManager::new(
        &settings.state_dir,
        &settings.config_dir,
    )?));

    // Bring every persisted tunnel back before accepting new work.
    {
        let manager = manager.clone();
        tokio::task::spawn_blocking(move || manager.lock().unwrap().restore_tunnels()).await?;
    }

    let wireguard = match WireGuardAdapter::new(&settings.config_dir) {
        Ok(adapter) => Some(adapter),
        Err(err) => {
            warn!(error = %err, "wireguard adapter unavailable, mesh endpoints will refuse work");
            None
        }
    };
    let wireguard = Arc::new(Mutex::new(wireguard));

    announce::register_with_panel(&settings).await;

    let state = AppState {
        manager: manager.clone(),
        wireguard,
    };
    let app = routes::router(state).layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("0.0.0.0:{}", settings.api_port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("smite-node agent listening on {}", addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop children but keep tunnels.json so the next start restores them.
    info!("shutting down, stopping supervised processes");
    tokio::task::spawn_blocking(move || manager.lock().unwrap().shutdown()).await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to install shutdown handler");
    }
}
