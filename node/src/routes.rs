//! Agent HTTP surface: tunnel and mesh control endpoints consumed by the
//! panel. Adapter calls block on child-process supervision (spawn + ~1 s
//! verification), so every mutation runs under `spawn_blocking`.

use std::sync::{Arc, Mutex};

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use smite_common::api::{AgentReply, AgentStatus, MeshApply, MeshRemove, TunnelApply, TunnelRemove};

use crate::adapters::wireguard::WireGuardAdapter;
use crate::adapters::AdapterManager;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<Mutex<AdapterManager>>,
    pub wireguard: Arc<Mutex<Option<WireGuardAdapter>>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/api/agent/tunnels/apply", post(apply_tunnel))
        .route("/api/agent/tunnels/remove", post(remove_tunnel))
        .route("/api/agent/tunnels/status", get(tunnel_status))
        .route("/api/agent/tunnels/traffic", get(tunnel_traffic))
        .route("/api/agent/status", get(agent_status))
        .route("/api/agent/mesh/apply", post(apply_mesh))
        .route("/api/agent/mesh/remove", post(remove_mesh))
        .route("/api/agent/mesh/:mesh_id/status", get(mesh_status))
        .with_state(state)
}

async fn root() -> Json<Value> {
    Json(json!({"status": "ok", "service": "smite-node"}))
}

async fn apply_tunnel(
    State(state): State<AppState>,
    Json(body): Json<TunnelApply>,
) -> (StatusCode, Json<AgentReply>) {
    info!(
        tunnel_id = %body.tunnel_id,
        core = %body.core,
        tunnel_type = %body.tunnel_type,
        "applying tunnel"
    );

    let manager = state.manager.clone();
    let tunnel_id = body.tunnel_id.clone();
    let result = tokio::task::spawn_blocking(move || {
        manager
            .lock()
            .unwrap()
            .apply_tunnel(&body.tunnel_id, &body.core, body.spec)
    })
    .await;

    match result {
        Ok(Ok(())) => {
            info!(tunnel_id = %tunnel_id, "tunnel applied successfully");
            (StatusCode::OK, Json(AgentReply::success("Tunnel applied")))
        }
        Ok(Err(err)) => {
            error!(tunnel_id = %tunnel_id, error = %err, "failed to apply tunnel");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(AgentReply::error(err.to_string())),
            )
        }
        Err(err) => {
            error!(tunnel_id = %tunnel_id, error = %err, "apply task panicked");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(AgentReply::error("internal error applying tunnel")),
            )
        }
    }
}

async fn remove_tunnel(
    State(state): State<AppState>,
    Json(body): Json<TunnelRemove>,
) -> (StatusCode, Json<AgentReply>) {
    let manager = state.manager.clone();
    let tunnel_id = body.tunnel_id.clone();
    let result =
        tokio::task::spawn_blocking(move || manager.lock().unwrap().remove_tunnel(&body.tunnel_id))
            .await;

    match result {
        Ok(Ok(())) => (StatusCode::OK, Json(AgentReply::success("Tunnel removed"))),
        Ok(Err(err)) => {
            error!(tunnel_id = %tunnel_id, error = %err, "failed to remove tunnel");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(AgentReply::error(err.to_string())),
            )
        }
        Err(err) => {
            error!(tunnel_id = %tunnel_id, error = %err, "remove task panicked");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(AgentReply::error("internal error removing tunnel")),
            )
        }
    }
}

#[derive(Deserialize)]
struct TunnelQuery {
    tunnel_id: String,
}

async fn tunnel_status(
    State(state): State<AppState>,
    Query(query): Query<TunnelQuery>,
) -> Json<Value> {
    let status = state.manager.lock().unwrap().tunnel_status(&query.tunnel_id);
    Json(json!({"status": "success", "data": status}))
}

async fn tunnel_traffic(
    State(state): State<AppState>,
    Query(query): Query<TunnelQuery>,
) -> Json<Value> {
    let bytes = state
        .manager
        .lock()
        .unwrap()
        .tunnel_traffic_bytes(&query.tunnel_id);
    Json(json!({
        "status": "success",
        "tunnel_id": query.tunnel_id,
        "bytes": bytes
    }))
}

async fn agent_status(State(state): State<AppState>) -> Json<AgentStatus> {
    let tunnels = state.manager.lock().unwrap().active_tunnel_ids();
    Json(AgentStatus {
        status: "ok".to_string(),
        active_tunnels: tunnels.len(),
        tunnels,
    })
}

async fn apply_mesh(
    State(state): State<AppState>,
    Json(body): Json<MeshApply>,
) -> (StatusCode, Json<AgentReply>) {
    info!(mesh_id = %body.mesh_id, routes = body.spec.routes.len(), "applying mesh config");

    let wireguard = state.wireguard.clone();
    let mesh_id = body.mesh_id.clone();
    let result = tokio::task::spawn_blocking(move || {
        let mut guard = wireguard.lock().unwrap();
        match guard.as_mut() {
            Some(adapter) => adapter.apply(
                &body.mesh_id,
                &body.spec.config,
                &body.spec.routes,
                body.spec.overlay_ip.as_deref(),
            ),
            None => Err(crate::adapters::AdapterError::Command(
                "wireguard-tools not installed on this node".into(),
            )),
        }
    })
    .await;

    match result {
        Ok(Ok(())) => {
            info!(mesh_id = %mesh_id, "mesh applied successfully");
            (StatusCode::OK, Json(AgentReply::success("Mesh applied")))
        }
        Ok(Err(err)) => {
            error!(mesh_id = %mesh_id, error = %err, "failed to apply mesh");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(AgentReply::error(err.to_string())),
            )
        }
        Err(err) => {
            error!(mesh_id = %mesh_id, error = %err, "mesh apply task panicked");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(AgentReply::error("internal error applying mesh")),
            )
        }
    }
}

async fn remove_mesh(
    State(state): State<AppState>,
    Json(body): Json<MeshRemove>,
) -> (StatusCode, Json<AgentReply>) {
    let wireguard = state.wireguard.clone();
    let result = tokio::task::spawn_blocking(move || {
        if let Some(adapter) = wireguard.lock().unwrap().as_mut() {
            adapter.remove(&body.mesh_id);
        }
    })
    .await;

    match result {
        Ok(()) => (StatusCode::OK, Json(AgentReply::success("Mesh removed"))),
        Err(err) => {
            error!(error = %err, "mesh remove task panicked");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(AgentReply::error("internal error removing mesh")),
            )
        }
    }
}

async fn mesh_status(
    State(state): State<AppState>,
    Path(mesh_id): Path<String>,
) -> Json<Value> {
    let status = match state.wireguard.lock().unwrap().as_mut() {
        Some(adapter) => adapter.status(&mesh_id),
        None => Default::default(),
    };
    Json(json!({"status": "success", "data": status}))
}
