//! Tunnel lifecycle endpoints.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::orchestrator::{self, TunnelCreate, TunnelUpdate};
use crate::routes::request_context;
use crate::state::AppState;
use crate::store::TunnelRow;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_tunnels).post(create_tunnel))
        .route(
            "/:tunnel_id",
            get(get_tunnel).put(update_tunnel).delete(delete_tunnel),
        )
        .route("/:tunnel_id/apply", post(apply_tunnel))
        .route("/:tunnel_id/traffic", get(tunnel_traffic))
}

async fn create_tunnel(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<TunnelCreate>,
) -> Result<Json<TunnelRow>, ApiError> {
    let ctx = request_context(&headers);
    let tunnel = orchestrator::create_tunnel(&state, body, &ctx).await?;
    Ok(Json(tunnel))
}

async fn list_tunnels(State(state): State<AppState>) -> Json<Vec<TunnelRow>> {
    Json(state.store.lock().unwrap().tunnels())
}

async fn get_tunnel(
    State(state): State<AppState>,
    Path(tunnel_id): Path<String>,
) -> Result<Json<TunnelRow>, ApiError> {
    state
        .store
        .lock()
        .unwrap()
        .tunnel(&tunnel_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("tunnel not found".into()))
}

async fn update_tunnel(
    State(state): State<AppState>,
    Path(tunnel_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<TunnelUpdate>,
) -> Result<Json<TunnelRow>, ApiError> {
    let ctx = request_context(&headers);
    let tunnel = orchestrator::update_tunnel(&state, &tunnel_id, body, &ctx).await?;
    Ok(Json(tunnel))
}

async fn apply_tunnel(
    State(state): State<AppState>,
    Path(tunnel_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let ctx = request_context(&headers);
    orchestrator::redispatch_tunnel(&state, &tunnel_id, &ctx).await?;
    Ok(Json(json!({
        "status": "applied",
        "message": "Tunnel applied successfully"
    })))
}

async fn delete_tunnel(
    State(state): State<AppState>,
    Path(tunnel_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    orchestrator::delete_tunnel(&state, &tunnel_id).await?;
    Ok(Json(json!({"status": "deleted"})))
}

/// Pull the node's byte counters for this tunnel and mirror them into
/// `used_mb`.
async fn tunnel_traffic(
    State(state): State<AppState>,
    Path(tunnel_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .store
        .lock()
        .unwrap()
        .tunnel(&tunnel_id)
        .ok_or_else(|| ApiError::NotFound("tunnel not found".into()))?;

    let used_mb = orchestrator::refresh_tunnel_usage(&state, &tunnel_id).await;
    Ok(Json(json!({
        "status": "success",
        "tunnel_id": tunnel_id,
        "used_mb": used_mb,
    })))
}
