//! Node registration and listing.

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::info;

use smite_common::api::NodeRegistration;

use crate::error::ApiError;
use crate::ipam;
use crate::state::AppState;
use crate::store::NodeRow;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_nodes).post(create_node))
        .route("/:node_id", get(get_node).delete(delete_node))
}

async fn create_node(
    State(state): State<AppState>,
    Json(registration): Json<NodeRegistration>,
) -> Result<Json<NodeRow>, ApiError> {
    let node = {
        let mut store = state.store.lock().unwrap();
        store.upsert_node(registration).map_err(|message| {
            if message.contains("already registered") {
                ApiError::Conflict(message)
            } else {
                ApiError::BadRequest(message)
            }
        })?
    };

    // Hand out an overlay IP right away when a pool exists; a node without
    // one just waits for mesh creation.
    {
        let mut store = state.store.lock().unwrap();
        if store.pool().is_some() && store.assignment(&node.id).is_none() {
            let _ = ipam::allocate_ip(&mut store, &node.id, None, "wg0");
        }
    }

    let node = state
        .store
        .lock()
        .unwrap()
        .node(&node.id)
        .ok_or_else(|| ApiError::Internal("node vanished after registration".into()))?;

    info!(node_id = %node.id, name = %node.name, role = node.role().as_str(), "node registered");
    Ok(Json(node))
}

/// List nodes with a live `connection_status` synthesised from a probe of
/// each node's API.
async fn list_nodes(State(state): State<AppState>) -> Json<Vec<NodeRow>> {
    let nodes = state.store.lock().unwrap().nodes();

    let mut enriched = Vec::with_capacity(nodes.len());
    for mut node in nodes {
        let status = state.node_client.probe(&node).await;
        node.metadata.insert(
            "connection_status".to_string(),
            Value::String(status.as_str().to_string()),
        );
        enriched.push(node);
    }

    Json(enriched)
}

async fn get_node(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Result<Json<NodeRow>, ApiError> {
    state
        .store
        .lock()
        .unwrap()
        .node(&node_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("node not found".into()))
}

async fn delete_node(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let removed = state.store.lock().unwrap().delete_node(&node_id);
    if !removed {
        return Err(ApiError::NotFound("node not found".into()));
    }
    Ok(Json(json!({"status": "deleted"})))
}
