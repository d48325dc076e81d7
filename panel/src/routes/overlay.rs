//! Overlay IP pool and assignment endpoints.

use axum::extract::{Path, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use ipnet::Ipv4Net;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::ipam::{self, IpamError};
use crate::state::AppState;
use crate::store::OverlayPoolRow;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/pool", get(get_pool).post(create_pool).delete(delete_pool))
        .route("/assign/:node_id", post(assign_ip).put(update_assignment))
        .route("/release/:node_id", delete(release_ip))
        .route("/status", get(pool_status))
        .route("/assignments", get(list_assignments))
        .route("/node/:node_id", get(node_ip))
        .route("/sync", post(sync_assignments))
}

#[derive(Debug, Deserialize)]
struct PoolCreate {
    cidr: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AssignRequest {
    #[serde(default)]
    preferred_ip: Option<String>,
    #[serde(default = "default_interface")]
    interface_name: String,
}

fn default_interface() -> String {
    "wg0".to_string()
}

fn ipam_error(err: IpamError) -> ApiError {
    match err {
        IpamError::PreferredTaken(_) => ApiError::Conflict(err.to_string()),
        IpamError::PoolExhausted => ApiError::Internal(err.to_string()),
        _ => ApiError::BadRequest(err.to_string()),
    }
}

async fn create_pool(
    State(state): State<AppState>,
    Json(body): Json<PoolCreate>,
) -> Result<Json<OverlayPoolRow>, ApiError> {
    body.cidr
        .parse::<Ipv4Net>()
        .map_err(|err| ApiError::BadRequest(format!("invalid CIDR: {}", err)))?;

    let pool = state
        .store
        .lock()
        .unwrap()
        .set_pool(&body.cidr, body.description);
    Ok(Json(pool))
}

async fn get_pool(State(state): State<AppState>) -> Json<Option<OverlayPoolRow>> {
    Json(state.store.lock().unwrap().pool())
}

async fn delete_pool(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    if !state.store.lock().unwrap().delete_pool() {
        return Err(ApiError::NotFound("no overlay pool found".into()));
    }
    Ok(Json(json!({
        "status": "success",
        "message": "Pool and all assignments deleted"
    })))
}

async fn assign_ip(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    Json(body): Json<AssignRequest>,
) -> Result<Json<Value>, ApiError> {
    let mut store = state.store.lock().unwrap();
    store
        .node(&node_id)
        .ok_or_else(|| ApiError::NotFound("node not found".into()))?;

    let overlay_ip = ipam::allocate_ip(
        &mut store,
        &node_id,
        body.preferred_ip.as_deref(),
        &body.interface_name,
    )
    .map_err(ipam_error)?;

    Ok(Json(json!({
        "status": "success",
        "node_id": node_id,
        "overlay_ip": overlay_ip,
        "interface_name": body.interface_name,
    })))
}

async fn update_assignment(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    Json(body): Json<AssignRequest>,
) -> Result<Json<Value>, ApiError> {
    let preferred_ip = body
        .preferred_ip
        .ok_or_else(|| ApiError::BadRequest("preferred_ip is required for update".into()))?;

    let mut store = state.store.lock().unwrap();
    store
        .node(&node_id)
        .ok_or_else(|| ApiError::NotFound("node not found".into()))?;

    ipam::update_node_ip(&mut store, &node_id, &preferred_ip, &body.interface_name)
        .map_err(ipam_error)?;

    Ok(Json(json!({
        "status": "success",
        "node_id": node_id,
        "overlay_ip": preferred_ip,
        "interface_name": body.interface_name,
    })))
}

async fn release_ip(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !ipam::release_ip(&mut state.store.lock().unwrap(), &node_id) {
        return Err(ApiError::NotFound(
            "no overlay IP assigned to this node".into(),
        ));
    }
    Ok(Json(json!({"status": "success", "message": "Overlay IP released"})))
}

async fn pool_status(State(state): State<AppState>) -> Json<ipam::PoolStatus> {
    Json(ipam::pool_status(&state.store.lock().unwrap()))
}

async fn list_assignments(State(state): State<AppState>) -> Json<Value> {
    let store = state.store.lock().unwrap();
    let assignments: Vec<Value> = store
        .assignments()
        .into_iter()
        .map(|assignment| {
            let node_name = store
                .node(&assignment.node_id)
                .map(|node| node.name)
                .unwrap_or_else(|| "Unknown".to_string());
            json!({
                "node_id": assignment.node_id,
                "node_name": node_name,
                "overlay_ip": assignment.overlay_ip,
                "interface_name": assignment.interface_name,
                "assigned_at": assignment.assigned_at,
            })
        })
        .collect();
    Json(Value::Array(assignments))
}

async fn node_ip(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let store = state.store.lock().unwrap();
    let assignment = store.assignment(&node_id).ok_or_else(|| {
        ApiError::NotFound("no overlay IP assigned to this node".into())
    })?;

    Ok(Json(json!({
        "node_id": node_id,
        "overlay_ip": assignment.overlay_ip,
        "interface_name": assignment.interface_name,
    })))
}

/// Allocate an overlay IP for every node that lacks one and re-mirror
/// metadata for those that have one.
async fn sync_assignments(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let mut store = state.store.lock().unwrap();
    store
        .pool()
        .ok_or_else(|| ApiError::NotFound("no overlay pool configured".into()))?;

    let mut synced = 0usize;
    let mut errors: Vec<String> = Vec::new();

    let nodes = store.nodes();
    for node in nodes {
        match store.assignment(&node.id) {
            None => match ipam::allocate_ip(&mut store, &node.id, None, "wg0") {
                Ok(_) => synced += 1,
                Err(err) => errors.push(format!("node {}: {}", node.id, err)),
            },
            Some(assignment) => {
                let mirrored = node
                    .metadata
                    .get("overlay_ip")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                if mirrored.as_deref() != Some(assignment.overlay_ip.as_str()) {
                    store.set_node_metadata(
                        &node.id,
                        "overlay_ip",
                        Value::String(assignment.overlay_ip.clone()),
                    );
                    synced += 1;
                }
            }
        }
    }

    Ok(Json(json!({
        "status": "success",
        "synced": synced,
        "errors": errors,
    })))
}
