//! WireGuard mesh endpoints.

use axum::extract::{Path, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::mesh::{self, MeshCreate};
use crate::state::AppState;
use crate::store::MeshRow;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_meshes))
        .route("/create", post(create_mesh))
        .route("/:mesh_id", delete(delete_mesh))
        .route("/:mesh_id/apply", post(apply_mesh))
        .route("/:mesh_id/status", get(mesh_status))
        .route("/:mesh_id/rotate-keys", post(rotate_keys))
}

async fn create_mesh(
    State(state): State<AppState>,
    Json(body): Json<MeshCreate>,
) -> Result<Json<MeshRow>, ApiError> {
    let mesh = mesh::create_mesh(&state, body).await?;
    Ok(Json(mesh))
}

async fn list_meshes(State(state): State<AppState>) -> Json<Vec<MeshRow>> {
    Json(state.store.lock().unwrap().meshes())
}

async fn apply_mesh(
    State(state): State<AppState>,
    Path(mesh_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    mesh::apply_mesh(&state, &mesh_id).await?;
    Ok(Json(json!({
        "status": "success",
        "message": "Mesh applied to all nodes"
    })))
}

async fn mesh_status(
    State(state): State<AppState>,
    Path(mesh_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let status = mesh::mesh_status(&state, &mesh_id).await?;
    Ok(Json(status))
}

async fn rotate_keys(
    State(state): State<AppState>,
    Path(mesh_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    mesh::rotate_keys(&state, &mesh_id).await?;
    Ok(Json(json!({
        "status": "success",
        "message": "Keys rotated, re-apply mesh to update nodes"
    })))
}

async fn delete_mesh(
    State(state): State<AppState>,
    Path(mesh_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    mesh::delete_mesh(&state, &mesh_id).await?;
    Ok(Json(json!({"status": "success", "message": "Mesh deleted"})))
}
