//! Minimal group-membership surface feeding the router's fan-out.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth::tokens::Claims;
use crate::state::AppState;
use crate::store::StoreError;

#[derive(Debug, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct CreateGroupResponse {
    pub group_id: String,
}

/// POST /api/groups
/// Create a group. Group ids are minted with the `G` prefix the router's
/// receiver classification relies on; the creator becomes the first member.
pub async fn create_group(
    State(state): State<AppState>,
    claims: Claims,
    Json(req): Json<CreateGroupRequest>,
) -> Result<Json<CreateGroupResponse>, (StatusCode, Json<Value>)> {
    if req.name.is_empty() || req.name.len() > 64 {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid group name" })),
        ));
    }

    let group_id = format!("G{}", Uuid::now_v7().simple());
    state
        .groups
        .create_group(&group_id, &req.name, &claims.sub)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Group creation failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "group creation failed" })),
            )
        })?;

    tracing::info!(group_id = %group_id, owner = %claims.sub, "Group created");
    Ok(Json(CreateGroupResponse { group_id }))
}

/// POST /api/groups/{group_id}/join
pub async fn join_group(
    State(state): State<AppState>,
    claims: Claims,
    Path(group_id): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<Value>)> {
    state
        .groups
        .add_member(&group_id, &claims.sub)
        .await
        .map_err(|e| match e {
            StoreError::NotFound(_) => (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "group not found" })),
            ),
            other => {
                tracing::error!(error = %other, "Join failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "join failed" })),
                )
            }
        })?;

    Ok(StatusCode::OK)
}

/// GET /api/groups/{group_id}/members
pub async fn list_members(
    State(state): State<AppState>,
    _claims: Claims,
    Path(group_id): Path<String>,
) -> Result<Json<Vec<String>>, StatusCode> {
    let members = state.groups.members(&group_id).await.map_err(|e| {
        tracing::error!(error = %e, "Member lookup failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(Json(members))
}
