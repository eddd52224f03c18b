use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::state::AppState;
use crate::ws::actor;

/// Query parameters for the WebSocket upgrade. The connecting client's
/// identity arrives as `?uid=`; no further handshake payload follows.
#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    #[serde(default)]
    pub uid: Option<String>,
}

fn valid_identity(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// GET /ws?uid={identity}
/// Upgrade endpoint. An absent or malformed identity is rejected with a
/// structured error before anything registers.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    tracing::debug!(phase = ?actor::Phase::Connecting, "WebSocket upgrade requested");

    let user_id = match query.uid.as_deref() {
        Some(id) if valid_identity(id) => id.to_string(),
        other => {
            tracing::warn!(uid = ?other, "Rejecting upgrade: missing or malformed identity");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "missing or malformed uid" })),
            )
                .into_response();
        }
    };

    ws.on_upgrade(move |socket| actor::run_connection(socket, state, user_id))
}
