//! Message-history reads, served through the read-through cache.
//!
//! History is the durable record clients reconcile against after a
//! reconnect, so these endpoints sit on the delivery path's cache: short-TTL
//! entries, background write-back, invalidated by the router on insert.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use crate::auth::tokens::Claims;
use crate::cache::get_with_fallback;
use crate::state::AppState;
use crate::store::StoredMessage;

/// Most recent messages returned per read.
const HISTORY_LIMIT: u32 = 100;

/// Cache key for a direct conversation, order-independent.
pub fn direct_history_key(a: &str, b: &str) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("hist:direct:{}:{}", lo, hi)
}

pub fn group_history_key(group_id: &str) -> String {
    format!("hist:group:{}", group_id)
}

/// GET /api/messages/direct/{peer}
/// Recent messages between the caller and a peer, most recent first.
pub async fn direct_history(
    State(state): State<AppState>,
    claims: Claims,
    Path(peer): Path<String>,
) -> Result<Json<Vec<StoredMessage>>, StatusCode> {
    let key = direct_history_key(&claims.sub, &peer);
    let messages = get_with_fallback(&state.cache, &key, state.history_ttl, || async {
        state
            .messages
            .find_by_user_pair(&claims.sub, &peer, HISTORY_LIMIT)
            .await
    })
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "Direct history lookup failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(messages))
}

/// GET /api/messages/group/{group_id}
/// Recent messages addressed to a group. Members only.
pub async fn group_history(
    State(state): State<AppState>,
    claims: Claims,
    Path(group_id): Path<String>,
) -> Result<Json<Vec<StoredMessage>>, StatusCode> {
    let members = state.groups.members(&group_id).await.map_err(|e| {
        tracing::error!(error = %e, "Member lookup failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    if !members.iter().any(|m| m == &claims.sub) {
        return Err(StatusCode::FORBIDDEN);
    }

    let key = group_history_key(&group_id);
    let messages = get_with_fallback(&state.cache, &key, state.history_ttl, || async {
        state.messages.find_by_group(&group_id, HISTORY_LIMIT).await
    })
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "Group history lookup failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(messages))
}
