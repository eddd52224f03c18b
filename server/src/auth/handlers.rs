use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::auth::tokens::{AuthError, Claims, TokenPair};
use crate::state::AppState;
use crate::store::NewUser;
use crate::ws::CLOSE_LOGOUT;

// --- Request/Response types for JSON API ---

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterApiRequest {
    pub username: String,
    pub password: String,
    pub nickname: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterApiResponse {
    pub user_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginApiRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RefreshApiRequest {
    pub refresh_token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RefreshApiResponse {
    pub access_token: String,
}

fn error_body(status: StatusCode, message: &str) -> (StatusCode, Json<Value>) {
    (status, Json(json!({ "error": message })))
}

/// SHA-256 hash of a password, hex-encoded for storage comparison.
pub fn hash_password(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

// --- Handlers ---

/// POST /api/auth/register
/// Create an account. User ids are minted with the `U` prefix the router's
/// receiver classification relies on.
pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterApiRequest>,
) -> Result<Json<RegisterApiResponse>, (StatusCode, Json<Value>)> {
    if req.username.is_empty() || req.username.len() > 32 {
        return Err(error_body(StatusCode::BAD_REQUEST, "invalid username"));
    }
    if req.password.len() < 6 {
        return Err(error_body(StatusCode::BAD_REQUEST, "password too short"));
    }
    let nickname = if req.nickname.is_empty() {
        req.username.clone()
    } else {
        req.nickname.clone()
    };

    let user_id = format!("U{}", Uuid::now_v7().simple());
    let user = NewUser {
        id: user_id.clone(),
        username: req.username,
        password_hash: hash_password(&req.password),
        nickname,
    };

    state.users.create_user(&user).await.map_err(|e| match e {
        crate::store::StoreError::Conflict(_) => {
            error_body(StatusCode::CONFLICT, "username already taken")
        }
        other => {
            tracing::error!(error = %other, "User creation failed");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "registration failed")
        }
    })?;

    tracing::info!(user_id = %user_id, "User registered");
    Ok(Json(RegisterApiResponse { user_id }))
}

/// POST /api/auth/login
/// Verify credentials against the user store, then issue a token pair.
/// Every login overwrites the cached token identifier; the previous
/// device's refresh token is superseded from this moment on.
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginApiRequest>,
) -> Result<Json<TokenPair>, (StatusCode, Json<Value>)> {
    let record = state
        .users
        .verify_credentials(&req.username, &hash_password(&req.password))
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Credential lookup failed");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "login failed")
        })?
        .ok_or_else(|| error_body(StatusCode::UNAUTHORIZED, "invalid credentials"))?;

    let pair = state
        .sessions
        .issue_tokens(&record.id)
        .await
        .map_err(auth_error_body)?;

    tracing::info!(user_id = %record.id, "Login issued new token pair");
    Ok(Json(pair))
}

/// POST /api/auth/refresh
/// Exchange a still-authoritative refresh token for a new access token.
/// A superseded identifier is rejected with the specific reason.
pub async fn refresh(
    State(state): State<AppState>,
    Json(req): Json<RefreshApiRequest>,
) -> Result<Json<RefreshApiResponse>, (StatusCode, Json<Value>)> {
    let access_token = state
        .sessions
        .refresh(&req.refresh_token)
        .await
        .map_err(auth_error_body)?;

    Ok(Json(RefreshApiResponse { access_token }))
}

/// POST /api/chat/logout
/// Close and unregister the caller's live connection on this process.
/// Success whether or not a connection was registered.
pub async fn logout(State(state): State<AppState>, claims: Claims) -> StatusCode {
    let had_connection = state
        .registry
        .evict(&claims.sub, CLOSE_LOGOUT, "logged out");
    tracing::info!(user_id = %claims.sub, had_connection, "Logout");
    StatusCode::OK
}

fn auth_error_body(e: AuthError) -> (StatusCode, Json<Value>) {
    let status = match &e {
        AuthError::Store(_) | AuthError::Encoding(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::UNAUTHORIZED,
    };
    if status == StatusCode::SERVICE_UNAVAILABLE {
        tracing::error!(error = %e, "Token infrastructure failure");
    }
    error_body(status, &e.to_string())
}
