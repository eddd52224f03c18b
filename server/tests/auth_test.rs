//! Integration tests for registration, login, and the single-active-session
//! refresh flow.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::net::TcpListener;

use courier_server::auth::tokens::{load_or_generate_secret, SessionAuthority};
use courier_server::cache::{CacheError, ObjectCache, TokenIdentityStore};
use courier_server::chat::router::{LocalSender, MessageRouter};
use courier_server::state::AppState;
use courier_server::store::sqlite::{init_db, SqliteStore};
use courier_server::store::{GroupDirectory, MessageStore, UserStore};
use courier_server::ws::ConnectionRegistry;

/// In-memory stand-in for the Redis presence/token cache.
#[derive(Default)]
struct MemoryCache {
    objects: Mutex<HashMap<String, String>>,
    identities: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl ObjectCache for MemoryCache {
    async fn get_raw(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.objects.lock().unwrap().get(key).cloned())
    }

    async fn set_raw(&self, key: &str, value: &str, _ttl: Duration) -> Result<(), CacheError> {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn invalidate_pattern(&self, pattern: &str) -> Result<u64, CacheError> {
        let mut objects = self.objects.lock().unwrap();
        let before = objects.len();
        match pattern.strip_suffix('*') {
            Some(prefix) => objects.retain(|k, _| !k.starts_with(prefix)),
            None => {
                objects.remove(pattern);
            }
        }
        Ok((before - objects.len()) as u64)
    }
}

#[async_trait]
impl TokenIdentityStore for MemoryCache {
    async fn put_identity(
        &self,
        user_id: &str,
        token_id: &str,
        _ttl: Duration,
    ) -> Result<(), CacheError> {
        self.identities
            .lock()
            .unwrap()
            .insert(user_id.to_string(), token_id.to_string());
        Ok(())
    }

    async fn identity(&self, user_id: &str) -> Result<Option<String>, CacheError> {
        Ok(self.identities.lock().unwrap().get(user_id).cloned())
    }
}

/// Start the server on a random port and return its base URL.
async fn start_test_server() -> String {
    let tmp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let data_dir = tmp_dir.path().to_str().unwrap().to_string();

    let db = init_db(&data_dir).expect("Failed to init DB");
    let store = Arc::new(SqliteStore::new(db));
    let jwt_secret = load_or_generate_secret(&data_dir).expect("Failed to generate JWT secret");
    let cache = Arc::new(MemoryCache::default());
    let registry = Arc::new(ConnectionRegistry::new());

    let sessions = Arc::new(SessionAuthority::new(
        jwt_secret.clone(),
        900,
        604_800,
        cache.clone() as Arc<dyn TokenIdentityStore>,
    ));

    let router = Arc::new(MessageRouter::new(
        registry.clone() as Arc<dyn LocalSender>,
        None,
        store.clone() as Arc<dyn GroupDirectory>,
        store.clone() as Arc<dyn MessageStore>,
        cache.clone() as Arc<dyn ObjectCache>,
    ));

    let state = AppState {
        registry,
        sessions,
        router,
        jwt_secret,
        cache: cache as Arc<dyn ObjectCache>,
        users: store.clone() as Arc<dyn UserStore>,
        groups: store.clone() as Arc<dyn GroupDirectory>,
        messages: store as Arc<dyn MessageStore>,
        history_ttl: Duration::from_secs(30),
    };

    let app = courier_server::routes::build_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
        let _keep = tmp_dir;
    });

    format!("http://{}", addr)
}

async fn register(base_url: &str, username: &str) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("{}/api/auth/register", base_url))
        .json(&json!({
            "username": username,
            "password": "correct-horse",
            "nickname": username,
        }))
        .send()
        .await
        .unwrap()
}

async fn login(base_url: &str, username: &str, password: &str) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("{}/api/auth/login", base_url))
        .json(&json!({ "username": username, "password": password }))
        .send()
        .await
        .unwrap()
}

async fn refresh(base_url: &str, refresh_token: &str) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("{}/api/auth/refresh", base_url))
        .json(&json!({ "refresh_token": refresh_token }))
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_register_login_refresh_flow() {
    let base_url = start_test_server().await;

    let resp = register(&base_url, "alice").await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["user_id"].as_str().unwrap().starts_with('U'));

    let resp = login(&base_url, "alice", "correct-horse").await;
    assert_eq!(resp.status(), 200);
    let tokens: serde_json::Value = resp.json().await.unwrap();
    let refresh_token = tokens["refresh_token"].as_str().unwrap();

    let resp = refresh(&base_url, refresh_token).await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    let access_token = body["access_token"].as_str().unwrap();

    // The refreshed access token authenticates a protected route.
    let resp = reqwest::Client::new()
        .post(format!("{}/api/chat/logout", base_url))
        .bearer_auth(access_token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn test_duplicate_username_is_rejected() {
    let base_url = start_test_server().await;

    assert_eq!(register(&base_url, "alice").await.status(), 200);
    let resp = register(&base_url, "alice").await;
    assert_eq!(resp.status(), 409);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("taken"));
}

#[tokio::test]
async fn test_wrong_password_is_unauthorized() {
    let base_url = start_test_server().await;

    assert_eq!(register(&base_url, "alice").await.status(), 200);
    let resp = login(&base_url, "alice", "wrong-horse").await;
    assert_eq!(resp.status(), 401);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"].as_str(), Some("invalid credentials"));
}

#[tokio::test]
async fn test_second_login_supersedes_first_device() {
    let base_url = start_test_server().await;
    assert_eq!(register(&base_url, "alice").await.status(), 200);

    // Device 1 logs in, then device 2 logs in and overwrites the cached
    // token identifier.
    let device1: serde_json::Value = login(&base_url, "alice", "correct-horse")
        .await
        .json()
        .await
        .unwrap();
    let device2: serde_json::Value = login(&base_url, "alice", "correct-horse")
        .await
        .json()
        .await
        .unwrap();

    // Device 1's refresh token is well-formed and unexpired, but superseded.
    let resp = refresh(&base_url, device1["refresh_token"].as_str().unwrap()).await;
    assert_eq!(resp.status(), 401);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(
        body["error"].as_str().unwrap().contains("another device"),
        "Rejection must carry the specific reason, got: {}",
        body
    );

    // Device 2 refreshes fine.
    let resp = refresh(&base_url, device2["refresh_token"].as_str().unwrap()).await;
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn test_refresh_rejects_access_token() {
    let base_url = start_test_server().await;
    assert_eq!(register(&base_url, "alice").await.status(), 200);

    let tokens: serde_json::Value = login(&base_url, "alice", "correct-horse")
        .await
        .json()
        .await
        .unwrap();

    let resp = refresh(&base_url, tokens["access_token"].as_str().unwrap()).await;
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn test_protected_route_requires_bearer_token() {
    let base_url = start_test_server().await;

    let resp = reqwest::Client::new()
        .post(format!("{}/api/chat/logout", base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = reqwest::Client::new()
        .post(format!("{}/api/chat/logout", base_url))
        .bearer_auth("not-a-jwt")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn test_refresh_token_is_not_a_bearer_credential() {
    let base_url = start_test_server().await;
    assert_eq!(register(&base_url, "alice").await.status(), 200);

    let tokens: serde_json::Value = login(&base_url, "alice", "correct-horse")
        .await
        .json()
        .await
        .unwrap();

    // A refresh token in the Authorization header must not authenticate.
    let resp = reqwest::Client::new()
        .post(format!("{}/api/chat/logout", base_url))
        .bearer_auth(tokens["refresh_token"].as_str().unwrap())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}
