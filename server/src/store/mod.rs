//! Collaborator traits for the CRUD surface the delivery core leans on.
//!
//! The router and handlers only see these traits; the sqlite implementations
//! in [`sqlite`] are thin stand-ins, not a designed storage engine.

pub mod migrations;
pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chat::message::ChatMessage;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
}

/// A message as returned by history reads, most recent first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub send_id: String,
    pub receive_id: String,
    #[serde(rename = "type")]
    pub message_type: i32,
    pub content: Option<String>,
    pub url: Option<String>,
    pub created_at: String,
}

/// New user record as written by registration.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub id: String,
    pub username: String,
    pub password_hash: String,
    pub nickname: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserRecord {
    pub id: String,
    pub username: String,
    pub nickname: String,
}

/// Durable record for delivered and undelivered messages alike.
/// Delivery is best-effort; clients reconcile against this on reconnect.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn insert(&self, message: &ChatMessage) -> Result<(), StoreError>;

    /// Messages between two users, in either direction, most recent first.
    async fn find_by_user_pair(
        &self,
        a: &str,
        b: &str,
        limit: u32,
    ) -> Result<Vec<StoredMessage>, StoreError>;

    /// Messages addressed to a group, most recent first.
    async fn find_by_group(
        &self,
        group_id: &str,
        limit: u32,
    ) -> Result<Vec<StoredMessage>, StoreError>;
}

/// Group membership lookups used by the router's fan-out.
#[async_trait]
pub trait GroupDirectory: Send + Sync {
    /// Current member ids of a group; empty for an unknown group.
    async fn members(&self, group_id: &str) -> Result<Vec<String>, StoreError>;

    /// Create a group; the owner becomes its first member.
    async fn create_group(
        &self,
        group_id: &str,
        name: &str,
        owner_id: &str,
    ) -> Result<(), StoreError>;

    async fn add_member(&self, group_id: &str, user_id: &str) -> Result<(), StoreError>;
}

/// Account lookups for registration and login. Credential storage design
/// is out of scope; callers hand over an already-hashed password.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn create_user(&self, user: &NewUser) -> Result<(), StoreError>;

    /// Returns the user record when username and password hash match.
    async fn verify_credentials(
        &self,
        username: &str,
        password_hash: &str,
    ) -> Result<Option<UserRecord>, StoreError>;
}
