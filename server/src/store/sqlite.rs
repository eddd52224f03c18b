//! SQLite-backed collaborator implementations.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::Connection;
use uuid::Uuid;

use super::{
    migrations, GroupDirectory, MessageStore, NewUser, StoreError, StoredMessage, UserRecord,
    UserStore,
};
use crate::chat::message::ChatMessage;

/// Type alias for the shared database connection.
/// rusqlite is synchronous — we wrap in Arc<Mutex> for thread safety
/// with tokio::task::spawn_blocking for DB operations.
pub type DbPool = Arc<Mutex<Connection>>;

/// Initialize the SQLite database: create data directory if needed,
/// open (or create) the database file, enable WAL mode, and run migrations.
pub fn init_db(data_dir: &str) -> Result<DbPool, Box<dyn std::error::Error>> {
    std::fs::create_dir_all(data_dir)?;

    let db_path = Path::new(data_dir).join("courier.db");
    let mut conn = Connection::open(&db_path)?;

    // WAL mode for better concurrent read performance
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    let migrations = migrations::migrations();
    migrations.to_latest(&mut conn)?;

    tracing::info!("Database initialized at {}", db_path.display());

    Ok(Arc::new(Mutex::new(conn)))
}

/// One struct implements every collaborator trait; they share a connection.
#[derive(Clone)]
pub struct SqliteStore {
    db: DbPool,
}

impl SqliteStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }
}

fn db_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Database(e.to_string())
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    Ok(StoredMessage {
        id: row.get(0)?,
        send_id: row.get(1)?,
        receive_id: row.get(2)?,
        message_type: row.get(3)?,
        content: row.get(4)?,
        url: row.get(5)?,
        created_at: row.get(6)?,
    })
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn insert(&self, message: &ChatMessage) -> Result<(), StoreError> {
        let db = self.db.clone();
        let id = Uuid::now_v7().to_string();
        let send_id = message.send_id.clone();
        let receive_id = message.receive_id.clone();
        let message_type = message.message_type;
        let content = message.content.clone();
        let url = message.url.clone();

        tokio::task::spawn_blocking(move || {
            let conn = db.lock().map_err(db_err)?;
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO messages (id, send_id, receive_id, message_type, content, url, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![id, send_id, receive_id, message_type, content, url, now],
            )
            .map_err(db_err)?;
            Ok(())
        })
        .await
        .map_err(db_err)?
    }

    async fn find_by_user_pair(
        &self,
        a: &str,
        b: &str,
        limit: u32,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let db = self.db.clone();
        let a = a.to_string();
        let b = b.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = db.lock().map_err(db_err)?;
            let mut stmt = conn
                .prepare(
                    "SELECT id, send_id, receive_id, message_type, content, url, created_at
                     FROM messages
                     WHERE (send_id = ?1 AND receive_id = ?2)
                        OR (send_id = ?2 AND receive_id = ?1)
                     ORDER BY created_at DESC
                     LIMIT ?3",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(rusqlite::params![a, b, limit], row_to_message)
                .map_err(db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_err)?;
            Ok(rows)
        })
        .await
        .map_err(db_err)?
    }

    async fn find_by_group(
        &self,
        group_id: &str,
        limit: u32,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let db = self.db.clone();
        let group_id = group_id.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = db.lock().map_err(db_err)?;
            let mut stmt = conn
                .prepare(
                    "SELECT id, send_id, receive_id, message_type, content, url, created_at
                     FROM messages
                     WHERE receive_id = ?1
                     ORDER BY created_at DESC
                     LIMIT ?2",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(rusqlite::params![group_id, limit], row_to_message)
                .map_err(db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_err)?;
            Ok(rows)
        })
        .await
        .map_err(db_err)?
    }
}

#[async_trait]
impl GroupDirectory for SqliteStore {
    async fn members(&self, group_id: &str) -> Result<Vec<String>, StoreError> {
        let db = self.db.clone();
        let group_id = group_id.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = db.lock().map_err(db_err)?;
            let mut stmt = conn
                .prepare("SELECT user_id FROM group_members WHERE group_id = ?1")
                .map_err(db_err)?;
            let rows = stmt
                .query_map([&group_id], |row| row.get::<_, String>(0))
                .map_err(db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_err)?;
            Ok(rows)
        })
        .await
        .map_err(db_err)?
    }

    async fn create_group(
        &self,
        group_id: &str,
        name: &str,
        owner_id: &str,
    ) -> Result<(), StoreError> {
        let db = self.db.clone();
        let group_id = group_id.to_string();
        let name = name.to_string();
        let owner_id = owner_id.to_string();

        tokio::task::spawn_blocking(move || {
            let mut conn = db.lock().map_err(db_err)?;
            let now = Utc::now().to_rfc3339();
            let tx = conn.transaction().map_err(db_err)?;
            tx.execute(
                "INSERT INTO chat_groups (id, name, owner_id, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![group_id, name, owner_id, now],
            )
            .map_err(db_err)?;
            tx.execute(
                "INSERT INTO group_members (group_id, user_id, joined_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![group_id, owner_id, now],
            )
            .map_err(db_err)?;
            tx.commit().map_err(db_err)?;
            Ok(())
        })
        .await
        .map_err(db_err)?
    }

    async fn add_member(&self, group_id: &str, user_id: &str) -> Result<(), StoreError> {
        let db = self.db.clone();
        let group_id = group_id.to_string();
        let user_id = user_id.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = db.lock().map_err(db_err)?;

            let exists: bool = conn
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM chat_groups WHERE id = ?1)",
                    [&group_id],
                    |row| row.get(0),
                )
                .map_err(db_err)?;
            if !exists {
                return Err(StoreError::NotFound(format!("group {}", group_id)));
            }

            let now = Utc::now().to_rfc3339();
            // Re-joining is a no-op
            conn.execute(
                "INSERT OR IGNORE INTO group_members (group_id, user_id, joined_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![group_id, user_id, now],
            )
            .map_err(db_err)?;
            Ok(())
        })
        .await
        .map_err(db_err)?
    }
}

#[async_trait]
impl UserStore for SqliteStore {
    async fn create_user(&self, user: &NewUser) -> Result<(), StoreError> {
        let db = self.db.clone();
        let user = user.clone();

        tokio::task::spawn_blocking(move || {
            let conn = db.lock().map_err(db_err)?;
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO users (id, username, password_hash, nickname, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![user.id, user.username, user.password_hash, user.nickname, now],
            )
            .map_err(|e| {
                if is_constraint_violation(&e) {
                    StoreError::Conflict(format!("username {}", user.username))
                } else {
                    db_err(e)
                }
            })?;
            Ok(())
        })
        .await
        .map_err(db_err)?
    }

    async fn verify_credentials(
        &self,
        username: &str,
        password_hash: &str,
    ) -> Result<Option<UserRecord>, StoreError> {
        let db = self.db.clone();
        let username = username.to_string();
        let password_hash = password_hash.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = db.lock().map_err(db_err)?;
            let record = conn
                .query_row(
                    "SELECT id, username, nickname FROM users
                     WHERE username = ?1 AND password_hash = ?2",
                    rusqlite::params![username, password_hash],
                    |row| {
                        Ok(UserRecord {
                            id: row.get(0)?,
                            username: row.get(1)?,
                            nickname: row.get(2)?,
                        })
                    },
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(db_err(other)),
                })?;
            Ok(record)
        })
        .await
        .map_err(db_err)?
    }
}
