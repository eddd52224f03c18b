use std::sync::Arc;
use std::time::Duration;

use crate::auth::tokens::SessionAuthority;
use crate::cache::ObjectCache;
use crate::chat::router::MessageRouter;
use crate::store::{GroupDirectory, MessageStore, UserStore};
use crate::ws::ConnectionRegistry;

/// Shared application state passed to all handlers via axum State extractor.
/// Collaborators sit behind trait objects so tests can substitute in-memory
/// implementations and the broker/cache technology stays swappable.
#[derive(Clone)]
pub struct AppState {
    /// Per-process directory of live connections
    pub registry: Arc<ConnectionRegistry>,
    /// Access/refresh token pair issuing and the single-active-session check
    pub sessions: Arc<SessionAuthority>,
    /// Delivery fan-out
    pub router: Arc<MessageRouter>,
    /// JWT signing secret (256-bit random key), injected for the Claims extractor
    pub jwt_secret: Vec<u8>,
    /// Read-through cache for history reads
    pub cache: Arc<dyn ObjectCache>,
    /// External CRUD collaborators
    pub users: Arc<dyn UserStore>,
    pub groups: Arc<dyn GroupDirectory>,
    pub messages: Arc<dyn MessageStore>,
    /// TTL for cached history entries
    pub history_ttl: Duration,
}
