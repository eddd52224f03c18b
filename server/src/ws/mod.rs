//! Connection registry: the per-process directory of live WebSocket
//! connections, one per user. Registering a user who already has a
//! connection closes and replaces the old one: last write wins locally;
//! cross-process eviction is driven by the session authority, not here.

pub mod actor;
pub mod handler;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::chat::router::{LocalSend, LocalSender};

/// Frames buffered per connection before the drop-new policy kicks in.
pub const OUTBOUND_BUFFER: usize = 256;

/// WebSocket close codes:
/// 4000 = displaced by a newer connection for the same user
/// 4001 = explicit logout
pub const CLOSE_DISPLACED: u16 = 4000;
pub const CLOSE_LOGOUT: u16 = 4001;

/// Outcome of enqueueing onto a connection's outbound channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    Full,
    Closed,
}

/// Handle to one live connection. Owned by its gateway actor; the registry
/// and router only ever touch it through this handle.
pub struct ConnectionHandle {
    user_id: String,
    tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl ConnectionHandle {
    pub fn new(user_id: String, tx: mpsc::Sender<Message>, cancel: CancellationToken) -> Self {
        Self {
            user_id,
            tx,
            cancel,
            closed: AtomicBool::new(false),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Enqueue one frame without blocking. A full buffer drops the frame;
    /// a stalled receiver must never stall an unrelated deliverer.
    pub fn enqueue(&self, msg: Message) -> EnqueueOutcome {
        if self.is_closed() {
            return EnqueueOutcome::Closed;
        }
        match self.tx.try_send(msg) {
            Ok(()) => EnqueueOutcome::Enqueued,
            Err(mpsc::error::TrySendError::Full(_)) => EnqueueOutcome::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => EnqueueOutcome::Closed,
        }
    }

    /// Close the connection at most once: queue a close frame for the writer
    /// and cancel both loops. Safe to call from any task; later calls no-op.
    pub fn close(&self, code: u16, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.tx.try_send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })));
        self.cancel.cancel();
    }
}

/// Concurrency-safe user → connection map. Holds no business logic beyond
/// the side effect of closing a superseded connection.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for a user, returning any displaced one.
    /// The displaced connection's socket is closed exactly once and its
    /// read loop unblocks through the cancellation token.
    pub fn register(
        &self,
        user_id: &str,
        handle: Arc<ConnectionHandle>,
    ) -> Option<Arc<ConnectionHandle>> {
        let displaced = self.connections.insert(user_id.to_string(), handle);
        if let Some(old) = &displaced {
            tracing::info!(user_id = %user_id, "Closing displaced connection");
            old.close(CLOSE_DISPLACED, "signed in from another device");
        }
        displaced
    }

    pub fn lookup(&self, user_id: &str) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(user_id).map(|entry| entry.value().clone())
    }

    /// Remove a user's entry only if it is still the passed connection, so a
    /// late unregister never races a newer registration.
    pub fn unregister(&self, user_id: &str, handle: &Arc<ConnectionHandle>) {
        self.connections
            .remove_if(user_id, |_, current| Arc::ptr_eq(current, handle));
    }

    /// Force-close and remove whatever connection a user has (logout).
    /// Returns false when none was registered (a no-op, not an error).
    pub fn evict(&self, user_id: &str, code: u16, reason: &str) -> bool {
        match self.connections.remove(user_id) {
            Some((_, handle)) => {
                handle.close(code, reason);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.connections.contains_key(user_id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

impl LocalSender for ConnectionRegistry {
    fn send_local(&self, user_id: &str, frame: &str) -> LocalSend {
        match self.lookup(user_id) {
            None => LocalSend::NotConnected,
            Some(handle) => match handle.enqueue(Message::Text(frame.to_string().into())) {
                EnqueueOutcome::Enqueued => LocalSend::Enqueued,
                EnqueueOutcome::Full => LocalSend::Dropped,
                // Closed but not yet unregistered: treat as gone.
                EnqueueOutcome::Closed => LocalSend::NotConnected,
            },
        }
    }
}
