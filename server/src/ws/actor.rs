//! Per-connection state machine.
//!
//! One reader loop and one writer task per connection, torn down together
//! through the handle's cancellation token. The actor is the only place
//! that mutates the registry for its connection.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::chat::message::ChatMessage;
use crate::state::AppState;
use crate::ws::{ConnectionHandle, OUTBOUND_BUFFER};

/// Connection lifecycle, logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Connecting,
    Authenticated,
    Serving,
    Closing,
    Closed,
}

/// Normal close initiated by this side after the reader loop ends.
const CLOSE_NORMAL: u16 = 1000;

/// How long the writer gets to flush a pending close frame at teardown.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Run the connection from registration to teardown.
pub async fn run_connection(socket: WebSocket, state: AppState, user_id: String) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);
    let cancel = CancellationToken::new();
    let handle = Arc::new(ConnectionHandle::new(user_id.clone(), tx, cancel.clone()));

    // Registering closes any displaced connection for this user.
    let displaced = state.registry.register(&user_id, handle.clone());
    tracing::debug!(
        user_id = %user_id,
        displaced = displaced.is_some(),
        phase = ?Phase::Authenticated,
        "Connection registered"
    );
    drop(displaced);

    let mut writer = tokio::spawn(writer_task(ws_sender, rx));
    tracing::debug!(user_id = %user_id, phase = ?Phase::Serving, "Read/write loops started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Displaced by a newer login, or explicit logout.
                tracing::info!(user_id = %user_id, "Connection cancelled");
                break;
            }
            frame = ws_receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ChatMessage>(&text) {
                        Ok(message) => {
                            let outcomes = state.router.route(&message).await;
                            tracing::debug!(
                                user_id = %user_id,
                                receive_id = %message.receive_id,
                                ?outcomes,
                                "Routed inbound message"
                            );
                        }
                        Err(e) => {
                            // Malformed input is non-fatal; the connection stays open.
                            tracing::warn!(user_id = %user_id, error = %e, "Undecodable frame ignored");
                        }
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = handle.enqueue(Message::Pong(data));
                }
                Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Binary(_))) => {
                    tracing::debug!(user_id = %user_id, "Binary frame ignored (protocol is JSON text)");
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!(user_id = %user_id, reason = ?frame, "Client initiated close");
                    break;
                }
                Some(Err(e)) => {
                    tracing::warn!(user_id = %user_id, error = %e, "WebSocket receive error");
                    break;
                }
                None => {
                    tracing::info!(user_id = %user_id, "WebSocket stream ended");
                    break;
                }
            }
        }
    }

    tracing::debug!(user_id = %user_id, phase = ?Phase::Closing, "Connection closing");

    // Idempotent: a displaced or logged-out connection is already closed.
    handle.close(CLOSE_NORMAL, "closing");

    // Let the writer flush the close frame, then stop it.
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }

    // No-op if a newer registration already owns this user's entry.
    state.registry.unregister(&user_id, &handle);

    tracing::info!(user_id = %user_id, phase = ?Phase::Closed, "Connection closed");
}

/// Writer task: the single writer for the socket, draining the bounded
/// outbound channel. Exits after forwarding a close frame or on sink error.
async fn writer_task(
    mut ws_sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        let is_close = matches!(msg, Message::Close(_));
        if ws_sender.send(msg).await.is_err() {
            break;
        }
        if is_close {
            break;
        }
    }
}
