//! NATS broker adapter for cross-process delivery.
//!
//! A frame bound for a receiver with no local connection is published to a
//! subject keyed by that receiver's identity; every gateway process runs one
//! consumer that re-runs the local delivery path. The subject key preserves
//! per-receiver ordering across the hop. Delivery is at-least-once;
//! duplicates are absorbed downstream by session ids and persisted history,
//! never deduplicated here.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use thiserror::Error;

use crate::chat::router::{LocalSend, LocalSender};
use crate::ws::ConnectionRegistry;

/// Subject prefix for delivery hand-off; the receiver id is the last token.
pub const DELIVER_SUBJECT_PREFIX: &str = "courier.deliver";

/// JetStream stream capturing delivery subjects.
pub const DELIVER_STREAM: &str = "COURIER_DELIVER";

/// Retention for undelivered frames. The broker is a hand-off, not a durable
/// queue; persisted history is the record clients reconcile against.
const STREAM_MAX_AGE_SECS: u64 = 300;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("nats connect error: {0}")]
    Connect(String),
    #[error("nats publish error: {0}")]
    Publish(String),
    #[error("nats subscribe error: {0}")]
    Subscribe(String),
}

/// Cross-process hand-off capability the router depends on.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Publish a frame keyed by receiver identity; resolves on broker ack.
    async fn publish(&self, receiver_id: &str, frame: &str) -> Result<(), BrokerError>;
}

/// Wrapper around the NATS client with a JetStream context.
#[derive(Clone)]
pub struct NatsBroker {
    client: async_nats::Client,
    jetstream: async_nats::jetstream::Context,
}

impl NatsBroker {
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        tracing::info!("Connecting to NATS at {}", url);
        let client = async_nats::connect(url)
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;
        let jetstream = async_nats::jetstream::new(client.clone());
        Ok(Self { client, jetstream })
    }

    /// Create the delivery stream if missing.
    pub async fn ensure_stream(&self) -> Result<(), BrokerError> {
        self.jetstream
            .get_or_create_stream(async_nats::jetstream::stream::Config {
                name: DELIVER_STREAM.to_string(),
                subjects: vec![format!("{}.>", DELIVER_SUBJECT_PREFIX)],
                retention: async_nats::jetstream::stream::RetentionPolicy::Limits,
                max_age: Duration::from_secs(STREAM_MAX_AGE_SECS),
                storage: async_nats::jetstream::stream::StorageType::File,
                ..Default::default()
            })
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;
        tracing::info!("Stream '{}' ready", DELIVER_STREAM);
        Ok(())
    }

    pub fn subject_for(receiver_id: &str) -> String {
        format!("{}.{}", DELIVER_SUBJECT_PREFIX, receiver_id)
    }
}

fn receiver_from_subject(subject: &str) -> Option<&str> {
    subject
        .strip_prefix(DELIVER_SUBJECT_PREFIX)?
        .strip_prefix('.')
        .filter(|rest| !rest.is_empty() && !rest.contains('.'))
}

#[async_trait]
impl MessagePublisher for NatsBroker {
    async fn publish(&self, receiver_id: &str, frame: &str) -> Result<(), BrokerError> {
        let subject = Self::subject_for(receiver_id);
        self.jetstream
            .publish(subject, Bytes::copy_from_slice(frame.as_bytes()))
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;
        Ok(())
    }
}

/// Per-process consumer: every frame read from the topic goes through the
/// local delivery path. A frame whose receiver is not registered on this
/// process is dropped, not re-published: the cluster tracks no global
/// presence, and history reconciliation covers the miss.
pub async fn run_consumer(
    broker: NatsBroker,
    registry: Arc<ConnectionRegistry>,
) -> Result<(), BrokerError> {
    let pattern = format!("{}.>", DELIVER_SUBJECT_PREFIX);
    let mut subscriber = broker
        .client
        .subscribe(pattern.clone())
        .await
        .map_err(|e| BrokerError::Subscribe(e.to_string()))?;

    tracing::info!("Broker consumer subscribed to '{}'", pattern);

    while let Some(msg) = subscriber.next().await {
        deliver_frame(&registry, msg.subject.as_str(), &msg.payload);
    }

    tracing::warn!("Broker subscription ended");
    Ok(())
}

/// Local hand-off for one consumed frame.
fn deliver_frame(registry: &ConnectionRegistry, subject: &str, payload: &[u8]) {
    let Some(receiver) = receiver_from_subject(subject) else {
        tracing::warn!(subject = %subject, "Unroutable delivery subject");
        return;
    };
    let Ok(frame) = std::str::from_utf8(payload) else {
        tracing::warn!(subject = %subject, "Dropping non-UTF8 payload");
        return;
    };

    match registry.send_local(receiver, frame) {
        LocalSend::Enqueued => {
            tracing::debug!(receiver = %receiver, "Delivered broker frame locally");
        }
        LocalSend::Dropped => {
            tracing::warn!(receiver = %receiver, "Outbound buffer full, broker frame dropped");
        }
        LocalSend::NotConnected => {
            tracing::debug!(receiver = %receiver, "Receiver not on this process, frame dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::ConnectionHandle;
    use axum::extract::ws::Message;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn subject_round_trip() {
        let subject = NatsBroker::subject_for("U002");
        assert_eq!(subject, "courier.deliver.U002");
        assert_eq!(receiver_from_subject(&subject), Some("U002"));

        assert_eq!(receiver_from_subject("courier.deliver."), None);
        assert_eq!(receiver_from_subject("courier.other.U002"), None);
        assert_eq!(receiver_from_subject("courier.deliver.a.b"), None);
    }

    #[tokio::test]
    async fn consumed_frame_reaches_local_receiver() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::channel(8);
        let handle = Arc::new(ConnectionHandle::new(
            "U002".to_string(),
            tx,
            CancellationToken::new(),
        ));
        registry.register("U002", handle);

        deliver_frame(&registry, "courier.deliver.U002", b"{\"type\":1}");

        match rx.try_recv().unwrap() {
            Message::Text(text) => assert_eq!(text.as_str(), "{\"type\":1}"),
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn consumed_frame_for_absent_receiver_is_dropped() {
        let registry = ConnectionRegistry::new();
        // Must not panic, error, or re-publish.
        deliver_frame(&registry, "courier.deliver.U404", b"{\"type\":1}");
        assert_eq!(registry.connection_count(), 0);
    }
}
