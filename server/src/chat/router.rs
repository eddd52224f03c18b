//! Message routing and fan-out.
//!
//! Decides local delivery (receiver registered in this process's connection
//! registry) against remote delivery (publish to the broker for another
//! process to pick up). Delivery is best-effort; the message store is the
//! durable record a client reconciles against on reconnect.

use std::sync::Arc;

use crate::broker::MessagePublisher;
use crate::cache::{spawn_invalidate, ObjectCache};
use crate::chat::history;
use crate::chat::message::{ChatMessage, ReceiverKind};
use crate::store::{GroupDirectory, MessageStore};

/// Outcome of routing one unicast target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Enqueued onto a local connection's outbound channel.
    Delivered,
    /// Published to the broker keyed by receiver identity.
    QueuedRemote,
    /// No live connection reachable; history is the only record.
    DroppedOffline,
}

/// Result of enqueueing a frame onto a local connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalSend {
    Enqueued,
    /// Connection exists but its outbound buffer is full; the frame was
    /// dropped under the bounded-queue policy.
    Dropped,
    NotConnected,
}

/// Local delivery capability. The connection registry is the production
/// implementer; tests substitute fakes.
pub trait LocalSender: Send + Sync {
    /// Enqueue one serialized frame; must never block the caller.
    fn send_local(&self, user_id: &str, frame: &str) -> LocalSend;
}

pub struct MessageRouter {
    local: Arc<dyn LocalSender>,
    publisher: Option<Arc<dyn MessagePublisher>>,
    groups: Arc<dyn GroupDirectory>,
    messages: Arc<dyn MessageStore>,
    cache: Arc<dyn ObjectCache>,
}

impl MessageRouter {
    pub fn new(
        local: Arc<dyn LocalSender>,
        publisher: Option<Arc<dyn MessagePublisher>>,
        groups: Arc<dyn GroupDirectory>,
        messages: Arc<dyn MessageStore>,
        cache: Arc<dyn ObjectCache>,
    ) -> Self {
        Self {
            local,
            publisher,
            groups,
            messages,
            cache,
        }
    }

    /// Route one inbound message: persist it, then unicast or fan out.
    /// Group targets become one independent unicast per current member,
    /// each carrying the original frame. Returns one outcome per target.
    pub async fn route(&self, message: &ChatMessage) -> Vec<RouteOutcome> {
        self.persist(message).await;

        // Serialize once; every recipient gets the identical frame.
        let frame = match serde_json::to_string(message) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(error = %e, "Unserializable message dropped");
                return Vec::new();
            }
        };

        match message.receiver_kind() {
            ReceiverKind::User => {
                vec![self.route_unicast(&message.receive_id, &frame).await]
            }
            ReceiverKind::Group => {
                let members = match self.groups.members(&message.receive_id).await {
                    Ok(members) => members,
                    Err(e) => {
                        tracing::warn!(
                            group_id = %message.receive_id,
                            error = %e,
                            "Member lookup failed, group message persists in history only"
                        );
                        return Vec::new();
                    }
                };

                let mut outcomes = Vec::with_capacity(members.len());
                for member in &members {
                    outcomes.push(self.route_unicast(member, &frame).await);
                }
                outcomes
            }
        }
    }

    /// Unicast path: local enqueue, else broker hand-off keyed by receiver,
    /// else history-only. Never an error, never a block.
    async fn route_unicast(&self, receiver: &str, frame: &str) -> RouteOutcome {
        match self.local.send_local(receiver, frame) {
            LocalSend::Enqueued => RouteOutcome::Delivered,
            LocalSend::Dropped => {
                // Bounded-queue drop-new policy; the connection stays live.
                tracing::warn!(receiver = %receiver, "Outbound buffer full, frame dropped");
                RouteOutcome::Delivered
            }
            LocalSend::NotConnected => match &self.publisher {
                Some(publisher) => match publisher.publish(receiver, frame).await {
                    Ok(()) => RouteOutcome::QueuedRemote,
                    Err(e) => {
                        tracing::warn!(
                            receiver = %receiver,
                            error = %e,
                            "Broker publish failed, message persists in history only"
                        );
                        RouteOutcome::DroppedOffline
                    }
                },
                None => {
                    tracing::debug!(receiver = %receiver, "Receiver offline, history only");
                    RouteOutcome::DroppedOffline
                }
            },
        }
    }

    /// Durable record first; failures are logged, delivery continues.
    /// History caches for the conversation go stale on insert.
    async fn persist(&self, message: &ChatMessage) {
        if let Err(e) = self.messages.insert(message).await {
            tracing::warn!(error = %e, "Message persistence failed");
        }

        let pattern = match message.receiver_kind() {
            ReceiverKind::User => {
                history::direct_history_key(&message.send_id, &message.receive_id)
            }
            ReceiverKind::Group => history::group_history_key(&message.receive_id),
        };
        spawn_invalidate(self.cache.clone(), pattern);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerError;
    use crate::cache::CacheError;
    use crate::store::{StoreError, StoredMessage};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeLocal {
        /// user id -> delivered frames; only listed users count as local
        delivered: Mutex<HashMap<String, Vec<String>>>,
    }

    impl FakeLocal {
        fn connect(&self, user_id: &str) {
            self.delivered
                .lock()
                .unwrap()
                .insert(user_id.to_string(), Vec::new());
        }

        fn frames(&self, user_id: &str) -> Vec<String> {
            self.delivered
                .lock()
                .unwrap()
                .get(user_id)
                .cloned()
                .unwrap_or_default()
        }
    }

    impl LocalSender for FakeLocal {
        fn send_local(&self, user_id: &str, frame: &str) -> LocalSend {
            let mut delivered = self.delivered.lock().unwrap();
            match delivered.get_mut(user_id) {
                Some(frames) => {
                    frames.push(frame.to_string());
                    LocalSend::Enqueued
                }
                None => LocalSend::NotConnected,
            }
        }
    }

    #[derive(Default)]
    struct FakePublisher {
        published: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl MessagePublisher for FakePublisher {
        async fn publish(&self, receiver_id: &str, frame: &str) -> Result<(), BrokerError> {
            self.published
                .lock()
                .unwrap()
                .push((receiver_id.to_string(), frame.to_string()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeGroups {
        members: HashMap<String, Vec<String>>,
    }

    #[async_trait]
    impl GroupDirectory for FakeGroups {
        async fn members(&self, group_id: &str) -> Result<Vec<String>, StoreError> {
            Ok(self.members.get(group_id).cloned().unwrap_or_default())
        }

        async fn create_group(&self, _: &str, _: &str, _: &str) -> Result<(), StoreError> {
            unimplemented!("not exercised")
        }

        async fn add_member(&self, _: &str, _: &str) -> Result<(), StoreError> {
            unimplemented!("not exercised")
        }
    }

    #[derive(Default)]
    struct FakeStore {
        inserted: Mutex<Vec<ChatMessage>>,
    }

    #[async_trait]
    impl MessageStore for FakeStore {
        async fn insert(&self, message: &ChatMessage) -> Result<(), StoreError> {
            self.inserted.lock().unwrap().push(message.clone());
            Ok(())
        }

        async fn find_by_user_pair(
            &self,
            _: &str,
            _: &str,
            _: u32,
        ) -> Result<Vec<StoredMessage>, StoreError> {
            Ok(Vec::new())
        }

        async fn find_by_group(&self, _: &str, _: u32) -> Result<Vec<StoredMessage>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct FakeCache;

    #[async_trait]
    impl ObjectCache for FakeCache {
        async fn get_raw(&self, _: &str) -> Result<Option<String>, CacheError> {
            Ok(None)
        }

        async fn set_raw(&self, _: &str, _: &str, _: Duration) -> Result<(), CacheError> {
            Ok(())
        }

        async fn invalidate_pattern(&self, _: &str) -> Result<u64, CacheError> {
            Ok(0)
        }
    }

    fn text_message(send_id: &str, receive_id: &str, content: &str) -> ChatMessage {
        ChatMessage {
            session_id: Some("s1".to_string()),
            message_type: 1,
            content: Some(content.to_string()),
            url: None,
            send_id: send_id.to_string(),
            send_name: None,
            send_avatar: None,
            receive_id: receive_id.to_string(),
            file_size: None,
            file_type: None,
            file_name: None,
            av_data: None,
        }
    }

    struct Harness {
        local: Arc<FakeLocal>,
        publisher: Arc<FakePublisher>,
        store: Arc<FakeStore>,
        router: MessageRouter,
    }

    fn harness(groups: FakeGroups, with_publisher: bool) -> Harness {
        let local = Arc::new(FakeLocal::default());
        let publisher = Arc::new(FakePublisher::default());
        let store = Arc::new(FakeStore::default());
        let router = MessageRouter::new(
            local.clone(),
            if with_publisher {
                Some(publisher.clone() as Arc<dyn MessagePublisher>)
            } else {
                None
            },
            Arc::new(groups),
            store.clone(),
            Arc::new(FakeCache),
        );
        Harness {
            local,
            publisher,
            store,
            router,
        }
    }

    #[tokio::test]
    async fn local_receiver_gets_the_frame_verbatim() {
        let h = harness(FakeGroups::default(), true);
        h.local.connect("U002");

        let msg = text_message("U001", "U002", "hi");
        let outcomes = h.router.route(&msg).await;

        assert_eq!(outcomes, vec![RouteOutcome::Delivered]);
        let frames = h.local.frames("U002");
        assert_eq!(frames.len(), 1);
        let delivered: ChatMessage = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(delivered, msg);
        assert!(h.publisher.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_local_receiver_is_published_keyed_by_identity() {
        let h = harness(FakeGroups::default(), true);

        let msg = text_message("U001", "U002", "hi");
        let outcomes = h.router.route(&msg).await;

        assert_eq!(outcomes, vec![RouteOutcome::QueuedRemote]);
        let published = h.publisher.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "U002");
        let frame: ChatMessage = serde_json::from_str(&published[0].1).unwrap();
        assert_eq!(frame, msg);
    }

    #[tokio::test]
    async fn offline_receiver_is_history_only_without_error() {
        let h = harness(FakeGroups::default(), false);

        let msg = text_message("U001", "U002", "hi");
        let outcomes = h.router.route(&msg).await;

        assert_eq!(outcomes, vec![RouteOutcome::DroppedOffline]);
        // Persisted regardless of delivery
        assert_eq!(h.store.inserted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn group_message_fans_out_one_unicast_per_member() {
        let mut groups = FakeGroups::default();
        groups.members.insert(
            "G1".to_string(),
            vec!["U001".to_string(), "U002".to_string(), "U003".to_string()],
        );
        let h = harness(groups, true);
        // U002 is local; U001 (the sender) and U003 route through the broker
        h.local.connect("U002");

        let msg = text_message("U001", "G1", "hello group");
        let mut outcomes = h.router.route(&msg).await;

        outcomes.sort_by_key(|o| format!("{:?}", o));
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.contains(&RouteOutcome::Delivered));
        assert!(outcomes.contains(&RouteOutcome::QueuedRemote));

        // Delivered frames keep the group receive_id, not the member's.
        let frames = h.local.frames("U002");
        assert_eq!(frames.len(), 1);
        let delivered: ChatMessage = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(delivered.receive_id, "G1");

        // Fan-out persists the group message once.
        assert_eq!(h.store.inserted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn persistence_failure_does_not_stop_delivery() {
        struct FailingStore;

        #[async_trait]
        impl MessageStore for FailingStore {
            async fn insert(&self, _: &ChatMessage) -> Result<(), StoreError> {
                Err(StoreError::Database("disk full".to_string()))
            }

            async fn find_by_user_pair(
                &self,
                _: &str,
                _: &str,
                _: u32,
            ) -> Result<Vec<StoredMessage>, StoreError> {
                Ok(Vec::new())
            }

            async fn find_by_group(
                &self,
                _: &str,
                _: u32,
            ) -> Result<Vec<StoredMessage>, StoreError> {
                Ok(Vec::new())
            }
        }

        let local = Arc::new(FakeLocal::default());
        local.connect("U002");
        let router = MessageRouter::new(
            local.clone(),
            None,
            Arc::new(FakeGroups::default()),
            Arc::new(FailingStore),
            Arc::new(FakeCache),
        );

        let outcomes = router.route(&text_message("U001", "U002", "hi")).await;
        assert_eq!(outcomes, vec![RouteOutcome::Delivered]);
    }
}
