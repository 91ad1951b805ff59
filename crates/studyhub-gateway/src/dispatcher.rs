use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::broadcast;
use tracing::{debug, error, trace};
use uuid::Uuid;

use studyhub_types::events::{ChannelKey, Envelope, FanoutEvent};

use crate::error::DeliveryError;

/// A published event, serialized once and shared by every receiver.
#[derive(Debug, Clone)]
pub struct BroadcastMessage {
    pub channel: ChannelKey,
    pub kind: &'static str,
    pub json: Arc<str>,
}

/// Channel set of one connection, shared between its send/recv tasks and the
/// dispatcher (which counts subscribers from it).
#[derive(Debug, Clone, Default)]
pub struct Subscriptions(Arc<RwLock<HashSet<ChannelKey>>>);

impl Subscriptions {
    fn for_user(user_id: Uuid) -> Self {
        let subs = Self::default();
        subs.write().insert(ChannelKey::User(user_id));
        subs
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashSet<ChannelKey>> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashSet<ChannelKey>> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn contains(&self, channel: &ChannelKey) -> bool {
        self.read().contains(channel)
    }

    /// Replace every conversation channel; user channels are left alone.
    pub fn replace_conversations(&self, conversation_ids: &[Uuid]) {
        let mut subs = self.write();
        subs.retain(|key| matches!(key, ChannelKey::User(_)));
        subs.extend(conversation_ids.iter().map(|id| ChannelKey::Conversation(*id)));
    }

    pub fn remove_conversations(&self, conversation_ids: &[Uuid]) {
        let mut subs = self.write();
        for id in conversation_ids {
            subs.remove(&ChannelKey::Conversation(*id));
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

/// One live client connection as seen by its own tasks.
pub struct ConnectionHandle {
    pub conn_id: Uuid,
    pub user_id: Uuid,
    pub subscriptions: Subscriptions,
    receiver: broadcast::Receiver<BroadcastMessage>,
}

impl ConnectionHandle {
    /// Next message on a channel this connection is subscribed to. Messages
    /// for other channels are skipped. Cancel-safe.
    pub async fn recv(&mut self) -> Result<BroadcastMessage, broadcast::error::RecvError> {
        loop {
            let msg = self.receiver.recv().await?;
            if self.subscriptions.contains(&msg.channel) {
                return Ok(msg);
            }
        }
    }
}

struct ConnectionEntry {
    user_id: Uuid,
    subscriptions: Subscriptions,
}

/// Fans events out to connected clients. Presence is whatever connections
/// are registered right now; nothing here is persisted.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Every connection receives every message and filters by its subscriptions
    broadcast_tx: broadcast::Sender<BroadcastMessage>,

    /// conn_id -> owner and subscriptions
    connections: RwLock<HashMap<Uuid, ConnectionEntry>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BUFFER)
    }
}

impl Dispatcher {
    pub const DEFAULT_BUFFER: usize = 1024;

    pub fn new(buffer: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(buffer.max(1));
        Self {
            inner: Arc::new(DispatcherInner {
                broadcast_tx,
                connections: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Register a connection. It starts out subscribed to its own user channel.
    pub fn register_connection(&self, user_id: Uuid) -> ConnectionHandle {
        let conn_id = Uuid::new_v4();
        let subscriptions = Subscriptions::for_user(user_id);
        // Subscribe before the entry becomes visible so no counted subscriber misses events
        let receiver = self.inner.broadcast_tx.subscribe();

        self.inner
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                conn_id,
                ConnectionEntry {
                    user_id,
                    subscriptions: subscriptions.clone(),
                },
            );

        ConnectionHandle {
            conn_id,
            user_id,
            subscriptions,
            receiver,
        }
    }

    pub fn unregister_connection(&self, conn_id: Uuid) {
        self.inner
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&conn_id);
    }

    /// Fire-and-forget publish. Failures are logged and dropped; clients
    /// reconcile through the persisted read path.
    pub fn publish(&self, channel: ChannelKey, event: FanoutEvent) {
        match self.try_publish(channel, event) {
            Ok(receivers) => trace!("Published to {} ({} connections)", channel, receivers),
            Err(e @ DeliveryError::NoSubscribers(_)) => debug!("Dropping event: {}", e),
            Err(e) => error!("Dropping event: {}", e),
        }
    }

    /// Publish the same event on several channels (e.g. both participants' user channels).
    pub fn publish_all(&self, channels: impl IntoIterator<Item = ChannelKey>, event: FanoutEvent) {
        for channel in channels {
            self.publish(channel, event.clone());
        }
    }

    /// Publish and report how many connections were subscribed.
    pub fn try_publish(&self, channel: ChannelKey, event: FanoutEvent) -> Result<usize, DeliveryError> {
        let subscribers = self.subscriber_count(channel);
        if subscribers == 0 {
            return Err(DeliveryError::NoSubscribers(channel.to_string()));
        }

        let kind = event.kind();
        let json = encode(event)?;
        self.inner
            .broadcast_tx
            .send(BroadcastMessage {
                channel,
                kind,
                json: json.into(),
            })
            .map_err(|_| DeliveryError::NoSubscribers(channel.to_string()))?;

        Ok(subscribers)
    }

    pub fn subscriber_count(&self, channel: ChannelKey) -> usize {
        self.inner
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|entry| entry.subscriptions.contains(&channel))
            .count()
    }

    pub fn connection_count(&self, user_id: Uuid) -> usize {
        self.inner
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|entry| entry.user_id == user_id)
            .count()
    }

    pub fn is_online(&self, user_id: Uuid) -> bool {
        self.connection_count(user_id) > 0
    }

    pub fn online_users(&self) -> Vec<Uuid> {
        let connections = self
            .inner
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let users: HashSet<Uuid> = connections.values().map(|entry| entry.user_id).collect();
        users.into_iter().collect()
    }
}

/// Serialize an event into its wire envelope.
pub fn encode(event: FanoutEvent) -> Result<String, DeliveryError> {
    let kind = event.kind();
    serde_json::to_string(&Envelope::new(event)).map_err(|source| DeliveryError::Encode { kind, source })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_event(conversation_id: Uuid, n: usize) -> FanoutEvent {
        FanoutEvent::MessagesRead {
            conversation_id,
            user_id: Uuid::nil(),
            message_ids: vec![Uuid::from_u128(n as u128)],
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_reports_delivery_error() {
        let dispatcher = Dispatcher::new(16);
        let result = dispatcher.try_publish(
            ChannelKey::User(Uuid::new_v4()),
            FanoutEvent::NotificationsChanged { unread_count: 1 },
        );
        assert!(matches!(result, Err(DeliveryError::NoSubscribers(_))));

        // The fire-and-forget form swallows it
        dispatcher.publish(
            ChannelKey::User(Uuid::new_v4()),
            FanoutEvent::NotificationsChanged { unread_count: 1 },
        );
    }

    #[tokio::test]
    async fn user_channel_reaches_every_connection_of_that_user() {
        let dispatcher = Dispatcher::new(16);
        let user = Uuid::new_v4();
        let mut phone = dispatcher.register_connection(user);
        let mut laptop = dispatcher.register_connection(user);
        let mut stranger = dispatcher.register_connection(Uuid::new_v4());

        let delivered = dispatcher
            .try_publish(ChannelKey::User(user), FanoutEvent::NotificationsChanged { unread_count: 2 })
            .unwrap();
        assert_eq!(delivered, 2);

        for handle in [&mut phone, &mut laptop] {
            let msg = handle.recv().await.unwrap();
            assert_eq!(msg.kind, "notifications_changed");
            let json: serde_json::Value = serde_json::from_str(&msg.json).unwrap();
            assert_eq!(json["payload"]["unread_count"], 2);
        }

        let nothing =
            tokio::time::timeout(std::time::Duration::from_millis(50), stranger.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn conversation_events_arrive_in_publish_order() {
        let dispatcher = Dispatcher::new(16);
        let conversation = Uuid::new_v4();
        let mut handle = dispatcher.register_connection(Uuid::new_v4());
        handle.subscriptions.replace_conversations(&[conversation]);

        // Interleave an event for another conversation that must be skipped
        let other = Uuid::new_v4();
        let mut other_handle = dispatcher.register_connection(Uuid::new_v4());
        other_handle.subscriptions.replace_conversations(&[other]);

        for n in 0..3 {
            dispatcher.publish(ChannelKey::Conversation(conversation), read_event(conversation, n));
            dispatcher.publish(ChannelKey::Conversation(other), read_event(other, n));
        }

        for n in 0..3 {
            let msg = handle.recv().await.unwrap();
            assert_eq!(msg.channel, ChannelKey::Conversation(conversation));
            let json: serde_json::Value = serde_json::from_str(&msg.json).unwrap();
            assert_eq!(
                json["payload"]["message_ids"][0],
                Uuid::from_u128(n as u128).to_string()
            );
        }
        assert_eq!(other_handle.recv().await.unwrap().channel, ChannelKey::Conversation(other));
    }

    #[tokio::test]
    async fn replacing_subscriptions_keeps_the_user_channel() {
        let dispatcher = Dispatcher::new(16);
        let user = Uuid::new_v4();
        let handle = dispatcher.register_connection(user);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        handle.subscriptions.replace_conversations(&[a, b]);
        assert_eq!(handle.subscriptions.len(), 3);
        handle.subscriptions.replace_conversations(&[b]);
        assert!(!handle.subscriptions.contains(&ChannelKey::Conversation(a)));
        assert!(handle.subscriptions.contains(&ChannelKey::User(user)));

        handle.subscriptions.remove_conversations(&[b]);
        assert_eq!(handle.subscriptions.len(), 1);
        assert_eq!(dispatcher.subscriber_count(ChannelKey::Conversation(b)), 0);
    }

    #[tokio::test]
    async fn presence_follows_live_connections() {
        let dispatcher = Dispatcher::new(16);
        let user = Uuid::new_v4();
        assert!(!dispatcher.is_online(user));

        let first = dispatcher.register_connection(user);
        let second = dispatcher.register_connection(user);
        assert_eq!(dispatcher.connection_count(user), 2);
        assert_eq!(dispatcher.online_users(), vec![user]);

        dispatcher.unregister_connection(first.conn_id);
        assert!(dispatcher.is_online(user));
        dispatcher.unregister_connection(second.conn_id);
        assert!(!dispatcher.is_online(user));
    }

    #[tokio::test]
    async fn slow_subscriber_sees_lag() {
        let dispatcher = Dispatcher::new(2);
        let user = Uuid::new_v4();
        let mut handle = dispatcher.register_connection(user);

        for n in 0..5 {
            dispatcher.publish(ChannelKey::User(user), FanoutEvent::NotificationsChanged { unread_count: n });
        }

        assert!(matches!(
            handle.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }
}
