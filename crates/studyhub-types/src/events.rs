use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::MessageResponse;
use crate::models::Notification;

/// Fan-out channel a client can be subscribed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKey {
    /// Live events of one thread; only its participants may subscribe.
    Conversation(Uuid),
    /// Hints for one user's chat list and notification badge.
    User(Uuid),
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conversation(id) => write!(f, "conversation:{}", id),
            Self::User(id) => write!(f, "user:{}", id),
        }
    }
}

/// Events delivered to subscribers. Mutations carry only the delta, never
/// the full message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum FanoutEvent {
    /// Sent once per connection after the upgrade is accepted
    Ready { user_id: Uuid, username: String },

    MessageCreated { message: MessageResponse },

    ReactionAdded {
        conversation_id: Uuid,
        message_id: Uuid,
        user_id: Uuid,
        emoji: String,
    },

    ReactionRemoved {
        conversation_id: Uuid,
        message_id: Uuid,
        user_id: Uuid,
        emoji: String,
    },

    MessageEdited {
        conversation_id: Uuid,
        message_id: Uuid,
        content: String,
    },

    MessageDeleted {
        conversation_id: Uuid,
        message_id: Uuid,
    },

    MessagesRead {
        conversation_id: Uuid,
        user_id: Uuid,
        message_ids: Vec<Uuid>,
    },

    MessagePinned {
        conversation_id: Uuid,
        message_id: Uuid,
        previous_message_id: Option<Uuid>,
        pinned_by: Uuid,
    },

    MessageUnpinned {
        conversation_id: Uuid,
        message_id: Uuid,
    },

    Typing {
        conversation_id: Uuid,
        user_id: Uuid,
        username: String,
    },

    /// Chat-list refresh hint for the user channel
    ConversationUpdated {
        conversation_id: Uuid,
        last_message_id: Option<Uuid>,
    },

    ConversationDeleted {
        conversation_id: Uuid,
        deleted_by: Uuid,
    },

    NotificationCreated {
        notification: Notification,
        unread_count: u64,
    },

    NotificationsChanged { unread_count: u64 },

    /// The subscriber missed events and must re-read persisted state
    Resync { reason: String },
}

impl FanoutEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "ready",
            Self::MessageCreated { .. } => "message_created",
            Self::ReactionAdded { .. } => "reaction_added",
            Self::ReactionRemoved { .. } => "reaction_removed",
            Self::MessageEdited { .. } => "message_edited",
            Self::MessageDeleted { .. } => "message_deleted",
            Self::MessagesRead { .. } => "messages_read",
            Self::MessagePinned { .. } => "message_pinned",
            Self::MessageUnpinned { .. } => "message_unpinned",
            Self::Typing { .. } => "typing",
            Self::ConversationUpdated { .. } => "conversation_updated",
            Self::ConversationDeleted { .. } => "conversation_deleted",
            Self::NotificationCreated { .. } => "notification_created",
            Self::NotificationsChanged { .. } => "notifications_changed",
            Self::Resync { .. } => "resync",
        }
    }
}

/// Wire envelope: `{ "type": ..., "payload": ..., "ts": ... }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub event: FanoutEvent,
    pub ts: DateTime<Utc>,
}

impl Envelope {
    pub fn new(event: FanoutEvent) -> Self {
        Self {
            event,
            ts: Utc::now(),
        }
    }
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Replace this connection's conversation subscriptions. The user channel
    /// stays subscribed regardless.
    Subscribe { conversation_ids: Vec<Uuid> },

    Unsubscribe { conversation_ids: Vec<Uuid> },

    StartTyping { conversation_id: Uuid },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_keys_render_with_scope_prefix() {
        let id = Uuid::nil();
        assert_eq!(
            ChannelKey::Conversation(id).to_string(),
            "conversation:00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(
            ChannelKey::User(id).to_string(),
            "user:00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn envelope_has_type_payload_and_ts() {
        let event = FanoutEvent::NotificationsChanged { unread_count: 3 };
        let kind = event.kind();
        let json = serde_json::to_value(Envelope::new(event)).unwrap();
        assert_eq!(json["type"], kind);
        assert_eq!(json["payload"]["unread_count"], 3);
        assert!(json["ts"].is_string());
    }

    #[test]
    fn commands_parse_from_client_json() {
        let id = Uuid::new_v4();
        let raw = format!(r#"{{"type":"StartTyping","data":{{"conversation_id":"{}"}}}}"#, id);
        match serde_json::from_str::<GatewayCommand>(&raw).unwrap() {
            GatewayCommand::StartTyping { conversation_id } => assert_eq!(conversation_id, id),
            other => panic!("unexpected command {:?}", other),
        }
    }
}
