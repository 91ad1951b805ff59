use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{
    BodyParts, Conversation, Message, MessageBody, Notification, ReplySnapshot, UserProfile,
};

// -- JWT Claims --

/// Claims issued by the external identity provider. Shared by the REST
/// middleware and the gateway upgrade so both trust the same `sub`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    #[serde(default)]
    pub moderator: bool,
    pub exp: usize,
}

// -- Conversations --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StartConversationRequest {
    pub participant_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationResponse {
    pub id: Uuid,
    pub participants: [Uuid; 2],
    pub last_message_id: Option<Uuid>,
    pub pinned_message_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl From<Conversation> for ConversationResponse {
    fn from(conversation: Conversation) -> Self {
        Self {
            id: conversation.id,
            participants: conversation.participants,
            last_message_id: conversation.last_message_id,
            pinned_message_id: conversation.pinned_message_id,
            created_at: conversation.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastMessagePreview {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub preview: String,
    pub deleted_for_everyone: bool,
    pub created_at: DateTime<Utc>,
}

/// One row of a user's chat list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: Uuid,
    pub participant: UserProfile,
    pub last_message: Option<LastMessagePreview>,
    pub last_activity_at: DateTime<Utc>,
    pub pinned_message_id: Option<Uuid>,
    pub unread_count: u64,
}

// -- Messages --

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub content: Option<String>,
    pub image_url: Option<String>,
    pub image_key: Option<String>,
    pub file_url: Option<String>,
    pub file_key: Option<String>,
    pub file_name: Option<String>,
    pub reply_to: Option<Uuid>,
}

impl SendMessageRequest {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn body_parts(&self) -> BodyParts {
        BodyParts {
            content: self.content.clone(),
            image_url: self.image_url.clone(),
            image_key: self.image_key.clone(),
            file_url: self.file_url.clone(),
            file_key: self.file_key.clone(),
            file_name: self.file_name.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EditMessageRequest {
    pub content: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MarkAllReadRequest {
    pub up_to: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PinMessageRequest {
    pub message_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionGroup {
    pub emoji: String,
    pub count: usize,
    pub user_ids: Vec<Uuid>,
}

/// Presentation form of a message. Tombstoned messages keep their slot but
/// expose neither reactions nor read receipts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub body: MessageBody,
    pub reply_to: Option<ReplySnapshot>,
    pub reactions: Vec<ReactionGroup>,
    pub read_by: Vec<Uuid>,
    pub edited: bool,
    pub deleted_for_everyone: bool,
    pub pinned: bool,
}

impl From<Message> for MessageResponse {
    fn from(message: Message) -> Self {
        if message.deleted_for_everyone {
            return Self {
                id: message.id,
                conversation_id: message.conversation_id,
                sender_id: message.sender_id,
                created_at: message.created_at,
                body: MessageBody::tombstone(),
                reply_to: None,
                reactions: vec![],
                read_by: vec![],
                edited: false,
                deleted_for_everyone: true,
                pinned: false,
            };
        }

        // Group by emoji; BTreeMap keeps the output order stable
        let mut groups: BTreeMap<String, Vec<Uuid>> = BTreeMap::new();
        for reaction in message.reactions {
            groups.entry(reaction.emoji).or_default().push(reaction.user_id);
        }
        let reactions = groups
            .into_iter()
            .map(|(emoji, user_ids)| ReactionGroup {
                emoji,
                count: user_ids.len(),
                user_ids,
            })
            .collect();

        Self {
            id: message.id,
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            created_at: message.created_at,
            body: message.body,
            reply_to: message.reply_to,
            reactions,
            read_by: message.read_by,
            edited: message.edited,
            deleted_for_everyone: false,
            pinned: message.pinned,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePage {
    pub conversation_id: Uuid,
    /// Oldest first within the page.
    pub messages: Vec<MessageResponse>,
    /// Pass as `before` to fetch the next older page. `None` when exhausted.
    pub next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MessagePageQuery {
    pub before: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToggleReactionRequest {
    pub emoji: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ToggleReactionResponse {
    pub added: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReadReceiptResponse {
    pub message_id: Uuid,
    pub read_by: Vec<Uuid>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MarkAllReadResponse {
    pub marked: usize,
}

// -- Notifications --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmitNotificationRequest {
    pub recipient_id: Uuid,
    pub actor_id: Option<Uuid>,
    /// Must name one of the closed notification kinds.
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub link: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct NotificationQuery {
    pub limit: Option<u32>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NotificationPage {
    pub items: Vec<Notification>,
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
    pub has_more: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UnreadCountResponse {
    pub unread_count: u64,
}

// -- Users --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateProfileRequest {
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PresenceResponse {
    pub user_id: Uuid,
    pub online: bool,
    pub connections: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OnlineUsersResponse {
    pub user_ids: Vec<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Reaction, TOMBSTONE_TEXT};

    fn sample(deleted: bool) -> Message {
        let sender = Uuid::new_v4();
        let reader = Uuid::new_v4();
        Message {
            id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            sender_id: sender,
            created_at: Utc::now(),
            body: MessageBody::Text { content: "Hi".into() },
            reply_to: None,
            reactions: vec![
                Reaction { emoji: "👍".into(), user_id: reader },
                Reaction { emoji: "👍".into(), user_id: sender },
                Reaction { emoji: "🎉".into(), user_id: reader },
            ],
            read_by: vec![reader],
            edited: false,
            deleted_for_everyone: deleted,
            pinned: false,
        }
    }

    #[test]
    fn reactions_are_grouped_by_emoji() {
        let response = MessageResponse::from(sample(false));
        assert_eq!(response.reactions.len(), 2);
        let thumbs = response.reactions.iter().find(|g| g.emoji == "👍").unwrap();
        assert_eq!(thumbs.count, 2);
        assert_eq!(response.read_by.len(), 1);
    }

    #[test]
    fn tombstones_hide_audit_state() {
        let response = MessageResponse::from(sample(true));
        assert!(response.deleted_for_everyone);
        assert_eq!(response.body, MessageBody::Text { content: TOMBSTONE_TEXT.into() });
        assert!(response.reactions.is_empty());
        assert!(response.read_by.is_empty());
    }
}
