use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Text shown in place of a message that was deleted for everyone.
pub const TOMBSTONE_TEXT: &str = "This message was deleted";

/// Upper bound on text content, counted in characters.
pub const MAX_CONTENT_CHARS: usize = 4000;

/// Public profile fields used to enrich conversation lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: Uuid,
    pub username: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

impl UserProfile {
    /// Placeholder for a participant whose profile was never synced.
    pub fn unknown(id: Uuid) -> Self {
        Self {
            id,
            username: "unknown".to_string(),
            display_name: None,
            avatar_url: None,
        }
    }
}

/// A one-to-one thread. Participants are stored sorted so that the pair key
/// is the same regardless of who started the chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub participants: [Uuid; 2],
    pub last_message_id: Option<Uuid>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub pinned_message_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    /// Canonical key for an unordered participant pair.
    pub fn pair_key(a: Uuid, b: Uuid) -> String {
        let [low, high] = Self::sorted_pair(a, b);
        format!("{}:{}", low, high)
    }

    pub fn sorted_pair(a: Uuid, b: Uuid) -> [Uuid; 2] {
        if a <= b { [a, b] } else { [b, a] }
    }

    pub fn is_participant(&self, user_id: Uuid) -> bool {
        self.participants.contains(&user_id)
    }

    /// The participant that is not `user_id`, or `None` if `user_id` is not in the thread.
    pub fn other_participant(&self, user_id: Uuid) -> Option<Uuid> {
        match self.participants {
            [a, b] if a == user_id => Some(b),
            [a, b] if b == user_id => Some(a),
            _ => None,
        }
    }
}

/// What a message carries. Exactly one kind is present, so a message with
/// neither text nor attachment cannot be built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageBody {
    Text {
        content: String,
    },
    Image {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<String>,
    },
    File {
        url: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BodyError {
    #[error("message needs text, an image or a file")]
    Empty,
    #[error("message may carry only one of text, image or file")]
    Ambiguous,
    #[error("message text exceeds {MAX_CONTENT_CHARS} characters")]
    TooLong,
    #[error("file attachments need a file name")]
    MissingFileName,
}

/// Loose client-side shape of a message payload, before validation.
#[derive(Debug, Clone, Default)]
pub struct BodyParts {
    pub content: Option<String>,
    pub image_url: Option<String>,
    pub image_key: Option<String>,
    pub file_url: Option<String>,
    pub file_key: Option<String>,
    pub file_name: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl MessageBody {
    pub fn from_parts(parts: BodyParts) -> Result<Self, BodyError> {
        let content = non_empty(parts.content);
        let image_url = non_empty(parts.image_url);
        let file_url = non_empty(parts.file_url);

        let present = [content.is_some(), image_url.is_some(), file_url.is_some()]
            .iter()
            .filter(|p| **p)
            .count();
        if present == 0 {
            return Err(BodyError::Empty);
        }
        if present > 1 {
            return Err(BodyError::Ambiguous);
        }

        if let Some(content) = content {
            return Self::text(content);
        }
        if let Some(url) = image_url {
            return Ok(Self::Image {
                url,
                key: non_empty(parts.image_key),
            });
        }
        match (file_url, non_empty(parts.file_name)) {
            (Some(url), Some(name)) => Ok(Self::File {
                url,
                name,
                key: non_empty(parts.file_key),
            }),
            _ => Err(BodyError::MissingFileName),
        }
    }

    /// Validated text body. Surrounding whitespace is trimmed.
    pub fn text(content: impl Into<String>) -> Result<Self, BodyError> {
        let content = content.into().trim().to_string();
        if content.is_empty() {
            return Err(BodyError::Empty);
        }
        if content.chars().count() > MAX_CONTENT_CHARS {
            return Err(BodyError::TooLong);
        }
        Ok(Self::Text { content })
    }

    pub fn tombstone() -> Self {
        Self::Text {
            content: TOMBSTONE_TEXT.to_string(),
        }
    }

    /// Short human-readable form used in reply quotes and chat lists.
    pub fn preview(&self) -> String {
        match self {
            Self::Text { content } => content.clone(),
            Self::Image { .. } => "📷 Photo".to_string(),
            Self::File { name, .. } => format!("📎 {}", name),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Image { .. } => "image",
            Self::File { .. } => "file",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub emoji: String,
    pub user_id: Uuid,
}

/// Copy of the quoted message taken when the reply was sent. Later edits or
/// deletes of the original never change it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplySnapshot {
    pub id: Uuid,
    pub content: String,
    pub sender_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub body: MessageBody,
    pub reply_to: Option<ReplySnapshot>,
    pub reactions: Vec<Reaction>,
    pub read_by: Vec<Uuid>,
    pub edited: bool,
    pub deleted_for_everyone: bool,
    pub pinned: bool,
}

impl Message {
    pub fn snapshot(&self) -> ReplySnapshot {
        let content = if self.deleted_for_everyone {
            TOMBSTONE_TEXT.to_string()
        } else {
            self.body.preview()
        };
        ReplySnapshot {
            id: self.id,
            content,
            sender_id: self.sender_id,
        }
    }

    pub fn has_reaction(&self, user_id: Uuid, emoji: &str) -> bool {
        self.reactions
            .iter()
            .any(|r| r.user_id == user_id && r.emoji == emoji)
    }
}

// -- Notifications --

/// Closed set of notification kinds accepted by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Fulfillment,
    Featured,
    Milestone,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown notification type '{0}'")]
pub struct UnknownNotificationKind(pub String);

impl NotificationKind {
    pub const ALL: [NotificationKind; 4] = [
        Self::Fulfillment,
        Self::Featured,
        Self::Milestone,
        Self::System,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fulfillment => "fulfillment",
            Self::Featured => "featured",
            Self::Milestone => "milestone",
            Self::System => "system",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationKind {
    type Err = UnknownNotificationKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownNotificationKind(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub recipient_id: Uuid,
    pub actor_id: Option<Uuid>,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub message: String,
    pub link: Option<String>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_key_ignores_argument_order() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(Conversation::pair_key(a, b), Conversation::pair_key(b, a));
    }

    #[test]
    fn body_requires_exactly_one_kind() {
        assert_eq!(
            MessageBody::from_parts(BodyParts::default()),
            Err(BodyError::Empty)
        );
        assert_eq!(
            MessageBody::from_parts(BodyParts {
                content: Some("   ".into()),
                ..Default::default()
            }),
            Err(BodyError::Empty)
        );
        assert_eq!(
            MessageBody::from_parts(BodyParts {
                content: Some("hi".into()),
                image_url: Some("https://cdn/x.png".into()),
                ..Default::default()
            }),
            Err(BodyError::Ambiguous)
        );
        assert_eq!(
            MessageBody::from_parts(BodyParts {
                file_url: Some("https://cdn/notes.pdf".into()),
                ..Default::default()
            }),
            Err(BodyError::MissingFileName)
        );

        let body = MessageBody::from_parts(BodyParts {
            file_url: Some("https://cdn/notes.pdf".into()),
            file_name: Some("notes.pdf".into()),
            file_key: Some("uploads/notes.pdf".into()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(body.kind(), "file");
        assert_eq!(body.preview(), "📎 notes.pdf");
    }

    #[test]
    fn text_is_trimmed_and_bounded() {
        assert_eq!(
            MessageBody::text("  Hi  ").unwrap(),
            MessageBody::Text { content: "Hi".into() }
        );
        let long = "x".repeat(MAX_CONTENT_CHARS + 1);
        assert_eq!(MessageBody::text(long), Err(BodyError::TooLong));
    }

    #[test]
    fn body_serializes_with_kind_tag() {
        let json = serde_json::to_value(MessageBody::Image {
            url: "https://cdn/a.png".into(),
            key: None,
        })
        .unwrap();
        assert_eq!(json["kind"], "image");
        assert_eq!(json["url"], "https://cdn/a.png");
        assert!(json.get("key").is_none());
    }

    #[test]
    fn notification_kind_is_a_closed_set() {
        assert_eq!(
            "fulfillment".parse::<NotificationKind>().unwrap(),
            NotificationKind::Fulfillment
        );
        assert!("review".parse::<NotificationKind>().is_err());
        assert!("System".parse::<NotificationKind>().is_err());
        assert!(serde_json::from_str::<NotificationKind>("\"promo\"").is_err());
    }

    #[test]
    fn other_participant_rejects_outsiders() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let conv = Conversation {
            id: Uuid::new_v4(),
            participants: Conversation::sorted_pair(a, b),
            last_message_id: None,
            last_message_at: None,
            pinned_message_id: None,
            created_at: Utc::now(),
        };
        assert_eq!(conv.other_participant(a), Some(b));
        assert_eq!(conv.other_participant(b), Some(a));
        assert_eq!(conv.other_participant(Uuid::new_v4()), None);
    }
}
