//! Database row types and column helpers. Rows are converted into the
//! studyhub-types domain models before they leave this crate.
use chrono::{DateTime, Utc};
use rusqlite::Row;
use rusqlite::types::Type;
use studyhub_types::models::{Message, MessageBody, Reaction, ReplySnapshot};
use tracing::warn;
use uuid::Uuid;

pub(crate) const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, created_at, body_kind, \
     content, image_url, image_key, file_url, file_key, file_name, \
     reply_to_id, reply_to_content, reply_to_sender, edited, deleted_for_everyone, pinned";

pub(crate) const CONVERSATION_COLUMNS: &str =
    "id, user_a, user_b, last_message_id, last_message_at, pinned_message_id, created_at";

pub(crate) const NOTIFICATION_COLUMNS: &str =
    "id, recipient_id, actor_id, kind, message, link, is_read, created_at";

pub fn datetime_to_micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

pub fn micros_to_datetime(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_else(|| {
        warn!("Corrupt timestamp {} in store", micros);
        DateTime::default()
    })
}

pub(crate) fn uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn opt_uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        s.parse()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

/// Flattened storage form of a `MessageBody`.
#[derive(Debug, Default)]
pub(crate) struct BodyColumns {
    pub kind: &'static str,
    pub content: Option<String>,
    pub image_url: Option<String>,
    pub image_key: Option<String>,
    pub file_url: Option<String>,
    pub file_key: Option<String>,
    pub file_name: Option<String>,
}

impl From<&MessageBody> for BodyColumns {
    fn from(body: &MessageBody) -> Self {
        match body {
            MessageBody::Text { content } => Self {
                kind: "text",
                content: Some(content.clone()),
                ..Default::default()
            },
            MessageBody::Image { url, key } => Self {
                kind: "image",
                image_url: Some(url.clone()),
                image_key: key.clone(),
                ..Default::default()
            },
            MessageBody::File { url, name, key } => Self {
                kind: "file",
                file_url: Some(url.clone()),
                file_name: Some(name.clone()),
                file_key: key.clone(),
                ..Default::default()
            },
        }
    }
}

pub struct MessageRow {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub created_at: i64,
    pub body_kind: String,
    pub content: Option<String>,
    pub image_url: Option<String>,
    pub image_key: Option<String>,
    pub file_url: Option<String>,
    pub file_key: Option<String>,
    pub file_name: Option<String>,
    pub reply_to_id: Option<Uuid>,
    pub reply_to_content: Option<String>,
    pub reply_to_sender: Option<Uuid>,
    pub edited: bool,
    pub deleted_for_everyone: bool,
    pub pinned: bool,
}

impl MessageRow {
    /// Maps a row selected with `MESSAGE_COLUMNS`.
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: uuid_at(row, 0)?,
            conversation_id: uuid_at(row, 1)?,
            sender_id: uuid_at(row, 2)?,
            created_at: row.get(3)?,
            body_kind: row.get(4)?,
            content: row.get(5)?,
            image_url: row.get(6)?,
            image_key: row.get(7)?,
            file_url: row.get(8)?,
            file_key: row.get(9)?,
            file_name: row.get(10)?,
            reply_to_id: opt_uuid_at(row, 11)?,
            reply_to_content: row.get(12)?,
            reply_to_sender: opt_uuid_at(row, 13)?,
            edited: row.get(14)?,
            deleted_for_everyone: row.get(15)?,
            pinned: row.get(16)?,
        })
    }

    pub fn body(&self) -> MessageBody {
        body_from_columns(
            &self.id,
            &self.body_kind,
            self.content.clone(),
            self.image_url.clone(),
            self.image_key.clone(),
            self.file_url.clone(),
            self.file_key.clone(),
            self.file_name.clone(),
        )
    }

    pub fn into_message(self, reactions: Vec<Reaction>, read_by: Vec<Uuid>) -> Message {
        let body = self.body();
        let reply_to = match (self.reply_to_id, self.reply_to_sender) {
            (Some(id), Some(sender_id)) => Some(ReplySnapshot {
                id,
                content: self.reply_to_content.unwrap_or_default(),
                sender_id,
            }),
            _ => None,
        };

        Message {
            id: self.id,
            conversation_id: self.conversation_id,
            sender_id: self.sender_id,
            created_at: micros_to_datetime(self.created_at),
            body,
            reply_to,
            reactions,
            read_by,
            edited: self.edited,
            deleted_for_everyone: self.deleted_for_everyone,
            pinned: self.pinned,
        }
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn body_from_columns(
    message_id: &Uuid,
    kind: &str,
    content: Option<String>,
    image_url: Option<String>,
    image_key: Option<String>,
    file_url: Option<String>,
    file_key: Option<String>,
    file_name: Option<String>,
) -> MessageBody {
    match kind {
        "image" => MessageBody::Image {
            url: image_url.unwrap_or_else(|| {
                warn!("Image message '{}' has no url", message_id);
                String::new()
            }),
            key: image_key,
        },
        "file" => MessageBody::File {
            url: file_url.unwrap_or_else(|| {
                warn!("File message '{}' has no url", message_id);
                String::new()
            }),
            name: file_name.unwrap_or_else(|| "file".to_string()),
            key: file_key,
        },
        _ => MessageBody::Text {
            content: content.unwrap_or_default(),
        },
    }
}

/// Input to `Database::insert_message`. The store assigns `created_at`.
pub struct NewMessage {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub body: MessageBody,
    pub reply_to: Option<ReplySnapshot>,
}

/// Result of pinning or unpinning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinChange {
    pub previous: Option<Uuid>,
    pub current: Option<Uuid>,
}

impl PinChange {
    pub fn changed(&self) -> bool {
        self.previous != self.current
    }
}

/// Result of toggling a reaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionToggle {
    Added,
    Removed,
    /// The message no longer exists; nothing was written.
    MessageMissing,
    /// The message is tombstoned; reactions are frozen.
    MessageDeleted,
}

/// Result of tombstoning a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tombstoned {
    /// False when the message was already deleted.
    pub changed: bool,
    /// True when the message was the conversation's pinned message.
    pub was_pinned: bool,
}

/// Extension trait for optional query results
pub(crate) trait OptionalExt<T> {
    fn optional(self) -> anyhow::Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> anyhow::Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
