use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use studyhub_db::Database;
use studyhub_db::models::{NewMessage, ReactionToggle, datetime_to_micros};
use studyhub_gateway::dispatcher::Dispatcher;
use studyhub_types::api::{
    ConversationSummary, MarkAllReadResponse, MessagePage, MessageResponse, ReadReceiptResponse,
    SendMessageRequest, ToggleReactionResponse,
};
use studyhub_types::events::{ChannelKey, FanoutEvent};
use studyhub_types::models::{Conversation, Message, MessageBody};

use crate::cursor::PageCursor;
use crate::error::ApiError;
use crate::state::run_blocking;

pub const DEFAULT_PAGE_SIZE: u32 = 50;
const MAX_EMOJI_CHARS: usize = 16;

fn now_us() -> i64 {
    Utc::now().timestamp_micros()
}

/// Conversation registry and message log. Every operation is a stateless unit
/// of work: persist first, then publish. A failed publish never undoes a write.
#[derive(Clone)]
pub struct ChatService {
    db: Arc<Database>,
    dispatcher: Dispatcher,
    page_limit_max: u32,
}

impl ChatService {
    pub fn new(db: Arc<Database>, dispatcher: Dispatcher, page_limit_max: u32) -> Self {
        Self {
            db,
            dispatcher,
            page_limit_max: page_limit_max.max(1),
        }
    }

    // -- Conversation registry --

    /// The single conversation for this pair, created on first contact.
    pub async fn get_or_create_conversation(&self, user_id: Uuid, other_id: Uuid) -> Result<Conversation, ApiError> {
        let (conversation, _) = self.start_conversation(user_id, other_id).await?;
        Ok(conversation)
    }

    /// Like `get_or_create_conversation`, also reporting whether this call created it.
    pub async fn start_conversation(&self, user_id: Uuid, other_id: Uuid) -> Result<(Conversation, bool), ApiError> {
        if user_id == other_id {
            return Err(ApiError::validation("cannot start a conversation with yourself"));
        }

        let (conversation, created) = run_blocking(&self.db, move |db| {
            db.get_or_create_conversation(user_id, other_id, Uuid::new_v4(), now_us())
        })
        .await?;

        if created {
            info!("Conversation {} created by {}", conversation.id, user_id);
            self.hint_participants(&conversation, None);
        }
        Ok((conversation, created))
    }

    pub async fn user_conversations(&self, user_id: Uuid) -> Result<Vec<ConversationSummary>, ApiError> {
        run_blocking(&self.db, move |db| db.conversations_for_user(user_id)).await
    }

    /// Deletes the thread for both participants; there is no per-user hide.
    pub async fn delete_conversation(&self, conversation_id: Uuid, requester_id: Uuid) -> Result<(), ApiError> {
        let conversation = self.participant_conversation(conversation_id, requester_id).await?;

        let deleted = run_blocking(&self.db, move |db| db.delete_conversation(conversation_id)).await?;
        if !deleted {
            return Ok(());
        }

        info!("Conversation {} deleted by {}", conversation_id, requester_id);
        let event = FanoutEvent::ConversationDeleted {
            conversation_id,
            deleted_by: requester_id,
        };
        self.dispatcher
            .publish(ChannelKey::Conversation(conversation_id), event.clone());
        self.dispatcher.publish_all(user_channels(&conversation), event);
        Ok(())
    }

    // -- Message log --

    pub async fn append_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        req: SendMessageRequest,
    ) -> Result<MessageResponse, ApiError> {
        let body = MessageBody::from_parts(req.body_parts())?;
        let conversation = self.participant_conversation(conversation_id, sender_id).await?;

        let reply_to = match req.reply_to {
            Some(quoted_id) => {
                let quoted = self.load_message(quoted_id).await?;
                if quoted.conversation_id != conversation_id {
                    return Err(ApiError::validation(
                        "replies must quote a message from the same conversation",
                    ));
                }
                Some(quoted.snapshot())
            }
            None => None,
        };

        let new = NewMessage {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id,
            body,
            reply_to,
        };
        // The conversation may have been deleted since it was authorized
        let message = run_blocking(&self.db, move |db| db.insert_message(&new, now_us()))
            .await?
            .ok_or(ApiError::NotFound("conversation"))?;
        let response = MessageResponse::from(message);

        self.dispatcher.publish(
            ChannelKey::Conversation(conversation_id),
            FanoutEvent::MessageCreated {
                message: response.clone(),
            },
        );
        self.hint_participants(&conversation, Some(response.id));

        Ok(response)
    }

    /// Resolve the pair's conversation (creating it if needed) and read one page.
    pub async fn conversation_with_messages(
        &self,
        user_id: Uuid,
        other_id: Uuid,
        before: Option<String>,
        limit: Option<u32>,
    ) -> Result<MessagePage, ApiError> {
        let conversation = self.get_or_create_conversation(user_id, other_id).await?;
        self.page(conversation.id, before, limit).await
    }

    pub async fn conversation_messages(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        before: Option<String>,
        limit: Option<u32>,
    ) -> Result<MessagePage, ApiError> {
        self.participant_conversation(conversation_id, user_id).await?;
        self.page(conversation_id, before, limit).await
    }

    /// Toggle `(user, emoji)` on a message.
    pub async fn react(&self, message_id: Uuid, user_id: Uuid, emoji: &str) -> Result<ToggleReactionResponse, ApiError> {
        let emoji = emoji.trim().to_string();
        if emoji.is_empty() || emoji.chars().count() > MAX_EMOJI_CHARS {
            return Err(ApiError::validation("reaction must be a short emoji"));
        }

        let (message, _) = self.authorize_message(message_id, user_id).await?;
        if message.deleted_for_everyone {
            return Err(ApiError::validation("cannot react to a deleted message"));
        }

        let stored = emoji.clone();
        let toggle = run_blocking(&self.db, move |db| {
            db.toggle_reaction(message_id, user_id, &stored, now_us())
        })
        .await?;
        let added = match toggle {
            ReactionToggle::Added => true,
            ReactionToggle::Removed => false,
            ReactionToggle::MessageMissing => return Err(ApiError::NotFound("message")),
            ReactionToggle::MessageDeleted => {
                return Err(ApiError::validation("cannot react to a deleted message"));
            }
        };

        let conversation_id = message.conversation_id;
        let event = if added {
            FanoutEvent::ReactionAdded {
                conversation_id,
                message_id,
                user_id,
                emoji,
            }
        } else {
            FanoutEvent::ReactionRemoved {
                conversation_id,
                message_id,
                user_id,
                emoji,
            }
        };
        self.dispatcher.publish(ChannelKey::Conversation(conversation_id), event);

        Ok(ToggleReactionResponse { added })
    }

    /// Acknowledge one message. Re-reading and reading your own message are no-ops.
    pub async fn mark_read(&self, message_id: Uuid, user_id: Uuid) -> Result<ReadReceiptResponse, ApiError> {
        let (message, _) = self.authorize_message(message_id, user_id).await?;

        if message.sender_id != user_id {
            let added = run_blocking(&self.db, move |db| db.mark_read(message_id, user_id, now_us())).await?;
            if added {
                self.dispatcher.publish(
                    ChannelKey::Conversation(message.conversation_id),
                    FanoutEvent::MessagesRead {
                        conversation_id: message.conversation_id,
                        user_id,
                        message_ids: vec![message_id],
                    },
                );
                self.hint_user(user_id, message.conversation_id, None);
            }
        }

        let read_by = run_blocking(&self.db, move |db| db.read_by(message_id)).await?;
        Ok(ReadReceiptResponse { message_id, read_by })
    }

    /// Batch `mark_read` over the unread tail, optionally bounded by `up_to`.
    pub async fn mark_all_read(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        up_to: Option<Uuid>,
    ) -> Result<MarkAllReadResponse, ApiError> {
        self.participant_conversation(conversation_id, user_id).await?;

        let up_to_us = match up_to {
            Some(message_id) => {
                let bound = self.load_message(message_id).await?;
                if bound.conversation_id != conversation_id {
                    return Err(ApiError::validation("read bound belongs to another conversation"));
                }
                Some(datetime_to_micros(bound.created_at))
            }
            None => None,
        };

        let marked = run_blocking(&self.db, move |db| {
            db.mark_all_read(conversation_id, user_id, up_to_us, now_us())
        })
        .await?;

        if !marked.is_empty() {
            debug!("{} read {} messages in {}", user_id, marked.len(), conversation_id);
            let count = marked.len();
            self.dispatcher.publish(
                ChannelKey::Conversation(conversation_id),
                FanoutEvent::MessagesRead {
                    conversation_id,
                    user_id,
                    message_ids: marked,
                },
            );
            self.hint_user(user_id, conversation_id, None);
            return Ok(MarkAllReadResponse { marked: count });
        }

        Ok(MarkAllReadResponse { marked: 0 })
    }

    /// Only the sender may edit, and only live text messages.
    pub async fn edit_message(
        &self,
        message_id: Uuid,
        sender_id: Uuid,
        content: &str,
    ) -> Result<MessageResponse, ApiError> {
        let (message, conversation) = self.authorize_message(message_id, sender_id).await?;
        if message.sender_id != sender_id {
            return Err(ApiError::forbidden("only the sender can edit a message"));
        }
        if message.deleted_for_everyone {
            return Err(ApiError::validation("deleted messages cannot be edited"));
        }
        if !matches!(message.body, MessageBody::Text { .. }) {
            return Err(ApiError::validation("only text messages can be edited"));
        }

        let MessageBody::Text { content } = MessageBody::text(content)? else {
            return Err(ApiError::validation("only text messages can be edited"));
        };

        let stored = content.clone();
        let updated = run_blocking(&self.db, move |db| db.edit_message(message_id, &stored)).await?;
        if !updated {
            // Deleted between the check and the write
            return Err(ApiError::validation("deleted messages cannot be edited"));
        }

        self.dispatcher.publish(
            ChannelKey::Conversation(message.conversation_id),
            FanoutEvent::MessageEdited {
                conversation_id: message.conversation_id,
                message_id,
                content,
            },
        );
        // List previews show the last message's text
        if conversation.last_message_id == Some(message_id) {
            self.hint_participants(&conversation, Some(message_id));
        }

        let message = self.load_message(message_id).await?;
        Ok(MessageResponse::from(message))
    }

    /// Tombstone a message. Allowed for its sender, or any moderator.
    pub async fn delete_for_everyone(
        &self,
        message_id: Uuid,
        actor_id: Uuid,
        moderator: bool,
    ) -> Result<MessageResponse, ApiError> {
        let (message, _) = self.retract(message_id, actor_id, moderator).await?;
        Ok(message)
    }

    /// Like `delete_for_everyone`, also reporting whether this call did the tombstoning.
    pub async fn retract(
        &self,
        message_id: Uuid,
        actor_id: Uuid,
        moderator: bool,
    ) -> Result<(MessageResponse, bool), ApiError> {
        let message = self.load_message(message_id).await?;
        if message.sender_id != actor_id && !moderator {
            return Err(ApiError::forbidden("only the sender can delete a message"));
        }
        let conversation = self.load_conversation(message.conversation_id).await?;

        let outcome = run_blocking(&self.db, move |db| db.tombstone_message(message_id)).await?;

        if outcome.changed {
            info!("Message {} deleted for everyone by {}", message_id, actor_id);
            let channel = ChannelKey::Conversation(conversation.id);
            self.dispatcher.publish(
                channel,
                FanoutEvent::MessageDeleted {
                    conversation_id: conversation.id,
                    message_id,
                },
            );
            if outcome.was_pinned {
                self.dispatcher.publish(
                    channel,
                    FanoutEvent::MessageUnpinned {
                        conversation_id: conversation.id,
                        message_id,
                    },
                );
            }
            if conversation.last_message_id == Some(message_id) {
                self.hint_participants(&conversation, Some(message_id));
            }
        }

        let message = self.load_message(message_id).await?;
        Ok((MessageResponse::from(message), outcome.changed))
    }

    /// Pin a message; any participant may do it. Replaces the previous pin.
    pub async fn pin(&self, conversation_id: Uuid, message_id: Uuid, user_id: Uuid) -> Result<Conversation, ApiError> {
        self.participant_conversation(conversation_id, user_id).await?;

        let message = self.load_message(message_id).await?;
        if message.conversation_id != conversation_id {
            return Err(ApiError::validation("message belongs to another conversation"));
        }
        if message.deleted_for_everyone {
            return Err(ApiError::validation("deleted messages cannot be pinned"));
        }

        let change = run_blocking(&self.db, move |db| db.pin_message(conversation_id, message_id))
            .await?
            .ok_or_else(|| ApiError::validation("deleted messages cannot be pinned"))?;
        if change.changed() {
            self.dispatcher.publish(
                ChannelKey::Conversation(conversation_id),
                FanoutEvent::MessagePinned {
                    conversation_id,
                    message_id,
                    previous_message_id: change.previous,
                    pinned_by: user_id,
                },
            );
        }

        self.load_conversation(conversation_id).await
    }

    pub async fn unpin(&self, conversation_id: Uuid, user_id: Uuid) -> Result<Conversation, ApiError> {
        self.participant_conversation(conversation_id, user_id).await?;

        let change = run_blocking(&self.db, move |db| db.unpin_message(conversation_id)).await?;
        if let Some(message_id) = change.previous {
            self.dispatcher.publish(
                ChannelKey::Conversation(conversation_id),
                FanoutEvent::MessageUnpinned {
                    conversation_id,
                    message_id,
                },
            );
        }

        self.load_conversation(conversation_id).await
    }

    // -- Helpers --

    async fn page(&self, conversation_id: Uuid, before: Option<String>, limit: Option<u32>) -> Result<MessagePage, ApiError> {
        let cursor = before.as_deref().map(PageCursor::decode).transpose()?;
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, self.page_limit_max);

        let messages = run_blocking(&self.db, move |db| {
            db.messages_page(conversation_id, cursor.map(|c| c.micros()), limit)
        })
        .await?;

        let next_cursor = if messages.len() == limit as usize {
            messages
                .first()
                .map(|oldest| PageCursor::from_created_at(oldest.created_at).encode())
        } else {
            None
        };

        Ok(MessagePage {
            conversation_id,
            messages: messages.into_iter().map(MessageResponse::from).collect(),
            next_cursor,
        })
    }

    async fn load_conversation(&self, conversation_id: Uuid) -> Result<Conversation, ApiError> {
        run_blocking(&self.db, move |db| db.get_conversation(conversation_id))
            .await?
            .ok_or(ApiError::NotFound("conversation"))
    }

    async fn participant_conversation(&self, conversation_id: Uuid, user_id: Uuid) -> Result<Conversation, ApiError> {
        let conversation = self.load_conversation(conversation_id).await?;
        if !conversation.is_participant(user_id) {
            return Err(ApiError::forbidden("not a participant of this conversation"));
        }
        Ok(conversation)
    }

    async fn load_message(&self, message_id: Uuid) -> Result<Message, ApiError> {
        run_blocking(&self.db, move |db| db.get_message(message_id))
            .await?
            .ok_or(ApiError::NotFound("message"))
    }

    async fn authorize_message(&self, message_id: Uuid, user_id: Uuid) -> Result<(Message, Conversation), ApiError> {
        let message = self.load_message(message_id).await?;
        let conversation = self
            .participant_conversation(message.conversation_id, user_id)
            .await?;
        Ok((message, conversation))
    }

    /// Chat-list refresh hint for both participants.
    fn hint_participants(&self, conversation: &Conversation, last_message_id: Option<Uuid>) {
        self.dispatcher.publish_all(
            user_channels(conversation),
            FanoutEvent::ConversationUpdated {
                conversation_id: conversation.id,
                last_message_id,
            },
        );
    }

    fn hint_user(&self, user_id: Uuid, conversation_id: Uuid, last_message_id: Option<Uuid>) {
        self.dispatcher.publish(
            ChannelKey::User(user_id),
            FanoutEvent::ConversationUpdated {
                conversation_id,
                last_message_id,
            },
        );
    }
}

fn user_channels(conversation: &Conversation) -> [ChannelKey; 2] {
    conversation.participants.map(ChannelKey::User)
}
