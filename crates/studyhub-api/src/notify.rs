use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use studyhub_db::Database;
use studyhub_gateway::dispatcher::Dispatcher;
use studyhub_types::api::{EmitNotificationRequest, NotificationPage};
use studyhub_types::events::{ChannelKey, FanoutEvent};
use studyhub_types::models::{Notification, NotificationKind};

use crate::error::ApiError;
use crate::state::run_blocking;

pub const DEFAULT_RECENT_LIMIT: u32 = 20;
pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;
const MAX_MESSAGE_CHARS: usize = 500;
const MAX_LINK_CHARS: usize = 2048;

/// A notification that has not been persisted yet.
#[derive(Debug, Clone)]
pub struct NotificationDraft {
    pub recipient_id: Uuid,
    pub actor_id: Option<Uuid>,
    pub kind: NotificationKind,
    pub message: String,
    pub link: Option<String>,
}

impl NotificationDraft {
    pub fn new(recipient_id: Uuid, kind: NotificationKind, message: impl Into<String>) -> Self {
        Self {
            recipient_id,
            actor_id: None,
            kind,
            message: message.into(),
            link: None,
        }
    }

    pub fn with_actor(mut self, actor_id: Uuid) -> Self {
        self.actor_id = Some(actor_id);
        self
    }

    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }

    fn into_notification(self, now: DateTime<Utc>) -> Result<Notification, ApiError> {
        let message = self.message.trim().to_string();
        if message.is_empty() {
            return Err(ApiError::validation("notification message is empty"));
        }
        if message.chars().count() > MAX_MESSAGE_CHARS {
            return Err(ApiError::validation(format!(
                "notification message exceeds {} characters",
                MAX_MESSAGE_CHARS
            )));
        }

        let link = self
            .link
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty());
        if link.as_ref().is_some_and(|l| l.chars().count() > MAX_LINK_CHARS) {
            return Err(ApiError::validation("notification link is too long"));
        }

        Ok(Notification {
            id: Uuid::new_v4(),
            recipient_id: self.recipient_id,
            actor_id: self.actor_id,
            kind: self.kind,
            message,
            link,
            is_read: false,
            created_at: now,
        })
    }
}

impl TryFrom<EmitNotificationRequest> for NotificationDraft {
    type Error = ApiError;

    fn try_from(req: EmitNotificationRequest) -> Result<Self, Self::Error> {
        let kind = req.kind.parse::<NotificationKind>()?;
        Ok(Self {
            recipient_id: req.recipient_id,
            actor_id: req.actor_id,
            kind,
            message: req.message,
            link: req.link,
        })
    }
}

/// Persisted notifications plus the unread-count fan-out. Every mutation is
/// scoped to the recipient that owns the record.
#[derive(Clone)]
pub struct NotificationService {
    db: Arc<Database>,
    dispatcher: Dispatcher,
}

impl NotificationService {
    pub fn new(db: Arc<Database>, dispatcher: Dispatcher) -> Self {
        Self { db, dispatcher }
    }

    /// Persist and fan out. Store failures are returned to the caller.
    pub async fn emit(&self, draft: NotificationDraft) -> Result<Notification, ApiError> {
        let notification = draft.into_notification(Utc::now())?;
        let recipient_id = notification.recipient_id;

        let stored = notification.clone();
        let unread_count = run_blocking(&self.db, move |db| {
            db.insert_notification(&stored)?;
            db.unread_notification_count(recipient_id)
        })
        .await?;

        debug!("Notification {} ({}) for {}", notification.id, notification.kind, recipient_id);
        self.dispatcher.publish(
            ChannelKey::User(recipient_id),
            FanoutEvent::NotificationCreated {
                notification: notification.clone(),
                unread_count,
            },
        );
        Ok(notification)
    }

    /// `emit` for callers whose own action must not fail with it.
    pub async fn emit_best_effort(&self, draft: NotificationDraft) -> Option<Notification> {
        let recipient_id = draft.recipient_id;
        let kind = draft.kind;
        match self.emit(draft).await {
            Ok(notification) => Some(notification),
            Err(e) => {
                warn!("Dropping {} notification for {}: {}", kind, recipient_id, e);
                None
            }
        }
    }

    pub async fn list_recent(&self, recipient_id: Uuid, limit: Option<u32>) -> Result<Vec<Notification>, ApiError> {
        let limit = limit.unwrap_or(DEFAULT_RECENT_LIMIT).clamp(1, MAX_PAGE_SIZE);
        run_blocking(&self.db, move |db| db.notifications_for(recipient_id, 0, limit)).await
    }

    /// One-based pages, newest first.
    pub async fn list_paginated(
        &self,
        recipient_id: Uuid,
        page: Option<u32>,
        page_size: Option<u32>,
    ) -> Result<NotificationPage, ApiError> {
        let page = page.unwrap_or(1).max(1);
        let page_size = page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let offset = u64::from(page - 1) * u64::from(page_size);

        let (items, total) = run_blocking(&self.db, move |db| {
            let items = db.notifications_for(recipient_id, offset, page_size)?;
            let total = db.count_notifications(recipient_id)?;
            Ok((items, total))
        })
        .await?;

        let has_more = offset + (items.len() as u64) < total;
        Ok(NotificationPage {
            items,
            page,
            page_size,
            total,
            has_more,
        })
    }

    pub async fn unread_count(&self, recipient_id: Uuid) -> Result<u64, ApiError> {
        run_blocking(&self.db, move |db| db.unread_notification_count(recipient_id)).await
    }

    /// Marking an already-read notification is a no-op. Returns the unread count.
    pub async fn mark_one_read(&self, notification_id: Uuid, recipient_id: Uuid) -> Result<u64, ApiError> {
        let notification = run_blocking(&self.db, move |db| db.get_notification(notification_id))
            .await?
            .ok_or(ApiError::NotFound("notification"))?;
        if notification.recipient_id != recipient_id {
            return Err(ApiError::forbidden("not the recipient of this notification"));
        }

        let changed = run_blocking(&self.db, move |db| db.mark_notification_read(notification_id)).await?;
        self.settle(recipient_id, changed).await
    }

    pub async fn mark_all_read(&self, recipient_id: Uuid) -> Result<u64, ApiError> {
        let marked = run_blocking(&self.db, move |db| db.mark_all_notifications_read(recipient_id)).await?;
        self.settle(recipient_id, marked > 0).await
    }

    /// Deleting an unknown (or already deleted) id is a no-op.
    pub async fn delete_one(&self, notification_id: Uuid, recipient_id: Uuid) -> Result<u64, ApiError> {
        let existing = run_blocking(&self.db, move |db| db.get_notification(notification_id)).await?;
        let Some(notification) = existing else {
            return self.unread_count(recipient_id).await;
        };
        if notification.recipient_id != recipient_id {
            return Err(ApiError::forbidden("not the recipient of this notification"));
        }

        let deleted = run_blocking(&self.db, move |db| db.delete_notification(notification_id)).await?;
        self.settle(recipient_id, deleted).await
    }

    pub async fn clear_all(&self, recipient_id: Uuid) -> Result<u64, ApiError> {
        let cleared = run_blocking(&self.db, move |db| db.clear_notifications(recipient_id)).await?;
        if cleared > 0 {
            info!("Cleared {} notifications for {}", cleared, recipient_id);
        }
        self.settle(recipient_id, cleared > 0).await
    }

    /// Push the current unread count to every connection of the recipient.
    pub async fn publish_changed(&self, recipient_id: Uuid) -> Result<u64, ApiError> {
        let unread_count = self.unread_count(recipient_id).await?;
        self.dispatcher.publish(
            ChannelKey::User(recipient_id),
            FanoutEvent::NotificationsChanged { unread_count },
        );
        Ok(unread_count)
    }

    async fn settle(&self, recipient_id: Uuid, changed: bool) -> Result<u64, ApiError> {
        if changed {
            self.publish_changed(recipient_id).await
        } else {
            self.unread_count(recipient_id).await
        }
    }
}

/// Cloneable handle other subsystems use to emit notifications without
/// waiting on the store. A single worker drains the queue.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::Sender<NotificationDraft>,
}

impl Notifier {
    /// Start the worker. It exits once every `Notifier` clone is dropped.
    pub fn spawn(service: NotificationService, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<NotificationDraft>(capacity.max(1));

        let worker = tokio::spawn(async move {
            while let Some(draft) = rx.recv().await {
                service.emit_best_effort(draft).await;
            }
            debug!("Notification worker stopped");
        });

        (Self { tx }, worker)
    }

    /// Enqueue and return immediately. False when the draft was dropped.
    pub fn notify(&self, draft: NotificationDraft) -> bool {
        match self.tx.try_send(draft) {
            Ok(()) => true,
            Err(TrySendError::Full(draft)) => {
                warn!("Notification queue full, dropping {} for {}", draft.kind, draft.recipient_id);
                false
            }
            Err(TrySendError::Closed(draft)) => {
                warn!("Notification worker gone, dropping {} for {}", draft.kind, draft.recipient_id);
                false
            }
        }
    }

    /// Tell the requester their request was fulfilled. Fulfilling your own
    /// request notifies nobody.
    pub fn request_fulfilled(&self, requester_id: Uuid, fulfiller_id: Uuid, title: &str, link: Option<&str>) -> bool {
        if requester_id == fulfiller_id {
            debug!("Skipping self-fulfillment notification for {}", requester_id);
            return false;
        }
        let mut draft = NotificationDraft::new(
            requester_id,
            NotificationKind::Fulfillment,
            format!("Your request \"{}\" was fulfilled", title),
        )
        .with_actor(fulfiller_id);
        if let Some(link) = link {
            draft = draft.with_link(link);
        }
        self.notify(draft)
    }

    pub fn review_replied(&self, author_id: Uuid, replier_id: Uuid, content_title: &str, link: &str) -> bool {
        if author_id == replier_id {
            return false;
        }
        self.notify(
            NotificationDraft::new(
                author_id,
                NotificationKind::System,
                format!("Someone replied to your review on \"{}\"", content_title),
            )
            .with_actor(replier_id)
            .with_link(link),
        )
    }

    pub fn content_featured(&self, owner_id: Uuid, content_title: &str, link: &str) -> bool {
        self.notify(
            NotificationDraft::new(
                owner_id,
                NotificationKind::Featured,
                format!("\"{}\" is now featured", content_title),
            )
            .with_link(link),
        )
    }

    pub fn milestone_reached(&self, user_id: Uuid, milestone: &str) -> bool {
        self.notify(NotificationDraft::new(
            user_id,
            NotificationKind::Milestone,
            format!("You reached a milestone: {}", milestone),
        ))
    }

    pub fn moderation_action(&self, user_id: Uuid, moderator_id: Uuid, action: &str) -> bool {
        self.notify(
            NotificationDraft::new(user_id, NotificationKind::System, action).with_actor(moderator_id),
        )
    }
}
