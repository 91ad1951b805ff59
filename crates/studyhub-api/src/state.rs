use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::error;

use studyhub_db::Database;
use studyhub_gateway::dispatcher::Dispatcher;

use crate::chat::ChatService;
use crate::error::ApiError;
use crate::notify::{NotificationService, Notifier};

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub dispatcher: Dispatcher,
    pub chat: ChatService,
    pub notifications: NotificationService,
    /// Fire-and-forget ingress for notifications raised by request handlers
    /// (moderation today) and other in-process subsystems.
    pub notifier: Notifier,
    pub jwt_secret: String,
}

/// Tunables for the services; the server fills them from its config.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub page_limit_max: u32,
    pub notify_queue: usize,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            page_limit_max: 200,
            notify_queue: 256,
        }
    }
}

impl AppStateInner {
    /// Build the shared state and start the notification worker. Must be
    /// called inside a Tokio runtime.
    pub fn build(
        db: Arc<Database>,
        dispatcher: Dispatcher,
        jwt_secret: String,
        settings: &ServiceSettings,
    ) -> (AppState, JoinHandle<()>) {
        let chat = ChatService::new(db.clone(), dispatcher.clone(), settings.page_limit_max);
        let notifications = NotificationService::new(db.clone(), dispatcher.clone());
        let (notifier, worker) = Notifier::spawn(notifications.clone(), settings.notify_queue);

        let state = Arc::new(Self {
            db,
            dispatcher,
            chat,
            notifications,
            notifier,
            jwt_secret,
        });
        (state, worker)
    }
}

/// Run blocking store work off the async runtime.
pub(crate) async fn run_blocking<F, T>(db: &Arc<Database>, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let db = db.clone();
    tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            ApiError::Internal(e.to_string())
        })?
        .map_err(ApiError::Store)
}
