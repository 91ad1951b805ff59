use axum::{
    Router, middleware,
    routing::{delete, get, patch, post, put},
};

use crate::middleware::require_auth;
use crate::state::AppState;
use crate::{conversations, messages, notifications, users};

/// Every REST route. All of them require a bearer token.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/conversations",
            get(conversations::list_conversations).post(conversations::start_conversation),
        )
        .route("/conversations/{conversation_id}", delete(conversations::delete_conversation))
        .route("/conversations/with/{user_id}", get(conversations::conversation_with))
        .route(
            "/conversations/{conversation_id}/messages",
            get(conversations::get_messages).post(conversations::send_message),
        )
        .route("/conversations/{conversation_id}/read", post(conversations::mark_all_read))
        .route(
            "/conversations/{conversation_id}/pin",
            put(conversations::pin_message).delete(conversations::unpin_message),
        )
        .route(
            "/messages/{message_id}",
            patch(messages::edit_message).delete(messages::delete_message),
        )
        .route("/messages/{message_id}/reactions", post(messages::toggle_reaction))
        .route("/messages/{message_id}/read", post(messages::mark_read))
        .route(
            "/notifications",
            get(notifications::list_notifications).delete(notifications::clear_notifications),
        )
        .route("/notifications/unread-count", get(notifications::unread_count))
        .route("/notifications/read-all", post(notifications::mark_all_read))
        .route("/notifications/{notification_id}/read", post(notifications::mark_read))
        .route("/notifications/{notification_id}", delete(notifications::delete_notification))
        .route("/internal/notifications", post(notifications::emit_notification))
        .route("/users/me/profile", put(users::update_profile))
        .route("/users/online", get(users::online_users))
        .route("/users/{user_id}/presence", get(users::presence))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state)
}
