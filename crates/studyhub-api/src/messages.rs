use axum::{
    Extension, Json,
    extract::{Path, State},
};
use uuid::Uuid;

use studyhub_types::api::{
    Claims, EditMessageRequest, MessageResponse, ReadReceiptResponse, ToggleReactionRequest,
    ToggleReactionResponse,
};

use crate::error::ApiError;
use crate::state::AppState;

/// Toggle a reaction: the same call adds it, then removes it.
pub async fn toggle_reaction(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<ToggleReactionRequest>,
) -> Result<Json<ToggleReactionResponse>, ApiError> {
    let result = state.chat.react(message_id, claims.sub, &req.emoji).await?;
    Ok(Json(result))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<ReadReceiptResponse>, ApiError> {
    Ok(Json(state.chat.mark_read(message_id, claims.sub).await?))
}

pub async fn edit_message(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<EditMessageRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    let message = state
        .chat
        .edit_message(message_id, claims.sub, &req.content)
        .await?;
    Ok(Json(message))
}

/// Delete for everyone. Moderator tokens may delete any message; the sender
/// is told when a moderator removed theirs.
pub async fn delete_message(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<MessageResponse>, ApiError> {
    let (message, removed) = state
        .chat
        .retract(message_id, claims.sub, claims.moderator)
        .await?;

    if removed && claims.moderator && message.sender_id != claims.sub {
        state.notifier.moderation_action(
            message.sender_id,
            claims.sub,
            "A moderator removed one of your messages",
        );
    }
    Ok(Json(message))
}
