use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use studyhub_types::api::{
    Claims, ConversationResponse, ConversationSummary, MarkAllReadRequest, MarkAllReadResponse,
    MessagePage, MessagePageQuery, MessageResponse, PinMessageRequest, SendMessageRequest,
    StartConversationRequest,
};

use crate::error::ApiError;
use crate::state::AppState;

/// Returns 201 the first time a pair talks, 200 afterwards.
pub async fn start_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<StartConversationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (conversation, created) = state
        .chat
        .start_conversation(claims.sub, req.participant_id)
        .await?;
    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(ConversationResponse::from(conversation))))
}

pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<ConversationSummary>>, ApiError> {
    Ok(Json(state.chat.user_conversations(claims.sub).await?))
}

pub async fn delete_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<StatusCode, ApiError> {
    state.chat.delete_conversation(conversation_id, claims.sub).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Open the thread with another user, creating it on first contact.
pub async fn conversation_with(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<MessagePageQuery>,
) -> Result<Json<MessagePage>, ApiError> {
    let page = state
        .chat
        .conversation_with_messages(claims.sub, user_id, query.before, query.limit)
        .await?;
    Ok(Json(page))
}

pub async fn get_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<MessagePageQuery>,
) -> Result<Json<MessagePage>, ApiError> {
    let page = state
        .chat
        .conversation_messages(conversation_id, claims.sub, query.before, query.limit)
        .await?;
    Ok(Json(page))
}

pub async fn send_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<MessageResponse>), ApiError> {
    let message = state
        .chat
        .append_message(conversation_id, claims.sub, req)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

/// Body is optional; an empty request marks everything read.
pub async fn mark_all_read(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    req: Option<Json<MarkAllReadRequest>>,
) -> Result<Json<MarkAllReadResponse>, ApiError> {
    let up_to = req.and_then(|Json(r)| r.up_to);
    let marked = state
        .chat
        .mark_all_read(conversation_id, claims.sub, up_to)
        .await?;
    Ok(Json(marked))
}

pub async fn pin_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<PinMessageRequest>,
) -> Result<Json<ConversationResponse>, ApiError> {
    let conversation = state
        .chat
        .pin(conversation_id, req.message_id, claims.sub)
        .await?;
    Ok(Json(conversation.into()))
}

pub async fn unpin_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<ConversationResponse>, ApiError> {
    let conversation = state.chat.unpin(conversation_id, claims.sub).await?;
    Ok(Json(conversation.into()))
}
