use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::warn;
use uuid::Uuid;

use studyhub_types::api::{
    Claims, EmitNotificationRequest, NotificationQuery, UnreadCountResponse,
};

use crate::error::ApiError;
use crate::notify::NotificationDraft;
use crate::state::AppState;

/// `?page=` or `?page_size=` selects the paginated shape, otherwise the
/// newest `limit` notifications are returned as a plain list.
pub async fn list_notifications(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<NotificationQuery>,
) -> Result<Response, ApiError> {
    if query.page.is_some() || query.page_size.is_some() {
        let page = state
            .notifications
            .list_paginated(claims.sub, query.page, query.page_size)
            .await?;
        return Ok(Json(page).into_response());
    }

    let items = state.notifications.list_recent(claims.sub, query.limit).await?;
    Ok(Json(items).into_response())
}

pub async fn unread_count(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<UnreadCountResponse>, ApiError> {
    let unread_count = state.notifications.unread_count(claims.sub).await?;
    Ok(Json(UnreadCountResponse { unread_count }))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Path(notification_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<UnreadCountResponse>, ApiError> {
    let unread_count = state
        .notifications
        .mark_one_read(notification_id, claims.sub)
        .await?;
    Ok(Json(UnreadCountResponse { unread_count }))
}

pub async fn mark_all_read(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<UnreadCountResponse>, ApiError> {
    let unread_count = state.notifications.mark_all_read(claims.sub).await?;
    Ok(Json(UnreadCountResponse { unread_count }))
}

pub async fn delete_notification(
    State(state): State<AppState>,
    Path(notification_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<StatusCode, ApiError> {
    state
        .notifications
        .delete_one(notification_id, claims.sub)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn clear_notifications(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<StatusCode, ApiError> {
    state.notifications.clear_all(claims.sub).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Synchronous ingress for trusted services. Only moderator tokens may emit.
pub async fn emit_notification(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<EmitNotificationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !claims.moderator {
        warn!("{} ({}) tried to emit a notification", claims.username, claims.sub);
        return Err(ApiError::forbidden("emitting notifications requires a moderator token"));
    }

    let draft = NotificationDraft::try_from(req)?;
    let notification = state.notifications.emit(draft).await?;
    Ok((StatusCode::CREATED, Json(notification)))
}
