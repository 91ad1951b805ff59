use axum::{
    Extension, Json,
    extract::{Path, State},
};
use chrono::Utc;
use uuid::Uuid;

use studyhub_types::api::{Claims, OnlineUsersResponse, PresenceResponse, UpdateProfileRequest};
use studyhub_types::models::UserProfile;

use crate::error::ApiError;
use crate::state::{AppState, run_blocking};

const MAX_DISPLAY_NAME_CHARS: usize = 64;

/// Store the caller's public profile. Omitted fields keep their stored value.
pub async fn update_profile(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<UpdateProfileRequest>,
) -> Result<Json<UserProfile>, ApiError> {
    let display_name = req.display_name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty());
    if display_name
        .as_ref()
        .is_some_and(|n| n.chars().count() > MAX_DISPLAY_NAME_CHARS)
    {
        return Err(ApiError::validation("display name is too long"));
    }

    let profile = UserProfile {
        id: claims.sub,
        username: claims.username,
        display_name,
        avatar_url: req.avatar_url.filter(|u| !u.trim().is_empty()),
    };
    let user_id = profile.id;

    let stored = run_blocking(&state.db, move |db| {
        db.upsert_user_profile(&profile, Utc::now().timestamp_micros())?;
        db.get_user_profile(user_id)
    })
    .await?
    .ok_or(ApiError::NotFound("user"))?;

    Ok(Json(stored))
}

/// Online means at least one live gateway connection right now.
pub async fn presence(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Json<PresenceResponse> {
    let connections = state.dispatcher.connection_count(user_id);
    Json(PresenceResponse {
        user_id,
        online: connections > 0,
        connections,
    })
}

pub async fn online_users(State(state): State<AppState>) -> Json<OnlineUsersResponse> {
    let mut user_ids = state.dispatcher.online_users();
    user_ids.sort();
    Json(OnlineUsersResponse { user_ids })
}
