use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::error;

use studyhub_types::models::{BodyError, UnknownNotificationKind};

/// Failures surfaced to API callers. Fan-out failures never appear here.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed payload, e.g. a message with neither text nor attachment
    #[error("{0}")]
    Validation(String),

    /// Caller is not a participant / recipient / sender
    #[error("{0}")]
    Forbidden(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    /// Persistence failure on the primary write or read path
    #[error("store failure: {0}")]
    Store(#[from] anyhow::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::Store(_) | Self::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Store(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<BodyError> for ApiError {
    fn from(e: BodyError) -> Self {
        Self::Validation(e.to_string())
    }
}

impl From<UnknownNotificationKind> for ApiError {
    fn from(e: UnknownNotificationKind) -> Self {
        Self::Validation(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Store details stay in the log
        let message = match &self {
            Self::Store(e) => {
                error!("Store error: {:#}", e);
                "internal error".to_string()
            }
            Self::Internal(e) => {
                error!("Internal error: {}", e);
                "internal error".to_string()
            }
            other => other.to_string(),
        };

        (
            self.status(),
            Json(serde_json::json!({ "error": self.kind(), "message": message })),
        )
            .into_response()
    }
}
