use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::error;

use souk_db::StoreError;

/// API-level error taxonomy. Every handler failure maps onto a JSON body
/// plus an HTTP status here; nothing is retried.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("not a participant of this thread")]
    Forbidden,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("username already taken")]
    UsernameTaken,

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Validation(msg) => ApiError::Validation(msg),
            StoreError::NotFound(what) => ApiError::NotFound(what),
            other => ApiError::Internal(other.into()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Validation(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, self.to_string()),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ApiError::UsernameTaken => (StatusCode::CONFLICT, self.to_string()),
            ApiError::Internal(e) => {
                error!("internal error: {:#}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

pub(crate) fn join_error(e: tokio::task::JoinError) -> ApiError {
    error!("spawn_blocking join error: {}", e);
    ApiError::Internal(e.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_keep_their_class() {
        let e: ApiError = StoreError::validation("message body must not be empty").into();
        assert!(matches!(e, ApiError::Validation(_)));

        let e: ApiError = StoreError::NotFound("thread").into();
        assert!(matches!(e, ApiError::NotFound("thread")));

        let e: ApiError = StoreError::LockPoisoned.into();
        assert!(matches!(e, ApiError::Internal(_)));
    }
}
