use axum::{
    http::StatusCode,
    response::{IntoResponse, Json as ResponseJson, Response},
};
use services::services::{
    gcal::{CalendarApiError, SyncError},
    recurrence::RecurrenceError,
};
use thiserror::Error;
use utils::response::ApiResponse;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Recurrence(#[from] RecurrenceError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Calendar(#[from] CalendarApiError),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Database(sqlx::Error::RowNotFound) => StatusCode::NOT_FOUND,
            ApiError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Recurrence(RecurrenceError::InstanceNotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Recurrence(RecurrenceError::InvalidTransition { .. }) => {
                StatusCode::CONFLICT
            }
            ApiError::Recurrence(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Sync(SyncError::TaskNotFound(_) | SyncError::InstanceNotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            ApiError::Sync(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Calendar(_) => StatusCode::BAD_GATEWAY,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (
            status,
            ResponseJson(ApiResponse::<()>::error(self.to_string())),
        )
            .into_response()
    }
}
