use axum::{Json, extract::State, response::Json as ResponseJson};
use db::models::user::{CreateUser, User};
use utils::response::ApiResponse;

use crate::{AppState, UserId, error::ApiError};

pub async fn create_user(
    State(state): State<AppState>,
    Json(payload): Json<CreateUser>,
) -> Result<ResponseJson<ApiResponse<User>>, ApiError> {
    if payload.email.trim().is_empty() {
        return Err(ApiError::BadRequest("Email must not be empty".to_string()));
    }
    if User::find_by_email(&state.db.pool, &payload.email)
        .await?
        .is_some()
    {
        return Err(ApiError::Conflict(format!(
            "A user with email {} already exists",
            payload.email
        )));
    }
    let user = User::create(&state.db.pool, &payload).await?;
    Ok(ResponseJson(ApiResponse::success(user)))
}

pub async fn get_current_user(
    State(state): State<AppState>,
    UserId(user_id): UserId,
) -> Result<ResponseJson<ApiResponse<User>>, ApiError> {
    let user = User::find_by_id(&state.db.pool, user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;
    Ok(ResponseJson(ApiResponse::success(user)))
}
