use axum::{Json, extract::State, response::Json as ResponseJson};
use db::models::user::{UpdatePreferences, UserPreferences};
use utils::response::ApiResponse;

use crate::{AppState, UserId, error::ApiError};

pub async fn get_preferences(
    State(state): State<AppState>,
    UserId(user_id): UserId,
) -> Result<ResponseJson<ApiResponse<UserPreferences>>, ApiError> {
    let prefs = UserPreferences::find_by_user_id(&state.db.pool, user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Preferences not found".to_string()))?;
    Ok(ResponseJson(ApiResponse::success(prefs)))
}

pub async fn update_preferences(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Json(payload): Json<UpdatePreferences>,
) -> Result<ResponseJson<ApiResponse<UserPreferences>>, ApiError> {
    if let Some(days) = payload.instance_retention_days
        && days < 1
    {
        return Err(ApiError::BadRequest(
            "instance_retention_days must be at least 1".to_string(),
        ));
    }
    if let Some(days) = payload.materialize_horizon_days
        && days < 1
    {
        return Err(ApiError::BadRequest(
            "materialize_horizon_days must be at least 1".to_string(),
        ));
    }
    UserPreferences::update(&state.db.pool, user_id, &payload).await?;
    let prefs = UserPreferences::find_by_user_id(&state.db.pool, user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Preferences not found".to_string()))?;
    Ok(ResponseJson(ApiResponse::success(prefs)))
}
