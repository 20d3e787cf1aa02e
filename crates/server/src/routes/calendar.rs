use axum::{Json, extract::State, response::Json as ResponseJson};
use db::models::{event_sync::CalendarEventSync, user::UserPreferences};
use serde::{Deserialize, Serialize};
use services::services::{gcal::GCalSyncService, sync_locks::SyncGuard};
use ts_rs::TS;
use utils::response::ApiResponse;
use uuid::Uuid;

use crate::{AppState, UserId, error::ApiError};

const DEFAULT_CALENDAR_NAME: &str = "Whendoist";

#[derive(Debug, Deserialize)]
pub struct EnableSyncRequest {
    pub calendar_name: Option<String>,
}

#[derive(Debug, Serialize, TS)]
pub struct EnableSyncResponse {
    pub calendar_id: String,
    pub created_calendar: bool,
    pub sync_started: bool,
}

#[derive(Debug, Serialize, TS)]
pub struct FullSyncResponse {
    pub started: bool,
}

#[derive(Debug, Serialize, TS)]
pub struct SyncStatus {
    pub enabled: bool,
    pub syncing: bool,
    pub synced_count: usize,
    pub sync_error: Option<String>,
}

fn spawn_bulk_sync(sync: GCalSyncService, user_id: Uuid, guard: SyncGuard) {
    tokio::spawn(async move {
        match sync.bulk_sync(user_id, &guard).await {
            Ok(outcome) => tracing::info!(%user_id, ?outcome, "Bulk calendar sync finished"),
            Err(e) => tracing::error!(%user_id, error = %e, "Bulk calendar sync failed"),
        }
    });
}

/// Resolves (or creates) the sync calendar, persists the preference flags, and
/// kicks off a bulk sync in the background. Reusing an existing calendar first
/// wipes its events so stale state from earlier syncs can't linger.
pub async fn enable_sync(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Json(payload): Json<EnableSyncRequest>,
) -> Result<ResponseJson<ApiResponse<EnableSyncResponse>>, ApiError> {
    let prefs = UserPreferences::find_by_user_id(&state.db.pool, user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Preferences not found".to_string()))?;
    let sync = state.calendar_sync(&prefs)?;

    let name = payload
        .calendar_name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_CALENDAR_NAME.to_string());

    let (calendar_id, created) = sync.find_or_create_calendar(&name).await?;
    if !created {
        let cleared = sync.clear_all_events(&calendar_id).await?;
        let dropped = CalendarEventSync::delete_by_user_id(&state.db.pool, user_id).await?;
        tracing::info!(%user_id, cleared, dropped, "Reset reused sync calendar");
    }

    UserPreferences::enable_sync(&state.db.pool, user_id, &calendar_id).await?;

    let sync_started = match state.sync_locks.try_begin(user_id) {
        Some(guard) => {
            spawn_bulk_sync(sync, user_id, guard);
            true
        }
        None => false,
    };

    Ok(ResponseJson(ApiResponse::success(EnableSyncResponse {
        calendar_id,
        created_calendar: created,
        sync_started,
    })))
}

pub async fn full_sync(
    State(state): State<AppState>,
    UserId(user_id): UserId,
) -> Result<ResponseJson<ApiResponse<FullSyncResponse>>, ApiError> {
    let prefs = UserPreferences::find_by_user_id(&state.db.pool, user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Preferences not found".to_string()))?;
    if !prefs.gcal_sync_enabled {
        return Err(ApiError::BadRequest(
            "Calendar sync is not enabled".to_string(),
        ));
    }
    let sync = state.calendar_sync(&prefs)?;

    match state.sync_locks.try_begin(user_id) {
        Some(guard) => {
            spawn_bulk_sync(sync, user_id, guard);
            Ok(ResponseJson(ApiResponse::success(FullSyncResponse {
                started: true,
            })))
        }
        None => Ok(ResponseJson(ApiResponse::success_with_message(
            FullSyncResponse { started: false },
            "Sync already in progress",
        ))),
    }
}

pub async fn sync_status(
    State(state): State<AppState>,
    UserId(user_id): UserId,
) -> Result<ResponseJson<ApiResponse<SyncStatus>>, ApiError> {
    let prefs = UserPreferences::find_by_user_id(&state.db.pool, user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Preferences not found".to_string()))?;
    Ok(ResponseJson(ApiResponse::success(SyncStatus {
        enabled: prefs.gcal_sync_enabled,
        syncing: state.sync_locks.is_syncing(user_id),
        synced_count: state.sync_locks.progress(user_id),
        sync_error: prefs.gcal_sync_error,
    })))
}

/// Turns the flag off. Remote events and the stored calendar id stay so a
/// re-enable can pick up where it left off.
pub async fn disable_sync(
    State(state): State<AppState>,
    UserId(user_id): UserId,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    UserPreferences::find_by_user_id(&state.db.pool, user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Preferences not found".to_string()))?;
    UserPreferences::disable_sync(&state.db.pool, user_id).await?;
    Ok(ResponseJson(ApiResponse::success(())))
}
