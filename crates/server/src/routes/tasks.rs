use axum::{
    Json,
    extract::{Path, Query, State},
    response::Json as ResponseJson,
};
use chrono::{Days, NaiveDate, NaiveTime, Utc};
use db::models::{
    task::{Clarity, CreateTask, RecurrenceRule, Task, TaskStatus, UpdateTask},
    task_instance::TaskInstance,
    user::UserPreferences,
};
use services::services::gcal::GCalSyncService;
use serde::{Deserialize, Deserializer};
use utils::response::ApiResponse;
use uuid::Uuid;

use crate::{AppState, UserId, error::ApiError};

const DEFAULT_HORIZON_DAYS: u64 = 60;

#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    pub domain_id: Option<Uuid>,
    pub status: Option<TaskStatus>,
}

/// Distinguishes "field absent" (leave unchanged) from "field null" (clear).
fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

#[derive(Debug, Deserialize)]
pub struct UpdateTaskRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub domain_id: Option<Uuid>,
    pub clarity: Option<Clarity>,
    pub impact: Option<i64>,
    pub duration_minutes: Option<i64>,
    #[serde(default, deserialize_with = "double_option")]
    pub scheduled_date: Option<Option<NaiveDate>>,
    #[serde(default, deserialize_with = "double_option")]
    pub scheduled_time: Option<Option<NaiveTime>>,
    #[serde(default, deserialize_with = "double_option")]
    pub recurrence_rule: Option<Option<RecurrenceRule>>,
}

fn validate_impact(impact: Option<i64>) -> Result<(), ApiError> {
    if let Some(impact) = impact
        && !(1..=4).contains(&impact)
    {
        return Err(ApiError::BadRequest(
            "impact must be between 1 and 4".to_string(),
        ));
    }
    Ok(())
}

async fn horizon_end(state: &AppState, user_id: Uuid, today: NaiveDate) -> Result<NaiveDate, ApiError> {
    let horizon_days = UserPreferences::find_by_user_id(&state.db.pool, user_id)
        .await?
        .map(|p| p.materialize_horizon_days.max(1) as u64)
        .unwrap_or(DEFAULT_HORIZON_DAYS);
    Ok(today + Days::new(horizon_days))
}

/// Loads preferences and builds a calendar sync service, or `None` when sync
/// is disabled or misconfigured for the user. Errors are logged here so the
/// spawn helpers stay fire-and-forget.
async fn sync_service_for(state: &AppState, user_id: Uuid) -> Option<GCalSyncService> {
    let prefs = match UserPreferences::find_by_user_id(&state.db.pool, user_id).await {
        Ok(Some(prefs)) if prefs.gcal_sync_enabled => prefs,
        Ok(_) => return None,
        Err(e) => {
            tracing::error!(%user_id, error = %e, "Failed to load preferences for sync");
            return None;
        }
    };
    match state.calendar_sync(&prefs) {
        Ok(sync) => Some(sync),
        Err(e) => {
            tracing::error!(%user_id, error = %e, "Failed to build calendar client");
            None
        }
    }
}

/// Fire-and-forget push of one item's calendar state; errors are logged, never
/// surfaced to the triggering request.
pub(crate) fn spawn_single_item_sync(
    state: AppState,
    user_id: Uuid,
    task_id: Uuid,
    instance_id: Option<Uuid>,
) {
    tokio::spawn(async move {
        let Some(sync) = sync_service_for(&state, user_id).await else {
            return;
        };
        if let Err(e) = sync.sync_single(user_id, task_id, instance_id).await {
            tracing::error!(%user_id, %task_id, error = %e, "Single-item calendar sync failed");
        }
    });
}

/// Like [`spawn_single_item_sync`] but covers a recurring task: the task row
/// itself plus every materialized instance, so a status change that stops the
/// instances being schedulable also removes their events.
pub(crate) fn spawn_task_scope_sync(state: AppState, user_id: Uuid, task_id: Uuid) {
    tokio::spawn(async move {
        let Some(sync) = sync_service_for(&state, user_id).await else {
            return;
        };
        let instances = match TaskInstance::find_by_task_id(&state.db.pool, task_id).await {
            Ok(instances) => instances,
            Err(e) => {
                tracing::error!(%user_id, %task_id, error = %e, "Failed to load instances for sync");
                return;
            }
        };
        if let Err(e) = sync.sync_single(user_id, task_id, None).await {
            tracing::error!(%user_id, %task_id, error = %e, "Task calendar sync failed");
        }
        for instance in instances {
            if let Err(e) = sync.sync_single(user_id, task_id, Some(instance.id)).await {
                tracing::error!(
                    %user_id, %task_id, instance_id = %instance.id, error = %e,
                    "Instance calendar sync failed"
                );
            }
        }
    });
}

pub async fn create_task(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Json(payload): Json<CreateTask>,
) -> Result<ResponseJson<ApiResponse<Task>>, ApiError> {
    if payload.title.trim().is_empty() {
        return Err(ApiError::BadRequest("Task title must not be empty".to_string()));
    }
    validate_impact(payload.impact)?;
    if let Some(rule) = &payload.recurrence_rule
        && rule.interval < 1
    {
        return Err(ApiError::BadRequest(
            "Recurrence interval must be at least 1".to_string(),
        ));
    }

    let task = Task::create(&state.db.pool, user_id, &payload).await?;

    if task.is_recurring {
        let today = Utc::now().date_naive();
        let end = horizon_end(&state, user_id, today).await?;
        state.recurrence().materialize(&task, today, end).await?;
    } else if task.scheduled_date.is_some() {
        spawn_single_item_sync(state, user_id, task.id, None);
    }

    Ok(ResponseJson(ApiResponse::success(task)))
}

pub async fn list_tasks(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Query(query): Query<ListTasksQuery>,
) -> Result<ResponseJson<ApiResponse<Vec<Task>>>, ApiError> {
    let tasks =
        Task::find_by_user_id(&state.db.pool, user_id, query.domain_id, query.status).await?;
    Ok(ResponseJson(ApiResponse::success(tasks)))
}

pub async fn get_task(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<Task>>, ApiError> {
    let task = Task::find_by_id(&state.db.pool, id, user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Task not found".to_string()))?;
    Ok(ResponseJson(ApiResponse::success(task)))
}

pub async fn update_task(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateTaskRequest>,
) -> Result<ResponseJson<ApiResponse<Task>>, ApiError> {
    let existing = Task::find_by_id(&state.db.pool, id, user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Task not found".to_string()))?;
    validate_impact(payload.impact)?;

    let title_changed = payload.title.is_some();
    let duration_changed = payload.duration_minutes.is_some();

    Task::update(
        &state.db.pool,
        id,
        user_id,
        &UpdateTask {
            title: payload.title,
            description: payload.description,
            domain_id: payload.domain_id,
            clarity: payload.clarity,
            impact: payload.impact,
            duration_minutes: payload.duration_minutes,
        },
    )
    .await?;

    let schedule_changed = payload.scheduled_date.is_some() || payload.scheduled_time.is_some();
    if schedule_changed {
        let date = payload.scheduled_date.unwrap_or(existing.scheduled_date);
        let time = payload.scheduled_time.unwrap_or(existing.scheduled_time);
        Task::set_schedule(&state.db.pool, id, user_id, date, time).await?;
    }

    let recurrence_changed = payload.recurrence_rule.is_some();
    if let Some(rule) = &payload.recurrence_rule {
        if let Some(rule) = rule
            && rule.interval < 1
        {
            return Err(ApiError::BadRequest(
                "Recurrence interval must be at least 1".to_string(),
            ));
        }
        Task::set_recurrence(&state.db.pool, id, user_id, rule.as_ref()).await?;
    }

    let task = Task::find_by_id(&state.db.pool, id, user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Task not found".to_string()))?;

    if recurrence_changed || (schedule_changed && task.is_recurring) {
        // Rule or anchor changed: rebuild future pending instances.
        let today = Utc::now().date_naive();
        let end = horizon_end(&state, user_id, today).await?;
        state.recurrence().regenerate(&task, today, end).await?;
    }

    // Duration feeds the event payload too, not just the schedule.
    let projection_changed =
        schedule_changed || duration_changed || title_changed || recurrence_changed;
    if projection_changed && !task.is_recurring {
        spawn_single_item_sync(state, user_id, task.id, None);
    }

    Ok(ResponseJson(ApiResponse::success(task)))
}

async fn set_status_and_sync(
    state: AppState,
    user_id: Uuid,
    id: Uuid,
    status: TaskStatus,
) -> Result<ResponseJson<ApiResponse<Task>>, ApiError> {
    Task::find_by_id(&state.db.pool, id, user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Task not found".to_string()))?;
    Task::set_status(&state.db.pool, id, user_id, status).await?;
    let task = Task::find_by_id(&state.db.pool, id, user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Task not found".to_string()))?;
    // Status drives schedulability, so the calendar side may need an insert or
    // a delete either way. Recurring tasks carry their instances' events with
    // them.
    if task.is_recurring {
        spawn_task_scope_sync(state, user_id, task.id);
    } else {
        spawn_single_item_sync(state, user_id, task.id, None);
    }
    Ok(ResponseJson(ApiResponse::success(task)))
}

pub async fn complete_task(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<Task>>, ApiError> {
    set_status_and_sync(state, user_id, id, TaskStatus::Completed).await
}

pub async fn uncomplete_task(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<Task>>, ApiError> {
    set_status_and_sync(state, user_id, id, TaskStatus::Pending).await
}

pub async fn archive_task(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<Task>>, ApiError> {
    set_status_and_sync(state, user_id, id, TaskStatus::Archived).await
}

pub async fn restore_task(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<Task>>, ApiError> {
    set_status_and_sync(state, user_id, id, TaskStatus::Pending).await
}
