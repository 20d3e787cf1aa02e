use axum::{
    extract::{Path, State},
    response::Json as ResponseJson,
};
use db::models::{
    task::Task,
    task_instance::{InstanceStatus, TaskInstance},
};
use utils::response::ApiResponse;
use uuid::Uuid;

use crate::{AppState, UserId, error::ApiError, routes::tasks::spawn_single_item_sync};

pub async fn list_instances(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(task_id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<Vec<TaskInstance>>>, ApiError> {
    Task::find_by_id(&state.db.pool, task_id, user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Task not found".to_string()))?;
    let instances = TaskInstance::find_by_task_id(&state.db.pool, task_id).await?;
    Ok(ResponseJson(ApiResponse::success(instances)))
}

/// Loads the instance and verifies the owning task belongs to the acting user.
async fn owned_instance(
    state: &AppState,
    user_id: Uuid,
    instance_id: Uuid,
) -> Result<TaskInstance, ApiError> {
    let instance = TaskInstance::find_by_id(&state.db.pool, instance_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Instance not found".to_string()))?;
    Task::find_by_id(&state.db.pool, instance.task_id, user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Instance not found".to_string()))?;
    Ok(instance)
}

async fn transition(
    state: AppState,
    user_id: Uuid,
    instance_id: Uuid,
    to: InstanceStatus,
) -> Result<ResponseJson<ApiResponse<TaskInstance>>, ApiError> {
    let instance = owned_instance(&state, user_id, instance_id).await?;

    let service = state.recurrence();
    let updated = match to {
        InstanceStatus::Completed => service.complete_instance(instance.id).await?,
        InstanceStatus::Skipped => service.skip_instance(instance.id).await?,
        InstanceStatus::Pending => service.uncomplete_instance(instance.id).await?,
    };

    spawn_single_item_sync(state, user_id, instance.task_id, Some(instance.id));
    Ok(ResponseJson(ApiResponse::success(updated)))
}

pub async fn complete_instance(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<TaskInstance>>, ApiError> {
    transition(state, user_id, id, InstanceStatus::Completed).await
}

pub async fn skip_instance(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<TaskInstance>>, ApiError> {
    transition(state, user_id, id, InstanceStatus::Skipped).await
}

pub async fn uncomplete_instance(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<TaskInstance>>, ApiError> {
    transition(state, user_id, id, InstanceStatus::Pending).await
}
