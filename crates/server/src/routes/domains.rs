use axum::{
    Json,
    extract::{Path, Query, State},
    response::Json as ResponseJson,
};
use db::models::domain::{CreateDomain, Domain, UpdateDomain};
use serde::Deserialize;
use utils::response::ApiResponse;
use uuid::Uuid;

use crate::{AppState, UserId, error::ApiError};

#[derive(Debug, Deserialize)]
pub struct ListDomainsQuery {
    #[serde(default)]
    pub include_archived: bool,
}

pub async fn create_domain(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Json(payload): Json<CreateDomain>,
) -> Result<ResponseJson<ApiResponse<Domain>>, ApiError> {
    if payload.name.trim().is_empty() {
        return Err(ApiError::BadRequest("Domain name must not be empty".to_string()));
    }
    let domain = Domain::create(&state.db.pool, user_id, &payload).await?;
    Ok(ResponseJson(ApiResponse::success(domain)))
}

pub async fn list_domains(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Query(query): Query<ListDomainsQuery>,
) -> Result<ResponseJson<ApiResponse<Vec<Domain>>>, ApiError> {
    let domains =
        Domain::find_by_user_id(&state.db.pool, user_id, query.include_archived).await?;
    Ok(ResponseJson(ApiResponse::success(domains)))
}

pub async fn update_domain(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateDomain>,
) -> Result<ResponseJson<ApiResponse<Domain>>, ApiError> {
    Domain::find_by_id(&state.db.pool, id, user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Domain not found".to_string()))?;
    Domain::update(&state.db.pool, id, user_id, &payload).await?;
    let domain = Domain::find_by_id(&state.db.pool, id, user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Domain not found".to_string()))?;
    Ok(ResponseJson(ApiResponse::success(domain)))
}

pub async fn archive_domain(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    Domain::find_by_id(&state.db.pool, id, user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Domain not found".to_string()))?;
    Domain::set_archived(&state.db.pool, id, user_id, true).await?;
    Ok(ResponseJson(ApiResponse::success(())))
}
