pub mod calendar;
pub mod domains;
pub mod instances;
pub mod preferences;
pub mod tasks;
pub mod users;

use axum::{
    Router,
    routing::{get, post, put},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/users", post(users::create_user))
        .route("/api/users/me", get(users::get_current_user))
        .route("/api/domains", post(domains::create_domain).get(domains::list_domains))
        .route("/api/domains/{id}", put(domains::update_domain))
        .route("/api/domains/{id}/archive", post(domains::archive_domain))
        .route("/api/tasks", post(tasks::create_task).get(tasks::list_tasks))
        .route("/api/tasks/{id}", get(tasks::get_task).put(tasks::update_task))
        .route("/api/tasks/{id}/complete", post(tasks::complete_task))
        .route("/api/tasks/{id}/uncomplete", post(tasks::uncomplete_task))
        .route("/api/tasks/{id}/archive", post(tasks::archive_task))
        .route("/api/tasks/{id}/restore", post(tasks::restore_task))
        .route("/api/tasks/{id}/instances", get(instances::list_instances))
        .route("/api/instances/{id}/complete", post(instances::complete_instance))
        .route("/api/instances/{id}/skip", post(instances::skip_instance))
        .route("/api/instances/{id}/uncomplete", post(instances::uncomplete_instance))
        .route("/api/calendar/enable", post(calendar::enable_sync))
        .route("/api/calendar/full-sync", post(calendar::full_sync))
        .route("/api/calendar/status", get(calendar::sync_status))
        .route("/api/calendar/disable", post(calendar::disable_sync))
        .route(
            "/api/preferences",
            get(preferences::get_preferences).put(preferences::update_preferences),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
