pub mod error;
pub mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::FromRequestParts, http::request::Parts};
use db::DBService;
use db::models::user::UserPreferences;
use services::services::{
    gcal::{CalendarApi, CalendarApiFactory, GCalSyncService, GoogleCalendarClient, ResyncService},
    recurrence::RecurrenceService,
    sync_locks::SyncLockRegistry,
};
use thiserror::Error;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::ApiError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    Bind(#[from] std::io::Error),
}

#[derive(Clone)]
pub struct AppState {
    pub db: DBService,
    pub sync_locks: SyncLockRegistry,
    http: reqwest::Client,
}

impl AppState {
    pub fn new(db: DBService) -> Self {
        Self {
            db,
            sync_locks: SyncLockRegistry::new(),
            http: reqwest::Client::new(),
        }
    }

    pub fn recurrence(&self) -> RecurrenceService {
        RecurrenceService::new(self.db.pool.clone())
    }

    /// Builds a calendar sync service bound to the user's stored token. The
    /// shared connection pool is reused; only the bearer token differs per user.
    pub fn calendar_sync(&self, prefs: &UserPreferences) -> Result<GCalSyncService, ApiError> {
        let token = prefs.gcal_access_token.clone().ok_or_else(|| {
            ApiError::BadRequest("Google Calendar account is not connected".to_string())
        })?;
        let client = GoogleCalendarClient::with_client(self.http.clone(), token);
        Ok(GCalSyncService::new(self.db.pool.clone(), Arc::new(client)))
    }

    /// Starts the periodic resync sweep that pushes materializer-created
    /// instances and retries runs aborted by rate limiting.
    pub fn spawn_resync(&self) -> JoinHandle<()> {
        let http = self.http.clone();
        let factory: CalendarApiFactory = Arc::new(move |prefs: &UserPreferences| {
            prefs.gcal_access_token.clone().map(|token| {
                Arc::new(GoogleCalendarClient::with_client(http.clone(), token))
                    as Arc<dyn CalendarApi>
            })
        });
        ResyncService::spawn(self.db.pool.clone(), self.sync_locks.clone(), factory)
    }
}

/// Acting user, taken from the `x-user-id` header. Authentication mechanics
/// live upstream; handlers only need the scoping id.
pub struct UserId(pub Uuid);

impl<S> FromRequestParts<S> for UserId
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::Unauthorized("Missing x-user-id header".to_string()))?;
        let user_id = header
            .parse::<Uuid>()
            .map_err(|_| ApiError::Unauthorized("Invalid x-user-id header".to_string()))?;
        Ok(UserId(user_id))
    }
}

/// Binds the listener and spawns the server task with graceful shutdown.
pub async fn start_server(
    state: AppState,
    addr: SocketAddr,
) -> Result<(SocketAddr, JoinHandle<()>), ServerError> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    let app = routes::router(state);

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
        {
            tracing::error!(error = %e, "Server exited with error");
        }
    });

    Ok((local_addr, handle))
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
