//! Scheduled background resync.
//!
//! Edit-triggered single-item pushes and user-triggered bulk runs cover the
//! common cases, but two situations only heal on a timer: runs aborted by
//! rate-limit exhaustion, and instances created by the materializer sweep
//! after the last push. Each sweep re-runs bulk sync for every user with sync
//! enabled; the hash diff makes an already-current user a no-op with zero
//! API calls.

use std::sync::Arc;

use db::models::user::UserPreferences;
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::client::CalendarApi;
use super::sync::{BulkSyncOutcome, GCalSyncService};
use crate::services::sync_locks::SyncLockRegistry;

const RESYNC_INTERVAL_SECONDS: u64 = 15 * 60;

/// Builds a per-user calendar client from stored credentials. `None` means the
/// user has no usable token and is skipped this sweep.
pub type CalendarApiFactory =
    Arc<dyn Fn(&UserPreferences) -> Option<Arc<dyn CalendarApi>> + Send + Sync>;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ResyncStats {
    pub completed: usize,
    pub rate_limited: usize,
    /// Lock already held, missing credentials, or sync turned off mid-sweep.
    pub skipped: usize,
    pub failed: usize,
}

pub struct ResyncService;

impl ResyncService {
    /// Spawns the periodic resync loop. The first sweep runs immediately so a
    /// restart doesn't delay recovery of a previously aborted run.
    pub fn spawn(
        pool: SqlitePool,
        locks: SyncLockRegistry,
        factory: CalendarApiFactory,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(RESYNC_INTERVAL_SECONDS));
            loop {
                interval.tick().await;
                match Self::sweep(&pool, &locks, &factory).await {
                    Ok(stats) => info!(
                        completed = stats.completed,
                        rate_limited = stats.rate_limited,
                        skipped = stats.skipped,
                        failed = stats.failed,
                        "Scheduled calendar resync complete"
                    ),
                    Err(e) => error!(error = %e, "Scheduled calendar resync failed"),
                }
            }
        })
    }

    /// One pass over every user with sync enabled. Per-user failures are
    /// logged and do not stop the rest; a user whose sync is already running
    /// is skipped, never queued behind.
    pub async fn sweep(
        pool: &SqlitePool,
        locks: &SyncLockRegistry,
        factory: &CalendarApiFactory,
    ) -> Result<ResyncStats, sqlx::Error> {
        let mut stats = ResyncStats::default();
        for user_id in UserPreferences::find_user_ids_with_sync_enabled(pool).await? {
            let Some(prefs) = UserPreferences::find_by_user_id(pool, user_id).await? else {
                continue;
            };
            let Some(api) = factory(&prefs) else {
                warn!(%user_id, "Sync enabled but no calendar credentials, skipping");
                stats.skipped += 1;
                continue;
            };
            let Some(guard) = locks.try_begin(user_id) else {
                stats.skipped += 1;
                continue;
            };

            let sync = GCalSyncService::new(pool.clone(), api);
            match sync.bulk_sync(user_id, &guard).await {
                Ok(BulkSyncOutcome::Completed { .. }) => stats.completed += 1,
                Ok(BulkSyncOutcome::RateLimited { processed }) => {
                    info!(%user_id, processed, "Scheduled sync rate limited, retrying next sweep");
                    stats.rate_limited += 1;
                }
                Ok(BulkSyncOutcome::CalendarRevoked) => {
                    warn!(%user_id, "Scheduled sync disabled by calendar-level error");
                    stats.failed += 1;
                }
                Ok(BulkSyncOutcome::NotEnabled) => stats.skipped += 1,
                Err(e) => {
                    error!(%user_id, error = %e, "Scheduled sync failed");
                    stats.failed += 1;
                }
            }
        }
        Ok(stats)
    }
}
