//! Periodic background sweep keeping the instance table warm.
//!
//! Every hour, for every user with recurring tasks: materialize instances out
//! to the user's horizon, then prune finished instances past their retention
//! window. Both operations are idempotent, so the sweep tolerates overlap with
//! request-driven materialization and with its own previous runs.

use chrono::{Days, Utc};
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use db::models::{task::Task, user::UserPreferences};

use super::recurrence::{RecurrenceError, RecurrenceService};

const SWEEP_INTERVAL_SECONDS: u64 = 60 * 60;

const DEFAULT_HORIZON_DAYS: u64 = 60;
const DEFAULT_RETENTION_DAYS: u64 = 90;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub users: usize,
    pub instances_created: usize,
    pub instances_pruned: u64,
}

pub struct MaterializerService;

impl MaterializerService {
    /// Spawns the hourly sweep loop. The first sweep runs immediately so a
    /// freshly started server has instances before any request arrives.
    pub fn spawn(pool: SqlitePool) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(SWEEP_INTERVAL_SECONDS));
            loop {
                interval.tick().await;
                match Self::sweep(&pool).await {
                    Ok(stats) => {
                        info!(
                            users = stats.users,
                            created = stats.instances_created,
                            pruned = stats.instances_pruned,
                            "Materialization sweep complete"
                        );
                    }
                    Err(e) => error!(error = %e, "Materialization sweep failed"),
                }
            }
        })
    }

    /// One full pass over every user with recurring tasks. A failure for one
    /// user is logged and does not stop the others.
    pub async fn sweep(pool: &SqlitePool) -> Result<SweepStats, RecurrenceError> {
        let mut stats = SweepStats::default();
        for user_id in Task::find_user_ids_with_recurring_tasks(pool).await? {
            match Self::sweep_user(pool, user_id).await {
                Ok((created, pruned)) => {
                    stats.users += 1;
                    stats.instances_created += created;
                    stats.instances_pruned += pruned;
                }
                Err(e) => {
                    error!(%user_id, error = %e, "Materialization failed for user");
                }
            }
        }
        Ok(stats)
    }

    pub async fn sweep_user(
        pool: &SqlitePool,
        user_id: Uuid,
    ) -> Result<(usize, u64), RecurrenceError> {
        let prefs = UserPreferences::find_by_user_id(pool, user_id).await?;
        let horizon_days = prefs
            .as_ref()
            .map(|p| p.materialize_horizon_days.max(1) as u64)
            .unwrap_or(DEFAULT_HORIZON_DAYS);
        let retention_days = prefs
            .as_ref()
            .map(|p| p.instance_retention_days.max(1) as u64)
            .unwrap_or(DEFAULT_RETENTION_DAYS);

        let today = Utc::now().date_naive();
        let horizon_end = today + Days::new(horizon_days);

        let service = RecurrenceService::new(pool.clone());
        let mut created = 0;
        for task in Task::find_recurring_by_user(pool, user_id).await? {
            created += service.materialize(&task, today, horizon_end).await?;
        }

        let cutoff = today - Days::new(retention_days);
        let pruned = db::models::task_instance::TaskInstance::prune_finished_before(
            pool, user_id, cutoff,
        )
        .await?;

        Ok((created, pruned))
    }
}
