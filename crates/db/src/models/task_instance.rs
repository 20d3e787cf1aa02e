use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use strum_macros::{Display, EnumString};
use ts_rs::TS;
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, sqlx::Type, Serialize, Deserialize, PartialEq, Eq, TS, EnumString, Display, Default,
)]
#[sqlx(type_name = "instance_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum InstanceStatus {
    #[default]
    Pending,
    Completed,
    Skipped,
}

impl InstanceStatus {
    /// Instance lifecycle: `pending → completed | skipped`, with explicit undo
    /// back to pending. `completed ↔ skipped` never happens directly.
    pub fn can_transition_to(self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;
        matches!(
            (self, next),
            (Pending, Completed) | (Pending, Skipped) | (Completed, Pending) | (Skipped, Pending)
        )
    }
}

/// One dated occurrence of a recurring task. Entirely derived state, except
/// that completed/skipped rows record a user decision and must survive
/// regeneration.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct TaskInstance {
    pub id: Uuid,
    pub task_id: Uuid,
    pub instance_date: NaiveDate,
    pub status: InstanceStatus,
    pub scheduled_datetime: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

const INSTANCE_COLUMNS: &str =
    "id, task_id, instance_date, status, scheduled_datetime, completed_at, created_at";

impl TaskInstance {
    pub async fn create_pending(
        pool: &SqlitePool,
        task_id: Uuid,
        instance_date: NaiveDate,
        scheduled_datetime: Option<DateTime<Utc>>,
    ) -> Result<TaskInstance, sqlx::Error> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO task_instances (id, task_id, instance_date, status, scheduled_datetime, created_at)
             VALUES ($1, $2, $3, 'pending', $4, $5)",
        )
        .bind(id)
        .bind(task_id)
        .bind(instance_date)
        .bind(scheduled_datetime)
        .bind(now)
        .execute(pool)
        .await?;

        Ok(TaskInstance {
            id,
            task_id,
            instance_date,
            status: InstanceStatus::Pending,
            scheduled_datetime,
            completed_at: None,
            created_at: now,
        })
    }

    pub async fn find_by_id(
        pool: &SqlitePool,
        id: Uuid,
    ) -> Result<Option<TaskInstance>, sqlx::Error> {
        sqlx::query_as::<_, TaskInstance>(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM task_instances WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    pub async fn find_by_task_id(
        pool: &SqlitePool,
        task_id: Uuid,
    ) -> Result<Vec<TaskInstance>, sqlx::Error> {
        sqlx::query_as::<_, TaskInstance>(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM task_instances WHERE task_id = $1
              ORDER BY instance_date ASC"
        ))
        .bind(task_id)
        .fetch_all(pool)
        .await
    }

    pub async fn find_dates_by_task_id(
        pool: &SqlitePool,
        task_id: Uuid,
    ) -> Result<Vec<NaiveDate>, sqlx::Error> {
        let rows: Vec<(NaiveDate,)> =
            sqlx::query_as("SELECT instance_date FROM task_instances WHERE task_id = $1")
                .bind(task_id)
                .fetch_all(pool)
                .await?;
        Ok(rows.into_iter().map(|(d,)| d).collect())
    }

    /// Future pending instances only; completed/skipped rows are never part of
    /// a regeneration delete set.
    pub async fn find_pending_from(
        pool: &SqlitePool,
        task_id: Uuid,
        from: NaiveDate,
    ) -> Result<Vec<TaskInstance>, sqlx::Error> {
        sqlx::query_as::<_, TaskInstance>(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM task_instances
              WHERE task_id = $1 AND status = 'pending' AND instance_date >= $2
              ORDER BY instance_date ASC"
        ))
        .bind(task_id)
        .bind(from)
        .fetch_all(pool)
        .await
    }

    /// Pending instances of pending recurring tasks, in stable order: the
    /// instance-level half of the schedulable set pushed to the calendar.
    pub async fn find_schedulable_by_user(
        pool: &SqlitePool,
        user_id: Uuid,
    ) -> Result<Vec<SchedulableInstance>, sqlx::Error> {
        sqlx::query_as::<_, SchedulableInstance>(
            "SELECT i.id, i.task_id, i.instance_date, t.title, t.scheduled_time, t.duration_minutes
               FROM task_instances i
               JOIN tasks t ON t.id = i.task_id
              WHERE t.user_id = $1 AND t.status = 'pending' AND i.status = 'pending'
              ORDER BY i.instance_date ASC, i.id ASC",
        )
        .bind(user_id)
        .fetch_all(pool)
        .await
    }

    pub async fn set_status(
        pool: &SqlitePool,
        id: Uuid,
        status: InstanceStatus,
    ) -> Result<(), sqlx::Error> {
        let completed_at = matches!(status, InstanceStatus::Completed).then(Utc::now);
        sqlx::query(
            "UPDATE task_instances SET status = $2, completed_at = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(status)
        .bind(completed_at)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn delete(pool: &SqlitePool, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM task_instances WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Retention pruning: completed/skipped instances older than the cutoff.
    /// Pending rows are kept — they still represent open work.
    pub async fn prune_finished_before(
        pool: &SqlitePool,
        user_id: Uuid,
        cutoff: NaiveDate,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM task_instances
              WHERE instance_date < $2
                AND status IN ('completed', 'skipped')
                AND task_id IN (SELECT id FROM tasks WHERE user_id = $1)",
        )
        .bind(user_id)
        .bind(cutoff)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// Joined row used by the sync pipeline: instance plus the task fields that
/// project onto the calendar event.
#[derive(Debug, Clone, FromRow)]
pub struct SchedulableInstance {
    pub id: Uuid,
    pub task_id: Uuid,
    pub instance_date: NaiveDate,
    pub title: String,
    pub scheduled_time: Option<chrono::NaiveTime>,
    pub duration_minutes: Option<i64>,
}
