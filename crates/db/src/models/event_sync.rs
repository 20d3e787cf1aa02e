use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use ts_rs::TS;
use uuid::Uuid;

/// Maps a task (or a single instance of a recurring task) to its Google
/// Calendar event. The single source of truth for push decisions: no row means
/// "never synced", a stale hash means "needs update", a matching hash means
/// "skip".
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct CalendarEventSync {
    pub id: Uuid,
    pub user_id: Uuid,
    pub task_id: Uuid,
    pub instance_id: Option<Uuid>,
    pub event_id: String,
    pub sync_hash: String,
    pub synced_at: DateTime<Utc>,
}

const SYNC_COLUMNS: &str = "id, user_id, task_id, instance_id, event_id, sync_hash, synced_at";

impl CalendarEventSync {
    /// Insert-or-update keyed by (task_id, instance_id). SQLite needs separate
    /// conflict targets for the NULL and non-NULL instance cases (partial
    /// unique indexes).
    pub async fn upsert(
        pool: &SqlitePool,
        user_id: Uuid,
        task_id: Uuid,
        instance_id: Option<Uuid>,
        event_id: &str,
        sync_hash: &str,
    ) -> Result<(), sqlx::Error> {
        let now = Utc::now();
        if let Some(instance_id) = instance_id {
            sqlx::query(
                "INSERT INTO calendar_event_syncs (id, user_id, task_id, instance_id, event_id, sync_hash, synced_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (task_id, instance_id) WHERE instance_id IS NOT NULL
                 DO UPDATE SET event_id = excluded.event_id, sync_hash = excluded.sync_hash,
                               synced_at = excluded.synced_at",
            )
            .bind(Uuid::new_v4())
            .bind(user_id)
            .bind(task_id)
            .bind(instance_id)
            .bind(event_id)
            .bind(sync_hash)
            .bind(now)
            .execute(pool)
            .await?;
        } else {
            sqlx::query(
                "INSERT INTO calendar_event_syncs (id, user_id, task_id, instance_id, event_id, sync_hash, synced_at)
                 VALUES ($1, $2, $3, NULL, $4, $5, $6)
                 ON CONFLICT (task_id) WHERE instance_id IS NULL
                 DO UPDATE SET event_id = excluded.event_id, sync_hash = excluded.sync_hash,
                               synced_at = excluded.synced_at",
            )
            .bind(Uuid::new_v4())
            .bind(user_id)
            .bind(task_id)
            .bind(event_id)
            .bind(sync_hash)
            .bind(now)
            .execute(pool)
            .await?;
        }
        Ok(())
    }

    pub async fn find_by_user_id(
        pool: &SqlitePool,
        user_id: Uuid,
    ) -> Result<Vec<CalendarEventSync>, sqlx::Error> {
        sqlx::query_as::<_, CalendarEventSync>(&format!(
            "SELECT {SYNC_COLUMNS} FROM calendar_event_syncs WHERE user_id = $1
              ORDER BY synced_at ASC, id ASC"
        ))
        .bind(user_id)
        .fetch_all(pool)
        .await
    }

    pub async fn find_for_item(
        pool: &SqlitePool,
        task_id: Uuid,
        instance_id: Option<Uuid>,
    ) -> Result<Option<CalendarEventSync>, sqlx::Error> {
        sqlx::query_as::<_, CalendarEventSync>(&format!(
            "SELECT {SYNC_COLUMNS} FROM calendar_event_syncs
              WHERE task_id = $1 AND ((instance_id IS NULL AND $2 IS NULL) OR instance_id = $2)"
        ))
        .bind(task_id)
        .bind(instance_id)
        .fetch_optional(pool)
        .await
    }

    pub async fn delete(pool: &SqlitePool, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM calendar_event_syncs WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn delete_by_user_id(pool: &SqlitePool, user_id: Uuid) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM calendar_event_syncs WHERE user_id = $1")
            .bind(user_id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}
