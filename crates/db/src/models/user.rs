use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use ts_rs::TS;
use uuid::Uuid;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct CreateUser {
    pub email: String,
    pub display_name: Option<String>,
}

impl User {
    /// Creates the user together with a default preferences row.
    pub async fn create(pool: &SqlitePool, data: &CreateUser) -> Result<User, sqlx::Error> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO users (id, email, display_name, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(id)
        .bind(&data.email)
        .bind(&data.display_name)
        .bind(now)
        .execute(pool)
        .await?;

        UserPreferences::create_default(pool, id).await?;

        Ok(User {
            id,
            email: data.email.clone(),
            display_name: data.display_name.clone(),
            created_at: now,
        })
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>("SELECT id, email, display_name, created_at FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn find_by_email(pool: &SqlitePool, email: &str) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            "SELECT id, email, display_name, created_at FROM users WHERE email = $1",
        )
        .bind(email)
        .fetch_optional(pool)
        .await
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct UserPreferences {
    pub user_id: Uuid,
    pub gcal_sync_enabled: bool,
    pub gcal_calendar_id: Option<String>,
    /// Managed by the external auth module; stored opaquely, never serialized out.
    #[serde(skip_serializing)]
    pub gcal_access_token: Option<String>,
    pub gcal_sync_error: Option<String>,
    pub instance_retention_days: i64,
    pub materialize_horizon_days: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, TS)]
pub struct UpdatePreferences {
    pub gcal_access_token: Option<String>,
    pub instance_retention_days: Option<i64>,
    pub materialize_horizon_days: Option<i64>,
}

impl UserPreferences {
    pub async fn create_default(pool: &SqlitePool, user_id: Uuid) -> Result<(), sqlx::Error> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO user_preferences (user_id, created_at, updated_at) VALUES ($1, $2, $2)",
        )
        .bind(user_id)
        .bind(now)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn find_by_user_id(
        pool: &SqlitePool,
        user_id: Uuid,
    ) -> Result<Option<UserPreferences>, sqlx::Error> {
        sqlx::query_as::<_, UserPreferences>(
            "SELECT user_id, gcal_sync_enabled, gcal_calendar_id, gcal_access_token,
                    gcal_sync_error, instance_retention_days, materialize_horizon_days,
                    created_at, updated_at
               FROM user_preferences WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(pool)
        .await
    }

    pub async fn update(
        pool: &SqlitePool,
        user_id: Uuid,
        data: &UpdatePreferences,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE user_preferences
                SET gcal_access_token = COALESCE($2, gcal_access_token),
                    instance_retention_days = COALESCE($3, instance_retention_days),
                    materialize_horizon_days = COALESCE($4, materialize_horizon_days),
                    updated_at = $5
              WHERE user_id = $1",
        )
        .bind(user_id)
        .bind(&data.gcal_access_token)
        .bind(data.instance_retention_days)
        .bind(data.materialize_horizon_days)
        .bind(Utc::now())
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Called on successful enable: stores the resolved calendar and clears any
    /// previous error banner.
    pub async fn enable_sync(
        pool: &SqlitePool,
        user_id: Uuid,
        calendar_id: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE user_preferences
                SET gcal_sync_enabled = 1, gcal_calendar_id = $2, gcal_sync_error = NULL,
                    updated_at = $3
              WHERE user_id = $1",
        )
        .bind(user_id)
        .bind(calendar_id)
        .bind(Utc::now())
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Clears the enablement flag only; remote events and the stored calendar id
    /// are left in place so a re-enable can reuse them.
    pub async fn disable_sync(pool: &SqlitePool, user_id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE user_preferences SET gcal_sync_enabled = 0, updated_at = $2 WHERE user_id = $1",
        )
        .bind(user_id)
        .bind(Utc::now())
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Circuit-breaker path: disables sync, forgets the calendar, and persists a
    /// user-visible error message.
    pub async fn record_sync_failure(
        pool: &SqlitePool,
        user_id: Uuid,
        message: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE user_preferences
                SET gcal_sync_enabled = 0, gcal_calendar_id = NULL, gcal_sync_error = $2,
                    updated_at = $3
              WHERE user_id = $1",
        )
        .bind(user_id)
        .bind(message)
        .bind(Utc::now())
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn find_user_ids_with_sync_enabled(
        pool: &SqlitePool,
    ) -> Result<Vec<Uuid>, sqlx::Error> {
        let rows: Vec<(Uuid,)> =
            sqlx::query_as("SELECT user_id FROM user_preferences WHERE gcal_sync_enabled = 1")
                .fetch_all(pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}
