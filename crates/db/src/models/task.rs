use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool, types::Json};
use strum_macros::{Display, EnumString};
use ts_rs::TS;
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, sqlx::Type, Serialize, Deserialize, PartialEq, TS, EnumString, Display, Default,
)]
#[sqlx(type_name = "task_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Completed,
    Archived,
}

#[derive(
    Debug, Clone, Copy, sqlx::Type, Serialize, Deserialize, PartialEq, TS, EnumString, Display, Default,
)]
#[sqlx(type_name = "clarity", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Clarity {
    Autopilot,
    #[default]
    Normal,
    Brainstorm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS, EnumString, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RecurrenceFrequency {
    Daily,
    Weekly,
    Monthly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS, EnumString, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RuleWeekday {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl From<RuleWeekday> for chrono::Weekday {
    fn from(value: RuleWeekday) -> Self {
        match value {
            RuleWeekday::Mon => chrono::Weekday::Mon,
            RuleWeekday::Tue => chrono::Weekday::Tue,
            RuleWeekday::Wed => chrono::Weekday::Wed,
            RuleWeekday::Thu => chrono::Weekday::Thu,
            RuleWeekday::Fri => chrono::Weekday::Fri,
            RuleWeekday::Sat => chrono::Weekday::Sat,
            RuleWeekday::Sun => chrono::Weekday::Sun,
        }
    }
}

fn default_interval() -> u32 {
    1
}

/// Structured recurrence rule, stored as a JSON column on the task row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
pub struct RecurrenceRule {
    pub frequency: RecurrenceFrequency,
    #[serde(default = "default_interval")]
    pub interval: u32,
    /// Weekly only; empty means "the anchor date's weekday".
    #[serde(default)]
    pub weekdays: Vec<RuleWeekday>,
    /// Monthly only; falls back to the anchor date's day-of-month.
    pub month_day: Option<u32>,
    pub until: Option<NaiveDate>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct Task {
    pub id: Uuid,
    pub user_id: Uuid,
    pub domain_id: Option<Uuid>,
    pub parent_id: Option<Uuid>,
    pub title: String,
    pub description: Option<String>,
    pub clarity: Clarity,
    pub impact: i64,
    pub duration_minutes: Option<i64>,
    pub scheduled_date: Option<NaiveDate>,
    pub scheduled_time: Option<NaiveTime>,
    pub is_recurring: bool,
    #[ts(as = "Option<RecurrenceRule>")]
    pub recurrence_rule: Option<Json<RecurrenceRule>>,
    pub status: TaskStatus,
    pub completed_at: Option<DateTime<Utc>>,
    pub external_id: Option<String>,
    pub source: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct CreateTask {
    pub title: String,
    pub description: Option<String>,
    pub domain_id: Option<Uuid>,
    pub parent_id: Option<Uuid>,
    pub clarity: Option<Clarity>,
    pub impact: Option<i64>,
    pub duration_minutes: Option<i64>,
    pub scheduled_date: Option<NaiveDate>,
    pub scheduled_time: Option<NaiveTime>,
    pub recurrence_rule: Option<RecurrenceRule>,
    pub external_id: Option<String>,
    pub source: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, TS)]
pub struct UpdateTask {
    pub title: Option<String>,
    pub description: Option<String>,
    pub domain_id: Option<Uuid>,
    pub clarity: Option<Clarity>,
    pub impact: Option<i64>,
    pub duration_minutes: Option<i64>,
}

const TASK_COLUMNS: &str = "id, user_id, domain_id, parent_id, title, description, clarity, impact,
    duration_minutes, scheduled_date, scheduled_time, is_recurring, recurrence_rule, status,
    completed_at, external_id, source, created_at, updated_at";

impl Task {
    pub async fn create(
        pool: &SqlitePool,
        user_id: Uuid,
        data: &CreateTask,
    ) -> Result<Task, sqlx::Error> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let is_recurring = data.recurrence_rule.is_some();
        let rule = data.recurrence_rule.clone().map(Json);
        sqlx::query(
            "INSERT INTO tasks (id, user_id, domain_id, parent_id, title, description, clarity,
                                impact, duration_minutes, scheduled_date, scheduled_time,
                                is_recurring, recurrence_rule, status, external_id, source,
                                created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, 'pending', $14, $15, $16, $16)",
        )
        .bind(id)
        .bind(user_id)
        .bind(data.domain_id)
        .bind(data.parent_id)
        .bind(&data.title)
        .bind(&data.description)
        .bind(data.clarity.unwrap_or_default())
        .bind(data.impact.unwrap_or(2))
        .bind(data.duration_minutes)
        .bind(data.scheduled_date)
        .bind(data.scheduled_time)
        .bind(is_recurring)
        .bind(&rule)
        .bind(&data.external_id)
        .bind(&data.source)
        .bind(now)
        .execute(pool)
        .await?;

        Ok(Task {
            id,
            user_id,
            domain_id: data.domain_id,
            parent_id: data.parent_id,
            title: data.title.clone(),
            description: data.description.clone(),
            clarity: data.clarity.unwrap_or_default(),
            impact: data.impact.unwrap_or(2),
            duration_minutes: data.duration_minutes,
            scheduled_date: data.scheduled_date,
            scheduled_time: data.scheduled_time,
            is_recurring,
            recurrence_rule: rule,
            status: TaskStatus::Pending,
            completed_at: None,
            external_id: data.external_id.clone(),
            source: data.source.clone(),
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn find_by_id(
        pool: &SqlitePool,
        id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<Task>, sqlx::Error> {
        sqlx::query_as::<_, Task>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1 AND user_id = $2"
        ))
        .bind(id)
        .bind(user_id)
        .fetch_optional(pool)
        .await
    }

    pub async fn find_by_user_id(
        pool: &SqlitePool,
        user_id: Uuid,
        domain_id: Option<Uuid>,
        status: Option<TaskStatus>,
    ) -> Result<Vec<Task>, sqlx::Error> {
        sqlx::query_as::<_, Task>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
              WHERE user_id = $1
                AND ($2 IS NULL OR domain_id = $2)
                AND ($3 IS NULL OR status = $3)
              ORDER BY created_at DESC"
        ))
        .bind(user_id)
        .bind(domain_id)
        .bind(status)
        .fetch_all(pool)
        .await
    }

    pub async fn update(
        pool: &SqlitePool,
        id: Uuid,
        user_id: Uuid,
        data: &UpdateTask,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE tasks
                SET title = COALESCE($3, title),
                    description = COALESCE($4, description),
                    domain_id = COALESCE($5, domain_id),
                    clarity = COALESCE($6, clarity),
                    impact = COALESCE($7, impact),
                    duration_minutes = COALESCE($8, duration_minutes),
                    updated_at = $9
              WHERE id = $1 AND user_id = $2",
        )
        .bind(id)
        .bind(user_id)
        .bind(&data.title)
        .bind(&data.description)
        .bind(data.domain_id)
        .bind(data.clarity)
        .bind(data.impact)
        .bind(data.duration_minutes)
        .bind(Utc::now())
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Sets (or clears) the schedule. Distinct from `update` because None here
    /// means "unschedule", not "leave unchanged".
    pub async fn set_schedule(
        pool: &SqlitePool,
        id: Uuid,
        user_id: Uuid,
        scheduled_date: Option<NaiveDate>,
        scheduled_time: Option<NaiveTime>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE tasks SET scheduled_date = $3, scheduled_time = $4, updated_at = $5
              WHERE id = $1 AND user_id = $2",
        )
        .bind(id)
        .bind(user_id)
        .bind(scheduled_date)
        .bind(scheduled_time)
        .bind(Utc::now())
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Replaces the recurrence rule. None turns the task back into a one-off.
    pub async fn set_recurrence(
        pool: &SqlitePool,
        id: Uuid,
        user_id: Uuid,
        rule: Option<&RecurrenceRule>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE tasks SET is_recurring = $3, recurrence_rule = $4, updated_at = $5
              WHERE id = $1 AND user_id = $2",
        )
        .bind(id)
        .bind(user_id)
        .bind(rule.is_some())
        .bind(rule.map(|r| Json(r.clone())))
        .bind(Utc::now())
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn set_status(
        pool: &SqlitePool,
        id: Uuid,
        user_id: Uuid,
        status: TaskStatus,
    ) -> Result<(), sqlx::Error> {
        let completed_at = matches!(status, TaskStatus::Completed).then(Utc::now);
        sqlx::query(
            "UPDATE tasks SET status = $3, completed_at = $4, updated_at = $5
              WHERE id = $1 AND user_id = $2",
        )
        .bind(id)
        .bind(user_id)
        .bind(status)
        .bind(completed_at)
        .bind(Utc::now())
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Non-recurring pending tasks with a scheduled date: the task-level half of
    /// the schedulable set pushed to the calendar. Stable order.
    pub async fn find_schedulable_by_user(
        pool: &SqlitePool,
        user_id: Uuid,
    ) -> Result<Vec<Task>, sqlx::Error> {
        sqlx::query_as::<_, Task>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
              WHERE user_id = $1 AND status = 'pending' AND is_recurring = 0
                AND scheduled_date IS NOT NULL
              ORDER BY scheduled_date ASC, created_at ASC, id ASC"
        ))
        .bind(user_id)
        .fetch_all(pool)
        .await
    }

    pub async fn find_recurring_by_user(
        pool: &SqlitePool,
        user_id: Uuid,
    ) -> Result<Vec<Task>, sqlx::Error> {
        sqlx::query_as::<_, Task>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
              WHERE user_id = $1 AND status = 'pending' AND is_recurring = 1
              ORDER BY created_at ASC, id ASC"
        ))
        .bind(user_id)
        .fetch_all(pool)
        .await
    }

    /// Users touched by the materialization sweep.
    pub async fn find_user_ids_with_recurring_tasks(
        pool: &SqlitePool,
    ) -> Result<Vec<Uuid>, sqlx::Error> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT DISTINCT user_id FROM tasks WHERE is_recurring = 1 AND status = 'pending'
              ORDER BY user_id",
        )
        .fetch_all(pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}
