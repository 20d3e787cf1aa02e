//! Recurring-task instance materialization.
//!
//! Expands a task's recurrence rule into concrete `TaskInstance` rows up to a
//! rolling horizon, and owns the per-instance status state machine.

use chrono::{Datelike, Days, NaiveDate};
use db::models::{
    task::{RecurrenceFrequency, RecurrenceRule, Task},
    task_instance::{InstanceStatus, TaskInstance},
};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RecurrenceError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("Task instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("Invalid instance transition: {from} -> {to}")]
    InvalidTransition {
        from: InstanceStatus,
        to: InstanceStatus,
    },
}

/// Computes the occurrence dates a rule implies within `[from, horizon_end]`.
///
/// `anchor` is the rule's start date: intervals count from it, and no
/// occurrence precedes it. A rule-level `until` further caps the window.
pub fn occurrences(
    rule: &RecurrenceRule,
    anchor: NaiveDate,
    from: NaiveDate,
    horizon_end: NaiveDate,
) -> Vec<NaiveDate> {
    let interval = rule.interval.max(1) as i64;
    let end = match rule.until {
        Some(until) => until.min(horizon_end),
        None => horizon_end,
    };
    let start = from.max(anchor);
    if start > end {
        return Vec::new();
    }

    let mut dates = Vec::new();
    match rule.frequency {
        RecurrenceFrequency::Daily => {
            let offset = (start - anchor).num_days();
            let first =
                anchor + Days::new((offset as u64).div_ceil(interval as u64) * interval as u64);
            let mut d = first;
            while d <= end {
                dates.push(d);
                d = d + Days::new(interval as u64);
            }
        }
        RecurrenceFrequency::Weekly => {
            let weekdays: Vec<chrono::Weekday> = if rule.weekdays.is_empty() {
                vec![anchor.weekday()]
            } else {
                rule.weekdays.iter().map(|&w| w.into()).collect()
            };
            // Week index counts from the Monday of the anchor's week.
            let anchor_week = anchor - Days::new(anchor.weekday().num_days_from_monday() as u64);
            let mut d = start;
            while d <= end {
                let week = (d - anchor_week).num_days() / 7;
                if week % interval == 0 && weekdays.contains(&d.weekday()) {
                    dates.push(d);
                }
                d = d + Days::new(1);
            }
        }
        RecurrenceFrequency::Monthly => {
            let day = rule.month_day.unwrap_or(anchor.day());
            let anchor_month = anchor.year() as i64 * 12 + anchor.month0() as i64;
            let mut k = 0i64;
            loop {
                let months = anchor_month + k * interval;
                let (year, month0) = (months.div_euclid(12), months.rem_euclid(12));
                let Some(first_of_month) =
                    NaiveDate::from_ymd_opt(year as i32, month0 as u32 + 1, 1)
                else {
                    break;
                };
                if first_of_month > end {
                    break;
                }
                // Months without the requested day (e.g. the 31st in February)
                // produce no occurrence.
                if let Some(d) = NaiveDate::from_ymd_opt(year as i32, month0 as u32 + 1, day)
                    && d >= start
                    && d <= end
                {
                    dates.push(d);
                }
                k += 1;
            }
        }
    }
    dates
}

/// Service expanding recurrence rules into `TaskInstance` rows.
#[derive(Clone)]
pub struct RecurrenceService {
    pool: SqlitePool,
}

impl RecurrenceService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn anchor_for(task: &Task) -> NaiveDate {
        task.scheduled_date
            .unwrap_or_else(|| task.created_at.date_naive())
    }

    /// Ensures a `pending` instance exists for every occurrence between `from`
    /// and `horizon_end`. Existing rows are never touched, so repeated calls
    /// are idempotent and the periodic sweep can run it blindly.
    pub async fn materialize(
        &self,
        task: &Task,
        from: NaiveDate,
        horizon_end: NaiveDate,
    ) -> Result<usize, RecurrenceError> {
        let Some(rule) = task.recurrence_rule.as_ref() else {
            return Ok(0);
        };

        let wanted = occurrences(rule, Self::anchor_for(task), from, horizon_end);
        let existing = TaskInstance::find_dates_by_task_id(&self.pool, task.id).await?;

        let mut created = 0;
        for date in wanted {
            if existing.contains(&date) {
                continue;
            }
            let scheduled_datetime = task
                .scheduled_time
                .map(|t| date.and_time(t).and_utc());
            TaskInstance::create_pending(&self.pool, task.id, date, scheduled_datetime).await?;
            created += 1;
        }

        if created > 0 {
            debug!(task_id = %task.id, created, "Materialized recurring task instances");
        }
        Ok(created)
    }

    /// Called after a recurrence rule edit. Deletes future `pending` instances
    /// that the new rule no longer produces, then materializes the new rule.
    /// Completed/skipped instances are preserved unconditionally: the user's
    /// decision outlives any rule edit.
    pub async fn regenerate(
        &self,
        task: &Task,
        from: NaiveDate,
        horizon_end: NaiveDate,
    ) -> Result<(), RecurrenceError> {
        let valid: Vec<NaiveDate> = task
            .recurrence_rule
            .as_ref()
            .map(|rule| occurrences(rule, Self::anchor_for(task), from, horizon_end))
            .unwrap_or_default();

        let mut removed = 0;
        for instance in TaskInstance::find_pending_from(&self.pool, task.id, from).await? {
            if !valid.contains(&instance.instance_date) {
                TaskInstance::delete(&self.pool, instance.id).await?;
                removed += 1;
            }
        }

        let created = self.materialize(task, from, horizon_end).await?;
        info!(task_id = %task.id, removed, created, "Regenerated instances after rule change");
        Ok(())
    }

    pub async fn complete_instance(&self, id: Uuid) -> Result<TaskInstance, RecurrenceError> {
        self.transition(id, InstanceStatus::Completed).await
    }

    pub async fn skip_instance(&self, id: Uuid) -> Result<TaskInstance, RecurrenceError> {
        self.transition(id, InstanceStatus::Skipped).await
    }

    pub async fn uncomplete_instance(&self, id: Uuid) -> Result<TaskInstance, RecurrenceError> {
        self.transition(id, InstanceStatus::Pending).await
    }

    async fn transition(
        &self,
        id: Uuid,
        to: InstanceStatus,
    ) -> Result<TaskInstance, RecurrenceError> {
        let instance = TaskInstance::find_by_id(&self.pool, id)
            .await?
            .ok_or(RecurrenceError::InstanceNotFound(id))?;

        if !instance.status.can_transition_to(to) {
            return Err(RecurrenceError::InvalidTransition {
                from: instance.status,
                to,
            });
        }

        TaskInstance::set_status(&self.pool, id, to).await?;
        TaskInstance::find_by_id(&self.pool, id)
            .await?
            .ok_or(RecurrenceError::InstanceNotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use db::{
        DBService,
        models::{
            task::{Clarity, CreateTask, RuleWeekday},
            user::{CreateUser, User},
        },
    };

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn rule(frequency: RecurrenceFrequency) -> RecurrenceRule {
        RecurrenceRule {
            frequency,
            interval: 1,
            weekdays: Vec::new(),
            month_day: None,
            until: None,
        }
    }

    #[test]
    fn test_daily_every_third_day() {
        let r = RecurrenceRule {
            interval: 3,
            ..rule(RecurrenceFrequency::Daily)
        };
        let got = occurrences(&r, d(2025, 6, 1), d(2025, 6, 1), d(2025, 6, 10));
        assert_eq!(got, vec![d(2025, 6, 1), d(2025, 6, 4), d(2025, 6, 7), d(2025, 6, 10)]);
    }

    #[test]
    fn test_daily_from_after_anchor_keeps_phase() {
        let r = RecurrenceRule {
            interval: 3,
            ..rule(RecurrenceFrequency::Daily)
        };
        // Window starts mid-cycle: occurrences stay phased to the anchor.
        let got = occurrences(&r, d(2025, 6, 1), d(2025, 6, 5), d(2025, 6, 10));
        assert_eq!(got, vec![d(2025, 6, 7), d(2025, 6, 10)]);
    }

    #[test]
    fn test_weekly_with_weekday_set() {
        let r = RecurrenceRule {
            weekdays: vec![RuleWeekday::Mon, RuleWeekday::Thu],
            ..rule(RecurrenceFrequency::Weekly)
        };
        // 2025-06-02 is a Monday.
        let got = occurrences(&r, d(2025, 6, 2), d(2025, 6, 2), d(2025, 6, 13));
        assert_eq!(
            got,
            vec![d(2025, 6, 2), d(2025, 6, 5), d(2025, 6, 9), d(2025, 6, 12)]
        );
    }

    #[test]
    fn test_biweekly_skips_off_weeks() {
        let r = RecurrenceRule {
            interval: 2,
            weekdays: vec![RuleWeekday::Wed],
            ..rule(RecurrenceFrequency::Weekly)
        };
        // Anchor week contains Wed 2025-06-04; the next on-week Wed is 06-18.
        let got = occurrences(&r, d(2025, 6, 2), d(2025, 6, 2), d(2025, 6, 30));
        assert_eq!(got, vec![d(2025, 6, 4), d(2025, 6, 18)]);
    }

    #[test]
    fn test_weekly_empty_set_uses_anchor_weekday() {
        let r = rule(RecurrenceFrequency::Weekly);
        // 2025-06-03 is a Tuesday.
        let got = occurrences(&r, d(2025, 6, 3), d(2025, 6, 3), d(2025, 6, 17));
        assert_eq!(got, vec![d(2025, 6, 3), d(2025, 6, 10), d(2025, 6, 17)]);
    }

    #[test]
    fn test_monthly_skips_short_months() {
        let r = RecurrenceRule {
            month_day: Some(31),
            ..rule(RecurrenceFrequency::Monthly)
        };
        let got = occurrences(&r, d(2025, 1, 31), d(2025, 1, 1), d(2025, 5, 31));
        // February and April have no 31st.
        assert_eq!(got, vec![d(2025, 1, 31), d(2025, 3, 31), d(2025, 5, 31)]);
    }

    #[test]
    fn test_until_caps_the_horizon() {
        let r = RecurrenceRule {
            until: Some(d(2025, 6, 5)),
            ..rule(RecurrenceFrequency::Daily)
        };
        let got = occurrences(&r, d(2025, 6, 1), d(2025, 6, 1), d(2025, 6, 30));
        assert_eq!(got.len(), 5);
        assert_eq!(*got.last().unwrap(), d(2025, 6, 5));
    }

    async fn setup_recurring_task(db: &DBService, r: RecurrenceRule) -> (Uuid, Task) {
        let user = User::create(
            &db.pool,
            &CreateUser {
                email: format!("{}@example.com", Uuid::new_v4()),
                display_name: None,
            },
        )
        .await
        .unwrap();
        let task = Task::create(
            &db.pool,
            user.id,
            &CreateTask {
                title: "Standup notes".to_string(),
                description: None,
                domain_id: None,
                parent_id: None,
                clarity: Some(Clarity::Autopilot),
                impact: None,
                duration_minutes: Some(10),
                scheduled_date: Some(d(2025, 6, 2)),
                scheduled_time: None,
                recurrence_rule: Some(r),
                external_id: None,
                source: None,
            },
        )
        .await
        .unwrap();
        (user.id, task)
    }

    #[tokio::test]
    async fn test_materialize_is_idempotent() {
        let db = DBService::in_memory().await.unwrap();
        let (_, task) = setup_recurring_task(&db, rule(RecurrenceFrequency::Daily)).await;
        let service = RecurrenceService::new(db.pool.clone());

        let created = service
            .materialize(&task, d(2025, 6, 2), d(2025, 6, 8))
            .await
            .unwrap();
        assert_eq!(created, 7);

        let created_again = service
            .materialize(&task, d(2025, 6, 2), d(2025, 6, 8))
            .await
            .unwrap();
        assert_eq!(created_again, 0);

        let instances = TaskInstance::find_by_task_id(&db.pool, task.id).await.unwrap();
        assert_eq!(instances.len(), 7);
    }

    #[tokio::test]
    async fn test_regenerate_preserves_completed_instances() {
        let db = DBService::in_memory().await.unwrap();
        let (user_id, task) = setup_recurring_task(&db, rule(RecurrenceFrequency::Daily)).await;
        let service = RecurrenceService::new(db.pool.clone());

        service
            .materialize(&task, d(2025, 6, 2), d(2025, 6, 8))
            .await
            .unwrap();

        // Complete the instance on June 4th, then switch the rule to
        // Mondays-only, which no longer produces June 4th (a Wednesday).
        let instances = TaskInstance::find_by_task_id(&db.pool, task.id).await.unwrap();
        let wednesday = instances
            .iter()
            .find(|i| i.instance_date == d(2025, 6, 4))
            .unwrap();
        service.complete_instance(wednesday.id).await.unwrap();

        let new_rule = RecurrenceRule {
            weekdays: vec![RuleWeekday::Mon],
            ..rule(RecurrenceFrequency::Weekly)
        };
        Task::set_recurrence(&db.pool, task.id, user_id, Some(&new_rule))
            .await
            .unwrap();
        let task = Task::find_by_id(&db.pool, task.id, user_id)
            .await
            .unwrap()
            .unwrap();

        service
            .regenerate(&task, d(2025, 6, 2), d(2025, 6, 8))
            .await
            .unwrap();

        let after = TaskInstance::find_by_task_id(&db.pool, task.id).await.unwrap();
        // The completed Wednesday survives; pending rows match the new rule.
        assert!(
            after
                .iter()
                .any(|i| i.instance_date == d(2025, 6, 4)
                    && i.status == InstanceStatus::Completed)
        );
        let pending_dates: Vec<NaiveDate> = after
            .iter()
            .filter(|i| i.status == InstanceStatus::Pending)
            .map(|i| i.instance_date)
            .collect();
        assert_eq!(pending_dates, vec![d(2025, 6, 2)]);
    }

    #[tokio::test]
    async fn test_completed_to_skipped_is_rejected() {
        let db = DBService::in_memory().await.unwrap();
        let (_, task) = setup_recurring_task(&db, rule(RecurrenceFrequency::Daily)).await;
        let service = RecurrenceService::new(db.pool.clone());
        service
            .materialize(&task, d(2025, 6, 2), d(2025, 6, 3))
            .await
            .unwrap();
        let instances = TaskInstance::find_by_task_id(&db.pool, task.id).await.unwrap();
        let instance = &instances[0];

        service.complete_instance(instance.id).await.unwrap();
        let err = service.skip_instance(instance.id).await.unwrap_err();
        assert!(matches!(err, RecurrenceError::InvalidTransition { .. }));

        // Undo, then skipping is allowed.
        service.uncomplete_instance(instance.id).await.unwrap();
        let skipped = service.skip_instance(instance.id).await.unwrap();
        assert_eq!(skipped.status, InstanceStatus::Skipped);
    }
}
