//! One-way push sync: Google Calendar as a read-only mirror of scheduled
//! tasks and instances.
//!
//! Per item the decision is hash-driven: no sync record means create, a stale
//! hash means update, a matching hash means no network call at all. Calendar
//! state is reconciled at the end of each bulk run by deleting events whose
//! backing item is gone or unscheduled.
//!
//! Partial progress is intentional: each pushed item commits its sync record
//! immediately, so an aborted run resumes where it left off (hash match) the
//! next time around.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, NaiveDate, NaiveTime};
use db::models::{
    event_sync::CalendarEventSync,
    task::Task,
    task_instance::{InstanceStatus, TaskInstance},
    user::UserPreferences,
};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use super::client::{CalendarApi, CalendarApiError, EventPayload, EventTime};
use super::throttle::AdaptiveThrottle;
use crate::services::sync_locks::SyncGuard;

const DEFAULT_EVENT_MINUTES: i64 = 30;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Api(#[from] CalendarApiError),

    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Task instance not found: {0}")]
    InstanceNotFound(Uuid),
}

/// How a bulk run ended. Only `Completed` means the full reconciliation pass
/// ran; the other variants are early exits with partial progress retained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkSyncOutcome {
    Completed {
        created: usize,
        updated: usize,
        skipped: usize,
        deleted: usize,
    },
    /// Rate-limit retries exhausted. Transient: nothing is persisted, the next
    /// scheduled or triggered run resumes.
    RateLimited { processed: usize },
    /// Calendar-level error: sync disabled, calendar forgotten, error message
    /// persisted for the UI. Requires explicit user re-enable.
    CalendarRevoked,
    /// Preferences say sync is off (or no calendar resolved) — nothing to do.
    NotEnabled,
}

/// Fingerprint of the fields projected onto the calendar event. Description
/// and other task fields are deliberately excluded: editing them must not
/// trigger a push.
pub fn sync_hash(
    title: &str,
    date: NaiveDate,
    time: Option<NaiveTime>,
    duration_minutes: Option<i64>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update([0u8]);
    hasher.update(date.to_string().as_bytes());
    hasher.update([0u8]);
    hasher.update(time.map(|t| t.to_string()).unwrap_or_default().as_bytes());
    hasher.update([0u8]);
    hasher.update(
        duration_minutes
            .map(|d| d.to_string())
            .unwrap_or_default()
            .as_bytes(),
    );
    hex::encode(hasher.finalize())
}

/// One schedulable item: a scheduled one-off task, or a pending instance of a
/// recurring task.
#[derive(Debug, Clone)]
struct SyncItem {
    task_id: Uuid,
    instance_id: Option<Uuid>,
    title: String,
    date: NaiveDate,
    time: Option<NaiveTime>,
    duration_minutes: Option<i64>,
}

impl SyncItem {
    fn from_task(task: &Task) -> Option<Self> {
        Some(Self {
            task_id: task.id,
            instance_id: None,
            title: task.title.clone(),
            date: task.scheduled_date?,
            time: task.scheduled_time,
            duration_minutes: task.duration_minutes,
        })
    }

    fn key(&self) -> (Uuid, Option<Uuid>) {
        (self.task_id, self.instance_id)
    }

    fn hash(&self) -> String {
        sync_hash(&self.title, self.date, self.time, self.duration_minutes)
    }

    fn payload(&self) -> EventPayload {
        match self.time {
            Some(time) => {
                let start = self.date.and_time(time).and_utc();
                let end = start
                    + ChronoDuration::minutes(self.duration_minutes.unwrap_or(DEFAULT_EVENT_MINUTES));
                EventPayload {
                    summary: self.title.clone(),
                    start: EventTime::timed(start),
                    end: EventTime::timed(end),
                }
            }
            None => EventPayload {
                summary: self.title.clone(),
                start: EventTime::all_day(self.date),
                end: EventTime::all_day(self.date + ChronoDuration::days(1)),
            },
        }
    }
}

enum ItemOutcome {
    Created,
    Updated,
    Skipped,
    RateLimited,
    CalendarError(CalendarApiError),
}

pub struct GCalSyncService {
    pool: SqlitePool,
    api: Arc<dyn CalendarApi>,
}

impl GCalSyncService {
    pub fn new(pool: SqlitePool, api: Arc<dyn CalendarApi>) -> Self {
        Self { pool, api }
    }

    /// Full reconciliation pass for one user. Caller must hold the user's
    /// [`SyncGuard`] — this method never checks the lock itself.
    pub async fn bulk_sync(
        &self,
        user_id: Uuid,
        guard: &SyncGuard,
    ) -> Result<BulkSyncOutcome, SyncError> {
        // Fresh throttle per run: the delay never speeds up within a run and
        // resets only between runs.
        let mut throttle = AdaptiveThrottle::new();
        self.bulk_sync_with_throttle(user_id, guard, &mut throttle)
            .await
    }

    pub async fn bulk_sync_with_throttle(
        &self,
        user_id: Uuid,
        guard: &SyncGuard,
        throttle: &mut AdaptiveThrottle,
    ) -> Result<BulkSyncOutcome, SyncError> {
        let Some(prefs) = UserPreferences::find_by_user_id(&self.pool, user_id).await? else {
            return Ok(BulkSyncOutcome::NotEnabled);
        };
        let Some(calendar_id) = prefs
            .gcal_sync_enabled
            .then_some(prefs.gcal_calendar_id)
            .flatten()
        else {
            return Ok(BulkSyncOutcome::NotEnabled);
        };

        let items = self.load_items(user_id).await?;
        let records = CalendarEventSync::find_by_user_id(&self.pool, user_id).await?;
        let by_key: HashMap<(Uuid, Option<Uuid>), &CalendarEventSync> = records
            .iter()
            .map(|r| ((r.task_id, r.instance_id), r))
            .collect();

        info!(%user_id, items = items.len(), records = records.len(), "Starting bulk calendar sync");

        let (mut created, mut updated, mut skipped) = (0usize, 0usize, 0usize);
        let mut processed = 0usize;

        for item in &items {
            let outcome = self
                .push_item(user_id, &calendar_id, item, by_key.get(&item.key()).copied(), throttle)
                .await?;
            match outcome {
                ItemOutcome::Created => created += 1,
                ItemOutcome::Updated => updated += 1,
                ItemOutcome::Skipped => skipped += 1,
                ItemOutcome::RateLimited => {
                    warn!(%user_id, processed, "Bulk sync ended early: rate limit retries exhausted");
                    return Ok(BulkSyncOutcome::RateLimited { processed });
                }
                ItemOutcome::CalendarError(e) => {
                    // Circuit breaker: stop processing immediately, disable
                    // sync, surface the error. Partial progress stays.
                    self.record_calendar_failure(user_id, &e).await?;
                    return Ok(BulkSyncOutcome::CalendarRevoked);
                }
            }
            processed += 1;
            guard.record_progress(1);
        }

        // Orphan cleanup always runs after the create/update phase, never
        // interleaved with it.
        let live_keys: HashSet<(Uuid, Option<Uuid>)> = items.iter().map(|i| i.key()).collect();
        let mut deleted = 0usize;
        // Records come back ordered (synced_at, id), so deletes are processed
        // in a stable order just like the create/update phase.
        for record in &records {
            if live_keys.contains(&(record.task_id, record.instance_id)) {
                continue;
            }
            let result = throttle
                .run(|| self.api.delete_event(&calendar_id, &record.event_id))
                .await;
            match result {
                Ok(()) => {}
                // Already gone remotely: idempotent no-op.
                Err(e) if e.is_gone() => {}
                Err(e) if e.is_rate_limit() => {
                    warn!(%user_id, "Orphan cleanup ended early: rate limit retries exhausted");
                    return Ok(BulkSyncOutcome::RateLimited { processed });
                }
                Err(e) => {
                    // One bad event must not abort cleanup of the rest.
                    warn!(%user_id, event_id = %record.event_id, error = %e, "Failed to delete orphan event");
                    continue;
                }
            }
            CalendarEventSync::delete(&self.pool, record.id).await?;
            deleted += 1;
        }

        info!(%user_id, created, updated, skipped, deleted, "Bulk calendar sync complete");
        Ok(BulkSyncOutcome::Completed {
            created,
            updated,
            skipped,
            deleted,
        })
    }

    /// The create/update/skip decision for a single item, used on individual
    /// task or instance edits instead of waiting for the next bulk pass. Also
    /// handles the inverse: an item that stopped being schedulable has its
    /// event removed.
    pub async fn sync_single(
        &self,
        user_id: Uuid,
        task_id: Uuid,
        instance_id: Option<Uuid>,
    ) -> Result<(), SyncError> {
        let Some(prefs) = UserPreferences::find_by_user_id(&self.pool, user_id).await? else {
            return Ok(());
        };
        let Some(calendar_id) = prefs
            .gcal_sync_enabled
            .then_some(prefs.gcal_calendar_id)
            .flatten()
        else {
            return Ok(());
        };

        let item = self.load_single_item(user_id, task_id, instance_id).await?;
        let record = CalendarEventSync::find_for_item(&self.pool, task_id, instance_id).await?;
        let mut throttle = AdaptiveThrottle::new();

        match (item, record) {
            (Some(item), record) => {
                let outcome = self
                    .push_item(user_id, &calendar_id, &item, record.as_ref(), &mut throttle)
                    .await?;
                match outcome {
                    ItemOutcome::RateLimited => {
                        warn!(%user_id, %task_id, "Single-item sync dropped: rate limited");
                    }
                    ItemOutcome::CalendarError(e) => {
                        self.record_calendar_failure(user_id, &e).await?;
                    }
                    _ => {}
                }
            }
            (None, Some(record)) => {
                let result = throttle
                    .run(|| self.api.delete_event(&calendar_id, &record.event_id))
                    .await;
                match result {
                    Ok(()) => {}
                    Err(e) if e.is_gone() => {}
                    Err(e) if e.is_rate_limit() => {
                        warn!(%user_id, %task_id, "Single-item delete dropped: rate limited");
                        return Ok(());
                    }
                    Err(e) if e.is_calendar_error() => {
                        self.record_calendar_failure(user_id, &e).await?;
                        return Ok(());
                    }
                    Err(e) => return Err(e.into()),
                }
                CalendarEventSync::delete(&self.pool, record.id).await?;
            }
            (None, None) => {}
        }
        Ok(())
    }

    /// Resolves the sync calendar by name. Multiple calendars with the same
    /// name are a leftover from re-enabling sync repeatedly: the first one is
    /// canonical and the rest are deleted.
    pub async fn find_or_create_calendar(
        &self,
        name: &str,
    ) -> Result<(String, bool), CalendarApiError> {
        let calendars = self.api.list_calendars().await?;
        let mut matching = calendars.into_iter().filter(|c| c.summary == name);

        if let Some(canonical) = matching.next() {
            for duplicate in matching {
                if let Err(e) = self.api.delete_calendar(&duplicate.id).await {
                    warn!(calendar_id = %duplicate.id, error = %e, "Failed to delete duplicate calendar");
                }
            }
            return Ok((canonical.id, false));
        }

        let created = self.api.insert_calendar(name).await?;
        Ok((created.id, true))
    }

    /// Deletes every event in the calendar, page by page. Used when re-enabling
    /// sync on a pre-existing calendar so interrupted past syncs can't leave
    /// orphans behind.
    pub async fn clear_all_events(&self, calendar_id: &str) -> Result<usize, CalendarApiError> {
        let mut throttle = AdaptiveThrottle::new();
        let mut deleted = 0usize;
        loop {
            let page = self.api.list_events(calendar_id, None).await?;
            if page.items.is_empty() {
                break;
            }
            let mut deleted_this_round = 0usize;
            for event in &page.items {
                let result = throttle
                    .run(|| self.api.delete_event(calendar_id, &event.id))
                    .await;
                match result {
                    Ok(()) => {
                        deleted += 1;
                        deleted_this_round += 1;
                    }
                    Err(e) if e.is_gone() => {
                        deleted_this_round += 1;
                    }
                    Err(e) => {
                        warn!(event_id = %event.id, error = %e, "Failed to clear calendar event");
                    }
                }
            }
            // Every delete failed: bail instead of spinning on the same page.
            if deleted_this_round == 0 {
                break;
            }
        }
        Ok(deleted)
    }

    async fn push_item(
        &self,
        user_id: Uuid,
        calendar_id: &str,
        item: &SyncItem,
        record: Option<&CalendarEventSync>,
        throttle: &mut AdaptiveThrottle,
    ) -> Result<ItemOutcome, SyncError> {
        let hash = item.hash();
        let payload = item.payload();

        let result = match record {
            Some(record) if record.sync_hash == hash => return Ok(ItemOutcome::Skipped),
            Some(record) => {
                throttle
                    .run(|| self.api.update_event(calendar_id, &record.event_id, &payload))
                    .await
            }
            None => throttle.run(|| self.api.insert_event(calendar_id, &payload)).await,
        };

        match result {
            Ok(event) => {
                // Committed per item so an aborted run keeps its progress.
                CalendarEventSync::upsert(
                    &self.pool,
                    user_id,
                    item.task_id,
                    item.instance_id,
                    &event.id,
                    &hash,
                )
                .await?;
                Ok(if record.is_some() {
                    ItemOutcome::Updated
                } else {
                    ItemOutcome::Created
                })
            }
            Err(e) if e.is_rate_limit() => Ok(ItemOutcome::RateLimited),
            Err(e) if e.is_calendar_error() => Ok(ItemOutcome::CalendarError(e)),
            Err(e) => Err(e.into()),
        }
    }

    async fn record_calendar_failure(
        &self,
        user_id: Uuid,
        error: &CalendarApiError,
    ) -> Result<(), SyncError> {
        let message = match error {
            CalendarApiError::Api { status: 403, .. } => {
                "Google Calendar access was denied. Re-connect your calendar to resume syncing."
            }
            _ => "Your sync calendar no longer exists. Re-enable sync to create a new one.",
        };
        warn!(%user_id, error = %error, "Calendar-level error, disabling sync");
        UserPreferences::record_sync_failure(&self.pool, user_id, message).await?;
        Ok(())
    }

    /// Schedulable items in stable order: scheduled one-off tasks first, then
    /// pending instances, each in query order.
    async fn load_items(&self, user_id: Uuid) -> Result<Vec<SyncItem>, sqlx::Error> {
        let mut items = Vec::new();
        for task in Task::find_schedulable_by_user(&self.pool, user_id).await? {
            if let Some(item) = SyncItem::from_task(&task) {
                items.push(item);
            }
        }
        for instance in TaskInstance::find_schedulable_by_user(&self.pool, user_id).await? {
            items.push(SyncItem {
                task_id: instance.task_id,
                instance_id: Some(instance.id),
                title: instance.title,
                date: instance.instance_date,
                time: instance.scheduled_time,
                duration_minutes: instance.duration_minutes,
            });
        }
        Ok(items)
    }

    async fn load_single_item(
        &self,
        user_id: Uuid,
        task_id: Uuid,
        instance_id: Option<Uuid>,
    ) -> Result<Option<SyncItem>, SyncError> {
        let task = Task::find_by_id(&self.pool, task_id, user_id)
            .await?
            .ok_or(SyncError::TaskNotFound(task_id))?;

        match instance_id {
            Some(instance_id) => {
                let instance = TaskInstance::find_by_id(&self.pool, instance_id)
                    .await?
                    .ok_or(SyncError::InstanceNotFound(instance_id))?;
                let schedulable = instance.status == InstanceStatus::Pending
                    && task.status == db::models::task::TaskStatus::Pending;
                Ok(schedulable.then(|| SyncItem {
                    task_id,
                    instance_id: Some(instance.id),
                    title: task.title.clone(),
                    date: instance.instance_date,
                    time: task.scheduled_time,
                    duration_minutes: task.duration_minutes,
                }))
            }
            None => {
                let schedulable = task.status == db::models::task::TaskStatus::Pending
                    && !task.is_recurring
                    && task.scheduled_date.is_some();
                Ok(if schedulable {
                    SyncItem::from_task(&task)
                } else {
                    None
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::NaiveDate;
    use db::{
        DBService,
        models::{
            task::{CreateTask, RecurrenceFrequency, RecurrenceRule, TaskStatus},
            user::{CreateUser, User},
        },
    };
    use parking_lot::Mutex;

    use super::*;
    use crate::services::gcal::client::{CalendarEvent, CalendarListEntry, EventsPage};
    use crate::services::sync_locks::SyncLockRegistry;

    fn rate_limit_error() -> CalendarApiError {
        CalendarApiError::Api {
            status: 403,
            body: r#"{"error":{"errors":[{"domain":"usageLimits","reason":"rateLimitExceeded"}]}}"#
                .to_string(),
        }
    }

    fn forbidden_error() -> CalendarApiError {
        CalendarApiError::Api {
            status: 403,
            body: r#"{"error":{"errors":[{"domain":"global","reason":"forbidden"}]}}"#.to_string(),
        }
    }

    /// In-memory calendar double. Records every call; failure behavior is
    /// programmed per test.
    #[derive(Default)]
    struct StubCalendar {
        calls: Mutex<Vec<String>>,
        insert_attempts: AtomicUsize,
        /// 1-based insert attempt that fails with a usageLimits 403, once.
        rate_limit_on_insert: Mutex<Option<usize>>,
        /// 1-based insert attempt that fails with a non-rate-limit 403.
        forbidden_on_insert: Mutex<Option<usize>>,
        calendars: Mutex<Vec<CalendarListEntry>>,
        events: Mutex<Vec<CalendarEvent>>,
        deleted_events: Mutex<Vec<String>>,
    }

    impl StubCalendar {
        fn call_count(&self, name: &str) -> usize {
            self.calls.lock().iter().filter(|c| *c == name).count()
        }

        fn total_calls(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait::async_trait]
    impl CalendarApi for StubCalendar {
        async fn list_calendars(&self) -> Result<Vec<CalendarListEntry>, CalendarApiError> {
            self.calls.lock().push("list_calendars".to_string());
            Ok(self.calendars.lock().clone())
        }

        async fn insert_calendar(
            &self,
            summary: &str,
        ) -> Result<CalendarListEntry, CalendarApiError> {
            self.calls.lock().push("insert_calendar".to_string());
            Ok(CalendarListEntry {
                id: format!("cal_{summary}"),
                summary: summary.to_string(),
            })
        }

        async fn delete_calendar(&self, _calendar_id: &str) -> Result<(), CalendarApiError> {
            self.calls.lock().push("delete_calendar".to_string());
            Ok(())
        }

        async fn list_events(
            &self,
            _calendar_id: &str,
            _page_token: Option<&str>,
        ) -> Result<EventsPage, CalendarApiError> {
            self.calls.lock().push("list_events".to_string());
            Ok(EventsPage {
                items: self.events.lock().clone(),
                next_page_token: None,
            })
        }

        async fn insert_event(
            &self,
            _calendar_id: &str,
            event: &EventPayload,
        ) -> Result<CalendarEvent, CalendarApiError> {
            let attempt = self.insert_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            self.calls.lock().push("insert_event".to_string());
            if self.rate_limit_on_insert.lock().take_if(|n| *n == attempt).is_some() {
                return Err(rate_limit_error());
            }
            if *self.forbidden_on_insert.lock() == Some(attempt) {
                return Err(forbidden_error());
            }
            Ok(CalendarEvent {
                id: format!("ev_{attempt}"),
                summary: Some(event.summary.clone()),
            })
        }

        async fn update_event(
            &self,
            _calendar_id: &str,
            event_id: &str,
            event: &EventPayload,
        ) -> Result<CalendarEvent, CalendarApiError> {
            self.calls.lock().push("update_event".to_string());
            Ok(CalendarEvent {
                id: event_id.to_string(),
                summary: Some(event.summary.clone()),
            })
        }

        async fn delete_event(
            &self,
            _calendar_id: &str,
            event_id: &str,
        ) -> Result<(), CalendarApiError> {
            self.calls.lock().push("delete_event".to_string());
            self.deleted_events.lock().push(event_id.to_string());
            self.events.lock().retain(|e| e.id != event_id);
            Ok(())
        }
    }

    async fn setup_user(db: &DBService) -> Uuid {
        let user = User::create(
            &db.pool,
            &CreateUser {
                email: format!("{}@example.com", Uuid::new_v4()),
                display_name: None,
            },
        )
        .await
        .unwrap();
        UserPreferences::enable_sync(&db.pool, user.id, "cal_1")
            .await
            .unwrap();
        user.id
    }

    async fn scheduled_task(db: &DBService, user_id: Uuid, title: &str, day: u32) -> Task {
        Task::create(
            &db.pool,
            user_id,
            &CreateTask {
                title: title.to_string(),
                description: None,
                domain_id: None,
                parent_id: None,
                clarity: None,
                impact: None,
                duration_minutes: Some(30),
                scheduled_date: NaiveDate::from_ymd_opt(2025, 6, day),
                scheduled_time: None,
                recurrence_rule: None,
                external_id: None,
                source: None,
            },
        )
        .await
        .unwrap()
    }

    fn service(db: &DBService, api: Arc<StubCalendar>) -> GCalSyncService {
        GCalSyncService::new(db.pool.clone(), api)
    }

    fn fast_throttle() -> AdaptiveThrottle {
        AdaptiveThrottle::with_params(
            std::time::Duration::from_millis(1),
            std::time::Duration::from_millis(1),
            std::time::Duration::from_millis(1),
            3,
        )
    }

    #[test]
    fn test_hash_sensitive_to_projected_fields_only() {
        let date = NaiveDate::from_ymd_opt(2025, 6, 2).unwrap();
        let base = sync_hash("Write report", date, None, Some(30));

        assert_eq!(base, sync_hash("Write report", date, None, Some(30)));
        assert_ne!(base, sync_hash("Write reports", date, None, Some(30)));
        assert_ne!(
            base,
            sync_hash("Write report", date.succ_opt().unwrap(), None, Some(30))
        );
        assert_ne!(
            base,
            sync_hash(
                "Write report",
                date,
                NaiveTime::from_hms_opt(9, 0, 0),
                Some(30)
            )
        );
        assert_ne!(base, sync_hash("Write report", date, None, Some(45)));
        assert_ne!(base, sync_hash("Write report", date, None, None));
    }

    #[tokio::test]
    async fn test_bulk_sync_end_to_end_create_then_orphan_cleanup() {
        let db = DBService::in_memory().await.unwrap();
        let user_id = setup_user(&db).await;
        for (i, title) in ["a", "b", "c"].iter().enumerate() {
            scheduled_task(&db, user_id, title, 2 + i as u32).await;
        }

        let api = Arc::new(StubCalendar::default());
        let sync = service(&db, api.clone());
        let locks = SyncLockRegistry::new();

        // First pass: 3 creates, no deletes.
        let guard = locks.try_begin(user_id).unwrap();
        let outcome = sync
            .bulk_sync_with_throttle(user_id, &guard, &mut fast_throttle())
            .await
            .unwrap();
        drop(guard);
        assert_eq!(
            outcome,
            BulkSyncOutcome::Completed { created: 3, updated: 0, skipped: 0, deleted: 0 }
        );
        assert_eq!(api.call_count("insert_event"), 3);
        assert_eq!(api.call_count("delete_event"), 0);
        assert_eq!(locks.progress(user_id), 3);

        // Idempotence: nothing changed, so the second pass makes zero calls.
        let calls_before = api.total_calls();
        let guard = locks.try_begin(user_id).unwrap();
        let outcome = sync
            .bulk_sync_with_throttle(user_id, &guard, &mut fast_throttle())
            .await
            .unwrap();
        drop(guard);
        assert_eq!(
            outcome,
            BulkSyncOutcome::Completed { created: 0, updated: 0, skipped: 3, deleted: 0 }
        );
        assert_eq!(api.total_calls(), calls_before);

        // Unschedule one task: its event becomes an orphan.
        let tasks = Task::find_by_user_id(&db.pool, user_id, None, Some(TaskStatus::Pending))
            .await
            .unwrap();
        Task::set_schedule(&db.pool, tasks[0].id, user_id, None, None)
            .await
            .unwrap();

        let guard = locks.try_begin(user_id).unwrap();
        let outcome = sync
            .bulk_sync_with_throttle(user_id, &guard, &mut fast_throttle())
            .await
            .unwrap();
        drop(guard);
        assert_eq!(
            outcome,
            BulkSyncOutcome::Completed { created: 0, updated: 0, skipped: 2, deleted: 1 }
        );
        assert_eq!(api.call_count("delete_event"), 1);
        assert_eq!(api.call_count("insert_event"), 3);

        let records = CalendarEventSync::find_by_user_id(&db.pool, user_id)
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn test_bulk_sync_updates_on_stale_hash() {
        let db = DBService::in_memory().await.unwrap();
        let user_id = setup_user(&db).await;
        let task = scheduled_task(&db, user_id, "review", 2).await;

        let api = Arc::new(StubCalendar::default());
        let sync = service(&db, api.clone());
        let locks = SyncLockRegistry::new();

        let guard = locks.try_begin(user_id).unwrap();
        sync.bulk_sync_with_throttle(user_id, &guard, &mut fast_throttle())
            .await
            .unwrap();
        drop(guard);

        // Reschedule: hash changes, next pass updates in place.
        Task::set_schedule(
            &db.pool,
            task.id,
            user_id,
            NaiveDate::from_ymd_opt(2025, 6, 9),
            NaiveTime::from_hms_opt(14, 0, 0),
        )
        .await
        .unwrap();

        let guard = locks.try_begin(user_id).unwrap();
        let outcome = sync
            .bulk_sync_with_throttle(user_id, &guard, &mut fast_throttle())
            .await
            .unwrap();
        drop(guard);
        assert_eq!(
            outcome,
            BulkSyncOutcome::Completed { created: 0, updated: 1, skipped: 0, deleted: 0 }
        );
        assert_eq!(api.call_count("update_event"), 1);
        assert_eq!(api.call_count("insert_event"), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_retry_completes_run_and_raises_delay() {
        let db = DBService::in_memory().await.unwrap();
        let user_id = setup_user(&db).await;
        for i in 0..10 {
            scheduled_task(&db, user_id, &format!("task {i}"), 2 + i).await;
        }

        let api = Arc::new(StubCalendar::default());
        // The 5th insert attempt rate-limits once, then succeeds on retry.
        *api.rate_limit_on_insert.lock() = Some(5);

        let sync = service(&db, api.clone());
        let locks = SyncLockRegistry::new();
        let mut throttle = fast_throttle();
        let initial_delay = throttle.current_delay();

        let guard = locks.try_begin(user_id).unwrap();
        let outcome = sync
            .bulk_sync_with_throttle(user_id, &guard, &mut throttle)
            .await
            .unwrap();
        drop(guard);

        assert_eq!(
            outcome,
            BulkSyncOutcome::Completed { created: 10, updated: 0, skipped: 0, deleted: 0 }
        );
        // 10 items, one extra attempt for the rate-limited one.
        assert_eq!(api.call_count("insert_event"), 11);
        assert!(throttle.current_delay() > initial_delay);
    }

    #[tokio::test]
    async fn test_calendar_error_halts_run_and_disables_sync() {
        let db = DBService::in_memory().await.unwrap();
        let user_id = setup_user(&db).await;
        for i in 0..3 {
            scheduled_task(&db, user_id, &format!("task {i}"), 2 + i).await;
        }

        let api = Arc::new(StubCalendar::default());
        *api.forbidden_on_insert.lock() = Some(1);

        let sync = service(&db, api.clone());
        let locks = SyncLockRegistry::new();

        let guard = locks.try_begin(user_id).unwrap();
        let outcome = sync
            .bulk_sync_with_throttle(user_id, &guard, &mut fast_throttle())
            .await
            .unwrap();
        drop(guard);

        assert_eq!(outcome, BulkSyncOutcome::CalendarRevoked);
        // Zero further items processed after the first calendar-level error.
        assert_eq!(api.call_count("insert_event"), 1);

        let prefs = UserPreferences::find_by_user_id(&db.pool, user_id)
            .await
            .unwrap()
            .unwrap();
        assert!(!prefs.gcal_sync_enabled);
        assert!(prefs.gcal_calendar_id.is_none());
        assert!(prefs.gcal_sync_error.is_some());
    }

    #[tokio::test]
    async fn test_rate_limit_exhaustion_ends_run_without_persisting_error() {
        let db = DBService::in_memory().await.unwrap();
        let user_id = setup_user(&db).await;
        scheduled_task(&db, user_id, "only", 2).await;

        let api = Arc::new(StubCalendar::default());
        let sync = service(&db, api.clone());
        let locks = SyncLockRegistry::new();

        // Zero retries and a rate limit on the first attempt: exhaustion.
        let mut throttle = AdaptiveThrottle::with_params(
            std::time::Duration::from_millis(1),
            std::time::Duration::from_millis(1),
            std::time::Duration::from_millis(1),
            0,
        );
        *api.rate_limit_on_insert.lock() = Some(1);

        let guard = locks.try_begin(user_id).unwrap();
        let outcome = sync
            .bulk_sync_with_throttle(user_id, &guard, &mut throttle)
            .await
            .unwrap();
        drop(guard);

        assert_eq!(outcome, BulkSyncOutcome::RateLimited { processed: 0 });
        // Transient: sync stays enabled, no error banner.
        let prefs = UserPreferences::find_by_user_id(&db.pool, user_id)
            .await
            .unwrap()
            .unwrap();
        assert!(prefs.gcal_sync_enabled);
        assert!(prefs.gcal_sync_error.is_none());
    }

    #[tokio::test]
    async fn test_find_or_create_calendar_deletes_duplicates() {
        let db = DBService::in_memory().await.unwrap();
        let api = Arc::new(StubCalendar::default());
        *api.calendars.lock() = vec![
            CalendarListEntry { id: "cal_a".to_string(), summary: "Whendoist".to_string() },
            CalendarListEntry { id: "cal_b".to_string(), summary: "Whendoist".to_string() },
            CalendarListEntry { id: "cal_c".to_string(), summary: "Whendoist".to_string() },
            CalendarListEntry { id: "cal_other".to_string(), summary: "Personal".to_string() },
        ];

        let sync = service(&db, api.clone());
        let (calendar_id, created) = sync.find_or_create_calendar("Whendoist").await.unwrap();

        assert_eq!(calendar_id, "cal_a");
        assert!(!created);
        assert_eq!(api.call_count("delete_calendar"), 2);
    }

    #[tokio::test]
    async fn test_find_or_create_calendar_creates_when_missing() {
        let db = DBService::in_memory().await.unwrap();
        let api = Arc::new(StubCalendar::default());

        let sync = service(&db, api.clone());
        let (calendar_id, created) = sync.find_or_create_calendar("Whendoist").await.unwrap();

        assert_eq!(calendar_id, "cal_Whendoist");
        assert!(created);
        assert_eq!(api.call_count("insert_calendar"), 1);
    }

    #[tokio::test]
    async fn test_clear_all_events_drains_calendar() {
        let db = DBService::in_memory().await.unwrap();
        let api = Arc::new(StubCalendar::default());
        *api.events.lock() = (0..5)
            .map(|i| CalendarEvent { id: format!("ev_{i}"), summary: None })
            .collect();

        let sync = service(&db, api.clone());
        let deleted = sync.clear_all_events("cal_1").await.unwrap();

        assert_eq!(deleted, 5);
        assert!(api.events.lock().is_empty());
    }

    #[tokio::test]
    async fn test_sync_single_removes_event_when_unscheduled() {
        let db = DBService::in_memory().await.unwrap();
        let user_id = setup_user(&db).await;
        let task = scheduled_task(&db, user_id, "meeting prep", 2).await;

        let api = Arc::new(StubCalendar::default());
        let sync = service(&db, api.clone());

        sync.sync_single(user_id, task.id, None).await.unwrap();
        assert_eq!(api.call_count("insert_event"), 1);
        assert!(
            CalendarEventSync::find_for_item(&db.pool, task.id, None)
                .await
                .unwrap()
                .is_some()
        );

        // Edit without schedule change: hash matches, no call.
        let calls_before = api.total_calls();
        sync.sync_single(user_id, task.id, None).await.unwrap();
        assert_eq!(api.total_calls(), calls_before);

        Task::set_schedule(&db.pool, task.id, user_id, None, None)
            .await
            .unwrap();
        sync.sync_single(user_id, task.id, None).await.unwrap();
        assert_eq!(api.call_count("delete_event"), 1);
        assert!(
            CalendarEventSync::find_for_item(&db.pool, task.id, None)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_orphan_cleanup_follows_record_order() {
        let db = DBService::in_memory().await.unwrap();
        let user_id = setup_user(&db).await;
        for (i, title) in ["a", "b", "c"].iter().enumerate() {
            scheduled_task(&db, user_id, title, 2 + i as u32).await;
        }

        let api = Arc::new(StubCalendar::default());
        let sync = service(&db, api.clone());
        let locks = SyncLockRegistry::new();

        let guard = locks.try_begin(user_id).unwrap();
        sync.bulk_sync_with_throttle(user_id, &guard, &mut fast_throttle())
            .await
            .unwrap();
        drop(guard);

        // All three become orphans at once.
        for task in Task::find_schedulable_by_user(&db.pool, user_id).await.unwrap() {
            Task::set_schedule(&db.pool, task.id, user_id, None, None)
                .await
                .unwrap();
        }

        let guard = locks.try_begin(user_id).unwrap();
        let outcome = sync
            .bulk_sync_with_throttle(user_id, &guard, &mut fast_throttle())
            .await
            .unwrap();
        drop(guard);
        assert_eq!(
            outcome,
            BulkSyncOutcome::Completed { created: 0, updated: 0, skipped: 0, deleted: 3 }
        );
        // Deletes run in sync-record order, not hash-map iteration order.
        assert_eq!(
            *api.deleted_events.lock(),
            vec!["ev_1".to_string(), "ev_2".to_string(), "ev_3".to_string()]
        );
    }

    #[tokio::test]
    async fn test_completed_recurring_task_instances_are_cleaned_up() {
        let db = DBService::in_memory().await.unwrap();
        let user_id = setup_user(&db).await;
        let task = Task::create(
            &db.pool,
            user_id,
            &CreateTask {
                title: "Standup".to_string(),
                description: None,
                domain_id: None,
                parent_id: None,
                clarity: None,
                impact: None,
                duration_minutes: Some(15),
                scheduled_date: NaiveDate::from_ymd_opt(2025, 6, 2),
                scheduled_time: None,
                recurrence_rule: Some(RecurrenceRule {
                    frequency: RecurrenceFrequency::Daily,
                    interval: 1,
                    weekdays: Vec::new(),
                    month_day: None,
                    until: None,
                }),
                external_id: None,
                source: None,
            },
        )
        .await
        .unwrap();
        let first = TaskInstance::create_pending(
            &db.pool,
            task.id,
            NaiveDate::from_ymd_opt(2025, 6, 2).unwrap(),
            None,
        )
        .await
        .unwrap();
        let second = TaskInstance::create_pending(
            &db.pool,
            task.id,
            NaiveDate::from_ymd_opt(2025, 6, 3).unwrap(),
            None,
        )
        .await
        .unwrap();

        let api = Arc::new(StubCalendar::default());
        let sync = service(&db, api.clone());
        let locks = SyncLockRegistry::new();

        let guard = locks.try_begin(user_id).unwrap();
        sync.bulk_sync_with_throttle(user_id, &guard, &mut fast_throttle())
            .await
            .unwrap();
        drop(guard);
        assert_eq!(api.call_count("insert_event"), 2);

        // Completing the parent makes every instance unschedulable; per-item
        // sync must pull their events down.
        Task::set_status(&db.pool, task.id, user_id, TaskStatus::Completed)
            .await
            .unwrap();
        sync.sync_single(user_id, task.id, Some(first.id)).await.unwrap();
        sync.sync_single(user_id, task.id, Some(second.id)).await.unwrap();

        assert_eq!(api.call_count("delete_event"), 2);
        assert!(
            CalendarEventSync::find_by_user_id(&db.pool, user_id)
                .await
                .unwrap()
                .is_empty()
        );
    }
}
