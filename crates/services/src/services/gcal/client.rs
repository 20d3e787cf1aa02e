//! Thin typed wrapper over the Google Calendar REST API.
//!
//! The sync service talks to the [`CalendarApi`] trait so tests can substitute
//! a stub; [`GoogleCalendarClient`] is the reqwest-backed production
//! implementation. Error classification lives on [`CalendarApiError`]: every
//! 403 must be split into "rate limit" (retryable) vs. "calendar-level"
//! (circuit breaker) before anyone reacts to it.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const BASE_URL: &str = "https://www.googleapis.com/calendar/v3";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum CalendarApiError {
    #[error("Failed to build calendar client: {0}")]
    BuildError(String),

    #[error("Calendar request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Calendar API returned {status}")]
    Api { status: u16, body: String },
}

/// Subset of Google's error envelope needed for classification.
#[derive(Debug, Deserialize)]
struct GoogleErrorEnvelope {
    error: GoogleErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GoogleErrorDetail {
    #[serde(default)]
    errors: Vec<GoogleErrorItem>,
}

#[derive(Debug, Deserialize)]
struct GoogleErrorItem {
    domain: Option<String>,
    reason: Option<String>,
}

impl CalendarApiError {
    /// True for 403s whose body marks a quota problem. Transient: retried with
    /// backoff, never disables sync. Malformed bodies classify as false, which
    /// routes them to the non-retryable path.
    pub fn is_rate_limit(&self) -> bool {
        let CalendarApiError::Api { status: 403, body } = self else {
            return false;
        };
        serde_json::from_str::<GoogleErrorEnvelope>(body)
            .map(|envelope| {
                envelope.error.errors.iter().any(|item| {
                    item.domain.as_deref() == Some("usageLimits")
                        || matches!(
                            item.reason.as_deref(),
                            Some("rateLimitExceeded" | "userRateLimitExceeded")
                        )
                })
            })
            .unwrap_or(false)
    }

    /// The target no longer exists (404/410). Benign for per-event deletes.
    pub fn is_gone(&self) -> bool {
        matches!(self, CalendarApiError::Api { status: 404 | 410, .. })
    }

    /// Permission revoked or calendar deleted: any non-rate-limit 403, or a
    /// 404/410. Triggers the circuit breaker when hit on the calendar itself.
    pub fn is_calendar_error(&self) -> bool {
        match self {
            CalendarApiError::Api { status: 403, .. } => !self.is_rate_limit(),
            CalendarApiError::Api { status: 404 | 410, .. } => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CalendarListEntry {
    pub id: String,
    #[serde(default)]
    pub summary: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CalendarEvent {
    pub id: String,
    #[serde(default)]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsPage {
    #[serde(default)]
    pub items: Vec<CalendarEvent>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CalendarListPage {
    #[serde(default)]
    items: Vec<CalendarListEntry>,
    next_page_token: Option<String>,
}

/// Either an all-day date or a timed start/end, per the Calendar API shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventTime {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_time: Option<DateTime<Utc>>,
}

impl EventTime {
    pub fn all_day(date: NaiveDate) -> Self {
        Self {
            date: Some(date),
            date_time: None,
        }
    }

    pub fn timed(date_time: DateTime<Utc>) -> Self {
        Self {
            date: None,
            date_time: Some(date_time),
        }
    }
}

/// Outbound event body for inserts and updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub summary: String,
    pub start: EventTime,
    pub end: EventTime,
}

#[async_trait]
pub trait CalendarApi: Send + Sync {
    async fn list_calendars(&self) -> Result<Vec<CalendarListEntry>, CalendarApiError>;
    async fn insert_calendar(&self, summary: &str) -> Result<CalendarListEntry, CalendarApiError>;
    async fn delete_calendar(&self, calendar_id: &str) -> Result<(), CalendarApiError>;
    async fn list_events(
        &self,
        calendar_id: &str,
        page_token: Option<&str>,
    ) -> Result<EventsPage, CalendarApiError>;
    async fn insert_event(
        &self,
        calendar_id: &str,
        event: &EventPayload,
    ) -> Result<CalendarEvent, CalendarApiError>;
    async fn update_event(
        &self,
        calendar_id: &str,
        event_id: &str,
        event: &EventPayload,
    ) -> Result<CalendarEvent, CalendarApiError>;
    async fn delete_event(&self, calendar_id: &str, event_id: &str)
    -> Result<(), CalendarApiError>;
}

/// reqwest-backed client. OAuth token refresh is handled upstream; this only
/// attaches the bearer token and maps non-2xx responses to `Api` errors with
/// the raw body retained for classification.
#[derive(Clone)]
pub struct GoogleCalendarClient {
    http: reqwest::Client,
    token: String,
    base_url: String,
}

impl GoogleCalendarClient {
    pub fn new(token: String) -> Result<Self, CalendarApiError> {
        // A hung external API must not wedge the background task.
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CalendarApiError::BuildError(e.to_string()))?;
        Ok(Self::with_client(http, token))
    }

    pub fn with_client(http: reqwest::Client, token: String) -> Self {
        Self {
            http,
            token,
            base_url: BASE_URL.to_string(),
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, CalendarApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(CalendarApiError::Api {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl CalendarApi for GoogleCalendarClient {
    async fn list_calendars(&self) -> Result<Vec<CalendarListEntry>, CalendarApiError> {
        let mut calendars = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self
                .http
                .get(format!("{}/users/me/calendarList", self.base_url))
                .bearer_auth(&self.token)
                .query(&[("maxResults", "250")]);
            if let Some(token) = page_token.as_deref() {
                request = request.query(&[("pageToken", token)]);
            }
            let response = Self::check(request.send().await?).await?;
            let page: CalendarListPage = response.json().await?;
            calendars.extend(page.items);
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(calendars)
    }

    async fn insert_calendar(&self, summary: &str) -> Result<CalendarListEntry, CalendarApiError> {
        let response = self
            .http
            .post(format!("{}/calendars", self.base_url))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "summary": summary }))
            .send()
            .await?;
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }

    async fn delete_calendar(&self, calendar_id: &str) -> Result<(), CalendarApiError> {
        let response = self
            .http
            .delete(format!("{}/calendars/{}", self.base_url, calendar_id))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn list_events(
        &self,
        calendar_id: &str,
        page_token: Option<&str>,
    ) -> Result<EventsPage, CalendarApiError> {
        let mut request = self
            .http
            .get(format!("{}/calendars/{}/events", self.base_url, calendar_id))
            .bearer_auth(&self.token)
            .query(&[("maxResults", "250")]);
        if let Some(token) = page_token {
            request = request.query(&[("pageToken", token)]);
        }
        let response = Self::check(request.send().await?).await?;
        Ok(response.json().await?)
    }

    async fn insert_event(
        &self,
        calendar_id: &str,
        event: &EventPayload,
    ) -> Result<CalendarEvent, CalendarApiError> {
        let response = self
            .http
            .post(format!("{}/calendars/{}/events", self.base_url, calendar_id))
            .bearer_auth(&self.token)
            .json(event)
            .send()
            .await?;
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }

    async fn update_event(
        &self,
        calendar_id: &str,
        event_id: &str,
        event: &EventPayload,
    ) -> Result<CalendarEvent, CalendarApiError> {
        let response = self
            .http
            .put(format!(
                "{}/calendars/{}/events/{}",
                self.base_url, calendar_id, event_id
            ))
            .bearer_auth(&self.token)
            .json(event)
            .send()
            .await?;
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }

    async fn delete_event(
        &self,
        calendar_id: &str,
        event_id: &str,
    ) -> Result<(), CalendarApiError> {
        let response = self
            .http
            .delete(format!(
                "{}/calendars/{}/events/{}",
                self.base_url, calendar_id, event_id
            ))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}
