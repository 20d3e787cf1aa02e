pub mod client;
pub mod resync;
pub mod sync;
pub mod throttle;

pub use client::{CalendarApi, CalendarApiError, GoogleCalendarClient};
pub use resync::{CalendarApiFactory, ResyncService};
pub use sync::{BulkSyncOutcome, GCalSyncService, SyncError};
pub use throttle::AdaptiveThrottle;
