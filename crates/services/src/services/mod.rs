pub mod gcal;
pub mod materializer;
pub mod recurrence;
pub mod sync_locks;
