pub mod domain;
pub mod event_sync;
pub mod task;
pub mod task_instance;
pub mod user;
