//! Per-user sync mutual exclusion.
//!
//! A bulk sync for a given user must never run twice concurrently (duplicate
//! clicks, or "enable" overlapping a scheduled resync). The registry hands out
//! at most one [`SyncGuard`] per user at a time; a second caller is told
//! "already in progress" and returns without queueing.
//!
//! State is process-local and ephemeral — lost on restart (acceptable for a
//! single-instance deployment; a multi-instance port would need an advisory
//! lock in the database instead).

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use dashmap::DashMap;
use uuid::Uuid;

#[derive(Default)]
struct UserSyncState {
    running: AtomicBool,
    progress: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct SyncLockRegistry {
    states: Arc<DashMap<Uuid, Arc<UserSyncState>>>,
}

impl SyncLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get-or-create must be atomic: two concurrent callers for the same user
    /// must observe the same state object, never two. DashMap's `entry` holds
    /// the shard lock across the insert.
    fn state_for(&self, user_id: Uuid) -> Arc<UserSyncState> {
        self.states.entry(user_id).or_default().clone()
    }

    /// Attempts to start a sync for the user. Returns `None` if one is already
    /// running — the caller drops the attempt, it is not queued.
    pub fn try_begin(&self, user_id: Uuid) -> Option<SyncGuard> {
        let state = self.state_for(user_id);
        state
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        state.progress.store(0, Ordering::SeqCst);
        Some(SyncGuard { state })
    }

    pub fn is_syncing(&self, user_id: Uuid) -> bool {
        self.states
            .get(&user_id)
            .map(|s| s.running.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Items pushed so far in the current (or most recent) run, for the
    /// polling status endpoint.
    pub fn progress(&self, user_id: Uuid) -> usize {
        self.states
            .get(&user_id)
            .map(|s| s.progress.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

/// Holds the running flag for one user's sync; dropping it releases the lock.
pub struct SyncGuard {
    state: Arc<UserSyncState>,
}

impl SyncGuard {
    pub fn record_progress(&self, items: usize) {
        self.state.progress.fetch_add(items, Ordering::SeqCst);
    }
}

impl Drop for SyncGuard {
    fn drop(&mut self) {
        self.state.running.store(false, Ordering::SeqCst);
    }
}
