//! Push state machine and sync statistics.

use std::time::Instant;

/// Where the push engine currently is.
///
/// A push moves `Idle → Draining`, then for every operation
/// `Locking → Pushing → (Applying | ConflictHandling) → Unlocking`, back
/// to `Draining`, and finally `Idle` once the log is drained or the push
/// aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PushState {
    /// No push is running.
    #[default]
    Idle,
    /// Looking for the next operation to push.
    Draining,
    /// Locking the operation against condensation.
    Locking,
    /// Waiting for the remote table.
    Pushing,
    /// Writing the server result and removing the log entry.
    Applying,
    /// Waiting for the push handler to settle a failure.
    ConflictHandling,
    /// Releasing the operation lock.
    Unlocking,
}

impl PushState {
    /// Returns true while a push is running.
    pub fn is_active(&self) -> bool {
        !matches!(self, PushState::Idle)
    }

    /// Returns true while the operation lock is held.
    pub fn holds_lock(&self) -> bool {
        matches!(
            self,
            PushState::Pushing | PushState::Applying | PushState::ConflictHandling
        )
    }
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Push calls that drained the log.
    pub pushes_completed: u64,
    /// Pull calls that completed.
    pub pulls_completed: u64,
    /// Operations accepted by the server.
    pub operations_pushed: u64,
    /// Records received from the server.
    pub records_pulled: u64,
    /// Pulled records skipped because of pending local changes.
    pub records_skipped: u64,
    /// Push failures returned as unresolved conflicts.
    pub conflicts_encountered: u64,
    /// Last completed push.
    pub last_push_time: Option<Instant>,
    /// Last completed pull.
    pub last_pull_time: Option<Instant>,
    /// Last push or pull error message.
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_state_checks() {
        assert!(!PushState::Idle.is_active());
        assert!(PushState::Draining.is_active());
        assert!(PushState::ConflictHandling.is_active());

        assert!(PushState::Pushing.holds_lock());
        assert!(!PushState::Locking.holds_lock());
        assert!(!PushState::Unlocking.holds_lock());
        assert_eq!(PushState::default(), PushState::Idle);
    }

    #[test]
    fn stats_start_empty() {
        let stats = SyncStats::default();
        assert_eq!(stats.pushes_completed, 0);
        assert!(stats.last_push_time.is_none());
        assert!(stats.last_error.is_none());
    }
}
