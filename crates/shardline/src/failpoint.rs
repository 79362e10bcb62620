//! Named fault-injection points.
//!
//! Production code asks `should_fail(name)` or awaits `pause_point(name)` at
//! interesting protocol steps; tests flip points on to force aborts, lost
//! acknowledgements or stalls at exact phases.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Pause the donor after cloning starts, before catch-up.
pub const MIGRATION_PAUSE_AFTER_CLONE: &str = "migration.pauseAfterClone";
/// Pause the donor just before it enters the critical section.
pub const MIGRATION_PAUSE_BEFORE_CRITICAL_SECTION: &str = "migration.pauseBeforeCriticalSection";
/// Fail the donor inside the critical section before the catalog commit.
pub const MIGRATION_FAIL_BEFORE_COMMIT: &str = "migration.failBeforeCommit";
/// Pretend the catalog commit response was lost after it became durable.
pub const MIGRATION_LOSE_COMMIT_ACK: &str = "migration.loseCommitAck";
/// Stall the recipient between catch-up rounds.
pub const RECIPIENT_PAUSE_CATCH_UP: &str = "recipient.pauseCatchUp";
/// Hold range deletions before they touch storage.
pub const RANGE_DELETER_PAUSE: &str = "rangeDeleter.pause";
/// Pause resharding recipients after cloning their share.
pub const RESHARDING_PAUSE_AFTER_CLONE: &str = "resharding.pauseAfterClone";
/// Pause the resharding coordinator before it enters the commit phase.
pub const RESHARDING_PAUSE_BEFORE_COMMIT: &str = "resharding.pauseBeforeCommit";
/// Make `durably_commit` report failure.
pub const REPLICATION_FAIL_COMMIT: &str = "replication.failCommit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPointMode {
    AlwaysOn,
    /// Fire this many more times, then switch off.
    Times(u32),
    /// Block callers of `pause_point` until disabled.
    Pause,
}

#[derive(Debug, Default)]
pub struct FailPoints {
    points: Mutex<HashMap<String, FailPointMode>>,
    released: Notify,
}

impl FailPoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable(&self, name: &str, mode: FailPointMode) {
        tracing::info!(failpoint = name, mode = ?mode, "failpoint enabled");
        self.points.lock().insert(name.to_string(), mode);
    }

    pub fn disable(&self, name: &str) {
        if self.points.lock().remove(name).is_some() {
            tracing::info!(failpoint = name, "failpoint disabled");
        }
        self.released.notify_waiters();
    }

    /// True when the point fires; `Times(n)` counts down.
    pub fn should_fail(&self, name: &str) -> bool {
        let mut points = self.points.lock();
        match points.get_mut(name) {
            None | Some(FailPointMode::Pause) => false,
            Some(FailPointMode::AlwaysOn) => true,
            Some(FailPointMode::Times(n)) => {
                *n = n.saturating_sub(1);
                if *n == 0 {
                    points.remove(name);
                }
                true
            }
        }
    }

    /// Wait while `name` is in `Pause` mode.
    pub async fn pause_point(&self, name: &str) {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();
            if self.points.lock().get(name) != Some(&FailPointMode::Pause) {
                return;
            }
            tracing::debug!(failpoint = name, "paused at failpoint");
            released.await;
        }
    }
}
