//! Chunk migration between two shards.
//!
//! The donor drives the protocol:
//! 1. take a lease on the range and record the migration durably
//! 2. open a snapshot cursor and ask the recipient to start pulling
//! 3. wait while the recipient clones and replays the donor's write log
//! 4. enter the critical section, drain in-flight writes, let the recipient
//!    finish catching up
//! 5. commit the new owner in the config catalog
//! 6. orphan the range locally, leave the critical section and tell the
//!    recipient to record the commit (retried in the background until it does)
//!
//! Any failure before step 5 rolls back: the donor keeps the range and the
//! recipient's partial clone is deleted immediately.

mod donor;
mod recipient;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chunk::ChunkRange;
use crate::error::{ShardError, ShardResult};
use crate::key::ShardKeyPattern;
use crate::types::ShardId;
use crate::version::ChunkVersion;

pub(crate) use self::donor::DonorSession;
pub(crate) use self::recipient::RecipientSession;

/// Configuration for migrations on a shard.
#[derive(Clone, Copy, Debug)]
pub struct MigrationConfig {
    /// Documents per clone batch.
    pub clone_batch_size: usize,
    /// Write-log entries per catch-up round.
    pub catch_up_batch_size: usize,
    /// Give up when catch-up has not converged after this many rounds.
    pub max_catch_up_rounds: u32,
    /// A round returning at most this many entries counts as converged.
    pub converged_threshold: usize,
    /// How long a write waits for a critical section before failing.
    pub critical_section_timeout: Duration,
    /// How long the donor waits for in-flight writes after blocking new ones.
    pub drain_timeout: Duration,
    /// Abort when the recipient has been unreachable for this long.
    pub lease_ttl: Duration,
    /// Interval between donor status polls and recipient idle rounds.
    pub poll_interval: Duration,
    /// How long a recipient waits for an overlapping range deletion.
    pub pending_deletion_wait: Duration,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            clone_batch_size: 128,
            catch_up_batch_size: 256,
            max_catch_up_rounds: 32,
            converged_threshold: 16,
            critical_section_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(2),
            lease_ttl: Duration::from_secs(2),
            poll_interval: Duration::from_millis(5),
            pending_deletion_wait: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationPhase {
    Cloning,
    CatchingUp,
    CriticalSection,
    Committed,
    Aborted,
}

/// Donor-side migration state document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationDoc {
    pub id: Uuid,
    pub ns: String,
    pub range: ChunkRange,
    pub donor: ShardId,
    pub recipient: ShardId,
    pub epoch: Uuid,
    pub phase: MigrationPhase,
}

/// Recipient-side state document; present while the outcome is undecided.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientDoc {
    pub id: Uuid,
    pub ns: String,
    pub range: ChunkRange,
    pub donor: ShardId,
    pub pattern: ShardKeyPattern,
    pub epoch: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecipientState {
    Cloning,
    CatchingUp { rounds: u32 },
    /// Caught up to within the convergence threshold; ready for the critical section.
    Steady,
    Committing,
    Done,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveRangeRequest {
    pub ns: String,
    pub range: ChunkRange,
    pub to: ShardId,
    /// Epoch the caller routed with; a different epoch is stale.
    pub epoch: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartReceive {
    pub id: Uuid,
    pub ns: String,
    pub range: ChunkRange,
    pub donor: ShardId,
    pub pattern: ShardKeyPattern,
    pub epoch: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveRangeOutcome {
    pub id: Uuid,
    pub version: ChunkVersion,
}

struct LeaseEntry {
    id: Uuid,
    ns: String,
    range: ChunkRange,
}

/// Active migrations on one shard, both directions.
#[derive(Default)]
pub(crate) struct MigrationRegistry {
    leases: Mutex<Vec<LeaseEntry>>,
    donors: Mutex<HashMap<Uuid, Arc<DonorSession>>>,
    recipients: Mutex<HashMap<Uuid, Arc<RecipientSession>>>,
}

/// Exclusive right to donate one range; released on drop.
pub(crate) struct MigrationLease {
    registry: Arc<MigrationRegistry>,
    id: Uuid,
}

impl Drop for MigrationLease {
    fn drop(&mut self) {
        self.registry.leases.lock().retain(|l| l.id != self.id);
    }
}

impl MigrationRegistry {
    pub(crate) fn acquire_lease(
        self: &Arc<Self>,
        id: Uuid,
        ns: &str,
        range: &ChunkRange,
    ) -> ShardResult<MigrationLease> {
        let mut leases = self.leases.lock();
        if let Some(other) = leases.iter().find(|l| l.ns == ns && l.range.overlaps(range)) {
            return Err(ShardError::ConflictingOperationInProgress(format!(
                "migration {} of {} on {ns} is already in progress",
                other.id, other.range
            )));
        }
        leases.push(LeaseEntry {
            id,
            ns: ns.to_string(),
            range: range.clone(),
        });
        Ok(MigrationLease {
            registry: self.clone(),
            id,
        })
    }

    pub(crate) fn insert_donor(&self, session: Arc<DonorSession>) {
        self.donors.lock().insert(session.id, session);
    }

    pub(crate) fn donor(&self, id: Uuid) -> ShardResult<Arc<DonorSession>> {
        self.donors
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| ShardError::Interrupted(format!("no active donation {id}")))
    }

    pub(crate) fn remove_donor(&self, id: Uuid) {
        self.donors.lock().remove(&id);
    }

    pub(crate) fn insert_recipient(&self, session: Arc<RecipientSession>) {
        self.recipients.lock().insert(session.id, session);
    }

    pub(crate) fn recipient(&self, id: Uuid) -> Option<Arc<RecipientSession>> {
        self.recipients.lock().get(&id).cloned()
    }

    pub(crate) fn remove_recipient(&self, id: Uuid) -> Option<Arc<RecipientSession>> {
        self.recipients.lock().remove(&id)
    }

    /// Forget every session; their tasks are stopped by the shard's lifecycle token.
    pub(crate) fn clear(&self) {
        self.donors.lock().clear();
        for (_, session) in self.recipients.lock().drain() {
            session.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ShardKey;

    #[test]
    fn leases_are_exclusive_per_overlapping_range() {
        let registry = Arc::new(MigrationRegistry::default());
        let low = ChunkRange::new(ShardKey::min(1), ShardKey::int(0)).expect("range");
        let high = ChunkRange::new(ShardKey::int(0), ShardKey::max(1)).expect("range");

        let lease = registry.acquire_lease(Uuid::new_v4(), "a.b", &high).expect("lease");
        assert!(matches!(
            registry.acquire_lease(Uuid::new_v4(), "a.b", &high),
            Err(ShardError::ConflictingOperationInProgress(_))
        ));
        let _other_ns = registry.acquire_lease(Uuid::new_v4(), "a.c", &high).expect("other ns");
        let _low = registry.acquire_lease(Uuid::new_v4(), "a.b", &low).expect("disjoint");
        drop(lease);
        registry.acquire_lease(Uuid::new_v4(), "a.b", &high).expect("released");
    }
}
