//! Chunk and collection versions.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `{epoch, major, minor}` placement version.
///
/// Versions from different epochs are incomparable: `partial_cmp` returns
/// `None`, and every staleness check treats an epoch mismatch as stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkVersion {
    pub epoch: Uuid,
    pub major: u64,
    pub minor: u64,
}

/// Maximum chunk version of a collection.
pub type CollectionVersion = ChunkVersion;

impl ChunkVersion {
    pub fn new(epoch: Uuid, major: u64, minor: u64) -> Self {
        Self { epoch, major, minor }
    }

    /// First version of a freshly sharded collection.
    pub fn initial(epoch: Uuid) -> Self {
        Self::new(epoch, 1, 0)
    }

    pub fn inc_major(&self) -> Self {
        Self::new(self.epoch, self.major.saturating_add(1), 0)
    }

    pub fn inc_minor(&self) -> Self {
        Self::new(self.epoch, self.major, self.minor.saturating_add(1))
    }

    pub fn same_epoch(&self, other: &ChunkVersion) -> bool {
        self.epoch == other.epoch
    }
}

impl PartialOrd for ChunkVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.epoch != other.epoch {
            return None;
        }
        Some((self.major, self.minor).cmp(&(other.major, other.minor)))
    }
}

impl fmt::Display for ChunkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let epoch = self.epoch.simple().to_string();
        write!(f, "{}|{}||{}", self.major, self.minor, &epoch[..8])
    }
}

/// Formats an optional version the way error messages show it.
pub(crate) struct DisplayVersion<'a>(pub &'a Option<ChunkVersion>);

impl fmt::Display for DisplayVersion<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(v) => write!(f, "{v}"),
            None => write!(f, "UNSHARDED"),
        }
    }
}
