//! Cluster-wide hybrid logical clock.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

const LOGICAL_BITS: u32 = 16;

/// Physical milliseconds in the high 48 bits, a logical counter in the low 16.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);
    pub const MAX: Timestamp = Timestamp(u64::MAX);

    pub fn from_millis(ms: u64) -> Self {
        Timestamp(ms << LOGICAL_BITS)
    }

    pub fn physical_ms(self) -> u64 {
        self.0 >> LOGICAL_BITS
    }

    /// Step back by a wall-clock duration, saturating at zero.
    pub fn saturating_sub(self, d: Duration) -> Self {
        let ms = self.physical_ms().saturating_sub(d.as_millis() as u64);
        Timestamp::from_millis(ms)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.physical_ms(), self.0 & ((1 << LOGICAL_BITS) - 1))
    }
}

/// Monotonic timestamp source shared by every shard and the config catalog.
#[derive(Debug, Default)]
pub struct ClusterClock {
    last: AtomicU64,
}

impl ClusterClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh timestamp strictly greater than every earlier one.
    pub fn tick(&self) -> Timestamp {
        let wall = Timestamp::from_millis(now_unix_ms()).0;
        let mut prev = self.last.load(Ordering::Acquire);
        loop {
            let next = wall.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Timestamp(next),
                Err(actual) => prev = actual,
            }
        }
    }

    /// Latest allocated timestamp.
    pub fn now(&self) -> Timestamp {
        Timestamp(self.last.load(Ordering::Acquire))
    }
}

pub(crate) fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_are_strictly_increasing() {
        let clock = ClusterClock::new();
        let mut prev = clock.tick();
        for _ in 0..10_000 {
            let next = clock.tick();
            assert!(next > prev);
            prev = next;
        }
        assert_eq!(clock.now(), prev);
    }

    #[test]
    fn saturating_sub_uses_physical_part() {
        let ts = Timestamp::from_millis(5_000);
        assert_eq!(ts.saturating_sub(Duration::from_secs(2)).physical_ms(), 3_000);
        assert_eq!(ts.saturating_sub(Duration::from_secs(60)), Timestamp::ZERO);
    }
}
