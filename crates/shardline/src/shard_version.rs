//! Staleness check run on every shard-side read and write.

use crate::version::ChunkVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionCheck {
    Ok,
    /// The caller saw newer metadata, or metadata from another epoch, than
    /// this shard holds; the shard should refresh before deciding.
    ShardBehind,
    Stale,
}

pub struct ShardVersionGuard;

impl ShardVersionGuard {
    pub fn compare(attached: Option<&ChunkVersion>, authoritative: Option<&ChunkVersion>) -> VersionCheck {
        match (attached, authoritative) {
            (None, None) => VersionCheck::Ok,
            (Some(_), None) => VersionCheck::ShardBehind,
            (None, Some(_)) => VersionCheck::Stale,
            (Some(a), Some(b)) if !a.same_epoch(b) => VersionCheck::ShardBehind,
            (Some(a), Some(b)) => match (a.major, a.minor).cmp(&(b.major, b.minor)) {
                std::cmp::Ordering::Equal => VersionCheck::Ok,
                std::cmp::Ordering::Less => VersionCheck::Stale,
                std::cmp::Ordering::Greater => VersionCheck::ShardBehind,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn compares_within_and_across_epochs() {
        let e1 = Uuid::new_v4();
        let e2 = Uuid::new_v4();
        let v = |e, major, minor| ChunkVersion::new(e, major, minor);

        assert_eq!(ShardVersionGuard::compare(Some(&v(e1, 2, 1)), Some(&v(e1, 2, 1))), VersionCheck::Ok);
        assert_eq!(ShardVersionGuard::compare(Some(&v(e1, 1, 5)), Some(&v(e1, 2, 0))), VersionCheck::Stale);
        assert_eq!(ShardVersionGuard::compare(Some(&v(e1, 3, 0)), Some(&v(e1, 2, 9))), VersionCheck::ShardBehind);
        assert_eq!(ShardVersionGuard::compare(Some(&v(e2, 1, 0)), Some(&v(e1, 9, 0))), VersionCheck::ShardBehind);
        assert_eq!(ShardVersionGuard::compare(None, Some(&v(e1, 1, 0))), VersionCheck::Stale);
        assert_eq!(ShardVersionGuard::compare(None, None), VersionCheck::Ok);
    }
}
