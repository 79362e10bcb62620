//! Retryable-write bookkeeping.
//!
//! A write tagged with `{lsid, txn_number, stmt_id}` is executed at most once
//! per shard. When a range migrates, the statements that touched it follow the
//! data to the recipient; statements whose write-log entries were already
//! evicted arrive only as an "incomplete" marker, and retrying an unknown
//! statement of that transaction then fails instead of re-executing.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chunk::ChunkRange;
use crate::clock::Timestamp;
use crate::error::{ShardError, ShardResult};
use crate::key::ShardKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxnInfo {
    pub lsid: Uuid,
    pub txn_number: u64,
    pub stmt_id: u32,
}

impl TxnInfo {
    pub fn new(lsid: Uuid, txn_number: u64, stmt_id: u32) -> Self {
        Self {
            lsid,
            txn_number,
            stmt_id,
        }
    }

    /// Same transaction, statement `base + offset`.
    pub fn offset(&self, offset: usize) -> Self {
        Self {
            stmt_id: self.stmt_id.saturating_add(offset as u32),
            ..*self
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StmtRecord {
    pub ns: String,
    pub key: ShardKey,
    pub ts: Timestamp,
}

#[derive(Debug, Clone, Default)]
struct SessionRecord {
    txn_number: u64,
    stmts: BTreeMap<u32, StmtRecord>,
    incomplete: bool,
}

/// Session state shipped with a migrated range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigratedSession {
    pub lsid: Uuid,
    pub txn_number: u64,
    pub stmts: Vec<(u32, StmtRecord)>,
    pub incomplete: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StmtStatus {
    New,
    AlreadyExecuted,
}

#[derive(Debug, Default)]
pub struct SessionCatalog {
    sessions: Mutex<HashMap<Uuid, SessionRecord>>,
}

impl SessionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&self, txn: &TxnInfo) -> ShardResult<StmtStatus> {
        let sessions = self.sessions.lock();
        let Some(record) = sessions.get(&txn.lsid) else {
            return Ok(StmtStatus::New);
        };
        if txn.txn_number < record.txn_number {
            return Err(ShardError::IllegalOperation(format!(
                "txn number {} of session {} is older than active txn {}",
                txn.txn_number, txn.lsid, record.txn_number
            )));
        }
        if txn.txn_number > record.txn_number {
            return Ok(StmtStatus::New);
        }
        if record.stmts.contains_key(&txn.stmt_id) {
            return Ok(StmtStatus::AlreadyExecuted);
        }
        if record.incomplete {
            return Err(ShardError::IncompleteTransactionHistory {
                lsid: txn.lsid,
                txn_number: txn.txn_number,
            });
        }
        Ok(StmtStatus::New)
    }

    pub fn record(&self, txn: &TxnInfo, stmt: StmtRecord) {
        let mut sessions = self.sessions.lock();
        let record = sessions.entry(txn.lsid).or_default();
        if txn.txn_number > record.txn_number {
            *record = SessionRecord {
                txn_number: txn.txn_number,
                ..SessionRecord::default()
            };
        }
        if txn.txn_number == record.txn_number {
            record.stmts.insert(txn.stmt_id, stmt);
        }
    }

    /// Sessions with statements on `range` of `ns`.
    ///
    /// Statements at or before `truncated_through` have lost their write-log
    /// entry, so their session is exported as incomplete.
    pub fn export_for_range(
        &self,
        ns: &str,
        range: &ChunkRange,
        truncated_through: Timestamp,
    ) -> Vec<MigratedSession> {
        let sessions = self.sessions.lock();
        let mut out = Vec::new();
        for (lsid, record) in sessions.iter() {
            let stmts: Vec<(u32, StmtRecord)> = record
                .stmts
                .iter()
                .filter(|(_, s)| s.ns == ns && range.contains(&s.key))
                .map(|(id, s)| (*id, s.clone()))
                .collect();
            if stmts.is_empty() {
                continue;
            }
            let incomplete = stmts.iter().any(|(_, s)| s.ts <= truncated_through);
            out.push(MigratedSession {
                lsid: *lsid,
                txn_number: record.txn_number,
                stmts: if incomplete { Vec::new() } else { stmts },
                incomplete,
            });
        }
        out
    }

    pub fn import(&self, migrated: Vec<MigratedSession>) {
        let mut sessions = self.sessions.lock();
        for session in migrated {
            let record = sessions.entry(session.lsid).or_default();
            if session.txn_number < record.txn_number {
                continue;
            }
            if session.txn_number > record.txn_number {
                *record = SessionRecord {
                    txn_number: session.txn_number,
                    ..SessionRecord::default()
                };
            }
            record.stmts.extend(session.stmts);
            record.incomplete |= session.incomplete;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stmt(x: i64, ts: u64) -> StmtRecord {
        StmtRecord {
            ns: "a.b".to_string(),
            key: ShardKey::int(x),
            ts: Timestamp(ts),
        }
    }

    #[test]
    fn executed_statements_are_recognised() {
        let sessions = SessionCatalog::new();
        let txn = TxnInfo::new(Uuid::new_v4(), 1, 0);
        assert_eq!(sessions.check(&txn).expect("check"), StmtStatus::New);
        sessions.record(&txn, stmt(1, 10));
        assert_eq!(sessions.check(&txn).expect("check"), StmtStatus::AlreadyExecuted);
        assert_eq!(sessions.check(&txn.offset(1)).expect("check"), StmtStatus::New);

        let newer = TxnInfo::new(txn.lsid, 2, 0);
        sessions.record(&newer, stmt(1, 20));
        assert!(matches!(
            sessions.check(&txn),
            Err(ShardError::IllegalOperation(_))
        ));
    }

    #[test]
    fn migrated_sessions_follow_the_range() {
        let donor = SessionCatalog::new();
        let recipient = SessionCatalog::new();
        let txn = TxnInfo::new(Uuid::new_v4(), 3, 0);
        donor.record(&txn, stmt(5, 10));
        donor.record(&txn.offset(1), stmt(-5, 11));

        let range = ChunkRange::new(ShardKey::int(0), ShardKey::max(1)).expect("range");
        let exported = donor.export_for_range("a.b", &range, Timestamp::ZERO);
        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0].stmts.len(), 1);
        recipient.import(exported);
        assert_eq!(recipient.check(&txn).expect("check"), StmtStatus::AlreadyExecuted);
        assert_eq!(recipient.check(&txn.offset(1)).expect("check"), StmtStatus::New);
    }

    #[test]
    fn truncated_history_yields_incomplete_marker() {
        let donor = SessionCatalog::new();
        let recipient = SessionCatalog::new();
        let txn = TxnInfo::new(Uuid::new_v4(), 1, 0);
        donor.record(&txn, stmt(5, 10));
        let range = ChunkRange::full(1);
        recipient.import(donor.export_for_range("a.b", &range, Timestamp(10)));
        assert!(matches!(
            recipient.check(&txn),
            Err(ShardError::IncompleteTransactionHistory { .. })
        ));
    }
}
