//! Global ordered log of committed changes.
//!
//! Every durable commit lands here under the sequence number the store
//! assigned it at commit time, so the log order is the commit order even
//! when the post-commit work (embedding, indexing) finishes out of order:
//! a record appended ahead of its predecessors is parked until the gap
//! closes, and only the contiguous prefix is visible to readers. The log is
//! in-memory and rebuilt from the store's replay on cold start; because the
//! sequence numbers come from the store they are stable across restarts.

use crate::error::RegistryError;
use crate::skill_store::ReplayEntry;
use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::watch;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Updated => "updated",
            ChangeKind::Deleted => "deleted",
        }
    }
}

/// One entry of the global change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Global, gapless, starting at 1. Assigned by the store at commit.
    pub sequence: u64,
    pub kind: ChangeKind,
    pub name: String,
    pub version: u64,
    /// True when the search index could not be updated for this change.
    pub degraded: bool,
    pub timestamp: i64,
}

struct LogInner {
    /// Contiguous prefix, `released[i].sequence == i + 1`.
    released: Vec<ChangeRecord>,
    /// Appended ahead of a still-missing predecessor.
    parked: BTreeMap<u64, ChangeRecord>,
}

/// Append-only change log with a watchable tail.
pub struct ChangeLog {
    inner: Mutex<LogInner>,
    tail_tx: watch::Sender<u64>,
    halted: AtomicBool,
}

impl ChangeLog {
    pub fn new() -> Self {
        let (tail_tx, _) = watch::channel(0);
        ChangeLog {
            inner: Mutex::new(LogInner {
                released: Vec::new(),
                parked: BTreeMap::new(),
            }),
            tail_tx,
            halted: AtomicBool::new(false),
        }
    }

    /// Rebuild the log from the store's full commit history.
    pub fn rebuild(entries: &[ReplayEntry]) -> Self {
        let log = Self::new();
        {
            let mut inner = log.inner.lock().unwrap();
            for entry in entries {
                let kind = if entry.tombstone {
                    ChangeKind::Deleted
                } else if entry.version == 1 {
                    ChangeKind::Created
                } else {
                    ChangeKind::Updated
                };
                inner.released.push(ChangeRecord {
                    sequence: entry.seq,
                    kind,
                    name: entry.name.clone(),
                    version: entry.version,
                    degraded: false,
                    timestamp: entry.created_at,
                });
            }
            let tail = inner.released.len() as u64;
            drop(inner);
            let _ = log.tail_tx.send(tail);
        }
        log
    }

    /// Append one change under the sequence number the store assigned its
    /// commit. The record becomes readable once every lower sequence has
    /// been appended too; the returned record carries its final sequence
    /// either way.
    pub fn append(
        &self,
        sequence: u64,
        kind: ChangeKind,
        name: &str,
        version: u64,
        degraded: bool,
        timestamp: i64,
    ) -> Result<ChangeRecord, RegistryError> {
        if self.is_halted() {
            return Err(RegistryError::LogHalted);
        }
        let record = ChangeRecord {
            sequence,
            kind,
            name: name.to_string(),
            version,
            degraded,
            timestamp,
        };

        let mut inner = self.inner.lock().unwrap();
        if sequence <= inner.released.len() as u64 || inner.parked.contains_key(&sequence) {
            return Err(RegistryError::Internal(anyhow!(
                "change sequence {} already logged",
                sequence
            )));
        }
        inner.parked.insert(sequence, record.clone());
        loop {
            let next = inner.released.len() as u64 + 1;
            match inner.parked.remove(&next) {
                Some(ready) => inner.released.push(ready),
                None => break,
            }
        }
        let tail = inner.released.len() as u64;
        drop(inner);
        let _ = self.tail_tx.send(tail);
        Ok(record)
    }

    /// Records with sequence strictly greater than `after`, up to `limit`.
    /// Only the contiguous prefix is served.
    pub fn read_from(&self, after: u64, limit: usize) -> Vec<ChangeRecord> {
        let inner = self.inner.lock().unwrap();
        inner
            .released
            .iter()
            .skip(after as usize)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Highest released sequence, 0 when empty.
    pub fn tail(&self) -> u64 {
        *self.tail_tx.borrow()
    }

    /// Receiver that wakes when the tail advances.
    pub fn watch_tail(&self) -> watch::Receiver<u64> {
        self.tail_tx.subscribe()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Stop accepting writes. Reads keep working so connected agents can
    /// drain what is already logged.
    pub fn halt(&self, reason: &str) {
        error!("Change log halted: {}", reason);
        self.halted.store(true, Ordering::SeqCst);
    }
}

impl Default for ChangeLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequences_are_gapless_from_one() {
        let log = ChangeLog::new();
        for i in 1..=5u64 {
            let record = log
                .append(i, ChangeKind::Updated, "skill", i, false, 0)
                .unwrap();
            assert_eq!(record.sequence, i);
            assert_eq!(log.tail(), i);
        }
    }

    #[test]
    fn read_from_is_exclusive_of_cursor() {
        let log = ChangeLog::new();
        log.append(1, ChangeKind::Created, "a", 1, false, 0).unwrap();
        log.append(2, ChangeKind::Created, "b", 1, false, 0).unwrap();
        log.append(3, ChangeKind::Deleted, "a", 2, false, 0).unwrap();

        let records = log.read_from(1, 10);
        let seqs: Vec<u64> = records.iter().map(|r| r.sequence).collect();
        assert_eq!(seqs, vec![2, 3]);

        assert!(log.read_from(3, 10).is_empty());
        assert_eq!(log.read_from(0, 2).len(), 2);
    }

    #[test]
    fn out_of_order_appends_release_in_commit_order() {
        let log = ChangeLog::new();
        let parked = log
            .append(2, ChangeKind::Updated, "a", 2, false, 0)
            .unwrap();
        assert_eq!(parked.sequence, 2);
        // Nothing readable until the gap closes.
        assert_eq!(log.tail(), 0);
        assert!(log.read_from(0, 10).is_empty());

        log.append(1, ChangeKind::Created, "a", 1, false, 0).unwrap();
        assert_eq!(log.tail(), 2);
        let versions: Vec<u64> = log.read_from(0, 10).iter().map(|r| r.version).collect();
        assert_eq!(versions, vec![1, 2]);
    }

    #[test]
    fn duplicate_sequence_is_rejected() {
        let log = ChangeLog::new();
        log.append(1, ChangeKind::Created, "a", 1, false, 0).unwrap();
        assert!(log.append(1, ChangeKind::Updated, "b", 1, false, 0).is_err());
        assert_eq!(log.tail(), 1);
    }

    #[test]
    fn halted_log_rejects_appends_but_serves_reads() {
        let log = ChangeLog::new();
        log.append(1, ChangeKind::Created, "a", 1, false, 0).unwrap();
        log.halt("test");

        assert!(matches!(
            log.append(2, ChangeKind::Updated, "a", 2, false, 0),
            Err(RegistryError::LogHalted)
        ));
        assert_eq!(log.read_from(0, 10).len(), 1);
    }

    #[test]
    fn rebuild_classifies_kinds_from_history() {
        let entries = vec![
            ReplayEntry {
                seq: 1,
                name: "a".to_string(),
                version: 1,
                tombstone: false,
                created_at: 10,
            },
            ReplayEntry {
                seq: 2,
                name: "a".to_string(),
                version: 2,
                tombstone: false,
                created_at: 20,
            },
            ReplayEntry {
                seq: 3,
                name: "a".to_string(),
                version: 3,
                tombstone: true,
                created_at: 30,
            },
        ];
        let log = ChangeLog::rebuild(&entries);
        let records = log.read_from(0, 10);
        assert_eq!(records[0].kind, ChangeKind::Created);
        assert_eq!(records[1].kind, ChangeKind::Updated);
        assert_eq!(records[2].kind, ChangeKind::Deleted);
        let seqs: Vec<u64> = records.iter().map(|r| r.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(log.tail(), 3);
    }

    #[tokio::test]
    async fn watch_tail_wakes_on_append() {
        let log = ChangeLog::new();
        let mut rx = log.watch_tail();
        assert_eq!(*rx.borrow_and_update(), 0);

        log.append(1, ChangeKind::Created, "a", 1, false, 0).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), 1);
    }
}
