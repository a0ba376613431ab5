//! Volatile log store.

use super::{entries_in_range, LogStore};
use crate::core::error::{TesseraError, TesseraResult};
use crate::raft::types::{HardState, LogEntry, Snapshot};

/// Keeps the log in memory. Used by tests and by members that do not need to
/// survive a restart.
#[derive(Debug, Default)]
pub struct MemoryLogStore {
    hard_state: HardState,
    snapshot: Option<Snapshot>,
    /// Entries after the snapshot boundary.
    log: Vec<LogEntry>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn offset(&self) -> u64 {
        self.snapshot.as_ref().map_or(0, |s| s.meta.last_index)
    }
}

impl LogStore for MemoryLogStore {
    fn hard_state(&self) -> HardState {
        self.hard_state
    }

    fn set_hard_state(&mut self, hs: HardState) -> TesseraResult<()> {
        self.hard_state = hs;
        Ok(())
    }

    fn first_index(&self) -> u64 {
        self.offset() + 1
    }

    fn last_index(&self) -> u64 {
        self.offset() + self.log.len() as u64
    }

    fn term(&self, index: u64) -> Option<u64> {
        let offset = self.offset();
        if index == 0 {
            return Some(0);
        }
        if index == offset {
            return self.snapshot.as_ref().map(|s| s.meta.last_term);
        }
        if index < offset {
            return None;
        }
        self.log.get((index - offset - 1) as usize).map(|e| e.term)
    }

    fn entries(&self, lo: u64, hi: u64, max_bytes: usize) -> TesseraResult<Vec<LogEntry>> {
        Ok(entries_in_range(&self.log, self.offset(), lo, hi, max_bytes))
    }

    fn append(&mut self, entries: &[LogEntry]) -> TesseraResult<()> {
        let Some(first) = entries.first() else {
            return Ok(());
        };
        if first.index != self.last_index() + 1 {
            return Err(TesseraError::storage(format!(
                "non-contiguous append: expected index {}, got {}",
                self.last_index() + 1,
                first.index
            )));
        }
        self.log.extend_from_slice(entries);
        Ok(())
    }

    fn truncate_suffix(&mut self, from: u64) -> TesseraResult<()> {
        let offset = self.offset();
        if from <= offset {
            return Err(TesseraError::storage(format!(
                "cannot truncate at {} below snapshot index {}",
                from, offset
            )));
        }
        self.log.truncate((from - offset - 1) as usize);
        Ok(())
    }

    fn snapshot(&self) -> Option<Snapshot> {
        self.snapshot.clone()
    }

    fn apply_snapshot(&mut self, snapshot: Snapshot) -> TesseraResult<()> {
        let offset = self.offset();
        let last = snapshot.meta.last_index;
        if last <= offset {
            return Ok(());
        }
        if self.term(last) == Some(snapshot.meta.last_term) {
            self.log.drain(..(last - offset) as usize);
        } else {
            self.log.clear();
        }
        self.snapshot = Some(snapshot);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::types::{EntryPayload, SnapshotMeta};

    fn entry(index: u64, term: u64) -> LogEntry {
        LogEntry::new(index, term, EntryPayload::Noop)
    }

    #[test]
    fn append_and_read_back() {
        let mut store = MemoryLogStore::new();
        store
            .append(&[entry(1, 1), entry(2, 1), entry(3, 2)])
            .unwrap();
        assert_eq!(store.first_index(), 1);
        assert_eq!(store.last_index(), 3);
        assert_eq!(store.term(3), Some(2));
        assert_eq!(store.term(4), None);
        let got = store.entries(2, 4, usize::MAX).unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].index, 2);
    }

    #[test]
    fn rejects_gaps() {
        let mut store = MemoryLogStore::new();
        store.append(&[entry(1, 1)]).unwrap();
        assert!(store.append(&[entry(3, 1)]).is_err());
    }

    #[test]
    fn snapshot_keeps_matching_suffix() {
        let mut store = MemoryLogStore::new();
        store
            .append(&[entry(1, 1), entry(2, 1), entry(3, 1), entry(4, 2)])
            .unwrap();
        store
            .apply_snapshot(Snapshot {
                meta: SnapshotMeta {
                    last_index: 2,
                    last_term: 1,
                    members: vec![],
                },
                data: vec![],
            })
            .unwrap();
        assert_eq!(store.first_index(), 3);
        assert_eq!(store.last_index(), 4);
        assert_eq!(store.term(2), Some(1));
        assert_eq!(store.term(1), None);
        assert!(store.truncate_suffix(2).is_err());
    }

    #[test]
    fn snapshot_with_foreign_term_discards_log() {
        let mut store = MemoryLogStore::new();
        store.append(&[entry(1, 1), entry(2, 1)]).unwrap();
        store
            .apply_snapshot(Snapshot {
                meta: SnapshotMeta {
                    last_index: 5,
                    last_term: 3,
                    members: vec![],
                },
                data: vec![1, 2, 3],
            })
            .unwrap();
        assert_eq!(store.first_index(), 6);
        assert_eq!(store.last_index(), 5);
        assert_eq!(store.term(5), Some(3));
    }
}
