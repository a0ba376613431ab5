//! Durable log and snapshot storage.
//!
//! The [`LogStore`] trait is the only persistence seam used by the Raft core:
//! - [`wal`] - segmented, CRC-framed append-only log files plus hard state
//! - [`snapshot`] - snapshot files with retention
//! - [`memory`] - volatile store for tests and ephemeral members
//!
//! Every write returns only after the data is handed to the OS (and fsynced
//! when configured), so the Raft core may acknowledge entries as soon as an
//! `append` call returns.

pub mod memory;
pub mod snapshot;
pub mod wal;

pub use memory::MemoryLogStore;
pub use snapshot::SnapshotStore;
pub use wal::{FileLogStore, WalOptions};

use crate::core::error::TesseraResult;
use crate::raft::types::{HardState, LogEntry, Snapshot};

/// Ordered, append-only storage for Raft log entries.
///
/// Indexes start at 1. Entries up to and including the latest snapshot's
/// `last_index` may have been discarded; `first_index` reports the first one
/// still available.
pub trait LogStore: Send + 'static {
    fn hard_state(&self) -> HardState;

    /// Durably record term, vote and commit index.
    fn set_hard_state(&mut self, hs: HardState) -> TesseraResult<()>;

    /// Index of the first entry still held (snapshot `last_index + 1`).
    fn first_index(&self) -> u64;

    /// Index of the last entry, or the snapshot's `last_index` when empty.
    fn last_index(&self) -> u64;

    /// Term of the entry at `index`. Answers for index 0 and for the snapshot
    /// boundary; `None` for compacted or absent positions.
    fn term(&self, index: u64) -> Option<u64>;

    /// Entries in `[lo, hi)`, stopping early once `max_bytes` is exceeded
    /// (always at least one entry if any is available).
    fn entries(&self, lo: u64, hi: u64, max_bytes: usize) -> TesseraResult<Vec<LogEntry>>;

    /// Append entries. The first entry must directly follow `last_index`.
    fn append(&mut self, entries: &[LogEntry]) -> TesseraResult<()>;

    /// Remove every entry with index `>= from`.
    fn truncate_suffix(&mut self, from: u64) -> TesseraResult<()>;

    /// The most recent snapshot, if any.
    fn snapshot(&self) -> Option<Snapshot>;

    /// Persist a snapshot and discard the log prefix it covers. Entries after
    /// the snapshot are kept only if the log agrees with the snapshot's
    /// boundary term; otherwise the whole log is discarded.
    fn apply_snapshot(&mut self, snapshot: Snapshot) -> TesseraResult<()>;
}

/// Shared prefix bookkeeping for stores that keep entries in a `Vec`.
pub(crate) fn entries_in_range(
    log: &[LogEntry],
    offset: u64,
    lo: u64,
    hi: u64,
    max_bytes: usize,
) -> Vec<LogEntry> {
    let mut out = Vec::new();
    if lo >= hi || lo <= offset {
        return out;
    }
    let start = (lo - offset - 1) as usize;
    let end = ((hi - offset - 1) as usize).min(log.len());
    let mut size = 0usize;
    for entry in log.get(start..end).unwrap_or(&[]) {
        size += entry.approx_size();
        if !out.is_empty() && size > max_bytes {
            break;
        }
        out.push(entry.clone());
    }
    out
}
