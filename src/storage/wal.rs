//! Segmented write-ahead log.
//!
//! Layout under the data directory:
//!
//! ```text
//! wal/segment_{id:016}.wal   append-only record files
//! wal/hardstate              term / vote / commit, replaced atomically
//! snap/snapshot_*.snap       see [`super::snapshot`]
//! ```
//!
//! Each record is framed as `[crc32 u32 LE][len u32 LE][bincode payload]`.
//! Suffix truncation is itself a record, so segments are never rewritten.
//! On recovery a torn or corrupt record at the tail of the newest segment is
//! cut off; corruption anywhere else is an error.

use super::snapshot::SnapshotStore;
use super::{entries_in_range, LogStore};
use crate::core::error::{TesseraError, TesseraResult};
use crate::raft::types::{HardState, LogEntry, Snapshot};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Default maximum segment size (64MB).
pub const DEFAULT_SEGMENT_MAX_BYTES: u64 = 64 * 1024 * 1024;

const SEGMENT_PREFIX: &str = "segment_";
const SEGMENT_SUFFIX: &str = ".wal";
const HARD_STATE_FILE: &str = "hardstate";
const FRAME_HEADER_LEN: usize = 8;

/// Tuning knobs for [`FileLogStore`].
#[derive(Debug, Clone)]
pub struct WalOptions {
    pub segment_max_bytes: u64,
    /// fsync after every append batch.
    pub fsync: bool,
    pub snapshots_retained: usize,
}

impl Default for WalOptions {
    fn default() -> Self {
        Self {
            segment_max_bytes: DEFAULT_SEGMENT_MAX_BYTES,
            fsync: true,
            snapshots_retained: 3,
        }
    }
}

/// A single framed record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalRecord {
    Entry(LogEntry),
    /// Every entry with index `>= from` written before this record is void.
    Truncate { from: u64 },
}

/// Result of scanning one segment file.
#[derive(Debug, Clone)]
pub struct SegmentScan {
    pub records: Vec<WalRecord>,
    /// Length of the valid record prefix in bytes.
    pub valid_len: u64,
    /// Whether bytes past `valid_len` had to be ignored.
    pub torn: bool,
}

/// Encode one record into its on-disk frame.
pub fn encode_record(record: &WalRecord) -> TesseraResult<BytesMut> {
    let payload = bincode::serialize(record)?;
    let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.put_u32_le(crc32fast::hash(&payload));
    frame.put_u32_le(payload.len() as u32);
    frame.put_slice(&payload);
    Ok(frame)
}

/// Decode every intact record in a segment file.
pub fn scan_segment(path: &Path) -> TesseraResult<SegmentScan> {
    let data = fs::read(path)?;
    let mut records = Vec::new();
    let mut pos = 0usize;
    let mut torn = false;

    while pos < data.len() {
        let mut header = &data[pos..];
        if header.len() < FRAME_HEADER_LEN {
            torn = true;
            break;
        }
        let crc = header.get_u32_le();
        let len = header.get_u32_le() as usize;
        let start = pos + FRAME_HEADER_LEN;
        let Some(payload) = data.get(start..start + len) else {
            torn = true;
            break;
        };
        if crc32fast::hash(payload) != crc {
            torn = true;
            break;
        }
        match bincode::deserialize::<WalRecord>(payload) {
            Ok(record) => records.push(record),
            Err(_) => {
                torn = true;
                break;
            }
        }
        pos = start + len;
    }

    Ok(SegmentScan {
        records,
        valid_len: pos as u64,
        torn,
    })
}

/// Segment files in `dir` as `(id, path)`, oldest first.
pub fn list_segments(dir: &Path) -> TesseraResult<Vec<(u64, PathBuf)>> {
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let id = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix(SEGMENT_PREFIX))
            .and_then(|n| n.strip_suffix(SEGMENT_SUFFIX))
            .and_then(|n| n.parse::<u64>().ok());
        if let Some(id) = id {
            out.push((id, path));
        }
    }
    out.sort_by_key(|(id, _)| *id);
    Ok(out)
}

/// Read the persisted hard state, if any.
pub fn read_hard_state(wal_dir: &Path) -> TesseraResult<Option<HardState>> {
    let path = wal_dir.join(HARD_STATE_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(&path)?;
    Ok(Some(bincode::deserialize(&bytes)?))
}

#[derive(Debug)]
struct Segment {
    id: u64,
    path: PathBuf,
    /// Highest entry index written to this segment.
    max_index: u64,
    size: u64,
}

/// Durable [`LogStore`] backed by segment files.
///
/// The full post-snapshot log is mirrored in memory; disk is written
/// synchronously on every mutation.
pub struct FileLogStore {
    wal_dir: PathBuf,
    options: WalOptions,
    hard_state: HardState,
    snapshots: SnapshotStore,
    snapshot: Option<Snapshot>,
    log: Vec<LogEntry>,
    segments: Vec<Segment>,
    writer: BufWriter<File>,
}

impl FileLogStore {
    /// Open (or create) the store under `data_dir`, replaying existing
    /// segments on top of the newest snapshot.
    pub fn open(data_dir: impl AsRef<Path>, options: WalOptions) -> TesseraResult<Self> {
        let data_dir = data_dir.as_ref();
        let wal_dir = data_dir.join("wal");
        fs::create_dir_all(&wal_dir)?;
        let snapshots = SnapshotStore::open(data_dir.join("snap"), options.snapshots_retained)?;

        let snapshot = snapshots.latest()?;
        let hard_state = read_hard_state(&wal_dir)?.unwrap_or_default();
        let offset = snapshot.as_ref().map_or(0, |s| s.meta.last_index);

        let mut log: Vec<LogEntry> = Vec::new();
        let mut segments = Vec::new();
        let files = list_segments(&wal_dir)?;
        let newest = files.last().map(|(id, _)| *id);

        for (id, path) in files {
            let scan = scan_segment(&path)?;
            if scan.torn {
                if Some(id) != newest {
                    return Err(TesseraError::storage(format!(
                        "corrupt record in sealed segment {}",
                        path.display()
                    )));
                }
                tracing::warn!(
                    segment = %path.display(),
                    valid_len = scan.valid_len,
                    "truncating torn tail of newest wal segment"
                );
                let file = OpenOptions::new().write(true).open(&path)?;
                file.set_len(scan.valid_len)?;
                file.sync_all()?;
            }

            let mut max_index = 0;
            for record in scan.records {
                match record {
                    WalRecord::Entry(entry) => {
                        max_index = max_index.max(entry.index);
                        replay_entry(&mut log, offset, entry)?;
                    }
                    WalRecord::Truncate { from } => {
                        if from > offset {
                            log.truncate((from - offset - 1) as usize);
                        }
                    }
                }
            }
            segments.push(Segment {
                id,
                path,
                max_index,
                size: scan.valid_len,
            });
        }

        if segments.is_empty() {
            segments.push(Segment {
                id: 1,
                path: segment_path(&wal_dir, 1),
                max_index: 0,
                size: 0,
            });
        }
        let writer = open_for_append(&segments[segments.len() - 1].path)?;

        tracing::info!(
            wal_dir = %wal_dir.display(),
            snapshot_index = offset,
            entries = log.len(),
            segments = segments.len(),
            "wal recovered"
        );

        Ok(Self {
            wal_dir,
            options,
            hard_state,
            snapshots,
            snapshot,
            log,
            segments,
            writer,
        })
    }

    pub fn wal_dir(&self) -> &Path {
        &self.wal_dir
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    fn offset(&self) -> u64 {
        self.snapshot.as_ref().map_or(0, |s| s.meta.last_index)
    }

    fn write_records(&mut self, records: &[WalRecord]) -> TesseraResult<()> {
        for record in records {
            let frame = encode_record(record)?;
            self.writer.write_all(&frame)?;
            let current = self.current_segment_mut()?;
            current.size += frame.len() as u64;
            if let WalRecord::Entry(entry) = record {
                current.max_index = current.max_index.max(entry.index);
            }
        }
        self.writer.flush()?;
        if self.options.fsync {
            self.writer.get_ref().sync_data()?;
        }
        let full = self
            .segments
            .last()
            .is_some_and(|s| s.size >= self.options.segment_max_bytes);
        if full {
            self.roll_segment()?;
        }
        Ok(())
    }

    fn current_segment_mut(&mut self) -> TesseraResult<&mut Segment> {
        self.segments
            .last_mut()
            .ok_or_else(|| TesseraError::storage("wal has no open segment"))
    }

    fn roll_segment(&mut self) -> TesseraResult<()> {
        let next_id = self.segments.last().map_or(1, |s| s.id + 1);
        let path = segment_path(&self.wal_dir, next_id);
        self.writer = open_for_append(&path)?;
        self.segments.push(Segment {
            id: next_id,
            path,
            max_index: 0,
            size: 0,
        });
        tracing::debug!(segment_id = next_id, "rolled wal segment");
        Ok(())
    }

    /// Delete the oldest sealed segments whose entries are all covered by
    /// the snapshot at `through`.
    fn remove_covered_segments(&mut self, through: u64) -> TesseraResult<()> {
        while self.segments.len() > 1 && self.segments[0].max_index <= through {
            let seg = self.segments.remove(0);
            fs::remove_file(&seg.path)?;
            tracing::debug!(segment_id = seg.id, through, "removed compacted wal segment");
        }
        Ok(())
    }
}

fn replay_entry(log: &mut Vec<LogEntry>, offset: u64, entry: LogEntry) -> TesseraResult<()> {
    if entry.index <= offset {
        return Ok(());
    }
    let next = offset + log.len() as u64 + 1;
    if entry.index > next {
        return Err(TesseraError::storage(format!(
            "wal gap: expected index {}, found {}",
            next, entry.index
        )));
    }
    log.truncate((entry.index - offset - 1) as usize);
    log.push(entry);
    Ok(())
}

fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{}{:016}{}", SEGMENT_PREFIX, id, SEGMENT_SUFFIX))
}

fn open_for_append(path: &Path) -> TesseraResult<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

impl LogStore for FileLogStore {
    fn hard_state(&self) -> HardState {
        self.hard_state
    }

    fn set_hard_state(&mut self, hs: HardState) -> TesseraResult<()> {
        if hs == self.hard_state {
            return Ok(());
        }
        let path = self.wal_dir.join(HARD_STATE_FILE);
        let tmp = self.wal_dir.join(format!("{}.tmp", HARD_STATE_FILE));
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&bincode::serialize(&hs)?)?;
            if self.options.fsync {
                file.sync_all()?;
            }
        }
        fs::rename(&tmp, &path)?;
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
        let expected = self.last_index() + 1;
        if first.index != expected {
            return Err(TesseraError::storage(format!(
                "non-contiguous append: expected index {}, got {}",
                expected, first.index
            )));
        }
        let records: Vec<WalRecord> = entries.iter().cloned().map(WalRecord::Entry).collect();
        self.write_records(&records)?;
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
        if from > self.last_index() {
            return Ok(());
        }
        self.write_records(&[WalRecord::Truncate { from }])?;
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
        self.snapshots.save(&snapshot)?;

        if self.term(last) == Some(snapshot.meta.last_term) {
            self.log.drain(..(last - offset) as usize);
        } else {
            self.log.clear();
            self.write_records(&[WalRecord::Truncate { from: last + 1 }])?;
        }
        self.snapshot = Some(snapshot);

        if self.segments.last().is_some_and(|s| s.size > 0) {
            self.roll_segment()?;
        }
        self.remove_covered_segments(last)
    }
}
