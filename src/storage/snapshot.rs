//! Snapshot files.
//!
//! Each snapshot is one file named `snapshot_{index:016}_{term:016}.snap`
//! holding the bincode-encoded [`SnapshotFile`]. Files are written to a
//! temporary name and renamed into place, so a crash never leaves a partial
//! snapshot under a valid name.

use crate::core::error::{TesseraError, TesseraResult};
use crate::raft::types::{Snapshot, SnapshotMeta};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const SNAPSHOT_PREFIX: &str = "snapshot_";
const SNAPSHOT_SUFFIX: &str = ".snap";

/// On-disk snapshot envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub meta: SnapshotMeta,
    pub created_at_ms: u64,
    /// CRC32 of `data`.
    pub checksum: u32,
    pub data: Vec<u8>,
}

impl SnapshotFile {
    pub fn new(snapshot: Snapshot) -> Self {
        let created_at_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
        Self {
            checksum: crc32fast::hash(&snapshot.data),
            meta: snapshot.meta,
            created_at_ms,
            data: snapshot.data,
        }
    }

    pub fn verify(&self) -> TesseraResult<()> {
        let actual = crc32fast::hash(&self.data);
        if actual != self.checksum {
            return Err(TesseraError::storage(format!(
                "snapshot {} checksum mismatch: expected {:#010x}, got {:#010x}",
                self.meta.last_index, self.checksum, actual
            )));
        }
        Ok(())
    }

    pub fn into_snapshot(self) -> Snapshot {
        Snapshot {
            meta: self.meta,
            data: self.data,
        }
    }

    pub fn write_to(&self, path: &Path) -> TesseraResult<()> {
        let tmp = path.with_extension("tmp");
        {
            let file = File::create(&tmp)?;
            let mut writer = BufWriter::new(file);
            bincode::serialize_into(&mut writer, self)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> TesseraResult<Self> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        let snap: SnapshotFile = bincode::deserialize(&bytes)?;
        snap.verify()?;
        Ok(snap)
    }
}

/// Summary of a snapshot file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub index: u64,
    pub term: u64,
    pub path: PathBuf,
}

/// Directory of snapshot files with bounded retention.
#[derive(Debug)]
pub struct SnapshotStore {
    dir: PathBuf,
    retain: usize,
}

impl SnapshotStore {
    pub fn open(dir: impl Into<PathBuf>, retain: usize) -> TesseraResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            retain: retain.max(1),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, meta: &SnapshotMeta) -> PathBuf {
        self.dir.join(format!(
            "{}{:016}_{:016}{}",
            SNAPSHOT_PREFIX, meta.last_index, meta.last_term, SNAPSHOT_SUFFIX
        ))
    }

    /// Write a snapshot and prune old ones.
    pub fn save(&self, snapshot: &Snapshot) -> TesseraResult<PathBuf> {
        let path = self.path_for(&snapshot.meta);
        SnapshotFile::new(snapshot.clone()).write_to(&path)?;
        tracing::debug!(
            index = snapshot.meta.last_index,
            term = snapshot.meta.last_term,
            bytes = snapshot.data.len(),
            "snapshot saved"
        );
        self.cleanup()?;
        Ok(path)
    }

    /// All snapshot files, newest first.
    pub fn list(&self) -> TesseraResult<Vec<SnapshotEntry>> {
        list_snapshots(&self.dir)
    }

    /// Load the newest snapshot that passes verification. Corrupt files are
    /// skipped with a warning.
    pub fn latest(&self) -> TesseraResult<Option<Snapshot>> {
        for entry in self.list()? {
            match SnapshotFile::read_from(&entry.path) {
                Ok(file) => return Ok(Some(file.into_snapshot())),
                Err(e) => {
                    tracing::warn!(path = %entry.path.display(), error = %e, "skipping unreadable snapshot");
                }
            }
        }
        Ok(None)
    }

    fn cleanup(&self) -> TesseraResult<()> {
        for stale in self.list()?.into_iter().skip(self.retain) {
            fs::remove_file(&stale.path)?;
        }
        Ok(())
    }
}

/// Parse snapshot file names in `dir`, newest first.
pub fn list_snapshots(dir: &Path) -> TesseraResult<Vec<SnapshotEntry>> {
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(body) = name
            .strip_prefix(SNAPSHOT_PREFIX)
            .and_then(|n| n.strip_suffix(SNAPSHOT_SUFFIX))
        else {
            continue;
        };
        let mut parts = body.split('_');
        let (Some(index), Some(term)) = (parts.next(), parts.next()) else {
            continue;
        };
        if let (Ok(index), Ok(term)) = (index.parse(), term.parse()) {
            out.push(SnapshotEntry { index, term, path });
        }
    }
    out.sort_by(|a, b| b.index.cmp(&a.index).then(b.term.cmp(&a.term)));
    Ok(out)
}
