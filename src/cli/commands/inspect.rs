//! Inspect command implementation.
//!
//! Reads a stopped member's files directly; nothing is modified.

use crate::kv::request::Request;
use crate::kv::state_machine::StateMachine;
use crate::raft::types::{ConfChangeKind, EntryPayload, LogEntry};
use crate::storage::snapshot::{list_snapshots, SnapshotFile};
use crate::storage::wal::{list_segments, read_hard_state, scan_segment, WalRecord};
use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

/// Offline inspection of the log and snapshots.
#[derive(Args, Debug)]
pub struct InspectArgs {
    #[command(subcommand)]
    pub command: InspectCommand,
}

/// Inspect subcommands.
#[derive(Subcommand, Debug)]
pub enum InspectCommand {
    /// Summarize WAL segments.
    Wal {
        /// Data directory or its `wal` subdirectory.
        path: PathBuf,
        /// List every record.
        #[arg(long)]
        entries: bool,
        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },
    /// Describe a snapshot and the state it holds.
    Snapshot {
        /// Snapshot file, or a directory whose newest snapshot is used.
        path: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

/// Run the inspect command.
pub fn run_inspect(args: InspectArgs) -> Result<()> {
    let (report, as_json) = match args.command {
        InspectCommand::Wal {
            path,
            entries,
            json,
        } => (inspect_wal(&path, entries)?, json),
        InspectCommand::Snapshot { path, json } => (inspect_snapshot(&path)?, json),
    };
    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_text(&report, 0);
    }
    Ok(())
}

fn resolve_dir(path: &Path, sub: &str) -> PathBuf {
    let nested = path.join(sub);
    if nested.is_dir() {
        nested
    } else {
        path.to_path_buf()
    }
}

fn describe_entry(entry: &LogEntry) -> String {
    match &entry.payload {
        EntryPayload::Noop => "noop".to_string(),
        EntryPayload::Command(bytes) => match Request::decode(bytes) {
            Ok(req) => format!("{} (member {:x} seq {})", req.op.name(), req.id.member, req.id.seq),
            Err(_) => format!("undecodable command ({} bytes)", bytes.len()),
        },
        EntryPayload::ConfChange(cc) => match &cc.kind {
            ConfChangeKind::AddMember(m) => format!("add member {:x} ({})", m.id, m.peer_addr),
            ConfChangeKind::RemoveMember(id) => format!("remove member {:x}", id),
            ConfChangeKind::UpdateMember(m) => format!("update member {:x} ({})", m.id, m.peer_addr),
        },
    }
}

/// Summarize every segment under the WAL directory.
pub fn inspect_wal(path: &Path, with_entries: bool) -> Result<Value> {
    let wal_dir = resolve_dir(path, "wal");
    let segments = list_segments(&wal_dir)
        .with_context(|| format!("listing segments in {}", wal_dir.display()))?;
    if segments.is_empty() {
        anyhow::bail!("no WAL segments in {}", wal_dir.display());
    }

    let hard_state = read_hard_state(&wal_dir)?;
    let mut out = Vec::with_capacity(segments.len());
    for (id, seg_path) in &segments {
        let scan = scan_segment(seg_path).with_context(|| format!("reading {}", seg_path.display()))?;
        let mut first = None;
        let mut last = None;
        let mut truncations = 0usize;
        let mut records = Vec::new();
        for record in &scan.records {
            match record {
                WalRecord::Entry(entry) => {
                    first.get_or_insert(entry.index);
                    last = Some(entry.index);
                    if with_entries {
                        records.push(json!({
                            "index": entry.index,
                            "term": entry.term,
                            "payload": describe_entry(entry),
                        }));
                    }
                }
                WalRecord::Truncate { from } => {
                    truncations += 1;
                    if with_entries {
                        records.push(json!({ "truncate_from": from }));
                    }
                }
            }
        }
        let mut segment = json!({
            "id": id,
            "path": seg_path.display().to_string(),
            "records": scan.records.len(),
            "first_index": first,
            "last_index": last,
            "truncations": truncations,
            "valid_bytes": scan.valid_len,
            "torn_tail": scan.torn,
        });
        if with_entries {
            segment["entries"] = Value::Array(records);
        }
        out.push(segment);
    }

    Ok(json!({
        "wal_dir": wal_dir.display().to_string(),
        "hard_state": hard_state.map(|hs| json!({
            "term": hs.term,
            "voted_for": hs.voted_for,
            "commit": hs.commit,
        })),
        "segments": out,
    }))
}

/// Decode a snapshot and report what its state machine image contains.
pub fn inspect_snapshot(path: &Path) -> Result<Value> {
    let file_path = if path.is_dir() {
        let dir = resolve_dir(path, "snap");
        list_snapshots(&dir)?
            .into_iter()
            .next()
            .map(|entry| entry.path)
            .with_context(|| format!("no snapshots in {}", dir.display()))?
    } else {
        path.to_path_buf()
    };

    let file = SnapshotFile::read_from(&file_path)
        .with_context(|| format!("reading {}", file_path.display()))?;
    let mut sm = StateMachine::new(1);
    sm.restore(&file.data, file.meta.last_index)
        .context("decoding state machine image")?;

    let created = chrono::DateTime::from_timestamp_millis(file.created_at_ms as i64)
        .map(|t| t.to_rfc3339())
        .unwrap_or_default();
    Ok(json!({
        "path": file_path.display().to_string(),
        "last_index": file.meta.last_index,
        "last_term": file.meta.last_term,
        "created_at": created,
        "bytes": file.data.len(),
        "checksum": format!("{:#010x}", file.checksum),
        "members": file.meta.members.iter().map(|m| json!({
            "id": format!("{:x}", m.id),
            "name": m.name,
            "peer_addr": m.peer_addr,
        })).collect::<Vec<_>>(),
        "revision": sm.current_revision(),
        "compact_revision": sm.kv().compact_revision(),
        "keys": sm.kv().len(),
        "leases": sm.leases().len(),
        "auth_enabled": sm.auth().is_enabled(),
        "users": sm.auth().user_names(),
        "roles": sm.auth().role_names(),
    }))
}

fn print_text(value: &Value, depth: usize) {
    let pad = "  ".repeat(depth);
    match value {
        Value::Object(map) => {
            for (key, v) in map {
                match v {
                    Value::Object(_) | Value::Array(_) => {
                        println!("{}{}:", pad, key);
                        print_text(v, depth + 1);
                    }
                    _ => println!("{}{}: {}", pad, key, scalar(v)),
                }
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                match item {
                    Value::Object(_) | Value::Array(_) => {
                        println!("{}[{}]", pad, i);
                        print_text(item, depth + 1);
                    }
                    _ => println!("{}- {}", pad, scalar(item)),
                }
            }
        }
        other => println!("{}{}", pad, scalar(other)),
    }
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "-".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::request::{Operation, Principal, PutRequest, RequestId};
    use crate::raft::types::{Snapshot, SnapshotMeta};
    use crate::storage::snapshot::SnapshotStore;
    use crate::storage::wal::{FileLogStore, WalOptions};
    use crate::storage::LogStore;

    fn put_entry(index: u64) -> LogEntry {
        let req = Request {
            id: RequestId { member: 0xab, seq: index },
            principal: Principal::Internal,
            op: Operation::Put(PutRequest {
                key: b"k".to_vec(),
                value: b"v".to_vec(),
                ..Default::default()
            }),
        };
        LogEntry::new(index, 1, EntryPayload::Command(req.encode().unwrap()))
    }

    #[test]
    fn wal_report_counts_entries() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = FileLogStore::open(dir.path(), WalOptions::default()).unwrap();
            store
                .append(&[LogEntry::new(1, 1, EntryPayload::Noop), put_entry(2), put_entry(3)])
                .unwrap();
        }

        let report = inspect_wal(dir.path(), true).unwrap();
        let segment = &report["segments"][0];
        assert_eq!(segment["records"], 3);
        assert_eq!(segment["first_index"], 1);
        assert_eq!(segment["last_index"], 3);
        assert_eq!(segment["torn_tail"], false);
        let payload = segment["entries"][1]["payload"].as_str().unwrap();
        assert!(payload.starts_with("put"), "{}", payload);
    }

    #[test]
    fn wal_report_fails_on_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(inspect_wal(dir.path(), false).is_err());
    }

    #[test]
    fn snapshot_report_reads_newest_in_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path().join("snap"), 2).unwrap();
        let data = StateMachine::new(8).snapshot_data().unwrap();
        for index in [5, 9] {
            store
                .save(&Snapshot {
                    meta: SnapshotMeta {
                        last_index: index,
                        last_term: 2,
                        members: Vec::new(),
                    },
                    data: data.clone(),
                })
                .unwrap();
        }

        let report = inspect_snapshot(dir.path()).unwrap();
        assert_eq!(report["last_index"], 9);
        assert_eq!(report["keys"], 0);
        assert_eq!(report["auth_enabled"], false);
    }

    #[test]
    fn describes_conf_changes() {
        use crate::raft::types::{ConfChange, MemberInfo};
        let entry = LogEntry::new(
            4,
            2,
            EntryPayload::ConfChange(ConfChange {
                change_id: 1,
                kind: ConfChangeKind::AddMember(MemberInfo::new(0x2a, "c", "10.0.0.3:2380")),
            }),
        );
        assert_eq!(describe_entry(&entry), "add member 2a (10.0.0.3:2380)");
    }
}
