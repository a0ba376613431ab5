//! Log store behavior shared by the volatile and file-backed stores.

use tessera::raft::{EntryPayload, HardState, LogEntry, MemberInfo, Snapshot, SnapshotMeta};
use tessera::storage::snapshot::{list_snapshots, SnapshotFile};
use tessera::storage::wal::{list_segments, scan_segment, WalRecord};
use tessera::storage::{FileLogStore, LogStore, MemoryLogStore, WalOptions};

fn entry(index: u64, term: u64) -> LogEntry {
    LogEntry::new(index, term, EntryPayload::Command(vec![index as u8; 16]))
}

fn small_segments() -> WalOptions {
    WalOptions {
        segment_max_bytes: 512,
        fsync: false,
        snapshots_retained: 2,
    }
}

fn snapshot_at(index: u64, term: u64) -> Snapshot {
    Snapshot {
        meta: SnapshotMeta {
            last_index: index,
            last_term: term,
            members: vec![MemberInfo::new(1, "a", "local-1")],
        },
        data: format!("image-{}", index).into_bytes(),
    }
}

// ============================================================================
// Behavior every store must share
// ============================================================================

fn check_append_and_conflict(store: &mut dyn LogStore) {
    assert_eq!(store.first_index(), 1);
    assert_eq!(store.last_index(), 0);
    assert_eq!(store.term(0), Some(0));

    store.append(&[entry(1, 1), entry(2, 1), entry(3, 2)]).unwrap();
    assert_eq!(store.last_index(), 3);
    assert_eq!(store.term(3), Some(2));
    assert_eq!(store.term(4), None);

    // Gaps are refused.
    assert!(store.append(&[entry(5, 2)]).is_err());

    // A conflicting suffix is replaced.
    store.truncate_suffix(3).unwrap();
    store.append(&[entry(3, 3), entry(4, 3)]).unwrap();
    assert_eq!(store.term(3), Some(3));
    assert_eq!(store.last_index(), 4);

    let all = store.entries(1, 5, usize::MAX).unwrap();
    assert_eq!(all.iter().map(|e| e.index).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
}

fn check_size_limited_reads(store: &mut dyn LogStore) {
    store
        .append(&(1..=10).map(|i| entry(i, 1)).collect::<Vec<_>>())
        .unwrap();
    let one = store.entries(1, 11, 0).unwrap();
    assert_eq!(one.len(), 1, "at least one entry is always returned");
    let some = store.entries(1, 11, entry(1, 1).approx_size() * 3).unwrap();
    assert!(some.len() >= 1 && some.len() < 10);
    assert!(store.entries(4, 4, usize::MAX).unwrap().is_empty());
}

fn check_snapshot_boundary(store: &mut dyn LogStore) {
    store
        .append(&(1..=8).map(|i| entry(i, 2)).collect::<Vec<_>>())
        .unwrap();
    store.apply_snapshot(snapshot_at(5, 2)).unwrap();
    assert_eq!(store.first_index(), 6);
    assert_eq!(store.last_index(), 8);
    assert_eq!(store.term(5), Some(2));
    assert_eq!(store.term(4), None);
    assert!(store.entries(3, 9, usize::MAX).unwrap().is_empty());
    assert_eq!(store.entries(6, 9, usize::MAX).unwrap().len(), 3);

    // Truncating inside the snapshot is refused.
    assert!(store.truncate_suffix(5).is_err());

    // An older snapshot is ignored.
    store.apply_snapshot(snapshot_at(3, 2)).unwrap();
    assert_eq!(store.snapshot().unwrap().meta.last_index, 5);

    // A snapshot past the log whose term disagrees discards everything.
    store.apply_snapshot(snapshot_at(12, 4)).unwrap();
    assert_eq!(store.first_index(), 13);
    assert_eq!(store.last_index(), 12);
    assert_eq!(store.term(12), Some(4));
    store.append(&[entry(13, 4)]).unwrap();
}

#[test]
fn memory_store_semantics() {
    check_append_and_conflict(&mut MemoryLogStore::new());
    check_size_limited_reads(&mut MemoryLogStore::new());
    check_snapshot_boundary(&mut MemoryLogStore::new());
}

#[test]
fn file_store_semantics() {
    for check in [
        check_append_and_conflict as fn(&mut dyn LogStore),
        check_size_limited_reads,
        check_snapshot_boundary,
    ] {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileLogStore::open(dir.path(), small_segments()).unwrap();
        check(&mut store);
    }
}

// ============================================================================
// Durability
// ============================================================================

#[test]
fn file_store_recovers_everything_it_acknowledged() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut store = FileLogStore::open(dir.path(), small_segments()).unwrap();
        store
            .append(&(1..=20).map(|i| entry(i, 1)).collect::<Vec<_>>())
            .unwrap();
        store.truncate_suffix(15).unwrap();
        store
            .append(&(15..=25).map(|i| entry(i, 2)).collect::<Vec<_>>())
            .unwrap();
        store.apply_snapshot(snapshot_at(10, 1)).unwrap();
        store
            .set_hard_state(HardState {
                term: 2,
                voted_for: Some(3),
                commit: 22,
            })
            .unwrap();
    }

    let store = FileLogStore::open(dir.path(), small_segments()).unwrap();
    assert_eq!(store.first_index(), 11);
    assert_eq!(store.last_index(), 25);
    assert_eq!(store.term(14), Some(1));
    assert_eq!(store.term(15), Some(2));
    assert_eq!(
        store.hard_state(),
        HardState {
            term: 2,
            voted_for: Some(3),
            commit: 22,
        }
    );
    let snap = store.snapshot().unwrap();
    assert_eq!(snap.meta.last_index, 10);
    assert_eq!(snap.meta.members.len(), 1);
}

#[test]
fn segments_hold_framed_records() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut store = FileLogStore::open(dir.path(), small_segments()).unwrap();
        store.append(&[entry(1, 1), entry(2, 1)]).unwrap();
        store.truncate_suffix(2).unwrap();
    }

    let segments = list_segments(&dir.path().join("wal")).unwrap();
    let scan = scan_segment(&segments[0].1).unwrap();
    assert!(!scan.torn);
    assert_eq!(scan.records.len(), 3);
    assert_eq!(scan.records[2], WalRecord::Truncate { from: 2 });
}

#[test]
fn corrupted_tail_is_reported_and_discarded() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut store = FileLogStore::open(dir.path(), small_segments()).unwrap();
        store.append(&[entry(1, 1), entry(2, 1)]).unwrap();
    }
    let (_, path) = list_segments(&dir.path().join("wal")).unwrap().pop().unwrap();
    let mut bytes = std::fs::read(&path).unwrap();
    let len = bytes.len();
    bytes[len - 1] ^= 0xff;
    std::fs::write(&path, &bytes).unwrap();

    let scan = scan_segment(&path).unwrap();
    assert!(scan.torn);
    assert_eq!(scan.records.len(), 1);

    let store = FileLogStore::open(dir.path(), small_segments()).unwrap();
    assert_eq!(store.last_index(), 1);
}

#[test]
fn snapshot_files_are_checksummed_and_pruned() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut store = FileLogStore::open(dir.path(), small_segments()).unwrap();
        store
            .append(&(1..=30).map(|i| entry(i, 1)).collect::<Vec<_>>())
            .unwrap();
        for index in [10, 20, 30] {
            store.apply_snapshot(snapshot_at(index, 1)).unwrap();
        }
    }

    let listed = list_snapshots(&dir.path().join("snap")).unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].index, 30);

    let file = SnapshotFile::read_from(&listed[0].path).unwrap();
    assert_eq!(file.data, b"image-30");
    file.verify().unwrap();

    let mut bytes = std::fs::read(&listed[0].path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;
    std::fs::write(&listed[0].path, &bytes).unwrap();
    assert!(SnapshotFile::read_from(&listed[0].path).is_err());

    // Recovery falls back to the older intact snapshot.
    let store = FileLogStore::open(dir.path(), small_segments()).unwrap();
    assert_eq!(store.snapshot().unwrap().meta.last_index, 20);
}
