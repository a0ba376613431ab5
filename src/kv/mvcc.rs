//! Multi-version key-value store.
//!
//! Each key keeps its history as a list of versions ordered by revision.
//! A deletion appends a tombstone. The store revision advances once per
//! mutating log entry; every write staged for that entry shares the next
//! revision and becomes visible through [`KvStore::finish`].
//!
//! Compaction discards versions that are no longer readable at or after the
//! compaction revision and trims the change log used for watch replay.

use super::request::{Event, KeyValue, RangeRequest, RangeResponse, SortOrder, SortTarget};
use crate::core::error::{TesseraError, TesseraResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::hash::Hasher;
use std::ops::Bound;
use twox_hash::XxHash64;

const HASH_SEED: u64 = 0x7465_7373_6572_6121;

/// Whether `key` falls inside the etcd-style range `[start, end)`.
///
/// An empty `end` selects `start` only; `end == [0]` selects every key at
/// or after `start`.
pub fn in_range(key: &[u8], start: &[u8], end: &[u8]) -> bool {
    if end.is_empty() {
        key == start
    } else if end == [0] {
        key >= start
    } else {
        key >= start && key < end
    }
}

/// The smallest key greater than every key with the given prefix, as used
/// for prefix ranges. Returns `[0]` when no such key exists.
pub fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    vec![0]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Version {
    revision: i64,
    /// `None` marks a tombstone.
    kv: Option<KeyValue>,
}

/// Serialized form of a [`KvStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvSnapshot {
    revision: i64,
    compact_revision: i64,
    keys: Vec<(Vec<u8>, Vec<Version>)>,
}

#[derive(Debug, Clone, Default)]
pub struct KvStore {
    revision: i64,
    compact_revision: i64,
    keys: BTreeMap<Vec<u8>, Vec<Version>>,
    /// Changes by revision, retained from the compaction revision onward.
    changes: BTreeMap<i64, Vec<Event>>,
    /// Events staged by the entry being applied.
    pending: Vec<Event>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_revision(&self) -> i64 {
        self.revision
    }

    pub fn compact_revision(&self) -> i64 {
        self.compact_revision
    }

    /// The revision the entry being applied writes at.
    pub fn next_revision(&self) -> i64 {
        self.revision + 1
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.keys
            .values()
            .filter(|versions| versions.last().is_some_and(|v| v.kv.is_some()))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rough memory footprint of all retained versions.
    pub fn approx_size(&self) -> usize {
        self.keys
            .iter()
            .map(|(key, versions)| {
                versions
                    .iter()
                    .map(|v| key.len() + 16 + v.kv.as_ref().map_or(0, |kv| kv.value.len() + 32))
                    .sum::<usize>()
            })
            .sum()
    }

    /// The latest live version of `key`, including writes staged by the
    /// current entry.
    pub fn latest(&self, key: &[u8]) -> Option<&KeyValue> {
        self.keys
            .get(key)
            .and_then(|versions| versions.last())
            .and_then(|v| v.kv.as_ref())
    }

    fn iter_range<'a>(
        &'a self,
        key: &[u8],
        range_end: &[u8],
    ) -> Box<dyn Iterator<Item = (&'a Vec<u8>, &'a Vec<Version>)> + 'a> {
        if range_end.is_empty() {
            return Box::new(self.keys.get_key_value(key).into_iter());
        }
        if range_end == [0] {
            return Box::new(
                self.keys
                    .range::<[u8], _>((Bound::Included(key), Bound::Unbounded)),
            );
        }
        if key >= range_end {
            return Box::new(std::iter::empty());
        }
        Box::new(
            self.keys
                .range::<[u8], _>((Bound::Included(key), Bound::Excluded(range_end))),
        )
    }

    fn visible(versions: &[Version], revision: i64) -> Option<&KeyValue> {
        versions
            .iter()
            .rev()
            .find(|v| v.revision <= revision)
            .and_then(|v| v.kv.as_ref())
    }

    /// Resolve a requested read revision (`<= 0` means current).
    pub fn check_revision(&self, revision: i64) -> TesseraResult<i64> {
        if revision <= 0 {
            return Ok(self.revision);
        }
        if revision > self.revision {
            return Err(TesseraError::FutureRevision {
                revision,
                current: self.revision,
            });
        }
        if revision < self.compact_revision {
            return Err(TesseraError::RevisionCompacted {
                revision,
                compaction_floor: self.compact_revision,
            });
        }
        Ok(revision)
    }

    pub fn get(&self, key: &[u8], revision: i64) -> TesseraResult<Option<KeyValue>> {
        let at = self.check_revision(revision)?;
        Ok(self
            .keys
            .get(key)
            .and_then(|versions| Self::visible(versions, at))
            .cloned())
    }

    /// Live key-values in `[key, range_end)` at the latest version.
    pub fn live_in_range(&self, key: &[u8], range_end: &[u8]) -> Vec<&KeyValue> {
        self.iter_range(key, range_end)
            .filter_map(|(_, versions)| versions.last().and_then(|v| v.kv.as_ref()))
            .collect()
    }

    pub fn range(&self, req: &RangeRequest) -> TesseraResult<RangeResponse> {
        // Staged writes are visible to reads later in the same transaction.
        let at = if req.revision <= 0 {
            i64::MAX
        } else {
            self.check_revision(req.revision)?
        };

        let mut kvs: Vec<KeyValue> = self
            .iter_range(&req.key, &req.range_end)
            .filter_map(|(_, versions)| Self::visible(versions, at))
            .filter(|kv| {
                (req.min_mod_revision <= 0 || kv.mod_revision >= req.min_mod_revision)
                    && (req.max_mod_revision <= 0 || kv.mod_revision <= req.max_mod_revision)
                    && (req.min_create_revision <= 0
                        || kv.create_revision >= req.min_create_revision)
                    && (req.max_create_revision <= 0
                        || kv.create_revision <= req.max_create_revision)
            })
            .cloned()
            .collect();

        let count = kvs.len() as i64;
        sort_kvs(&mut kvs, req.sort_order, req.sort_target);

        let mut more = false;
        if req.limit > 0 && kvs.len() > req.limit as usize {
            kvs.truncate(req.limit as usize);
            more = true;
        }
        if req.count_only {
            kvs.clear();
        } else if req.keys_only {
            for kv in kvs.iter_mut() {
                kv.value.clear();
            }
        }
        Ok(RangeResponse { kvs, more, count })
    }

    /// Stage a put at `revision`. Returns the previous live version.
    pub fn put(&mut self, revision: i64, key: &[u8], value: Vec<u8>, lease: i64) -> Option<KeyValue> {
        let versions = self.keys.entry(key.to_vec()).or_default();
        let prev = versions.last().and_then(|v| v.kv.clone());
        let (create_revision, version) = match &prev {
            Some(p) => (p.create_revision, p.version + 1),
            None => (revision, 1),
        };
        let kv = KeyValue {
            key: key.to_vec(),
            create_revision,
            mod_revision: revision,
            version,
            value,
            lease,
        };
        if versions.last().is_some_and(|v| v.revision == revision) {
            versions.pop();
        }
        versions.push(Version {
            revision,
            kv: Some(kv.clone()),
        });
        self.pending.push(Event::put(kv, prev.clone()));
        prev
    }

    /// Stage a deletion at `revision`. Returns the deleted version, or
    /// `None` if the key was not live.
    pub fn delete(&mut self, revision: i64, key: &[u8]) -> Option<KeyValue> {
        let versions = self.keys.get_mut(key)?;
        let prev = versions.last().and_then(|v| v.kv.clone())?;
        if versions.last().is_some_and(|v| v.revision == revision) {
            versions.pop();
        }
        versions.push(Version {
            revision,
            kv: None,
        });
        self.pending
            .push(Event::delete(key.to_vec(), revision, Some(prev.clone())));
        Some(prev)
    }

    /// Stage deletion of every live key in `[key, range_end)`.
    pub fn delete_range(&mut self, revision: i64, key: &[u8], range_end: &[u8]) -> Vec<KeyValue> {
        let doomed: Vec<Vec<u8>> = self
            .live_in_range(key, range_end)
            .into_iter()
            .map(|kv| kv.key.clone())
            .collect();
        doomed
            .iter()
            .filter_map(|k| self.delete(revision, k))
            .collect()
    }

    /// Publish staged writes at `revision`. Returns the events produced;
    /// when nothing was staged the store revision does not move.
    pub fn finish(&mut self, revision: i64) -> Vec<Event> {
        let events = std::mem::take(&mut self.pending);
        if !events.is_empty() {
            self.revision = revision;
            self.changes.insert(revision, events.clone());
        }
        events
    }

    /// Discard history older than `revision`.
    pub fn compact(&mut self, revision: i64) -> TesseraResult<()> {
        if revision <= self.compact_revision {
            return Err(TesseraError::RevisionCompacted {
                revision,
                compaction_floor: self.compact_revision,
            });
        }
        if revision > self.revision {
            return Err(TesseraError::FutureRevision {
                revision,
                current: self.revision,
            });
        }
        self.compact_revision = revision;

        let mut removed = 0usize;
        self.keys.retain(|_, versions| {
            // Keep the newest version at or below the floor, unless it is a
            // tombstone, so reads at the floor still see it.
            let keep_from = match versions.iter().rposition(|v| v.revision <= revision) {
                Some(i) if versions[i].kv.is_some() => i,
                Some(i) => i + 1,
                None => 0,
            };
            removed += keep_from;
            versions.drain(..keep_from);
            !versions.is_empty()
        });
        self.changes = self.changes.split_off(&revision);

        tracing::debug!(revision, removed, "compacted key history");
        Ok(())
    }

    /// Changes in revision order from `start` onward.
    pub fn changes_since(&self, start: i64) -> TesseraResult<Vec<(i64, Vec<Event>)>> {
        if start < self.compact_revision {
            return Err(TesseraError::RevisionCompacted {
                revision: start,
                compaction_floor: self.compact_revision,
            });
        }
        Ok(self
            .changes
            .range(start..)
            .map(|(rev, events)| (*rev, events.clone()))
            .collect())
    }

    /// Digest of all versions up to `revision`, identical on every member
    /// that applied the same log.
    pub fn hash(&self, revision: i64) -> TesseraResult<u32> {
        let at = self.check_revision(revision)?;
        let mut hasher = XxHash64::with_seed(HASH_SEED);
        for (key, versions) in &self.keys {
            for v in versions.iter().filter(|v| v.revision <= at) {
                hasher.write(key);
                hasher.write_i64(v.revision);
                match &v.kv {
                    Some(kv) => {
                        hasher.write_u8(1);
                        hasher.write(&kv.value);
                        hasher.write_i64(kv.lease);
                    }
                    None => hasher.write_u8(0),
                }
            }
        }
        hasher.write_i64(self.compact_revision);
        Ok(hasher.finish() as u32)
    }

    pub fn to_snapshot(&self) -> KvSnapshot {
        KvSnapshot {
            revision: self.revision,
            compact_revision: self.compact_revision,
            keys: self
                .keys
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Rebuild a store, including its change log, from a snapshot.
    pub fn from_snapshot(snapshot: KvSnapshot) -> Self {
        let mut changes: BTreeMap<i64, Vec<Event>> = BTreeMap::new();
        for (key, versions) in &snapshot.keys {
            let mut prev: Option<&KeyValue> = None;
            for v in versions {
                if v.revision >= snapshot.compact_revision {
                    let event = match &v.kv {
                        Some(kv) => Event::put(kv.clone(), prev.cloned()),
                        None => Event::delete(key.clone(), v.revision, prev.cloned()),
                    };
                    changes.entry(v.revision).or_default().push(event);
                }
                prev = v.kv.as_ref();
            }
        }
        Self {
            revision: snapshot.revision,
            compact_revision: snapshot.compact_revision,
            keys: snapshot.keys.into_iter().collect(),
            changes,
            pending: Vec::new(),
        }
    }
}

fn sort_kvs(kvs: &mut [KeyValue], order: SortOrder, target: SortTarget) {
    let order = match (order, target) {
        (SortOrder::None, SortTarget::Key) => return,
        (SortOrder::None, _) => SortOrder::Ascend,
        (o, _) => o,
    };
    kvs.sort_by(|a, b| {
        let ord = match target {
            SortTarget::Key => a.key.cmp(&b.key),
            SortTarget::Version => a.version.cmp(&b.version),
            SortTarget::Create => a.create_revision.cmp(&b.create_revision),
            SortTarget::Mod => a.mod_revision.cmp(&b.mod_revision),
            SortTarget::Value => a.value.cmp(&b.value),
        };
        if order == SortOrder::Descend {
            ord.reverse()
        } else {
            ord
        }
    });
}
