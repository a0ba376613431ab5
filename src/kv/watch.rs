//! Watch dispatcher.
//!
//! Observers subscribe to a key range from a start revision. Registration
//! replays retained history and joins the live stream in one step; callers
//! hold the state machine read lock across [`WatchHub::register`] while the
//! apply task holds the write lock across [`WatchHub::dispatch`], so no
//! revision is both replayed and dispatched, and none is missed.
//!
//! Each observer owns a bounded queue. Dispatch never blocks: an observer
//! whose queue is full is disconnected, which its stream reports as a
//! cancellation.

use super::mvcc::{in_range, KvStore};
use super::request::{Event, EventKind};
use crate::core::error::TesseraResult;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc;

pub type WatchId = i64;

bitflags::bitflags! {
    /// Event filters for a watch.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct WatchFilters: u32 {
        /// Drop put events.
        const NOPUT = 0b0000_0001;
        /// Drop delete events.
        const NODELETE = 0b0000_0010;
    }
}

impl WatchFilters {
    fn admits(self, event: &Event) -> bool {
        match event.kind {
            EventKind::Put => !self.contains(WatchFilters::NOPUT),
            EventKind::Delete => !self.contains(WatchFilters::NODELETE),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchRequest {
    pub key: Vec<u8>,
    pub range_end: Vec<u8>,
    /// First revision to deliver; 0 means the next revision.
    pub start_revision: i64,
    pub filters: WatchFilters,
    pub prev_kv: bool,
}

impl WatchRequest {
    pub fn key(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            ..Self::default()
        }
    }

    pub fn range(key: impl Into<Vec<u8>>, range_end: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            range_end: range_end.into(),
            ..Self::default()
        }
    }

    pub fn from_revision(mut self, revision: i64) -> Self {
        self.start_revision = revision;
        self
    }
}

/// Something delivered to an observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchNotice {
    /// Matching events of one revision, in the order they were applied.
    Events { revision: i64, events: Vec<Event> },
    /// The start revision was compacted away. Nothing follows.
    Compacted { compact_revision: i64 },
}

/// The receiving end of a registered watch.
#[derive(Debug)]
pub struct Subscription {
    pub id: WatchId,
    /// Store revision at registration.
    pub revision: i64,
    pub notices: mpsc::Receiver<WatchNotice>,
}

struct Selector {
    key: Vec<u8>,
    range_end: Vec<u8>,
    filters: WatchFilters,
    prev_kv: bool,
}

impl Selector {
    fn select(&self, events: &[Event]) -> Vec<Event> {
        events
            .iter()
            .filter(|e| in_range(&e.kv.key, &self.key, &self.range_end))
            .filter(|e| self.filters.admits(e))
            .map(|e| {
                let mut e = e.clone();
                if !self.prev_kv {
                    e.prev_kv = None;
                }
                e
            })
            .collect()
    }
}

struct Watcher {
    selector: Selector,
    /// Revisions below this were either replayed or never requested.
    min_revision: i64,
    tx: mpsc::Sender<WatchNotice>,
}

#[derive(Default)]
struct HubInner {
    next_id: WatchId,
    watchers: HashMap<WatchId, Watcher>,
}

/// Registry of live watchers.
pub struct WatchHub {
    /// Queue capacity for live events, per observer.
    queue_capacity: usize,
    inner: Mutex<HubInner>,
}

impl WatchHub {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            queue_capacity: queue_capacity.max(1),
            inner: Mutex::new(HubInner::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().watchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a watch against `kv`. Must be called under the state machine
    /// read lock.
    pub fn register(&self, kv: &KvStore, req: WatchRequest) -> TesseraResult<Subscription> {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        let current = kv.current_revision();

        if req.start_revision > 0 && req.start_revision < kv.compact_revision() {
            let (tx, notices) = mpsc::channel(1);
            let _ = tx.try_send(WatchNotice::Compacted {
                compact_revision: kv.compact_revision(),
            });
            tracing::debug!(
                watch_id = id,
                start_revision = req.start_revision,
                compact_revision = kv.compact_revision(),
                "watch start revision compacted"
            );
            return Ok(Subscription {
                id,
                revision: current,
                notices,
            });
        }

        let selector = Selector {
            key: req.key,
            range_end: req.range_end,
            filters: req.filters,
            prev_kv: req.prev_kv,
        };

        let mut backlog = Vec::new();
        if req.start_revision > 0 && req.start_revision <= current {
            for (revision, events) in kv.changes_since(req.start_revision)? {
                let selected = selector.select(&events);
                if !selected.is_empty() {
                    backlog.push(WatchNotice::Events {
                        revision,
                        events: selected,
                    });
                }
            }
        }

        let (tx, notices) = mpsc::channel(self.queue_capacity + backlog.len());
        for notice in backlog {
            // capacity covers the whole backlog
            if tx.try_send(notice).is_err() {
                break;
            }
        }
        let min_revision = req.start_revision.max(current + 1);
        inner.watchers.insert(
            id,
            Watcher {
                selector,
                min_revision,
                tx,
            },
        );
        tracing::debug!(watch_id = id, start_revision = req.start_revision, "watch registered");

        Ok(Subscription {
            id,
            revision: current,
            notices,
        })
    }

    /// Deliver the events of one applied revision.
    pub fn dispatch(&self, revision: i64, events: &[Event]) {
        if events.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        inner.watchers.retain(|id, watcher| {
            if revision < watcher.min_revision {
                return !watcher.tx.is_closed();
            }
            let selected = watcher.selector.select(events);
            if selected.is_empty() {
                return !watcher.tx.is_closed();
            }
            match watcher.tx.try_send(WatchNotice::Events {
                revision,
                events: selected,
            }) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(watch_id = *id, revision, "watcher queue full, disconnecting");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Stop delivering to a watch. Returns whether it was registered.
    pub fn cancel(&self, id: WatchId) -> bool {
        self.inner.lock().watchers.remove(&id).is_some()
    }

    /// Disconnect every watcher. Used when the store jumps to a snapshot
    /// whose skipped revisions can no longer be replayed.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let n = inner.watchers.len();
        inner.watchers.clear();
        n
    }
}
