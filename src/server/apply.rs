//! The apply task.
//!
//! Consumes [`ApplyMsg`]s from the sequencer in log order and is the only
//! writer of the state machine. For each entry it takes the write lock,
//! applies the entry, dispatches the resulting watch events and releases
//! the lock, then wakes whoever is waiting on the entry.

use super::member::Shared;
use crate::core::error::{TesseraError, TesseraResult, UnavailableReason};
use crate::raft::{ApplyMsg, EntryPayload, LogEntry, RaftHandle, ReadState, Snapshot};
use std::sync::Arc;
use tokio::sync::mpsc;

pub(crate) struct Applier {
    shared: Arc<Shared>,
    raft: RaftHandle,
    /// Entries applied between snapshots; 0 disables snapshotting.
    snapshot_interval: u64,
    last_snapshot: u64,
    /// Confirmed reads waiting for the apply index to catch up.
    pending_reads: Vec<ReadState>,
}

impl Applier {
    pub(crate) fn new(shared: Arc<Shared>, raft: RaftHandle, snapshot_interval: u64) -> Self {
        let last_snapshot = shared.sm.read().applied_index();
        Self {
            shared,
            raft,
            snapshot_interval,
            last_snapshot,
            pending_reads: Vec::new(),
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ApplyMsg>) {
        let member_id = self.shared.id;
        tracing::debug!(member_id, "apply task started");
        while let Some(msg) = rx.recv().await {
            let result = match msg {
                ApplyMsg::Snapshot(snapshot) => self.restore(snapshot),
                ApplyMsg::Entries(entries) => {
                    self.apply_entries(&entries);
                    self.maybe_snapshot().await;
                    Ok(())
                }
                ApplyMsg::Read(read) => {
                    self.on_read(read);
                    Ok(())
                }
            };
            if let Err(err) = result {
                tracing::error!(member_id, error = %err, "apply failed, stopping");
                break;
            }
        }
        self.fail_pending_reads();
        tracing::debug!(member_id, "apply task stopped");
    }

    fn restore(&mut self, snapshot: Snapshot) -> TesseraResult<()> {
        let index = snapshot.meta.last_index;
        let mut sm = self.shared.sm.write();
        if index <= sm.applied_index() {
            return Ok(());
        }
        let previous = sm.current_revision();
        sm.restore(&snapshot.data, index)?;

        // Replay the skipped revisions to live watchers where history allows.
        let kv = sm.kv();
        if kv.current_revision() > previous {
            match kv.changes_since(previous + 1) {
                Ok(changes) => {
                    for (revision, events) in changes {
                        self.shared.hub.dispatch(revision, &events);
                    }
                }
                Err(err) => {
                    let dropped = self.shared.hub.clear();
                    tracing::warn!(
                        member_id = self.shared.id,
                        dropped,
                        error = %err,
                        "snapshot skipped compacted revisions, watchers disconnected"
                    );
                }
            }
        }
        drop(sm);
        self.last_snapshot = index;
        self.resolve_reads(index);
        Ok(())
    }

    fn apply_entries(&mut self, entries: &[LogEntry]) {
        let mut last = 0;
        for entry in entries {
            let applied = {
                let mut sm = self.shared.sm.write();
                let applied = sm.apply_entry(entry);
                for (revision, events) in &applied.events {
                    self.shared.hub.dispatch(*revision, events);
                }
                applied
            };
            if let Some((id, outcome)) = applied.result {
                self.shared.requests.trigger(&id, outcome);
            }
            if let EntryPayload::ConfChange(change) = &entry.payload {
                self.shared.conf_changes.trigger(&change.change_id, ());
            }
            last = entry.index;
        }
        if last > 0 {
            self.resolve_reads(last);
        }
    }

    fn on_read(&mut self, read: ReadState) {
        if read.index == 0 {
            self.shared.reads.trigger(
                &read.ctx,
                Err(TesseraError::unavailable(
                    UnavailableReason::LeadershipUnconfirmed,
                )),
            );
            return;
        }
        let applied = self.shared.sm.read().applied_index();
        if read.index <= applied {
            self.shared.reads.trigger(&read.ctx, Ok(()));
        } else {
            self.pending_reads.push(read);
        }
    }

    fn resolve_reads(&mut self, applied: u64) {
        let shared = &self.shared;
        self.pending_reads.retain(|read| {
            if read.index <= applied {
                shared.reads.trigger(&read.ctx, Ok(()));
                false
            } else {
                true
            }
        });
    }

    fn fail_pending_reads(&mut self) {
        for read in self.pending_reads.drain(..) {
            self.shared.reads.trigger(
                &read.ctx,
                Err(TesseraError::unavailable(UnavailableReason::Stopped)),
            );
        }
    }

    async fn maybe_snapshot(&mut self) {
        if self.snapshot_interval == 0 {
            return;
        }
        let (index, data) = {
            let sm = self.shared.sm.read();
            let index = sm.applied_index();
            if index < self.last_snapshot + self.snapshot_interval {
                return;
            }
            (index, sm.snapshot_data())
        };
        let data = match data {
            Ok(data) => data,
            Err(err) => {
                tracing::warn!(member_id = self.shared.id, index, error = %err, "snapshot encode failed");
                return;
            }
        };
        match self.raft.compact(index, data).await {
            Ok(()) => {
                self.last_snapshot = index;
                tracing::info!(member_id = self.shared.id, index, "snapshot taken");
            }
            Err(err) => {
                tracing::warn!(member_id = self.shared.id, index, error = %err, "snapshot failed");
            }
        }
    }
}
