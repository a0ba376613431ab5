//! The sequencer task that owns a [`RaftCore`].
//!
//! All consensus state lives on one tokio task. Clock ticks, peer messages
//! and local requests are serialised through a `select!` loop; after every
//! input the loop drains the core's [`Ready`](super::core::Ready), hands
//! committed entries to the apply channel and queues outbound messages on
//! per-peer send loops.

use super::core::{ProposeOutcome, RaftCore, RaftStatus};
use super::message::{Message, ReadState};
use super::transport::Transport;
use super::types::{EntryPayload, LogEntry, MemberInfo, NodeId, Snapshot};
use crate::core::error::{TesseraError, TesseraResult, UnavailableReason};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Runtime knobs for the sequencer.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub tick_interval: Duration,
    /// Outbound queue depth per peer. Messages beyond it are dropped.
    pub peer_queue: usize,
    /// Local request queue depth.
    pub input_queue: usize,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            peer_queue: 256,
            input_queue: 1024,
        }
    }
}

/// Work handed to the state machine, in log order.
#[derive(Debug)]
pub enum ApplyMsg {
    /// Replace the state machine with this snapshot.
    Snapshot(Snapshot),
    Entries(Vec<LogEntry>),
    /// A confirmed read point (`index == 0` means the read failed).
    Read(ReadState),
}

enum Input {
    Propose {
        payload: EntryPayload,
        reply: oneshot::Sender<TesseraResult<ProposeOutcome>>,
    },
    ReadIndex {
        ctx: u64,
    },
    Compact {
        index: u64,
        data: Vec<u8>,
        reply: oneshot::Sender<TesseraResult<()>>,
    },
    Campaign,
}

/// Cloneable handle for talking to a running sequencer.
#[derive(Clone)]
pub struct RaftHandle {
    id: NodeId,
    inputs: mpsc::Sender<Input>,
    status: watch::Receiver<RaftStatus>,
}

impl RaftHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Propose a payload. Resolves once the leader has appended it (or the
    /// proposal was forwarded), not when it commits.
    pub async fn propose(&self, payload: EntryPayload) -> TesseraResult<ProposeOutcome> {
        let (reply, rx) = oneshot::channel();
        self.submit(Input::Propose { payload, reply }).await?;
        rx.await
            .map_err(|_| TesseraError::unavailable(UnavailableReason::Stopped))?
    }

    /// Ask for a read index; the answer arrives on the apply channel.
    pub async fn read_index(&self, ctx: u64) -> TesseraResult<()> {
        self.submit(Input::ReadIndex { ctx }).await
    }

    /// Snapshot at `index` with the given state machine image.
    pub async fn compact(&self, index: u64, data: Vec<u8>) -> TesseraResult<()> {
        let (reply, rx) = oneshot::channel();
        self.submit(Input::Compact { index, data, reply }).await?;
        rx.await
            .map_err(|_| TesseraError::unavailable(UnavailableReason::Stopped))?
    }

    /// Start an election now instead of waiting for the timeout.
    pub async fn campaign(&self) -> TesseraResult<()> {
        self.submit(Input::Campaign).await
    }

    pub fn status(&self) -> RaftStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RaftStatus> {
        self.status.clone()
    }

    async fn submit(&self, input: Input) -> TesseraResult<()> {
        self.inputs
            .send(input)
            .await
            .map_err(|_| TesseraError::unavailable(UnavailableReason::Stopped))
    }
}

/// Spawn the sequencer. The returned task resolves when `shutdown` fires or
/// the core hits a storage error.
pub fn spawn(
    core: RaftCore,
    transport: Arc<dyn Transport>,
    inbox: mpsc::Receiver<Message>,
    apply_tx: mpsc::UnboundedSender<ApplyMsg>,
    options: NodeOptions,
    shutdown: watch::Receiver<bool>,
) -> (RaftHandle, JoinHandle<TesseraResult<()>>) {
    let id = core.id();
    let (inputs_tx, inputs_rx) = mpsc::channel(options.input_queue);
    let (status_tx, status_rx) = watch::channel(core.status());

    let sequencer = Sequencer {
        core,
        transport,
        peers: HashMap::new(),
        apply_tx,
        status_tx,
        options,
    };
    let task = tokio::spawn(sequencer.run(inputs_rx, inbox, shutdown));
    (
        RaftHandle {
            id,
            inputs: inputs_tx,
            status: status_rx,
        },
        task,
    )
}

struct Sequencer {
    core: RaftCore,
    transport: Arc<dyn Transport>,
    peers: HashMap<NodeId, PeerSender>,
    apply_tx: mpsc::UnboundedSender<ApplyMsg>,
    status_tx: watch::Sender<RaftStatus>,
    options: NodeOptions,
}

/// Only every this many consecutive drops to one peer is logged.
const DROP_LOG_EVERY: u64 = 64;

struct PeerSender {
    queue: mpsc::Sender<Message>,
    task: JoinHandle<()>,
    /// Messages dropped since the last one that was queued.
    dropped: u64,
}

impl PeerSender {
    /// Count a message dropped on a full queue. The first drop of a run is
    /// logged, then every `DROP_LOG_EVERY`th.
    fn note_dropped(&mut self, member_id: NodeId, peer: NodeId, kind: &'static str) {
        if self.dropped % DROP_LOG_EVERY == 0 {
            tracing::warn!(
                member_id,
                peer,
                kind,
                dropped = self.dropped + 1,
                "peer queue full, dropping message"
            );
        }
        self.dropped += 1;
    }
}

impl Sequencer {
    async fn run(
        mut self,
        mut inputs: mpsc::Receiver<Input>,
        mut inbox: mpsc::Receiver<Message>,
        mut shutdown: watch::Receiver<bool>,
    ) -> TesseraResult<()> {
        let mut ticker = tokio::time::interval(self.options.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        self.sync_peers();

        tracing::info!(member_id = self.core.id(), "raft sequencer started");

        let result = loop {
            let step = tokio::select! {
                _ = ticker.tick() => self.core.tick(),
                Some(input) = inputs.recv() => self.handle_input(input),
                Some(msg) = inbox.recv() => self.core.step(msg),
                _ = shutdown.changed() => break Ok(()),
            };
            if let Err(e) = step {
                break Err(e);
            }
            if let Err(e) = self.drain() {
                break Err(e);
            }
        };

        match &result {
            Ok(()) => tracing::info!(member_id = self.core.id(), "raft sequencer stopped"),
            Err(e) => tracing::error!(member_id = self.core.id(), error = %e, "raft sequencer failed"),
        }
        for (_, peer) in self.peers.drain() {
            peer.task.abort();
        }
        result
    }

    fn handle_input(&mut self, input: Input) -> TesseraResult<()> {
        match input {
            Input::Propose { payload, reply } => {
                let outcome = self.core.propose(payload);
                // Storage failures are fatal to the sequencer as well.
                let fatal = match &outcome {
                    Err(e @ TesseraError::Storage { .. }) => Some(e.clone()),
                    _ => None,
                };
                let _ = reply.send(outcome);
                fatal.map_or(Ok(()), Err)
            }
            Input::ReadIndex { ctx } => self.core.read_index(ctx),
            Input::Compact { index, data, reply } => {
                let result = self.core.compact(index, data);
                let _ = reply.send(result.clone());
                match result {
                    Err(e @ TesseraError::Storage { .. }) => Err(e),
                    _ => Ok(()),
                }
            }
            Input::Campaign => self.core.campaign(),
        }
    }

    fn drain(&mut self) -> TesseraResult<()> {
        let rd = self.core.ready()?;

        for msg in rd.messages {
            self.dispatch(msg);
        }
        if let Some(snapshot) = rd.snapshot {
            self.deliver(ApplyMsg::Snapshot(snapshot))?;
        }
        if !rd.committed.is_empty() {
            self.deliver(ApplyMsg::Entries(rd.committed))?;
        }
        for read in rd.read_states {
            self.deliver(ApplyMsg::Read(read))?;
        }

        let status = self.core.status();
        let members_changed = self.status_tx.borrow().members != status.members;
        self.status_tx.send_if_modified(|current| {
            if *current != status {
                *current = status;
                true
            } else {
                false
            }
        });
        if members_changed {
            self.sync_peers();
        }
        Ok(())
    }

    fn deliver(&self, msg: ApplyMsg) -> TesseraResult<()> {
        self.apply_tx
            .send(msg)
            .map_err(|_| TesseraError::unavailable(UnavailableReason::Stopped))
    }

    fn dispatch(&mut self, msg: Message) {
        let to = msg.to;
        let me = self.core.id();
        if !self.peers.contains_key(&to) {
            let peer = self.spawn_peer(to);
            self.peers.insert(to, peer);
        }
        let Some(peer) = self.peers.get_mut(&to) else {
            return;
        };
        match peer.queue.try_send(msg) {
            Ok(()) => peer.dropped = 0,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                peer.note_dropped(me, to, msg.body.kind())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    fn spawn_peer(&self, peer: NodeId) -> PeerSender {
        let (queue, mut rx) = mpsc::channel::<Message>(self.options.peer_queue);
        let transport = Arc::clone(&self.transport);
        let me = self.core.id();
        let task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let kind = msg.body.kind();
                if let Err(e) = transport.send(msg).await {
                    tracing::debug!(member_id = me, peer, kind, error = %e, "send failed");
                }
            }
        });
        PeerSender {
            queue,
            task,
            dropped: 0,
        }
    }

    /// Align transport addresses and send loops with the current membership.
    fn sync_peers(&mut self) {
        let members: Vec<MemberInfo> = self.core.membership().to_vec();
        for member in &members {
            if member.id != self.core.id() {
                self.transport.update_peer(member);
            }
        }
        let stale: Vec<NodeId> = self
            .peers
            .keys()
            .copied()
            .filter(|id| !self.core.membership().contains(*id))
            .collect();
        for id in stale {
            if let Some(peer) = self.peers.remove(&id) {
                peer.task.abort();
            }
            self.transport.remove_peer(id);
        }
    }
}
