//! The Raft state machine.
//!
//! [`RaftCore`] is a deterministic, single-threaded state machine: it is
//! driven by [`RaftCore::tick`], [`RaftCore::step`], [`RaftCore::propose`]
//! and [`RaftCore::read_index`], and its effects are collected with
//! [`RaftCore::ready`]. It performs log and hard-state writes synchronously
//! through its [`LogStore`], so any message it emits is backed by durable
//! state. Networking and application live outside, in the sequencer task.

use super::membership::Membership;
use super::message::{Message, MessageBody, ReadState};
use super::progress::{Progress, ProgressState};
use super::types::{
    ConfChange, EntryPayload, HardState, LogEntry, MemberInfo, NodeId, Role, Snapshot,
    SnapshotMeta,
};
use crate::core::error::{TesseraError, TesseraResult, UnavailableReason};
use crate::storage::LogStore;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet, VecDeque};

/// Static consensus parameters, expressed in logical ticks.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub id: NodeId,
    /// Minimum election timeout; the effective timeout is drawn from
    /// `[election_ticks, 2 * election_ticks)`.
    pub election_ticks: u32,
    pub heartbeat_ticks: u32,
    /// Soft limit on the payload of a single append.
    pub max_append_bytes: usize,
    /// Leaders step down when they lose contact with a majority.
    pub check_quorum: bool,
}

impl RaftConfig {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            election_ticks: 10,
            heartbeat_ticks: 1,
            max_append_bytes: 1024 * 1024,
            check_quorum: true,
        }
    }

    pub fn validate(&self) -> TesseraResult<()> {
        if self.id == 0 {
            return Err(TesseraError::invalid_argument("member id must be non-zero"));
        }
        if self.heartbeat_ticks == 0 || self.election_ticks <= self.heartbeat_ticks {
            return Err(TesseraError::invalid_argument(
                "election_ticks must be greater than heartbeat_ticks",
            ));
        }
        Ok(())
    }
}

/// Result of a local proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposeOutcome {
    /// Appended to the leader's log at `index`.
    Appended { index: u64, term: u64 },
    /// Sent to the current leader.
    Forwarded { leader: NodeId },
}

/// Observable summary of the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftStatus {
    pub id: NodeId,
    pub term: u64,
    pub role: Role,
    pub leader_id: Option<NodeId>,
    pub commit_index: u64,
    pub last_index: u64,
    pub members: Vec<MemberInfo>,
}

/// Effects produced since the previous call to [`RaftCore::ready`].
#[derive(Debug, Default)]
pub struct Ready {
    pub messages: Vec<Message>,
    /// Newly committed entries, in log order.
    pub committed: Vec<LogEntry>,
    /// A snapshot received from the leader that the state machine must load
    /// before applying `committed`.
    pub snapshot: Option<Snapshot>,
    pub read_states: Vec<ReadState>,
}

impl Ready {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
            && self.committed.is_empty()
            && self.snapshot.is_none()
            && self.read_states.is_empty()
    }
}

#[derive(Debug)]
struct PendingRead {
    ctx: u64,
    origin: NodeId,
    index: u64,
    round: u64,
    acks: HashSet<NodeId>,
}

pub struct RaftCore {
    id: NodeId,
    config: RaftConfig,
    store: Box<dyn LogStore>,

    term: u64,
    voted_for: Option<NodeId>,
    commit: u64,
    persisted: HardState,

    role: Role,
    leader_id: Option<NodeId>,
    membership: Membership,
    pending_conf_index: u64,

    progress: HashMap<NodeId, Progress>,
    votes: HashMap<NodeId, bool>,

    election_elapsed: u32,
    heartbeat_elapsed: u32,
    randomized_timeout: u32,

    read_round: u64,
    pending_reads: VecDeque<PendingRead>,

    /// Highest index handed to the application through `ready`.
    handed_off: u64,
    msgs: Vec<Message>,
    read_states: Vec<ReadState>,
    received_snapshot: Option<Snapshot>,

    rng: StdRng,
}

impl RaftCore {
    /// Build a core over `store`. `initial_members` is the bootstrap voter
    /// set, used only when the store holds no snapshot with a membership.
    pub fn new(
        config: RaftConfig,
        store: Box<dyn LogStore>,
        initial_members: Vec<MemberInfo>,
        seed: Option<u64>,
    ) -> TesseraResult<Self> {
        config.validate()?;
        let hs = store.hard_state();
        let snapshot_meta = store.snapshot().map(|s| s.meta).unwrap_or_default();
        let members = if snapshot_meta.members.is_empty() {
            initial_members
        } else {
            snapshot_meta.members.clone()
        };
        let commit = hs
            .commit
            .max(snapshot_meta.last_index)
            .min(store.last_index().max(snapshot_meta.last_index));

        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut core = Self {
            id: config.id,
            store,
            term: hs.term,
            voted_for: hs.voted_for,
            commit: snapshot_meta.last_index,
            persisted: hs,
            role: Role::Follower,
            leader_id: None,
            membership: Membership::new(members),
            pending_conf_index: 0,
            progress: HashMap::new(),
            votes: HashMap::new(),
            election_elapsed: 0,
            heartbeat_elapsed: 0,
            randomized_timeout: config.election_ticks,
            read_round: 0,
            pending_reads: VecDeque::new(),
            handed_off: snapshot_meta.last_index,
            msgs: Vec::new(),
            read_states: Vec::new(),
            received_snapshot: None,
            rng,
            config,
        };
        // Re-derive membership for configuration changes committed after
        // the snapshot.
        core.commit_to(commit)?;
        core.reset_randomized_timeout();

        tracing::info!(
            member_id = core.id,
            term = core.term,
            commit = core.commit,
            last_index = core.store.last_index(),
            members = core.membership.len(),
            "raft core initialised"
        );
        Ok(core)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.leader_id
    }

    pub fn commit_index(&self) -> u64 {
        self.commit
    }

    pub fn last_index(&self) -> u64 {
        self.store.last_index()
    }

    pub fn first_index(&self) -> u64 {
        self.store.first_index()
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn status(&self) -> RaftStatus {
        RaftStatus {
            id: self.id,
            term: self.term,
            role: self.role,
            leader_id: self.leader_id,
            commit_index: self.commit,
            last_index: self.store.last_index(),
            members: self.membership.to_vec(),
        }
    }

    pub fn entries(&self, lo: u64, hi: u64) -> TesseraResult<Vec<LogEntry>> {
        self.store.entries(lo, hi, usize::MAX)
    }

    // ------------------------------------------------------------------
    // Inputs
    // ------------------------------------------------------------------

    /// Advance logical time by one tick.
    pub fn tick(&mut self) -> TesseraResult<()> {
        self.election_elapsed += 1;
        if self.role == Role::Leader {
            self.heartbeat_elapsed += 1;
            if self.election_elapsed >= self.config.election_ticks {
                self.election_elapsed = 0;
                if self.config.check_quorum && !self.quorum_active() {
                    tracing::warn!(
                        member_id = self.id,
                        term = self.term,
                        "lost contact with a majority, stepping down"
                    );
                    let term = self.term;
                    return self.become_follower(term, None);
                }
            }
            if self.heartbeat_elapsed >= self.config.heartbeat_ticks {
                self.heartbeat_elapsed = 0;
                self.broadcast_heartbeat()?;
            }
            return Ok(());
        }
        if self.election_elapsed >= self.randomized_timeout && self.membership.contains(self.id)
        {
            self.campaign()?;
        }
        Ok(())
    }

    /// Start an election immediately.
    pub fn campaign(&mut self) -> TesseraResult<()> {
        if !self.membership.contains(self.id) {
            return Ok(());
        }
        self.term += 1;
        self.voted_for = Some(self.id);
        self.role = Role::Candidate;
        self.leader_id = None;
        self.progress.clear();
        self.votes.clear();
        self.votes.insert(self.id, true);
        self.election_elapsed = 0;
        self.reset_randomized_timeout();
        self.fail_pending_reads();
        self.persist()?;

        tracing::info!(member_id = self.id, term = self.term, "starting election");

        if self.granted_votes() >= self.membership.quorum() {
            return self.become_leader();
        }
        let last_log_index = self.store.last_index();
        let last_log_term = self.last_term();
        let peers: Vec<NodeId> = self.peers().collect();
        for peer in peers {
            self.send(
                peer,
                MessageBody::RequestVote {
                    last_log_index,
                    last_log_term,
                },
            );
        }
        Ok(())
    }

    /// Propose a payload for replication.
    pub fn propose(&mut self, payload: EntryPayload) -> TesseraResult<ProposeOutcome> {
        if self.role == Role::Leader {
            self.check_conf_change(&payload)?;
            let index = self.append_local(vec![payload])?;
            self.broadcast_append()?;
            return Ok(ProposeOutcome::Appended {
                index,
                term: self.term,
            });
        }
        match self.leader_id {
            Some(leader) => {
                self.send(
                    leader,
                    MessageBody::Propose {
                        payloads: vec![payload],
                    },
                );
                Ok(ProposeOutcome::Forwarded { leader })
            }
            None => Err(TesseraError::unavailable(UnavailableReason::NoLeader)),
        }
    }

    /// Request a linearizable read point for `ctx`. The answer arrives as a
    /// [`ReadState`] in a later [`Ready`].
    pub fn read_index(&mut self, ctx: u64) -> TesseraResult<()> {
        if self.role == Role::Leader {
            return self.handle_read_request(ctx, self.id);
        }
        match self.leader_id {
            Some(leader) => self.send(leader, MessageBody::ReadIndex { ctx }),
            None => self.read_states.push(ReadState { ctx, index: 0 }),
        }
        Ok(())
    }

    /// Snapshot the state machine at `index` (which must be committed) and
    /// discard the log prefix it covers.
    pub fn compact(&mut self, index: u64, data: Vec<u8>) -> TesseraResult<()> {
        if index < self.store.first_index() {
            return Ok(());
        }
        if index > self.commit {
            return Err(TesseraError::invalid_argument(format!(
                "cannot snapshot uncommitted index {} (commit {})",
                index, self.commit
            )));
        }
        let last_term = self
            .store
            .term(index)
            .ok_or_else(|| TesseraError::storage(format!("no term for index {}", index)))?;
        let snapshot = Snapshot {
            meta: SnapshotMeta {
                last_index: index,
                last_term,
                members: self.membership.to_vec(),
            },
            data,
        };
        self.store.apply_snapshot(snapshot)?;
        tracing::info!(member_id = self.id, index, "log compacted through snapshot");
        Ok(())
    }

    /// Process one message from a peer (or a forwarded local request).
    pub fn step(&mut self, msg: Message) -> TesseraResult<()> {
        if msg.body.is_local() {
            return self.step_local(msg);
        }

        if msg.term > self.term {
            if matches!(msg.body, MessageBody::RequestVote { .. })
                && self.config.check_quorum
                && self.leader_id.is_some()
                && self.election_elapsed < self.config.election_ticks
            {
                tracing::debug!(
                    member_id = self.id,
                    from = msg.from,
                    "ignoring vote request while leader is active"
                );
                return Ok(());
            }
            let leader = match msg.body {
                MessageBody::AppendEntries { .. } | MessageBody::InstallSnapshot { .. } => {
                    Some(msg.from)
                }
                _ => None,
            };
            tracing::info!(
                member_id = self.id,
                from = msg.from,
                term = msg.term,
                kind = msg.body.kind(),
                "observed higher term"
            );
            self.become_follower(msg.term, leader)?;
        } else if msg.term < self.term {
            match msg.body {
                MessageBody::AppendEntries { .. } | MessageBody::InstallSnapshot { .. } => {
                    self.send(
                        msg.from,
                        MessageBody::AppendEntriesResponse {
                            success: false,
                            index: 0,
                            hint: 0,
                            read_round: 0,
                        },
                    );
                }
                MessageBody::RequestVote { .. } => {
                    self.send(msg.from, MessageBody::RequestVoteResponse { granted: false });
                }
                _ => {}
            }
            return Ok(());
        }

        let from = msg.from;
        match msg.body {
            MessageBody::RequestVote {
                last_log_index,
                last_log_term,
            } => self.handle_vote_request(from, last_log_index, last_log_term),
            MessageBody::RequestVoteResponse { granted } => {
                self.handle_vote_response(from, granted)
            }
            MessageBody::AppendEntries {
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
                read_round,
            } => self.handle_append(
                from,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
                read_round,
            ),
            MessageBody::AppendEntriesResponse {
                success,
                index,
                hint,
                read_round,
            } => self.handle_append_response(from, success, index, hint, read_round),
            MessageBody::InstallSnapshot { snapshot } => self.handle_snapshot(from, snapshot),
            MessageBody::InstallSnapshotResponse { last_index } => {
                self.handle_snapshot_response(from, last_index)
            }
            MessageBody::Propose { .. }
            | MessageBody::ReadIndex { .. }
            | MessageBody::ReadIndexResponse { .. } => Ok(()),
        }
    }

    /// Drain accumulated effects.
    pub fn ready(&mut self) -> TesseraResult<Ready> {
        let mut rd = Ready {
            messages: std::mem::take(&mut self.msgs),
            snapshot: self.received_snapshot.take(),
            read_states: std::mem::take(&mut self.read_states),
            committed: Vec::new(),
        };
        if self.commit > self.handed_off {
            rd.committed = self
                .store
                .entries(self.handed_off + 1, self.commit + 1, usize::MAX)?;
            self.handed_off = self.commit;
        }
        self.persist()?;
        Ok(rd)
    }

    // ------------------------------------------------------------------
    // Role transitions
    // ------------------------------------------------------------------

    fn become_follower(&mut self, term: u64, leader: Option<NodeId>) -> TesseraResult<()> {
        let was = self.role;
        if term > self.term {
            self.term = term;
            self.voted_for = None;
        }
        self.role = Role::Follower;
        self.leader_id = leader;
        self.progress.clear();
        self.votes.clear();
        self.election_elapsed = 0;
        self.reset_randomized_timeout();
        self.fail_pending_reads();
        self.persist()?;
        if was != Role::Follower {
            tracing::info!(member_id = self.id, term = self.term, from = %was, "became follower");
        }
        Ok(())
    }

    fn become_leader(&mut self) -> TesseraResult<()> {
        self.role = Role::Leader;
        self.leader_id = Some(self.id);
        self.election_elapsed = 0;
        self.heartbeat_elapsed = 0;
        self.votes.clear();
        let next = self.store.last_index() + 1;
        self.progress = self
            .peers()
            .map(|id| {
                let mut pr = Progress::new(next);
                pr.recent_active = true;
                (id, pr)
            })
            .collect();
        // Any configuration change still in the log may be uncommitted.
        self.pending_conf_index = self.store.last_index();

        tracing::info!(member_id = self.id, term = self.term, "became leader");

        self.append_local(vec![EntryPayload::Noop])?;
        self.broadcast_append()
    }

    // ------------------------------------------------------------------
    // Handlers
    // ------------------------------------------------------------------

    fn step_local(&mut self, msg: Message) -> TesseraResult<()> {
        match msg.body {
            MessageBody::Propose { payloads } => {
                if self.role == Role::Leader {
                    let mut accepted = Vec::with_capacity(payloads.len());
                    for payload in payloads {
                        match self.check_conf_change(&payload) {
                            Ok(()) => accepted.push(payload),
                            Err(e) => tracing::warn!(
                                member_id = self.id,
                                from = msg.from,
                                error = %e,
                                "dropping forwarded proposal"
                            ),
                        }
                    }
                    if !accepted.is_empty() {
                        self.append_local(accepted)?;
                        self.broadcast_append()?;
                    }
                } else if let Some(leader) = self.leader_id.filter(|l| *l != msg.from) {
                    self.send(leader, MessageBody::Propose { payloads });
                } else {
                    tracing::debug!(
                        member_id = self.id,
                        from = msg.from,
                        "dropping forwarded proposal without leader"
                    );
                }
                Ok(())
            }
            MessageBody::ReadIndex { ctx } => {
                if self.role == Role::Leader {
                    self.handle_read_request(ctx, msg.from)
                } else {
                    self.send(msg.from, MessageBody::ReadIndexResponse { ctx, index: 0 });
                    Ok(())
                }
            }
            MessageBody::ReadIndexResponse { ctx, index } => {
                self.read_states.push(ReadState { ctx, index });
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn handle_vote_request(
        &mut self,
        from: NodeId,
        last_log_index: u64,
        last_log_term: u64,
    ) -> TesseraResult<()> {
        let can_vote = self.voted_for == Some(from)
            || (self.voted_for.is_none() && self.leader_id.is_none());
        let my_last_term = self.last_term();
        let up_to_date = last_log_term > my_last_term
            || (last_log_term == my_last_term && last_log_index >= self.store.last_index());

        let granted = can_vote && up_to_date;
        if granted {
            self.voted_for = Some(from);
            self.election_elapsed = 0;
            self.persist()?;
        }
        tracing::debug!(
            member_id = self.id,
            candidate = from,
            term = self.term,
            granted,
            "vote request"
        );
        self.send(from, MessageBody::RequestVoteResponse { granted });
        Ok(())
    }

    fn handle_vote_response(&mut self, from: NodeId, granted: bool) -> TesseraResult<()> {
        if self.role != Role::Candidate {
            return Ok(());
        }
        self.votes.entry(from).or_insert(granted);
        let quorum = self.membership.quorum();
        if self.granted_votes() >= quorum {
            return self.become_leader();
        }
        let rejected = self.votes.values().filter(|v| !**v).count();
        if rejected >= quorum {
            let term = self.term;
            return self.become_follower(term, None);
        }
        Ok(())
    }

    fn handle_append(
        &mut self,
        from: NodeId,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
        read_round: u64,
    ) -> TesseraResult<()> {
        if self.role == Role::Leader {
            tracing::error!(
                member_id = self.id,
                other = from,
                term = self.term,
                "two leaders in one term; ignoring append"
            );
            return Ok(());
        }
        if self.role == Role::Candidate {
            let term = self.term;
            self.become_follower(term, Some(from))?;
        }
        self.leader_id = Some(from);
        self.election_elapsed = 0;

        let last = self.store.last_index();
        if prev_log_index > last {
            self.send(
                from,
                MessageBody::AppendEntriesResponse {
                    success: false,
                    index: prev_log_index,
                    hint: last,
                    read_round,
                },
            );
            return Ok(());
        }

        let prefix_matches =
            prev_log_index <= self.commit || self.store.term(prev_log_index) == Some(prev_log_term);
        if !prefix_matches {
            let conflict_term = self.store.term(prev_log_index);
            let mut hint = prev_log_index - 1;
            while hint > self.commit && self.store.term(hint) == conflict_term {
                hint -= 1;
            }
            tracing::debug!(
                member_id = self.id,
                prev_log_index,
                prev_log_term,
                hint,
                "rejecting append with mismatched prefix"
            );
            self.send(
                from,
                MessageBody::AppendEntriesResponse {
                    success: false,
                    index: prev_log_index,
                    hint,
                    read_round,
                },
            );
            return Ok(());
        }

        let last_new = prev_log_index + entries.len() as u64;
        let divergence = entries
            .iter()
            .position(|e| e.index > self.commit && self.store.term(e.index) != Some(e.term));
        if let Some(pos) = divergence {
            let first = entries[pos].index;
            if first <= self.store.last_index() {
                tracing::warn!(
                    member_id = self.id,
                    from_index = first,
                    last_index = self.store.last_index(),
                    "truncating conflicting log suffix"
                );
                self.store.truncate_suffix(first)?;
            }
            self.store.append(&entries[pos..])?;
        }

        self.commit_to(leader_commit.min(last_new))?;
        self.send(
            from,
            MessageBody::AppendEntriesResponse {
                success: true,
                index: last_new,
                hint: 0,
                read_round,
            },
        );
        Ok(())
    }

    fn handle_append_response(
        &mut self,
        from: NodeId,
        success: bool,
        index: u64,
        hint: u64,
        read_round: u64,
    ) -> TesseraResult<()> {
        if self.role != Role::Leader {
            return Ok(());
        }
        self.ack_reads(from, read_round);
        let last = self.store.last_index();
        let Some(pr) = self.progress.get_mut(&from) else {
            return Ok(());
        };
        pr.recent_active = true;

        if success {
            let advanced = pr.maybe_update(index);
            if pr.state != ProgressState::Replicate {
                pr.become_replicate();
            }
            let more = pr.next_index <= last;
            if advanced {
                self.maybe_commit()?;
            }
            if more {
                self.send_append(from, false)?;
            }
            return Ok(());
        }

        let retry = match pr.state {
            ProgressState::Snapshot { .. } => {
                pr.become_probe();
                true
            }
            ProgressState::Replicate => {
                let decreased = pr.maybe_decrease(index, hint);
                if decreased {
                    pr.become_probe();
                }
                decreased
            }
            ProgressState::Probe => pr.maybe_decrease(index, hint),
        };
        if retry {
            self.send_append(from, false)?;
        }
        Ok(())
    }

    fn handle_snapshot(&mut self, from: NodeId, snapshot: Snapshot) -> TesseraResult<()> {
        if self.role == Role::Candidate {
            let term = self.term;
            self.become_follower(term, Some(from))?;
        }
        self.leader_id = Some(from);
        self.election_elapsed = 0;

        let last = snapshot.meta.last_index;
        if last <= self.commit {
            self.send(
                from,
                MessageBody::InstallSnapshotResponse {
                    last_index: self.commit,
                },
            );
            return Ok(());
        }

        tracing::info!(
            member_id = self.id,
            leader = from,
            index = last,
            term = snapshot.meta.last_term,
            "installing snapshot from leader"
        );
        self.store.apply_snapshot(snapshot.clone())?;
        if !snapshot.meta.members.is_empty() {
            self.membership = Membership::new(snapshot.meta.members.clone());
        }
        self.commit = last;
        self.handed_off = last;
        self.received_snapshot = Some(snapshot);
        self.persist()?;
        self.send(from, MessageBody::InstallSnapshotResponse { last_index: last });
        Ok(())
    }

    fn handle_snapshot_response(&mut self, from: NodeId, last_index: u64) -> TesseraResult<()> {
        if self.role != Role::Leader {
            return Ok(());
        }
        let Some(pr) = self.progress.get_mut(&from) else {
            return Ok(());
        };
        pr.recent_active = true;
        let advanced = pr.maybe_update(last_index);
        pr.become_replicate();
        if advanced {
            self.maybe_commit()?;
        }
        self.send_append(from, false)
    }

    fn handle_read_request(&mut self, ctx: u64, origin: NodeId) -> TesseraResult<()> {
        // A fresh leader cannot know the true commit index until an entry
        // from its own term commits.
        if self.store.term(self.commit) != Some(self.term) {
            self.respond_read(origin, ctx, 0);
            return Ok(());
        }
        if self.membership.quorum() <= 1 && self.membership.contains(self.id) {
            let index = self.commit;
            self.respond_read(origin, ctx, index);
            return Ok(());
        }
        self.read_round += 1;
        let mut acks = HashSet::new();
        acks.insert(self.id);
        self.pending_reads.push_back(PendingRead {
            ctx,
            origin,
            index: self.commit,
            round: self.read_round,
            acks,
        });
        self.broadcast_heartbeat()
    }

    fn ack_reads(&mut self, from: NodeId, round: u64) {
        if round == 0 {
            return;
        }
        for read in self.pending_reads.iter_mut() {
            if read.round <= round {
                read.acks.insert(from);
            }
        }
        let quorum = self.membership.quorum();
        while self
            .pending_reads
            .front()
            .is_some_and(|r| r.acks.len() >= quorum)
        {
            if let Some(read) = self.pending_reads.pop_front() {
                self.respond_read(read.origin, read.ctx, read.index);
            }
        }
    }

    fn respond_read(&mut self, origin: NodeId, ctx: u64, index: u64) {
        if origin == self.id {
            self.read_states.push(ReadState { ctx, index });
        } else {
            self.send(origin, MessageBody::ReadIndexResponse { ctx, index });
        }
    }

    fn fail_pending_reads(&mut self) {
        while let Some(read) = self.pending_reads.pop_front() {
            self.respond_read(read.origin, read.ctx, 0);
        }
    }

    // ------------------------------------------------------------------
    // Replication
    // ------------------------------------------------------------------

    fn append_local(&mut self, payloads: Vec<EntryPayload>) -> TesseraResult<u64> {
        let mut index = self.store.last_index();
        let mut entries = Vec::with_capacity(payloads.len());
        for payload in payloads {
            index += 1;
            if matches!(payload, EntryPayload::ConfChange(_)) {
                self.pending_conf_index = index;
            }
            entries.push(LogEntry::new(index, self.term, payload));
        }
        self.store.append(&entries)?;
        self.maybe_commit()?;
        Ok(index)
    }

    fn check_conf_change(&self, payload: &EntryPayload) -> TesseraResult<()> {
        if let EntryPayload::ConfChange(cc) = payload {
            if self.pending_conf_index > self.commit {
                return Err(TesseraError::failed_precondition(
                    "a membership change is already in progress",
                ));
            }
            self.membership.validate(&cc.kind)?;
        }
        Ok(())
    }

    fn broadcast_append(&mut self) -> TesseraResult<()> {
        let peers: Vec<NodeId> = self.progress.keys().copied().collect();
        for peer in peers {
            self.send_append(peer, false)?;
        }
        Ok(())
    }

    fn broadcast_heartbeat(&mut self) -> TesseraResult<()> {
        let peers: Vec<NodeId> = self.progress.keys().copied().collect();
        for peer in peers {
            self.send_append(peer, true)?;
        }
        Ok(())
    }

    /// Send the next batch of entries to `to`. Heartbeats are sent even when
    /// the peer is paused.
    fn send_append(&mut self, to: NodeId, heartbeat: bool) -> TesseraResult<()> {
        let Some(pr) = self.progress.get(&to) else {
            return Ok(());
        };
        if !heartbeat && pr.is_paused() {
            return Ok(());
        }
        let state = pr.state;
        let next = pr.next_index;

        if let ProgressState::Snapshot { pending } = state {
            // Keep the follower's election timer quiet while it installs.
            let prev_log_term = self.store.term(pending).unwrap_or(0);
            self.send(
                to,
                MessageBody::AppendEntries {
                    prev_log_index: pending,
                    prev_log_term,
                    entries: Vec::new(),
                    leader_commit: self.commit,
                    read_round: self.read_round,
                },
            );
            return Ok(());
        }

        let prev_log_index = next.saturating_sub(1);
        let prev_log_term = match self.store.term(prev_log_index) {
            Some(term) if next >= self.store.first_index() => term,
            _ => return self.send_snapshot(to),
        };
        let entries = self.store.entries(
            next,
            self.store.last_index() + 1,
            self.config.max_append_bytes,
        )?;
        let last_sent = entries.last().map(|e| e.index);

        if let Some(pr) = self.progress.get_mut(&to) {
            match (pr.state, last_sent) {
                (ProgressState::Replicate, Some(last)) => pr.optimistic_update(last),
                (ProgressState::Probe, _) => pr.paused = true,
                _ => {}
            }
        }
        self.send(
            to,
            MessageBody::AppendEntries {
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: self.commit,
                read_round: self.read_round,
            },
        );
        Ok(())
    }

    fn send_snapshot(&mut self, to: NodeId) -> TesseraResult<()> {
        let Some(snapshot) = self.store.snapshot() else {
            tracing::error!(member_id = self.id, peer = to, "peer needs a snapshot but none exists");
            return Ok(());
        };
        tracing::info!(
            member_id = self.id,
            peer = to,
            index = snapshot.meta.last_index,
            "sending snapshot"
        );
        if let Some(pr) = self.progress.get_mut(&to) {
            pr.become_snapshot(snapshot.meta.last_index);
        }
        self.send(to, MessageBody::InstallSnapshot { snapshot });
        Ok(())
    }

    fn maybe_commit(&mut self) -> TesseraResult<bool> {
        if self.role != Role::Leader || self.membership.is_empty() {
            return Ok(false);
        }
        let last = self.store.last_index();
        let mut matched: Vec<u64> = self
            .membership
            .ids()
            .map(|id| {
                if id == self.id {
                    last
                } else {
                    self.progress.get(&id).map_or(0, |p| p.match_index)
                }
            })
            .collect();
        matched.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = matched[self.membership.quorum() - 1];
        if candidate > self.commit && self.store.term(candidate) == Some(self.term) {
            self.commit_to(candidate)?;
            if self.role == Role::Leader {
                self.broadcast_append()?;
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// Advance the commit index, applying configuration changes as they
    /// commit.
    fn commit_to(&mut self, index: u64) -> TesseraResult<()> {
        if index <= self.commit {
            return Ok(());
        }
        let from = self.commit + 1;
        self.commit = index;
        let newly = self.store.entries(from, index + 1, usize::MAX)?;
        for entry in newly {
            if let EntryPayload::ConfChange(cc) = entry.payload {
                self.apply_conf_change(&cc)?;
            }
        }
        Ok(())
    }

    fn apply_conf_change(&mut self, cc: &ConfChange) -> TesseraResult<()> {
        use super::types::ConfChangeKind;

        self.membership.apply(&cc.kind);
        tracing::info!(
            member_id = self.id,
            change = ?cc.kind,
            members = self.membership.len(),
            "membership change committed"
        );
        if self.role != Role::Leader {
            return Ok(());
        }
        match &cc.kind {
            ConfChangeKind::AddMember(m) if m.id != self.id => {
                let mut pr = Progress::new(self.store.last_index() + 1);
                pr.recent_active = true;
                self.progress.entry(m.id).or_insert(pr);
            }
            ConfChangeKind::RemoveMember(id) => {
                self.progress.remove(id);
                if *id == self.id {
                    // Let the remaining members learn the commit first.
                    self.broadcast_append()?;
                    let term = self.term;
                    return self.become_follower(term, None);
                }
            }
            _ => {}
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn peers(&self) -> impl Iterator<Item = NodeId> + '_ {
        let me = self.id;
        self.membership.ids().filter(move |id| *id != me)
    }

    fn last_term(&self) -> u64 {
        self.store.term(self.store.last_index()).unwrap_or(0)
    }

    fn granted_votes(&self) -> usize {
        self.votes.values().filter(|v| **v).count()
    }

    fn quorum_active(&mut self) -> bool {
        let mut active = usize::from(self.membership.contains(self.id));
        for (id, pr) in self.progress.iter_mut() {
            if self.membership.contains(*id) && pr.recent_active {
                active += 1;
            }
            pr.recent_active = false;
        }
        active >= self.membership.quorum()
    }

    fn reset_randomized_timeout(&mut self) {
        let min = self.config.election_ticks;
        self.randomized_timeout = self.rng.gen_range(min..min * 2);
    }

    fn send(&mut self, to: NodeId, body: MessageBody) {
        self.msgs.push(Message {
            from: self.id,
            to,
            term: self.term,
            body,
        });
    }

    fn persist(&mut self) -> TesseraResult<()> {
        let hs = HardState {
            term: self.term,
            voted_for: self.voted_for,
            commit: self.commit,
        };
        if hs != self.persisted {
            self.store.set_hard_state(hs)?;
            self.persisted = hs;
        }
        Ok(())
    }
}
