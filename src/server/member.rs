//! A running cluster member.
//!
//! [`Member`] ties a Raft sequencer, the apply task and the replicated
//! state machine together and exposes the operations the RPC front-end
//! serves. Writes are proposed as [`Request`]s and resolve when the local
//! apply task applies them. Reads either go through a read-index barrier
//! (linearizable) or are served from local state (serializable).

use super::apply::Applier;
use super::retry::{with_retry, RetryPolicy};
use super::wait::WaitRegistry;
use crate::core::config::Config;
use crate::core::error::{TesseraError, TesseraResult, UnavailableReason};
use crate::core::time::{Clock, WallClock};
use crate::kv::auth::{generate_token, PasswordHash, Permission};
use crate::kv::{
    ApplyOutcome, AuthOp, AuthOpResponse, DeleteRangeRequest, DeleteRangeResponse, LeaseTimeToLive,
    OpResponse, Operation, Principal, PutRequest, PutResponse, RangeRequest, RangeResponse,
    Request, RequestId, Response, StateMachine, Subscription, TxnRequest, TxnResponse, WatchHub,
    WatchId, WatchRequest,
};
use crate::raft::node::{self, NodeOptions};
use crate::raft::{
    ConfChange, ConfChangeKind, EntryPayload, MemberInfo, Membership, Message, NodeId,
    RaftConfig, RaftCore, RaftHandle, Role, Transport,
};
use crate::storage::{FileLogStore, LogStore, MemoryLogStore, WalOptions};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Everything needed to start a member.
#[derive(Debug, Clone)]
pub struct MemberOptions {
    pub id: NodeId,
    pub cluster_id: u64,
    pub name: String,
    /// `None` keeps the log in memory.
    pub data_dir: Option<PathBuf>,
    pub initial_members: Vec<MemberInfo>,
    pub raft: RaftConfig,
    pub node: NodeOptions,
    pub wal: WalOptions,
    /// Applied entries between snapshots; 0 disables snapshots.
    pub snapshot_interval: u64,
    pub watch_queue: usize,
    pub lease_tick: Duration,
    pub max_lease_ttl: i64,
    /// Revisions kept by auto-compaction; 0 disables it.
    pub compaction_retention: i64,
    pub compaction_interval: Duration,
    pub dedup_capacity: usize,
    pub token_ttl: Duration,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    /// Seed for election timeouts; `None` draws from entropy.
    pub seed: Option<u64>,
}

impl MemberOptions {
    pub fn from_config(config: &Config) -> Self {
        let c = &config.cluster;
        Self {
            id: config.member.id,
            cluster_id: config.member.cluster_id,
            name: config.member.name.clone(),
            data_dir: Some(config.member.data_dir.clone()),
            initial_members: config.initial_members(),
            raft: RaftConfig {
                id: config.member.id,
                election_ticks: c.election_ticks,
                heartbeat_ticks: c.heartbeat_ticks,
                max_append_bytes: c.max_append_bytes,
                check_quorum: true,
            },
            node: NodeOptions {
                tick_interval: config.tick_interval(),
                peer_queue: c.peer_queue,
                ..NodeOptions::default()
            },
            wal: WalOptions {
                segment_max_bytes: config.durability.segment_max_bytes,
                fsync: config.durability.fsync,
                snapshots_retained: config.durability.snapshots_retained,
            },
            snapshot_interval: config.durability.snapshot_interval,
            watch_queue: config.kv.watch_queue,
            lease_tick: Duration::from_millis(config.kv.lease_tick_ms),
            max_lease_ttl: config.kv.max_lease_ttl,
            compaction_retention: config.kv.compaction_retention,
            compaction_interval: Duration::from_secs(config.kv.compaction_interval_secs),
            dedup_capacity: config.kv.dedup_capacity,
            token_ttl: Duration::from_secs(config.auth.token_ttl_secs),
            request_timeout: Duration::from_millis(config.rpc.request_timeout_ms),
            retry: RetryPolicy::from_config(&config.rpc),
            seed: None,
        }
    }

    /// Options for a member whose log lives in memory.
    pub fn in_memory(id: NodeId, initial_members: Vec<MemberInfo>) -> Self {
        let mut config = Config::single_member(id, "unused");
        config.cluster.initial_members.clear();
        let mut options = Self::from_config(&config);
        options.data_dir = None;
        options.initial_members = initial_members;
        options
    }
}

/// State shared between the member handle and its apply task.
pub(crate) struct Shared {
    pub(crate) id: NodeId,
    pub(crate) sm: RwLock<StateMachine>,
    pub(crate) hub: WatchHub,
    pub(crate) requests: WaitRegistry<RequestId, ApplyOutcome>,
    pub(crate) conf_changes: WaitRegistry<u64, ()>,
    pub(crate) reads: WaitRegistry<u64, TesseraResult<()>>,
}

/// Result of a lease grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseGrant {
    pub revision: i64,
    pub id: i64,
    pub ttl: i64,
}

/// Point-in-time summary of a member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberStatus {
    pub id: NodeId,
    pub cluster_id: u64,
    pub leader: Option<NodeId>,
    pub role: Role,
    pub raft_term: u64,
    pub raft_index: u64,
    pub applied_index: u64,
    pub revision: i64,
    pub compact_revision: i64,
    pub db_size: i64,
}

/// Background tasks of a started member.
pub struct MemberTasks {
    raft: JoinHandle<TesseraResult<()>>,
    apply: JoinHandle<()>,
    loops: Vec<JoinHandle<()>>,
}

impl MemberTasks {
    /// Wait for the sequencer to stop, then tear down the rest.
    pub async fn join(self) -> TesseraResult<()> {
        let result = match self.raft.await {
            Ok(result) => result,
            Err(e) => Err(TesseraError::internal(format!("raft task panicked: {}", e))),
        };
        for task in self.loops {
            task.abort();
        }
        // The apply channel closes with the sequencer.
        let _ = self.apply.await;
        result
    }
}

/// Cloneable handle to a running member.
#[derive(Clone)]
pub struct Member {
    shared: Arc<Shared>,
    raft: RaftHandle,
    options: Arc<MemberOptions>,
    seq: Arc<AtomicU64>,
    clock: Arc<dyn Clock>,
}

impl Member {
    /// Open storage, recover state and start the member's tasks.
    pub fn start(
        options: MemberOptions,
        transport: Arc<dyn Transport>,
        inbox: mpsc::Receiver<Message>,
        shutdown: watch::Receiver<bool>,
    ) -> TesseraResult<(Self, MemberTasks)> {
        Self::start_with_clock(options, transport, inbox, shutdown, Arc::new(WallClock))
    }

    pub fn start_with_clock(
        options: MemberOptions,
        transport: Arc<dyn Transport>,
        inbox: mpsc::Receiver<Message>,
        shutdown: watch::Receiver<bool>,
        clock: Arc<dyn Clock>,
    ) -> TesseraResult<(Self, MemberTasks)> {
        let store: Box<dyn LogStore> = match &options.data_dir {
            Some(dir) => Box::new(FileLogStore::open(dir, options.wal.clone())?),
            None => Box::new(MemoryLogStore::new()),
        };

        let mut sm = StateMachine::new(options.dedup_capacity);
        if let Some(snapshot) = store.snapshot() {
            sm.restore(&snapshot.data, snapshot.meta.last_index)?;
        }

        let core = RaftCore::new(
            options.raft.clone(),
            store,
            options.initial_members.clone(),
            options.seed,
        )?;
        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        let (raft, raft_task) = node::spawn(
            core,
            transport,
            inbox,
            apply_tx,
            options.node.clone(),
            shutdown.clone(),
        );

        let shared = Arc::new(Shared {
            id: options.id,
            sm: RwLock::new(sm),
            hub: WatchHub::new(options.watch_queue),
            requests: WaitRegistry::new(),
            conf_changes: WaitRegistry::new(),
            reads: WaitRegistry::new(),
        });
        let applier = Applier::new(Arc::clone(&shared), raft.clone(), options.snapshot_interval);
        let apply = tokio::spawn(applier.run(apply_rx));

        // Sequence numbers must not repeat across restarts, or a new request
        // would be answered from the dedup record of an old one.
        let seq_base = u64::from(rand::random::<u32>()) << 32;
        let member = Self {
            shared,
            raft,
            options: Arc::new(options),
            seq: Arc::new(AtomicU64::new(seq_base)),
            clock,
        };

        let mut loops = vec![tokio::spawn(member.clone().tick_loop(shutdown.clone()))];
        if member.options.compaction_retention > 0 {
            loops.push(tokio::spawn(member.clone().compaction_loop(shutdown)));
        }

        tracing::info!(
            member_id = member.id(),
            name = %member.options.name,
            persistent = member.options.data_dir.is_some(),
            "member started"
        );
        Ok((
            member,
            MemberTasks {
                raft: raft_task,
                apply,
                loops,
            },
        ))
    }

    pub fn id(&self) -> NodeId {
        self.shared.id
    }

    pub fn cluster_id(&self) -> u64 {
        self.options.cluster_id
    }

    pub fn raft(&self) -> &RaftHandle {
        &self.raft
    }

    pub fn is_leader(&self) -> bool {
        self.raft.status().role == Role::Leader
    }

    /// Latest applied store revision.
    pub fn current_revision(&self) -> i64 {
        self.shared.sm.read().current_revision()
    }

    pub fn applied_index(&self) -> u64 {
        self.shared.sm.read().applied_index()
    }

    // ---------------------------------------------------------------------
    // Key-value
    // ---------------------------------------------------------------------

    /// Range read. Returns the store revision the read observed.
    pub async fn range(
        &self,
        principal: &Principal,
        req: RangeRequest,
        serializable: bool,
    ) -> TesseraResult<(i64, RangeResponse)> {
        if !serializable {
            self.read_barrier().await?;
        }
        let sm = self.shared.sm.read();
        sm.check_read(principal, &req.key, &req.range_end)?;
        let resp = sm.range(&req)?;
        Ok((sm.current_revision(), resp))
    }

    pub async fn put(&self, principal: &Principal, req: PutRequest) -> TesseraResult<(i64, PutResponse)> {
        let resp = self.write(principal, Operation::Put(req)).await?;
        match resp.op {
            OpResponse::Put(put) => Ok((resp.revision, put)),
            other => Err(unexpected(other)),
        }
    }

    pub async fn delete_range(
        &self,
        principal: &Principal,
        req: DeleteRangeRequest,
    ) -> TesseraResult<(i64, DeleteRangeResponse)> {
        let resp = self.write(principal, Operation::DeleteRange(req)).await?;
        match resp.op {
            OpResponse::DeleteRange(del) => Ok((resp.revision, del)),
            other => Err(unexpected(other)),
        }
    }

    pub async fn txn(&self, principal: &Principal, req: TxnRequest) -> TesseraResult<(i64, TxnResponse)> {
        let resp = self.write(principal, Operation::Txn(req)).await?;
        match resp.op {
            OpResponse::Txn(txn) => Ok((resp.revision, txn)),
            other => Err(unexpected(other)),
        }
    }

    /// Discard history below `revision`.
    pub async fn compact(&self, principal: &Principal, revision: i64) -> TesseraResult<i64> {
        let resp = self.write(principal, Operation::Compact { revision }).await?;
        Ok(resp.revision)
    }

    // ---------------------------------------------------------------------
    // Watch
    // ---------------------------------------------------------------------

    pub fn watch(&self, principal: &Principal, req: WatchRequest) -> TesseraResult<Subscription> {
        let sm = self.shared.sm.read();
        sm.check_read(principal, &req.key, &req.range_end)?;
        self.shared.hub.register(sm.kv(), req)
    }

    pub fn cancel_watch(&self, id: WatchId) -> bool {
        self.shared.hub.cancel(id)
    }

    // ---------------------------------------------------------------------
    // Leases
    // ---------------------------------------------------------------------

    /// Grant a lease; an `id` of 0 lets the cluster pick one.
    pub async fn lease_grant(&self, principal: &Principal, id: i64, ttl: i64) -> TesseraResult<LeaseGrant> {
        if ttl > self.options.max_lease_ttl {
            return Err(TesseraError::invalid_argument(format!(
                "lease TTL {} exceeds the maximum of {}",
                ttl, self.options.max_lease_ttl
            )));
        }
        let resp = self.write(principal, Operation::LeaseGrant { id, ttl }).await?;
        match resp.op {
            OpResponse::LeaseGrant { id, ttl } => Ok(LeaseGrant {
                revision: resp.revision,
                id,
                ttl,
            }),
            other => Err(unexpected(other)),
        }
    }

    pub async fn lease_revoke(&self, principal: &Principal, id: i64) -> TesseraResult<i64> {
        let resp = self.write(principal, Operation::LeaseRevoke { id }).await?;
        Ok(resp.revision)
    }

    /// Renew a lease. Returns the granted TTL.
    pub async fn lease_keep_alive(&self, principal: &Principal, id: i64) -> TesseraResult<i64> {
        let resp = self.write(principal, Operation::LeaseKeepAlive { id }).await?;
        match resp.op {
            OpResponse::LeaseKeepAlive { ttl, .. } => Ok(ttl),
            other => Err(unexpected(other)),
        }
    }

    pub async fn lease_time_to_live(
        &self,
        principal: &Principal,
        id: i64,
        with_keys: bool,
    ) -> TesseraResult<LeaseTimeToLive> {
        self.read_barrier().await?;
        let sm = self.shared.sm.read();
        sm.check_authenticated(principal)?;
        Ok(sm.lease_time_to_live(id, with_keys))
    }

    pub async fn lease_leases(&self, principal: &Principal) -> TesseraResult<Vec<i64>> {
        self.read_barrier().await?;
        let sm = self.shared.sm.read();
        sm.check_authenticated(principal)?;
        Ok(sm.leases().ids())
    }

    // ---------------------------------------------------------------------
    // Authentication
    // ---------------------------------------------------------------------

    /// Resolve request credentials to a principal.
    pub fn principal_for(&self, token: Option<&str>) -> TesseraResult<Principal> {
        let sm = self.shared.sm.read();
        if !sm.auth().is_enabled() {
            return Ok(Principal::Anonymous);
        }
        let token = token.ok_or(TesseraError::AuthenticationRequired)?;
        let user = sm.auth().user_for_token(token, sm.now())?;
        Ok(Principal::User(user))
    }

    /// Check credentials and issue a token.
    pub async fn authenticate(&self, name: &str, password: &str) -> TesseraResult<String> {
        let verified = self.shared.sm.read().auth().check_password(name, password)?;
        let op = AuthOp::IssueToken {
            user: name.to_string(),
            password: verified,
            token: generate_token(),
            issued_ms: self.clock.now().ms,
            ttl_ms: self.options.token_ttl.as_millis() as u64,
        };
        let resp = self.propose(Principal::Internal, Operation::Auth(op)).await?;
        match resp.op {
            OpResponse::Auth(AuthOpResponse::Token(token)) => {
                tracing::debug!(member_id = self.id(), user = name, "token issued");
                Ok(token)
            }
            other => Err(unexpected(other)),
        }
    }

    pub fn auth_status(&self) -> (bool, u64) {
        let sm = self.shared.sm.read();
        (sm.auth().is_enabled(), sm.auth().revision())
    }

    pub async fn auth_enable(&self, principal: &Principal) -> TesseraResult<i64> {
        self.auth_op(principal, AuthOp::Enable).await
    }

    pub async fn auth_disable(&self, principal: &Principal) -> TesseraResult<i64> {
        self.auth_op(principal, AuthOp::Disable).await
    }

    /// Add a user. `None` creates a user that cannot authenticate with a
    /// password.
    pub async fn user_add(&self, principal: &Principal, name: &str, password: Option<&str>) -> TesseraResult<i64> {
        let op = AuthOp::UserAdd {
            name: name.to_string(),
            password: password.map(PasswordHash::generate),
        };
        self.auth_op(principal, op).await
    }

    pub async fn user_delete(&self, principal: &Principal, name: &str) -> TesseraResult<i64> {
        let op = AuthOp::UserDelete {
            name: name.to_string(),
        };
        self.auth_op(principal, op).await
    }

    pub async fn user_change_password(&self, principal: &Principal, name: &str, password: &str) -> TesseraResult<i64> {
        let op = AuthOp::UserChangePassword {
            name: name.to_string(),
            password: PasswordHash::generate(password),
        };
        self.auth_op(principal, op).await
    }

    pub async fn user_grant_role(&self, principal: &Principal, user: &str, role: &str) -> TesseraResult<i64> {
        let op = AuthOp::UserGrantRole {
            user: user.to_string(),
            role: role.to_string(),
        };
        self.auth_op(principal, op).await
    }

    pub async fn user_revoke_role(&self, principal: &Principal, user: &str, role: &str) -> TesseraResult<i64> {
        let op = AuthOp::UserRevokeRole {
            user: user.to_string(),
            role: role.to_string(),
        };
        self.auth_op(principal, op).await
    }

    /// Roles granted to `name`. Users may always look themselves up.
    pub async fn user_get(&self, principal: &Principal, name: &str) -> TesseraResult<Vec<String>> {
        self.read_barrier().await?;
        let sm = self.shared.sm.read();
        if principal.user() != Some(name) {
            sm.require_admin(principal)?;
        }
        Ok(sm.auth().user(name)?.roles.iter().cloned().collect())
    }

    pub async fn user_list(&self, principal: &Principal) -> TesseraResult<Vec<String>> {
        self.read_barrier().await?;
        let sm = self.shared.sm.read();
        sm.require_admin(principal)?;
        Ok(sm.auth().user_names())
    }

    pub async fn role_add(&self, principal: &Principal, name: &str) -> TesseraResult<i64> {
        let op = AuthOp::RoleAdd {
            name: name.to_string(),
        };
        self.auth_op(principal, op).await
    }

    pub async fn role_delete(&self, principal: &Principal, name: &str) -> TesseraResult<i64> {
        let op = AuthOp::RoleDelete {
            name: name.to_string(),
        };
        self.auth_op(principal, op).await
    }

    pub async fn role_grant_permission(
        &self,
        principal: &Principal,
        name: &str,
        permission: Permission,
    ) -> TesseraResult<i64> {
        let op = AuthOp::RoleGrantPermission {
            name: name.to_string(),
            permission,
        };
        self.auth_op(principal, op).await
    }

    pub async fn role_revoke_permission(
        &self,
        principal: &Principal,
        name: &str,
        key: &[u8],
        range_end: &[u8],
    ) -> TesseraResult<i64> {
        let op = AuthOp::RoleRevokePermission {
            name: name.to_string(),
            key: key.to_vec(),
            range_end: range_end.to_vec(),
        };
        self.auth_op(principal, op).await
    }

    pub async fn role_get(&self, principal: &Principal, name: &str) -> TesseraResult<Vec<Permission>> {
        self.read_barrier().await?;
        let sm = self.shared.sm.read();
        sm.require_admin(principal)?;
        Ok(sm.auth().role(name)?.permissions.clone())
    }

    pub async fn role_list(&self, principal: &Principal) -> TesseraResult<Vec<String>> {
        self.read_barrier().await?;
        let sm = self.shared.sm.read();
        sm.require_admin(principal)?;
        Ok(sm.auth().role_names())
    }

    async fn auth_op(&self, principal: &Principal, op: AuthOp) -> TesseraResult<i64> {
        let resp = self.write(principal, Operation::Auth(op)).await?;
        Ok(resp.revision)
    }

    // ---------------------------------------------------------------------
    // Cluster membership
    // ---------------------------------------------------------------------

    pub fn member_list(&self) -> Vec<MemberInfo> {
        self.raft.status().members
    }

    /// Add a member with a freshly chosen id.
    pub async fn member_add(
        &self,
        principal: &Principal,
        name: &str,
        peer_addr: &str,
        client_addr: &str,
    ) -> TesseraResult<MemberInfo> {
        let members = self.member_list();
        let id = loop {
            let candidate = rand::random::<u64>() >> 1;
            if candidate != 0 && members.iter().all(|m| m.id != candidate) {
                break candidate;
            }
        };
        let info = MemberInfo::new(id, name, peer_addr).with_client_addr(client_addr);
        self.conf_change(principal, ConfChangeKind::AddMember(info.clone()))
            .await?;
        Ok(info)
    }

    pub async fn member_remove(&self, principal: &Principal, id: NodeId) -> TesseraResult<()> {
        self.conf_change(principal, ConfChangeKind::RemoveMember(id))
            .await
    }

    pub async fn member_update(
        &self,
        principal: &Principal,
        id: NodeId,
        peer_addr: &str,
    ) -> TesseraResult<()> {
        let current = self
            .member_list()
            .into_iter()
            .find(|m| m.id == id)
            .ok_or(TesseraError::MemberNotFound { member_id: id })?;
        let updated = MemberInfo {
            peer_addr: peer_addr.to_string(),
            ..current
        };
        self.conf_change(principal, ConfChangeKind::UpdateMember(updated))
            .await
    }

    async fn conf_change(&self, principal: &Principal, kind: ConfChangeKind) -> TesseraResult<()> {
        self.shared.sm.read().require_admin(principal)?;
        Membership::new(self.member_list()).validate(&kind)?;
        let change = ConfChange {
            change_id: self.next_seq(),
            kind,
        };
        tracing::info!(member_id = self.id(), change = ?change.kind, "proposing membership change");
        let this = self;
        let change = &change;
        with_retry(&self.options.retry, "conf_change", move || this.conf_change_once(change.clone()))
            .await
    }

    async fn conf_change_once(&self, change: ConfChange) -> TesseraResult<()> {
        let change_id = change.change_id;
        let rx = self.shared.conf_changes.register(change_id);
        if let Err(e) = self.raft.propose(EntryPayload::ConfChange(change)).await {
            self.shared.conf_changes.cancel(&change_id);
            return Err(e);
        }
        self.await_applied(rx, || self.shared.conf_changes.cancel(&change_id))
            .await
    }

    // ---------------------------------------------------------------------
    // Maintenance
    // ---------------------------------------------------------------------

    pub fn status(&self) -> MemberStatus {
        let raft = self.raft.status();
        let sm = self.shared.sm.read();
        MemberStatus {
            id: self.id(),
            cluster_id: self.options.cluster_id,
            leader: raft.leader_id,
            role: raft.role,
            raft_term: raft.term,
            raft_index: raft.commit_index,
            applied_index: sm.applied_index(),
            revision: sm.current_revision(),
            compact_revision: sm.kv().compact_revision(),
            db_size: sm.kv().approx_size() as i64,
        }
    }

    /// Hash of the store at `revision` (0 for current), with the current
    /// revision and the compaction floor.
    pub fn hash_kv(&self, revision: i64) -> TesseraResult<(u32, i64, i64)> {
        let sm = self.shared.sm.read();
        let hash = sm.hash_kv(revision)?;
        Ok((hash, sm.current_revision(), sm.kv().compact_revision()))
    }

    // ---------------------------------------------------------------------
    // Proposal plumbing
    // ---------------------------------------------------------------------

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Authorize against local state, then propose. The check is repeated
    /// at apply time against the replicated auth store.
    async fn write(&self, principal: &Principal, op: Operation) -> TesseraResult<Response> {
        self.shared.sm.read().authorize(principal, &op)?;
        self.propose(principal.clone(), op).await
    }

    /// Propose a request and wait for its outcome, retrying transient
    /// failures under the same request id.
    async fn propose(&self, principal: Principal, op: Operation) -> TesseraResult<Response> {
        let id = RequestId {
            member: self.id(),
            seq: self.next_seq(),
        };
        let name = op.name();
        let data = Request { id, principal, op }.encode()?;
        let this = self;
        let data = &data;
        with_retry(&self.options.retry, name, move || this.propose_once(id, data.clone())).await?
    }

    async fn propose_once(&self, id: RequestId, data: Vec<u8>) -> TesseraResult<ApplyOutcome> {
        let rx = self.shared.requests.register(id);
        if let Err(e) = self.raft.propose(EntryPayload::Command(data)).await {
            self.shared.requests.cancel(&id);
            return Err(e);
        }
        self.await_applied(rx, || self.shared.requests.cancel(&id))
            .await
    }

    /// Propose without waiting for the outcome.
    async fn propose_detached(&self, op: Operation) -> TesseraResult<()> {
        let request = Request {
            id: RequestId {
                member: self.id(),
                seq: self.next_seq(),
            },
            principal: Principal::Internal,
            op,
        };
        self.raft
            .propose(EntryPayload::Command(request.encode()?))
            .await
            .map(|_| ())
    }

    /// Wait for a confirmed read point and for the apply index to reach it.
    async fn read_barrier(&self) -> TesseraResult<()> {
        let this = self;
        with_retry(&self.options.retry, "read_index", move || this.read_barrier_once()).await
    }

    async fn read_barrier_once(&self) -> TesseraResult<()> {
        let ctx = self.next_seq();
        let rx = self.shared.reads.register(ctx);
        if let Err(e) = self.raft.read_index(ctx).await {
            self.shared.reads.cancel(&ctx);
            return Err(e);
        }
        self.await_applied(rx, || self.shared.reads.cancel(&ctx))
            .await?
    }

    async fn await_applied<T>(&self, rx: oneshot::Receiver<T>, cancel: impl FnOnce()) -> TesseraResult<T> {
        match tokio::time::timeout(self.options.request_timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(TesseraError::unavailable(UnavailableReason::ProposalDropped)),
            Err(_) => {
                cancel();
                Err(TesseraError::unavailable(UnavailableReason::Timeout))
            }
        }
    }

    // ---------------------------------------------------------------------
    // Leader duties
    // ---------------------------------------------------------------------

    /// Commit wall-clock time while leader. The first tick of a term
    /// promotes leases past the leaderless gap.
    async fn tick_loop(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.options.lease_tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut ticked_term: Option<u64> = None;
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            let status = self.raft.status();
            if status.role != Role::Leader {
                ticked_term = None;
                continue;
            }
            let promote = ticked_term != Some(status.term);
            let op = Operation::Tick {
                now_ms: self.clock.now().ms,
                promote,
            };
            match self.propose_detached(op).await {
                Ok(()) => {
                    if promote {
                        tracing::debug!(member_id = self.id(), term = status.term, "promoting leases");
                    }
                    ticked_term = Some(status.term);
                }
                Err(e) => tracing::debug!(member_id = self.id(), error = %e, "tick proposal failed"),
            }
        }
    }

    /// Keep at most `compaction_retention` revisions of history.
    async fn compaction_loop(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.options.compaction_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            if !self.is_leader() {
                continue;
            }
            let (current, floor) = {
                let sm = self.shared.sm.read();
                (sm.current_revision(), sm.kv().compact_revision())
            };
            let target = current - self.options.compaction_retention;
            if target <= floor {
                continue;
            }
            match self
                .propose(Principal::Internal, Operation::Compact { revision: target })
                .await
            {
                Ok(_) => tracing::info!(member_id = self.id(), revision = target, "auto-compacted"),
                Err(e) => tracing::warn!(member_id = self.id(), revision = target, error = %e, "auto-compaction failed"),
            }
        }
    }
}

fn unexpected(op: OpResponse) -> TesseraError {
    TesseraError::internal(format!("unexpected response {:?}", op))
}
