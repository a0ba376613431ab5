//! The replicated state machine.
//!
//! Applies committed log entries, in order, to the KV store, the lease
//! table and the auth store. Application is a pure function of the entry
//! and the current state: time only advances through applied `Tick`
//! requests and every authorization decision is re-made here against the
//! replicated auth store.

use super::auth::{AuthOp, AuthOpResponse, AuthStore, PermissionType};
use super::dedup::DedupTable;
use super::lease::{LeaseTable, LeaseTimeToLive};
use super::mvcc::{KvSnapshot, KvStore};
use super::request::{
    ApplyOutcome, Event, OpResponse, Operation, Principal, RangeRequest, RangeResponse, Request,
    RequestId, Response,
};
use super::txn::Writer;
use crate::core::error::{TesseraError, TesseraResult};
use crate::core::time::Tick;
use crate::raft::{EntryPayload, LogEntry};
use serde::{Deserialize, Serialize};

/// Events of one revision.
pub type RevisionEvents = (i64, Vec<Event>);

/// What applying one log entry produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub index: u64,
    /// Set for client commands, `None` for no-ops, membership changes and
    /// undecodable payloads.
    pub result: Option<(RequestId, ApplyOutcome)>,
    /// Events to dispatch to watchers, in revision order.
    pub events: Vec<RevisionEvents>,
}

#[derive(Serialize, Deserialize)]
struct StateSnapshot {
    kv: KvSnapshot,
    leases: LeaseTable,
    auth: AuthStore,
    dedup: DedupTable,
    now: Tick,
}

pub struct StateMachine {
    kv: KvStore,
    leases: LeaseTable,
    auth: AuthStore,
    dedup: DedupTable,
    applied_index: u64,
    /// Deterministic time, advanced by applied ticks.
    now: Tick,
}

impl StateMachine {
    pub fn new(dedup_capacity: usize) -> Self {
        Self {
            kv: KvStore::new(),
            leases: LeaseTable::new(),
            auth: AuthStore::new(),
            dedup: DedupTable::new(dedup_capacity),
            applied_index: 0,
            now: Tick::zero(),
        }
    }

    pub fn applied_index(&self) -> u64 {
        self.applied_index
    }

    pub fn now(&self) -> Tick {
        self.now
    }

    pub fn kv(&self) -> &KvStore {
        &self.kv
    }

    pub fn leases(&self) -> &LeaseTable {
        &self.leases
    }

    pub fn auth(&self) -> &AuthStore {
        &self.auth
    }

    pub fn current_revision(&self) -> i64 {
        self.kv.current_revision()
    }

    pub fn range(&self, req: &RangeRequest) -> TesseraResult<RangeResponse> {
        self.kv.range(req)
    }

    pub fn lease_time_to_live(&self, id: i64, with_keys: bool) -> LeaseTimeToLive {
        self.leases.time_to_live(id, self.now, with_keys)
    }

    pub fn hash_kv(&self, revision: i64) -> TesseraResult<u32> {
        self.kv.hash(revision)
    }

    /// Check that `principal` may read `[key, range_end)`.
    pub fn check_read(
        &self,
        principal: &Principal,
        key: &[u8],
        range_end: &[u8],
    ) -> TesseraResult<()> {
        match self.effective_user(principal)? {
            Some(user) => self
                .auth
                .check_range(user, key, range_end, PermissionType::Read),
            None => Ok(()),
        }
    }

    /// Check that `principal` may run `op`.
    pub fn authorize(&self, principal: &Principal, op: &Operation) -> TesseraResult<()> {
        let user = match self.effective_user(principal)? {
            Some(user) => user,
            None => return Ok(()),
        };
        let auth = &self.auth;
        match op {
            Operation::Put(p) => {
                auth.check_range(user, &p.key, &[], PermissionType::Write)?;
                if p.prev_kv {
                    auth.check_range(user, &p.key, &[], PermissionType::Read)?;
                }
                Ok(())
            }
            Operation::DeleteRange(d) => {
                auth.check_range(user, &d.key, &d.range_end, PermissionType::Write)?;
                if d.prev_kv {
                    auth.check_range(user, &d.key, &d.range_end, PermissionType::Read)?;
                }
                Ok(())
            }
            Operation::Txn(t) => auth.check_txn(user, t),
            Operation::LeaseRevoke { id } => {
                if let Some(lease) = self.leases.get(*id) {
                    for key in &lease.keys {
                        auth.check_range(user, key, &[], PermissionType::Write)?;
                    }
                }
                Ok(())
            }
            Operation::LeaseGrant { .. } | Operation::LeaseKeepAlive { .. } => Ok(()),
            Operation::Auth(a) if !a.requires_root() => Ok(()),
            Operation::Compact { .. } | Operation::Tick { .. } | Operation::Auth(_) => {
                auth.require_root(user)
            }
        }
    }

    /// Check that `principal` carries a valid identity when auth is on.
    pub fn check_authenticated(&self, principal: &Principal) -> TesseraResult<()> {
        self.effective_user(principal).map(|_| ())
    }

    /// Check that `principal` may run administrative operations.
    pub fn require_admin(&self, principal: &Principal) -> TesseraResult<()> {
        match self.effective_user(principal)? {
            Some(user) => self.auth.require_root(user),
            None => Ok(()),
        }
    }

    /// The user whose permissions apply, or `None` when nothing is checked.
    fn effective_user<'p>(&self, principal: &'p Principal) -> TesseraResult<Option<&'p str>> {
        if !self.auth.is_enabled() {
            return Ok(None);
        }
        match principal {
            Principal::Internal => Ok(None),
            Principal::Anonymous => Err(TesseraError::AuthenticationRequired),
            Principal::User(name) => {
                if self.auth.user(name).is_err() {
                    return Err(TesseraError::InvalidToken);
                }
                Ok(Some(name.as_str()))
            }
        }
    }

    /// Apply one committed entry.
    pub fn apply_entry(&mut self, entry: &LogEntry) -> Applied {
        let mut applied = Applied {
            index: entry.index,
            result: None,
            events: Vec::new(),
        };
        if entry.index <= self.applied_index {
            return applied;
        }
        self.applied_index = entry.index;

        let data = match &entry.payload {
            EntryPayload::Command(data) => data,
            EntryPayload::Noop | EntryPayload::ConfChange(_) => return applied,
        };
        let request = match Request::decode(data) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!(index = entry.index, error = %err, "skipping undecodable command");
                return applied;
            }
        };

        if let Some(outcome) = self.dedup.get(&request.id) {
            tracing::debug!(index = entry.index, request = ?request.id, "duplicate request");
            applied.result = Some((request.id, outcome.clone()));
            return applied;
        }

        let outcome = match self.authorize(&request.principal, &request.op) {
            Ok(()) => self.execute(&request.op, &mut applied.events),
            Err(err) => Err(err),
        };
        if !matches!(request.op, Operation::Tick { .. }) {
            self.dedup.record(request.id, outcome.clone());
        }
        tracing::debug!(
            index = entry.index,
            op = request.op.name(),
            revision = self.kv.current_revision(),
            ok = outcome.is_ok(),
            "applied"
        );
        applied.result = Some((request.id, outcome));
        applied
    }

    fn execute(&mut self, op: &Operation, events: &mut Vec<RevisionEvents>) -> ApplyOutcome {
        let op = match op {
            Operation::Put(req) => {
                let mut w = Writer::new(&mut self.kv, &mut self.leases);
                let res = w.put(req);
                let rev = w.revision();
                self.publish(rev, events);
                OpResponse::Put(res?)
            }
            Operation::DeleteRange(req) => {
                let mut w = Writer::new(&mut self.kv, &mut self.leases);
                let res = w.delete_range(req);
                let rev = w.revision();
                self.publish(rev, events);
                OpResponse::DeleteRange(res?)
            }
            Operation::Txn(req) => {
                let mut w = Writer::new(&mut self.kv, &mut self.leases);
                let res = w.txn(req);
                let rev = w.revision();
                self.publish(rev, events);
                OpResponse::Txn(res?)
            }
            Operation::Compact { revision } => {
                self.kv.compact(*revision)?;
                OpResponse::Compact
            }
            Operation::LeaseGrant { id, ttl } => {
                let lease = self.leases.grant(*id, *ttl, self.now)?;
                OpResponse::LeaseGrant {
                    id: lease.id,
                    ttl: lease.ttl,
                }
            }
            Operation::LeaseRevoke { id } => {
                self.revoke_lease(*id, events)?;
                OpResponse::LeaseRevoke
            }
            Operation::LeaseKeepAlive { id } => {
                let ttl = self.leases.renew(*id, self.now)?;
                OpResponse::LeaseKeepAlive { id: *id, ttl }
            }
            Operation::Tick { now_ms, promote } => {
                self.tick(Tick::new(*now_ms), *promote, events);
                OpResponse::Tick
            }
            Operation::Auth(op) => OpResponse::Auth(self.apply_auth(op)?),
        };
        Ok(Response {
            revision: self.kv.current_revision(),
            op,
        })
    }

    fn publish(&mut self, revision: i64, events: &mut Vec<RevisionEvents>) {
        let published = self.kv.finish(revision);
        if !published.is_empty() {
            events.push((revision, published));
        }
    }

    fn revoke_lease(&mut self, id: i64, events: &mut Vec<RevisionEvents>) -> TesseraResult<()> {
        let lease = self.leases.revoke(id)?;
        let mut w = Writer::new(&mut self.kv, &mut self.leases);
        let deleted = w.delete_keys(&lease.keys);
        let rev = w.revision();
        self.publish(rev, events);
        tracing::debug!(lease_id = id, deleted, "lease revoked");
        Ok(())
    }

    fn tick(&mut self, at: Tick, promote: bool, events: &mut Vec<RevisionEvents>) {
        self.now = self.now.max(at);
        if promote {
            self.leases.promote(self.now);
        }
        for id in self.leases.expired(self.now) {
            if let Err(err) = self.revoke_lease(id, events) {
                tracing::warn!(lease_id = id, error = %err, "failed to revoke expired lease");
            } else {
                tracing::info!(lease_id = id, "lease expired");
            }
        }
        self.auth.purge_tokens(self.now);
    }

    fn apply_auth(&mut self, op: &AuthOp) -> TesseraResult<AuthOpResponse> {
        self.auth.apply(op, self.now)
    }

    /// Serialize the full state for a snapshot.
    pub fn snapshot_data(&self) -> TesseraResult<Vec<u8>> {
        let snap = StateSnapshot {
            kv: self.kv.to_snapshot(),
            leases: self.leases.clone(),
            auth: self.auth.clone(),
            dedup: self.dedup.clone(),
            now: self.now,
        };
        Ok(bincode::serialize(&snap)?)
    }

    /// Replace the state with a snapshot taken at `index`.
    pub fn restore(&mut self, data: &[u8], index: u64) -> TesseraResult<()> {
        let snap: StateSnapshot = bincode::deserialize(data)?;
        self.kv = KvStore::from_snapshot(snap.kv);
        self.leases = snap.leases;
        self.auth = snap.auth;
        self.dedup = snap.dedup;
        self.now = snap.now;
        self.applied_index = index;
        tracing::info!(
            index,
            revision = self.kv.current_revision(),
            "restored state machine from snapshot"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::auth::{PasswordHash, Permission, ROOT_ROLE, ROOT_USER};
    use crate::kv::request::{DeleteRangeRequest, PutRequest};

    struct Harness {
        sm: StateMachine,
        index: u64,
        seq: u64,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                sm: StateMachine::new(16),
                index: 0,
                seq: 0,
            }
        }

        fn apply_as(&mut self, principal: Principal, op: Operation) -> Applied {
            self.seq += 1;
            let req = Request {
                id: RequestId {
                    member: 1,
                    seq: self.seq,
                },
                principal,
                op,
            };
            self.apply_request(&req)
        }

        fn apply_request(&mut self, req: &Request) -> Applied {
            self.index += 1;
            let entry = LogEntry::new(
                self.index,
                1,
                EntryPayload::Command(req.encode().unwrap()),
            );
            self.sm.apply_entry(&entry)
        }

        fn apply(&mut self, op: Operation) -> ApplyOutcome {
            self.apply_as(Principal::Internal, op).result.unwrap().1
        }
    }

    #[test]
    fn lease_expiry_revokes_keys_at_own_revisions() {
        let mut h = Harness::new();
        h.apply(Operation::LeaseGrant { id: 1, ttl: 5 }).unwrap();
        h.apply(Operation::LeaseGrant { id: 2, ttl: 5 }).unwrap();
        h.apply(Operation::Put(PutRequest::new("a", "1").with_lease(1)))
            .unwrap();
        h.apply(Operation::Put(PutRequest::new("b", "1").with_lease(2)))
            .unwrap();
        h.apply(Operation::Put(PutRequest::new("c", "1"))).unwrap();

        let early = h.apply_as(
            Principal::Internal,
            Operation::Tick {
                now_ms: 4_000,
                promote: false,
            },
        );
        assert!(early.events.is_empty());

        let applied = h.apply_as(
            Principal::Internal,
            Operation::Tick {
                now_ms: 5_000,
                promote: false,
            },
        );
        let revisions: Vec<i64> = applied.events.iter().map(|(rev, _)| *rev).collect();
        assert_eq!(revisions, vec![4, 5]);
        assert!(h.sm.kv().get(b"a", 0).unwrap().is_none());
        assert!(h.sm.kv().get(b"c", 0).unwrap().is_some());
        assert!(h.sm.leases().is_empty());
    }

    #[test]
    fn duplicate_request_is_applied_once() {
        let mut h = Harness::new();
        let req = Request {
            id: RequestId { member: 2, seq: 9 },
            principal: Principal::Internal,
            op: Operation::Put(PutRequest::new("k", "v")),
        };
        let first = h.apply_request(&req);
        let second = h.apply_request(&req);
        assert_eq!(first.result, second.result);
        assert!(second.events.is_empty());
        assert_eq!(h.sm.current_revision(), 1);
    }

    #[test]
    fn apply_rechecks_permissions() {
        let mut h = Harness::new();
        for op in [
            AuthOp::UserAdd {
                name: ROOT_USER.into(),
                password: Some(PasswordHash::generate("pw")),
            },
            AuthOp::UserGrantRole {
                user: ROOT_USER.into(),
                role: ROOT_ROLE.into(),
            },
            AuthOp::RoleAdd { name: "r".into() },
            AuthOp::RoleGrantPermission {
                name: "r".into(),
                permission: Permission::new(PermissionType::ReadWrite, "foo", "zoo"),
            },
            AuthOp::UserAdd {
                name: "u".into(),
                password: Some(PasswordHash::generate("pw")),
            },
            AuthOp::UserGrantRole {
                user: "u".into(),
                role: "r".into(),
            },
            AuthOp::Enable,
        ] {
            h.apply(Operation::Auth(op)).unwrap();
        }

        let user = || Principal::User("u".into());
        let ok = h.apply_as(user(), Operation::Put(PutRequest::new("foo1", "bar")));
        assert!(ok.result.unwrap().1.is_ok());

        let denied = h.apply_as(user(), Operation::Put(PutRequest::new("zoo1", "bar")));
        assert!(matches!(
            denied.result.unwrap().1,
            Err(TesseraError::PermissionDenied { .. })
        ));

        let anon = h.apply_as(
            Principal::Anonymous,
            Operation::DeleteRange(DeleteRangeRequest::new("foo1", "")),
        );
        assert_eq!(
            anon.result.unwrap().1,
            Err(TesseraError::AuthenticationRequired)
        );

        let compact = h.apply_as(user(), Operation::Compact { revision: 1 });
        assert!(compact.result.unwrap().1.is_err());
    }

    #[test]
    fn snapshot_restore_preserves_state() {
        let mut h = Harness::new();
        h.apply(Operation::LeaseGrant { id: 3, ttl: 10 }).unwrap();
        h.apply(Operation::Put(PutRequest::new("x", "1").with_lease(3)))
            .unwrap();
        let data = h.sm.snapshot_data().unwrap();

        let mut restored = StateMachine::new(16);
        restored.restore(&data, h.index).unwrap();
        assert_eq!(restored.applied_index(), h.index);
        assert_eq!(restored.hash_kv(0).unwrap(), h.sm.hash_kv(0).unwrap());
        assert_eq!(restored.lease_time_to_live(3, true).keys, vec![b"x".to_vec()]);
    }

    #[test]
    fn undecodable_command_is_skipped() {
        let mut sm = StateMachine::new(4);
        let entry = LogEntry::new(1, 1, EntryPayload::Command(vec![0xff; 3]));
        let applied = sm.apply_entry(&entry);
        assert!(applied.result.is_none());
        assert_eq!(sm.applied_index(), 1);
    }
}
