//! etcd v3 request handlers.
//!
//! [`EtcdService`] turns decoded wire requests into [`Member`] calls and
//! builds wire responses with a filled-in header. It has no transport
//! dependency; `grpc` wraps it in tonic services.
//!
//! Every handler resolves the caller's token first. When auth is disabled
//! all callers are anonymous; when it is enabled a missing or expired token
//! fails the request before any work is done.

use super::kv as convert;
use super::proto;
use crate::core::error::{TesseraError, TesseraResult};
use crate::kv::{Principal, Subscription, WatchId, WatchNotice};
use crate::server::Member;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Version reported by `Status`. Clients gate features on it.
pub const SERVER_VERSION: &str = "3.5.0";

/// Watch id used for responses not tied to a watch.
pub const NO_WATCH_ID: i64 = -1;

#[derive(Clone)]
pub struct EtcdService {
    member: Member,
    /// Capacity of per-stream response queues.
    stream_queue: usize,
}

impl EtcdService {
    pub fn new(member: Member) -> Self {
        Self {
            member,
            stream_queue: 128,
        }
    }

    pub fn member(&self) -> &Member {
        &self.member
    }

    pub fn header(&self, revision: i64) -> proto::ResponseHeader {
        proto::ResponseHeader {
            cluster_id: self.member.cluster_id(),
            member_id: self.member.id(),
            revision,
            raft_term: self.member.raft().status().term,
        }
    }

    fn current_header(&self) -> proto::ResponseHeader {
        self.header(self.member.current_revision())
    }

    fn principal(&self, token: Option<&str>) -> TesseraResult<Principal> {
        self.member.principal_for(token)
    }

    // ------------------------------------------------------------------
    // KV
    // ------------------------------------------------------------------

    pub async fn range(
        &self,
        token: Option<&str>,
        req: proto::RangeRequest,
    ) -> TesseraResult<proto::RangeResponse> {
        let principal = self.principal(token)?;
        let serializable = req.serializable;
        let (revision, resp) = self
            .member
            .range(&principal, convert::range_request(req)?, serializable)
            .await?;
        Ok(convert::range_response(self.header(revision), resp))
    }

    pub async fn put(&self, token: Option<&str>, req: proto::PutRequest) -> TesseraResult<proto::PutResponse> {
        let principal = self.principal(token)?;
        let (revision, resp) = self.member.put(&principal, convert::put_request(req)).await?;
        Ok(convert::put_response(self.header(revision), resp))
    }

    pub async fn delete_range(
        &self,
        token: Option<&str>,
        req: proto::DeleteRangeRequest,
    ) -> TesseraResult<proto::DeleteRangeResponse> {
        let principal = self.principal(token)?;
        let (revision, resp) = self
            .member
            .delete_range(&principal, convert::delete_range_request(req))
            .await?;
        Ok(convert::delete_range_response(self.header(revision), resp))
    }

    pub async fn txn(&self, token: Option<&str>, req: proto::TxnRequest) -> TesseraResult<proto::TxnResponse> {
        let principal = self.principal(token)?;
        let (revision, resp) = self.member.txn(&principal, convert::txn_request(req)?).await?;
        Ok(convert::txn_response(self.header(revision), resp))
    }

    pub async fn compact(
        &self,
        token: Option<&str>,
        req: proto::CompactionRequest,
    ) -> TesseraResult<proto::CompactionResponse> {
        let principal = self.principal(token)?;
        let revision = self.member.compact(&principal, req.revision).await?;
        Ok(proto::CompactionResponse {
            header: Some(self.header(revision)),
        })
    }

    // ------------------------------------------------------------------
    // Watch
    // ------------------------------------------------------------------

    /// Open a watch stream. Responses for every watch created on the
    /// session arrive on the returned receiver.
    pub fn open_watch(
        &self,
        token: Option<&str>,
    ) -> TesseraResult<(WatchSession, mpsc::Receiver<proto::WatchResponse>)> {
        let principal = self.principal(token)?;
        let (out, rx) = mpsc::channel(self.stream_queue);
        Ok((
            WatchSession {
                service: self.clone(),
                principal,
                out,
                watches: HashMap::new(),
                next_id: 0,
            },
            rx,
        ))
    }

    // ------------------------------------------------------------------
    // Lease
    // ------------------------------------------------------------------

    pub async fn lease_grant(
        &self,
        token: Option<&str>,
        req: proto::LeaseGrantRequest,
    ) -> TesseraResult<proto::LeaseGrantResponse> {
        let principal = self.principal(token)?;
        let grant = self.member.lease_grant(&principal, req.id, req.ttl).await?;
        Ok(proto::LeaseGrantResponse {
            header: Some(self.header(grant.revision)),
            id: grant.id,
            ttl: grant.ttl,
            error: String::new(),
        })
    }

    pub async fn lease_revoke(
        &self,
        token: Option<&str>,
        req: proto::LeaseRevokeRequest,
    ) -> TesseraResult<proto::LeaseRevokeResponse> {
        let principal = self.principal(token)?;
        let revision = self.member.lease_revoke(&principal, req.id).await?;
        Ok(proto::LeaseRevokeResponse {
            header: Some(self.header(revision)),
        })
    }

    /// One keep-alive round trip. An unknown lease answers with a TTL of 0
    /// instead of failing the stream.
    pub async fn lease_keep_alive(
        &self,
        token: Option<&str>,
        req: proto::LeaseKeepAliveRequest,
    ) -> TesseraResult<proto::LeaseKeepAliveResponse> {
        let principal = self.principal(token)?;
        let ttl = match self.member.lease_keep_alive(&principal, req.id).await {
            Ok(ttl) => ttl,
            Err(TesseraError::LeaseNotFound { .. }) => 0,
            Err(e) => return Err(e),
        };
        Ok(proto::LeaseKeepAliveResponse {
            header: Some(self.current_header()),
            id: req.id,
            ttl,
        })
    }

    pub async fn lease_time_to_live(
        &self,
        token: Option<&str>,
        req: proto::LeaseTimeToLiveRequest,
    ) -> TesseraResult<proto::LeaseTimeToLiveResponse> {
        let principal = self.principal(token)?;
        let ttl = self
            .member
            .lease_time_to_live(&principal, req.id, req.keys)
            .await?;
        Ok(proto::LeaseTimeToLiveResponse {
            header: Some(self.current_header()),
            id: ttl.id,
            ttl: ttl.ttl,
            granted_ttl: ttl.granted_ttl,
            keys: ttl.keys,
        })
    }

    pub async fn lease_leases(&self, token: Option<&str>) -> TesseraResult<proto::LeaseLeasesResponse> {
        let principal = self.principal(token)?;
        let ids = self.member.lease_leases(&principal).await?;
        Ok(proto::LeaseLeasesResponse {
            header: Some(self.current_header()),
            leases: ids.into_iter().map(|id| proto::LeaseStatus { id }).collect(),
        })
    }

    // ------------------------------------------------------------------
    // Cluster
    // ------------------------------------------------------------------

    fn members(&self) -> Vec<proto::Member> {
        self.member
            .member_list()
            .into_iter()
            .map(convert::member)
            .collect()
    }

    pub async fn member_add(
        &self,
        token: Option<&str>,
        req: proto::MemberAddRequest,
    ) -> TesseraResult<proto::MemberAddResponse> {
        let principal = self.principal(token)?;
        if req.is_learner {
            return Err(TesseraError::invalid_argument("learner members are not supported"));
        }
        let peer_addr = first_url(&req.peer_urls)?;
        let info = self.member.member_add(&principal, "", peer_addr, "").await?;
        Ok(proto::MemberAddResponse {
            header: Some(self.current_header()),
            member: Some(convert::member(info)),
            members: self.members(),
        })
    }

    pub async fn member_remove(
        &self,
        token: Option<&str>,
        req: proto::MemberRemoveRequest,
    ) -> TesseraResult<proto::MemberRemoveResponse> {
        let principal = self.principal(token)?;
        self.member.member_remove(&principal, req.id).await?;
        Ok(proto::MemberRemoveResponse {
            header: Some(self.current_header()),
            members: self.members(),
        })
    }

    pub async fn member_update(
        &self,
        token: Option<&str>,
        req: proto::MemberUpdateRequest,
    ) -> TesseraResult<proto::MemberUpdateResponse> {
        let principal = self.principal(token)?;
        let peer_addr = first_url(&req.peer_urls)?;
        self.member.member_update(&principal, req.id, peer_addr).await?;
        Ok(proto::MemberUpdateResponse {
            header: Some(self.current_header()),
            members: self.members(),
        })
    }

    pub fn member_list(&self, token: Option<&str>) -> TesseraResult<proto::MemberListResponse> {
        self.principal(token)?;
        Ok(proto::MemberListResponse {
            header: Some(self.current_header()),
            members: self.members(),
        })
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    pub fn status(&self, token: Option<&str>) -> TesseraResult<proto::StatusResponse> {
        self.principal(token)?;
        let status = self.member.status();
        Ok(proto::StatusResponse {
            header: Some(self.header(status.revision)),
            version: SERVER_VERSION.to_string(),
            db_size: status.db_size,
            leader: status.leader.unwrap_or(0),
            raft_index: status.raft_index,
            raft_term: status.raft_term,
            raft_applied_index: status.applied_index,
            errors: Vec::new(),
            db_size_in_use: status.db_size,
            is_learner: false,
        })
    }

    pub fn hash_kv(&self, token: Option<&str>, req: proto::HashKvRequest) -> TesseraResult<proto::HashKvResponse> {
        self.principal(token)?;
        let (hash, current, compact_revision) = self.member.hash_kv(req.revision)?;
        let hash_revision = if req.revision > 0 { req.revision } else { current };
        Ok(proto::HashKvResponse {
            header: Some(self.header(current)),
            hash,
            compact_revision,
            hash_revision,
        })
    }

    // ------------------------------------------------------------------
    // Auth
    // ------------------------------------------------------------------

    pub async fn authenticate(&self, req: proto::AuthenticateRequest) -> TesseraResult<proto::AuthenticateResponse> {
        let token = self.member.authenticate(&req.name, &req.password).await?;
        Ok(proto::AuthenticateResponse {
            header: Some(self.current_header()),
            token,
        })
    }

    pub fn auth_status(&self, token: Option<&str>) -> TesseraResult<proto::AuthStatusResponse> {
        self.principal(token)?;
        let (enabled, auth_revision) = self.member.auth_status();
        Ok(proto::AuthStatusResponse {
            header: Some(self.current_header()),
            enabled,
            auth_revision,
        })
    }

    pub async fn auth_enable(&self, token: Option<&str>) -> TesseraResult<proto::HeaderOnlyResponse> {
        let principal = self.principal(token)?;
        let revision = self.member.auth_enable(&principal).await?;
        Ok(self.header_only(revision))
    }

    pub async fn auth_disable(&self, token: Option<&str>) -> TesseraResult<proto::HeaderOnlyResponse> {
        let principal = self.principal(token)?;
        let revision = self.member.auth_disable(&principal).await?;
        Ok(self.header_only(revision))
    }

    pub async fn user_add(
        &self,
        token: Option<&str>,
        req: proto::AuthUserAddRequest,
    ) -> TesseraResult<proto::HeaderOnlyResponse> {
        let principal = self.principal(token)?;
        require_name(&req.name, "user")?;
        let no_password = req.options.map(|o| o.no_password).unwrap_or(false);
        let password = if no_password {
            None
        } else if req.password.is_empty() {
            return Err(TesseraError::invalid_argument("password is empty"));
        } else {
            Some(req.password.as_str())
        };
        let revision = self.member.user_add(&principal, &req.name, password).await?;
        Ok(self.header_only(revision))
    }

    pub async fn user_get(
        &self,
        token: Option<&str>,
        req: proto::AuthUserGetRequest,
    ) -> TesseraResult<proto::AuthUserGetResponse> {
        let principal = self.principal(token)?;
        let roles = self.member.user_get(&principal, &req.name).await?;
        Ok(proto::AuthUserGetResponse {
            header: Some(self.current_header()),
            roles,
        })
    }

    pub async fn user_list(&self, token: Option<&str>) -> TesseraResult<proto::AuthUserListResponse> {
        let principal = self.principal(token)?;
        let users = self.member.user_list(&principal).await?;
        Ok(proto::AuthUserListResponse {
            header: Some(self.current_header()),
            users,
        })
    }

    pub async fn user_delete(
        &self,
        token: Option<&str>,
        req: proto::AuthUserDeleteRequest,
    ) -> TesseraResult<proto::HeaderOnlyResponse> {
        let principal = self.principal(token)?;
        let revision = self.member.user_delete(&principal, &req.name).await?;
        Ok(self.header_only(revision))
    }

    pub async fn user_change_password(
        &self,
        token: Option<&str>,
        req: proto::AuthUserChangePasswordRequest,
    ) -> TesseraResult<proto::HeaderOnlyResponse> {
        let principal = self.principal(token)?;
        if req.password.is_empty() {
            return Err(TesseraError::invalid_argument("password is empty"));
        }
        let revision = self
            .member
            .user_change_password(&principal, &req.name, &req.password)
            .await?;
        Ok(self.header_only(revision))
    }

    pub async fn user_grant_role(
        &self,
        token: Option<&str>,
        req: proto::AuthUserGrantRoleRequest,
    ) -> TesseraResult<proto::HeaderOnlyResponse> {
        let principal = self.principal(token)?;
        let revision = self
            .member
            .user_grant_role(&principal, &req.user, &req.role)
            .await?;
        Ok(self.header_only(revision))
    }

    pub async fn user_revoke_role(
        &self,
        token: Option<&str>,
        req: proto::AuthUserRevokeRoleRequest,
    ) -> TesseraResult<proto::HeaderOnlyResponse> {
        let principal = self.principal(token)?;
        let revision = self
            .member
            .user_revoke_role(&principal, &req.name, &req.role)
            .await?;
        Ok(self.header_only(revision))
    }

    pub async fn role_add(
        &self,
        token: Option<&str>,
        req: proto::AuthRoleAddRequest,
    ) -> TesseraResult<proto::HeaderOnlyResponse> {
        let principal = self.principal(token)?;
        require_name(&req.name, "role")?;
        let revision = self.member.role_add(&principal, &req.name).await?;
        Ok(self.header_only(revision))
    }

    pub async fn role_get(
        &self,
        token: Option<&str>,
        req: proto::AuthRoleGetRequest,
    ) -> TesseraResult<proto::AuthRoleGetResponse> {
        let principal = self.principal(token)?;
        let perms = self.member.role_get(&principal, &req.role).await?;
        Ok(proto::AuthRoleGetResponse {
            header: Some(self.current_header()),
            perm: perms.into_iter().map(convert::permission_to_proto).collect(),
        })
    }

    pub async fn role_list(&self, token: Option<&str>) -> TesseraResult<proto::AuthRoleListResponse> {
        let principal = self.principal(token)?;
        let roles = self.member.role_list(&principal).await?;
        Ok(proto::AuthRoleListResponse {
            header: Some(self.current_header()),
            roles,
        })
    }

    pub async fn role_delete(
        &self,
        token: Option<&str>,
        req: proto::AuthRoleDeleteRequest,
    ) -> TesseraResult<proto::HeaderOnlyResponse> {
        let principal = self.principal(token)?;
        let revision = self.member.role_delete(&principal, &req.role).await?;
        Ok(self.header_only(revision))
    }

    pub async fn role_grant_permission(
        &self,
        token: Option<&str>,
        req: proto::AuthRoleGrantPermissionRequest,
    ) -> TesseraResult<proto::HeaderOnlyResponse> {
        let principal = self.principal(token)?;
        let perm = req
            .perm
            .ok_or_else(|| TesseraError::invalid_argument("permission not given"))?;
        let revision = self
            .member
            .role_grant_permission(&principal, &req.name, convert::permission(perm)?)
            .await?;
        Ok(self.header_only(revision))
    }

    pub async fn role_revoke_permission(
        &self,
        token: Option<&str>,
        req: proto::AuthRoleRevokePermissionRequest,
    ) -> TesseraResult<proto::HeaderOnlyResponse> {
        let principal = self.principal(token)?;
        let revision = self
            .member
            .role_revoke_permission(&principal, &req.role, &req.key, &req.range_end)
            .await?;
        Ok(self.header_only(revision))
    }

    fn header_only(&self, revision: i64) -> proto::HeaderOnlyResponse {
        proto::HeaderOnlyResponse {
            header: Some(self.header(revision)),
        }
    }
}

fn first_url(urls: &[String]) -> TesseraResult<&str> {
    urls.first()
        .map(String::as_str)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| TesseraError::invalid_argument("member peer URL is empty"))
}

fn require_name(name: &str, what: &str) -> TesseraResult<()> {
    if name.is_empty() {
        return Err(TesseraError::invalid_argument(format!("{} name is empty", what)));
    }
    Ok(())
}

// ============================================================================
// Watch sessions
// ============================================================================

struct ActiveWatch {
    hub_id: WatchId,
    forwarder: JoinHandle<()>,
}

/// One client watch stream. Watch ids are local to the session and start
/// at 0, as etcd clients expect. Dropping the session cancels its watches.
pub struct WatchSession {
    service: EtcdService,
    principal: Principal,
    out: mpsc::Sender<proto::WatchResponse>,
    watches: HashMap<i64, ActiveWatch>,
    next_id: i64,
}

impl WatchSession {
    /// Handle one inbound request. Fails only when the client has gone
    /// away.
    pub async fn handle(&mut self, req: proto::WatchRequest) -> TesseraResult<()> {
        use proto::watch_request::RequestUnion;
        match req.request_union {
            Some(RequestUnion::CreateRequest(create)) => self.create(create).await,
            Some(RequestUnion::CancelRequest(cancel)) => self.cancel(cancel.watch_id).await,
            Some(RequestUnion::ProgressRequest(_)) => {
                let resp = proto::WatchResponse {
                    header: Some(self.service.current_header()),
                    watch_id: NO_WATCH_ID,
                    ..Default::default()
                };
                self.send(resp).await
            }
            None => Ok(()),
        }
    }

    async fn create(&mut self, req: proto::WatchCreateRequest) -> TesseraResult<()> {
        let watch_id = if req.watch_id > 0 {
            if self.watches.contains_key(&req.watch_id) {
                return self
                    .reject(
                        req.watch_id,
                        "etcdserver: duplicate watch ID provided on the WatchStream",
                    )
                    .await;
            }
            req.watch_id
        } else {
            while self.watches.contains_key(&self.next_id) {
                self.next_id += 1;
            }
            self.next_id
        };

        let registered = convert::watch_request(req)
            .and_then(|w| self.service.member.watch(&self.principal, w));
        let subscription = match registered {
            Ok(sub) => sub,
            Err(e) => {
                let reason = super::errors::to_etcd_error(&e).message;
                return self.reject(NO_WATCH_ID, &reason).await;
            }
        };
        if watch_id == self.next_id {
            self.next_id += 1;
        }

        let created = proto::WatchResponse {
            header: Some(self.service.header(subscription.revision)),
            watch_id,
            created: true,
            ..Default::default()
        };
        self.send(created).await?;

        let hub_id = subscription.id;
        let forwarder = tokio::spawn(forward(
            self.service.clone(),
            watch_id,
            subscription,
            self.out.clone(),
        ));
        tracing::debug!(watch_id, hub_id, "watch created");
        self.watches.insert(watch_id, ActiveWatch { hub_id, forwarder });
        Ok(())
    }

    async fn cancel(&mut self, watch_id: i64) -> TesseraResult<()> {
        let Some(watch) = self.watches.remove(&watch_id) else {
            return Ok(());
        };
        watch.forwarder.abort();
        self.service.member.cancel_watch(watch.hub_id);
        let resp = proto::WatchResponse {
            header: Some(self.service.current_header()),
            watch_id,
            canceled: true,
            ..Default::default()
        };
        self.send(resp).await
    }

    async fn reject(&self, watch_id: i64, reason: &str) -> TesseraResult<()> {
        let resp = proto::WatchResponse {
            header: Some(self.service.current_header()),
            watch_id,
            created: true,
            canceled: true,
            cancel_reason: reason.to_string(),
            ..Default::default()
        };
        self.send(resp).await
    }

    async fn send(&self, resp: proto::WatchResponse) -> TesseraResult<()> {
        self.out
            .send(resp)
            .await
            .map_err(|_| TesseraError::unavailable(crate::core::error::UnavailableReason::Stopped))
    }
}

impl Drop for WatchSession {
    fn drop(&mut self) {
        for (_, watch) in self.watches.drain() {
            watch.forwarder.abort();
            self.service.member.cancel_watch(watch.hub_id);
        }
    }
}

/// Copy one subscription's notices onto the session stream.
async fn forward(
    service: EtcdService,
    watch_id: i64,
    mut subscription: Subscription,
    out: mpsc::Sender<proto::WatchResponse>,
) {
    while let Some(notice) = subscription.notices.recv().await {
        let (resp, last) = match notice {
            WatchNotice::Events { revision, events } => (
                proto::WatchResponse {
                    header: Some(service.header(revision)),
                    watch_id,
                    events: events.into_iter().map(convert::event).collect(),
                    ..Default::default()
                },
                false,
            ),
            WatchNotice::Compacted { compact_revision } => (
                proto::WatchResponse {
                    header: Some(service.current_header()),
                    watch_id,
                    canceled: true,
                    compact_revision,
                    cancel_reason: "etcdserver: mvcc: required revision has been compacted"
                        .to_string(),
                    ..Default::default()
                },
                true,
            ),
        };
        if out.send(resp).await.is_err() || last {
            return;
        }
    }
    // The hub dropped the watcher: its queue overflowed or the store jumped
    // past history it could replay.
    tracing::debug!(watch_id, "watcher disconnected by dispatcher");
    let _ = out
        .send(proto::WatchResponse {
            header: Some(service.current_header()),
            watch_id,
            canceled: true,
            cancel_reason: "etcdserver: watcher disconnected".to_string(),
            ..Default::default()
        })
        .await;
}
