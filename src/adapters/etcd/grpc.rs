//! tonic services for the etcd v3 API.
//!
//! There is no build-time codegen: each etcd service is a hand-written
//! [`NamedService`] whose `call` routes on the request path and hands the
//! body to tonic's [`Grpc`] with a [`ProstCodec`]. Handlers live on
//! [`EtcdService`].

use super::auth::token_from_metadata;
use super::errors::unknown_method;
use super::proto;
use super::service::EtcdService;
use crate::core::error::TesseraResult;
use futures::stream::{self, BoxStream, StreamExt};
use std::convert::Infallible;
use std::future::Future;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tonic::codec::ProstCodec;
use tonic::codegen::{empty_body, http, Body, BoxFuture, StdError};
use tonic::server::{Grpc, NamedService, StreamingService, UnaryService};
use tonic::{Request, Response, Status, Streaming};

type HttpResponse = http::Response<tonic::body::BoxBody>;

// ============================================================================
// Method adapters
// ============================================================================

/// A unary method backed by a closure taking the caller's token and the
/// decoded request.
struct Unary<F>(F);

impl<Req, Resp, F, Fut> UnaryService<Req> for Unary<F>
where
    F: FnMut(Option<String>, Req) -> Fut,
    Fut: Future<Output = TesseraResult<Resp>> + Send + 'static,
{
    type Response = Resp;
    type Future = BoxFuture<Response<Resp>, Status>;

    fn call(&mut self, request: Request<Req>) -> Self::Future {
        let token = token_from_metadata(request.metadata());
        let fut = (self.0)(token, request.into_inner());
        Box::pin(async move { fut.await.map(Response::new).map_err(Status::from) })
    }
}

fn unary<B, Req, Resp, F, Fut>(req: http::Request<B>, handler: F) -> BoxFuture<HttpResponse, Infallible>
where
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
    Req: prost::Message + Default + Send + 'static,
    Resp: prost::Message + Send + 'static,
    F: FnMut(Option<String>, Req) -> Fut + Send + 'static,
    Fut: Future<Output = TesseraResult<Resp>> + Send + 'static,
{
    Box::pin(async move {
        let mut grpc = Grpc::new(ProstCodec::<Resp, Req>::default());
        Ok(grpc.unary(Unary(handler), req).await)
    })
}

fn unimplemented(path: &str) -> BoxFuture<HttpResponse, Infallible> {
    tracing::debug!(path, "unknown gRPC method");
    let code = tonic::Code::from(unknown_method(path).code);
    Box::pin(async move {
        let mut response = http::Response::new(empty_body());
        let headers = response.headers_mut();
        headers.insert(Status::GRPC_STATUS, (code as i32).into());
        headers.insert(http::header::CONTENT_TYPE, tonic::metadata::GRPC_CONTENT_TYPE);
        Ok(response)
    })
}

/// Routes one service's methods.
pub trait Routes: Clone + Send + Sync + 'static {
    fn route<B>(&self, path: &str, req: http::Request<B>) -> BoxFuture<HttpResponse, Infallible>
    where
        B: Body + Send + 'static,
        B::Error: Into<StdError> + Send + 'static;
}

/// A tonic-servable service over a set of [`Routes`].
#[derive(Clone)]
pub struct Routed<R>(R);

impl<R, B> tonic::codegen::Service<http::Request<B>> for Routed<R>
where
    R: Routes,
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = HttpResponse;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let path = req.uri().path().to_string();
        self.0.route(&path, req)
    }
}

/// Bind a handler method of [`EtcdService`] into a unary route.
macro_rules! handle {
    ($req:expr, $svc:expr, |$s:ident, $t:ident, $r:ident: $ty:ty| $body:expr) => {{
        let svc = $svc.clone();
        unary($req, move |$t: Option<String>, $r: $ty| {
            let $s = svc.clone();
            async move { $body }
        })
    }};
}

// ============================================================================
// etcdserverpb.KV
// ============================================================================

#[derive(Clone)]
pub struct KvRoutes(EtcdService);

impl Routes for KvRoutes {
    fn route<B>(&self, path: &str, req: http::Request<B>) -> BoxFuture<HttpResponse, Infallible>
    where
        B: Body + Send + 'static,
        B::Error: Into<StdError> + Send + 'static,
    {
        match path {
            "/etcdserverpb.KV/Range" => handle!(req, self.0, |s, t, r: proto::RangeRequest| {
                s.range(t.as_deref(), r).await
            }),
            "/etcdserverpb.KV/Put" => handle!(req, self.0, |s, t, r: proto::PutRequest| {
                s.put(t.as_deref(), r).await
            }),
            "/etcdserverpb.KV/DeleteRange" => handle!(req, self.0, |s, t, r: proto::DeleteRangeRequest| {
                s.delete_range(t.as_deref(), r).await
            }),
            "/etcdserverpb.KV/Txn" => handle!(req, self.0, |s, t, r: proto::TxnRequest| {
                s.txn(t.as_deref(), r).await
            }),
            "/etcdserverpb.KV/Compact" => handle!(req, self.0, |s, t, r: proto::CompactionRequest| {
                s.compact(t.as_deref(), r).await
            }),
            _ => unimplemented(path),
        }
    }
}

impl NamedService for Routed<KvRoutes> {
    const NAME: &'static str = "etcdserverpb.KV";
}

// ============================================================================
// etcdserverpb.Watch
// ============================================================================

#[derive(Clone)]
pub struct WatchRoutes(EtcdService);

/// The bidirectional `Watch` stream. Inbound requests are handled on a
/// task of their own; responses flow back through the session queue.
struct WatchStream(EtcdService);

impl StreamingService<proto::WatchRequest> for WatchStream {
    type Response = proto::WatchResponse;
    type ResponseStream = BoxStream<'static, Result<proto::WatchResponse, Status>>;
    type Future = BoxFuture<Response<Self::ResponseStream>, Status>;

    fn call(&mut self, request: Request<Streaming<proto::WatchRequest>>) -> Self::Future {
        let service = self.0.clone();
        Box::pin(async move {
            let token = token_from_metadata(request.metadata());
            let (mut session, rx) = match service.open_watch(token.as_deref()) {
                Ok(opened) => opened,
                Err(e) => return Err(Status::from(e)),
            };
            let mut inbound = request.into_inner();
            tokio::spawn(async move {
                loop {
                    match inbound.message().await {
                        Ok(Some(req)) => {
                            if session.handle(req).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(status) => {
                            tracing::debug!(error = %status, "watch stream closed");
                            break;
                        }
                    }
                }
            });
            Ok(Response::new(receiver_stream(rx).map(Ok).boxed()))
        })
    }
}

impl Routes for WatchRoutes {
    fn route<B>(&self, path: &str, req: http::Request<B>) -> BoxFuture<HttpResponse, Infallible>
    where
        B: Body + Send + 'static,
        B::Error: Into<StdError> + Send + 'static,
    {
        match path {
            "/etcdserverpb.Watch/Watch" => {
                let method = WatchStream(self.0.clone());
                Box::pin(async move {
                    let mut grpc = Grpc::new(ProstCodec::<proto::WatchResponse, proto::WatchRequest>::default());
                    Ok(grpc.streaming(method, req).await)
                })
            }
            _ => unimplemented(path),
        }
    }
}

impl NamedService for Routed<WatchRoutes> {
    const NAME: &'static str = "etcdserverpb.Watch";
}

// ============================================================================
// etcdserverpb.Lease
// ============================================================================

#[derive(Clone)]
pub struct LeaseRoutes(EtcdService);

/// The bidirectional `LeaseKeepAlive` stream. Each request renews one
/// lease; the first error ends the stream.
struct KeepAliveStream(EtcdService);

impl StreamingService<proto::LeaseKeepAliveRequest> for KeepAliveStream {
    type Response = proto::LeaseKeepAliveResponse;
    type ResponseStream = BoxStream<'static, Result<proto::LeaseKeepAliveResponse, Status>>;
    type Future = BoxFuture<Response<Self::ResponseStream>, Status>;

    fn call(&mut self, request: Request<Streaming<proto::LeaseKeepAliveRequest>>) -> Self::Future {
        let service = self.0.clone();
        Box::pin(async move {
            let token = token_from_metadata(request.metadata());
            let mut inbound = request.into_inner();
            let (tx, rx) = mpsc::channel::<Result<proto::LeaseKeepAliveResponse, Status>>(16);
            tokio::spawn(async move {
                loop {
                    let req = match inbound.message().await {
                        Ok(Some(req)) => req,
                        Ok(None) => break,
                        Err(status) => {
                            tracing::debug!(error = %status, "keepalive stream closed");
                            break;
                        }
                    };
                    let result = service
                        .lease_keep_alive(token.as_deref(), req)
                        .await
                        .map_err(Status::from);
                    let failed = result.is_err();
                    if tx.send(result).await.is_err() || failed {
                        break;
                    }
                }
            });
            Ok(Response::new(receiver_stream(rx).boxed()))
        })
    }
}

impl Routes for LeaseRoutes {
    fn route<B>(&self, path: &str, req: http::Request<B>) -> BoxFuture<HttpResponse, Infallible>
    where
        B: Body + Send + 'static,
        B::Error: Into<StdError> + Send + 'static,
    {
        match path {
            "/etcdserverpb.Lease/LeaseGrant" => handle!(req, self.0, |s, t, r: proto::LeaseGrantRequest| {
                s.lease_grant(t.as_deref(), r).await
            }),
            "/etcdserverpb.Lease/LeaseRevoke" => handle!(req, self.0, |s, t, r: proto::LeaseRevokeRequest| {
                s.lease_revoke(t.as_deref(), r).await
            }),
            "/etcdserverpb.Lease/LeaseKeepAlive" => {
                let method = KeepAliveStream(self.0.clone());
                Box::pin(async move {
                    let mut grpc = Grpc::new(ProstCodec::<
                        proto::LeaseKeepAliveResponse,
                        proto::LeaseKeepAliveRequest,
                    >::default());
                    Ok(grpc.streaming(method, req).await)
                })
            }
            "/etcdserverpb.Lease/LeaseTimeToLive" => handle!(req, self.0, |s, t, r: proto::LeaseTimeToLiveRequest| {
                s.lease_time_to_live(t.as_deref(), r).await
            }),
            "/etcdserverpb.Lease/LeaseLeases" => handle!(req, self.0, |s, t, _r: proto::LeaseLeasesRequest| {
                s.lease_leases(t.as_deref()).await
            }),
            _ => unimplemented(path),
        }
    }
}

impl NamedService for Routed<LeaseRoutes> {
    const NAME: &'static str = "etcdserverpb.Lease";
}

// ============================================================================
// etcdserverpb.Cluster
// ============================================================================

#[derive(Clone)]
pub struct ClusterRoutes(EtcdService);

impl Routes for ClusterRoutes {
    fn route<B>(&self, path: &str, req: http::Request<B>) -> BoxFuture<HttpResponse, Infallible>
    where
        B: Body + Send + 'static,
        B::Error: Into<StdError> + Send + 'static,
    {
        match path {
            "/etcdserverpb.Cluster/MemberAdd" => handle!(req, self.0, |s, t, r: proto::MemberAddRequest| {
                s.member_add(t.as_deref(), r).await
            }),
            "/etcdserverpb.Cluster/MemberRemove" => handle!(req, self.0, |s, t, r: proto::MemberRemoveRequest| {
                s.member_remove(t.as_deref(), r).await
            }),
            "/etcdserverpb.Cluster/MemberUpdate" => handle!(req, self.0, |s, t, r: proto::MemberUpdateRequest| {
                s.member_update(t.as_deref(), r).await
            }),
            "/etcdserverpb.Cluster/MemberList" => handle!(req, self.0, |s, t, _r: proto::MemberListRequest| {
                s.member_list(t.as_deref())
            }),
            _ => unimplemented(path),
        }
    }
}

impl NamedService for Routed<ClusterRoutes> {
    const NAME: &'static str = "etcdserverpb.Cluster";
}

// ============================================================================
// etcdserverpb.Maintenance
// ============================================================================

#[derive(Clone)]
pub struct MaintenanceRoutes(EtcdService);

impl Routes for MaintenanceRoutes {
    fn route<B>(&self, path: &str, req: http::Request<B>) -> BoxFuture<HttpResponse, Infallible>
    where
        B: Body + Send + 'static,
        B::Error: Into<StdError> + Send + 'static,
    {
        match path {
            "/etcdserverpb.Maintenance/Status" => handle!(req, self.0, |s, t, _r: proto::StatusRequest| {
                s.status(t.as_deref())
            }),
            "/etcdserverpb.Maintenance/HashKV" => handle!(req, self.0, |s, t, r: proto::HashKvRequest| {
                s.hash_kv(t.as_deref(), r)
            }),
            _ => unimplemented(path),
        }
    }
}

impl NamedService for Routed<MaintenanceRoutes> {
    const NAME: &'static str = "etcdserverpb.Maintenance";
}

// ============================================================================
// etcdserverpb.Auth
// ============================================================================

#[derive(Clone)]
pub struct AuthRoutes(EtcdService);

impl Routes for AuthRoutes {
    fn route<B>(&self, path: &str, req: http::Request<B>) -> BoxFuture<HttpResponse, Infallible>
    where
        B: Body + Send + 'static,
        B::Error: Into<StdError> + Send + 'static,
    {
        match path {
            "/etcdserverpb.Auth/AuthEnable" => handle!(req, self.0, |s, t, _r: proto::AuthEnableRequest| {
                s.auth_enable(t.as_deref()).await
            }),
            "/etcdserverpb.Auth/AuthDisable" => handle!(req, self.0, |s, t, _r: proto::AuthDisableRequest| {
                s.auth_disable(t.as_deref()).await
            }),
            "/etcdserverpb.Auth/AuthStatus" => handle!(req, self.0, |s, t, _r: proto::AuthStatusRequest| {
                s.auth_status(t.as_deref())
            }),
            "/etcdserverpb.Auth/Authenticate" => handle!(req, self.0, |s, _t, r: proto::AuthenticateRequest| {
                s.authenticate(r).await
            }),
            "/etcdserverpb.Auth/UserAdd" => handle!(req, self.0, |s, t, r: proto::AuthUserAddRequest| {
                s.user_add(t.as_deref(), r).await
            }),
            "/etcdserverpb.Auth/UserGet" => handle!(req, self.0, |s, t, r: proto::AuthUserGetRequest| {
                s.user_get(t.as_deref(), r).await
            }),
            "/etcdserverpb.Auth/UserList" => handle!(req, self.0, |s, t, _r: proto::AuthUserListRequest| {
                s.user_list(t.as_deref()).await
            }),
            "/etcdserverpb.Auth/UserDelete" => handle!(req, self.0, |s, t, r: proto::AuthUserDeleteRequest| {
                s.user_delete(t.as_deref(), r).await
            }),
            "/etcdserverpb.Auth/UserChangePassword" => handle!(req, self.0, |s, t, r: proto::AuthUserChangePasswordRequest| {
                s.user_change_password(t.as_deref(), r).await
            }),
            "/etcdserverpb.Auth/UserGrantRole" => handle!(req, self.0, |s, t, r: proto::AuthUserGrantRoleRequest| {
                s.user_grant_role(t.as_deref(), r).await
            }),
            "/etcdserverpb.Auth/UserRevokeRole" => handle!(req, self.0, |s, t, r: proto::AuthUserRevokeRoleRequest| {
                s.user_revoke_role(t.as_deref(), r).await
            }),
            "/etcdserverpb.Auth/RoleAdd" => handle!(req, self.0, |s, t, r: proto::AuthRoleAddRequest| {
                s.role_add(t.as_deref(), r).await
            }),
            "/etcdserverpb.Auth/RoleGet" => handle!(req, self.0, |s, t, r: proto::AuthRoleGetRequest| {
                s.role_get(t.as_deref(), r).await
            }),
            "/etcdserverpb.Auth/RoleList" => handle!(req, self.0, |s, t, _r: proto::AuthRoleListRequest| {
                s.role_list(t.as_deref()).await
            }),
            "/etcdserverpb.Auth/RoleDelete" => handle!(req, self.0, |s, t, r: proto::AuthRoleDeleteRequest| {
                s.role_delete(t.as_deref(), r).await
            }),
            "/etcdserverpb.Auth/RoleGrantPermission" => handle!(req, self.0, |s, t, r: proto::AuthRoleGrantPermissionRequest| {
                s.role_grant_permission(t.as_deref(), r).await
            }),
            "/etcdserverpb.Auth/RoleRevokePermission" => handle!(req, self.0, |s, t, r: proto::AuthRoleRevokePermissionRequest| {
                s.role_revoke_permission(t.as_deref(), r).await
            }),
            _ => unimplemented(path),
        }
    }
}

impl NamedService for Routed<AuthRoutes> {
    const NAME: &'static str = "etcdserverpb.Auth";
}

// ============================================================================
// Server
// ============================================================================

/// The six etcd services over one [`EtcdService`].
pub struct EtcdServices {
    pub kv: Routed<KvRoutes>,
    pub watch: Routed<WatchRoutes>,
    pub lease: Routed<LeaseRoutes>,
    pub cluster: Routed<ClusterRoutes>,
    pub maintenance: Routed<MaintenanceRoutes>,
    pub auth: Routed<AuthRoutes>,
}

impl EtcdServices {
    pub fn new(service: EtcdService) -> Self {
        Self {
            kv: Routed(KvRoutes(service.clone())),
            watch: Routed(WatchRoutes(service.clone())),
            lease: Routed(LeaseRoutes(service.clone())),
            cluster: Routed(ClusterRoutes(service.clone())),
            maintenance: Routed(MaintenanceRoutes(service.clone())),
            auth: Routed(AuthRoutes(service)),
        }
    }

    /// Register every service on a tonic server.
    pub fn add_to(self, server: &mut tonic::transport::Server) -> tonic::transport::server::Router {
        server
            .add_service(self.kv)
            .add_service(self.watch)
            .add_service(self.lease)
            .add_service(self.cluster)
            .add_service(self.maintenance)
            .add_service(self.auth)
    }
}

fn receiver_stream<T: Send + 'static>(rx: mpsc::Receiver<T>) -> impl futures::Stream<Item = T> + Send {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
}
