//! Raft traffic between members over gRPC.
//!
//! Each Raft message travels as one unary `tesserapb.Raft/Step` call whose
//! body is a [`RaftEnvelope`] holding the bincode-encoded [`Message`]. The
//! receiving side drops the message into the member's inbox and acks
//! immediately; Raft itself copes with loss.

use crate::adapters::etcd::proto::{RaftAck, RaftEnvelope};
use crate::core::error::{TesseraError, TesseraResult, UnavailableReason};
use crate::raft::message::Message;
use crate::raft::transport::Transport;
use crate::raft::types::{MemberInfo, NodeId};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::convert::Infallible;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tonic::codec::ProstCodec;
use tonic::codegen::{empty_body, http, Body, BoxFuture, StdError};
use tonic::server::{Grpc, NamedService, UnaryService};
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Response, Status};

/// Fully qualified method path of the step call.
pub const STEP_PATH: &str = "/tesserapb.Raft/Step";

pub fn encode_message(msg: &Message) -> TesseraResult<RaftEnvelope> {
    Ok(RaftEnvelope {
        data: bincode::serialize(msg)?,
    })
}

pub fn decode_message(envelope: &RaftEnvelope) -> TesseraResult<Message> {
    Ok(bincode::deserialize(&envelope.data)?)
}

/// Turn a configured peer address into a dialable URI.
fn peer_uri(addr: &str) -> String {
    if addr.contains("://") {
        addr.to_string()
    } else {
        format!("http://{}", addr)
    }
}

// ============================================================================
// Server
// ============================================================================

/// Inbound side: accepts `Step` calls and feeds the local inbox.
#[derive(Clone)]
pub struct PeerServer {
    id: NodeId,
    inbox: mpsc::Sender<Message>,
}

impl PeerServer {
    pub fn new(id: NodeId, inbox: mpsc::Sender<Message>) -> Self {
        Self { id, inbox }
    }

    /// Queue one inbound message. A full inbox drops it.
    pub fn deliver(&self, envelope: &RaftEnvelope) -> TesseraResult<()> {
        let msg = decode_message(envelope)?;
        if msg.to != self.id {
            return Err(TesseraError::invalid_argument(format!(
                "message for member {:x} delivered to {:x}",
                msg.to, self.id
            )));
        }
        match self.inbox.try_send(msg) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(msg)) => {
                tracing::debug!(
                    member_id = self.id,
                    from = msg.from,
                    kind = msg.body.kind(),
                    "inbox full, dropping message"
                );
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(TesseraError::unavailable(UnavailableReason::Stopped))
            }
        }
    }
}

struct Step(PeerServer);

impl UnaryService<RaftEnvelope> for Step {
    type Response = RaftAck;
    type Future = BoxFuture<Response<RaftAck>, Status>;

    fn call(&mut self, request: Request<RaftEnvelope>) -> Self::Future {
        let result = self.0.deliver(request.get_ref());
        Box::pin(async move {
            result
                .map(|()| Response::new(RaftAck {}))
                .map_err(Status::from)
        })
    }
}

impl<B> tonic::codegen::Service<http::Request<B>> for PeerServer
where
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<tonic::body::BoxBody>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        if req.uri().path() == STEP_PATH {
            let step = Step(self.clone());
            return Box::pin(async move {
                let mut grpc = Grpc::new(ProstCodec::<RaftAck, RaftEnvelope>::default());
                Ok(grpc.unary(step, req).await)
            });
        }
        Box::pin(async move {
            let mut response = http::Response::new(empty_body());
            let headers = response.headers_mut();
            headers.insert(Status::GRPC_STATUS, (tonic::Code::Unimplemented as i32).into());
            headers.insert(http::header::CONTENT_TYPE, tonic::metadata::GRPC_CONTENT_TYPE);
            Ok(response)
        })
    }
}

impl NamedService for PeerServer {
    const NAME: &'static str = "tesserapb.Raft";
}

// ============================================================================
// Client
// ============================================================================

struct Peer {
    addr: String,
    channel: Channel,
}

/// Outbound side: one lazily connected channel per peer.
pub struct GrpcTransport {
    id: NodeId,
    timeout: Duration,
    peers: RwLock<HashMap<NodeId, Peer>>,
}

impl GrpcTransport {
    pub fn new(id: NodeId, timeout: Duration) -> Self {
        Self {
            id,
            timeout,
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn peer_addr(&self, id: NodeId) -> Option<String> {
        self.peers.read().get(&id).map(|p| p.addr.clone())
    }

    fn channel(&self, id: NodeId) -> Option<Channel> {
        self.peers.read().get(&id).map(|p| p.channel.clone())
    }
}

#[async_trait]
impl Transport for GrpcTransport {
    async fn send(&self, msg: Message) -> TesseraResult<()> {
        let channel = self
            .channel(msg.to)
            .ok_or(TesseraError::MemberNotFound { member_id: msg.to })?;
        let envelope = encode_message(&msg)?;

        let mut client = tonic::client::Grpc::new(channel);
        client.ready().await.map_err(|e| {
            tracing::trace!(peer = msg.to, error = %e, "peer channel not ready");
            TesseraError::unavailable(UnavailableReason::Timeout)
        })?;
        let path = http::uri::PathAndQuery::from_static(STEP_PATH);
        let codec = ProstCodec::<RaftEnvelope, RaftAck>::default();
        client
            .unary(Request::new(envelope), path, codec)
            .await
            .map(|_| ())
            .map_err(|status| {
                tracing::trace!(peer = msg.to, code = ?status.code(), "step rejected");
                TesseraError::unavailable(UnavailableReason::Timeout)
            })
    }

    fn update_peer(&self, member: &MemberInfo) {
        if member.id == self.id || member.peer_addr.is_empty() {
            return;
        }
        if self.peer_addr(member.id).as_deref() == Some(member.peer_addr.as_str()) {
            return;
        }
        let endpoint = match Endpoint::from_shared(peer_uri(&member.peer_addr)) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                tracing::warn!(peer = member.id, addr = %member.peer_addr, error = %e, "invalid peer address");
                return;
            }
        };
        let channel = endpoint
            .connect_timeout(self.timeout)
            .timeout(self.timeout)
            .connect_lazy();
        tracing::info!(peer = member.id, addr = %member.peer_addr, "peer address updated");
        self.peers.write().insert(
            member.id,
            Peer {
                addr: member.peer_addr.clone(),
                channel,
            },
        );
    }

    fn remove_peer(&self, id: NodeId) {
        if self.peers.write().remove(&id).is_some() {
            tracing::info!(peer = id, "peer removed");
        }
    }
}
