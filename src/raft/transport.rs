//! Message delivery between members.
//!
//! The sequencer hands every outbound [`Message`] to a [`Transport`]. Delivery
//! is best effort: Raft tolerates loss, duplication and reordering, so
//! implementations may drop messages under pressure instead of blocking.

use super::message::Message;
use super::types::{MemberInfo, NodeId};
use crate::core::error::{TesseraError, TesseraResult, UnavailableReason};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Outbound side of the peer network.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Deliver one message to `msg.to`.
    async fn send(&self, msg: Message) -> TesseraResult<()>;

    /// Learn (or refresh) a peer's address.
    fn update_peer(&self, member: &MemberInfo);

    /// Forget a peer.
    fn remove_peer(&self, id: NodeId);
}

/// In-process network connecting members of one test cluster.
///
/// Each registered member owns an inbox; partitions are modelled by
/// isolating members, which silently drops traffic to and from them.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    inner: Arc<RwLock<LocalNetworkInner>>,
}

#[derive(Default)]
struct LocalNetworkInner {
    inboxes: HashMap<NodeId, mpsc::Sender<Message>>,
    isolated: HashSet<NodeId>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a member and return its inbox together with a transport
    /// that sends on its behalf.
    pub fn register(&self, id: NodeId, capacity: usize) -> (LocalTransport, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity);
        self.inner.write().inboxes.insert(id, tx);
        (
            LocalTransport {
                id,
                network: self.clone(),
            },
            rx,
        )
    }

    pub fn unregister(&self, id: NodeId) {
        self.inner.write().inboxes.remove(&id);
    }

    /// Drop all traffic to and from `id`.
    pub fn isolate(&self, id: NodeId) {
        self.inner.write().isolated.insert(id);
    }

    pub fn heal(&self, id: NodeId) {
        self.inner.write().isolated.remove(&id);
    }

    pub fn heal_all(&self) {
        self.inner.write().isolated.clear();
    }

    fn deliver(&self, msg: Message) -> TesseraResult<()> {
        let inbox = {
            let inner = self.inner.read();
            if inner.isolated.contains(&msg.from) || inner.isolated.contains(&msg.to) {
                return Ok(());
            }
            inner.inboxes.get(&msg.to).cloned()
        };
        let Some(inbox) = inbox else {
            return Err(TesseraError::unavailable(UnavailableReason::Stopped));
        };
        // A full inbox behaves like a lossy link.
        match inbox.try_send(msg) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(TesseraError::unavailable(UnavailableReason::Stopped))
            }
        }
    }
}

/// A member's view of a [`LocalNetwork`].
#[derive(Clone)]
pub struct LocalTransport {
    id: NodeId,
    network: LocalNetwork,
}

impl LocalTransport {
    pub fn id(&self) -> NodeId {
        self.id
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(&self, msg: Message) -> TesseraResult<()> {
        self.network.deliver(msg)
    }

    fn update_peer(&self, _member: &MemberInfo) {}

    fn remove_peer(&self, _id: NodeId) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::message::MessageBody;

    fn vote(from: NodeId, to: NodeId) -> Message {
        Message {
            from,
            to,
            term: 1,
            body: MessageBody::RequestVoteResponse { granted: true },
        }
    }

    #[tokio::test]
    async fn isolated_members_neither_send_nor_receive() {
        let net = LocalNetwork::new();
        let (t1, _rx1) = net.register(1, 8);
        let (_t2, mut rx2) = net.register(2, 8);

        t1.send(vote(1, 2)).await.unwrap();
        assert_eq!(rx2.recv().await.unwrap().from, 1);

        net.isolate(2);
        t1.send(vote(1, 2)).await.unwrap();
        assert!(rx2.try_recv().is_err());

        net.heal_all();
        t1.send(vote(1, 2)).await.unwrap();
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn unknown_destination_is_unavailable() {
        let net = LocalNetwork::new();
        let (t1, _rx1) = net.register(1, 8);
        assert!(t1.send(vote(1, 9)).await.unwrap_err().is_retryable());
    }
}
