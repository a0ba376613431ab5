//! Core consensus data types shared by the log store and the Raft core.

use serde::{Deserialize, Serialize};

/// Cluster-unique member identifier. Zero is reserved for "none".
pub type NodeId = u64;

/// Persistent per-member consensus state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub voted_for: Option<NodeId>,
    pub commit: u64,
}

/// A single replicated log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub payload: EntryPayload,
}

impl LogEntry {
    pub fn new(index: u64, term: u64, payload: EntryPayload) -> Self {
        Self {
            index,
            term,
            payload,
        }
    }

    /// Rough in-memory size, used to bound replication batches.
    pub fn approx_size(&self) -> usize {
        24 + match &self.payload {
            EntryPayload::Noop => 0,
            EntryPayload::Command(data) => data.len(),
            EntryPayload::ConfChange(_) => 64,
        }
    }
}

/// What an entry carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// Appended by a new leader to commit entries from earlier terms.
    Noop,
    /// An encoded state machine request.
    Command(Vec<u8>),
    /// A single-server membership change.
    ConfChange(ConfChange),
}

/// Static description of a cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub id: NodeId,
    pub name: String,
    pub peer_addr: String,
    pub client_addr: String,
}

impl MemberInfo {
    pub fn new(id: NodeId, name: impl Into<String>, peer_addr: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            peer_addr: peer_addr.into(),
            client_addr: String::new(),
        }
    }

    pub fn with_client_addr(mut self, addr: impl Into<String>) -> Self {
        self.client_addr = addr.into();
        self
    }
}

/// A membership change proposal. `change_id` correlates the committed entry
/// with the waiting proposer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfChange {
    pub change_id: u64,
    pub kind: ConfChangeKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfChangeKind {
    AddMember(MemberInfo),
    RemoveMember(NodeId),
    UpdateMember(MemberInfo),
}

/// Identifies the log position a snapshot covers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub last_index: u64,
    pub last_term: u64,
    pub members: Vec<MemberInfo>,
}

/// A point-in-time image of the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    pub data: Vec<u8>,
}

/// Role of a member within its current term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
        }
    }
}
