//! Messages exchanged between members.

use super::types::{EntryPayload, LogEntry, NodeId, Snapshot};
use serde::{Deserialize, Serialize};

/// A Raft message. `term` is the sender's current term; local-only bodies
/// (forwarded proposals and read requests) do not participate in term
/// comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub from: NodeId,
    pub to: NodeId,
    pub term: u64,
    pub body: MessageBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    RequestVote {
        last_log_index: u64,
        last_log_term: u64,
    },
    RequestVoteResponse {
        granted: bool,
    },
    AppendEntries {
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
        /// Highest read-index round this heartbeat confirms.
        read_round: u64,
    },
    AppendEntriesResponse {
        success: bool,
        /// On success, the last index known to match the leader.
        /// On rejection, the `prev_log_index` that did not match.
        index: u64,
        /// On rejection, the highest index the follower may still share
        /// with the leader.
        hint: u64,
        read_round: u64,
    },
    InstallSnapshot {
        snapshot: Snapshot,
    },
    InstallSnapshotResponse {
        last_index: u64,
    },
    /// Proposals forwarded from a follower to the leader.
    Propose {
        payloads: Vec<EntryPayload>,
    },
    /// A follower asks the leader for a read index on behalf of `ctx`.
    ReadIndex {
        ctx: u64,
    },
    ReadIndexResponse {
        ctx: u64,
        /// Zero when the leader could not serve the request.
        index: u64,
    },
}

impl MessageBody {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::RequestVote { .. } => "RequestVote",
            MessageBody::RequestVoteResponse { .. } => "RequestVoteResponse",
            MessageBody::AppendEntries { .. } => "AppendEntries",
            MessageBody::AppendEntriesResponse { .. } => "AppendEntriesResponse",
            MessageBody::InstallSnapshot { .. } => "InstallSnapshot",
            MessageBody::InstallSnapshotResponse { .. } => "InstallSnapshotResponse",
            MessageBody::Propose { .. } => "Propose",
            MessageBody::ReadIndex { .. } => "ReadIndex",
            MessageBody::ReadIndexResponse { .. } => "ReadIndexResponse",
        }
    }

    /// Bodies that bypass term checks.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            MessageBody::Propose { .. }
                | MessageBody::ReadIndex { .. }
                | MessageBody::ReadIndexResponse { .. }
        )
    }
}

/// A resolved linearizable read: once the local apply index reaches `index`,
/// the read identified by `ctx` may be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadState {
    pub ctx: u64,
    /// Zero means the read could not be confirmed.
    pub index: u64,
}
