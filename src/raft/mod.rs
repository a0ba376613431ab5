//! Raft consensus.
//!
//! - [`core`] - deterministic Raft state machine (elections, replication,
//!   read index, snapshots, single-server membership changes)
//! - [`node`] - tokio sequencer that drives a core
//! - [`transport`] - peer message delivery seam and the in-process network
//! - [`membership`], [`progress`], [`message`], [`types`] - supporting types

pub mod core;
pub mod membership;
pub mod message;
pub mod node;
pub mod progress;
pub mod transport;
pub mod types;

pub use self::core::{ProposeOutcome, RaftConfig, RaftCore, RaftStatus, Ready};
pub use membership::Membership;
pub use message::{Message, MessageBody, ReadState};
pub use node::{ApplyMsg, NodeOptions, RaftHandle};
pub use transport::{LocalNetwork, LocalTransport, Transport};
pub use types::{
    ConfChange, ConfChangeKind, EntryPayload, HardState, LogEntry, MemberInfo, NodeId, Role,
    Snapshot, SnapshotMeta,
};
