//! Tessera - a Raft-replicated, multi-version key-value store that serves
//! the etcd v3 gRPC API.
//!
//! A cluster is a small, fixed-size group of members. Every mutation is
//! proposed to the Raft log, and once committed it is applied in log order
//! to a deterministic state machine on each member. That state machine holds
//! the MVCC key history, leases, users and roles, and the watch hub.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │               etcd v3 gRPC (KV, Watch, Lease, ...)              │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Member (server::member)                     │
//! │     proposals │ linearizable reads │ lease expiry │ compaction  │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      State machine (kv)                         │
//! │          MVCC │ Txn │ Leases │ Auth │ Watches │ Dedup           │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  Raft (raft) over a LogStore (storage)          │
//! │           elections │ replication │ read index │ snapshots      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! - [`core`] - configuration, errors, runtime, clocks
//! - [`storage`] - write-ahead log, snapshots, in-memory store
//! - [`raft`] - consensus core, sequencer and peer transport seam
//! - [`kv`] - the replicated state machine
//! - [`server`] - the member: proposal tracking, apply task, leader duties
//! - [`adapters`] - the etcd v3 front-end
//! - [`net`] - peer transport over gRPC and listener TLS
//! - [`cli`] - command-line entry points
//!
//! # Key Invariants
//!
//! - The store revision never decreases and every applied mutation that
//!   changes data raises it by exactly one.
//! - All members apply the same committed entries in the same order and
//!   reach the same state; nothing on the apply path reads wall time.
//! - Linearizable reads are served only after the leader confirms its
//!   leadership for a commit index the local member has applied.
//! - Watch events are delivered in revision order without gaps.

pub mod core;

pub mod storage;

pub mod raft;

pub mod kv;

pub mod server;

pub mod adapters;

pub mod net;

pub mod cli;

pub use self::core::{config, error, runtime, time};
pub use self::core::error::{TesseraError, TesseraResult};
pub use adapters::etcd;
pub use server::{Member, MemberOptions};
