//! The replicated key-value state machine.
//!
//! - [`mvcc`] - multi-version key history, ranges and compaction
//! - [`txn`] - compare/then/else execution over one revision
//! - [`lease`] - lease table driven by applied ticks
//! - [`auth`] - users, roles and key-range permissions
//! - [`watch`] - ordered change delivery to observers
//! - [`state_machine`] - applies committed entries to all of the above

pub mod auth;
pub mod dedup;
pub mod lease;
pub mod mvcc;
pub mod request;
pub mod state_machine;
pub mod txn;
pub mod watch;

pub use auth::{AuthOp, AuthOpResponse, AuthStore, Permission, PermissionType};
pub use lease::{Lease, LeaseTable, LeaseTimeToLive};
pub use mvcc::{in_range, prefix_end, KvStore};
pub use request::{
    ApplyOutcome, Compare, CompareResult, CompareTarget, DeleteRangeRequest, DeleteRangeResponse,
    Event, EventKind, KeyValue, OpResponse, Operation, Principal, PutRequest, PutResponse,
    RangeRequest, RangeResponse, Request, RequestId, RequestOp, Response, ResponseOp, SortOrder,
    SortTarget, TxnRequest, TxnResponse,
};
pub use state_machine::{Applied, RevisionEvents, StateMachine};
pub use watch::{Subscription, WatchFilters, WatchHub, WatchId, WatchNotice, WatchRequest};
