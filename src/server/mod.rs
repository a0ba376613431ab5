//! Member runtime: proposal tracking, the apply task and leader duties.
//!
//! - [`member`] - the [`Member`] handle served by the RPC front-end
//! - [`apply`] - the single writer of the state machine
//! - [`retry`] - backoff for transient unavailability
//! - [`wait`] - proposer/apply rendezvous

pub(crate) mod apply;
pub mod member;
pub mod retry;
pub mod wait;

pub use member::{LeaseGrant, Member, MemberOptions, MemberStatus, MemberTasks};
pub use retry::RetryPolicy;
