//! Client-facing protocol front-ends.
//!
//! Each adapter translates a wire protocol into calls on
//! [`crate::server::Member`]. Only the etcd v3 API is served.

pub mod etcd;
