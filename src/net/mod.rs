//! Networking layer.
//!
//! - [`peer`] - Raft message transport between members (gRPC)
//! - [`tls`] - certificate loading for the client listener

#[cfg(feature = "grpc")]
pub mod peer;
pub mod tls;

#[cfg(feature = "grpc")]
pub use peer::{GrpcTransport, PeerServer};
pub use tls::{TlsIdentity, TlsPaths};
