//! etcd v3 gRPC front-end.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      etcd v3 gRPC (grpc)                    │
//! ├──────────┬──────────┬──────────┬──────────┬────────┬────────┤
//! │    KV    │  Watch   │  Lease   │ Cluster  │  Auth  │ Maint. │
//! └──────────┴──────────┴──────────┴──────────┴────────┴────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   EtcdService (service)                     │
//! │  - token → principal                                        │
//! │  - wire ↔ store conversion (kv)                             │
//! │  - watch sessions                                           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     server::Member                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`proto`] - etcd wire messages
//! - [`kv`] - wire ↔ store conversions
//! - [`service`] - request handlers and watch sessions
//! - [`grpc`] - tonic service wrappers
//! - [`auth`] - token extraction from request metadata
//! - [`errors`] - error mapping to gRPC status codes

pub mod auth;
pub mod errors;
#[cfg(feature = "grpc")]
pub mod grpc;
pub mod kv;
pub mod proto;
pub mod service;

pub use auth::extract_token;
pub use errors::{to_etcd_error, EtcdError, GrpcCode};
#[cfg(feature = "grpc")]
pub use grpc::EtcdServices;
pub use service::{EtcdService, WatchSession, SERVER_VERSION};
