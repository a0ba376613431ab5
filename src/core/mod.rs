//! Process-level infrastructure.
//!
//! - [`config`] - configuration parsing and validation
//! - [`runtime`] - member and listener lifecycle
//! - [`time`] - tick clock shared by leases, tokens and tests
//! - [`error`] - error types

pub mod config;
pub mod error;
pub mod runtime;
pub mod time;
