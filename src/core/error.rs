//! Error types and classification.
//!
//! Every fallible operation in the store returns [`TesseraError`]. Variants are
//! grouped into a small set of [`ErrorKind`]s which the RPC front-end maps onto
//! stable gRPC status codes (see `adapters::etcd::errors`).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why the cluster could not serve a request right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnavailableReason {
    /// No leader is known to this member.
    NoLeader,
    /// The proposal was dropped before it could be committed.
    ProposalDropped,
    /// The request did not complete within the configured timeout.
    Timeout,
    /// Leadership could not be confirmed for a linearizable read.
    LeadershipUnconfirmed,
    /// The member is shutting down.
    Stopped,
}

impl std::fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoLeader => write!(f, "no leader"),
            Self::ProposalDropped => write!(f, "proposal dropped"),
            Self::Timeout => write!(f, "request timed out"),
            Self::LeadershipUnconfirmed => write!(f, "leadership not confirmed"),
            Self::Stopped => write!(f, "server stopped"),
        }
    }
}

/// Coarse classification used for retry decisions and status mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Unavailable,
    PermissionDenied,
    Unauthenticated,
    RevisionCompacted,
    InvalidArgument,
    NotFound,
    AlreadyExists,
    FailedPrecondition,
    Internal,
}

/// Common error conditions.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum TesseraError {
    /// No leader, quorum loss, dropped proposal or timeout. Retryable.
    #[error("unavailable: {reason}")]
    Unavailable { reason: UnavailableReason },

    /// Caller lacks permission for the requested key range or operation.
    #[error("permission denied: {message}")]
    PermissionDenied { message: String },

    /// Auth is enabled and the request carried no usable token.
    #[error("user name is empty")]
    AuthenticationRequired,

    /// The token is unknown or has expired.
    #[error("invalid auth token")]
    InvalidToken,

    /// Username or password did not match.
    #[error("authentication failed, invalid user ID or password")]
    AuthenticationFailed,

    /// Requested revision has been compacted.
    #[error("revision {revision} has been compacted; compaction floor is {compaction_floor}")]
    RevisionCompacted {
        revision: i64,
        compaction_floor: i64,
    },

    /// Requested revision is newer than the store.
    #[error("revision {revision} is a future revision; current revision is {current}")]
    FutureRevision { revision: i64, current: i64 },

    /// Malformed or semantically invalid request.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("lease {lease_id} not found")]
    LeaseNotFound { lease_id: i64 },

    #[error("lease {lease_id} already exists")]
    LeaseExists { lease_id: i64 },

    #[error("user {name} not found")]
    UserNotFound { name: String },

    #[error("user {name} already exists")]
    UserExists { name: String },

    #[error("role {name} not found")]
    RoleNotFound { name: String },

    #[error("role {name} already exists")]
    RoleExists { name: String },

    #[error("role {role} is not granted to user {user}")]
    RoleNotGranted { user: String, role: String },

    #[error("permission is not granted to role {role}")]
    PermissionNotGranted { role: String },

    #[error("member {member_id} not found")]
    MemberNotFound { member_id: u64 },

    #[error("member {member_id} already exists")]
    MemberExists { member_id: u64 },

    /// Operation is not allowed in the current state.
    #[error("failed precondition: {message}")]
    FailedPrecondition { message: String },

    /// Log or snapshot storage failure.
    #[error("storage error: {message}")]
    Storage { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl TesseraError {
    pub fn unavailable(reason: UnavailableReason) -> Self {
        Self::Unavailable { reason }
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::PermissionDenied {
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::FailedPrecondition {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unavailable { .. } => ErrorKind::Unavailable,
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::AuthenticationRequired | Self::InvalidToken | Self::AuthenticationFailed => {
                ErrorKind::Unauthenticated
            }
            Self::RevisionCompacted { .. } => ErrorKind::RevisionCompacted,
            Self::FutureRevision { .. } | Self::InvalidArgument { .. } => {
                ErrorKind::InvalidArgument
            }
            Self::LeaseNotFound { .. }
            | Self::UserNotFound { .. }
            | Self::RoleNotFound { .. }
            | Self::RoleNotGranted { .. }
            | Self::PermissionNotGranted { .. }
            | Self::MemberNotFound { .. } => ErrorKind::NotFound,
            Self::LeaseExists { .. } | Self::UserExists { .. } | Self::RoleExists { .. } => {
                ErrorKind::AlreadyExists
            }
            Self::MemberExists { .. } => ErrorKind::AlreadyExists,
            Self::FailedPrecondition { .. } => ErrorKind::FailedPrecondition,
            Self::Storage { .. } | Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Whether the RPC layer may retry the operation with backoff.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Unavailable
    }
}

impl From<std::io::Error> for TesseraError {
    fn from(err: std::io::Error) -> Self {
        Self::storage(err.to_string())
    }
}

impl From<bincode::Error> for TesseraError {
    fn from(err: bincode::Error) -> Self {
        Self::internal(format!("codec: {}", err))
    }
}

/// Result alias used throughout the crate.
pub type TesseraResult<T> = Result<T, TesseraError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_is_the_only_retryable_kind() {
        assert!(TesseraError::unavailable(UnavailableReason::NoLeader).is_retryable());
        assert!(TesseraError::unavailable(UnavailableReason::Timeout).is_retryable());
        assert!(!TesseraError::permission_denied("x").is_retryable());
        assert!(!TesseraError::invalid_argument("x").is_retryable());
        assert!(!TesseraError::RevisionCompacted {
            revision: 1,
            compaction_floor: 5
        }
        .is_retryable());
    }

    #[test]
    fn kinds_group_variants() {
        assert_eq!(
            TesseraError::FutureRevision {
                revision: 9,
                current: 3
            }
            .kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(TesseraError::InvalidToken.kind(), ErrorKind::Unauthenticated);
        assert_eq!(
            TesseraError::LeaseNotFound { lease_id: 7 }.kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn io_errors_become_storage_errors() {
        let err: TesseraError = std::io::Error::new(std::io::ErrorKind::Other, "disk").into();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.to_string().contains("disk"));
    }
}
