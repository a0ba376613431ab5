//! etcd adapter error mapping.
//!
//! Store errors become gRPC status codes carrying etcd's own message
//! strings, which clients such as etcdctl match on:
//! - unavailable → UNAVAILABLE
//! - compacted or future revision → OUT_OF_RANGE
//! - bad credentials or token → UNAUTHENTICATED
//! - unknown user or role, conflicting state → FAILED_PRECONDITION

use crate::core::error::{TesseraError, UnavailableReason};

/// Convert a [`TesseraError`] to an etcd-compatible error.
pub fn to_etcd_error(err: &TesseraError) -> EtcdError {
    let (code, message) = match err {
        TesseraError::Unavailable { reason } => (
            GrpcCode::Unavailable,
            match reason {
                UnavailableReason::NoLeader => "etcdserver: no leader",
                UnavailableReason::ProposalDropped => {
                    "etcdserver: request timed out, possibly due to previous leader failure"
                }
                UnavailableReason::Timeout => "etcdserver: request timed out",
                UnavailableReason::LeadershipUnconfirmed => "etcdserver: leader changed",
                UnavailableReason::Stopped => "etcdserver: server stopped",
            }
            .to_string(),
        ),
        TesseraError::PermissionDenied { .. } => (
            GrpcCode::PermissionDenied,
            "etcdserver: permission denied".to_string(),
        ),
        TesseraError::AuthenticationRequired => (
            GrpcCode::InvalidArgument,
            "etcdserver: user name is empty".to_string(),
        ),
        TesseraError::InvalidToken => (
            GrpcCode::Unauthenticated,
            "etcdserver: invalid auth token".to_string(),
        ),
        TesseraError::AuthenticationFailed => (
            GrpcCode::InvalidArgument,
            "etcdserver: authentication failed, invalid user ID or password".to_string(),
        ),
        TesseraError::RevisionCompacted { .. } => (
            GrpcCode::OutOfRange,
            "etcdserver: mvcc: required revision has been compacted".to_string(),
        ),
        TesseraError::FutureRevision { .. } => (
            GrpcCode::OutOfRange,
            "etcdserver: mvcc: required revision is a future revision".to_string(),
        ),
        TesseraError::InvalidArgument { message } => {
            (GrpcCode::InvalidArgument, format!("etcdserver: {}", message))
        }
        TesseraError::LeaseNotFound { .. } => (
            GrpcCode::NotFound,
            "etcdserver: requested lease not found".to_string(),
        ),
        TesseraError::LeaseExists { .. } => (
            GrpcCode::FailedPrecondition,
            "etcdserver: lease already exists".to_string(),
        ),
        TesseraError::UserNotFound { .. } => (
            GrpcCode::FailedPrecondition,
            "etcdserver: user name not found".to_string(),
        ),
        TesseraError::UserExists { .. } => (
            GrpcCode::FailedPrecondition,
            "etcdserver: user name already exists".to_string(),
        ),
        TesseraError::RoleNotFound { .. } => (
            GrpcCode::FailedPrecondition,
            "etcdserver: role name not found".to_string(),
        ),
        TesseraError::RoleExists { .. } => (
            GrpcCode::FailedPrecondition,
            "etcdserver: role name already exists".to_string(),
        ),
        TesseraError::RoleNotGranted { .. } => (
            GrpcCode::FailedPrecondition,
            "etcdserver: role is not granted to the user".to_string(),
        ),
        TesseraError::PermissionNotGranted { .. } => (
            GrpcCode::FailedPrecondition,
            "etcdserver: permission is not granted to the role".to_string(),
        ),
        TesseraError::MemberNotFound { .. } => (
            GrpcCode::NotFound,
            "etcdserver: member not found".to_string(),
        ),
        TesseraError::MemberExists { .. } => (
            GrpcCode::FailedPrecondition,
            "etcdserver: member ID already exist".to_string(),
        ),
        TesseraError::FailedPrecondition { message } => {
            (GrpcCode::FailedPrecondition, format!("etcdserver: {}", message))
        }
        TesseraError::Storage { message } | TesseraError::Internal { message } => {
            (GrpcCode::Internal, format!("etcdserver: {}", message))
        }
    };
    EtcdError { code, message }
}

/// The error for a method no service routes.
pub fn unknown_method(path: &str) -> EtcdError {
    EtcdError {
        code: GrpcCode::Unimplemented,
        message: format!("unknown method {}", path),
    }
}

/// gRPC status codes used by etcd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrpcCode {
    InvalidArgument,
    NotFound,
    PermissionDenied,
    FailedPrecondition,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    Unauthenticated,
}

/// etcd error response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtcdError {
    pub code: GrpcCode,
    pub message: String,
}

impl From<TesseraError> for EtcdError {
    fn from(err: TesseraError) -> Self {
        to_etcd_error(&err)
    }
}

#[cfg(feature = "grpc")]
impl From<GrpcCode> for tonic::Code {
    fn from(code: GrpcCode) -> Self {
        match code {
            GrpcCode::InvalidArgument => tonic::Code::InvalidArgument,
            GrpcCode::NotFound => tonic::Code::NotFound,
            GrpcCode::PermissionDenied => tonic::Code::PermissionDenied,
            GrpcCode::FailedPrecondition => tonic::Code::FailedPrecondition,
            GrpcCode::OutOfRange => tonic::Code::OutOfRange,
            GrpcCode::Unimplemented => tonic::Code::Unimplemented,
            GrpcCode::Internal => tonic::Code::Internal,
            GrpcCode::Unavailable => tonic::Code::Unavailable,
            GrpcCode::Unauthenticated => tonic::Code::Unauthenticated,
        }
    }
}

#[cfg(feature = "grpc")]
impl From<EtcdError> for tonic::Status {
    fn from(err: EtcdError) -> Self {
        tonic::Status::new(err.code.into(), err.message)
    }
}

#[cfg(feature = "grpc")]
impl From<TesseraError> for tonic::Status {
    fn from(err: TesseraError) -> Self {
        to_etcd_error(&err).into()
    }
}
