//! Error types for the workload gateway services.
//!
//! This module defines the central `Error` enum, which captures every
//! reportable failure inside the Workload API and SDS handlers. It implements
//! `From<Error>` for `tonic::Status` so handlers can propagate with `?` and
//! clients receive an appropriate status code and message.
//!
//! ## Error Cases
//! - `PermissionDenied`: the caller is attested but has no identity that
//!   allows the call.
//! - `Unauthenticated`: the caller's process identity could not be attested.
//! - `InvalidArgument`: the request was malformed or missing required data.
//! - `Unavailable`: the identity manager cannot serve this kind of request.
//! - `Manager`: the identity manager failed internally.
//! - `Unimplemented`: the RPC is intentionally not served.
//! - `ServiceShutdown`: a request arrived while the endpoint was stopping.

use tonic::Status;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the endpoint services.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("Permission denied: {reason}")]
    PermissionDenied { reason: String },

    #[error("Caller could not be attested: {reason}")]
    Unauthenticated { reason: String },

    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("Unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Identity manager error: {context}")]
    Manager { context: String },

    #[error("Method not implemented: {method}")]
    Unimplemented { method: &'static str },

    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl Error {
    pub fn permission_denied(reason: impl Into<String>) -> Self {
        Self::PermissionDenied {
            reason: reason.into(),
        }
    }

    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::PermissionDenied { reason } => Status::permission_denied(reason),
            Error::Unauthenticated { reason } => Status::unauthenticated(reason),
            Error::InvalidArgument { reason } => Status::invalid_argument(reason),
            Error::Unavailable { reason } => Status::unavailable(reason),
            Error::Manager { context } => {
                Status::internal(format!("Identity manager error: {context}"))
            }
            Error::Unimplemented { method } => {
                Status::unimplemented(format!("Method not implemented: {method}"))
            }
            Error::ServiceShutdown => Status::unavailable("Service is shutting down"),
        }
    }
}
