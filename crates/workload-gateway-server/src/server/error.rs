//! Errors returned by [`Endpoint::run`](crate::server::endpoint::Endpoint::run).
//!
//! Listener setup failures carry the stage that failed in their message, so
//! the caller can log the error as-is. `ServerStopped` is the graceful-stop
//! sentinel: the shutdown path converts it into `Ok(())` and it is never
//! returned from `run`.

use std::io;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The bind address names a transport other than `unix` or `tcp`.
    #[error("unknown network {0}")]
    UnknownNetwork(String),

    #[error("create UDS listener: {0}")]
    CreateUdsListener(io::Error),

    #[error("unable to change UDS permissions: {0}")]
    UdsPermissions(io::Error),

    #[error("create TCP listener: {0}")]
    CreateTcpListener(io::Error),

    #[error("serve: {0}")]
    Serve(#[from] tonic::transport::Error),

    /// The serve loop returned without being asked to stop, which only
    /// happens when the listener stops yielding connections.
    #[error("listener closed")]
    ListenerClosed,

    #[error("server stopped")]
    ServerStopped,

    #[error("serve task exited without reporting a result")]
    ServeTaskAborted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_errors_name_their_stage() {
        let err = Error::CreateUdsListener(io::Error::from(io::ErrorKind::AddrInUse));
        assert!(err.to_string().starts_with("create UDS listener: "));

        let err = Error::UdsPermissions(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(err.to_string().starts_with("unable to change UDS permissions: "));

        let err = Error::CreateTcpListener(io::Error::from(io::ErrorKind::AddrInUse));
        assert!(err.to_string().starts_with("create TCP listener: "));
    }

    #[test]
    fn unknown_network_names_the_network() {
        assert_eq!(
            Error::UnknownNetwork("udp".into()).to_string(),
            "unknown network udp"
        );
    }
}
