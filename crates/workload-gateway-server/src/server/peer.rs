//! Caller identity carried on accepted connections.
//!
//! The listener captures who is on the other end of each connection at accept
//! time (`SO_PEERCRED` for Unix sockets, the remote address for TCP). The
//! [`Credentials`] provider wraps the accepted stream in an [`AttestedConn`]
//! whose [`Connected`] implementation hands the [`Caller`] to tonic, which
//! inserts it into the extensions of every request on that connection.
//! Services and middleware recover it with
//! `request.extensions().get::<Caller>()`.

use crate::server::telemetry::Metrics;
use core::fmt;
use core::pin::Pin;
use core::task::{Context, Poll};
use futures::{Stream, StreamExt};
use pin_project_lite::pin_project;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tonic::transport::server::Connected;

/// The peer of a connection as seen by the kernel.
///
/// Local-socket callers carry their process credentials. TCP callers only
/// carry their remote address, so services treat them as unattested.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Caller {
    pub pid: Option<i32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub remote_addr: Option<SocketAddr>,
}

impl Caller {
    pub fn local(pid: Option<i32>, uid: u32, gid: u32) -> Self {
        Self {
            pid,
            uid: Some(uid),
            gid: Some(gid),
            remote_addr: None,
        }
    }

    pub fn remote(addr: SocketAddr) -> Self {
        Self {
            remote_addr: Some(addr),
            ..Self::default()
        }
    }

    /// Whether the caller is a process on this host with known credentials.
    pub fn is_local_process(&self) -> bool {
        self.pid.is_some() && self.uid.is_some()
    }
}

impl fmt::Display for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.pid, self.uid, self.remote_addr) {
            (Some(pid), Some(uid), _) => write!(f, "pid {pid} (uid {uid})"),
            (None, Some(uid), _) => write!(f, "unknown pid (uid {uid})"),
            (_, _, Some(addr)) => write!(f, "{addr}"),
            _ => f.write_str("unknown caller"),
        }
    }
}

pin_project! {
    /// An accepted connection tagged with its [`Caller`].
    pub struct AttestedConn<IO> {
        #[pin]
        io: IO,
        caller: Caller,
    }
}

impl<IO> AttestedConn<IO> {
    pub fn caller(&self) -> &Caller {
        &self.caller
    }
}

impl<IO> Connected for AttestedConn<IO> {
    type ConnectInfo = Caller;

    fn connect_info(&self) -> Self::ConnectInfo {
        self.caller.clone()
    }
}

impl<IO: AsyncRead> AsyncRead for AttestedConn<IO> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.project().io.poll_read(cx, buf)
    }
}

impl<IO: AsyncWrite> AsyncWrite for AttestedConn<IO> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().io.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().io.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().io.poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        self.project().io.poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.io.is_write_vectored()
    }
}

/// Transport credentials installed on the server: turns the listener's
/// `(stream, caller)` pairs into [`AttestedConn`]s.
#[derive(Clone, Debug, Default)]
pub struct Credentials {
    metrics: Metrics,
}

impl Credentials {
    pub fn new(metrics: Metrics) -> Self {
        Self { metrics }
    }

    pub fn wrap<IO>(&self, io: IO, caller: Caller) -> AttestedConn<IO> {
        tracing::trace!(%caller, "accepted connection");
        self.metrics.record_connection(caller.is_local_process());
        AttestedConn { io, caller }
    }

    /// Applies the credentials to every connection yielded by `incoming`.
    pub fn apply<S, IO>(self, incoming: S) -> impl Stream<Item = io::Result<AttestedConn<IO>>>
    where
        S: Stream<Item = io::Result<(IO, Caller)>>,
    {
        incoming.map(move |accepted| accepted.map(|(io, caller)| self.wrap(io, caller)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn local_and_remote_callers() {
        let local = Caller::local(Some(42), 1000, 1000);
        assert!(local.is_local_process());
        assert_eq!(local.to_string(), "pid 42 (uid 1000)");

        let remote = Caller::remote("127.0.0.1:9000".parse().unwrap());
        assert!(!remote.is_local_process());
        assert_eq!(remote.to_string(), "127.0.0.1:9000");
    }

    #[tokio::test]
    async fn attested_conn_is_transparent() {
        let (client, server) = tokio::io::duplex(64);
        let caller = Caller::local(Some(7), 0, 0);
        let mut conn = Credentials::default().wrap(server, caller.clone());
        assert_eq!(conn.connect_info(), caller);

        let mut client = client;
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        conn.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn apply_wraps_every_connection() {
        let (a, _a_peer) = tokio::io::duplex(8);
        let (b, _b_peer) = tokio::io::duplex(8);
        let incoming = futures::stream::iter(vec![
            Ok((a, Caller::local(Some(1), 0, 0))),
            Err(io::Error::from(io::ErrorKind::ConnectionAborted)),
            Ok((b, Caller::local(Some(2), 0, 0))),
        ]);

        let conns: Vec<_> = Credentials::default().apply(incoming).collect().await;
        assert_eq!(conns.len(), 3);
        assert_eq!(conns[0].as_ref().unwrap().caller().pid, Some(1));
        assert!(conns[1].is_err());
        assert_eq!(conns[2].as_ref().unwrap().caller().pid, Some(2));
    }
}
