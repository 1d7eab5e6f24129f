//! Listener construction for the endpoint.
//!
//! [`ListenerFactory`] binds exactly one of the two supported transports and
//! returns a [`Listener`]: a stream of accepted connections, each paired with
//! the [`Caller`] observed at accept time.
//!
//! ## Unix domain sockets
//!
//! 1. Any stale entry at the socket path is removed. Only "not found" is
//!    tolerated; every other removal failure aborts the bind.
//! 2. The socket is bound.
//! 3. The socket file is made world-connectable (`0o777`). Authorization
//!    happens on the attested caller identity, not on file permissions.
//!
//! The socket file is unlinked when the listener is dropped, so every exit
//! path out of the serve loop releases it. The file is only removed while it
//! is still the one this listener bound; a socket another process has since
//! bound at the same path is left alone.
//!
//! ## TCP
//!
//! TCP peers are not local processes; their [`Caller`] only carries the
//! remote address.

use crate::server::{
    address::BindAddr,
    error::{Error, Result},
    peer::Caller,
};
use core::pin::Pin;
use core::task::{Context, Poll};
use futures::Stream;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::Span;

#[cfg(unix)]
use std::path::PathBuf;
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

/// Mode applied to the socket file after bind.
#[cfg(unix)]
pub const SOCKET_MODE: u32 = 0o777;

/// A bound listener yielding attested connections.
pub trait Listener: Stream<Item = io::Result<(Self::Io, Caller)>> + Send + Unpin + 'static {
    type Io: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// The address actually bound. For TCP binds on port `0` this carries the
    /// port chosen by the OS.
    fn local_addr(&self) -> BindAddr;
}

#[derive(Clone, Debug)]
pub struct ListenerFactory {
    log: Span,
}

impl ListenerFactory {
    pub fn new(log: Span) -> Self {
        Self { log }
    }

    #[cfg(unix)]
    pub async fn listen_unix(&self, path: &Path) -> Result<UnixIncoming> {
        remove_stale_socket(path)
            .await
            .map_err(Error::CreateUdsListener)?;

        let listener = UnixListener::bind(path).map_err(Error::CreateUdsListener)?;
        // Constructed before the chmod so a permission failure still unlinks
        // the socket on drop.
        let incoming = UnixIncoming {
            listener,
            path: path.to_path_buf(),
            inode: socket_inode(path),
            log: self.log.clone(),
        };

        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(SOCKET_MODE);
            tokio::fs::set_permissions(path, perms)
                .await
                .map_err(Error::UdsPermissions)?;
        }

        Ok(incoming)
    }

    #[cfg(not(unix))]
    pub async fn listen_unix(&self, _path: &Path) -> Result<TcpIncoming> {
        Err(Error::CreateUdsListener(io::Error::new(
            io::ErrorKind::Unsupported,
            "Unix domain sockets are not supported on this platform",
        )))
    }

    pub async fn listen_tcp(&self, addr: SocketAddr) -> Result<TcpIncoming> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(Error::CreateTcpListener)?;
        let local_addr = listener.local_addr().map_err(Error::CreateTcpListener)?;
        Ok(TcpIncoming {
            listener,
            local_addr,
        })
    }
}

async fn remove_stale_socket(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(unix)]
fn socket_inode(path: &Path) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    std::fs::symlink_metadata(path).ok().map(|meta| meta.ino())
}

#[cfg(unix)]
#[derive(Debug)]
pub struct UnixIncoming {
    listener: UnixListener,
    path: PathBuf,
    /// Inode of the socket file right after bind.
    inode: Option<u64>,
    log: Span,
}

#[cfg(unix)]
impl Stream for UnixIncoming {
    type Item = io::Result<(UnixStream, Caller)>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let stream = match this.listener.poll_accept(cx) {
            Poll::Ready(Ok((stream, _))) => stream,
            Poll::Ready(Err(err)) => return Poll::Ready(Some(Err(err))),
            Poll::Pending => return Poll::Pending,
        };

        let caller = match stream.peer_cred() {
            Ok(cred) => Caller::local(cred.pid(), cred.uid(), cred.gid()),
            Err(err) => {
                tracing::warn!(parent: &this.log, error = %err, "Unable to read peer credentials");
                Caller::default()
            }
        };

        Poll::Ready(Some(Ok((stream, caller))))
    }
}

#[cfg(unix)]
impl Listener for UnixIncoming {
    type Io = UnixStream;

    fn local_addr(&self) -> BindAddr {
        BindAddr::Unix(self.path.clone())
    }
}

#[cfg(unix)]
impl Drop for UnixIncoming {
    fn drop(&mut self) {
        if self.inode.is_some() && socket_inode(&self.path) == self.inode {
            let _ = std::fs::remove_file(&self.path);
        } else {
            tracing::debug!(
                parent: &self.log,
                path = %self.path.display(),
                "Socket file is no longer ours, leaving it in place"
            );
        }
    }
}

#[derive(Debug)]
pub struct TcpIncoming {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Stream for TcpIncoming {
    type Item = io::Result<(TcpStream, Caller)>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.listener.poll_accept(cx) {
            Poll::Ready(Ok((stream, addr))) => Poll::Ready(Some(Ok((stream, Caller::remote(addr))))),
            Poll::Ready(Err(err)) => Poll::Ready(Some(Err(err))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Listener for TcpIncoming {
    type Io = TcpStream;

    fn local_addr(&self) -> BindAddr {
        BindAddr::Tcp(self.local_addr)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::os::unix::fs::PermissionsExt;

    fn factory() -> ListenerFactory {
        ListenerFactory::new(Span::none())
    }

    #[tokio::test]
    async fn stale_socket_does_not_block_rebind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.sock");
        std::fs::write(&path, b"leftover").unwrap();

        let listener = factory().listen_unix(&path).await.unwrap();
        assert_eq!(listener.local_addr(), BindAddr::Unix(path.clone()));
    }

    #[tokio::test]
    async fn socket_is_world_connectable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.sock");

        let _listener = factory().listen_unix(&path).await.unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, SOCKET_MODE);
    }

    #[tokio::test]
    async fn unremovable_entry_fails_the_bind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.sock");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("keep"), b"x").unwrap();

        let err = factory().listen_unix(&path).await.unwrap_err();
        assert!(matches!(err, Error::CreateUdsListener(_)), "{err}");
    }

    #[tokio::test]
    async fn missing_parent_directory_fails_the_bind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("agent.sock");

        let err = factory().listen_unix(&path).await.unwrap_err();
        assert!(err.to_string().starts_with("create UDS listener: "));
    }

    #[tokio::test]
    async fn socket_file_is_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.sock");

        let listener = factory().listen_unix(&path).await.unwrap();
        assert!(path.exists());
        drop(listener);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn socket_rebound_elsewhere_survives_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.sock");

        let ours = factory().listen_unix(&path).await.unwrap();
        std::fs::remove_file(&path).unwrap();
        let theirs = std::os::unix::net::UnixListener::bind(&path).unwrap();

        drop(ours);
        assert!(path.exists());
        UnixStream::connect(&path).await.unwrap();
        drop(theirs);
    }

    #[tokio::test]
    async fn unix_connections_carry_process_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.sock");
        let mut listener = factory().listen_unix(&path).await.unwrap();

        let _client = UnixStream::connect(&path).await.unwrap();
        let (_stream, caller) = listener.next().await.unwrap().unwrap();

        assert_eq!(caller.pid, Some(std::process::id() as i32));
        assert!(caller.is_local_process());
    }

    #[tokio::test]
    async fn tcp_port_zero_resolves_to_bound_port() {
        let listener = factory()
            .listen_tcp("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let BindAddr::Tcp(addr) = listener.local_addr() else {
            panic!("expected a TCP address");
        };
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn tcp_connections_carry_remote_address() {
        let mut listener = factory()
            .listen_tcp("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let BindAddr::Tcp(addr) = listener.local_addr() else {
            panic!("expected a TCP address");
        };

        let client = TcpStream::connect(addr).await.unwrap();
        let (_stream, caller) = listener.next().await.unwrap().unwrap();

        assert_eq!(caller.remote_addr, Some(client.local_addr().unwrap()));
        assert!(!caller.is_local_process());
    }

    #[tokio::test]
    async fn tcp_bind_conflict_is_labelled() {
        let first = factory()
            .listen_tcp("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let BindAddr::Tcp(addr) = first.local_addr() else {
            panic!("expected a TCP address");
        };

        let err = factory().listen_tcp(addr).await.unwrap_err();
        assert!(matches!(err, Error::CreateTcpListener(_)), "{err}");
    }
}
