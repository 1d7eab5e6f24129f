//! Peer attestation: turning a connection's [`Caller`] into selectors.
//!
//! The credentials captured at accept time only say *which process* is on
//! the other end. An [`Attestor`] turns that into the [`Selector`]s the
//! identity manager matches registration entries against.

use crate::server::peer::Caller;
use futures::future::BoxFuture;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tonic::Request;
use workload_gateway_core::{Error, Result, types::Selector};

pub const UNIX_SELECTOR: &str = "unix";

#[tonic::async_trait]
pub trait Attestor: Send + Sync + 'static {
    async fn attest(&self, caller: &Caller) -> Result<Vec<Selector>>;
}

/// Attests local processes from their kernel credentials.
///
/// Emits `unix:uid:<uid>`, `unix:gid:<gid>` and, when the executable can be
/// resolved through procfs, `unix:path:<exe>`. Callers without process
/// credentials (TCP peers) attest to nothing.
#[derive(Clone, Debug)]
pub struct UnixAttestor {
    proc_root: PathBuf,
}

impl Default for UnixAttestor {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl UnixAttestor {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    async fn exe_path(&self, pid: i32) -> Option<PathBuf> {
        let link = self.proc_root.join(pid.to_string()).join("exe");
        match tokio::fs::read_link(&link).await {
            Ok(path) => Some(path),
            Err(err) => {
                tracing::debug!(pid, error = %err, "Unable to resolve caller executable");
                None
            }
        }
    }
}

#[tonic::async_trait]
impl Attestor for UnixAttestor {
    async fn attest(&self, caller: &Caller) -> Result<Vec<Selector>> {
        let mut selectors = Vec::with_capacity(3);
        if let Some(uid) = caller.uid {
            selectors.push(Selector::new(UNIX_SELECTOR, format!("uid:{uid}")));
        }
        if let Some(gid) = caller.gid {
            selectors.push(Selector::new(UNIX_SELECTOR, format!("gid:{gid}")));
        }
        if let Some(pid) = caller.pid {
            if let Some(exe) = self.exe_path(pid).await {
                selectors.push(path_selector(&exe));
            }
        }
        Ok(selectors)
    }
}

fn path_selector(exe: &Path) -> Selector {
    Selector::new(UNIX_SELECTOR, format!("path:{}", exe.display()))
}

/// The attestor as the services see it: reads the [`Caller`] tonic attached
/// to the request and delegates to the configured [`Attestor`].
#[derive(Clone)]
pub struct PeerAttestor {
    inner: Arc<dyn Attestor>,
}

impl PeerAttestor {
    pub fn new(inner: Arc<dyn Attestor>) -> Self {
        Self { inner }
    }

    /// The returned future does not borrow the request, so it can be awaited
    /// while the request body is still being consumed.
    pub fn attest<T>(&self, req: &Request<T>) -> BoxFuture<'static, Result<Vec<Selector>>> {
        let caller = req.extensions().get::<Caller>().cloned();
        let inner = self.inner.clone();
        Box::pin(async move {
            let caller = caller.ok_or_else(|| Error::Unauthenticated {
                reason: "no caller information on the connection".to_string(),
            })?;
            inner.attest(&caller).await
        })
    }
}

impl core::fmt::Debug for PeerAttestor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PeerAttestor").finish_non_exhaustive()
    }
}
