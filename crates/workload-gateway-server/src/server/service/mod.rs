//! Production implementations of the four endpoint services.
//!
//! Every handler resolves the caller's selectors through the
//! [`PeerAttestor`](crate::server::attestor::PeerAttestor) and reads identities
//! from the [`Manager`](crate::server::manager::Manager); none of them keeps
//! state of its own beyond its configuration.
//!
//! ## Structure
//!
//! - [`workload`] - SPIFFE Workload API.
//! - [`sds`] - secret discovery shared by both Envoy API versions.
//! - [`sdsv2`] / [`sdsv3`] - version-specific SDS entry points.
//! - [`health`] - gRPC health checking.

use core::pin::Pin;
use futures::{Stream, StreamExt};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tonic::{Request, Status};

pub mod health;
pub mod sds;
pub mod sdsv2;
pub mod sdsv3;
pub mod workload;

/// Server-streaming response body shared by the handlers.
pub type ResponseStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;

/// Fires when the endpoint starts a graceful stop.
///
/// The endpoint places one in the extensions of every request it serves.
/// Open response streams end once it fires so the server can drain. Requests
/// served outside an endpoint carry none and are never stopped.
#[derive(Clone, Debug, Default)]
pub struct Shutdown(CancellationToken);

impl Shutdown {
    pub fn new(token: CancellationToken) -> Self {
        Self(token)
    }

    pub fn of<T>(req: &Request<T>) -> Self {
        req.extensions().get::<Self>().cloned().unwrap_or_default()
    }

    pub fn stopped(&self) -> WaitForCancellationFutureOwned {
        self.0.clone().cancelled_owned()
    }

    /// Ends `stream` once the endpoint is stopping.
    pub fn bound<T: Send + 'static>(&self, stream: ResponseStream<T>) -> ResponseStream<T> {
        Box::pin(stream.take_until(self.stopped()))
    }
}
