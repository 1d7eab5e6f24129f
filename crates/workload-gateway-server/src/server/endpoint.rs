//! # Endpoint
//!
//! Composes the four endpoint services behind one listener and runs them until
//! cancelled.
//!
//! ## Lifecycle
//!
//! 1. [`Endpoint::new`] builds every service exactly once from the
//!    [`Config`]. No I/O happens here.
//! 2. [`Endpoint::run`] binds the listener for the configured address, stores
//!    the address actually bound, logs `Starting Workload and SDS APIs` and
//!    signals the listening hook, then spawns the serve loop.
//! 3. The serve loop is raced against the caller's [`CancellationToken`]. On
//!    cancellation the server stops accepting, in-flight unary calls finish,
//!    open response streams end and `run` returns `Ok(())`. If the serve loop
//!    ends first its error is returned as-is.
//!
//! The listener is owned by the serve loop and released before `run`
//! returns, which also unlinks the socket file of a Unix listener. Dropping
//! the `run` future aborts the serve loop, so the listener is released on
//! that path too.
//!
//! ## Overrides
//!
//! Each service slot can be filled by a custom constructor receiving the same
//! projected configuration the production handler would get. Tests use this to
//! swap in stubs without touching the composition logic.

use crate::server::{
    address::BindAddr,
    attestor::{Attestor, PeerAttestor},
    error::{Error, Result},
    listener::{Listener, ListenerFactory},
    manager::Manager,
    middleware::endpoint_chain,
    peer::Credentials,
    registry::{HealthService, SdsV2Service, SdsV3Service, Services, WorkloadApiService},
    service::{Shutdown, health, sdsv2, sdsv3, workload},
    telemetry::Metrics,
};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tonic::transport::Server;
use tracing::{Instrument, Span};
use workload_gateway_core::types::TrustDomain;

pub const DEFAULT_SVID_NAME: &str = "default";
pub const DEFAULT_BUNDLE_NAME: &str = "ROOTCA";
pub const DEFAULT_ALL_BUNDLES_NAME: &str = "ALL";

/// Builds a service slot from its projected configuration.
pub type Constructor<C, S> = Box<dyn FnOnce(C) -> S + Send>;

pub struct Config {
    pub bind_addr: BindAddr,
    /// Span every endpoint event is emitted in.
    pub log: Span,
    pub metrics: Metrics,
    pub manager: Arc<dyn Manager>,
    pub attestor: Arc<dyn Attestor>,
    pub allow_unauthenticated_verifiers: bool,
    pub allowed_foreign_jwt_claims: Vec<String>,
    pub trust_domain: TrustDomain,
    pub default_svid_name: String,
    pub default_bundle_name: String,
    pub default_all_bundles_name: String,

    pub new_workload_api: Option<Constructor<workload::Config, WorkloadApiService>>,
    pub new_sdsv2: Option<Constructor<sdsv2::Config, SdsV2Service>>,
    pub new_sdsv3: Option<Constructor<sdsv3::Config, SdsV3Service>>,
    pub new_health: Option<Constructor<health::Config, HealthService>>,
}

impl Config {
    /// A configuration with the default secret names, no foreign claims and
    /// the production constructor for every service.
    pub fn new(
        bind_addr: BindAddr,
        manager: Arc<dyn Manager>,
        attestor: Arc<dyn Attestor>,
        trust_domain: TrustDomain,
    ) -> Self {
        Self {
            bind_addr,
            log: tracing::info_span!("endpoint"),
            metrics: Metrics::default(),
            manager,
            attestor,
            allow_unauthenticated_verifiers: false,
            allowed_foreign_jwt_claims: Vec::new(),
            trust_domain,
            default_svid_name: DEFAULT_SVID_NAME.to_string(),
            default_bundle_name: DEFAULT_BUNDLE_NAME.to_string(),
            default_all_bundles_name: DEFAULT_ALL_BUNDLES_NAME.to_string(),
            new_workload_api: None,
            new_sdsv2: None,
            new_sdsv3: None,
            new_health: None,
        }
    }
}

fn build<C, S>(ctor: Option<Constructor<C, S>>, config: C, production: impl FnOnce(C) -> S) -> S {
    match ctor {
        Some(ctor) => ctor(config),
        None => production(config),
    }
}

pub struct Endpoint {
    addr: BindAddr,
    log: Span,
    metrics: Metrics,
    services: Services,
    listening: Option<mpsc::Sender<BindAddr>>,
}

impl Endpoint {
    pub fn new(config: Config) -> Self {
        let attestor = PeerAttestor::new(config.attestor);

        let workload = build(
            config.new_workload_api,
            workload::Config {
                manager: config.manager.clone(),
                attestor: attestor.clone(),
                allow_unauthenticated_verifiers: config.allow_unauthenticated_verifiers,
                allowed_foreign_jwt_claims: config.allowed_foreign_jwt_claims.into_iter().collect(),
                trust_domain: config.trust_domain,
            },
            |c| WorkloadApiService::new(workload::Handler::new(c)),
        );

        let sdsv2 = build(
            config.new_sdsv2,
            sdsv2::Config {
                attestor: attestor.clone(),
                manager: config.manager.clone(),
                default_svid_name: config.default_svid_name.clone(),
                default_bundle_name: config.default_bundle_name.clone(),
            },
            |c| SdsV2Service::new(sdsv2::Handler::new(c)),
        );

        let sdsv3 = build(
            config.new_sdsv3,
            sdsv3::Config {
                attestor,
                manager: config.manager,
                default_svid_name: config.default_svid_name,
                default_bundle_name: config.default_bundle_name,
                default_all_bundles_name: config.default_all_bundles_name,
            },
            |c| SdsV3Service::new(sdsv3::Handler::new(c)),
        );

        let health = build(
            config.new_health,
            health::Config {
                addr: config.bind_addr.clone(),
            },
            |c| HealthService::new(health::Handler::new(c)),
        );

        Self {
            addr: config.bind_addr,
            log: config.log,
            metrics: config.metrics,
            services: Services {
                workload,
                sdsv2,
                sdsv3,
                health,
            },
            listening: None,
        }
    }

    /// The configured address, or the address actually bound once `run` is
    /// listening.
    pub fn addr(&self) -> &BindAddr {
        &self.addr
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Sends the bound address on `hook` once the listener is live, before the
    /// first connection is accepted.
    #[doc(hidden)]
    pub fn with_listening_hook(mut self, hook: mpsc::Sender<BindAddr>) -> Self {
        self.listening = Some(hook);
        self
    }

    /// Binds, serves and shuts down once `cancel` fires.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownNetwork`] before any I/O for unsupported addresses.
    /// - A listener error labelled with the stage that failed.
    /// - The serve loop's own error if it ends before cancellation.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        let factory = ListenerFactory::new(self.log.clone());
        match self.addr.clone() {
            BindAddr::Unix(path) => {
                let listener = factory.listen_unix(&path).await?;
                self.serve(listener, cancel).await
            }
            BindAddr::Tcp(addr) => {
                let listener = factory.listen_tcp(addr).await?;
                self.serve(listener, cancel).await
            }
            BindAddr::Unsupported { network, .. } => Err(Error::UnknownNetwork(network)),
        }
    }

    async fn serve<L: Listener>(&mut self, listener: L, cancel: CancellationToken) -> Result<()> {
        self.addr = listener.local_addr();
        tracing::info!(
            parent: &self.log,
            network = self.addr.network(),
            address = %self.addr,
            "Starting Workload and SDS APIs"
        );

        if let Some(hook) = &self.listening {
            if hook.send(self.addr.clone()).await.is_err() {
                tracing::debug!(parent: &self.log, "Listening hook receiver dropped");
            }
        }

        let stop = CancellationToken::new();
        // Stops the server and releases the listener if `run` is dropped
        // mid-flight.
        let _stop_on_drop = stop.clone().drop_guard();

        let layer = endpoint_chain(self.metrics.clone())
            .layer(self.log.clone())
            .with_shutdown(Shutdown::new(stop.clone()));
        let mut builder = Server::builder().layer(layer);
        let router = self.services.register(&mut builder);
        let incoming = Credentials::new(self.metrics.clone()).apply(listener);

        let (done_tx, mut done_rx) = oneshot::channel();
        let shutdown = stop.clone();

        let _serving = AbortOnDropHandle::new(tokio::spawn(
            async move {
                let outcome = match router
                    .serve_with_incoming_shutdown(incoming, shutdown.clone().cancelled_owned())
                    .await
                {
                    Ok(()) if shutdown.is_cancelled() => Error::ServerStopped,
                    Ok(()) => Error::ListenerClosed,
                    Err(err) => Error::Serve(err),
                };
                let _ = done_tx.send(outcome);
            }
            .instrument(self.log.clone()),
        ));

        tokio::select! {
            outcome = &mut done_rx => Err(outcome.unwrap_or(Error::ServeTaskAborted)),
            () = cancel.cancelled() => {
                tracing::info!(parent: &self.log, "Stopping Workload and SDS APIs");
                stop.cancel();
                match done_rx.await {
                    Ok(Error::ServerStopped) => Ok(()),
                    Ok(err) => Err(err),
                    Err(_) => Err(Error::ServeTaskAborted),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::peer::Caller;
    use crate::server::service::testing::{FixedAttestor, manager};
    use core::pin::Pin;
    use core::task::{Context, Poll};
    use futures::Stream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::DuplexStream;

    /// A listener that never yields a connection and is already exhausted.
    struct Exhausted;

    impl Stream for Exhausted {
        type Item = std::io::Result<(DuplexStream, Caller)>;

        fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            Poll::Ready(None)
        }
    }

    impl Listener for Exhausted {
        type Io = DuplexStream;

        fn local_addr(&self) -> BindAddr {
            "127.0.0.1:7000".parse().unwrap()
        }
    }

    fn config(bind_addr: &str) -> Config {
        Config::new(
            bind_addr.parse().unwrap(),
            manager(),
            Arc::new(FixedAttestor(Vec::new())),
            TrustDomain::parse("example.org").unwrap(),
        )
    }

    #[test]
    fn new_does_no_io() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.sock");
        let endpoint = Endpoint::new(config(&format!("unix://{}", path.display())));
        assert_eq!(endpoint.addr(), &BindAddr::Unix(path.clone()));
        assert!(!path.exists());
    }

    #[test]
    fn overrides_receive_projected_config_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut config = config("127.0.0.1:0");
        config.allowed_foreign_jwt_claims = vec!["team".into(), "team".into(), "email".into()];
        config.default_svid_name = "svid".into();

        let seen = calls.clone();
        config.new_workload_api = Some(Box::new(move |c: workload::Config| {
            seen.fetch_add(1, Ordering::SeqCst);
            assert_eq!(c.allowed_foreign_jwt_claims.len(), 2);
            assert!(c.allowed_foreign_jwt_claims.contains("email"));
            assert_eq!(c.trust_domain.name(), "example.org");
            WorkloadApiService::new(workload::Handler::new(c))
        }));
        let seen = calls.clone();
        config.new_sdsv3 = Some(Box::new(move |c: sdsv3::Config| {
            seen.fetch_add(1, Ordering::SeqCst);
            assert_eq!(c.default_svid_name, "svid");
            assert_eq!(c.default_bundle_name, DEFAULT_BUNDLE_NAME);
            assert_eq!(c.default_all_bundles_name, DEFAULT_ALL_BUNDLES_NAME);
            SdsV3Service::new(sdsv3::Handler::new(c))
        }));
        let seen = calls.clone();
        config.new_health = Some(Box::new(move |c: health::Config| {
            seen.fetch_add(1, Ordering::SeqCst);
            assert_eq!(c.addr, "127.0.0.1:0".parse::<BindAddr>().unwrap());
            HealthService::new(health::Handler::new(c))
        }));

        let _endpoint = Endpoint::new(config);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unsupported_network_fails_before_io() {
        let mut endpoint = Endpoint::new(config("udp://127.0.0.1:53"));
        let err = endpoint.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::UnknownNetwork(network) if network == "udp"));
    }

    #[tokio::test]
    async fn cancelled_tcp_endpoint_returns_ok() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut endpoint = Endpoint::new(config("127.0.0.1:0")).with_listening_hook(tx);
        let cancel = CancellationToken::new();

        let stopper = cancel.clone();
        let watcher = tokio::spawn(async move {
            let addr = rx.recv().await.unwrap();
            stopper.cancel();
            addr
        });

        endpoint.run(cancel).await.unwrap();
        let bound = watcher.await.unwrap();
        assert_eq!(endpoint.addr(), &bound);
        let BindAddr::Tcp(addr) = bound else {
            panic!("expected a TCP address, got {bound:?}");
        };
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn serve_loop_ending_on_its_own_is_reported() {
        let mut endpoint = Endpoint::new(config("127.0.0.1:0"));
        let cancel = CancellationToken::new();

        let err = endpoint.serve(Exhausted, cancel.clone()).await.unwrap_err();
        assert!(matches!(err, Error::ListenerClosed), "{err}");
        assert!(!cancel.is_cancelled());
        assert_eq!(endpoint.addr(), &"127.0.0.1:7000".parse::<BindAddr>().unwrap());
    }
}
