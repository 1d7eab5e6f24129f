//! Cross-cutting interceptors installed on the endpoint's RPC server.
//!
//! A [`Chain`] holds an ordered list of [`Middleware`]. For every call:
//!
//! 1. `preprocess` runs front to back. The first failure short-circuits the
//!    call: the handler is never invoked and the client receives that status.
//! 2. `postprocess` runs back to front on every middleware whose
//!    `preprocess` succeeded (or, on failure, on those that ran before it),
//!    with the final gRPC status code and the elapsed time.
//!
//! The chain is mounted as a [`tower::Layer`] around the router, so it sees
//! the raw HTTP request: the `/<service>/<method>` path, the metadata headers
//! and the [`Caller`] tonic placed in the request extensions.
//!
//! When the layer carries a [`Shutdown`] it is inserted into every request's
//! extensions for the handlers to observe.
//!
//! For streaming calls the elapsed time covers handler setup up to the
//! response headers, not the lifetime of the stream.

use crate::server::peer::Caller;
use crate::server::service::Shutdown;
use crate::server::telemetry::Metrics;
use core::task::{Context, Poll};
use core::time::Duration;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Instant;
use tonic::codegen::http::{self, HeaderMap};
use tonic::{Code, Status};
use tower::{Layer, Service};
use tracing::{Instrument, Span};

/// Name of the Workload API service as it appears in request paths.
pub const WORKLOAD_API_SERVICE: &str = "SpiffeWorkloadAPI";

/// Metadata header every Workload API call must carry. Its presence proves
/// the request was not forwarded by a confused deputy such as a browser.
pub const SECURITY_HEADER: &str = "workload.spiffe.io";

/// The call a middleware is looking at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallInfo {
    pub service: String,
    pub method: String,
    pub caller: Option<Caller>,
}

impl CallInfo {
    /// Splits a gRPC request path (`/<service>/<method>`).
    pub fn from_path(path: &str, caller: Option<Caller>) -> Self {
        let path = path.strip_prefix('/').unwrap_or(path);
        let (service, method) = path.split_once('/').unwrap_or((path, ""));
        Self {
            service: service.to_string(),
            method: method.to_string(),
            caller,
        }
    }
}

pub trait Middleware: Send + Sync + 'static {
    fn preprocess(&self, _call: &CallInfo, _headers: &HeaderMap) -> Result<(), Status> {
        Ok(())
    }

    fn postprocess(&self, _call: &CallInfo, _code: Code, _elapsed: Duration) {}
}

#[derive(Clone, Default)]
pub struct Chain {
    middleware: Vec<Arc<dyn Middleware>>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, middleware: impl Middleware) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn len(&self) -> usize {
        self.middleware.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middleware.is_empty()
    }

    /// Runs every `preprocess` in order. On failure the middleware that
    /// already ran are postprocessed (in reverse) with the failing code.
    pub fn preprocess(&self, call: &CallInfo, headers: &HeaderMap, started: Instant) -> Result<(), Status> {
        for (idx, middleware) in self.middleware.iter().enumerate() {
            if let Err(status) = middleware.preprocess(call, headers) {
                let elapsed = started.elapsed();
                for done in self.middleware[..idx].iter().rev() {
                    done.postprocess(call, status.code(), elapsed);
                }
                return Err(status);
            }
        }
        Ok(())
    }

    pub fn postprocess(&self, call: &CallInfo, code: Code, elapsed: Duration) {
        for middleware in self.middleware.iter().rev() {
            middleware.postprocess(call, code, elapsed);
        }
    }

    pub fn layer(self, log: Span) -> ChainLayer {
        ChainLayer {
            chain: Arc::new(self),
            log,
            shutdown: None,
        }
    }
}

/// The chain every endpoint installs: logging, then metrics, then the
/// Workload API security header check.
pub fn endpoint_chain(metrics: Metrics) -> Chain {
    Chain::new()
        .with(Logger)
        .with(MetricsRecorder::new(metrics))
        .with(SecurityHeader)
}

#[derive(Clone)]
pub struct ChainLayer {
    chain: Arc<Chain>,
    log: Span,
    shutdown: Option<Shutdown>,
}

impl ChainLayer {
    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }
}

impl<S> Layer<S> for ChainLayer {
    type Service = Intercepted<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Intercepted {
            inner,
            chain: self.chain.clone(),
            log: self.log.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

#[derive(Clone)]
pub struct Intercepted<S> {
    inner: S,
    chain: Arc<Chain>,
    log: Span,
    shutdown: Option<Shutdown>,
}

impl<S, ReqBody, ResBody> Service<http::Request<ReqBody>> for Intercepted<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Default + Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: http::Request<ReqBody>) -> Self::Future {
        // The clone is not guaranteed to be ready; keep the one that was
        // polled and leave the clone in its place.
        let clone = self.inner.clone();
        let mut inner = core::mem::replace(&mut self.inner, clone);
        let chain = self.chain.clone();
        if let Some(shutdown) = &self.shutdown {
            req.extensions_mut().insert(shutdown.clone());
        }

        let call = CallInfo::from_path(req.uri().path(), req.extensions().get::<Caller>().cloned());
        let span = tracing::info_span!(
            parent: &self.log,
            "rpc",
            service = %call.service,
            method = %call.method,
            pid = call.caller.as_ref().and_then(|c| c.pid),
            uid = call.caller.as_ref().and_then(|c| c.uid),
        );

        Box::pin(
            async move {
                let started = Instant::now();
                if let Err(status) = chain.preprocess(&call, req.headers(), started) {
                    return Ok(status.into_http());
                }

                let result = inner.call(req).await;
                let code = match &result {
                    Ok(resp) => Status::from_header_map(resp.headers()).map_or(Code::Ok, |s| s.code()),
                    Err(_) => Code::Unknown,
                };
                chain.postprocess(&call, code, started.elapsed());
                result
            }
            .instrument(span),
        )
    }
}

/// Logs call start and completion inside the per-call span.
#[derive(Clone, Copy, Debug, Default)]
pub struct Logger;

impl Middleware for Logger {
    fn preprocess(&self, call: &CallInfo, _headers: &HeaderMap) -> Result<(), Status> {
        match &call.caller {
            Some(caller) => tracing::debug!(%caller, "Call started"),
            None => tracing::debug!("Call started without caller information"),
        }
        Ok(())
    }

    fn postprocess(&self, _call: &CallInfo, code: Code, elapsed: Duration) {
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        if code == Code::Ok {
            tracing::debug!(elapsed_ms, "Call completed");
        } else {
            tracing::info!(?code, elapsed_ms, "Call failed");
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct MetricsRecorder {
    metrics: Metrics,
}

impl MetricsRecorder {
    pub fn new(metrics: Metrics) -> Self {
        Self { metrics }
    }
}

impl Middleware for MetricsRecorder {
    fn postprocess(&self, call: &CallInfo, code: Code, elapsed: Duration) {
        self.metrics
            .record_call(&call.service, &call.method, code, elapsed);
    }
}

/// Rejects Workload API calls that do not carry `workload.spiffe.io: true`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SecurityHeader;

impl Middleware for SecurityHeader {
    fn preprocess(&self, call: &CallInfo, headers: &HeaderMap) -> Result<(), Status> {
        if call.service != WORKLOAD_API_SERVICE {
            return Ok(());
        }
        match headers.get(SECURITY_HEADER) {
            Some(value) if value.as_bytes() == b"true" => Ok(()),
            _ => Err(Status::invalid_argument("security header missing from request")),
        }
    }
}
