//! The fixed set of RPC services an endpoint serves.
//!
//! Each slot is its own type, named after the gRPC service it carries, so a
//! Workload API implementation can never land in the SDS slot and no slot can
//! be filled twice. A slot erases the concrete implementation behind a
//! [`BoxCloneSyncService`], which is what lets tests swap any of them out
//! through the endpoint configuration.

use crate::server::service::{
    health::{Health, HealthServer},
    sdsv2::{SdsV2Api, SdsV2Server},
    sdsv3::{SdsV3Api, SdsV3Server},
};
use core::convert::Infallible;
use core::task::{Context, Poll};
use tonic::body::Body;
use tonic::codegen::http::{Request, Response};
use tonic::server::NamedService;
use tonic::transport::{Server, server::Router};
use tower::Service;
use tower::util::BoxCloneSyncService;
use workload_gateway_core::proto::workload::spiffe_workload_api_server::{
    SpiffeWorkloadApi, SpiffeWorkloadApiServer,
};

type BoxedRpc = BoxCloneSyncService<Request<Body>, Response<Body>, Infallible>;

macro_rules! service_slot {
    ($(#[$meta:meta])* $slot:ident => $name:literal) => {
        $(#[$meta])*
        #[derive(Clone)]
        pub struct $slot(BoxedRpc);

        impl $slot {
            /// Wraps an already-built gRPC service, such as a generated server
            /// with custom settings or a hand-written stub.
            pub fn from_service<S>(service: S) -> Self
            where
                S: Service<Request<Body>, Response = Response<Body>, Error = Infallible>
                    + Clone
                    + Send
                    + Sync
                    + 'static,
                S::Future: Send + 'static,
            {
                Self(BoxCloneSyncService::new(service))
            }
        }

        impl NamedService for $slot {
            const NAME: &'static str = $name;
        }

        impl Service<Request<Body>> for $slot {
            type Response = Response<Body>;
            type Error = Infallible;
            type Future = <BoxedRpc as Service<Request<Body>>>::Future;

            fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
                self.0.poll_ready(cx)
            }

            fn call(&mut self, req: Request<Body>) -> Self::Future {
                self.0.call(req)
            }
        }

        impl core::fmt::Debug for $slot {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.debug_tuple(stringify!($slot)).field(&$name).finish()
            }
        }
    };
}

service_slot!(
    /// Slot for the SPIFFE Workload API.
    WorkloadApiService => "SpiffeWorkloadAPI"
);
service_slot!(
    /// Slot for Envoy SDS v2.
    SdsV2Service => "envoy.service.discovery.v2.SecretDiscoveryService"
);
service_slot!(
    /// Slot for Envoy SDS v3.
    SdsV3Service => "envoy.service.secret.v3.SecretDiscoveryService"
);
service_slot!(
    /// Slot for gRPC health checking.
    HealthService => "grpc.health.v1.Health"
);

impl WorkloadApiService {
    pub fn new<T: SpiffeWorkloadApi>(api: T) -> Self {
        Self::from_service(SpiffeWorkloadApiServer::new(api))
    }
}

impl SdsV2Service {
    pub fn new<T: SdsV2Api>(api: T) -> Self {
        Self::from_service(SdsV2Server::new(api))
    }
}

impl SdsV3Service {
    pub fn new<T: SdsV3Api>(api: T) -> Self {
        Self::from_service(SdsV3Server::new(api))
    }
}

impl HealthService {
    pub fn new<T: Health>(api: T) -> Self {
        Self::from_service(HealthServer::new(api))
    }
}

/// Exactly one instance of each endpoint service, built once per endpoint.
#[derive(Clone, Debug)]
pub struct Services {
    pub workload: WorkloadApiService,
    pub sdsv2: SdsV2Service,
    pub sdsv3: SdsV3Service,
    pub health: HealthService,
}

impl Services {
    /// Adds all four services to `server`. Registration completes before the
    /// returned router is served, so no connection is accepted with a
    /// partial set.
    pub fn register<L: Clone>(&self, server: &mut Server<L>) -> Router<L> {
        server
            .add_service(self.workload.clone())
            .add_service(self.sdsv2.clone())
            .add_service(self.sdsv3.clone())
            .add_service(self.health.clone())
    }

    pub fn names() -> [&'static str; 4] {
        [
            WorkloadApiService::NAME,
            SdsV2Service::NAME,
            SdsV3Service::NAME,
            HealthService::NAME,
        ]
    }
}
