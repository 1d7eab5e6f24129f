//! gRPC health checking (`grpc.health.v1.Health`).
//!
//! The endpoint reports a single overall status: once the server is accepting
//! calls it is serving. Per-service status and watches are not offered.

use crate::server::{address::BindAddr, service::ResponseStream};
use tonic::{Request, Response, Status};
use tonic_health::pb::{
    HealthCheckRequest, HealthCheckResponse, health_check_response::ServingStatus,
};
use workload_gateway_core::Error;

pub use tonic_health::pb::health_server::{Health, HealthServer};

pub struct Config {
    pub addr: BindAddr,
}

#[derive(Clone, Debug)]
pub struct Handler {
    addr: BindAddr,
}

impl Handler {
    pub fn new(config: Config) -> Self {
        Self { addr: config.addr }
    }
}

#[tonic::async_trait]
impl Health for Handler {
    type WatchStream = ResponseStream<HealthCheckResponse>;

    async fn check(
        &self,
        req: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        let service = &req.get_ref().service;
        if !service.is_empty() {
            return Err(Error::invalid_argument("per-service health is not supported").into());
        }

        tracing::trace!(addr = %self.addr, "Health check");
        Ok(Response::new(HealthCheckResponse {
            status: ServingStatus::Serving.into(),
        }))
    }

    async fn watch(
        &self,
        _req: Request<HealthCheckRequest>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        Err(Error::Unimplemented { method: "Watch" }.into())
    }
}
