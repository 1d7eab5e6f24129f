//! Envoy SDS v2 (`envoy.service.discovery.v2.SecretDiscoveryService`).

use crate::server::{
    attestor::PeerAttestor,
    manager::Manager,
    service::{
        ResponseStream,
        sds::{self, SecretDiscovery, V2_SECRET_TYPE_URL},
    },
};
use std::sync::Arc;
use tonic::{Request, Response, Status, Streaming};
use workload_gateway_core::{
    Error,
    proto::envoy::service::discovery::v3::{
        DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
    },
};

pub use workload_gateway_core::proto::envoy::service::discovery::v2::secret_discovery_service_server::{
    SecretDiscoveryService as SdsV2Api, SecretDiscoveryServiceServer as SdsV2Server,
};

pub struct Config {
    pub attestor: PeerAttestor,
    pub manager: Arc<dyn Manager>,
    pub default_svid_name: String,
    pub default_bundle_name: String,
}

#[derive(Clone)]
pub struct Handler {
    discovery: SecretDiscovery,
}

impl Handler {
    pub fn new(config: Config) -> Self {
        let discovery = SecretDiscovery::new(
            sds::Config {
                attestor: config.attestor,
                manager: config.manager,
                default_svid_name: config.default_svid_name,
                default_bundle_name: config.default_bundle_name,
                default_all_bundles_name: None,
            },
            V2_SECRET_TYPE_URL,
        );
        Self { discovery }
    }
}

#[tonic::async_trait]
impl SdsV2Api for Handler {
    type DeltaSecretsStream = ResponseStream<DeltaDiscoveryResponse>;
    type StreamSecretsStream = ResponseStream<DiscoveryResponse>;

    async fn delta_secrets(
        &self,
        _req: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaSecretsStream>, Status> {
        Err(Error::Unimplemented {
            method: "DeltaSecrets",
        }
        .into())
    }

    async fn stream_secrets(
        &self,
        req: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamSecretsStream>, Status> {
        self.discovery.stream(req).await.map(Response::new)
    }

    async fn fetch_secrets(
        &self,
        req: Request<DiscoveryRequest>,
    ) -> Result<Response<DiscoveryResponse>, Status> {
        self.discovery.fetch(req).await.map(Response::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::service::testing::{attestor, manager, request};
    use prost::Message;
    use tonic::Code;
    use workload_gateway_core::proto::envoy::extensions::transport_sockets::tls::v3::Secret;

    fn handler() -> Handler {
        Handler::new(Config {
            attestor: attestor(&["unix:uid:1000"]),
            manager: manager(),
            default_svid_name: "default".into(),
            default_bundle_name: "ROOTCA".into(),
        })
    }

    #[tokio::test]
    async fn fetch_uses_v2_type_url() {
        let resp = handler()
            .fetch_secrets(request(DiscoveryRequest {
                resource_names: vec!["default".into()],
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(resp.type_url, V2_SECRET_TYPE_URL);
        let secret = Secret::decode(resp.resources[0].value.as_slice()).unwrap();
        assert_eq!(secret.name, "default");
    }

    #[tokio::test]
    async fn all_bundles_name_is_not_served() {
        let status = handler()
            .fetch_secrets(request(DiscoveryRequest {
                resource_names: vec!["ALL".into()],
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
    }
}
