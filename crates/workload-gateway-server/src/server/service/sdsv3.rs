//! Envoy SDS v3 (`envoy.service.secret.v3.SecretDiscoveryService`).

use crate::server::{
    attestor::PeerAttestor,
    manager::Manager,
    service::{
        ResponseStream,
        sds::{self, SecretDiscovery, V3_SECRET_TYPE_URL},
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

pub use workload_gateway_core::proto::envoy::service::secret::v3::secret_discovery_service_server::{
    SecretDiscoveryService as SdsV3Api, SecretDiscoveryServiceServer as SdsV3Server,
};

pub struct Config {
    pub attestor: PeerAttestor,
    pub manager: Arc<dyn Manager>,
    pub default_svid_name: String,
    pub default_bundle_name: String,
    /// Name of the secret carrying the local and every federated bundle.
    pub default_all_bundles_name: String,
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
                default_all_bundles_name: Some(config.default_all_bundles_name),
            },
            V3_SECRET_TYPE_URL,
        );
        Self { discovery }
    }
}

#[tonic::async_trait]
impl SdsV3Api for Handler {
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
    use workload_gateway_core::proto::envoy::extensions::transport_sockets::tls::v3::Secret;

    fn handler(selectors: &[&str]) -> Handler {
        Handler::new(Config {
            attestor: attestor(selectors),
            manager: manager(),
            default_svid_name: "default".into(),
            default_bundle_name: "ROOTCA".into(),
            default_all_bundles_name: "ALL".into(),
        })
    }

    #[tokio::test]
    async fn fetch_serves_all_bundles_secret() {
        let resp = handler(&["unix:uid:1000"])
            .fetch_secrets(request(DiscoveryRequest {
                resource_names: vec!["ALL".into()],
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(resp.type_url, V3_SECRET_TYPE_URL);
        let secret = Secret::decode(resp.resources[0].value.as_slice()).unwrap();
        assert_eq!(secret.name, "ALL");
    }

    #[tokio::test]
    async fn unmatched_workload_only_sees_bundles() {
        let resp = handler(&["unix:uid:0"])
            .fetch_secrets(request(DiscoveryRequest::default()))
            .await
            .unwrap()
            .into_inner();

        let names: Vec<_> = resp
            .resources
            .iter()
            .map(|any| Secret::decode(any.value.as_slice()).unwrap().name)
            .collect();
        assert_eq!(names, ["ROOTCA", "spiffe://partner.io"]);
    }
}
