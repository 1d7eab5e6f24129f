//! Secret discovery shared by the SDS v2 and v3 handlers.
//!
//! Both API versions exchange the same discovery messages and a `Secret` with
//! the same wire layout; they differ in the service name, the resource type
//! URL and whether the combined "all bundles" secret is offered.
//!
//! ## Resource names
//!
//! | Requested name                 | Secret                                      |
//! |--------------------------------|---------------------------------------------|
//! | SPIFFE ID of an identity       | `tls_certificate` for that identity         |
//! | default SVID name              | `tls_certificate` for the first identity    |
//! | default bundle name            | `validation_context` with the local bundle  |
//! | local trust domain ID          | `validation_context` with the local bundle  |
//! | federated trust domain ID      | `validation_context` with that bundle       |
//! | default all-bundles name (v3)  | `validation_context` with every bundle      |
//!
//! An empty request returns every identity under its SPIFFE ID, the local
//! bundle under the default bundle name and every federated bundle under its
//! trust domain ID. Any requested name that cannot be served fails the whole
//! request.
//!
//! ## Streaming
//!
//! A stream answers every new request and every identity update once a
//! request has been seen. Requests echoing the last nonce, the current version
//! and the same resource names are ACKs and are not answered; requests
//! carrying an older nonce are stale and ignored. The stream ends when the
//! proxy closes its side or the endpoint stops.

use crate::server::{
    attestor::PeerAttestor,
    manager::Manager,
    pem,
    service::{ResponseStream, Shutdown},
};
use futures::{Stream, StreamExt};
use prost::Message;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Status};
use tracing::Instrument;
use workload_gateway_core::{
    Error,
    proto::envoy::{
        extensions::transport_sockets::tls::v3::{
            CertificateValidationContext, DataSource, Secret, TlsCertificate, data_source, secret,
        },
        service::discovery::v3::{DiscoveryRequest, DiscoveryResponse},
    },
    types::{Bundle, WorkloadUpdate, X509Svid},
};

pub const V2_SECRET_TYPE_URL: &str = "type.googleapis.com/envoy.api.v2.auth.Secret";
pub const V3_SECRET_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.Secret";

const RESPONSE_BUFFER: usize = 4;

pub struct Config {
    pub attestor: PeerAttestor,
    pub manager: Arc<dyn Manager>,
    pub default_svid_name: String,
    pub default_bundle_name: String,
    /// Only offered by SDS v3.
    pub default_all_bundles_name: Option<String>,
}

#[derive(Clone)]
pub struct SecretDiscovery {
    config: Arc<Config>,
    type_url: &'static str,
    nonce: Arc<AtomicU64>,
}

impl SecretDiscovery {
    pub fn new(config: Config, type_url: &'static str) -> Self {
        Self {
            config: Arc::new(config),
            type_url,
            nonce: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn type_url(&self) -> &'static str {
        self.type_url
    }

    fn next_nonce(&self) -> String {
        (self.nonce.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    fn pack(&self, secret: &Secret) -> prost_types::Any {
        prost_types::Any {
            type_url: self.type_url.to_string(),
            value: secret.encode_to_vec(),
        }
    }

    /// Resolves `resource_names` against a snapshot.
    pub fn build_response(
        &self,
        update: &WorkloadUpdate,
        resource_names: &[String],
    ) -> Result<DiscoveryResponse, Status> {
        let all = resource_names.is_empty();
        let mut missing: BTreeSet<&str> = resource_names.iter().map(String::as_str).collect();
        let mut secrets = Vec::new();

        if let Some(bundle) = &update.bundle {
            let td_id = bundle.trust_domain.id();
            if all || missing.contains(self.config.default_bundle_name.as_str()) {
                secrets.push(validation_context(&self.config.default_bundle_name, [bundle]));
                missing.remove(self.config.default_bundle_name.as_str());
            }
            if missing.remove(td_id.as_str()) {
                secrets.push(validation_context(&td_id, [bundle]));
            }
        }

        for bundle in update.federated_bundles.values() {
            let td_id = bundle.trust_domain.id();
            if all || missing.remove(td_id.as_str()) {
                secrets.push(validation_context(&td_id, [bundle]));
            }
        }

        if let Some(all_name) = &self.config.default_all_bundles_name {
            if missing.remove(all_name.as_str()) {
                secrets.push(validation_context(all_name, update.bundles()));
            }
        }

        for (idx, svid) in update.identities.iter().enumerate() {
            if all || missing.remove(svid.spiffe_id.as_str()) {
                secrets.push(tls_certificate(&svid.spiffe_id, svid));
            } else if idx == 0 && missing.remove(self.config.default_svid_name.as_str()) {
                secrets.push(tls_certificate(&self.config.default_svid_name, svid));
            }
        }

        if !missing.is_empty() {
            let names: Vec<_> = missing.into_iter().collect();
            return Err(Error::invalid_argument(format!(
                "workload is not authorized for the requested identities {names:?}"
            ))
            .into());
        }

        Ok(DiscoveryResponse {
            version_info: update.revision.to_string(),
            resources: secrets.iter().map(|secret| self.pack(secret)).collect(),
            canary: false,
            type_url: self.type_url.to_string(),
            nonce: self.next_nonce(),
        })
    }

    pub async fn fetch(
        &self,
        req: Request<DiscoveryRequest>,
    ) -> Result<DiscoveryResponse, Status> {
        let selectors = self.config.attestor.attest(&req).await?;
        let update = self.config.manager.snapshot(&selectors);
        let resp = self.build_response(&update, &req.get_ref().resource_names)?;
        tracing::debug!(
            version = %resp.version_info,
            resources = resp.resources.len(),
            "Fetched secrets"
        );
        Ok(resp)
    }

    /// Attests the caller, then serves `requests` on a background task until
    /// either side goes away.
    pub async fn stream<S>(
        &self,
        req: Request<S>,
    ) -> Result<ResponseStream<DiscoveryResponse>, Status>
    where
        S: Stream<Item = Result<DiscoveryRequest, Status>> + Send + Unpin + 'static,
    {
        // The request body need not be `Sync`; only the attestation future crosses
        // the await.
        let attestation = self.config.attestor.attest(&req);
        let selectors = attestation.await?;
        let updates = self.config.manager.subscribe(&selectors);
        let shutdown = Shutdown::of(&req);
        let (tx, rx) = mpsc::channel(RESPONSE_BUFFER);

        let span = tracing::debug_span!("stream_secrets", type_url = self.type_url);
        tokio::spawn(
            self.clone()
                .serve_stream(req.into_inner(), updates, shutdown, tx)
                .instrument(span),
        );

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn serve_stream<S>(
        self,
        mut requests: S,
        mut updates: watch::Receiver<Arc<WorkloadUpdate>>,
        shutdown: Shutdown,
        tx: mpsc::Sender<Result<DiscoveryResponse, Status>>,
    ) where
        S: Stream<Item = Result<DiscoveryRequest, Status>> + Send + Unpin + 'static,
    {
        updates.borrow_and_update();
        let mut last_request: Option<DiscoveryRequest> = None;
        let mut last_nonce: Option<String> = None;

        loop {
            tokio::select! {
                msg = requests.next() => {
                    let req = match msg {
                        Some(Ok(req)) => req,
                        Some(Err(status)) => {
                            tracing::debug!(%status, "Secret stream receive failed");
                            break;
                        }
                        None => break,
                    };

                    if let Some(detail) = &req.error_detail {
                        tracing::warn!(
                            code = detail.code,
                            message = %detail.message,
                            version = %req.version_info,
                            "Proxy rejected secrets"
                        );
                        continue;
                    }

                    if let Some(nonce) = &last_nonce {
                        if req.response_nonce != *nonce {
                            tracing::debug!(
                                expected = %nonce,
                                received = %req.response_nonce,
                                "Ignoring request with stale nonce"
                            );
                            continue;
                        }
                    }

                    let current = updates.borrow().revision.to_string();
                    let is_ack = last_request.as_ref().is_some_and(|last| {
                        req.version_info == current && req.resource_names == last.resource_names
                    });
                    if is_ack {
                        continue;
                    }

                    last_request = Some(req);
                }
                changed = updates.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if last_request.is_none() {
                        continue;
                    }
                }
                () = tx.closed() => break,
                () = shutdown.stopped() => break,
            }

            let Some(req) = &last_request else {
                continue;
            };
            let update = updates.borrow_and_update().clone();
            match self.build_response(&update, &req.resource_names) {
                Ok(resp) => {
                    last_nonce = Some(resp.nonce.clone());
                    if tx.send(Ok(resp)).await.is_err() {
                        break;
                    }
                }
                Err(status) => {
                    let _ = tx.send(Err(status)).await;
                    break;
                }
            }
        }

        tracing::debug!("Secret stream closed");
    }
}

fn inline(bytes: String) -> Option<DataSource> {
    Some(DataSource {
        specifier: Some(data_source::Specifier::InlineBytes(bytes.into_bytes())),
    })
}

fn tls_certificate(name: &str, svid: &X509Svid) -> Secret {
    Secret {
        name: name.to_string(),
        r#type: Some(secret::Type::TlsCertificate(TlsCertificate {
            certificate_chain: inline(pem::encode_all(
                pem::CERTIFICATE,
                svid.cert_chain.iter().map(|cert| cert.as_ref()),
            )),
            private_key: inline(pem::encode(pem::PRIVATE_KEY, &svid.private_key)),
        })),
    }
}

fn validation_context<'a>(name: &str, bundles: impl IntoIterator<Item = &'a Bundle>) -> Secret {
    let trusted_ca = bundles
        .into_iter()
        .flat_map(|bundle| bundle.x509_authorities.iter())
        .map(|cert| pem::encode(pem::CERTIFICATE, cert))
        .collect::<String>();
    Secret {
        name: name.to_string(),
        r#type: Some(secret::Type::ValidationContext(
            CertificateValidationContext {
                trusted_ca: inline(trusted_ca),
            },
        )),
    }
}
