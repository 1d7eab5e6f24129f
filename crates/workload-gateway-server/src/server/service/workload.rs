//! SPIFFE Workload API handler.
//!
//! Streams X.509-SVIDs and bundles to attested workloads, mints and validates
//! JWT-SVIDs through the identity manager. The `workload.spiffe.io` security
//! header is enforced by the endpoint middleware before calls reach this
//! handler.

use crate::server::{
    attestor::PeerAttestor,
    manager::Manager,
    service::{ResponseStream, Shutdown},
};
use futures::{StreamExt, stream};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tonic::{Request, Response, Status};
use workload_gateway_core::{
    Error,
    proto::workload::{
        JwtBundlesRequest, JwtBundlesResponse, Jwtsvid, JwtsvidRequest, JwtsvidResponse,
        ValidateJwtsvidRequest, ValidateJwtsvidResponse, X509BundlesRequest, X509BundlesResponse,
        X509svid, X509svidRequest, X509svidResponse,
        spiffe_workload_api_server::SpiffeWorkloadApi,
    },
    types::{TrustDomain, WorkloadUpdate},
};

/// Registered JWT claims kept on tokens issued by foreign trust domains.
pub const STANDARD_CLAIMS: [&str; 7] = ["aud", "exp", "iat", "iss", "jti", "nbf", "sub"];

const EMPTY_JWKS: &[u8] = br#"{"keys":[]}"#;

pub struct Config {
    pub manager: Arc<dyn Manager>,
    pub attestor: PeerAttestor,
    pub allow_unauthenticated_verifiers: bool,
    pub allowed_foreign_jwt_claims: HashSet<String>,
    pub trust_domain: TrustDomain,
}

#[derive(Clone)]
pub struct Handler {
    config: Arc<Config>,
}

impl Handler {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    fn require_identity(&self, update: &WorkloadUpdate) -> Result<(), Status> {
        if update.identities.is_empty() {
            return Err(Error::permission_denied("no identity issued").into());
        }
        Ok(())
    }

    fn require_verifier(&self, update: &WorkloadUpdate) -> Result<(), Status> {
        if self.config.allow_unauthenticated_verifiers {
            return Ok(());
        }
        self.require_identity(update)
    }

    /// Drops every claim of a foreign-issued token that is neither a
    /// registered claim nor explicitly allowed.
    pub fn filter_claims(&self, spiffe_id: &str, mut claims: prost_types::Struct) -> prost_types::Struct {
        if self.config.trust_domain.owns(spiffe_id) {
            return claims;
        }
        claims.fields.retain(|name, _| {
            STANDARD_CLAIMS.contains(&name.as_str())
                || self.config.allowed_foreign_jwt_claims.contains(name)
        });
        claims
    }
}

/// Maps every update to a response. The first error is sent to the client and
/// ends the stream, as does the endpoint stopping.
fn stream_updates<T, F>(
    shutdown: &Shutdown,
    updates: watch::Receiver<Arc<WorkloadUpdate>>,
    build: F,
) -> ResponseStream<T>
where
    T: Send + 'static,
    F: FnMut(&WorkloadUpdate) -> Result<T, Status> + Send + 'static,
{
    let state = (WatchStream::new(updates), build, false);
    shutdown.bound(Box::pin(stream::unfold(state, |(mut updates, mut build, failed)| async move {
        if failed {
            return None;
        }
        let update = updates.next().await?;
        let item = build(&update);
        let failed = item.is_err();
        Some((item, (updates, build, failed)))
    })))
}

fn x509_svid_response(update: &WorkloadUpdate) -> Result<X509svidResponse, Status> {
    if update.identities.is_empty() {
        return Err(Error::permission_denied("no identity issued").into());
    }
    let bundle = update
        .bundle
        .as_ref()
        .map(|bundle| bundle.x509_der())
        .unwrap_or_default();

    Ok(X509svidResponse {
        svids: update
            .identities
            .iter()
            .map(|svid| X509svid {
                spiffe_id: svid.spiffe_id.clone(),
                x509_svid: svid.chain_der(),
                x509_svid_key: svid.private_key.to_vec(),
                bundle: bundle.clone(),
                hint: svid.hint.clone(),
            })
            .collect(),
        crl: Vec::new(),
        federated_bundles: update
            .federated_bundles
            .values()
            .map(|bundle| (bundle.trust_domain.id(), bundle.x509_der()))
            .collect(),
    })
}

fn x509_bundles(update: &WorkloadUpdate) -> HashMap<String, Vec<u8>> {
    update
        .bundles()
        .map(|bundle| (bundle.trust_domain.id(), bundle.x509_der()))
        .collect()
}

fn jwt_bundles(update: &WorkloadUpdate) -> HashMap<String, Vec<u8>> {
    update
        .bundles()
        .map(|bundle| {
            let jwks = if bundle.jwt_authorities.is_empty() {
                EMPTY_JWKS.to_vec()
            } else {
                bundle.jwt_authorities.to_vec()
            };
            (bundle.trust_domain.id(), jwks)
        })
        .collect()
}

#[tonic::async_trait]
impl SpiffeWorkloadApi for Handler {
    type FetchX509SVIDStream = ResponseStream<X509svidResponse>;
    type FetchX509BundlesStream = ResponseStream<X509BundlesResponse>;
    type FetchJWTBundlesStream = ResponseStream<JwtBundlesResponse>;

    async fn fetch_jwtsvid(
        &self,
        req: Request<JwtsvidRequest>,
    ) -> Result<Response<JwtsvidResponse>, Status> {
        if req.get_ref().audience.is_empty() {
            return Err(Error::invalid_argument("audience must be specified").into());
        }

        let selectors = self.config.attestor.attest(&req).await?;
        let req = req.into_inner();
        let update = self.config.manager.snapshot(&selectors);

        let spiffe_ids: Vec<_> = update
            .identities
            .iter()
            .filter(|svid| req.spiffe_id.is_empty() || svid.spiffe_id == req.spiffe_id)
            .map(|svid| (svid.spiffe_id.as_str(), svid.hint.as_str()))
            .collect();
        if spiffe_ids.is_empty() {
            return Err(Error::permission_denied("no identity issued").into());
        }

        let mut svids = Vec::with_capacity(spiffe_ids.len());
        for (spiffe_id, hint) in spiffe_ids {
            let minted = self
                .config
                .manager
                .fetch_jwt_svid(spiffe_id, &req.audience)
                .await?;
            svids.push(Jwtsvid {
                spiffe_id: minted.spiffe_id,
                svid: minted.token,
                hint: if minted.hint.is_empty() {
                    hint.to_string()
                } else {
                    minted.hint
                },
            });
        }

        tracing::debug!(count = svids.len(), "Issued JWT-SVIDs");
        Ok(Response::new(JwtsvidResponse { svids }))
    }

    async fn fetch_jwt_bundles(
        &self,
        req: Request<JwtBundlesRequest>,
    ) -> Result<Response<Self::FetchJWTBundlesStream>, Status> {
        let selectors = self.config.attestor.attest(&req).await?;
        let updates = self.config.manager.subscribe(&selectors);
        self.require_verifier(&updates.borrow())?;

        let handler = self.clone();
        Ok(Response::new(stream_updates(&Shutdown::of(&req), updates, move |update| {
            handler.require_verifier(update)?;
            Ok(JwtBundlesResponse {
                bundles: jwt_bundles(update),
            })
        })))
    }

    async fn validate_jwtsvid(
        &self,
        req: Request<ValidateJwtsvidRequest>,
    ) -> Result<Response<ValidateJwtsvidResponse>, Status> {
        if req.get_ref().audience.is_empty() {
            return Err(Error::invalid_argument("audience must be specified").into());
        }
        if req.get_ref().svid.is_empty() {
            return Err(Error::invalid_argument("svid must be specified").into());
        }

        let selectors = self.config.attestor.attest(&req).await?;
        let update = self.config.manager.snapshot(&selectors);
        self.require_verifier(&update)?;

        let req = req.into_inner();
        let validated = self
            .config
            .manager
            .validate_jwt_svid(&req.svid, &req.audience)
            .await?;

        let claims = self.filter_claims(&validated.spiffe_id, validated.claims);
        Ok(Response::new(ValidateJwtsvidResponse {
            spiffe_id: validated.spiffe_id,
            claims: Some(claims),
        }))
    }

    async fn fetch_x509svid(
        &self,
        req: Request<X509svidRequest>,
    ) -> Result<Response<Self::FetchX509SVIDStream>, Status> {
        let selectors = self.config.attestor.attest(&req).await?;
        let updates = self.config.manager.subscribe(&selectors);
        self.require_identity(&updates.borrow())?;

        tracing::debug!(selectors = selectors.len(), "Streaming X.509-SVIDs");
        Ok(Response::new(stream_updates(
            &Shutdown::of(&req),
            updates,
            x509_svid_response,
        )))
    }

    async fn fetch_x509_bundles(
        &self,
        req: Request<X509BundlesRequest>,
    ) -> Result<Response<Self::FetchX509BundlesStream>, Status> {
        let selectors = self.config.attestor.attest(&req).await?;
        let updates = self.config.manager.subscribe(&selectors);
        self.require_verifier(&updates.borrow())?;

        let handler = self.clone();
        Ok(Response::new(stream_updates(&Shutdown::of(&req), updates, move |update| {
            handler.require_verifier(update)?;
            Ok(X509BundlesResponse {
                crl: Vec::new(),
                bundles: x509_bundles(update),
            })
        })))
    }
}
