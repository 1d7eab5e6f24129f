//! Identity manager: what each attested workload is entitled to.
//!
//! Services never cache identities themselves. They subscribe with the
//! caller's selectors and receive a [`watch`] channel that always holds the
//! latest [`WorkloadUpdate`] for exactly those selectors; streaming RPCs
//! forward every change to the client.
//!
//! [`StaticManager`] is the in-process implementation used by the binary. It
//! holds registration entries (selectors → X.509-SVID) in memory, can be
//! seeded from a JSON file and broadcasts to all subscribers whenever its
//! entries or bundles change.
//!
//! ## Seed file
//!
//! ```json
//! {
//!   "trust_domain": "example.org",
//!   "bundle": ["bundle.pem"],
//!   "jwks": "jwks.json",
//!   "federated_bundles": {
//!     "partner.io": { "x509_authorities": ["partner.pem"] }
//!   },
//!   "entries": [
//!     {
//!       "spiffe_id": "spiffe://example.org/web",
//!       "selectors": ["unix:uid:1000"],
//!       "cert_chain": ["web.pem"],
//!       "private_key": "web.key"
//!     }
//!   ]
//! }
//! ```
//!
//! Paths are resolved relative to the seed file. Certificate and key files may
//! be PEM or raw DER.

use crate::server::pem;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use workload_gateway_core::{
    Error, Result,
    types::{Bundle, JwtSvid, JwtValidation, Selector, TrustDomain, WorkloadUpdate, X509Svid},
};

#[tonic::async_trait]
pub trait Manager: Send + Sync + 'static {
    /// Subscribes to updates for a workload with the given selectors. The
    /// receiver already holds the current snapshot.
    fn subscribe(&self, selectors: &[Selector]) -> watch::Receiver<Arc<WorkloadUpdate>>;

    /// The current snapshot for the given selectors.
    fn snapshot(&self, selectors: &[Selector]) -> Arc<WorkloadUpdate> {
        let updates = self.subscribe(selectors);
        let current = updates.borrow().clone();
        current
    }

    async fn fetch_jwt_svid(&self, spiffe_id: &str, audience: &[String]) -> Result<JwtSvid>;

    async fn validate_jwt_svid(&self, token: &str, audience: &str) -> Result<JwtValidation>;
}

/// A registration entry: a workload matching every selector is issued `svid`.
///
/// An entry with no selectors matches nothing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub selectors: Vec<Selector>,
    pub svid: X509Svid,
}

impl Entry {
    pub fn matches(&self, selectors: &[Selector]) -> bool {
        !self.selectors.is_empty() && self.selectors.iter().all(|s| selectors.contains(s))
    }
}

#[derive(Debug)]
struct Subscriber {
    selectors: Vec<Selector>,
    tx: watch::Sender<Arc<WorkloadUpdate>>,
}

#[derive(Debug)]
struct State {
    revision: u64,
    entries: Vec<Entry>,
    bundle: Bundle,
    federated_bundles: BTreeMap<TrustDomain, Bundle>,
    subscribers: Vec<Subscriber>,
}

impl State {
    fn snapshot(&self, selectors: &[Selector]) -> WorkloadUpdate {
        WorkloadUpdate {
            revision: self.revision,
            identities: self
                .entries
                .iter()
                .filter(|entry| entry.matches(selectors))
                .map(|entry| entry.svid.clone())
                .collect(),
            bundle: Some(self.bundle.clone()),
            federated_bundles: self.federated_bundles.clone(),
        }
    }

    fn publish(&mut self) {
        self.revision += 1;
        self.subscribers.retain(|sub| !sub.tx.is_closed());
        for sub in &self.subscribers {
            sub.tx.send_replace(Arc::new(self.snapshot(&sub.selectors)));
        }
    }
}

#[derive(Debug)]
pub struct StaticManager {
    trust_domain: TrustDomain,
    state: Mutex<State>,
}

impl StaticManager {
    pub fn new(bundle: Bundle) -> Self {
        Self {
            trust_domain: bundle.trust_domain.clone(),
            state: Mutex::new(State {
                revision: 1,
                entries: Vec::new(),
                bundle,
                federated_bundles: BTreeMap::new(),
                subscribers: Vec::new(),
            }),
        }
    }

    pub fn trust_domain(&self) -> &TrustDomain {
        &self.trust_domain
    }

    pub fn revision(&self) -> u64 {
        self.state.lock().revision
    }

    pub fn subscriber_count(&self) -> usize {
        let mut state = self.state.lock();
        state.subscribers.retain(|sub| !sub.tx.is_closed());
        state.subscribers.len()
    }

    pub fn set_entries(&self, entries: Vec<Entry>) {
        let mut state = self.state.lock();
        state.entries = entries;
        state.publish();
    }

    pub fn set_bundle(&self, bundle: Bundle) {
        let mut state = self.state.lock();
        state.bundle = bundle;
        state.publish();
    }

    pub fn set_federated_bundle(&self, bundle: Bundle) {
        let mut state = self.state.lock();
        state
            .federated_bundles
            .insert(bundle.trust_domain.clone(), bundle);
        state.publish();
    }

    pub fn remove_federated_bundle(&self, trust_domain: &TrustDomain) -> bool {
        let mut state = self.state.lock();
        let removed = state.federated_bundles.remove(trust_domain).is_some();
        if removed {
            state.publish();
        }
        removed
    }

    /// Builds a manager from a JSON seed file.
    pub async fn load(path: &Path) -> core::result::Result<Self, LoadError> {
        let raw = tokio::fs::read(path).await.map_err(|source| LoadError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let seed: Seed = serde_json::from_slice(&raw).map_err(|source| LoadError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));

        let mut bundle = Bundle::new(seed.trust_domain.clone());
        bundle.x509_authorities = read_certificates(base, &seed.bundle).await?;
        if let Some(jwks) = &seed.jwks {
            bundle.jwt_authorities = read_file(base, jwks).await?;
        }

        let manager = Self::new(bundle);

        let mut entries = Vec::with_capacity(seed.entries.len());
        for entry in seed.entries {
            if !seed.trust_domain.owns(&entry.spiffe_id) {
                return Err(LoadError::ForeignSpiffeId {
                    spiffe_id: entry.spiffe_id,
                    trust_domain: seed.trust_domain,
                });
            }
            let cert_chain = read_certificates(base, &entry.cert_chain).await?;
            if cert_chain.is_empty() {
                return Err(LoadError::EmptyChain(entry.spiffe_id));
            }
            let private_key = read_private_key(base, &entry.private_key).await?;
            entries.push(Entry {
                selectors: entry.selectors,
                svid: X509Svid {
                    spiffe_id: entry.spiffe_id,
                    cert_chain,
                    private_key,
                    hint: entry.hint,
                },
            });
        }

        let mut federated_bundles = BTreeMap::new();
        for (td, seeded) in seed.federated_bundles {
            let mut federated = Bundle::new(td.clone());
            federated.x509_authorities = read_certificates(base, &seeded.x509_authorities).await?;
            if let Some(jwks) = &seeded.jwks {
                federated.jwt_authorities = read_file(base, jwks).await?;
            }
            federated_bundles.insert(td, federated);
        }

        {
            let mut state = manager.state.lock();
            state.entries = entries;
            state.federated_bundles = federated_bundles;
        }

        Ok(manager)
    }
}

#[tonic::async_trait]
impl Manager for StaticManager {
    fn subscribe(&self, selectors: &[Selector]) -> watch::Receiver<Arc<WorkloadUpdate>> {
        let mut state = self.state.lock();
        let (tx, rx) = watch::channel(Arc::new(state.snapshot(selectors)));
        state.subscribers.retain(|sub| !sub.tx.is_closed());
        state.subscribers.push(Subscriber {
            selectors: selectors.to_vec(),
            tx,
        });
        rx
    }

    fn snapshot(&self, selectors: &[Selector]) -> Arc<WorkloadUpdate> {
        Arc::new(self.state.lock().snapshot(selectors))
    }

    async fn fetch_jwt_svid(&self, _spiffe_id: &str, _audience: &[String]) -> Result<JwtSvid> {
        Err(Error::unavailable(
            "JWT-SVID minting is not supported by the static identity manager",
        ))
    }

    async fn validate_jwt_svid(&self, _token: &str, _audience: &str) -> Result<JwtValidation> {
        Err(Error::unavailable(
            "JWT-SVID validation is not supported by the static identity manager",
        ))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("unable to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid seed file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid PEM in {}: {source}", path.display())]
    Pem {
        path: PathBuf,
        #[source]
        source: pem::PemError,
    },

    #[error("no private key found in {}", .0.display())]
    MissingKey(PathBuf),

    #[error("entry {0} has an empty certificate chain")]
    EmptyChain(String),

    #[error("entry {spiffe_id} is not a member of trust domain {trust_domain}")]
    ForeignSpiffeId {
        spiffe_id: String,
        trust_domain: TrustDomain,
    },
}

#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct Seed {
    trust_domain: TrustDomain,
    #[serde(default)]
    bundle: Vec<PathBuf>,
    #[serde(default)]
    jwks: Option<PathBuf>,
    #[serde(default)]
    federated_bundles: BTreeMap<TrustDomain, SeedBundle>,
    #[serde(default)]
    entries: Vec<SeedEntry>,
}

#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct SeedBundle {
    #[serde(default)]
    x509_authorities: Vec<PathBuf>,
    #[serde(default)]
    jwks: Option<PathBuf>,
}

#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct SeedEntry {
    spiffe_id: String,
    selectors: Vec<Selector>,
    cert_chain: Vec<PathBuf>,
    private_key: PathBuf,
    #[serde(default)]
    hint: String,
}

async fn read_file(base: &Path, rel: &Path) -> core::result::Result<Bytes, LoadError> {
    let path = base.join(rel);
    tokio::fs::read(&path)
        .await
        .map(Bytes::from)
        .map_err(|source| LoadError::Read { path, source })
}

/// Reads one or more certificates per file, PEM or DER.
async fn read_certificates(base: &Path, files: &[PathBuf]) -> core::result::Result<Vec<Bytes>, LoadError> {
    let mut certs = Vec::new();
    for rel in files {
        let data = read_file(base, rel).await?;
        if !pem::is_pem(&data) {
            certs.push(data);
            continue;
        }
        let text = String::from_utf8_lossy(&data);
        let blocks = pem::decode_all(&text).map_err(|source| LoadError::Pem {
            path: base.join(rel),
            source,
        })?;
        certs.extend(
            blocks
                .into_iter()
                .filter(|block| block.label == pem::CERTIFICATE)
                .map(|block| Bytes::from(block.der)),
        );
    }
    Ok(certs)
}

async fn read_private_key(base: &Path, rel: &Path) -> core::result::Result<Bytes, LoadError> {
    let data = read_file(base, rel).await?;
    if !pem::is_pem(&data) {
        return Ok(data);
    }
    let text = String::from_utf8_lossy(&data);
    let blocks = pem::decode_all(&text).map_err(|source| LoadError::Pem {
        path: base.join(rel),
        source,
    })?;
    blocks
        .into_iter()
        .find(|block| block.label.ends_with(pem::PRIVATE_KEY))
        .map(|block| Bytes::from(block.der))
        .ok_or_else(|| LoadError::MissingKey(base.join(rel)))
}
