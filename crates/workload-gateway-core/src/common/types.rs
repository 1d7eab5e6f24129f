//! # Identity Types
//!
//! Domain types exchanged between the endpoint services and the identity
//! manager. They are transport-agnostic: the Workload API and the SDS
//! handlers each translate them into their own protobuf messages.
//!
//! ## Overview
//!
//! - [`Selector`] - a `<type>:<value>` property produced by peer attestation
//! - [`TrustDomain`] - the namespace SPIFFE IDs are issued under
//! - [`X509Svid`] / [`JwtSvid`] - issued identity documents
//! - [`Bundle`] - trust anchors for one trust domain
//! - [`WorkloadUpdate`] - a snapshot of everything a workload is entitled to
//!
//! Certificates and keys are carried as ASN.1 DER in [`Bytes`] so snapshots
//! can be shared across streams without copying key material.

use bytes::Bytes;
use core::fmt;
use core::str::FromStr;
use std::collections::BTreeMap;

const SPIFFE_SCHEME: &str = "spiffe://";

/// A single attested property of a workload, such as `unix:uid:1000`.
///
/// The type is everything before the first `:`, the value everything after
/// it, so `unix:uid:1000` has type `unix` and value `uid:1000`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Selector {
    pub kind: String,
    pub value: String,
}

impl Selector {
    pub fn new(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.value)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid selector `{0}`: expected `<type>:<value>`")]
    Selector(String),

    #[error("invalid trust domain `{0}`")]
    TrustDomain(String),
}

impl FromStr for Selector {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((kind, value)) if !kind.is_empty() && !value.is_empty() => {
                Ok(Self::new(kind, value))
            }
            _ => Err(ParseError::Selector(s.to_string())),
        }
    }
}

impl TryFrom<String> for Selector {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Selector> for String {
    fn from(selector: Selector) -> Self {
        selector.to_string()
    }
}

/// The trust domain a SPIFFE ID belongs to, stored without the
/// `spiffe://` scheme.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TrustDomain(String);

impl TrustDomain {
    /// Accepts either a bare name (`example.org`) or a trust domain ID
    /// (`spiffe://example.org`).
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let name = s.strip_prefix(SPIFFE_SCHEME).unwrap_or(s);
        let valid = !name.is_empty()
            && name.chars().all(|c| {
                c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '-' | '_')
            });
        if !valid {
            return Err(ParseError::TrustDomain(s.to_string()));
        }
        Ok(Self(name.to_string()))
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    /// The trust domain ID, e.g. `spiffe://example.org`.
    pub fn id(&self) -> String {
        format!("{SPIFFE_SCHEME}{}", self.0)
    }

    /// Returns the trust domain of a SPIFFE ID.
    pub fn of(spiffe_id: &str) -> Result<Self, ParseError> {
        let rest = spiffe_id
            .strip_prefix(SPIFFE_SCHEME)
            .ok_or_else(|| ParseError::TrustDomain(spiffe_id.to_string()))?;
        let name = rest.split('/').next().unwrap_or_default();
        Self::parse(name)
    }

    /// Whether the SPIFFE ID was issued in this trust domain.
    pub fn owns(&self, spiffe_id: &str) -> bool {
        Self::of(spiffe_id).is_ok_and(|td| td == *self)
    }
}

impl fmt::Display for TrustDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TrustDomain {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TrustDomain> for String {
    fn from(td: TrustDomain) -> Self {
        td.0
    }
}

/// An X.509-SVID with its private key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct X509Svid {
    pub spiffe_id: String,
    /// DER certificates, leaf first.
    pub cert_chain: Vec<Bytes>,
    /// Unencrypted PKCS#8 DER private key.
    pub private_key: Bytes,
    pub hint: String,
}

impl X509Svid {
    /// The certificate chain as concatenated DER, the Workload API encoding.
    pub fn chain_der(&self) -> Vec<u8> {
        concat(&self.cert_chain)
    }
}

/// A JWT-SVID minted for a specific audience.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JwtSvid {
    pub spiffe_id: String,
    /// JWS compact serialization.
    pub token: String,
    pub hint: String,
}

/// Result of validating a JWT-SVID.
#[derive(Clone, Debug, PartialEq)]
pub struct JwtValidation {
    pub spiffe_id: String,
    pub claims: prost_types::Struct,
}

/// Trust anchors for a single trust domain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bundle {
    pub trust_domain: TrustDomain,
    /// DER CA certificates.
    pub x509_authorities: Vec<Bytes>,
    /// JWKS document holding the JWT signing keys.
    pub jwt_authorities: Bytes,
}

impl Bundle {
    pub fn new(trust_domain: TrustDomain) -> Self {
        Self {
            trust_domain,
            x509_authorities: Vec::new(),
            jwt_authorities: Bytes::new(),
        }
    }

    /// The X.509 authorities as concatenated DER.
    pub fn x509_der(&self) -> Vec<u8> {
        concat(&self.x509_authorities)
    }
}

/// Everything a workload with a given set of selectors is entitled to at one
/// point in time.
///
/// `revision` increases every time the manager publishes a new snapshot and
/// is used as the SDS `version_info`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkloadUpdate {
    pub revision: u64,
    pub identities: Vec<X509Svid>,
    pub bundle: Option<Bundle>,
    pub federated_bundles: BTreeMap<TrustDomain, Bundle>,
}

impl WorkloadUpdate {
    /// The local bundle followed by all federated bundles.
    pub fn bundles(&self) -> impl Iterator<Item = &Bundle> {
        self.bundle.iter().chain(self.federated_bundles.values())
    }

    pub fn identity(&self, spiffe_id: &str) -> Option<&X509Svid> {
        self.identities.iter().find(|svid| svid.spiffe_id == spiffe_id)
    }
}

fn concat(blobs: &[Bytes]) -> Vec<u8> {
    let mut out = Vec::with_capacity(blobs.iter().map(Bytes::len).sum());
    for blob in blobs {
        out.extend_from_slice(blob);
    }
    out
}
