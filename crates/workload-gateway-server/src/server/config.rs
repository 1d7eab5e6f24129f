use crate::server::{address::BindAddr, endpoint};
use anyhow::{Context, bail};
use clap::Parser;
use std::path::PathBuf;
use workload_gateway_core::types::TrustDomain;

/// Runtime configuration for the `workload-gateway` binary.
///
/// Every option can also be supplied through the environment, and a `.env`
/// file in the working directory is loaded before parsing.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "workload-gateway",
    version,
    about = "Serves the SPIFFE Workload API, Envoy SDS and gRPC health to local workloads"
)]
pub struct CliArgs {
    /// Address to listen on.
    ///
    /// A Unix socket (`unix:///run/agent.sock` or an absolute path) or a TCP
    /// address (`tcp://127.0.0.1:8081` or `127.0.0.1:8081`).
    ///
    /// Environment variable: `BIND_ADDR`
    #[arg(long, env = "BIND_ADDR", default_value_t = String::from("unix:///tmp/spire-agent/public/api.sock"))]
    pub bind_addr: String,

    /// Trust domain identities are issued in, e.g. `example.org`.
    ///
    /// Environment variable: `TRUST_DOMAIN`
    #[arg(long, env = "TRUST_DOMAIN")]
    pub trust_domain: String,

    /// JSON file with the bundles and registration entries served to
    /// workloads.
    ///
    /// Environment variable: `IDENTITIES`
    #[arg(long, env = "IDENTITIES")]
    pub identities: PathBuf,

    /// Claims kept on JWT-SVIDs from foreign trust domains in addition to the
    /// registered claims. Comma separated.
    ///
    /// Environment variable: `ALLOWED_FOREIGN_JWT_CLAIMS`
    #[arg(long, env = "ALLOWED_FOREIGN_JWT_CLAIMS", value_delimiter = ',')]
    pub allowed_foreign_jwt_claims: Vec<String>,

    /// Serve JWT bundles to workloads without an identity.
    ///
    /// Environment variable: `ALLOW_UNAUTHENTICATED_VERIFIERS`
    #[arg(long, env = "ALLOW_UNAUTHENTICATED_VERIFIERS", default_value_t = false)]
    pub allow_unauthenticated_verifiers: bool,

    /// SDS resource name of the workload's first X.509-SVID.
    ///
    /// Environment variable: `DEFAULT_SVID_NAME`
    #[arg(long, env = "DEFAULT_SVID_NAME", default_value_t = String::from(endpoint::DEFAULT_SVID_NAME))]
    pub default_svid_name: String,

    /// SDS resource name of the trust domain bundle.
    ///
    /// Environment variable: `DEFAULT_BUNDLE_NAME`
    #[arg(long, env = "DEFAULT_BUNDLE_NAME", default_value_t = String::from(endpoint::DEFAULT_BUNDLE_NAME))]
    pub default_bundle_name: String,

    /// SDS v3 resource name of the trust domain and all federated bundles.
    ///
    /// Environment variable: `DEFAULT_ALL_BUNDLES_NAME`
    #[arg(long, env = "DEFAULT_ALL_BUNDLES_NAME", default_value_t = String::from(endpoint::DEFAULT_ALL_BUNDLES_NAME))]
    pub default_all_bundles_name: String,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub bind_addr: BindAddr,
    pub trust_domain: TrustDomain,
    pub identities: PathBuf,
    pub allowed_foreign_jwt_claims: Vec<String>,
    pub allow_unauthenticated_verifiers: bool,
    pub default_svid_name: String,
    pub default_bundle_name: String,
    pub default_all_bundles_name: String,
}

impl TryFrom<CliArgs> for AgentConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        let bind_addr: BindAddr = args
            .bind_addr
            .parse()
            .with_context(|| format!("BIND_ADDR `{}`", args.bind_addr))?;
        if let BindAddr::Unsupported { network, .. } = &bind_addr {
            bail!("BIND_ADDR uses unsupported network `{network}`");
        }

        let trust_domain = TrustDomain::parse(&args.trust_domain).context("TRUST_DOMAIN")?;

        let names = [
            ("DEFAULT_SVID_NAME", &args.default_svid_name),
            ("DEFAULT_BUNDLE_NAME", &args.default_bundle_name),
            ("DEFAULT_ALL_BUNDLES_NAME", &args.default_all_bundles_name),
        ];
        for (var, name) in names {
            if name.trim().is_empty() {
                bail!("{var} must not be empty");
            }
        }
        if args.default_bundle_name == args.default_all_bundles_name {
            bail!("DEFAULT_BUNDLE_NAME and DEFAULT_ALL_BUNDLES_NAME must differ");
        }

        let allowed_foreign_jwt_claims = args
            .allowed_foreign_jwt_claims
            .into_iter()
            .map(|claim| claim.trim().to_string())
            .filter(|claim| !claim.is_empty())
            .collect();

        Ok(Self {
            bind_addr,
            trust_domain,
            identities: args.identities,
            allowed_foreign_jwt_claims,
            allow_unauthenticated_verifiers: args.allow_unauthenticated_verifiers,
            default_svid_name: args.default_svid_name,
            default_bundle_name: args.default_bundle_name,
            default_all_bundles_name: args.default_all_bundles_name,
        })
    }
}
