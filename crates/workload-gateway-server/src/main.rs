use anyhow::{Context, bail};
use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use workload_gateway_server::server::{
    attestor::UnixAttestor,
    config::{AgentConfig, CliArgs},
    endpoint::{Config, Endpoint},
    manager::StaticManager,
    telemetry::{Metrics, init_telemetry},
};

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = AgentConfig::try_from(args)?;

    let providers = init_telemetry()?;
    let result = run(config, providers.metrics.clone()).await;
    if let Err(err) = &result {
        tracing::error!("Endpoint failed: {err:#}");
    }
    providers.shutdown();
    result
}

async fn run(config: AgentConfig, metrics: Metrics) -> anyhow::Result<()> {
    let manager = StaticManager::load(&config.identities)
        .await
        .with_context(|| format!("loading identities from {}", config.identities.display()))?;
    if manager.trust_domain() != &config.trust_domain {
        bail!(
            "identities file is for trust domain {}, expected {}",
            manager.trust_domain(),
            config.trust_domain
        );
    }

    if cfg!(debug_assertions) {
        tracing::info!("Starting with full config: {config:#?}");
    }

    let mut endpoint_config = Config::new(
        config.bind_addr,
        Arc::new(manager),
        Arc::new(UnixAttestor::default()),
        config.trust_domain,
    );
    endpoint_config.metrics = metrics;
    endpoint_config.allow_unauthenticated_verifiers = config.allow_unauthenticated_verifiers;
    endpoint_config.allowed_foreign_jwt_claims = config.allowed_foreign_jwt_claims;
    endpoint_config.default_svid_name = config.default_svid_name;
    endpoint_config.default_bundle_name = config.default_bundle_name;
    endpoint_config.default_all_bundles_name = config.default_all_bundles_name;

    let mut endpoint = Endpoint::new(endpoint_config);
    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    endpoint.run(cancel).await?;
    tracing::info!("Endpoint shut down successfully");
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
        () = cancel.cancelled() => return,
    }

    tracing::info!("Shutdown signal received, terminating gracefully...");
    cancel.cancel();
}
