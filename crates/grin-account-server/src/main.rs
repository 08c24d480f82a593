use clap::Parser;
use grin_account_core::token::TokenCodec;
use grin_account_server::server::{
    config::{CliArgs, ServerConfig},
    connector::ServiceConnector,
    discovery::{Discovery, EtcdDiscovery, StaticDiscovery},
    lifecycle::{Lifecycle, cancel_on_signal},
    service::{AccountService, Argon2Hasher, MemoryUserStore, RemoteCaptcha},
    telemetry::init_telemetry,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry()?;
    log_startup_info(&config);

    let discovery = discovery_backend(&config).await?;

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let listener = TcpListener::bind(config.listen_addr()).await?;
    let lifecycle = Lifecycle::new(config.lifecycle_settings(), discovery.clone(), shutdown);

    let connector = ServiceConnector::new(discovery, config.connector_config());
    let captcha = RemoteCaptcha::connect(&connector, &config.captcha_service).await?;

    let handler = AccountService::new(
        TokenCodec::with_ttl(&config.secret, config.token_ttl),
        Arc::new(MemoryUserStore::new()),
        Arc::new(Argon2Hasher::default()),
        Arc::new(captcha),
    );

    let res = lifecycle.run(listener, handler).await;
    providers.shutdown();
    res?;

    tracing::info!("Service shut down successfully");
    Ok(())
}

async fn discovery_backend(config: &ServerConfig) -> anyhow::Result<Arc<dyn Discovery>> {
    if config.registry_endpoints.is_empty() {
        tracing::info!("Using static discovery");
        return Ok(Arc::new(StaticDiscovery::from_entries(&config.dependencies)?));
    }

    tracing::info!(endpoints = ?config.registry_endpoints, prefix = %config.registry_prefix, "Using etcd discovery");
    let etcd = EtcdDiscovery::connect(
        &config.registry_endpoints,
        &config.registry_prefix,
        config.registration_timeout,
    )
    .await?;
    Ok(Arc::new(etcd))
}

fn log_startup_info(config: &ServerConfig) {
    if cfg!(debug_assertions) {
        tracing::info!(
            "Starting account service on {} with full config: {:#?}",
            config.listen_addr(),
            config
        );
    } else {
        tracing::info!(
            "Starting account service {} on {} (advertised as {})",
            config.name,
            config.listen_addr(),
            config.registration_record().address()
        );
    }
}
