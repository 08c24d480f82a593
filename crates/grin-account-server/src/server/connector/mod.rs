//! Client channels to dependencies, resolved through [`Discovery`].
//!
//! [`ServiceConnector::connect`] turns a logical service name into a
//! [`BalancedChannel`]: a `tower::Service` that generated tonic clients use
//! directly and that spreads calls round-robin over every live endpoint of
//! that service. A background watcher follows the discovery backend and
//! rebuilds the rotation when membership changes.

mod balance;

pub use balance::BalancedChannel;

use crate::server::discovery::{Discovery, EndpointSet};
use balance::{Backend, Rotation};
use core::time::Duration;
use grin_account_core::{Error, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Certificate, ClientTlsConfig, Endpoint};

/// How dependency connections are secured.
#[derive(Clone, Debug, Default)]
pub enum TransportSecurity {
    /// Plaintext HTTP/2.
    #[default]
    Insecure,
    /// TLS verifying `domain`, trusting the platform roots plus `ca_pem`.
    Tls {
        domain: String,
        ca_pem: Option<Vec<u8>>,
    },
}

#[derive(Clone, Debug)]
pub struct ConnectorConfig {
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
    /// Send keepalive pings even with no active streams.
    pub keepalive_while_idle: bool,
    pub connect_timeout: Duration,
    /// How long an endpoint that failed a call stays out of rotation.
    pub eject_cooldown: Duration,
    pub security: TransportSecurity,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(10),
            keepalive_timeout: Duration::from_millis(100),
            keepalive_while_idle: true,
            connect_timeout: Duration::from_secs(5),
            eject_cooldown: Duration::from_secs(5),
            security: TransportSecurity::Insecure,
        }
    }
}

impl ConnectorConfig {
    /// Dial settings for one `host:port` (or full URI).
    pub fn endpoint(&self, addr: &str) -> Result<Endpoint> {
        let uri = if addr.contains("://") {
            addr.to_string()
        } else {
            let scheme = match self.security {
                TransportSecurity::Insecure => "http",
                TransportSecurity::Tls { .. } => "https",
            };
            format!("{scheme}://{addr}")
        };

        let endpoint = Endpoint::from_shared(uri)
            .map_err(|e| Error::invalid(format!("invalid endpoint `{addr}`: {e}")))?
            .connect_timeout(self.connect_timeout)
            .http2_keep_alive_interval(self.keepalive_interval)
            .keep_alive_timeout(self.keepalive_timeout)
            .keep_alive_while_idle(self.keepalive_while_idle);

        match &self.security {
            TransportSecurity::Insecure => Ok(endpoint),
            TransportSecurity::Tls { domain, ca_pem } => {
                let mut tls = ClientTlsConfig::new()
                    .domain_name(domain.clone())
                    .with_native_roots();
                if let Some(pem) = ca_pem {
                    tls = tls.ca_certificate(Certificate::from_pem(pem));
                }
                endpoint
                    .tls_config(tls)
                    .map_err(|e| Error::invalid(format!("invalid TLS config for `{addr}`: {e}")))
            }
        }
    }
}

/// Builds [`BalancedChannel`]s from a discovery backend.
#[derive(Clone)]
pub struct ServiceConnector {
    discovery: Arc<dyn Discovery>,
    config: ConnectorConfig,
}

impl ServiceConnector {
    pub fn new(discovery: Arc<dyn Discovery>, config: ConnectorConfig) -> Self {
        Self { discovery, config }
    }

    /// Resolves `service` and dials every endpoint in its current set.
    ///
    /// Endpoints that refuse the initial dial are left out of the rotation
    /// until the next membership change.
    ///
    /// # Errors
    ///
    /// [`Error::ConnectorUnavailable`] if the name cannot be resolved, its set
    /// is empty, or no endpoint accepts a connection.
    pub async fn connect(&self, service: &str) -> Result<BalancedChannel> {
        let unavailable = |reason: String| Error::ConnectorUnavailable {
            service: service.to_string(),
            reason,
        };

        let mut updates = self
            .discovery
            .resolve(service)
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        let initial = updates.borrow_and_update().clone();
        if initial.is_empty() {
            return Err(unavailable("no live endpoints".to_string()));
        }

        let mut backends = Vec::with_capacity(initial.len());
        let mut last_error = None;
        for addr in initial.iter() {
            let dialed = match self.config.endpoint(addr) {
                Ok(endpoint) => endpoint.connect().await.map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            match dialed {
                Ok(channel) => backends.push(Backend::new(addr, channel)),
                Err(reason) => {
                    tracing::warn!(%service, %addr, %reason, "endpoint refused initial dial");
                    last_error = Some(reason);
                }
            }
        }
        if backends.is_empty() {
            let reason = last_error.unwrap_or_else(|| "no reachable endpoints".to_string());
            return Err(unavailable(reason));
        }

        tracing::info!(
            %service,
            connected = backends.len(),
            resolved = initial.len(),
            "dependency connected"
        );

        let rotation = Arc::new(Rotation::new(backends, self.config.eject_cooldown));
        let stop = CancellationToken::new();
        tokio::spawn(watch_endpoints(
            service.to_string(),
            updates,
            rotation.clone(),
            self.config.clone(),
            stop.clone(),
        ));

        Ok(BalancedChannel::new(service, rotation, stop.drop_guard()))
    }
}

/// Rebuilds `rotation` from every new snapshot until `stop` fires or the
/// backend closes the stream.
async fn watch_endpoints(
    service: String,
    mut updates: watch::Receiver<EndpointSet>,
    rotation: Arc<Rotation>,
    config: ConnectorConfig,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    tracing::debug!(%service, "endpoint updates closed; keeping the last rotation");
                    break;
                }
                let set = updates.borrow_and_update().clone();
                rebalance(&service, &rotation, &set, &config);
            }
        }
    }
}

/// Replaces the rotation with `set`, keeping the channel of every endpoint
/// that is still present and dialing new ones lazily.
fn rebalance(service: &str, rotation: &Rotation, set: &EndpointSet, config: &ConnectorConfig) {
    let current = rotation.snapshot();
    let mut next = Vec::with_capacity(set.len());

    for addr in set.iter() {
        if let Some(existing) = current.iter().find(|b| b.addr() == addr) {
            next.push(existing.clone());
            continue;
        }
        match config.endpoint(addr) {
            Ok(endpoint) => next.push(Backend::new(addr, endpoint.connect_lazy())),
            Err(e) => tracing::warn!(%service, %addr, error = %e, "skipping endpoint"),
        }
    }

    tracing::info!(
        %service,
        before = current.len(),
        after = next.len(),
        "endpoint set changed; rotation rebuilt"
    );
    rotation.replace(next);
}
