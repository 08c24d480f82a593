//! Process lifecycle: register, serve, drain, deregister.
//!
//! ```text
//! Starting -> Registered -> Serving -> Draining -> Stopped
//! ```
//!
//! [`Lifecycle::run`] advertises the instance to discovery (fatal on
//! failure), serves until the shutdown token is cancelled, lets in-flight
//! calls finish within the drain timeout, and always attempts to
//! deregister before reporting [`LifecycleState::Stopped`].

use crate::server::{
    discovery::{Discovery, Registration, RegistrationRecord},
    interceptor::{ExemptionTable, HEALTH_SERVICE, InterceptorChain, REFLECTION_SERVICE},
    service::{AccountService, build_user_service},
};
use core::{fmt, time::Duration};
use grin_account_core::{
    Error, Result,
    proto::{FILE_DESCRIPTOR_SET, account::user_service_server::UserServiceServer},
};
use std::sync::Arc;
use tokio::{net::TcpListener, signal, sync::watch, time::timeout};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic_reflection::server::Builder;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Starting,
    Registered,
    Serving,
    Draining,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::Registered => "registered",
            Self::Serving => "serving",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Timeouts and identity used by [`Lifecycle::run`].
#[derive(Clone, Debug)]
pub struct LifecycleSettings {
    pub record: RegistrationRecord,
    pub registration_ttl: Duration,
    pub registration_timeout: Duration,
    pub drain_timeout: Duration,
    pub deregister_timeout: Duration,
}

impl LifecycleSettings {
    pub fn new(record: RegistrationRecord) -> Self {
        Self {
            record,
            registration_ttl: Duration::from_secs(10),
            registration_timeout: Duration::from_secs(3),
            drain_timeout: Duration::from_secs(10),
            deregister_timeout: Duration::from_secs(3),
        }
    }
}

pub struct Lifecycle {
    settings: LifecycleSettings,
    discovery: Arc<dyn Discovery>,
    shutdown: CancellationToken,
    state: watch::Sender<LifecycleState>,
}

impl Lifecycle {
    pub fn new(
        settings: LifecycleSettings,
        discovery: Arc<dyn Discovery>,
        shutdown: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(LifecycleState::Starting);
        Self {
            settings,
            discovery,
            shutdown,
            state,
        }
    }

    /// Observe state transitions.
    pub fn state(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Cancelling this token begins the drain.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn set_state(&self, next: LifecycleState) {
        let previous = self.state.send_replace(next);
        tracing::info!(%previous, %next, record = %self.settings.record, "lifecycle transition");
    }

    /// Serves `handler` on `listener` until the shutdown token is cancelled.
    ///
    /// # Errors
    ///
    /// - [`Error::RegistrationFailed`] if the instance could not be advertised
    ///   in time; nothing is served.
    /// - [`Error::InternalFault`] if the server itself failed.
    pub async fn run(self, listener: TcpListener, handler: AccountService) -> Result<()> {
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::fault(format!("listener has no local address: {e}")))?;

        let exemptions = ExemptionTable::new()
            .with_handler::<UserServiceServer<AccountService>, _>(&handler)
            .with_service(HEALTH_SERVICE)
            .with_service(REFLECTION_SERVICE);
        let chain = InterceptorChain::new(handler.codec().clone(), exemptions, self.shutdown.clone());

        let (health_reporter, health_service) = tonic_health::server::health_reporter();
        let reflection = Builder::configure()
            .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
            .build_v1()
            .map_err(|e| Error::fault(format!("failed to build reflection service: {e}")))?;

        let mut registration = match self.register().await {
            Ok(registration) => registration,
            Err(e) => {
                self.set_state(LifecycleState::Stopped);
                return Err(e);
            }
        };
        self.set_state(LifecycleState::Registered);

        health_reporter
            .set_serving::<UserServiceServer<AccountService>>()
            .await;

        let server = Server::builder()
            .layer(chain)
            .add_service(health_service)
            .add_service(reflection)
            .add_service(build_user_service(handler))
            .serve_with_incoming_shutdown(
                TcpListenerStream::new(listener),
                self.shutdown.clone().cancelled_owned(),
            );
        tokio::pin!(server);

        self.set_state(LifecycleState::Serving);
        tracing::info!(%local_addr, "accepting calls");

        let stopped_on_its_own = tokio::select! {
            biased;
            () = self.shutdown.cancelled() => None,
            res = &mut server => Some(res),
        };

        let served = match stopped_on_its_own {
            Some(res) => res,
            None => {
                self.set_state(LifecycleState::Draining);
                health_reporter
                    .set_not_serving::<UserServiceServer<AccountService>>()
                    .await;

                match timeout(self.settings.drain_timeout, &mut server).await {
                    Ok(res) => res,
                    Err(_) => {
                        tracing::warn!(
                            timeout = ?self.settings.drain_timeout,
                            "drain timed out; deregistering with calls still in flight"
                        );
                        Ok(())
                    }
                }
            }
        };

        self.deregister(&mut *registration).await;
        self.set_state(LifecycleState::Stopped);

        served.map_err(|e| Error::fault(format!("server failed: {e}")))
    }

    async fn register(&self) -> Result<Box<dyn Registration>> {
        let settings = &self.settings;
        match timeout(
            settings.registration_timeout,
            self.discovery
                .register(&settings.record, settings.registration_ttl),
        )
        .await
        {
            Ok(Ok(registration)) => Ok(registration),
            Ok(Err(e)) => {
                tracing::error!(record = %settings.record, error = %e, "registration failed");
                Err(match e {
                    Error::RegistrationFailed { .. } => e,
                    other => Error::RegistrationFailed {
                        reason: other.to_string(),
                    },
                })
            }
            Err(_) => {
                tracing::error!(
                    record = %settings.record,
                    timeout = ?settings.registration_timeout,
                    "registration timed out"
                );
                Err(Error::RegistrationFailed {
                    reason: format!("timed out after {:?}", settings.registration_timeout),
                })
            }
        }
    }

    /// Failures are logged and otherwise ignored.
    async fn deregister(&self, registration: &mut dyn Registration) {
        let record = registration.record().clone();
        match timeout(self.settings.deregister_timeout, registration.deregister()).await {
            Ok(Ok(())) => tracing::info!(%record, "deregistered"),
            Ok(Err(e)) => tracing::warn!(%record, error = %e, "deregistration failed"),
            Err(_) => tracing::warn!(
                %record,
                timeout = ?self.settings.deregister_timeout,
                "deregistration timed out"
            ),
        }
    }
}

/// Completes on SIGINT (Ctrl+C) or, on unix, SIGTERM.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }
}

/// Cancels `token` once a termination signal arrives.
pub async fn cancel_on_signal(token: CancellationToken) {
    shutdown_signal().await;
    tracing::info!("Shutdown signal received, terminating gracefully...");
    token.cancel();
}
