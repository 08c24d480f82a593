use crate::server::telemetry;
use core::{
    fmt,
    task::{Context, Poll},
    time::Duration,
};
use futures::future::{self, BoxFuture};
use grin_account_core::Error;
use parking_lot::{Mutex, RwLock};
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use tokio::time::Instant;
use tokio_util::sync::DropGuard;
use tonic::{body::Body, transport::Channel};
use tower::{BoxError, Service};

/// One dialed endpoint and its passive health.
///
/// A transport failure ejects the endpoint until its cooldown elapses or a
/// call through it succeeds again. Clones share the health state, so a
/// rebuilt rotation keeps it.
#[derive(Clone)]
pub(crate) struct Backend {
    addr: Arc<str>,
    channel: Channel,
    ejected_until: Arc<Mutex<Option<Instant>>>,
}

impl Backend {
    pub(crate) fn new(addr: &str, channel: Channel) -> Self {
        Self {
            addr: Arc::from(addr),
            channel,
            ejected_until: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn addr(&self) -> &str {
        &self.addr
    }

    fn is_ejected(&self, now: Instant) -> bool {
        self.ejected_until.lock().is_some_and(|until| now < until)
    }

    fn eject(&self, service: &str, cooldown: Duration, error: &dyn fmt::Display) {
        *self.ejected_until.lock() = Some(Instant::now() + cooldown);
        telemetry::increment_endpoint_ejections(service);
        tracing::warn!(
            %service,
            addr = %self.addr,
            %error,
            ?cooldown,
            "endpoint failed; ejected from rotation"
        );
    }

    fn restore(&self, service: &str) {
        if self.ejected_until.lock().take().is_some() {
            tracing::info!(%service, addr = %self.addr, "endpoint recovered; back in rotation");
        }
    }
}

/// Current backends plus the shared round-robin cursor.
///
/// Readers take a cheap snapshot; the watcher swaps in a whole new list.
pub(crate) struct Rotation {
    backends: RwLock<Arc<[Backend]>>,
    next: AtomicUsize,
    cooldown: Duration,
}

impl Rotation {
    pub(crate) fn new(backends: Vec<Backend>, cooldown: Duration) -> Self {
        Self {
            backends: RwLock::new(backends.into()),
            next: AtomicUsize::new(0),
            cooldown,
        }
    }

    pub(crate) fn snapshot(&self) -> Arc<[Backend]> {
        self.backends.read().clone()
    }

    pub(crate) fn replace(&self, backends: Vec<Backend>) {
        *self.backends.write() = backends.into();
    }

    /// Next index in `0..len` using relaxed atomic round-robin. `len` must be
    /// non-zero.
    fn next_index(&self, len: usize) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) % len
    }

    /// Next backend in rotation that is not ejected.
    ///
    /// When every backend is ejected the rotation keeps cycling through all
    /// of them, so a recovered endpoint is found without waiting for the
    /// cooldown. `None` only for an empty slice.
    fn pick<'a>(&self, backends: &'a [Backend]) -> Option<&'a Backend> {
        let len = backends.len();
        let now = Instant::now();
        let mut fallback = None;
        for _ in 0..len {
            let backend = &backends[self.next_index(len)];
            if !backend.is_ejected(now) {
                return Some(backend);
            }
            fallback.get_or_insert(backend);
        }
        // Net advance of one, so the fallback still rotates.
        self.next.fetch_sub(len.saturating_sub(1), Ordering::Relaxed);
        fallback
    }
}

/// Round-robin channel over every live endpoint of one service.
///
/// Implements `tower::Service` for gRPC requests, so it plugs into any
/// generated client: `CaptchaServiceClient::new(channel)`. Each readiness
/// check picks the next healthy endpoint in rotation. An endpoint whose
/// connection fails (at readiness or during a call) is ejected for the
/// configured cooldown and skipped meanwhile.
///
/// Clones share the rotation. The background watcher stops once the last
/// clone is dropped.
pub struct BalancedChannel {
    service: Arc<str>,
    rotation: Arc<Rotation>,
    picked: Option<Backend>,
    _watcher: Arc<DropGuard>,
}

impl BalancedChannel {
    pub(crate) fn new(service: &str, rotation: Arc<Rotation>, watcher: DropGuard) -> Self {
        Self {
            service: Arc::from(service),
            rotation,
            picked: None,
            _watcher: Arc::new(watcher),
        }
    }

    /// Logical name of the service this channel reaches.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Addresses currently in rotation, ejected ones included.
    pub fn endpoints(&self) -> Vec<String> {
        self.rotation
            .snapshot()
            .iter()
            .map(|b| b.addr().to_string())
            .collect()
    }

    /// Addresses currently eligible for new calls.
    pub fn healthy_endpoints(&self) -> Vec<String> {
        let now = Instant::now();
        self.rotation
            .snapshot()
            .iter()
            .filter(|b| !b.is_ejected(now))
            .map(|b| b.addr().to_string())
            .collect()
    }

    fn unavailable(&self, reason: &str) -> BoxError {
        Box::new(Error::ConnectorUnavailable {
            service: self.service.to_string(),
            reason: reason.to_string(),
        })
    }
}

impl Clone for BalancedChannel {
    fn clone(&self) -> Self {
        // A clone starts unready, as tower expects.
        Self {
            service: self.service.clone(),
            rotation: self.rotation.clone(),
            picked: None,
            _watcher: self._watcher.clone(),
        }
    }
}

impl fmt::Debug for BalancedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BalancedChannel")
            .field("service", &self.service)
            .field("endpoints", &self.endpoints())
            .finish_non_exhaustive()
    }
}

impl Service<http::Request<Body>> for BalancedChannel {
    type Response = http::Response<Body>;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let backends = self.rotation.snapshot();

        for _ in 0..backends.len().max(1) {
            if self.picked.is_none() {
                let Some(next) = self.rotation.pick(&backends) else {
                    return Poll::Ready(Err(self.unavailable("no endpoints in rotation")));
                };
                self.picked = Some(next.clone());
            }
            let Some(backend) = self.picked.as_mut() else {
                continue;
            };

            match backend.channel.poll_ready(cx) {
                Poll::Ready(Ok(())) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => {
                    backend.eject(&self.service, self.rotation.cooldown, &e);
                    self.picked = None;
                }
            }
        }

        Poll::Ready(Err(self.unavailable("every endpoint in rotation failed")))
    }

    fn call(&mut self, req: http::Request<Body>) -> Self::Future {
        let Some(mut backend) = self.picked.take() else {
            let err = self.unavailable("call issued before poll_ready");
            return Box::pin(future::ready(Err(err)));
        };

        let fut = backend.channel.call(req);
        let service = self.service.clone();
        let cooldown = self.rotation.cooldown;
        Box::pin(async move {
            // Channel errors are transport failures; gRPC statuses arrive
            // inside a successful response.
            match fut.await {
                Ok(response) => {
                    backend.restore(&service);
                    Ok(response)
                }
                Err(e) => {
                    backend.eject(&service, cooldown, &e);
                    Err(BoxError::from(e))
                }
            }
        })
    }
}
