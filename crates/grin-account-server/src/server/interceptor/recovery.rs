use super::status_response;
use crate::server::telemetry;
use core::{
    any::Any,
    panic::AssertUnwindSafe,
    pin::Pin,
    task::{Context, Poll},
};
use futures::{
    FutureExt,
    future::{self, BoxFuture},
};
use grin_account_core::{Error, error::INTERNAL_MESSAGE};
use http::HeaderMap;
use http_body::{Body, Frame, SizeHint};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tower::{Layer, Service};

/// Outermost stage: drain gate and panic boundary.
#[derive(Clone)]
pub struct RecoveryLayer {
    shutdown: CancellationToken,
}

impl RecoveryLayer {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self { shutdown }
    }
}

impl<S> Layer<S> for RecoveryLayer {
    type Service = RecoveryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RecoveryService {
            inner,
            shutdown: self.shutdown.clone(),
        }
    }
}

/// See [`RecoveryLayer`].
///
/// A panic while the inner service builds its response future, while that
/// future is polled, or while a streaming response body is polled is logged
/// and becomes `INTERNAL "internal error"`. Only the faulting call is
/// affected.
#[derive(Clone)]
pub struct RecoveryService<S> {
    inner: S,
    shutdown: CancellationToken,
}

impl<S, ReqBody, ResBody> Service<http::Request<ReqBody>> for RecoveryService<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>>,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ResBody: Default + Send + 'static,
{
    type Response = http::Response<GuardedBody<ResBody>>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: http::Request<ReqBody>) -> Self::Future {
        let path: Arc<str> = Arc::from(req.uri().path());

        if self.shutdown.is_cancelled() {
            tracing::debug!(%path, "refusing call while draining");
            let status = Status::from(Error::ServiceShutdown);
            return future::ready(Ok(status_response(&status))).boxed();
        }

        let inner = &mut self.inner;
        let started = std::panic::catch_unwind(AssertUnwindSafe(move || inner.call(req)));

        match started {
            Err(panic) => {
                log_panic(&path, "building the response", panic.as_ref());
                future::ready(Ok(internal_response())).boxed()
            }
            Ok(fut) => async move {
                match AssertUnwindSafe(fut).catch_unwind().await {
                    Ok(Ok(response)) => Ok(response.map(|body| GuardedBody::new(body, path))),
                    Ok(Err(e)) => Err(e),
                    Err(panic) => {
                        log_panic(&path, "awaiting the response", panic.as_ref());
                        Ok(internal_response())
                    }
                }
            }
            .boxed(),
        }
    }
}

fn internal_response<B: Default>() -> http::Response<B> {
    status_response(&Status::internal(INTERNAL_MESSAGE))
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic payload>")
}

fn log_panic(path: &str, stage: &'static str, panic: &(dyn Any + Send)) {
    tracing::error!(
        %path,
        stage,
        panic = panic_message(panic),
        "panic triggered; replying with internal error"
    );
    telemetry::increment_panics_recovered(stage);
}

pin_project_lite::pin_project! {
    /// Response body that turns a panic while polling into an `INTERNAL`
    /// trailers frame, then ends the stream.
    pub struct GuardedBody<B> {
        #[pin]
        inner: B,
        path: Option<Arc<str>>,
        faulted: bool,
    }
}

impl<B> GuardedBody<B> {
    fn new(inner: B, path: Arc<str>) -> Self {
        Self {
            inner,
            path: Some(path),
            faulted: false,
        }
    }
}

impl<B: Default> Default for GuardedBody<B> {
    fn default() -> Self {
        Self {
            inner: B::default(),
            path: None,
            faulted: false,
        }
    }
}

impl<B: Body> Body for GuardedBody<B> {
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        if *this.faulted {
            return Poll::Ready(None);
        }

        let inner = this.inner;
        match std::panic::catch_unwind(AssertUnwindSafe(|| inner.poll_frame(cx))) {
            Ok(poll) => poll,
            Err(panic) => {
                *this.faulted = true;
                let path = this.path.as_deref().unwrap_or("<unknown>");
                log_panic(path, "streaming the body", panic.as_ref());

                let mut trailers = HeaderMap::new();
                if let Err(e) = Status::internal(INTERNAL_MESSAGE).add_header(&mut trailers) {
                    tracing::error!(error = %e, "failed to encode fault trailers");
                }
                Poll::Ready(Some(Ok(Frame::trailers(trailers))))
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.faulted || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        if self.faulted {
            SizeHint::with_exact(0)
        } else {
            self.inner.size_hint()
        }
    }
}
