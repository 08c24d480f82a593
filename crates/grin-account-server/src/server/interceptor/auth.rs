use super::{ExemptionTable, status_response};
use crate::server::telemetry;
use core::task::{Context, Poll};
use futures::future::{self, Either, Ready};
use grin_account_core::{
    AuthError,
    error::UNAUTHENTICATED_MESSAGE,
    token::{Claims, TokenCodec},
    types::{AUTHORIZATION_HEADER, BEARER_SCHEME},
};
use http::HeaderMap;
use std::sync::Arc;
use tonic::Status;
use tower::{Layer, Service};

/// Bearer token stage.
#[derive(Clone)]
pub struct AuthLayer {
    codec: TokenCodec,
    exemptions: Arc<ExemptionTable>,
}

impl AuthLayer {
    pub fn new(codec: TokenCodec, exemptions: Arc<ExemptionTable>) -> Self {
        Self { codec, exemptions }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthService {
            inner,
            codec: self.codec.clone(),
            exemptions: self.exemptions.clone(),
        }
    }
}

/// See [`AuthLayer`].
///
/// Exempt paths pass straight through. Every other call needs
/// `authorization: bearer <token>` carrying a token that verifies and whose
/// claims are consistent; the claims are then inserted into the request
/// extensions. Any failure answers `UNAUTHENTICATED "unauthenticated"`
/// without invoking the inner service.
#[derive(Clone)]
pub struct AuthService<S> {
    inner: S,
    codec: TokenCodec,
    exemptions: Arc<ExemptionTable>,
}

impl<S> AuthService<S> {
    fn authenticate(&self, headers: &HeaderMap) -> Result<Claims, AuthError> {
        let token = bearer_token(headers)?;
        let claims = self.codec.verify(token)?;
        claims.validate(self.codec.now_secs())?;
        Ok(claims)
    }
}

impl<S, ReqBody, ResBody> Service<http::Request<ReqBody>> for AuthService<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>>,
    ResBody: Default,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Either<S::Future, Ready<Result<S::Response, S::Error>>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: http::Request<ReqBody>) -> Self::Future {
        if self.exemptions.is_exempt(req.uri().path()) {
            return Either::Left(self.inner.call(req));
        }

        match self.authenticate(req.headers()) {
            Ok(claims) => {
                tracing::debug!(
                    path = req.uri().path(),
                    subject = %claims.subject,
                    "authenticated call"
                );
                req.extensions_mut().insert(claims);
                Either::Left(self.inner.call(req))
            }
            Err(reason) => {
                tracing::warn!(path = req.uri().path(), %reason, "rejecting unauthenticated call");
                telemetry::increment_auth_rejections(reason);
                let status = Status::unauthenticated(UNAUTHENTICATED_MESSAGE);
                Either::Right(future::ready(Ok(status_response(&status))))
            }
        }
    }
}

/// Extracts the token from `authorization: bearer <token>`.
///
/// The scheme is matched case-insensitively and separated from the token by
/// a single space.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let value = headers
        .get(AUTHORIZATION_HEADER)
        .ok_or(AuthError::MissingToken)?
        .to_str()
        .map_err(|_| AuthError::MalformedHeader)?;

    let (scheme, token) = value.split_once(' ').ok_or(AuthError::MalformedHeader)?;
    if !scheme.eq_ignore_ascii_case(BEARER_SCHEME) || token.is_empty() {
        return Err(AuthError::MalformedHeader);
    }
    Ok(token)
}
