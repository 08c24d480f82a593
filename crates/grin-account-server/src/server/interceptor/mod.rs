//! The ordered pipeline every inbound call passes through before reaching its
//! handler.
//!
//! Stages run on the raw HTTP/2 request so the full gRPC method path
//! (`/package.Service/Method`) is visible, for unary and streaming calls
//! alike:
//!
//! 1. [`RecoveryService`] refuses calls once draining has begun and turns any
//!    panic below it into a single opaque `INTERNAL` status.
//! 2. [`AuthService`] requires a valid bearer token unless the method is
//!    listed in the [`ExemptionTable`], and attaches the verified
//!    [`Claims`](grin_account_core::token::Claims) to the request.
//!
//! [`InterceptorChain`] is the `tower::Layer` that applies both in that
//! order; it is installed with `Server::builder().layer(..)`.

mod auth;
mod claims;
mod recovery;

pub use auth::{AuthLayer, AuthService, bearer_token};
pub use claims::ClaimsExt;
pub use recovery::{GuardedBody, RecoveryLayer, RecoveryService};

use grin_account_core::token::TokenCodec;
use std::{collections::HashSet, sync::Arc};
use tokio_util::sync::CancellationToken;
use tonic::{Status, server::NamedService};
use tower::Layer;

/// Service name of the standard health service.
pub const HEALTH_SERVICE: &str = "grpc.health.v1.Health";

/// Service name of server reflection (v1).
pub const REFLECTION_SERVICE: &str = "grpc.reflection.v1.ServerReflection";

/// Capability of a business handler to declare methods callable without a
/// bearer token.
pub trait AuthExempt {
    /// Bare method names (e.g. `"SignUp"`) that skip authentication.
    fn auth_exempt_methods(&self) -> &'static [&'static str];

    fn is_auth_exempt(&self, method: &str) -> bool {
        self.auth_exempt_methods().contains(&method)
    }
}

/// Full method paths and whole services that bypass authentication.
///
/// Built once while services are registered and read-only afterwards.
#[derive(Clone, Debug, Default)]
pub struct ExemptionTable {
    methods: HashSet<String>,
    services: HashSet<String>,
}

impl ExemptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the exempt methods of `handler`, served as `S`.
    pub fn with_handler<S, H>(mut self, handler: &H) -> Self
    where
        S: NamedService,
        H: AuthExempt,
    {
        for method in handler.auth_exempt_methods() {
            self.methods.insert(format!("/{}/{}", S::NAME, method));
        }
        self
    }

    /// Exempts every method of the service called `name`.
    pub fn with_service(mut self, name: impl Into<String>) -> Self {
        self.services.insert(name.into());
        self
    }

    pub fn is_exempt(&self, path: &str) -> bool {
        if self.methods.contains(path) {
            return true;
        }
        split_path(path).is_some_and(|(service, _)| self.services.contains(service))
    }
}

fn split_path(path: &str) -> Option<(&str, &str)> {
    path.strip_prefix('/')?.split_once('/')
}

/// Recovery then authentication, as one layer.
#[derive(Clone)]
pub struct InterceptorChain {
    recovery: RecoveryLayer,
    auth: AuthLayer,
}

impl InterceptorChain {
    pub fn new(codec: TokenCodec, exemptions: ExemptionTable, shutdown: CancellationToken) -> Self {
        Self {
            recovery: RecoveryLayer::new(shutdown),
            auth: AuthLayer::new(codec, Arc::new(exemptions)),
        }
    }
}

impl<S> Layer<S> for InterceptorChain {
    type Service = RecoveryService<AuthService<S>>;

    fn layer(&self, inner: S) -> Self::Service {
        self.recovery.layer(self.auth.layer(inner))
    }
}

/// A trailers-only gRPC response carrying `status`.
pub(crate) fn status_response<B: Default>(status: &Status) -> http::Response<B> {
    let mut response = http::Response::new(B::default());
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/grpc"),
    );
    if let Err(e) = status.add_header(response.headers_mut()) {
        tracing::error!(error = %e, "failed to encode status headers");
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use grin_account_core::proto::account::user_service_server::UserServiceServer;

    struct Handler;

    impl AuthExempt for Handler {
        fn auth_exempt_methods(&self) -> &'static [&'static str] {
            &["SignUp", "SignIn"]
        }
    }

    // Stand-in for a generated server type.
    struct Users;

    impl NamedService for Users {
        const NAME: &'static str = "account.UserService";
    }

    #[test]
    fn exempts_declared_methods_only() {
        let table = ExemptionTable::new().with_handler::<Users, _>(&Handler);

        assert!(table.is_exempt("/account.UserService/SignUp"));
        assert!(table.is_exempt("/account.UserService/SignIn"));
        assert!(!table.is_exempt("/account.UserService/ResetPasswd"));
        assert!(!table.is_exempt("/other.UserService/SignUp"));
        assert!(!table.is_exempt("account.UserService/SignUp"));
    }

    #[test]
    fn whole_service_exemption() {
        let table = ExemptionTable::new()
            .with_service(HEALTH_SERVICE)
            .with_service(REFLECTION_SERVICE);

        assert!(table.is_exempt("/grpc.health.v1.Health/Check"));
        assert!(table.is_exempt("/grpc.health.v1.Health/Watch"));
        assert!(table.is_exempt("/grpc.reflection.v1.ServerReflection/ServerReflectionInfo"));
        assert!(!table.is_exempt("/account.UserService/SignUp"));
        assert!(!table.is_exempt("/"));
    }

    #[test]
    fn generated_service_name_matches_proto_package() {
        assert_eq!(
            <UserServiceServer<crate::server::service::AccountService> as NamedService>::NAME,
            "account.UserService"
        );
    }

    #[test]
    fn default_is_auth_exempt_uses_the_list() {
        assert!(Handler.is_auth_exempt("SignUp"));
        assert!(!Handler.is_auth_exempt("ResetPasswd"));
    }

    #[test]
    fn status_response_is_trailers_only() {
        let response: http::Response<()> =
            status_response(&Status::unauthenticated("unauthenticated"));
        assert_eq!(response.status(), http::StatusCode::OK);
        assert_eq!(response.headers()["grpc-status"], "16");
        assert_eq!(response.headers()["grpc-message"], "unauthenticated");
        assert_eq!(response.headers()["content-type"], "application/grpc");
    }
}
