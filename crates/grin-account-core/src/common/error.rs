//! Error types for the account service.
//!
//! This module defines the central `Error` enum, which captures all
//! recoverable and reportable error cases of the request path. It implements
//! `From<Error>` for `tonic::Status` so handlers can return it with `?`.
//!
//! The conversion is deliberately lossy for two classes of failure:
//!
//! - Every authentication failure becomes the same `UNAUTHENTICATED` status.
//!   The precise [`AuthError`] kind is only logged.
//! - Every internal fault becomes the same `INTERNAL` status. The fault
//!   detail is only logged.
//!
//! ## Error Cases
//! - `Unauthenticated`: missing, malformed, forged or expired bearer token.
//! - `InternalFault`: a handler could not continue (fault signal).
//! - `ConnectorUnavailable`: a dependency could not be resolved or dialed.
//! - `RegistrationFailed`: the discovery backend rejected this instance.
//! - `InvalidRequest`: the client request was malformed or out of bounds.
//! - `AlreadyExists`: a unique record already exists.
//! - `InvalidSecret`: the token codec was configured with an unusable secret.
//! - `ServiceShutdown`: a request arrived while the service was draining.

use tonic::Status;

/// Message sent to callers for every authentication failure.
pub const UNAUTHENTICATED_MESSAGE: &str = "unauthenticated";

/// Message sent to callers for every internal fault.
pub const INTERNAL_MESSAGE: &str = "internal error";

/// Reason a bearer token was rejected.
///
/// Kept for server-side logging only; callers never observe which check
/// failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// No `authorization` metadata on the call.
    #[error("missing bearer token")]
    MissingToken,

    /// `authorization` metadata present but not `bearer <token>`.
    #[error("malformed authorization header")]
    MalformedHeader,

    /// The token is not a well-formed signed token.
    #[error("malformed token")]
    Malformed,

    /// The MAC does not match the token content.
    #[error("invalid token signature")]
    InvalidSignature,

    /// The token's expiry is in the past.
    #[error("token is expired")]
    Expired,

    /// The claim set failed the structural consistency check.
    #[error("invalid token claims")]
    InvalidClaims,
}

impl AuthError {
    /// Stable snake_case label, used as a metric attribute.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::MissingToken => "missing_token",
            Self::MalformedHeader => "malformed_header",
            Self::Malformed => "malformed",
            Self::InvalidSignature => "invalid_signature",
            Self::Expired => "expired",
            Self::InvalidClaims => "invalid_claims",
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the account service.
#[derive(Clone, thiserror::Error, Debug)]
pub enum Error {
    /// Authentication failed; the kind is for logs only.
    #[error("Unauthenticated: {0}")]
    Unauthenticated(#[from] AuthError),

    /// A stage or handler below the fault boundary could not continue.
    #[error("Internal fault: {detail}")]
    InternalFault { detail: String },

    /// A downstream service could not be resolved or reached.
    #[error("Service {service} unavailable: {reason}")]
    ConnectorUnavailable { service: String, reason: String },

    /// This instance could not be advertised to (or removed from) discovery.
    #[error("Registration failed: {reason}")]
    RegistrationFailed { reason: String },

    /// The client request was invalid or exceeded constraints.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// A record with the same unique key already exists.
    #[error("Already exists: {reason}")]
    AlreadyExists { reason: String },

    /// The signing secret cannot be used.
    #[error("Invalid signing secret: {reason}")]
    InvalidSecret { reason: String },

    /// The service is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl Error {
    pub fn fault(detail: impl Into<String>) -> Self {
        Self::InternalFault {
            detail: detail.into(),
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::Unauthenticated(kind) => {
                tracing::warn!(reason = %kind, "rejecting unauthenticated call");
                Status::unauthenticated(UNAUTHENTICATED_MESSAGE)
            }
            Error::InternalFault { detail } => {
                tracing::error!(%detail, "internal fault");
                Status::internal(INTERNAL_MESSAGE)
            }
            Error::InvalidSecret { reason } => {
                tracing::error!(%reason, "token codec misconfigured");
                Status::internal(INTERNAL_MESSAGE)
            }
            Error::ConnectorUnavailable { service, reason } => {
                tracing::error!(%service, %reason, "dependency unavailable");
                Status::unavailable(format!("Service {service} unavailable"))
            }
            Error::RegistrationFailed { reason } => {
                Status::unavailable(format!("Registration failed: {reason}"))
            }
            Error::InvalidRequest { reason } => Status::invalid_argument(reason),
            Error::AlreadyExists { reason } => Status::already_exists(reason),
            Error::ServiceShutdown => Status::unavailable("Service is shutting down"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn every_auth_error_maps_to_the_same_status() {
        let kinds = [
            AuthError::MissingToken,
            AuthError::MalformedHeader,
            AuthError::Malformed,
            AuthError::InvalidSignature,
            AuthError::Expired,
            AuthError::InvalidClaims,
        ];

        for kind in kinds {
            let status = Status::from(Error::from(kind));
            assert_eq!(status.code(), Code::Unauthenticated);
            assert_eq!(status.message(), UNAUTHENTICATED_MESSAGE);
        }
    }

    #[test]
    fn auth_error_kinds_are_distinct() {
        let kinds = [
            AuthError::MissingToken,
            AuthError::MalformedHeader,
            AuthError::Malformed,
            AuthError::InvalidSignature,
            AuthError::Expired,
            AuthError::InvalidClaims,
        ]
        .map(|k| k.kind());

        let unique: std::collections::BTreeSet<_> = kinds.iter().collect();
        assert_eq!(unique.len(), kinds.len());
        assert_eq!(AuthError::Expired.kind(), "expired");
    }

    #[test]
    fn internal_fault_hides_detail() {
        let status = Status::from(Error::fault("db pool poisoned at users.rs:42"));
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(status.message(), INTERNAL_MESSAGE);
    }

    #[test]
    fn connector_unavailable_is_unavailable() {
        let status = Status::from(Error::ConnectorUnavailable {
            service: "grin-captcha-service".to_string(),
            reason: "no endpoints".to_string(),
        });
        assert_eq!(status.code(), Code::Unavailable);
        assert!(!status.message().contains("no endpoints"));
    }

    #[test]
    fn request_errors_keep_their_reason() {
        let status = Status::from(Error::invalid("contact invalid"));
        assert_eq!(status.code(), Code::InvalidArgument);
        assert_eq!(status.message(), "contact invalid");

        let status = Status::from(Error::AlreadyExists {
            reason: "username taken".to_string(),
        });
        assert_eq!(status.code(), Code::AlreadyExists);
    }
}
