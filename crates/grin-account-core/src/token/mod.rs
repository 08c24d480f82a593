//! Issuance and verification of signed, time-bounded bearer tokens.
//!
//! Tokens are compact JWTs signed with HMAC-SHA256 under a single
//! process-wide [`SigningSecret`]. Nothing is stored server-side: a token is
//! valid exactly when its signature matches and its expiry has not passed.
//!
//! ```
//! use grin_account_core::token::{SigningSecret, TokenCodec};
//!
//! let codec = TokenCodec::new(&SigningSecret::new("change-me").unwrap());
//! let token = codec.issue("alice").unwrap();
//! let claims = codec.verify(&token).unwrap();
//! assert_eq!(claims.subject, "alice");
//! ```

mod claims;
mod secret;
mod time;

pub use claims::Claims;
pub use secret::SigningSecret;
pub use time::{ManualClock, SystemClock, TimeSource};

use crate::common::{
    AuthError, Error, Result,
    types::{DEFAULT_TOKEN_TTL, TOKEN_ISSUER},
};
use core::{fmt, time::Duration};
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode, errors::ErrorKind,
};
use std::sync::Arc;

const ALGORITHM: Algorithm = Algorithm::HS256;

/// Stateless token issuer/verifier.
///
/// Cheap to clone; clones share keys and clock. Safe to use from any number
/// of concurrent calls.
#[derive(Clone)]
pub struct TokenCodec {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: Duration,
    clock: Arc<dyn TimeSource>,
}

impl TokenCodec {
    /// Codec with the default 8 hour TTL and the system clock.
    pub fn new(secret: &SigningSecret) -> Self {
        Self::with_clock(secret, DEFAULT_TOKEN_TTL, Arc::new(SystemClock))
    }

    pub fn with_ttl(secret: &SigningSecret, ttl: Duration) -> Self {
        Self::with_clock(secret, ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(secret: &SigningSecret, ttl: Duration, clock: Arc<dyn TimeSource>) -> Self {
        // Expiry is checked against `clock` below, not against the library's
        // own wall clock.
        let mut validation = Validation::new(ALGORITHM);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.leeway = 0;

        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            ttl,
            clock,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Current time according to the codec's clock.
    pub fn now_secs(&self) -> i64 {
        self.clock.now_secs()
    }

    /// Issues a token for `subject` valid for the configured TTL.
    pub fn issue(&self, subject: &str) -> Result<String> {
        self.issue_for(subject, None)
    }

    /// Issues a token, recording the requesting address for audit.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidRequest`] if `subject` is empty.
    /// - [`Error::InternalFault`] if signing fails.
    pub fn issue_for(&self, subject: &str, ip: Option<&str>) -> Result<String> {
        if subject.is_empty() {
            return Err(Error::invalid("token subject must not be empty"));
        }

        let ttl = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        let claims = Claims {
            issuer: TOKEN_ISSUER.to_string(),
            expires_at: self.clock.now_secs().saturating_add(ttl),
            subject: subject.to_string(),
            ip: ip.map(str::to_string),
        };

        encode(&Header::new(ALGORITHM), &claims, &self.encoding)
            .map_err(|e| Error::fault(format!("token signing failed: {e}")))
    }

    /// Verifies signature and expiry and returns the decoded claims.
    ///
    /// # Errors
    ///
    /// - [`AuthError::InvalidSignature`] if the MAC does not match.
    /// - [`AuthError::Expired`] if the clock is past `expires_at`.
    /// - [`AuthError::Malformed`] for anything that is not a well-formed
    ///   HS256 token carrying our claim set.
    pub fn verify(&self, token: &str) -> core::result::Result<Claims, AuthError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation).map_err(classify)?;

        if self.clock.now_secs() > data.claims.expires_at {
            return Err(AuthError::Expired);
        }
        Ok(data.claims)
    }
}

impl fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCodec")
            .field("algorithm", &ALGORITHM)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

fn classify(err: jsonwebtoken::errors::Error) -> AuthError {
    match err.kind() {
        ErrorKind::InvalidSignature => AuthError::InvalidSignature,
        ErrorKind::ExpiredSignature => AuthError::Expired,
        _ => AuthError::Malformed,
    }
}
