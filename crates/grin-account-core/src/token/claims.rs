use crate::common::{AuthError, types::TOKEN_ISSUER};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Decoded payload of a verified token.
///
/// Attached to a call's request extensions by the authentication stage and
/// dropped with the call. Handlers read it through the server's `ClaimsExt`
/// accessor; its presence means the chain accepted the caller's token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Issuer, always [`TOKEN_ISSUER`] for tokens minted by this service.
    #[serde(rename = "iss")]
    pub issuer: String,

    /// Expiry as seconds since the UNIX epoch.
    #[serde(rename = "exp")]
    pub expires_at: i64,

    /// The authenticated account (username).
    pub subject: String,

    /// Address the token was issued to. Audit only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

impl Claims {
    /// Structural consistency check run after signature verification.
    ///
    /// A token is valid up to and including its expiry second.
    pub fn validate(&self, now_secs: i64) -> Result<(), AuthError> {
        if self.issuer != TOKEN_ISSUER || self.subject.is_empty() {
            return Err(AuthError::InvalidClaims);
        }
        if now_secs > self.expires_at {
            return Err(AuthError::Expired);
        }
        Ok(())
    }

    pub fn expires_at_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.expires_at, 0)
    }
}
