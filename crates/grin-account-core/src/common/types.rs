//! Constants shared by the server, its interceptors and its clients.
//!
//! Both sides of the bearer token contract read these values, so changing one
//! is a wire-level change.

use core::time::Duration;

/// Metadata key carrying the bearer token.
pub const AUTHORIZATION_HEADER: &str = "authorization";

/// Scheme name expected in front of the token (`bearer <token>`).
///
/// Matched case-insensitively.
pub const BEARER_SCHEME: &str = "bearer";

/// `iss` claim stamped into every token and required on verification.
pub const TOKEN_ISSUER: &str = "grin-authur";

/// Lifetime of an issued token.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(8 * 60 * 60);
