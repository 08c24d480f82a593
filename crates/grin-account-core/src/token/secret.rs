use crate::common::{Error, Result};
use core::fmt;
use std::sync::Arc;

/// Symmetric key used to sign and verify every token issued by this process.
///
/// Loaded once at startup and never mutated. Cloning is cheap and shares the
/// same bytes. The `Debug` output never contains the key material.
#[derive(Clone)]
pub struct SigningSecret(Arc<[u8]>);

impl SigningSecret {
    /// Wraps raw key bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSecret`] if `bytes` is empty.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(Error::InvalidSecret {
                reason: "signing secret must not be empty".to_string(),
            });
        }
        Ok(Self(bytes.into()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SigningSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SigningSecret(<{} bytes redacted>)", self.0.len())
    }
}
