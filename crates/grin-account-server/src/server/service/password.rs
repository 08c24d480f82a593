//! Password hashing and verification using Argon2id.

use argon2::{
    Argon2, PasswordHash,
    password_hash::{self, PasswordHasher as _, PasswordVerifier as _, SaltString, rand_core::OsRng},
};
use grin_account_core::{Error, Result};

/// One-way password storage format.
pub trait PasswordHasher: Send + Sync + 'static {
    /// Hashes `password` under a fresh random salt.
    fn hash(&self, password: &str) -> Result<String>;

    /// Whether `password` matches a hash produced by [`PasswordHasher::hash`].
    fn verify(&self, password: &str, hash: &str) -> Result<bool>;
}

/// Argon2id with default parameters, stored as PHC strings.
#[derive(Clone, Default)]
pub struct Argon2Hasher {
    argon2: Argon2<'static>,
}

impl PasswordHasher for Argon2Hasher {
    fn hash(&self, password: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        self.argon2
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| Error::fault(format!("failed to hash password: {e}")))
    }

    fn verify(&self, password: &str, hash: &str) -> Result<bool> {
        let parsed = PasswordHash::new(hash)
            .map_err(|e| Error::fault(format!("invalid stored password hash: {e}")))?;

        match self.argon2.verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(password_hash::Error::Password) => Ok(false),
            Err(e) => Err(Error::fault(format!("password verification failed: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_verify() {
        let hasher = Argon2Hasher::default();
        let hash = hasher.hash("correct horse battery").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(hasher.verify("correct horse battery", &hash).unwrap());
        assert!(!hasher.verify("wrong horse battery", &hash).unwrap());
    }

    #[test]
    fn same_password_gets_distinct_salts() {
        let hasher = Argon2Hasher::default();
        let a = hasher.hash("password123").unwrap();
        let b = hasher.hash("password123").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn corrupt_hash_is_a_fault() {
        let hasher = Argon2Hasher::default();
        assert!(matches!(
            hasher.verify("password123", "not-a-phc-string"),
            Err(Error::InternalFault { .. })
        ));
    }
}
