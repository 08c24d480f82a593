//! Account records and their storage.

use grin_account_core::{Error, Result};
use parking_lot::RwLock;
use std::sync::Arc;

/// A registered account. At least one of `email` / `phone_number` is set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserRecord {
    pub username: String,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub password_hash: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UserQuery {
    Username(String),
    Email(String),
    PhoneNumber(String),
}

impl UserRecord {
    fn matches(&self, query: &UserQuery) -> bool {
        match query {
            UserQuery::Username(name) => &self.username == name,
            UserQuery::Email(email) => self.email.as_ref() == Some(email),
            UserQuery::PhoneNumber(phone) => self.phone_number.as_ref() == Some(phone),
        }
    }

    /// Name of the first unique key `other` would collide on.
    fn conflict_with(&self, other: &UserRecord) -> Option<&'static str> {
        if self.username == other.username {
            Some("username")
        } else if self.email.is_some() && self.email == other.email {
            Some("email")
        } else if self.phone_number.is_some() && self.phone_number == other.phone_number {
            Some("phone number")
        } else {
            None
        }
    }
}

#[tonic::async_trait]
pub trait UserStore: Send + Sync + 'static {
    /// Inserts `record` unless its username, email or phone number is taken.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyExists`] naming the colliding key.
    async fn create_if_unique(&self, record: UserRecord) -> Result<()>;

    async fn find(&self, query: &UserQuery) -> Result<Option<UserRecord>>;

    /// # Errors
    ///
    /// [`Error::InvalidRequest`] if no account is called `username`.
    async fn update_password(&self, username: &str, password_hash: String) -> Result<()>;
}

/// Process-local store; clones share the same records.
#[derive(Clone, Default)]
pub struct MemoryUserStore {
    users: Arc<RwLock<Vec<UserRecord>>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.users.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.read().is_empty()
    }
}

#[tonic::async_trait]
impl UserStore for MemoryUserStore {
    async fn create_if_unique(&self, record: UserRecord) -> Result<()> {
        let mut users = self.users.write();
        if let Some(key) = users.iter().find_map(|u| u.conflict_with(&record)) {
            return Err(Error::AlreadyExists {
                reason: format!("{key} already registered"),
            });
        }
        users.push(record);
        Ok(())
    }

    async fn find(&self, query: &UserQuery) -> Result<Option<UserRecord>> {
        Ok(self.users.read().iter().find(|u| u.matches(query)).cloned())
    }

    async fn update_password(&self, username: &str, password_hash: String) -> Result<()> {
        let mut users = self.users.write();
        let user = users
            .iter_mut()
            .find(|u| u.username == username)
            .ok_or_else(|| Error::invalid("account not found"))?;
        user.password_hash = password_hash;
        Ok(())
    }
}
