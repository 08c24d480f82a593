//! Service registration and endpoint resolution.
//!
//! A [`Discovery`] backend maps logical service names to the set of live
//! `host:port` endpoints serving them. Instances advertise themselves with
//! [`Discovery::register`] and keep the lease alive until they deregister;
//! clients subscribe to a name with [`Discovery::resolve`] and receive a new
//! [`EndpointSet`] snapshot whenever membership changes.
//!
//! ## Backends
//!
//! - [`EtcdDiscovery`] - leases and prefix watches on an etcd cluster.
//! - [`MemoryRegistry`] - in-process lease registry shared by clones.
//! - [`StaticDiscovery`] - fixed endpoints taken from configuration.

mod etcd;
mod fixed;
mod memory;

pub use etcd::EtcdDiscovery;
pub use fixed::StaticDiscovery;
pub use memory::MemoryRegistry;

use core::{fmt, time::Duration};
use grin_account_core::Result;
use std::collections::BTreeSet;
use tokio::sync::watch;

/// What an instance advertises about itself.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RegistrationRecord {
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl RegistrationRecord {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
        }
    }

    /// The `host:port` clients dial.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for RegistrationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.name, self.host, self.port)
    }
}

/// Snapshot of the live endpoints of one service, in a stable order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EndpointSet {
    addrs: BTreeSet<String>,
}

impl EndpointSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.addrs.contains(addr)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.addrs.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for EndpointSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            addrs: iter.into_iter().map(Into::into).collect(),
        }
    }
}

/// Pluggable registration and resolution backend.
#[tonic::async_trait]
pub trait Discovery: Send + Sync + 'static {
    /// Advertises `record` under a lease of `ttl`.
    ///
    /// The returned handle renews the lease in the background until
    /// [`Registration::deregister`] is called or the handle is dropped.
    async fn register(
        &self,
        record: &RegistrationRecord,
        ttl: Duration,
    ) -> Result<Box<dyn Registration>>;

    /// Subscribes to the endpoint set of `name`.
    ///
    /// The receiver holds the current snapshot and is notified on every
    /// membership change. An unknown name may resolve to an empty set.
    async fn resolve(&self, name: &str) -> Result<watch::Receiver<EndpointSet>>;
}

/// Live advertisement of one instance.
#[tonic::async_trait]
pub trait Registration: Send + Sync {
    fn record(&self) -> &RegistrationRecord;

    /// Stops renewal and removes the record. Idempotent.
    async fn deregister(&mut self) -> Result<()>;
}

/// Lease renewal interval: a third of the ttl, never below 1 ms.
pub(crate) fn renew_period(ttl: Duration) -> Duration {
    (ttl / 3).max(Duration::from_millis(1))
}
