use super::{Discovery, EndpointSet, Registration, RegistrationRecord, renew_period};
use core::time::Duration;
use grin_account_core::{Error, Result};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::{sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;

/// In-process, lease-based service registry.
///
/// Clones share the same table. Each registration holds a lease that its
/// handle renews every `ttl / 3`; a lease that is not renewed in time is
/// dropped the next time any instance touches the registry, and watchers of
/// that name observe the shrunken set.
#[derive(Clone, Default)]
pub struct MemoryRegistry {
    state: Arc<Mutex<RegistryState>>,
    next_lease: Arc<AtomicU64>,
}

#[derive(Default)]
struct RegistryState {
    services: HashMap<String, ServiceEntry>,
}

struct ServiceEntry {
    leases: HashMap<String, Lease>,
    tx: watch::Sender<EndpointSet>,
}

#[derive(Clone, Copy)]
struct Lease {
    id: u64,
    expires_at: Instant,
}

#[derive(Debug, PartialEq, Eq)]
enum LeaseStatus {
    Renewed,
    Expired,
    Superseded,
}

impl ServiceEntry {
    fn new() -> Self {
        let (tx, _) = watch::channel(EndpointSet::default());
        Self {
            leases: HashMap::new(),
            tx,
        }
    }

    fn publish(&self) {
        let set: EndpointSet = self.leases.keys().cloned().collect();
        self.tx.send_if_modified(|current| {
            if *current == set {
                false
            } else {
                *current = set;
                true
            }
        });
    }
}

impl RegistryState {
    fn prune(&mut self, now: Instant) {
        for (name, entry) in &mut self.services {
            let before = entry.leases.len();
            entry.leases.retain(|_, lease| lease.expires_at > now);
            if entry.leases.len() != before {
                tracing::info!(
                    service = %name,
                    expired = before - entry.leases.len(),
                    "dropping expired leases"
                );
                entry.publish();
            }
        }
    }

    fn entry(&mut self, name: &str) -> &mut ServiceEntry {
        self.services
            .entry(name.to_string())
            .or_insert_with(ServiceEntry::new)
    }
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current live endpoints of `name`.
    pub fn endpoints(&self, name: &str) -> EndpointSet {
        let mut state = self.state.lock();
        state.prune(Instant::now());
        state
            .services
            .get(name)
            .map(|entry| entry.tx.borrow().clone())
            .unwrap_or_default()
    }

    fn put(&self, record: &RegistrationRecord, lease: u64, ttl: Duration) {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.prune(now);
        let entry = state.entry(&record.name);
        entry.leases.insert(
            record.address(),
            Lease {
                id: lease,
                expires_at: now + ttl,
            },
        );
        entry.publish();
    }

    fn renew(&self, record: &RegistrationRecord, lease: u64, ttl: Duration) -> LeaseStatus {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.prune(now);
        match state.entry(&record.name).leases.get_mut(&record.address()) {
            Some(current) if current.id == lease => {
                current.expires_at = now + ttl;
                LeaseStatus::Renewed
            }
            Some(_) => LeaseStatus::Superseded,
            None => LeaseStatus::Expired,
        }
    }

    fn remove(&self, record: &RegistrationRecord, lease: u64) {
        let mut state = self.state.lock();
        state.prune(Instant::now());
        let entry = state.entry(&record.name);
        let address = record.address();
        if entry.leases.get(&address).is_some_and(|l| l.id == lease) {
            entry.leases.remove(&address);
            entry.publish();
        }
    }
}

#[tonic::async_trait]
impl Discovery for MemoryRegistry {
    async fn register(
        &self,
        record: &RegistrationRecord,
        ttl: Duration,
    ) -> Result<Box<dyn Registration>> {
        if ttl.is_zero() {
            return Err(Error::RegistrationFailed {
                reason: "lease ttl must be greater than zero".to_string(),
            });
        }

        let lease = self.next_lease.fetch_add(1, Ordering::Relaxed) + 1;
        self.put(record, lease, ttl);

        let stop = CancellationToken::new();
        tokio::spawn(keep_alive(
            self.clone(),
            record.clone(),
            lease,
            ttl,
            stop.clone(),
        ));

        tracing::info!(%record, lease, ?ttl, "registered");
        Ok(Box::new(MemoryRegistration {
            registry: self.clone(),
            record: record.clone(),
            lease,
            stop,
            active: true,
        }))
    }

    async fn resolve(&self, name: &str) -> Result<watch::Receiver<EndpointSet>> {
        let mut state = self.state.lock();
        state.prune(Instant::now());
        Ok(state.entry(name).tx.subscribe())
    }
}

struct MemoryRegistration {
    registry: MemoryRegistry,
    record: RegistrationRecord,
    lease: u64,
    stop: CancellationToken,
    active: bool,
}

#[tonic::async_trait]
impl Registration for MemoryRegistration {
    fn record(&self) -> &RegistrationRecord {
        &self.record
    }

    async fn deregister(&mut self) -> Result<()> {
        self.stop.cancel();
        if core::mem::take(&mut self.active) {
            self.registry.remove(&self.record, self.lease);
            tracing::info!(record = %self.record, lease = self.lease, "deregistered");
        }
        Ok(())
    }
}

impl Drop for MemoryRegistration {
    fn drop(&mut self) {
        // The lease is left to expire.
        self.stop.cancel();
    }
}

async fn keep_alive(
    registry: MemoryRegistry,
    record: RegistrationRecord,
    lease: u64,
    ttl: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(renew_period(ttl));
    ticker.tick().await;

    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            _ = ticker.tick() => match registry.renew(&record, lease, ttl) {
                LeaseStatus::Renewed => {}
                LeaseStatus::Expired => {
                    tracing::warn!(%record, lease, "lease expired before renewal, re-registering");
                    registry.put(&record, lease, ttl);
                }
                LeaseStatus::Superseded => {
                    tracing::warn!(%record, lease, "registration superseded by another lease");
                    break;
                }
            },
        }
    }
    tracing::debug!(%record, lease, "lease keepalive stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_millis(300);

    fn record(port: u16) -> RegistrationRecord {
        RegistrationRecord::new("grin-captcha-service", "127.0.0.1", port)
    }

    #[tokio::test(start_paused = true)]
    async fn register_publishes_and_deregister_retracts() {
        let registry = MemoryRegistry::new();
        let mut rx = registry.resolve("grin-captcha-service").await.unwrap();
        assert!(rx.borrow_and_update().is_empty());

        let mut handle = registry.register(&record(9001), TTL).await.unwrap();
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().contains("127.0.0.1:9001"));

        handle.deregister().await.unwrap();
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().is_empty());

        // Second call is a no-op.
        handle.deregister().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn renewed_lease_outlives_its_ttl() {
        let registry = MemoryRegistry::new();
        let _handle = registry.register(&record(9001), TTL).await.unwrap();

        tokio::time::sleep(TTL * 5).await;
        assert_eq!(registry.endpoints("grin-captcha-service").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_lease_expires() {
        let registry = MemoryRegistry::new();
        let _live = registry.register(&record(9001), TTL).await.unwrap();
        let abandoned = registry.register(&record(9002), TTL).await.unwrap();
        assert_eq!(registry.endpoints("grin-captcha-service").len(), 2);

        drop(abandoned);
        tokio::time::sleep(TTL * 2).await;

        let live = registry.endpoints("grin-captcha-service");
        assert_eq!(live.iter().collect::<Vec<_>>(), ["127.0.0.1:9001"]);
    }

    #[tokio::test]
    async fn zero_ttl_is_refused() {
        let registry = MemoryRegistry::new();
        let res = registry.register(&record(9001), Duration::ZERO).await;
        assert!(matches!(res, Err(Error::RegistrationFailed { .. })));
    }

    #[tokio::test]
    async fn stale_handle_cannot_remove_newer_lease() {
        let registry = MemoryRegistry::new();
        let mut old = registry.register(&record(9001), TTL).await.unwrap();
        let _new = registry.register(&record(9001), TTL).await.unwrap();

        old.deregister().await.unwrap();
        assert_eq!(registry.endpoints("grin-captcha-service").len(), 1);
    }
}
