use super::{Discovery, EndpointSet, Registration, RegistrationRecord, renew_period};
use core::time::Duration;
use etcd_client::{
    Client, ConnectOptions, EventType, GetOptions, LeaseKeepAliveStream, LeaseKeeper, PutOptions,
    WatchOptions, WatchStream, Watcher,
};
use grin_account_core::{Error, Result};
use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Discovery backed by an etcd cluster.
///
/// Instances are stored as `{prefix}/{name}/{host:port}` with the address
/// as value, attached to a lease that is kept alive every `ttl / 3`.
/// Resolution reads the `{prefix}/{name}/` range once and then follows it
/// with a watch from the next revision.
#[derive(Clone)]
pub struct EtcdDiscovery {
    client: Client,
    prefix: String,
}

impl EtcdDiscovery {
    /// Dials the cluster. `timeout` bounds establishing the connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectorUnavailable`] if no endpoint can be reached.
    pub async fn connect<S: AsRef<str>>(
        endpoints: &[S],
        prefix: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let options = ConnectOptions::new().with_connect_timeout(timeout);
        let client = Client::connect(endpoints, Some(options))
            .await
            .map_err(|e| Error::ConnectorUnavailable {
                service: "registry".to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self::with_client(client, prefix))
    }

    pub fn with_client(client: Client, prefix: &str) -> Self {
        Self {
            client,
            prefix: normalize_prefix(prefix),
        }
    }

    fn service_prefix(&self, name: &str) -> String {
        service_prefix(&self.prefix, name)
    }
}

fn normalize_prefix(prefix: &str) -> String {
    prefix.trim_end_matches('/').to_string()
}

fn service_prefix(prefix: &str, name: &str) -> String {
    format!("{prefix}/{name}/")
}

fn record_key(prefix: &str, record: &RegistrationRecord) -> String {
    format!("{}{}", service_prefix(prefix, &record.name), record.address())
}

/// Lease ttl in whole seconds, rounded up.
fn lease_seconds(ttl: Duration) -> Result<i64> {
    if ttl.is_zero() {
        return Err(Error::RegistrationFailed {
            reason: "lease ttl must be greater than zero".to_string(),
        });
    }
    Ok(i64::try_from(ttl.as_millis().div_ceil(1000)).unwrap_or(i64::MAX))
}

fn registration_failed(err: etcd_client::Error) -> Error {
    Error::RegistrationFailed {
        reason: err.to_string(),
    }
}

/// Grants a lease and writes `key` under it, returning the lease id.
async fn grant_and_put(
    client: &mut Client,
    key: &str,
    address: String,
    seconds: i64,
) -> core::result::Result<i64, etcd_client::Error> {
    let lease = client.lease_grant(seconds, None).await?.id();
    client
        .put(key, address, Some(PutOptions::new().with_lease(lease)))
        .await?;
    Ok(lease)
}

#[tonic::async_trait]
impl Discovery for EtcdDiscovery {
    async fn register(
        &self,
        record: &RegistrationRecord,
        ttl: Duration,
    ) -> Result<Box<dyn Registration>> {
        let seconds = lease_seconds(ttl)?;
        let key = record_key(&self.prefix, record);
        let mut client = self.client.clone();

        let lease = grant_and_put(&mut client, &key, record.address(), seconds)
            .await
            .map_err(registration_failed)?;
        let lease = Arc::new(AtomicI64::new(lease));

        let stop = CancellationToken::new();
        tokio::spawn(keep_alive(
            Renewal {
                client: client.clone(),
                record: record.clone(),
                key: key.clone(),
                seconds,
                lease: lease.clone(),
            },
            renew_period(ttl),
            stop.clone(),
        ));

        tracing::info!(%record, %key, lease = lease.load(Ordering::Relaxed), ?ttl, "registered");
        Ok(Box::new(EtcdRegistration {
            client,
            record: record.clone(),
            lease,
            stop,
            active: true,
        }))
    }

    async fn resolve(&self, name: &str) -> Result<watch::Receiver<EndpointSet>> {
        let unavailable = |e: etcd_client::Error| Error::ConnectorUnavailable {
            service: name.to_string(),
            reason: e.to_string(),
        };
        let prefix = self.service_prefix(name);
        let mut client = self.client.clone();

        let rsp = client
            .get(prefix.as_str(), Some(GetOptions::new().with_prefix()))
            .await
            .map_err(unavailable)?;
        let mut members = BTreeMap::new();
        for kv in rsp.kvs() {
            if let Some(change) = Change::decode(EventType::Put, kv.key(), kv.value()) {
                change.apply(&mut members);
            }
        }
        let revision = rsp.header().map_or(0, |h| h.revision());

        let options = WatchOptions::new()
            .with_prefix()
            .with_start_revision(revision + 1);
        let (watcher, stream) = client
            .watch(prefix.as_str(), Some(options))
            .await
            .map_err(unavailable)?;

        let (tx, rx) = watch::channel(snapshot(&members));
        tracing::debug!(service = name, endpoints = members.len(), revision, "resolved");
        tokio::spawn(follow(name.to_string(), watcher, stream, members, tx));
        Ok(rx)
    }
}

/// One membership change under a service prefix.
#[derive(Debug, PartialEq, Eq)]
enum Change {
    Put { key: String, address: String },
    Delete { key: String },
}

impl Change {
    fn decode(kind: EventType, key: &[u8], value: &[u8]) -> Option<Self> {
        let key = String::from_utf8(key.to_vec()).ok()?;
        match kind {
            EventType::Put => {
                let address = String::from_utf8(value.to_vec()).ok()?;
                (!address.is_empty()).then_some(Self::Put { key, address })
            }
            EventType::Delete => Some(Self::Delete { key }),
        }
    }

    /// Returns whether the member table changed.
    fn apply(self, members: &mut BTreeMap<String, String>) -> bool {
        match self {
            Self::Put { key, address } => {
                members.insert(key, address.clone()).as_ref() != Some(&address)
            }
            Self::Delete { key } => members.remove(&key).is_some(),
        }
    }
}

fn snapshot(members: &BTreeMap<String, String>) -> EndpointSet {
    members.values().cloned().collect()
}

async fn follow(
    service: String,
    _watcher: Watcher,
    mut stream: WatchStream,
    mut members: BTreeMap<String, String>,
    tx: watch::Sender<EndpointSet>,
) {
    loop {
        tokio::select! {
            () = tx.closed() => break,
            message = stream.message() => match message {
                Ok(Some(rsp)) => {
                    if rsp.canceled() {
                        tracing::warn!(%service, "registry watch canceled");
                        break;
                    }
                    let mut changed = false;
                    for event in rsp.events() {
                        let Some(kv) = event.kv() else { continue };
                        if let Some(change) = Change::decode(event.event_type(), kv.key(), kv.value()) {
                            changed |= change.apply(&mut members);
                        }
                    }
                    if changed {
                        tracing::info!(%service, endpoints = members.len(), "membership changed");
                        tx.send_replace(snapshot(&members));
                    }
                }
                Ok(None) => {
                    tracing::warn!(%service, "registry watch closed");
                    break;
                }
                Err(err) => {
                    tracing::warn!(%service, %err, "registry watch failed");
                    break;
                }
            },
        }
    }
    tracing::debug!(%service, "stopped following membership");
}

struct Renewal {
    client: Client,
    record: RegistrationRecord,
    key: String,
    seconds: i64,
    lease: Arc<AtomicI64>,
}

impl Renewal {
    async fn open(&mut self) -> Option<(LeaseKeeper, LeaseKeepAliveStream)> {
        let lease = self.lease.load(Ordering::Relaxed);
        match self.client.lease_keep_alive(lease).await {
            Ok(pair) => Some(pair),
            Err(err) => {
                tracing::warn!(record = %self.record, lease, %err, "failed to open lease keepalive");
                None
            }
        }
    }

    /// Sends one keepalive. `Ok(false)` means the lease is gone.
    async fn renew(
        keeper: &mut LeaseKeeper,
        stream: &mut LeaseKeepAliveStream,
    ) -> core::result::Result<bool, etcd_client::Error> {
        keeper.keep_alive().await?;
        Ok(stream.message().await?.is_some_and(|rsp| rsp.ttl() > 0))
    }

    async fn reregister(&mut self) -> bool {
        match grant_and_put(&mut self.client, &self.key, self.record.address(), self.seconds).await
        {
            Ok(lease) => {
                self.lease.store(lease, Ordering::Relaxed);
                tracing::info!(record = %self.record, lease, "re-registered under a new lease");
                true
            }
            Err(err) => {
                tracing::warn!(record = %self.record, %err, "failed to re-register");
                false
            }
        }
    }
}

async fn keep_alive(mut renewal: Renewal, period: Duration, stop: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    let mut channel = renewal.open().await;

    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            _ = ticker.tick() => {
                let renewed = match channel.as_mut() {
                    Some((keeper, stream)) => Renewal::renew(keeper, stream).await,
                    None => Ok(false),
                };
                match renewed {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!(record = %renewal.record, "lease expired before renewal, re-registering");
                        channel = None;
                        if renewal.reregister().await {
                            channel = renewal.open().await;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(record = %renewal.record, %err, "lease keepalive failed, reopening");
                        channel = renewal.open().await;
                    }
                }
            }
        }
    }
    tracing::debug!(record = %renewal.record, "lease keepalive stopped");
}

struct EtcdRegistration {
    client: Client,
    record: RegistrationRecord,
    lease: Arc<AtomicI64>,
    stop: CancellationToken,
    active: bool,
}

#[tonic::async_trait]
impl Registration for EtcdRegistration {
    fn record(&self) -> &RegistrationRecord {
        &self.record
    }

    async fn deregister(&mut self) -> Result<()> {
        self.stop.cancel();
        if core::mem::take(&mut self.active) {
            let lease = self.lease.load(Ordering::Relaxed);
            // Revoking the lease deletes every key attached to it.
            self.client
                .lease_revoke(lease)
                .await
                .map_err(registration_failed)?;
            tracing::info!(record = %self.record, lease, "deregistered");
        }
        Ok(())
    }
}

impl Drop for EtcdRegistration {
    fn drop(&mut self) {
        // The lease is left to expire.
        self.stop.cancel();
    }
}
