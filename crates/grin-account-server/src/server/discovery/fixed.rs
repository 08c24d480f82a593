use super::{Discovery, EndpointSet, Registration, RegistrationRecord};
use core::time::Duration;
use grin_account_core::{Error, Result};
use std::collections::HashMap;
use tokio::sync::watch;

/// Discovery over a fixed name → endpoints map.
///
/// Resolution never changes after construction. Registration is accepted
/// and only logged; whatever fronts a static deployment is expected to know
/// about this instance already.
#[derive(Clone, Debug, Default)]
pub struct StaticDiscovery {
    services: HashMap<String, EndpointSet>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service<I, S>(mut self, name: impl Into<String>, addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.services.insert(name.into(), addrs.into_iter().collect());
        self
    }

    /// Builds the map from `name=host:port[,host:port]` entries.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] for an entry without `=`, with an
    /// empty name, or without any address.
    pub fn from_entries<S: AsRef<str>>(entries: &[S]) -> Result<Self> {
        let mut discovery = Self::new();
        for entry in entries {
            let entry = entry.as_ref();
            let (name, addrs) = entry
                .split_once('=')
                .ok_or_else(|| Error::invalid(format!("dependency `{entry}` is not name=addr")))?;
            let name = name.trim();
            let addrs: Vec<&str> = addrs
                .split(',')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .collect();
            if name.is_empty() || addrs.is_empty() {
                return Err(Error::invalid(format!(
                    "dependency `{entry}` needs a name and at least one address"
                )));
            }
            discovery = discovery.with_service(name, addrs);
        }
        Ok(discovery)
    }
}

#[tonic::async_trait]
impl Discovery for StaticDiscovery {
    async fn register(
        &self,
        record: &RegistrationRecord,
        _ttl: Duration,
    ) -> Result<Box<dyn Registration>> {
        tracing::info!(%record, "static discovery: registration is a no-op");
        Ok(Box::new(StaticRegistration {
            record: record.clone(),
        }))
    }

    async fn resolve(&self, name: &str) -> Result<watch::Receiver<EndpointSet>> {
        let set = self
            .services
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ConnectorUnavailable {
                service: name.to_string(),
                reason: "no static endpoints configured".to_string(),
            })?;
        // The sender is dropped right away; the receiver keeps the snapshot.
        let (_tx, rx) = watch::channel(set);
        Ok(rx)
    }
}

struct StaticRegistration {
    record: RegistrationRecord,
}

#[tonic::async_trait]
impl Registration for StaticRegistration {
    fn record(&self) -> &RegistrationRecord {
        &self.record
    }

    async fn deregister(&mut self) -> Result<()> {
        tracing::info!(record = %self.record, "static discovery: deregistration is a no-op");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_configured_endpoints() {
        let discovery = StaticDiscovery::from_entries(&[
            "grin-captcha-service=127.0.0.1:9001, 127.0.0.1:9002",
            "grin-sms-service=10.0.0.1:80",
        ])
        .unwrap();

        let rx = discovery.resolve("grin-captcha-service").await.unwrap();
        assert_eq!(
            rx.borrow().iter().collect::<Vec<_>>(),
            ["127.0.0.1:9001", "127.0.0.1:9002"]
        );
    }

    #[tokio::test]
    async fn unknown_name_is_unavailable() {
        let discovery = StaticDiscovery::new();
        let res = discovery.resolve("grin-captcha-service").await;
        assert!(matches!(res, Err(Error::ConnectorUnavailable { .. })));
    }

    #[test]
    fn bad_entries_are_rejected() {
        for entry in ["grin-captcha-service", "=127.0.0.1:1", "name=", "name= , "] {
            assert!(StaticDiscovery::from_entries(&[entry]).is_err(), "{entry}");
        }
    }

    #[tokio::test]
    async fn registration_is_accepted() {
        let record = RegistrationRecord::new("grin-account-service", "127.0.0.1", 8081);
        let mut handle = StaticDiscovery::new()
            .register(&record, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(handle.record(), &record);
        handle.deregister().await.unwrap();
    }
}
