use crate::server::{
    connector::{ConnectorConfig, TransportSecurity},
    discovery::RegistrationRecord,
    lifecycle::LifecycleSettings,
};
use anyhow::{Context, bail};
use clap::Parser;
use core::time::Duration;
use grin_account_core::token::SigningSecret;
use std::net::{Ipv4Addr, SocketAddr};

/// Runtime configuration for the `grin-account-server` binary.
///
/// All values are parsed from CLI arguments or environment variables (a
/// `.env` file is loaded first). Defaults match a single-node development
/// deployment.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "grin-account-server",
    version,
    about = "A gRPC account service with bearer token authentication"
)]
pub struct CliArgs {
    /// Logical name this instance is registered under.
    ///
    /// Environment variable: `SERVICE_NAME`
    #[arg(long, env = "SERVICE_NAME", default_value_t = String::from("grin-account-service"))]
    pub name: String,

    /// Host advertised to discovery. The listener always binds all
    /// interfaces.
    ///
    /// Environment variable: `SERVICE_HOST`
    #[arg(long, env = "SERVICE_HOST", default_value_t = String::from("127.0.0.1"))]
    pub host: String,

    /// Port to listen on and advertise.
    ///
    /// Environment variable: `SERVICE_PORT`
    #[arg(long, env = "SERVICE_PORT", default_value_t = 8081)]
    pub port: u16,

    /// HMAC key for bearer tokens. Required.
    ///
    /// Environment variable: `JWT_SECRET`
    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: String,

    /// Lifetime of issued tokens, in seconds.
    #[arg(long, env = "TOKEN_TTL_SECS", default_value_t = 8 * 60 * 60)]
    pub token_ttl_secs: u64,

    /// Lease TTL of the discovery registration, in seconds. The lease is
    /// renewed every third of this.
    #[arg(long, env = "REGISTRATION_TTL_SECS", default_value_t = 10)]
    pub registration_ttl_secs: u64,

    /// Upper bound on advertising this instance at startup, in seconds.
    #[arg(long, env = "REGISTRATION_TIMEOUT_SECS", default_value_t = 3)]
    pub registration_timeout_secs: u64,

    /// Grace period for in-flight calls once shutdown begins, in seconds.
    #[arg(long, env = "DRAIN_TIMEOUT_SECS", default_value_t = 10)]
    pub drain_timeout_secs: u64,

    /// Upper bound on removing this instance from discovery, in seconds.
    #[arg(long, env = "DEREGISTER_TIMEOUT_SECS", default_value_t = 3)]
    pub deregister_timeout_secs: u64,

    /// Logical name of the captcha dependency.
    ///
    /// Environment variable: `CAPTCHA_SERVICE`
    #[arg(long, env = "CAPTCHA_SERVICE", default_value_t = String::from("grin-captcha-service"))]
    pub captcha_service: String,

    /// Static endpoints of a dependency, `name=host:port[,host:port]`.
    /// Repeatable; the environment form separates entries with `;`.
    ///
    /// Environment variable: `DEPENDENCIES`
    #[arg(long = "dependency", env = "DEPENDENCIES", value_delimiter = ';')]
    pub dependencies: Vec<String>,

    /// Dial dependencies over TLS, verifying this server name.
    #[arg(long, env = "TLS_DOMAIN")]
    pub tls_domain: Option<String>,

    /// PEM file with an extra CA for dependency TLS.
    #[arg(long, env = "TLS_CA", requires = "tls_domain")]
    pub tls_ca: Option<std::path::PathBuf>,

    /// HTTP/2 keepalive ping interval towards dependencies, in milliseconds.
    #[arg(long, env = "KEEPALIVE_INTERVAL_MS", default_value_t = 10_000)]
    pub keepalive_interval_ms: u64,

    /// How long to wait for a keepalive ack, in milliseconds.
    #[arg(long, env = "KEEPALIVE_TIMEOUT_MS", default_value_t = 100)]
    pub keepalive_timeout_ms: u64,

    /// Dial timeout towards dependencies, in milliseconds.
    #[arg(long, env = "CONNECT_TIMEOUT_MS", default_value_t = 5_000)]
    pub connect_timeout_ms: u64,

    /// How long a dependency endpoint that failed a call stays out of
    /// rotation, in milliseconds.
    #[arg(long, env = "EJECT_COOLDOWN_MS", default_value_t = 5_000)]
    pub eject_cooldown_ms: u64,

    /// etcd endpoints for registration and resolution. When empty, the
    /// static `--dependency` map is used and registration is local only.
    #[arg(long = "registry-endpoint", env = "REGISTRY_ENDPOINTS", value_delimiter = ',')]
    pub registry_endpoints: Vec<String>,

    /// Key prefix under which services are registered in etcd.
    #[arg(long, env = "REGISTRY_PREFIX", default_value_t = String::from("services"))]
    pub registry_prefix: String,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub secret: SigningSecret,
    pub token_ttl: Duration,
    pub registration_ttl: Duration,
    pub registration_timeout: Duration,
    pub drain_timeout: Duration,
    pub deregister_timeout: Duration,
    pub captcha_service: String,
    pub dependencies: Vec<String>,
    pub security: TransportSecurity,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
    pub connect_timeout: Duration,
    pub eject_cooldown: Duration,
    pub registry_endpoints: Vec<String>,
    pub registry_prefix: String,
}

impl ServerConfig {
    /// Address the listener binds to.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port))
    }

    /// What this instance advertises to discovery.
    pub fn registration_record(&self) -> RegistrationRecord {
        RegistrationRecord::new(self.name.clone(), self.host.clone(), self.port)
    }

    pub fn lifecycle_settings(&self) -> LifecycleSettings {
        LifecycleSettings {
            record: self.registration_record(),
            registration_ttl: self.registration_ttl,
            registration_timeout: self.registration_timeout,
            drain_timeout: self.drain_timeout,
            deregister_timeout: self.deregister_timeout,
        }
    }

    pub fn connector_config(&self) -> ConnectorConfig {
        ConnectorConfig {
            keepalive_interval: self.keepalive_interval,
            keepalive_timeout: self.keepalive_timeout,
            keepalive_while_idle: true,
            connect_timeout: self.connect_timeout,
            eject_cooldown: self.eject_cooldown,
            security: self.security.clone(),
        }
    }
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.jwt_secret.is_empty() {
            bail!("JWT_SECRET must not be empty");
        }
        if args.name.is_empty() {
            bail!("SERVICE_NAME must not be empty");
        }
        if args.port == 0 {
            bail!("SERVICE_PORT must be greater than 0");
        }
        if args.token_ttl_secs == 0 {
            bail!("TOKEN_TTL_SECS must be greater than 0");
        }
        if args.registration_ttl_secs == 0 {
            bail!("REGISTRATION_TTL_SECS must be greater than 0");
        }
        if args.keepalive_interval_ms == 0 || args.keepalive_timeout_ms == 0 {
            bail!("keepalive interval and timeout must be greater than 0");
        }
        if !args.registry_endpoints.is_empty() && args.registry_prefix.trim_matches('/').is_empty() {
            bail!("REGISTRY_PREFIX must not be empty");
        }

        let secret = SigningSecret::new(args.jwt_secret)?;

        let security = match args.tls_domain {
            None => TransportSecurity::Insecure,
            Some(domain) => {
                let ca_pem = match &args.tls_ca {
                    Some(path) => Some(
                        std::fs::read(path)
                            .with_context(|| format!("reading TLS CA {}", path.display()))?,
                    ),
                    None => None,
                };
                TransportSecurity::Tls { domain, ca_pem }
            }
        };

        Ok(Self {
            name: args.name,
            host: args.host,
            port: args.port,
            secret,
            token_ttl: Duration::from_secs(args.token_ttl_secs),
            registration_ttl: Duration::from_secs(args.registration_ttl_secs),
            registration_timeout: Duration::from_secs(args.registration_timeout_secs),
            drain_timeout: Duration::from_secs(args.drain_timeout_secs),
            deregister_timeout: Duration::from_secs(args.deregister_timeout_secs),
            captcha_service: args.captcha_service,
            dependencies: args.dependencies,
            security,
            keepalive_interval: Duration::from_millis(args.keepalive_interval_ms),
            keepalive_timeout: Duration::from_millis(args.keepalive_timeout_ms),
            connect_timeout: Duration::from_millis(args.connect_timeout_ms),
            eject_cooldown: Duration::from_millis(args.eject_cooldown_ms),
            registry_endpoints: args.registry_endpoints,
            registry_prefix: args.registry_prefix,
        })
    }
}
