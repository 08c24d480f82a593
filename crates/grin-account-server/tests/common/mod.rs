#![allow(dead_code)]

use core::time::Duration;
use grin_account_core::{
    proto::{
        account::user_service_client::UserServiceClient,
        captcha::{
            Purpose, VerifyReq, VerifyRsp,
            captcha_service_server::{CaptchaService, CaptchaServiceServer},
        },
    },
    token::{SigningSecret, TokenCodec},
    types::AUTHORIZATION_HEADER,
};
use grin_account_server::server::{
    discovery::{Discovery, MemoryRegistry, RegistrationRecord},
    lifecycle::{Lifecycle, LifecycleSettings, LifecycleState},
    service::{AccountService, Argon2Hasher, CaptchaVerifier, MemoryUserStore},
};
use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};
use tokio::{net::TcpListener, sync::watch, task::JoinHandle};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, transport::Channel};

pub const ACCOUNT_SERVICE: &str = "grin-account-service";
pub const CAPTCHA_SERVICE: &str = "grin-captcha-service";

/// Captcha answers understood by [`StubCaptcha`].
pub const GOOD_CAPTCHA: &str = "1234";
pub const PANIC_CAPTCHA: &str = "boom";
pub const SLOW_CAPTCHA: &str = "slow";

pub fn codec() -> TokenCodec {
    TokenCodec::new(&SigningSecret::new("integration-secret").unwrap())
}

/// In-process captcha check. Panics on [`PANIC_CAPTCHA`] to exercise fault
/// recovery and stalls on [`SLOW_CAPTCHA`] to exercise draining.
#[derive(Default)]
pub struct StubCaptcha;

#[tonic::async_trait]
impl CaptchaVerifier for StubCaptcha {
    async fn verify(&self, _key: &str, value: &str, _purpose: Purpose) -> Result<bool, Status> {
        match value {
            PANIC_CAPTCHA => panic!("captcha backend returned garbage"),
            SLOW_CAPTCHA => {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(true)
            }
            other => Ok(other == GOOD_CAPTCHA),
        }
    }
}

pub fn account_service(codec: TokenCodec) -> AccountService {
    AccountService::new(
        codec,
        Arc::new(MemoryUserStore::new()),
        Arc::new(Argon2Hasher::default()),
        Arc::new(StubCaptcha),
    )
}

/// An account service running under a [`Lifecycle`] on an ephemeral port.
pub struct RunningAccount {
    pub addr: SocketAddr,
    pub state: watch::Receiver<LifecycleState>,
    pub shutdown: CancellationToken,
    pub task: JoinHandle<grin_account_core::Result<()>>,
}

impl RunningAccount {
    pub async fn start(discovery: Arc<dyn Discovery>, handler: AccountService) -> Self {
        Self::start_with(discovery, handler, |_| {}).await
    }

    /// Like [`RunningAccount::start`], with `tune` applied to the settings.
    pub async fn start_with(
        discovery: Arc<dyn Discovery>,
        handler: AccountService,
        tune: impl FnOnce(&mut LifecycleSettings),
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut settings =
            LifecycleSettings::new(RegistrationRecord::new(ACCOUNT_SERVICE, "127.0.0.1", addr.port()));
        settings.registration_ttl = Duration::from_secs(2);
        settings.drain_timeout = Duration::from_secs(2);
        settings.deregister_timeout = Duration::from_secs(1);
        tune(&mut settings);

        let shutdown = CancellationToken::new();
        let lifecycle = Lifecycle::new(settings, discovery, shutdown.clone());
        let state = lifecycle.state();
        let task = tokio::spawn(lifecycle.run(listener, handler));

        Self {
            addr,
            state,
            shutdown,
            task,
        }
    }

    pub async fn serving(mut self) -> Self {
        tokio::time::timeout(
            Duration::from_secs(5),
            self.state.wait_for(|s| *s == LifecycleState::Serving),
        )
        .await
        .expect("service did not start serving")
        .expect("lifecycle dropped");
        self
    }

    pub async fn client(&self) -> UserServiceClient<Channel> {
        UserServiceClient::connect(format!("http://{}", self.addr))
            .await
            .unwrap()
    }

    pub async fn stop(self) -> grin_account_core::Result<()> {
        self.shutdown.cancel();
        self.task.await.unwrap()
    }
}

pub async fn start_account() -> (RunningAccount, MemoryRegistry) {
    let registry = MemoryRegistry::new();
    let running = RunningAccount::start(Arc::new(registry.clone()), account_service(codec()))
        .await
        .serving()
        .await;
    (running, registry)
}

pub fn with_bearer<T>(message: T, token: &str) -> Request<T> {
    let mut request = Request::new(message);
    request
        .metadata_mut()
        .insert(AUTHORIZATION_HEADER, format!("bearer {token}").parse().unwrap());
    request
}

/// A real `captcha.CaptchaService` that accepts every answer and counts the
/// calls it serves.
#[derive(Clone, Default)]
pub struct CountingCaptcha {
    pub hits: Arc<AtomicUsize>,
}

#[tonic::async_trait]
impl CaptchaService for CountingCaptcha {
    async fn verify(&self, _request: Request<VerifyReq>) -> Result<Response<VerifyRsp>, Status> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        Ok(Response::new(VerifyRsp { success: true }))
    }
}

pub struct CaptchaInstance {
    pub addr: SocketAddr,
    pub hits: Arc<AtomicUsize>,
    pub shutdown: CancellationToken,
}

impl CaptchaInstance {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub fn record(&self) -> RegistrationRecord {
        RegistrationRecord::new(CAPTCHA_SERVICE, "127.0.0.1", self.addr.port())
    }
}

pub async fn spawn_captcha() -> CaptchaInstance {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let service = CountingCaptcha::default();
    let hits = service.hits.clone();
    let shutdown = CancellationToken::new();

    tokio::spawn(
        tonic::transport::Server::builder()
            .add_service(CaptchaServiceServer::new(service))
            .serve_with_incoming_shutdown(
                TcpListenerStream::new(listener),
                shutdown.clone().cancelled_owned(),
            ),
    );

    CaptchaInstance {
        addr,
        hits,
        shutdown,
    }
}

/// Polls `check` until it holds or five seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
