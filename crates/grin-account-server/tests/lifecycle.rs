mod common;

use common::{
    ACCOUNT_SERVICE, RunningAccount, SLOW_CAPTCHA, account_service, codec, start_account,
};
use core::time::Duration;
use grin_account_core::{Error, Result, proto::account::SignUpReq};
use grin_account_server::server::{
    discovery::{Discovery, EndpointSet, MemoryRegistry, Registration, RegistrationRecord},
    lifecycle::LifecycleState,
};
use std::{future, sync::Arc};
use tokio::sync::watch;

/// Discovery backend that refuses every registration.
struct Unreachable;

#[tonic::async_trait]
impl Discovery for Unreachable {
    async fn register(
        &self,
        _record: &RegistrationRecord,
        _ttl: Duration,
    ) -> Result<Box<dyn Registration>> {
        Err(Error::ConnectorUnavailable {
            service: "registry".to_string(),
            reason: "connection refused".to_string(),
        })
    }

    async fn resolve(&self, service: &str) -> Result<watch::Receiver<EndpointSet>> {
        Err(Error::ConnectorUnavailable {
            service: service.to_string(),
            reason: "connection refused".to_string(),
        })
    }
}

/// Discovery backend whose registry never answers.
struct Stalled;

#[tonic::async_trait]
impl Discovery for Stalled {
    async fn register(
        &self,
        _record: &RegistrationRecord,
        _ttl: Duration,
    ) -> Result<Box<dyn Registration>> {
        future::pending().await
    }

    async fn resolve(&self, _service: &str) -> Result<watch::Receiver<EndpointSet>> {
        future::pending().await
    }
}

fn slow_sign_up() -> SignUpReq {
    SignUpReq {
        username: "slowpoke".to_string(),
        contact: "slow@grin.io".to_string(),
        password: "patient password".to_string(),
        captcha: SLOW_CAPTCHA.to_string(),
    }
}

#[tokio::test]
async fn registered_while_serving_and_gone_after_stop() {
    let (running, registry) = start_account().await;
    let advertised = format!("127.0.0.1:{}", running.addr.port());

    assert_eq!(*running.state.borrow(), LifecycleState::Serving);
    assert!(registry.endpoints(ACCOUNT_SERVICE).contains(&advertised));

    let state = running.state.clone();
    running.stop().await.unwrap();

    assert_eq!(*state.borrow(), LifecycleState::Stopped);
    assert!(registry.endpoints(ACCOUNT_SERVICE).is_empty());
}

#[tokio::test]
async fn registration_failure_is_fatal() {
    let running = RunningAccount::start(Arc::new(Unreachable), account_service(codec())).await;
    let addr = running.addr;
    let state = running.state.clone();

    let err = running.task.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::RegistrationFailed { .. }), "{err:?}");
    assert_eq!(*state.borrow(), LifecycleState::Stopped);

    // The listener was dropped without ever serving.
    let connected = tokio::time::timeout(
        Duration::from_secs(1),
        tokio::net::TcpStream::connect(addr),
    )
    .await;
    assert!(!matches!(connected, Ok(Ok(_))));
}

#[tokio::test]
async fn in_flight_call_finishes_while_draining() {
    let (running, registry) = start_account().await;
    let mut client = running.client().await;

    let call = tokio::spawn(async move {
        client.sign_up(slow_sign_up()).await
    });

    // Let the call reach the handler before shutdown starts.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut state = running.state.clone();
    running.shutdown.cancel();
    tokio::time::timeout(
        Duration::from_secs(1),
        state.wait_for(|s| matches!(s, LifecycleState::Draining | LifecycleState::Stopped)),
    )
    .await
    .unwrap()
    .unwrap();

    let rsp = call.await.unwrap().unwrap().into_inner();
    assert!(rsp.success);

    running.task.await.unwrap().unwrap();
    assert_eq!(*state.borrow(), LifecycleState::Stopped);
    assert!(registry.endpoints(ACCOUNT_SERVICE).is_empty());
}

#[tokio::test]
async fn stalled_registration_times_out() {
    let running = RunningAccount::start_with(Arc::new(Stalled), account_service(codec()), |s| {
        s.registration_timeout = Duration::from_millis(200);
    })
    .await;
    let state = running.state.clone();

    let err = tokio::time::timeout(Duration::from_secs(2), running.task)
        .await
        .expect("registration was not bounded")
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, Error::RegistrationFailed { .. }), "{err:?}");
    assert_eq!(*state.borrow(), LifecycleState::Stopped);
}

#[tokio::test]
async fn drain_timeout_still_deregisters() {
    let registry = MemoryRegistry::new();
    let running = RunningAccount::start_with(
        Arc::new(registry.clone()),
        account_service(codec()),
        |s| s.drain_timeout = Duration::from_millis(50),
    )
    .await
    .serving()
    .await;
    let mut client = running.client().await;

    let _call = tokio::spawn(async move { client.sign_up(slow_sign_up()).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let state = running.state.clone();
    running.shutdown.cancel();

    // The slow handler needs another 200ms; the lifecycle must not wait for it.
    tokio::time::timeout(Duration::from_millis(150), running.task)
        .await
        .expect("drain was not bounded")
        .unwrap()
        .unwrap();
    assert_eq!(*state.borrow(), LifecycleState::Stopped);
    assert!(registry.endpoints(ACCOUNT_SERVICE).is_empty());
}
