mod common;

use common::{CAPTCHA_SERVICE, eventually, spawn_captcha};
use core::time::Duration;
use grin_account_core::proto::captcha::Purpose;
use grin_account_server::server::{
    connector::{ConnectorConfig, ServiceConnector},
    discovery::{Discovery, MemoryRegistry, Registration, StaticDiscovery},
    service::{CaptchaVerifier, RemoteCaptcha},
};
use std::sync::Arc;

#[tokio::test]
async fn calls_spread_round_robin_across_endpoints() {
    let first = spawn_captcha().await;
    let second = spawn_captcha().await;
    let discovery =
        StaticDiscovery::new().with_service(CAPTCHA_SERVICE, [first.address(), second.address()]);

    let connector = ServiceConnector::new(Arc::new(discovery), ConnectorConfig::default());
    let captcha = RemoteCaptcha::connect(&connector, CAPTCHA_SERVICE)
        .await
        .unwrap();

    for _ in 0..100 {
        let ok = captcha
            .verify("13800138000", "1234", Purpose::SignIn)
            .await
            .unwrap();
        assert!(ok);
    }

    assert_eq!(first.hits() + second.hits(), 100);
    assert!(first.hits() >= 40, "first endpoint served {}", first.hits());
    assert!(second.hits() >= 40, "second endpoint served {}", second.hits());

    first.shutdown.cancel();
    second.shutdown.cancel();
}

#[tokio::test]
async fn rotation_follows_registry_membership() {
    let first = spawn_captcha().await;
    let second = spawn_captcha().await;
    let registry = MemoryRegistry::new();
    let ttl = Duration::from_secs(5);

    let mut first_lease = registry.register(&first.record(), ttl).await.unwrap();

    let connector = ServiceConnector::new(Arc::new(registry.clone()), ConnectorConfig::default());
    let channel = connector.connect(CAPTCHA_SERVICE).await.unwrap();
    assert_eq!(channel.service(), CAPTCHA_SERVICE);
    assert_eq!(channel.endpoints(), [first.address()]);

    // A new instance joins the rotation.
    let _second_lease = registry.register(&second.record(), ttl).await.unwrap();
    eventually(|| channel.endpoints().len() == 2).await;

    let captcha = RemoteCaptcha::new(channel.clone());
    for _ in 0..10 {
        captcha
            .verify("13800138000", "1234", Purpose::SignUp)
            .await
            .unwrap();
    }
    assert!(first.hits() > 0);
    assert!(second.hits() > 0);

    // A departing instance leaves it.
    first_lease.deregister().await.unwrap();
    eventually(|| channel.endpoints() == [second.address()]).await;

    let before = first.hits();
    for _ in 0..10 {
        captcha
            .verify("13800138000", "1234", Purpose::SignUp)
            .await
            .unwrap();
    }
    assert_eq!(first.hits(), before);

    first.shutdown.cancel();
    second.shutdown.cancel();
}

#[tokio::test]
async fn dead_endpoint_is_left_out_at_connect() {
    let live = spawn_captcha().await;
    let dead_port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let dead = format!("127.0.0.1:{dead_port}");
    let discovery =
        StaticDiscovery::new().with_service(CAPTCHA_SERVICE, [live.address(), dead.clone()]);
    let config = ConnectorConfig {
        connect_timeout: Duration::from_millis(500),
        ..ConnectorConfig::default()
    };

    let channel = ServiceConnector::new(Arc::new(discovery), config)
        .connect(CAPTCHA_SERVICE)
        .await
        .unwrap();
    assert_eq!(channel.endpoints(), [live.address()]);

    let captcha = RemoteCaptcha::new(channel);
    for _ in 0..5 {
        captcha
            .verify("a@b.io", "1234", Purpose::ResetPasswd)
            .await
            .unwrap();
    }
    assert_eq!(live.hits(), 5);

    live.shutdown.cancel();
}

#[tokio::test]
async fn dead_peer_is_ejected_without_deregistration() {
    let first = spawn_captcha().await;
    let second = spawn_captcha().await;
    let discovery =
        StaticDiscovery::new().with_service(CAPTCHA_SERVICE, [first.address(), second.address()]);
    let config = ConnectorConfig {
        connect_timeout: Duration::from_millis(500),
        eject_cooldown: Duration::from_secs(30),
        ..ConnectorConfig::default()
    };

    let channel = ServiceConnector::new(Arc::new(discovery), config)
        .connect(CAPTCHA_SERVICE)
        .await
        .unwrap();
    let captcha = RemoteCaptcha::new(channel.clone());
    for _ in 0..4 {
        captcha
            .verify("13800138000", "1234", Purpose::SignIn)
            .await
            .unwrap();
    }
    assert_eq!(second.hits(), 2);

    // The instance goes away but stays in the endpoint set.
    second.shutdown.cancel();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let before = first.hits();
    let mut failures = 0;
    for _ in 0..20 {
        if captcha
            .verify("13800138000", "1234", Purpose::SignIn)
            .await
            .is_err()
        {
            failures += 1;
        }
    }

    // At most the call that discovered the failure is lost.
    assert!(failures <= 1, "{failures} calls failed");
    assert_eq!(first.hits() - before, 20 - failures);
    assert_eq!(channel.endpoints().len(), 2);
    assert_eq!(channel.healthy_endpoints(), [first.address()]);

    first.shutdown.cancel();
}
