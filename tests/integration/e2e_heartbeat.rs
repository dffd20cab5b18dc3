//! Heartbeat supervision: periodic pings on the live session and forced
//! teardown after five consecutive failures.
//!
//! The suites tick far below the production clamp via the unclamped test
//! hook; the clamp window itself is covered by unit tests.

use std::time::Duration;

use brokerlink::{Config, TunnelBuilder};
use brokerlink_testkit::{BrokerScript, MockBroker, RecordingNotifier};

#[tokio::test]
async fn heartbeats_tick_on_the_configured_interval() {
    let broker = MockBroker::start(BrokerScript::default()).await.unwrap();
    let _tunnel = TunnelBuilder::new()
        .heartbeat_interval_unclamped(Duration::from_millis(100))
        .open(Config {
            semver: "0.0.1".to_owned(),
            addresses: vec![broker.address()],
            ..Config::default()
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(650)).await;
    let count = broker.ping_count();
    assert!(
        (3..=8).contains(&count),
        "expected ~6 pings in 650ms at 100ms interval, saw {count}"
    );
}

#[tokio::test]
async fn five_consecutive_failures_force_a_reconnect() {
    let broker = MockBroker::start(BrokerScript::default()).await.unwrap();
    let notifier = RecordingNotifier::new();

    let _tunnel = TunnelBuilder::new()
        .notifier(notifier.clone())
        .heartbeat_interval_unclamped(Duration::from_millis(100))
        .open(Config {
            semver: "0.0.1".to_owned(),
            addresses: vec![broker.address()],
            ..Config::default()
        })
        .await
        .unwrap();

    // Let a few heartbeats land, then black-hole the broker side: pings
    // start failing while the TCP session stays up — exactly the wedge the
    // monitor exists to break.
    tokio::time::sleep(Duration::from_millis(250)).await;
    let healthy_pings = broker.ping_count();
    assert!(healthy_pings >= 1, "no heartbeat landed before the blackhole");
    broker.set_blackhole(true);

    // Five consecutive failures at 100 ms per tick close the multiplexer
    // and the supervisor reports the disconnect.
    notifier
        .wait_for("disconnected", 1, Duration::from_secs(5))
        .await;

    // Lift the blackhole so the redial (after the 5 s flap guard) lands.
    broker.set_blackhole(false);
    notifier
        .wait_for("reconnected", 1, Duration::from_secs(12))
        .await;

    assert_eq!(broker.session_count(), 2, "a fresh session was established");

    // The monitor keeps running on the new session.
    let before = broker.ping_count();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(
        broker.ping_count() > before,
        "heartbeats must resume after the reconnect"
    );
}
