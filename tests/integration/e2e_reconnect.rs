//! Reconnect behavior: endpoint fallback and mid-stream session loss.
//!
//! # Scenarios
//! 1. First endpoint refuses, second succeeds after one backoff sleep.
//! 2. The broker resets the live session: `disconnected` fires, in-flight
//!    calls fail once, the flap guard delays the redial, and
//!    `reconnected` follows.

use std::time::{Duration, Instant};

use brokerlink::{Config, TunnelBuilder, TunnelError};
use brokerlink_testkit::{BrokerScript, MockBroker, RecordingNotifier};
use bytes::Bytes;

/// A localhost port with nothing listening on it.
async fn dead_port() -> u16 {
    let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);
    port
}

#[tokio::test]
async fn second_endpoint_succeeds_after_first_refuses() {
    let broker = MockBroker::start(BrokerScript::default()).await.unwrap();
    let dead = format!("tcp://127.0.0.1:{}", dead_port().await);
    let notifier = RecordingNotifier::new();

    let started = Instant::now();
    let tunnel = TunnelBuilder::new()
        .notifier(notifier.clone())
        .open(Config {
            semver: "0.0.1".to_owned(),
            addresses: vec![dead, broker.address()],
            ..Config::default()
        })
        .await
        .unwrap();

    // One refused dial, one backoff sleep (2-3 s), then the live endpoint.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(2), "backoff was skipped: {elapsed:?}");
    assert_eq!(notifier.kinds(), vec!["connected"]);
    assert_eq!(broker.handshake_count(), 1);
    assert_eq!(
        tunnel.broker_addr().unwrap().port,
        broker.local_addr().port()
    );
}

#[tokio::test]
async fn broker_reset_triggers_disconnect_then_reconnect() {
    let broker = MockBroker::start(BrokerScript::default()).await.unwrap();
    let notifier = RecordingNotifier::new();

    let tunnel = TunnelBuilder::new()
        .notifier(notifier.clone())
        .open(Config {
            semver: "0.0.1".to_owned(),
            addresses: vec![broker.address()],
            ..Config::default()
        })
        .await
        .unwrap();

    // Traffic flows on the first session.
    tunnel
        .oneway("/api/v1/minion/ping", Bytes::new(), None, None)
        .await
        .unwrap();

    broker.kill_sessions();

    // A call racing the reset fails exactly once — no silent retry onto a
    // fresh session.
    let inflight = tunnel
        .oneway("/api/v1/minion/ping", Bytes::new(), None, Some(Duration::from_secs(2)))
        .await;
    assert!(inflight.is_err(), "in-flight call must surface the breakage");

    notifier
        .wait_for("disconnected", 1, Duration::from_secs(3))
        .await;
    // The session lived < 5 s, so the flap guard delays the redial.
    notifier
        .wait_for("reconnected", 1, Duration::from_secs(10))
        .await;

    assert_eq!(
        notifier.kinds(),
        vec!["connected", "disconnected", "reconnected"]
    );
    assert_eq!(broker.session_count(), 2);

    // The dispatcher sees the fresh session without being told.
    tunnel
        .oneway("/api/v1/minion/ping", Bytes::new(), None, None)
        .await
        .unwrap();
    assert!(broker.ping_count() >= 2);
}

#[tokio::test]
async fn every_disconnect_is_followed_by_reconnect_or_exit() {
    let broker = MockBroker::start(BrokerScript::default()).await.unwrap();
    let notifier = RecordingNotifier::new();
    let token = tokio_util::sync::CancellationToken::new();

    let _tunnel = TunnelBuilder::new()
        .notifier(notifier.clone())
        .cancellation(token.clone())
        .open(Config {
            semver: "0.0.1".to_owned(),
            addresses: vec![broker.address()],
            ..Config::default()
        })
        .await
        .unwrap();

    broker.kill_sessions();
    notifier
        .wait_for("reconnected", 1, Duration::from_secs(10))
        .await;
    token.cancel();
    notifier.wait_for("exited", 1, Duration::from_secs(3)).await;

    // Program order: connected first; each disconnected answered by a
    // reconnected or the final exited; exactly one exited.
    let kinds = notifier.kinds();
    assert_eq!(kinds.first().map(String::as_str), Some("connected"));
    assert_eq!(kinds.last().map(String::as_str), Some("exited"));
    assert_eq!(notifier.count("connected"), 1);
    assert_eq!(notifier.count("exited"), 1);
    let disconnects = notifier.count("disconnected");
    let answers = notifier.count("reconnected") + 1; // + exited
    assert!(disconnects <= answers, "unanswered disconnect in {kinds:?}");
}
