//! Connect lifecycle: clean connect, terminal handshake rejection,
//! duplicate-registration recovery, and cancellation.
//!
//! # Scenarios
//! 1. Clean connect fires `connected` exactly once before `open` returns;
//!    cancelling the parent token exits the supervisor promptly.
//! 2. `406 Not Acceptable` is terminal: `open` fails, nothing retries.
//! 3. `409 Conflict` rebuilds the machine id exactly once, then keeps
//!    retrying with the rebuilt id.

use std::time::Duration;

use brokerlink::{Config, TunnelBuilder, TunnelError};
use brokerlink_testkit::{BrokerScript, CountingIdentifier, MockBroker, RecordingNotifier};
use tokio_util::sync::CancellationToken;

fn config_for(broker: &MockBroker) -> Config {
    Config {
        semver: "0.0.1-test".to_owned(),
        addresses: vec![broker.address()],
        ..Config::default()
    }
}

#[tokio::test]
async fn clean_connect_fires_connected_before_open_returns() {
    let broker = MockBroker::start(BrokerScript::default()).await.unwrap();
    let notifier = RecordingNotifier::new();
    let identifier = CountingIdentifier::new();

    let tunnel = TunnelBuilder::new()
        .notifier(notifier.clone())
        .identifier(identifier.clone())
        .open(config_for(&broker))
        .await
        .unwrap();

    // `connected` fired synchronously before open returned.
    assert_eq!(notifier.kinds(), vec!["connected"]);
    assert_eq!(tunnel.id(), 7);
    assert!(tunnel.node_name().starts_with("minion-"));
    assert_eq!(broker.handshake_count(), 1);
    assert_eq!(identifier.initial_reads(), 1);
    assert_eq!(identifier.rebuilds(), 0);

    let ident = broker.identities().pop().unwrap();
    assert_eq!(ident.machine_id, "machine-initial");
    assert_eq!(ident.semver, "0.0.1-test");
    assert!(!ident.hostname.is_empty());
}

#[tokio::test]
async fn cancelling_the_parent_token_exits_the_supervisor() {
    let broker = MockBroker::start(BrokerScript::default()).await.unwrap();
    let notifier = RecordingNotifier::new();
    let token = CancellationToken::new();

    let tunnel = TunnelBuilder::new()
        .notifier(notifier.clone())
        .cancellation(token.clone())
        .open(config_for(&broker))
        .await
        .unwrap();

    token.cancel();
    notifier
        .wait_for("exited", 1, Duration::from_secs(3))
        .await;

    let kinds = notifier.kinds();
    assert_eq!(kinds.first().map(String::as_str), Some("connected"));
    assert_eq!(kinds.last().map(String::as_str), Some("exited"));
    assert_eq!(notifier.count("exited"), 1);
    assert!(notifier.events().last().unwrap().contains("cancelled"));

    // Dispatcher calls after cancellation fail with the cancellation error.
    let err = tunnel
        .oneway("/api/v1/minion/ping", bytes::Bytes::new(), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, TunnelError::Cancelled));
}

#[tokio::test]
async fn not_acceptable_handshake_is_terminal() {
    let broker = MockBroker::start(BrokerScript {
        handshake_statuses: vec![406],
        ..BrokerScript::default()
    })
    .await
    .unwrap();
    let notifier = RecordingNotifier::new();

    let err = TunnelBuilder::new()
        .notifier(notifier.clone())
        .open(config_for(&broker))
        .await
        .unwrap_err();

    match err {
        TunnelError::Http(he) => {
            assert!(he.is_not_acceptable());
            assert!(he.message().contains("not acceptable"));
        }
        other => panic!("expected HttpError, got {other:?}"),
    }
    // No callbacks at all: the failure happened inside the initial open.
    assert!(notifier.events().is_empty());

    // No retry follows a terminal rejection.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(broker.handshake_count(), 1);
    assert_eq!(broker.session_count(), 0);
}

#[tokio::test]
async fn conflict_rebuilds_the_machine_id_exactly_once() {
    // Two conflicts in a row: the first triggers the one-shot rebuild, the
    // second must NOT trigger another.
    let broker = MockBroker::start(BrokerScript {
        handshake_statuses: vec![409, 409],
        ..BrokerScript::default()
    })
    .await
    .unwrap();
    let identifier = CountingIdentifier::new();
    let notifier = RecordingNotifier::new();

    let tunnel = TunnelBuilder::new()
        .notifier(notifier.clone())
        .identifier(identifier.clone())
        .open(config_for(&broker))
        .await
        .unwrap();

    assert_eq!(tunnel.id(), 7);
    assert_eq!(identifier.rebuilds(), 1, "rebuild must happen exactly once");
    assert_eq!(notifier.kinds(), vec!["connected"]);

    let machine_ids: Vec<String> = broker
        .identities()
        .into_iter()
        .map(|i| i.machine_id)
        .collect();
    assert_eq!(
        machine_ids,
        vec![
            "machine-initial".to_owned(),
            // Rebuilt after the first 409 and kept thereafter.
            "machine-rebuilt-1".to_owned(),
            "machine-rebuilt-1".to_owned(),
        ]
    );
}

#[tokio::test]
async fn empty_address_lists_fail_before_dialing() {
    let err = brokerlink::open(Config {
        semver: "0.0.1".to_owned(),
        addresses: vec![String::new(), "   ".to_owned()],
        ..Config::default()
    })
    .await
    .unwrap_err();
    assert!(matches!(err, TunnelError::EmptyAddresses));
}
