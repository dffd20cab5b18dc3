//! Dispatcher operations end-to-end against the mock broker: JSON calls,
//! raw fetches, attachments, websocket streams, prefix scoping, and the
//! inbound broker→agent path.

use std::time::Duration;

use axum::Router;
use axum::routing::post;
use brokerlink::{Config, RouterServer, TunnelBuilder};
use brokerlink_testkit::{AttachmentFixture, BrokerScript, MockBroker};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http_body_util::BodyExt;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

async fn connect(broker: &MockBroker) -> brokerlink::Tunnel {
    TunnelBuilder::new()
        .open(Config {
            semver: "0.0.1".to_owned(),
            addresses: vec![broker.address()],
            ..Config::default()
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn json_round_trips_through_the_broker() {
    let broker = MockBroker::start(BrokerScript::default()).await.unwrap();
    let tunnel = connect(&broker).await;

    let reply: serde_json::Value = tunnel
        .json(
            "/echo/json",
            &serde_json::json!({"task": 9, "status": "running"}),
            None,
        )
        .await
        .unwrap();
    assert_eq!(reply["echo"]["task"], 9);
    assert_eq!(reply["echo"]["status"], "running");
}

#[tokio::test]
async fn fetch_returns_the_raw_response() {
    let broker = MockBroker::start(BrokerScript::default()).await.unwrap();
    let tunnel = connect(&broker).await;

    let resp = tunnel
        .fetch("/echo/body", Bytes::from_static(b"raw payload"), None, None)
        .await
        .unwrap();
    assert!(resp.status().is_success());
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"raw payload");
}

#[tokio::test]
async fn oneway_discards_the_response_and_pings_land() {
    let broker = MockBroker::start(BrokerScript::default()).await.unwrap();
    let tunnel = connect(&broker).await;

    for _ in 0..3 {
        tunnel
            .oneway("/api/v1/minion/ping", Bytes::new(), None, None)
            .await
            .unwrap();
    }
    assert_eq!(broker.ping_count(), 3);
}

#[tokio::test]
async fn attachment_streams_with_metadata_and_matching_checksum() {
    let payload = b"attachment payload bytes".to_vec();
    let hash = hex::encode(Sha1::digest(&payload));
    let broker = MockBroker::start(BrokerScript {
        attachment: Some(AttachmentFixture {
            status: 200,
            filename: "rules-1.4.tar.gz".to_owned(),
            hash: hash.clone(),
            body: payload.clone(),
        }),
        ..BrokerScript::default()
    })
    .await
    .unwrap();
    let tunnel = connect(&broker).await;

    let attachment = tunnel.attachment("/file", None).await.unwrap();
    assert!(!attachment.not_modified());
    assert_eq!(attachment.filename(), "rules-1.4.tar.gz");
    assert_eq!(attachment.hash(), hash);
    assert_eq!(attachment.param("id"), Some("42"));
    assert_eq!(attachment.param("customized"), Some("fleet-a"));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rules.tar.gz");
    let written = attachment.save_to(&path).await.unwrap();
    assert_eq!(written, hash, "written checksum must match the header");
    assert_eq!(tokio::fs::read(&path).await.unwrap(), payload);
}

#[tokio::test]
async fn unchanged_attachments_report_not_modified() {
    let broker = MockBroker::start(BrokerScript {
        attachment: Some(AttachmentFixture {
            status: 304,
            filename: "rules-1.4.tar.gz".to_owned(),
            hash: "cafe".to_owned(),
            body: Vec::new(),
        }),
        ..BrokerScript::default()
    })
    .await
    .unwrap();
    let tunnel = connect(&broker).await;

    let attachment = tunnel.attachment("/file", None).await.unwrap();
    assert!(attachment.not_modified());
}

#[tokio::test]
async fn websocket_stream_echoes_binary_frames() {
    let broker = MockBroker::start(BrokerScript::default()).await.unwrap();
    let tunnel = connect(&broker).await;

    let mut ws = tunnel.stream("/ws/echo", None).await.unwrap();
    ws.send(tokio_tungstenite::tungstenite::Message::Binary(
        Bytes::from_static(b"frame one"),
    ))
    .await
    .unwrap();
    let echoed = ws.next().await.unwrap().unwrap();
    assert_eq!(echoed.into_data(), Bytes::from_static(b"frame one"));
}

#[tokio::test]
async fn stream_conn_behaves_like_a_byte_pipe() {
    let broker = MockBroker::start(BrokerScript::default()).await.unwrap();
    let tunnel = connect(&broker).await;

    let mut conn = tunnel.stream_conn("/ws/echo", None).await.unwrap();
    conn.write_all(b"proxied bytes").await.unwrap();
    conn.flush().await.unwrap();

    let mut back = [0u8; 13];
    conn.read_exact(&mut back).await.unwrap();
    assert_eq!(&back, b"proxied bytes");
}

#[tokio::test]
async fn scoped_clients_prefix_every_path() {
    let broker = MockBroker::start(BrokerScript::default()).await.unwrap();
    let tunnel = connect(&broker).await;

    let scoped = tunnel.scoped("/echo");
    let reply: serde_json::Value = scoped.json("/json", &serde_json::json!(1), None).await.unwrap();
    assert_eq!(reply["echo"], 1);

    let api = tunnel.scoped("/api/v1/");
    api.oneway("minion/ping", Bytes::new(), None, None)
        .await
        .unwrap();
    assert_eq!(broker.ping_count(), 1);
}

#[tokio::test]
async fn broker_dials_inbound_requests_into_the_agent_router() {
    let broker = MockBroker::start(BrokerScript::default()).await.unwrap();

    let router = Router::new()
        .route(
            "/api/v1/agent/notice/command",
            post(|body: String| async move { format!("ack:{body}") }),
        )
        .route(
            "/api/v1/agent/task/status",
            post(|| async { axum::Json(serde_json::json!({"tasks": []})) }),
        );
    let _tunnel = TunnelBuilder::new()
        .server(RouterServer::new(router))
        .open(Config {
            semver: "0.0.1".to_owned(),
            addresses: vec![broker.address()],
            ..Config::default()
        })
        .await
        .unwrap();

    let (status, body) = broker
        .dial_agent(
            http::Method::POST,
            "/api/v1/agent/notice/command",
            Bytes::from_static(b"restart"),
        )
        .await
        .unwrap();
    assert!(status.is_success());
    assert_eq!(&body[..], b"ack:restart");

    let (status, body) = broker
        .dial_agent(http::Method::POST, "/api/v1/agent/task/status", Bytes::new())
        .await
        .unwrap();
    assert!(status.is_success());
    assert_eq!(&body[..], br#"{"tasks":[]}"#);

    // Unrouted paths get a 404 from the agent, not a dead stream.
    let (status, _) = broker
        .dial_agent(http::Method::POST, "/api/v1/agent/unknown", Bytes::new())
        .await
        .unwrap();
    assert_eq!(status, http::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn default_closed_server_refuses_inbound_streams() {
    let broker = MockBroker::start(BrokerScript::default()).await.unwrap();
    let _tunnel = connect(&broker).await;

    let res = tokio::time::timeout(
        Duration::from_secs(2),
        broker.dial_agent(http::Method::POST, "/anything", Bytes::new()),
    )
    .await;
    // Either the dial errors out (stream dropped) or it times out; it must
    // never be answered.
    match res {
        Ok(Err(_)) | Err(_) => {}
        Ok(Ok((status, _))) => panic!("closed server answered with {status}"),
    }
}
