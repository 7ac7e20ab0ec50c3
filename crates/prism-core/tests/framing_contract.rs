//! Framing contract
//!
//! Protocol faults at the byte and message level: oversized frames,
//! bodies that are not JSON, unknown actions, and major-version skew.
//! Byte-level faults close the connection without a reply; well-framed
//! but invalid messages get a single `bad_request` and then the close.

mod common;

use std::time::Duration;

use common::*;

#[tokio::test]
async fn oversized_frame_closes_without_a_reply() {
    let server = TestServer::spawn(test_config()).await;
    let mut client = TestClient::connect(server.addr).await;

    // Length prefix far above the 64 KiB cap, followed by the body; the
    // server may reset mid-write, which is part of the contract
    client.send_raw_lossy(&70_000u32.to_be_bytes()).await;
    client.send_raw_lossy(&vec![b'x'; 70_000]).await;

    assert_eq!(
        client.recv_json_timeout(Duration::from_secs(5)).await,
        None,
        "no reply expected"
    );
    assert!(server.registry.snapshot_all().await.is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn non_json_body_closes_without_a_reply() {
    let server = TestServer::spawn(test_config()).await;
    let mut client = TestClient::connect(server.addr).await;

    let body = b"definitely not json";
    client.send_raw(&(body.len() as u32).to_be_bytes()).await;
    client.send_raw(body).await;

    assert_eq!(client.recv_json_timeout(Duration::from_secs(5)).await, None);
    assert!(server.registry.snapshot_all().await.is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn unknown_action_gets_bad_request_then_close() {
    let server = TestServer::spawn(test_config()).await;
    let mut client = TestClient::connect(server.addr).await;

    client
        .send_json(&serde_json::json!({
            "version": "1.0",
            "action": "subscribe",
            "auth_token": "T1",
        }))
        .await;

    assert_eq!(
        client.recv_json_timeout(Duration::from_secs(5)).await,
        Some(error_reply("bad_request"))
    );
    client.expect_close(Duration::from_secs(2)).await;

    server.shutdown().await;
}

#[tokio::test]
async fn unknown_action_after_auth_is_also_bad_request() {
    let server = TestServer::spawn(test_config()).await;
    let mut client = TestClient::connect(server.addr).await;

    assert_eq!(client.register("h1", "10.0.0.5", Some("T1")).await, ok_reply());

    client
        .send_json(&serde_json::json!({"version": "1.0", "action": "unregister"}))
        .await;
    assert_eq!(
        client.recv_json_timeout(Duration::from_secs(5)).await,
        Some(error_reply("bad_request"))
    );
    client.expect_close(Duration::from_secs(2)).await;

    server.shutdown().await;
}

#[tokio::test]
async fn major_version_skew_is_rejected() {
    let server = TestServer::spawn(test_config()).await;
    let mut client = TestClient::connect(server.addr).await;

    client
        .send_json(&serde_json::json!({
            "version": "2.0",
            "action": "register",
            "hostname": "h1",
            "client_ip": "10.0.0.5",
            "auth_token": "T1",
        }))
        .await;

    assert_eq!(
        client.recv_json_timeout(Duration::from_secs(5)).await,
        Some(error_reply("bad_request"))
    );
    client.expect_close(Duration::from_secs(2)).await;
    assert!(server.registry.snapshot_all().await.is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn minor_version_skew_is_accepted() {
    let server = TestServer::spawn(test_config()).await;
    let mut client = TestClient::connect(server.addr).await;

    client
        .send_json(&serde_json::json!({
            "version": "1.9",
            "action": "register",
            "hostname": "h1",
            "client_ip": "10.0.0.5",
            "auth_token": "T1",
        }))
        .await;

    assert_eq!(
        client.recv_json_timeout(Duration::from_secs(5)).await,
        Some(ok_reply())
    );

    server.shutdown().await;
}

#[tokio::test]
async fn a_frame_split_across_writes_is_reassembled() {
    let server = TestServer::spawn(test_config()).await;
    let mut client = TestClient::connect(server.addr).await;

    let body = serde_json::to_vec(&serde_json::json!({
        "version": "1.0",
        "action": "register",
        "hostname": "h1",
        "client_ip": "10.0.0.5",
        "auth_token": "T1",
    }))
    .unwrap();

    client.send_raw(&(body.len() as u32).to_be_bytes()).await;
    let (head, tail) = body.split_at(body.len() / 2);
    client.send_raw(head).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.send_raw(tail).await;

    assert_eq!(
        client.recv_json_timeout(Duration::from_secs(5)).await,
        Some(ok_reply())
    );
    assert!(server.registry.get("h1").await.is_some());

    server.shutdown().await;
}
