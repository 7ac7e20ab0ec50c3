//! Registration contract
//!
//! End-to-end over a real loopback socket: authentication, record
//! creation, ownership enforcement, address changes, hostname binding,
//! and the DNS side effects of each.

mod common;

use std::net::IpAddr;
use std::time::Duration;

use common::*;
use prism_core::{HostStatus, IntentKind, ServerEvent};

fn applied_for(hostname: &str) -> impl FnMut(&ServerEvent) -> bool + '_ {
    move |event| {
        matches!(event, ServerEvent::ReconcileApplied { hostname: h, .. } if h == hostname)
    }
}

#[tokio::test]
async fn new_registration_creates_record_and_syncs_dns() {
    let mut server = TestServer::spawn(test_config()).await;
    let mut client = TestClient::connect(server.addr).await;

    let reply = client.register("h1", "10.0.0.5", Some("T1")).await;
    assert_eq!(reply, ok_reply());

    let record = server.registry.get("h1").await.expect("record created");
    assert_eq!(record.owner_id, "u1");
    assert_eq!(record.current_ip, "10.0.0.5".parse::<IpAddr>().unwrap());
    assert_eq!(record.status, HostStatus::Online);

    server
        .wait_for_event(Duration::from_secs(5), applied_for("h1"))
        .await;
    assert_eq!(
        server.backend.lookup(TEST_ZONE, "h1").await,
        Some("10.0.0.5".parse().unwrap()),
        "DNS backend should hold the registered address"
    );

    let record = server.registry.get("h1").await.unwrap();
    assert_eq!(record.dns_zone.as_deref(), Some(TEST_ZONE));
    assert!(record.dns_record_id.is_some());

    server.shutdown().await;
}

#[tokio::test]
async fn second_owner_is_rejected_and_nothing_changes() {
    let mut server = TestServer::spawn(test_config()).await;

    let mut first = TestClient::connect(server.addr).await;
    assert_eq!(first.register("h1", "10.0.0.5", Some("T1")).await, ok_reply());
    server
        .wait_for_event(Duration::from_secs(5), applied_for("h1"))
        .await;
    let upserts_before = server.backend.upsert_calls();

    let mut second = TestClient::connect(server.addr).await;
    let reply = second.register("h1", "10.0.0.6", Some("T2")).await;
    assert_eq!(reply, error_reply("forbidden"));
    second.expect_close(Duration::from_secs(2)).await;

    let record = server.registry.get("h1").await.unwrap();
    assert_eq!(record.owner_id, "u1");
    assert_eq!(record.current_ip, "10.0.0.5".parse::<IpAddr>().unwrap());
    assert_eq!(
        server.backend.lookup(TEST_ZONE, "h1").await,
        Some("10.0.0.5".parse().unwrap())
    );
    assert_eq!(server.backend.upsert_calls(), upserts_before);

    server.shutdown().await;
}

#[tokio::test]
async fn ip_change_by_the_owner_updates_dns() {
    let mut server = TestServer::spawn(test_config()).await;

    let mut client = TestClient::connect(server.addr).await;
    assert_eq!(client.register("h1", "10.0.0.5", Some("T1")).await, ok_reply());
    server
        .wait_for_event(Duration::from_secs(5), applied_for("h1"))
        .await;
    drop(client);

    // Same owner reconnects with a new address
    let mut reconnected = TestClient::connect(server.addr).await;
    assert_eq!(
        reconnected.register("h1", "10.0.0.9", Some("T1")).await,
        ok_reply()
    );
    server
        .wait_for_event(Duration::from_secs(5), applied_for("h1"))
        .await;

    assert_eq!(
        server.registry.get("h1").await.unwrap().current_ip,
        "10.0.0.9".parse::<IpAddr>().unwrap()
    );
    assert_eq!(
        server.backend.lookup(TEST_ZONE, "h1").await,
        Some("10.0.0.9".parse().unwrap())
    );

    server.shutdown().await;
}

#[tokio::test]
async fn malformed_hostname_is_rejected_without_registry_mutation() {
    let server = TestServer::spawn(test_config()).await;

    let mut client = TestClient::connect(server.addr).await;
    let reply = client.register("-bad..name", "10.0.0.5", Some("T1")).await;
    assert_eq!(reply, error_reply("bad_hostname"));
    client.expect_close(Duration::from_secs(2)).await;

    assert!(server.registry.snapshot_all().await.is_empty());
    assert_eq!(server.backend.record_count().await, 0);

    server.shutdown().await;
}

#[tokio::test]
async fn invalid_token_fails_auth_and_closes() {
    let server = TestServer::spawn(test_config()).await;

    let mut client = TestClient::connect(server.addr).await;
    let reply = client.register("h1", "10.0.0.5", Some("WRONG")).await;
    assert_eq!(reply, error_reply("auth_failed"));
    client.expect_close(Duration::from_secs(2)).await;
    assert!(server.registry.snapshot_all().await.is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn first_frame_without_a_token_fails_auth() {
    let server = TestServer::spawn(test_config()).await;

    let mut client = TestClient::connect(server.addr).await;
    let reply = client.register("h1", "10.0.0.5", None).await;
    assert_eq!(reply, error_reply("auth_failed"));
    client.expect_close(Duration::from_secs(2)).await;

    server.shutdown().await;
}

#[tokio::test]
async fn explicit_auth_frame_then_bare_register() {
    let server = TestServer::spawn(test_config()).await;
    let mut client = TestClient::connect(server.addr).await;

    client
        .send_json(&serde_json::json!({
            "version": "1.0",
            "action": "auth",
            "auth_token": "T1",
        }))
        .await;
    assert_eq!(
        client.recv_json_timeout(Duration::from_secs(5)).await,
        Some(ok_reply())
    );

    // Registration on an authenticated connection needs no token
    assert_eq!(client.register("h1", "10.0.0.5", None).await, ok_reply());
    assert_eq!(server.registry.get("h1").await.unwrap().owner_id, "u1");

    server.shutdown().await;
}

#[tokio::test]
async fn heartbeat_must_match_the_bound_hostname() {
    let server = TestServer::spawn(test_config()).await;
    let mut client = TestClient::connect(server.addr).await;

    assert_eq!(client.register("h1", "10.0.0.5", Some("T1")).await, ok_reply());
    assert_eq!(client.heartbeat("h1").await, ok_reply());

    // Hostname casing is canonicalised before the binding check
    assert_eq!(client.heartbeat("H1").await, ok_reply());

    assert_eq!(client.heartbeat("h2").await, error_reply("forbidden"));
    client.expect_close(Duration::from_secs(2)).await;

    server.shutdown().await;
}

#[tokio::test]
async fn one_connection_binds_at_most_one_hostname() {
    let server = TestServer::spawn(test_config()).await;
    let mut client = TestClient::connect(server.addr).await;

    assert_eq!(client.register("h1", "10.0.0.5", Some("T1")).await, ok_reply());
    // Re-registering the bound hostname is fine
    assert_eq!(client.register("h1", "10.0.0.5", None).await, ok_reply());

    let reply = client.register("h2", "10.0.0.5", None).await;
    assert_eq!(reply, error_reply("forbidden"));
    client.expect_close(Duration::from_secs(2)).await;
    assert!(server.registry.get("h2").await.is_none());

    server.shutdown().await;
}

#[tokio::test]
async fn goodbye_closes_cleanly_and_leaves_status_alone() {
    let server = TestServer::spawn(test_config()).await;
    let mut client = TestClient::connect(server.addr).await;

    assert_eq!(client.register("h1", "10.0.0.5", Some("T1")).await, ok_reply());

    client
        .send_json(&serde_json::json!({"version": "1.0", "action": "goodbye"}))
        .await;
    assert_eq!(
        client.recv_json_timeout(Duration::from_secs(5)).await,
        Some(ok_reply())
    );
    client.expect_close(Duration::from_secs(2)).await;

    // Goodbye does not take the host offline; the monitor owns that
    assert_eq!(
        server.registry.get("h1").await.unwrap().status,
        HostStatus::Online
    );

    server.shutdown().await;
}

#[tokio::test]
async fn loopback_client_ip_falls_back_to_the_socket_peer() {
    let server = TestServer::spawn(test_config()).await;
    let mut client = TestClient::connect(server.addr).await;

    assert_eq!(client.register("h1", "127.0.0.1", Some("T1")).await, ok_reply());

    // The peer of a loopback test connection is loopback too, but the
    // point is that the reported literal was not trusted blindly: the
    // recorded address equals the socket peer.
    let record = server.registry.get("h1").await.unwrap();
    assert!(record.current_ip.is_loopback());

    server.shutdown().await;
}

#[tokio::test]
async fn dns_disabled_leaves_records_unsynced() {
    let mut config = test_config();
    config.dns.enabled = false;
    let server = TestServer::spawn(config).await;

    let mut client = TestClient::connect(server.addr).await;
    assert_eq!(client.register("h1", "10.0.0.5", Some("T1")).await, ok_reply());

    // Give any stray reconcile a moment to (incorrectly) run
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.backend.upsert_calls(), 0);
    assert_eq!(
        server.registry.get("h1").await.unwrap().dns_sync_status,
        prism_core::DnsSyncStatus::Disabled
    );

    server.shutdown().await;
}

#[tokio::test]
async fn reconcile_event_reports_an_upsert_intent() {
    let mut server = TestServer::spawn(test_config()).await;
    let mut client = TestClient::connect(server.addr).await;
    assert_eq!(client.register("h1", "10.0.0.5", Some("T1")).await, ok_reply());

    let event = server
        .wait_for_event(Duration::from_secs(5), applied_for("h1"))
        .await;
    match event {
        ServerEvent::ReconcileApplied { intent, .. } => assert_eq!(intent, IntentKind::Upsert),
        other => panic!("unexpected event {other:?}"),
    }

    server.shutdown().await;
}
