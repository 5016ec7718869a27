//! Integration tests for the connection registry.
//!
//! Peers live on an in-memory network; no sockets are opened.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

mod common;

use std::time::Duration;

use common::{next_closed, next_opened, registry_settings, spawn_fixture, FakeNetwork, PeerBehavior};
use serde_json::json;
use tabgate_core::{ConnectionId, ConnectionState, ResourceId};
use tabgated::locks::Grant;
use tabgated::registry::{CloseReason, ConnectionError};
use tokio::time::{sleep, timeout};

const SETTLE: Duration = Duration::from_millis(10);

// ============================================================================
// Discovery Tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_overlapping_scans_open_one_connection() {
    let (net, _received) = FakeNetwork::new();
    net.listen(8769, PeerBehavior::new("ext-1"));
    let mut fx = spawn_fixture(registry_settings(8765, 8775), net.clone());

    let (first, second) = tokio::join!(fx.registry.scan(), fx.registry.scan());
    first.expect("scan should succeed");
    second.expect("scan should succeed");

    let (id, _, port) = next_opened(&mut fx.events).await;
    assert_eq!(id, ConnectionId::new("ext-1"));
    assert_eq!(port, 8769);

    sleep(SETTLE).await;

    let snapshot = fx.registry.snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].endpoint.port, 8769);
    assert_eq!(snapshot[0].state, ConnectionState::Open);
    assert_eq!(net.attempts(8769), 1);
    assert_eq!(fx.directory.state(&id), Some(ConnectionState::Open));
}

#[tokio::test(start_paused = true)]
async fn test_connected_port_is_not_probed_again() {
    let (net, _received) = FakeNetwork::new();
    net.listen(8765, PeerBehavior::new("ext-1"));
    let mut fx = spawn_fixture(registry_settings(8765, 8765), net.clone());

    next_opened(&mut fx.events).await;
    sleep(Duration::from_secs(2)).await;

    let started = fx.registry.scan().await.unwrap();
    assert!(!started.contains(&8765));
    assert_eq!(net.attempts(8765), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_ports_back_off_exponentially() {
    let (net, _received) = FakeNetwork::new();
    let fx = spawn_fixture(registry_settings(8765, 8765), net.clone());

    // The first scan fires as soon as the registry starts.
    sleep(SETTLE).await;

    let report = fx.registry.port_status().await;
    assert_eq!(report.candidates, vec![8765, 8766]);
    assert_eq!(report.backoff.len(), 2);
    for entry in &report.backoff {
        assert_eq!(entry.fail_count, 1);
        assert_eq!(entry.next_retry_delay, Duration::from_millis(1000));
    }

    // Still backing off.
    assert!(fx.registry.scan().await.unwrap().is_empty());
    assert_eq!(net.attempts(8765), 1);

    sleep(Duration::from_millis(1000)).await;
    assert_eq!(fx.registry.scan().await.unwrap(), vec![8765, 8766]);
    sleep(SETTLE).await;

    let report = fx.registry.port_status().await;
    let entry = report.backoff.iter().find(|b| b.port == 8765).unwrap();
    assert_eq!(entry.fail_count, 2);
    assert_eq!(entry.next_retry_delay, Duration::from_millis(2000));
    assert_eq!(net.attempts(8765), 2);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_is_capped() {
    let (net, _received) = FakeNetwork::new();
    let fx = spawn_fixture(registry_settings(8765, 8765), net.clone());
    sleep(SETTLE).await;

    for _ in 0..8 {
        sleep(Duration::from_secs(31)).await;
        fx.registry.scan().await.unwrap();
        sleep(SETTLE).await;
    }

    let report = fx.registry.port_status().await;
    let entry = report.backoff.iter().find(|b| b.port == 8765).unwrap();
    assert_eq!(entry.fail_count, 9);
    assert_eq!(entry.next_retry_delay, Duration::from_millis(30_000));
}

#[tokio::test(start_paused = true)]
async fn test_port_list_redirects_scanning() {
    let (net, _received) = FakeNetwork::new();
    net.listen(8765, PeerBehavior::new("ext-1").with_port_list(vec![9000]));
    net.listen(9000, PeerBehavior::new("ext-2"));
    let mut fx = spawn_fixture(registry_settings(8765, 8765), net.clone());

    let (id, _, _) = next_opened(&mut fx.events).await;
    assert_eq!(id, ConnectionId::new("ext-1"));

    // This scan asks the open peer for its port list.
    fx.registry.scan().await.unwrap();
    sleep(SETTLE).await;

    let report = fx.registry.port_status().await;
    assert_eq!(report.candidates, vec![9000, 9001]);

    let started = fx.registry.scan().await.unwrap();
    assert!(started.contains(&9000));

    let (id, _, port) = next_opened(&mut fx.events).await;
    assert_eq!(id, ConnectionId::new("ext-2"));
    assert_eq!(port, 9000);
}

#[tokio::test(start_paused = true)]
async fn test_port_list_expires() {
    let (net, _received) = FakeNetwork::new();
    net.listen(8765, PeerBehavior::new("ext-1").with_port_list(vec![9000]));
    let mut fx = spawn_fixture(registry_settings(8765, 8765), net.clone());

    next_opened(&mut fx.events).await;
    fx.registry.scan().await.unwrap();
    sleep(SETTLE).await;
    assert_eq!(fx.registry.port_status().await.candidates, vec![9000, 9001]);

    sleep(Duration::from_secs(31)).await;
    assert_eq!(fx.registry.port_status().await.candidates, vec![8765, 8766]);
}

// ============================================================================
// Duplicate Instance Tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_duplicate_instance_keeps_first_connection() {
    let (net, _received) = FakeNetwork::new();
    net.listen(8765, PeerBehavior::new("ext-1"));
    net.listen(8766, PeerBehavior::new("ext-1"));
    let mut fx = spawn_fixture(registry_settings(8765, 8765), net.clone());

    let (_, _, port) = next_opened(&mut fx.events).await;
    sleep(SETTLE).await;

    let snapshot = fx.registry.snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].endpoint.port, port);

    let other = if port == 8765 { 8766 } else { 8765 };
    let report = fx.registry.port_status().await;
    let entry = report.backoff.iter().find(|b| b.port == other).unwrap();
    assert_eq!(entry.fail_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_instance_on_new_port_replaces_silent_connection() {
    let (net, _received) = FakeNetwork::new();
    net.listen(8765, PeerBehavior::new("ext-1").silent());
    let mut settings = registry_settings(8765, 8765);
    settings.heartbeat_interval = Duration::from_secs(5);
    let mut fx = spawn_fixture(settings, net.clone());

    let (id, first_epoch, _) = next_opened(&mut fx.events).await;

    // The instance restarts on the next port.
    net.unlisten(8765);
    net.listen(8766, PeerBehavior::new("ext-1"));
    sleep(Duration::from_secs(6)).await;

    let started = fx.registry.scan().await.unwrap();
    assert!(started.contains(&8766));

    let (closed, reason, _) = next_closed(&mut fx.events).await;
    assert_eq!(closed, id);
    assert_eq!(reason, CloseReason::Replaced);

    sleep(Duration::from_secs(3)).await;
    fx.registry.scan().await.unwrap();

    let (reopened, epoch, port) = next_opened(&mut fx.events).await;
    assert_eq!(reopened, id);
    assert_eq!(port, 8766);
    assert!(epoch > first_epoch);
}

// ============================================================================
// Heartbeat Tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_silent_peer_is_closed_after_heartbeat_timeout() {
    let (net, _received) = FakeNetwork::new();
    net.listen(8765, PeerBehavior::new("ext-1").silent());
    let mut settings = registry_settings(8765, 8765);
    settings.heartbeat_interval = Duration::from_secs(5);
    settings.heartbeat_timeout = Duration::from_secs(15);
    let mut fx = spawn_fixture(settings, net.clone());

    let (id, _, _) = next_opened(&mut fx.events).await;
    let (closed, reason, _) = next_closed(&mut fx.events).await;

    assert_eq!(closed, id);
    assert_eq!(reason, CloseReason::HeartbeatTimeout);
    assert!(fx.registry.snapshot().await.is_empty());
    assert_eq!(fx.directory.state(&id), None);
}

#[tokio::test(start_paused = true)]
async fn test_responsive_peer_stays_open() {
    let (net, _received) = FakeNetwork::new();
    net.listen(8765, PeerBehavior::new("ext-1"));
    let mut settings = registry_settings(8765, 8765);
    settings.heartbeat_interval = Duration::from_secs(5);
    settings.heartbeat_timeout = Duration::from_secs(15);
    let mut fx = spawn_fixture(settings, net.clone());

    next_opened(&mut fx.events).await;
    sleep(Duration::from_secs(60)).await;

    let snapshot = fx.registry.snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert!(snapshot[0].idle_for < Duration::from_secs(15));
}

// ============================================================================
// Close Tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_peer_close_releases_locks_to_waiters() {
    let (net, _received) = FakeNetwork::new();
    net.listen(8765, PeerBehavior::new("ext-1"));
    let mut fx = spawn_fixture(registry_settings(8765, 8765), net.clone());

    let (id, _, _) = next_opened(&mut fx.events).await;
    let tab = ResourceId::new("42");
    fx.locks
        .acquire(tab.clone(), id.clone(), Duration::from_secs(30))
        .await
        .unwrap();

    let snapshot = fx.registry.snapshot().await;
    assert_eq!(snapshot[0].owned_resources, vec![tab.clone()]);

    let waiter = {
        let locks = fx.locks.clone();
        let tab = tab.clone();
        tokio::spawn(async move {
            locks
                .acquire(tab, ConnectionId::new("ext-2"), Duration::from_secs(30))
                .await
        })
    };
    while fx.locks.queue_len(tab.clone()).await != 1 {
        tokio::task::yield_now().await;
    }

    net.close(8765);

    let (closed, reason, released) = next_closed(&mut fx.events).await;
    assert_eq!(closed, id);
    assert_eq!(reason, CloseReason::PeerClosed);
    assert_eq!(released, vec![tab.clone()]);

    let grant = timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter should be promoted")
        .unwrap();
    assert_eq!(grant, Ok(Grant::Promoted));
    assert!(fx.locks.owned_by(id).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_close_is_idempotent() {
    let (net, _received) = FakeNetwork::new();
    net.listen(8765, PeerBehavior::new("ext-1"));
    let mut fx = spawn_fixture(registry_settings(8765, 8765), net.clone());

    let (id, _, _) = next_opened(&mut fx.events).await;

    assert!(fx.registry.close(&id, CloseReason::Shutdown).await);
    assert!(!fx.registry.close(&id, CloseReason::Shutdown).await);

    let (_, reason, _) = next_closed(&mut fx.events).await;
    assert_eq!(reason, CloseReason::Shutdown);
    assert!(!fx.registry.close(&id, CloseReason::Shutdown).await);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_waits_for_cleanup() {
    let (net, _received) = FakeNetwork::new();
    net.listen(8765, PeerBehavior::new("ext-1"));
    net.listen(8766, PeerBehavior::new("ext-2"));
    let mut fx = spawn_fixture(registry_settings(8765, 8765), net.clone());

    next_opened(&mut fx.events).await;
    next_opened(&mut fx.events).await;

    fx.cancel.cancel();
    timeout(Duration::from_secs(5), fx.registry.shutdown())
        .await
        .expect("shutdown should finish");

    assert!(fx.registry.snapshot().await.is_empty());
}

// ============================================================================
// Messaging Tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_send_to_checks_epoch() {
    let (net, mut received) = FakeNetwork::new();
    net.listen(8765, PeerBehavior::new("ext-1"));
    let mut fx = spawn_fixture(registry_settings(8765, 8765), net.clone());

    let (id, epoch, _) = next_opened(&mut fx.events).await;

    let stale = fx
        .registry
        .send_to(&id, epoch + 1, &json!({"id": 1, "type": "click"}))
        .await;
    assert_eq!(stale, Err(ConnectionError::NotConnected(id.clone())));

    fx.registry
        .send_to(&id, epoch, &json!({"id": 2, "type": "click"}))
        .await
        .expect("current epoch should be delivered");

    let (port, frame) = timeout(Duration::from_secs(1), received.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(port, 8765);
    assert_eq!(frame["id"], 2);
}

#[tokio::test(start_paused = true)]
async fn test_send_to_unknown_connection_fails() {
    let (net, _received) = FakeNetwork::new();
    let fx = spawn_fixture(registry_settings(8765, 8765), net);

    let result = fx
        .registry
        .send(&ConnectionId::new("nobody"), &json!({"type": "ping"}))
        .await;
    assert!(matches!(result, Err(ConnectionError::NotConnected(_))));
}

#[tokio::test(start_paused = true)]
async fn test_oversized_message_is_rejected() {
    let (net, _received) = FakeNetwork::new();
    net.listen(8765, PeerBehavior::new("ext-1"));
    let mut fx = spawn_fixture(registry_settings(8765, 8765), net.clone());
    let (id, _, _) = next_opened(&mut fx.events).await;

    let huge = "x".repeat(2 * 1024 * 1024);
    let result = fx.registry.send(&id, &json!({"data": huge})).await;

    assert!(matches!(result, Err(ConnectionError::MessageTooLarge { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_requests_are_forwarded_with_epoch() {
    let (net, _received) = FakeNetwork::new();
    net.listen(8765, PeerBehavior::new("ext-1"));
    let mut fx = spawn_fixture(registry_settings(8765, 8765), net.clone());
    let (id, epoch, _) = next_opened(&mut fx.events).await;

    // Control frames and malformed lines never reach the router.
    net.send_from(8765, json!({"type": "pong"}));
    net.send_from(8765, json!({"type": "click"}));
    net.send_from(8765, json!({"id": 7, "type": "click", "payload": {"tabId": 3}}));

    let request = timeout(Duration::from_secs(1), fx.inbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request.connection, id);
    assert_eq!(request.epoch, epoch);
    assert_eq!(request.envelope.id, json!(7));
    assert_eq!(request.envelope.kind, "click");
    assert_eq!(request.envelope.resource_hint(), Some(ResourceId::new("3")));
}

#[tokio::test(start_paused = true)]
async fn test_invalid_utf8_line_is_skipped() {
    let (net, _received) = FakeNetwork::new();
    net.listen(8765, PeerBehavior::new("ext-1"));
    let mut fx = spawn_fixture(registry_settings(8765, 8765), net.clone());
    let (id, _, _) = next_opened(&mut fx.events).await;

    net.send_raw_from(8765, b"\xff\xfe garbage\n");
    net.send_from(8765, json!({"id": 8, "type": "click", "payload": {"tabId": 4}}));

    let request = timeout(Duration::from_secs(1), fx.inbound.recv())
        .await
        .expect("request after a bad line should be forwarded")
        .unwrap();
    assert_eq!(request.connection, id);
    assert_eq!(request.envelope.id, json!(8));
    assert_eq!(fx.registry.snapshot().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_broadcast_reaches_open_connections() {
    let (net, mut received) = FakeNetwork::new();
    net.listen(8765, PeerBehavior::new("ext-1"));
    net.listen(8766, PeerBehavior::new("ext-2"));
    let mut fx = spawn_fixture(registry_settings(8765, 8765), net.clone());
    next_opened(&mut fx.events).await;
    next_opened(&mut fx.events).await;

    let sent = fx
        .registry
        .broadcast(&json!({"type": "notice", "id": 0}))
        .await
        .unwrap();
    assert_eq!(sent, 2);

    let mut ports = Vec::new();
    for _ in 0..2 {
        let (port, _) = received.recv().await.unwrap();
        ports.push(port);
    }
    ports.sort_unstable();
    assert_eq!(ports, vec![8765, 8766]);
}
