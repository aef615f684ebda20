//! End-to-end transport tests against a loopback WebSocket server.

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use tether_client::{ConnectionConfig, ConnectionStatus, WsConnection};

use support::{wait_until, WsServer};

fn fast_config() -> ConnectionConfig {
    ConnectionConfig {
        reconnect_delay: Duration::from_millis(30),
        max_reconnect_attempts: 3,
        heartbeat_interval: Duration::from_millis(100),
    }
}

#[tokio::test]
async fn connect_reports_connected_and_heartbeats() {
    let server = WsServer::start().await;
    let conn = WsConnection::new(server.url(), fast_config());

    conn.connect().await.unwrap();
    assert!(conn.status().is_connected());
    assert_eq!(server.accepted(), 1);

    let got_ping = wait_until(
        || server.received().iter().any(|frame| frame.contains("\"ping\"")),
        Duration::from_secs(2),
    )
    .await;
    assert!(got_ping, "no heartbeat ping within 2s: {:?}", server.received());
}

#[tokio::test]
async fn handshake_failure_sets_error_without_retrying() {
    // Nothing is listening on this port.
    let conn = WsConnection::new("ws://127.0.0.1:1", fast_config());
    assert!(conn.connect().await.is_err());
    assert_eq!(conn.status(), ConnectionStatus::Error);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(conn.status(), ConnectionStatus::Error);
    assert_eq!(conn.reconnect_attempts(), 0);
}

#[tokio::test]
async fn reconnects_after_server_drop() {
    let server = WsServer::start().await;
    let conn = WsConnection::new(server.url(), fast_config());
    conn.connect().await.unwrap();

    let dropped_at = std::time::Instant::now();
    server.drop_all_clients();
    let reconnected = wait_until(|| server.accepted() == 2, Duration::from_secs(2)).await;
    assert!(reconnected);
    // The first retry never fires before the configured base delay.
    assert!(dropped_at.elapsed() >= Duration::from_millis(30));

    conn.wait_for_status(ConnectionStatus::Connected).await;
    assert!(conn.status().is_connected());
    // A successful reconnect resets the attempt counter.
    assert_eq!(conn.reconnect_attempts(), 0);
}

#[tokio::test]
async fn unexpected_close_leaves_connected_before_redialing() {
    let server = WsServer::start().await;
    let conn = WsConnection::new(server.url(), fast_config());

    let transitions = Arc::new(Mutex::new(Vec::new()));
    let sink = transitions.clone();
    let _listener = conn.on_status_change(move |status| {
        sink.lock().unwrap().push(status);
    });
    conn.connect().await.unwrap();

    server.drop_all_clients();
    let observed = wait_until(
        || {
            transitions
                .lock()
                .unwrap()
                .contains(&ConnectionStatus::Error)
        },
        Duration::from_secs(2),
    )
    .await;
    assert!(
        observed,
        "status never left Connected after the close: {:?}",
        transitions.lock().unwrap()
    );

    conn.wait_for_status(ConnectionStatus::Connected).await;
    assert!(wait_until(|| server.accepted() == 2, Duration::from_secs(2)).await);
}

#[tokio::test]
async fn gives_up_after_the_reconnect_cap() {
    let server = WsServer::start_with_capacity(1).await;
    let conn = WsConnection::new(server.url(), fast_config());
    conn.connect().await.unwrap();

    server.drop_all_clients();
    let gave_up = wait_until(
        || conn.status() == ConnectionStatus::Disconnected,
        Duration::from_secs(3),
    )
    .await;
    assert!(gave_up, "expected terminal disconnect, got {:?}", conn.status());
    assert_eq!(server.accepted(), 1);
}

#[tokio::test]
async fn explicit_disconnect_is_terminal() {
    let server = WsServer::start().await;
    let conn = WsConnection::new(server.url(), fast_config());
    conn.connect().await.unwrap();

    conn.disconnect();
    assert_eq!(conn.status(), ConnectionStatus::Disconnected);

    // Well past the reconnect delay; no new socket may appear.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server.accepted(), 1);
    assert_eq!(conn.status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn connect_after_disconnect_opens_a_fresh_socket() {
    let server = WsServer::start().await;
    let conn = WsConnection::new(server.url(), fast_config());
    conn.connect().await.unwrap();
    conn.disconnect();

    conn.connect().await.unwrap();
    assert!(conn.status().is_connected());
    assert_eq!(server.accepted(), 2);
}

#[tokio::test]
async fn send_while_disconnected_is_a_silent_noop() {
    let conn = WsConnection::new("ws://127.0.0.1:1", fast_config());
    conn.send(&json!({"hello": "world"}));
    assert_eq!(conn.status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn subscribe_announces_interest_on_the_wire() {
    let server = WsServer::start().await;
    let conn = WsConnection::new(server.url(), fast_config());
    conn.connect().await.unwrap();

    let id = conn.subscribe("room-7", |_payload| {});
    let announced = wait_until(
        || {
            server
                .received()
                .iter()
                .any(|frame| frame.contains("\"subscribe\"") && frame.contains("room-7"))
        },
        Duration::from_secs(2),
    )
    .await;
    assert!(announced);

    conn.unsubscribe(&id);
    let withdrawn = wait_until(
        || server.received().iter().any(|frame| frame.contains("\"unsubscribe\"")),
        Duration::from_secs(2),
    )
    .await;
    assert!(withdrawn);
}

#[tokio::test]
async fn subscriptions_are_reannounced_after_reconnect() {
    let server = WsServer::start().await;
    let conn = WsConnection::new(server.url(), fast_config());
    conn.connect().await.unwrap();
    conn.subscribe("room-7", |_payload| {});

    wait_until(
        || server.received().iter().any(|frame| frame.contains("\"subscribe\"")),
        Duration::from_secs(2),
    )
    .await;

    server.drop_all_clients();
    wait_until(|| server.accepted() == 2, Duration::from_secs(2)).await;

    let reannounced = wait_until(
        || {
            server
                .received()
                .iter()
                .filter(|frame| frame.contains("\"subscribe\"") && frame.contains("room-7"))
                .count()
                == 2
        },
        Duration::from_secs(2),
    )
    .await;
    assert!(reannounced, "frames: {:?}", server.received());
}

#[tokio::test]
async fn payloads_reach_subscribers_and_malformed_frames_are_dropped() {
    let server = WsServer::start().await;
    let conn = WsConnection::new(server.url(), fast_config());
    conn.connect().await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    conn.subscribe("room-7", move |payload| {
        sink.lock().unwrap().push(payload);
    });

    server.send_to_all("this is not json");
    server.send_to_all(&json!({"table": "orders", "n": 1}).to_string());

    let delivered = wait_until(|| !seen.lock().unwrap().is_empty(), Duration::from_secs(2)).await;
    assert!(delivered);
    let frames = seen.lock().unwrap().clone();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["n"], 1);
    // The malformed frame did not kill the connection.
    assert!(conn.status().is_connected());
}

#[tokio::test]
async fn panicking_subscriber_does_not_break_the_others() {
    let server = WsServer::start().await;
    let conn = WsConnection::new(server.url(), fast_config());
    conn.connect().await.unwrap();

    conn.subscribe("room-7", |_payload| panic!("bad subscriber"));
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    conn.subscribe("room-7", move |_payload| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    server.send_to_all(&json!({"n": 1}).to_string());
    let delivered = wait_until(|| hits.load(Ordering::SeqCst) == 1, Duration::from_secs(2)).await;
    assert!(delivered);
    assert!(conn.status().is_connected());
}

#[tokio::test]
async fn server_pings_are_answered_with_pongs() {
    let server = WsServer::start().await;
    let conn = WsConnection::new(server.url(), fast_config());
    conn.connect().await.unwrap();

    server.send_to_all(&json!({"type": "ping"}).to_string());
    let ponged = wait_until(
        || server.received().iter().any(|frame| frame.contains("\"pong\"")),
        Duration::from_secs(2),
    )
    .await;
    assert!(ponged);
}

#[tokio::test]
async fn status_listeners_observe_transitions() {
    let server = WsServer::start().await;
    let conn = WsConnection::new(server.url(), fast_config());

    let transitions = Arc::new(Mutex::new(Vec::new()));
    let sink = transitions.clone();
    let listener = conn.on_status_change(move |status| {
        sink.lock().unwrap().push(status);
    });

    conn.connect().await.unwrap();
    conn.disconnect();

    let seen = transitions.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            ConnectionStatus::Connecting,
            ConnectionStatus::Connected,
            ConnectionStatus::Disconnected,
        ]
    );
    listener.unsubscribe();
}
