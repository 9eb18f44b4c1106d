use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::*;
use crate::login::LoginGate;
use crate::net::SocketEvent;
use crate::net::TransportError;
use crate::net::http::test_helpers::{FakeHttp, Scripted, ok_json, status_json};
use crate::net::socket::test_helpers::{FakeConnector, FakeSocket};
use crate::session::test_helpers::credential;
use crate::session::{HEADER_SESSION_ID, MemorySessionStore, SessionStore, StaticCodeProvider};

const LOGIN_URL: &str = "https://svc.example/login";
const SERVICE_URL: &str = "https://svc.example/tunnel";
const WS_URL: &str = "wss://svc.example/ws";

/// Generous guard for virtual-time waits: the paused clock skips ahead to
/// the earliest pending deadline, so a missing event still fails fast.
const GUARD: Duration = Duration::from_secs(60);

struct Harness {
    tunnel: Tunnel,
    http: Arc<FakeHttp>,
    connector: Arc<FakeConnector>,
    handles: mpsc::UnboundedReceiver<FakeSocket>,
}

fn harness(
    http_script: Vec<Scripted>,
    socket_script: Vec<Result<(), TransportError>>,
) -> Harness {
    harness_with(http_script, socket_script, Duration::from_millis(100), 2)
}

fn harness_with(
    http_script: Vec<Scripted>,
    socket_script: Vec<Result<(), TransportError>>,
    reconnect_base: Duration,
    max_reconnect_attempts: u32,
) -> Harness {
    let http = Arc::new(FakeHttp::new(http_script));
    let store = Arc::new(MemorySessionStore::new());
    store.set(credential("sid", "skey"));
    let gate = LoginGate::new(
        http.clone(),
        Arc::new(StaticCodeProvider::new("code-123")),
        store.clone(),
        Some(LOGIN_URL.to_owned()),
        Duration::from_secs(30),
    );
    let pipeline = RequestPipeline::new(http.clone(), gate, store, 3);
    let (connector, handles) = FakeConnector::new(socket_script);
    let tunnel = Tunnel::new(
        SERVICE_URL.to_owned(),
        pipeline,
        connector.clone(),
        reconnect_base,
        max_reconnect_attempts,
    );
    Harness { tunnel, http, connector, handles }
}

fn discovery_reply() -> Scripted {
    Scripted::Reply(ok_json(json!({ "url": WS_URL })))
}

fn record_events(tunnel: &Tunnel) -> mpsc::UnboundedReceiver<(String, Value)> {
    let (tx, rx) = mpsc::unbounded_channel();
    tunnel.on("*", move |event| {
        let _ = tx.send((event.name().to_owned(), event.payload()));
    });
    rx
}

async fn next_socket(handles: &mut mpsc::UnboundedReceiver<FakeSocket>) -> FakeSocket {
    timeout(GUARD, handles.recv()).await.expect("a socket should connect").expect("connector alive")
}

async fn next_frame(socket: &mut FakeSocket) -> String {
    timeout(GUARD, socket.sent.recv()).await.expect("a frame should arrive").expect("socket alive")
}

async fn sender_dropped(socket: &mut FakeSocket) {
    let frame = timeout(GUARD, socket.sent.recv()).await.expect("the sender should drop");
    assert_eq!(frame, None);
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<(String, Value)>) -> (String, Value) {
    timeout(GUARD, events.recv()).await.expect("an event should arrive").expect("tunnel alive")
}

async fn wait_for_state(tunnel: &Tunnel, want: TunnelState) {
    let mut states = tunnel.watch_state();
    timeout(GUARD, states.wait_for(|state| *state == want))
        .await
        .expect("state change in time")
        .expect("tunnel alive");
}

fn feed_text(socket: &FakeSocket, frame: &str) {
    socket.feed.send(SocketEvent::Message(frame.to_owned())).unwrap();
}

// =============================================================================
// OPENING
// =============================================================================

#[tokio::test(start_paused = true)]
async fn open_discovers_authenticates_and_activates() {
    let mut h = harness(vec![discovery_reply()], Vec::new());
    let mut events = record_events(&h.tunnel);

    assert!(h.tunnel.is_closed());
    h.tunnel.open();

    let _socket = next_socket(&mut h.handles).await;
    wait_for_state(&h.tunnel, TunnelState::Active).await;
    assert_eq!(next_event(&mut events).await, ("connect".to_owned(), Value::Null));

    // Discovery was one authenticated GET against the service url.
    let seen = h.http.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].url, SERVICE_URL);
    assert!(seen[0].headers.contains(&(HEADER_SESSION_ID.to_owned(), "sid".to_owned())));
    assert_eq!(h.connector.urls(), vec![WS_URL.to_owned()]);
}

#[tokio::test(start_paused = true)]
async fn open_is_ignored_unless_closed() {
    let mut h = harness(vec![discovery_reply()], Vec::new());

    h.tunnel.open();
    let _socket = next_socket(&mut h.handles).await;
    wait_for_state(&h.tunnel, TunnelState::Active).await;

    h.tunnel.open();
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
    assert!(h.tunnel.is_active());
    assert_eq!(h.connector.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn open_after_a_close_starts_a_fresh_cycle() {
    let mut h = harness(vec![discovery_reply(), discovery_reply()], Vec::new());
    let mut events = record_events(&h.tunnel);

    h.tunnel.open();
    let mut socket = next_socket(&mut h.handles).await;
    assert_eq!(next_event(&mut events).await.0, "connect");

    h.tunnel.close();
    assert_eq!(next_frame(&mut socket).await, "close");
    sender_dropped(&mut socket).await;
    socket.feed.send(SocketEvent::Closed).unwrap();
    assert_eq!(next_event(&mut events).await.0, "close");
    assert!(h.tunnel.is_closed());

    h.tunnel.open();
    let _socket = next_socket(&mut h.handles).await;
    assert_eq!(next_event(&mut events).await.0, "connect");
    assert!(h.tunnel.is_active());
    assert_eq!(h.connector.calls(), 2);
}

// =============================================================================
// CONNECT FAILURES
// =============================================================================

#[tokio::test(start_paused = true)]
async fn discovery_request_failure_settles_closed() {
    let script = vec![Scripted::Reply(Err(TransportError::new(
        "http request failed",
        "connection refused",
    )))];
    let mut h = harness(script, Vec::new());
    let mut events = record_events(&h.tunnel);

    h.tunnel.open();

    let (name, payload) = next_event(&mut events).await;
    assert_eq!(name, "error");
    assert_eq!(payload["code"], json!(1001));
    assert!(h.tunnel.is_closed());
    assert_eq!(h.connector.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn discovery_non_200_settles_closed() {
    let mut h = harness(vec![Scripted::Reply(status_json(500, json!({})))], Vec::new());
    let mut events = record_events(&h.tunnel);

    h.tunnel.open();

    let (name, payload) = next_event(&mut events).await;
    assert_eq!(name, "error");
    assert_eq!(payload["code"], json!(1001));
    assert!(payload["message"].as_str().unwrap().contains("500"));
    assert!(h.tunnel.is_closed());
}

#[tokio::test(start_paused = true)]
async fn discovery_without_a_url_settles_closed() {
    let mut h = harness(vec![Scripted::Reply(ok_json(json!({ "ok": true })))], Vec::new());
    let mut events = record_events(&h.tunnel);

    h.tunnel.open();

    let (name, payload) = next_event(&mut events).await;
    assert_eq!(name, "error");
    assert_eq!(payload["code"], json!(1001));
    assert!(payload["message"].as_str().unwrap().contains("no url"));
}

#[tokio::test(start_paused = true)]
async fn initial_socket_failure_settles_closed() {
    let socket_script =
        vec![Err(TransportError::new("socket connect failed", "connection refused"))];
    let mut h = harness(vec![discovery_reply()], socket_script);
    let mut events = record_events(&h.tunnel);

    h.tunnel.open();

    let (name, payload) = next_event(&mut events).await;
    assert_eq!(name, "error");
    assert_eq!(payload["code"], json!(3001));
    assert!(h.tunnel.is_closed());
}

// =============================================================================
// OUTBOUND MESSAGES
// =============================================================================

#[tokio::test(start_paused = true)]
async fn pre_open_emits_flush_in_order_on_activation() {
    let mut h = harness(vec![discovery_reply()], Vec::new());

    h.tunnel.emit("hi", Some(json!("hello")));
    h.tunnel.emit("second", None);
    h.tunnel.open();

    let mut socket = next_socket(&mut h.handles).await;
    assert_eq!(next_frame(&mut socket).await, r#"message:{"type":"hi","content":"hello"}"#);
    assert_eq!(next_frame(&mut socket).await, r#"message:{"type":"second"}"#);
}

#[tokio::test(start_paused = true)]
async fn emit_while_active_sends_immediately() {
    let mut h = harness(vec![discovery_reply()], Vec::new());

    h.tunnel.open();
    let mut socket = next_socket(&mut h.handles).await;
    wait_for_state(&h.tunnel, TunnelState::Active).await;

    h.tunnel.emit("update", Some(json!({ "n": 1 })));
    assert_eq!(next_frame(&mut socket).await, r#"message:{"type":"update","content":{"n":1}}"#);
}

// =============================================================================
// INBOUND MESSAGES
// =============================================================================

#[tokio::test(start_paused = true)]
async fn inbound_reserved_kind_is_escaped_for_handlers_and_wildcard() {
    let mut h = harness(vec![discovery_reply()], Vec::new());
    let (escaped_tx, mut escaped_rx) = mpsc::unbounded_channel();
    h.tunnel.on("@close", move |event| {
        let _ = escaped_tx.send(event.payload());
    });
    let mut events = record_events(&h.tunnel);

    h.tunnel.open();
    let socket = next_socket(&mut h.handles).await;
    assert_eq!(next_event(&mut events).await.0, "connect");

    feed_text(&socket, r#"message:{"type":"close","content":"x"}"#);

    assert_eq!(next_event(&mut events).await, ("@close".to_owned(), json!("x")));
    let payload = timeout(GUARD, escaped_rx.recv()).await.unwrap().unwrap();
    assert_eq!(payload, json!("x"));
    // An escaped application message never drives the lifecycle.
    assert!(h.tunnel.is_active());
}

#[tokio::test(start_paused = true)]
async fn ordinary_inbound_messages_dispatch_by_kind() {
    let mut h = harness(vec![discovery_reply()], Vec::new());
    let (named_tx, mut named_rx) = mpsc::unbounded_channel();
    h.tunnel.on("update", move |event| {
        let _ = named_tx.send(event.payload());
    });

    h.tunnel.open();
    let socket = next_socket(&mut h.handles).await;
    wait_for_state(&h.tunnel, TunnelState::Active).await;

    feed_text(&socket, r#"message:{"type":"update","content":{"n":7}}"#);

    let payload = timeout(GUARD, named_rx.recv()).await.unwrap().unwrap();
    assert_eq!(payload, json!({ "n": 7 }));
}

#[tokio::test(start_paused = true)]
async fn undecodable_frames_are_ignored() {
    let mut h = harness(vec![discovery_reply()], Vec::new());
    let mut events = record_events(&h.tunnel);

    h.tunnel.open();
    let socket = next_socket(&mut h.handles).await;
    assert_eq!(next_event(&mut events).await.0, "connect");

    feed_text(&socket, "upgrade:h2");
    feed_text(&socket, "message:{not json");
    feed_text(&socket, r#"message:{"type":"ok"}"#);

    // Only the well-formed frame produced an event.
    assert_eq!(next_event(&mut events).await, ("ok".to_owned(), Value::Null));
    assert!(h.tunnel.is_active());
}

// =============================================================================
// CLOSING
// =============================================================================

#[tokio::test(start_paused = true)]
async fn close_sends_the_close_packet_and_dispatches_close() {
    let mut h = harness(vec![discovery_reply()], Vec::new());
    let (state_tx, mut state_rx) = mpsc::unbounded_channel();
    {
        let tunnel = h.tunnel.clone();
        h.tunnel.on("close", move |_event| {
            let _ = state_tx.send(tunnel.state());
        });
    }
    let mut events = record_events(&h.tunnel);

    h.tunnel.open();
    let mut socket = next_socket(&mut h.handles).await;
    assert_eq!(next_event(&mut events).await.0, "connect");

    h.tunnel.close();
    assert_eq!(next_frame(&mut socket).await, "close");
    sender_dropped(&mut socket).await;
    socket.feed.send(SocketEvent::Closed).unwrap();

    assert_eq!(next_event(&mut events).await, ("close".to_owned(), Value::Null));
    // The state settles before the event reaches handlers.
    let observed = timeout(GUARD, state_rx.recv()).await.unwrap().unwrap();
    assert_eq!(observed, TunnelState::Closed);
    assert!(h.tunnel.is_closed());
}

#[tokio::test(start_paused = true)]
async fn inbound_close_packet_closes_locally() {
    let mut h = harness(vec![discovery_reply()], Vec::new());
    let mut events = record_events(&h.tunnel);

    h.tunnel.open();
    let mut socket = next_socket(&mut h.handles).await;
    assert_eq!(next_event(&mut events).await.0, "connect");

    feed_text(&socket, "close");
    // The tunnel answers with its own close packet and drops the sender.
    assert_eq!(next_frame(&mut socket).await, "close");
    sender_dropped(&mut socket).await;
    socket.feed.send(SocketEvent::Closed).unwrap();

    assert_eq!(next_event(&mut events).await.0, "close");
    assert!(h.tunnel.is_closed());
}

#[tokio::test(start_paused = true)]
async fn close_is_ignored_when_not_active() {
    let h = harness(Vec::new(), Vec::new());
    h.tunnel.close();
    assert!(h.tunnel.is_closed());
    assert_eq!(h.http.calls(), 0);
}

// =============================================================================
// RECONNECTION
// =============================================================================

#[tokio::test(start_paused = true)]
async fn unexpected_close_reconnects_and_restores_active() {
    let mut h = harness(vec![discovery_reply(), discovery_reply()], Vec::new());
    let mut events = record_events(&h.tunnel);

    h.tunnel.open();
    let socket = next_socket(&mut h.handles).await;
    assert_eq!(next_event(&mut events).await.0, "connect");

    socket.feed.send(SocketEvent::Closed).unwrap();

    assert_eq!(
        next_event(&mut events).await,
        ("reconnecting".to_owned(), json!({ "attempt": 1 }))
    );
    let _socket = next_socket(&mut h.handles).await;
    assert_eq!(next_event(&mut events).await, ("reconnect".to_owned(), Value::Null));
    assert!(h.tunnel.is_active());
    assert_eq!(h.connector.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn emits_during_a_reconnect_are_queued_until_restored() {
    let mut h = harness(vec![discovery_reply(), discovery_reply()], Vec::new());
    let mut events = record_events(&h.tunnel);

    h.tunnel.open();
    let socket = next_socket(&mut h.handles).await;
    assert_eq!(next_event(&mut events).await.0, "connect");

    socket.feed.send(SocketEvent::Closed).unwrap();
    assert_eq!(next_event(&mut events).await.0, "reconnecting");
    assert!(h.tunnel.is_reconnecting());

    h.tunnel.emit("held", None);

    let mut socket = next_socket(&mut h.handles).await;
    assert_eq!(next_event(&mut events).await.0, "reconnect");
    assert_eq!(next_frame(&mut socket).await, r#"message:{"type":"held"}"#);
}

#[tokio::test(start_paused = true)]
async fn reconnect_gives_up_at_the_cap() {
    let script = vec![
        discovery_reply(),
        Scripted::Reply(Err(TransportError::new("http request failed", "down"))),
        Scripted::Reply(Err(TransportError::new("http request failed", "still down"))),
    ];
    let mut h = harness(script, Vec::new());
    let mut events = record_events(&h.tunnel);

    h.tunnel.open();
    let socket = next_socket(&mut h.handles).await;
    assert_eq!(next_event(&mut events).await.0, "connect");

    socket.feed.send(SocketEvent::Closed).unwrap();

    assert_eq!(
        next_event(&mut events).await,
        ("reconnecting".to_owned(), json!({ "attempt": 1 }))
    );
    assert_eq!(
        next_event(&mut events).await,
        ("reconnecting".to_owned(), json!({ "attempt": 2 }))
    );

    let (name, payload) = next_event(&mut events).await;
    assert_eq!(name, "error");
    assert_eq!(payload["code"], json!(2001));
    assert!(payload["message"].as_str().unwrap().contains("after 2 attempts"));
    assert!(h.tunnel.is_closed());
}

#[tokio::test(start_paused = true)]
async fn socket_error_reports_and_the_following_close_reconnects() {
    let mut h = harness(vec![discovery_reply(), discovery_reply()], Vec::new());
    let mut events = record_events(&h.tunnel);

    h.tunnel.open();
    let socket = next_socket(&mut h.handles).await;
    assert_eq!(next_event(&mut events).await.0, "connect");

    socket.feed.send(SocketEvent::Error("tls handshake torn down".to_owned())).unwrap();

    let (name, payload) = next_event(&mut events).await;
    assert_eq!(name, "error");
    assert_eq!(payload["code"], json!(3001));
    assert!(payload["message"].as_str().unwrap().contains("tls handshake torn down"));
    // The error alone does not end the connection.
    assert!(h.tunnel.is_active());

    socket.feed.send(SocketEvent::Closed).unwrap();
    assert_eq!(next_event(&mut events).await.0, "reconnecting");
}

// =============================================================================
// HEARTBEAT
// =============================================================================

#[tokio::test(start_paused = true)]
async fn heartbeat_pings_at_half_interval_and_pong_keeps_it_alive() {
    let mut h = harness(vec![discovery_reply()], Vec::new());

    h.tunnel.open();
    let mut socket = next_socket(&mut h.handles).await;
    wait_for_state(&h.tunnel, TunnelState::Active).await;

    feed_text(&socket, "timeout:10");

    assert_eq!(next_frame(&mut socket).await, "ping");
    feed_text(&socket, "pong");
    assert_eq!(next_frame(&mut socket).await, "ping");
    feed_text(&socket, "pong");
    assert!(h.tunnel.is_active());
}

#[tokio::test(start_paused = true)]
async fn missed_pong_drops_the_connection_and_reconnects() {
    let mut h = harness(vec![discovery_reply(), discovery_reply()], Vec::new());
    let mut events = record_events(&h.tunnel);

    h.tunnel.open();
    let mut socket = next_socket(&mut h.handles).await;
    assert_eq!(next_event(&mut events).await.0, "connect");

    feed_text(&socket, "timeout:10");
    assert_eq!(next_frame(&mut socket).await, "ping");

    // No pong: the tunnel drops the sender and treats the close as a loss.
    sender_dropped(&mut socket).await;
    socket.feed.send(SocketEvent::Closed).unwrap();

    assert_eq!(next_event(&mut events).await.0, "reconnecting");
    let _socket = next_socket(&mut h.handles).await;
    assert_eq!(next_event(&mut events).await.0, "reconnect");
    assert!(h.tunnel.is_active());
}

#[tokio::test(start_paused = true)]
async fn inbound_ping_is_answered_with_pong() {
    let mut h = harness(vec![discovery_reply()], Vec::new());

    h.tunnel.open();
    let mut socket = next_socket(&mut h.handles).await;
    wait_for_state(&h.tunnel, TunnelState::Active).await;

    feed_text(&socket, "ping");
    assert_eq!(next_frame(&mut socket).await, "pong");
}

// =============================================================================
// ERROR TAXONOMY
// =============================================================================

#[test]
fn tunnel_errors_carry_stable_codes_and_retry_hints() {
    let socket = TunnelError::Socket { detail: "x".into() };
    assert_eq!(socket.error_code(), "ERR_TUNNEL_SOCKET");
    assert!(socket.retryable());

    let gave_up = TunnelError::Reconnect { attempts: 2 };
    assert_eq!(gave_up.error_code(), "ERR_TUNNEL_RECONNECT");
    assert!(!gave_up.retryable());

    let discovery = TunnelError::ConnectService { detail: "x".into() };
    assert_eq!(discovery.error_code(), "ERR_TUNNEL_CONNECT_SERVICE");
    assert!(!discovery.retryable());
}
