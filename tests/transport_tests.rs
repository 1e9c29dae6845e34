//! Transport Tests - reconnect, backoff budget, timeouts and pushes.

mod common;

use common::*;
use electrum_session::transport::{Notification, Transport};
use electrum_session::{Endpoint, ErrorKind, NetworkParameters, TransportEvent};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

fn endpoint() -> Endpoint {
    NetworkParameters::new("regtest").resolve().expect("regtest").endpoint
}

async fn open(server: &MockServer) -> (Transport, UnboundedReceiver<TransportEvent>) {
    init_tracing();
    Transport::open(server.connector(), endpoint(), &test_config()).await.expect("open")
}

async fn next_event(rx: &mut UnboundedReceiver<TransportEvent>) -> TransportEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("event in time")
        .expect("channel open")
}

#[tokio::test]
async fn open_is_a_single_attempt() {
    init_tracing();
    let server = MockServer::new();
    server.set_online(false);
    let err = Transport::open(server.connector(), endpoint(), &test_config()).await.err().expect("offline");
    assert_eq!(err.kind(), ErrorKind::Connection);
    assert_eq!(server.state().connect_attempts, 1);
}

#[tokio::test]
async fn transient_failure_reconnects_and_resubscribes() {
    let server = MockServer::new();
    let (mut transport, mut rx) = open(&server).await;
    assert_eq!(transport.generation(), 1);

    transport.watch(&[foreign_script()]).await.unwrap();
    assert_eq!(server.calls_of("subscribe_scripts"), 1);

    server.state().fail_next = 1;
    let tip = transport.call("tip", None, |b| async move { b.tip().await }).await.unwrap();
    assert_eq!(tip, 1_000);
    assert_eq!(transport.generation(), 2);
    assert_eq!(server.connects(), 2);
    assert_eq!(server.calls_of("subscribe_scripts"), 2);
    assert_eq!(next_event(&mut rx).await, TransportEvent::Reconnected { generation: 2 });
}

#[tokio::test]
async fn exhausted_retries_surface_connection_lost() {
    let server = MockServer::new();
    let (mut transport, _rx) = open(&server).await;

    server.set_online(false);
    let err = transport.call("tip", None, |b| async move { b.tip().await }).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionLost);
    assert!(!transport.is_connected());
    // One open plus the full reconnect budget.
    assert_eq!(server.state().connect_attempts, 1 + test_config().retry.max_attempts);

    server.set_online(true);
    transport.ensure_connected().await.unwrap();
    assert!(transport.is_connected());
}

#[tokio::test]
async fn rejected_call_is_query_error_without_reconnect() {
    let server = MockServer::new();
    let (mut transport, _rx) = open(&server).await;

    server.reject("tip");
    let err = transport.call("tip", None, |b| async move { b.tip().await }).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Query);
    assert!(transport.is_connected());
    assert_eq!(server.connects(), 1);
}

#[tokio::test]
async fn late_response_is_a_timeout() {
    let server = MockServer::new();
    let (mut transport, _rx) = open(&server).await;

    server.delay("relay_fee", Duration::from_millis(300));
    let err = transport
        .call("relay_fee", Some(Duration::from_millis(20)), |b| async move { b.relay_fee().await })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(transport.is_connected());
}

#[tokio::test]
async fn poller_forwards_pushes() {
    let server = MockServer::new();
    let (mut transport, mut rx) = open(&server).await;
    transport.start_notifications();

    server.push(Notification::NewBlock { height: 1_001 });
    server.push(Notification::ScriptActivity { script: foreign_script() });
    assert_eq!(next_event(&mut rx).await, TransportEvent::NewBlock { height: 1_001 });
    assert_eq!(next_event(&mut rx).await, TransportEvent::ScriptActivity { script: foreign_script() });
}

#[tokio::test]
async fn poller_reports_drop_once() {
    let server = MockServer::new();
    let (mut transport, mut rx) = open(&server).await;
    transport.start_notifications();

    server.set_online(false);
    match next_event(&mut rx).await {
        TransportEvent::Disconnected { generation, .. } => {
            assert_eq!(generation, 1);
            assert!(transport.handle_disconnect(generation));
            assert!(!transport.handle_disconnect(generation));
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(!transport.is_connected());
}

#[tokio::test]
async fn close_drops_the_connection() {
    let server = MockServer::new();
    let (mut transport, _rx) = open(&server).await;
    transport.close();
    assert!(!transport.is_connected());
}
