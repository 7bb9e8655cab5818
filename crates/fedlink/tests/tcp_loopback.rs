// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 fedlink contributors

#![allow(clippy::uninlined_format_args)] // Test code readability over pedantic
#![allow(clippy::missing_panics_doc)] // Tests panic on failure
#![allow(clippy::items_after_statements)] // Test helpers

//! End-to-end tests for the stream transport on loopback.
//!
//! # Test Coverage
//!
//! - Loopback delivery through the `-1` route
//! - Route installation (`NEW_ROUTE`) and per-route FIFO ordering
//! - Graceful shutdown: statuses, idempotent disconnect, silent callback
//! - Duplicate route ids keep the first handle

use std::sync::mpsc::{channel, Receiver};
use std::sync::Mutex;
use std::time::Duration;

use fedlink::comms::{CommsInterface, ConnectionStatus, RouteId};
use fedlink::message::ActionMessage;
use fedlink::tcp::TcpComms;

/// Serialize tests in this file; they bind fixed loopback ports.
static TEST_LOCK: Mutex<()> = Mutex::new(());

fn payload_channel(endpoint: &std::sync::Arc<TcpComms>) -> Receiver<Vec<u8>> {
    let (tx, rx) = channel();
    endpoint.set_callback(move |msg: ActionMessage| {
        let _ = tx.send(msg.payload);
    });
    rx
}

#[test]
fn loopback_route_delivers_to_local_callback() {
    let _guard = TEST_LOCK.lock().unwrap();

    let a = TcpComms::new("loop-a");
    a.set_local_target("localhost");
    a.set_port_number(24200);
    let payloads = payload_channel(&a);

    assert!(a.connect(), "connect must bring both loops up");
    assert_eq!(a.port_number(), 24200);

    a.transmit(RouteId::LOOPBACK, ActionMessage::data(&b"ping"[..]));
    let got = payloads
        .recv_timeout(Duration::from_millis(500))
        .expect("loopback payload within 500 ms");
    assert_eq!(got, b"ping");

    a.disconnect();
}

#[test]
fn new_route_carries_traffic_in_order() {
    let _guard = TEST_LOCK.lock().unwrap();

    let a = TcpComms::new("route-a");
    a.set_local_target("localhost");
    a.set_port_number(24203);
    let _a_payloads = payload_channel(&a);

    let b = TcpComms::new("route-b");
    b.set_local_target("localhost");
    b.set_port_number(24204);
    let b_payloads = payload_channel(&b);

    assert!(a.connect());
    assert!(b.connect());

    a.add_route(RouteId(7), "localhost:24204");
    a.transmit(RouteId(7), ActionMessage::data(&b"hi"[..]));
    a.transmit(RouteId(7), ActionMessage::data(&b"second"[..]));

    let first = b_payloads
        .recv_timeout(Duration::from_secs(2))
        .expect("routed payload arrives");
    assert_eq!(first, b"hi");
    let second = b_payloads
        .recv_timeout(Duration::from_secs(2))
        .expect("second routed payload arrives");
    assert_eq!(second, b"second", "per-route delivery is FIFO");

    a.disconnect();
    b.disconnect();
}

#[test]
fn duplicate_route_id_keeps_first_handle() {
    let _guard = TEST_LOCK.lock().unwrap();

    let a = TcpComms::new("dup-a");
    a.set_local_target("localhost");
    a.set_port_number(24206);
    let _a_payloads = payload_channel(&a);

    let b = TcpComms::new("dup-b");
    b.set_local_target("localhost");
    b.set_port_number(24207);
    let b_payloads = payload_channel(&b);

    let c = TcpComms::new("dup-c");
    c.set_local_target("localhost");
    c.set_port_number(24208);
    let c_payloads = payload_channel(&c);

    assert!(a.connect());
    assert!(b.connect());
    assert!(c.connect());

    a.add_route(RouteId(5), "localhost:24207");
    // Second install for the same id must be ignored.
    a.add_route(RouteId(5), "localhost:24208");
    a.transmit(RouteId(5), ActionMessage::data(&b"to-b"[..]));

    let got = b_payloads
        .recv_timeout(Duration::from_secs(2))
        .expect("first handle still routes");
    assert_eq!(got, b"to-b");
    assert!(
        c_payloads.recv_timeout(Duration::from_millis(300)).is_err(),
        "second install must not take over the route"
    );

    a.disconnect();
    b.disconnect();
    c.disconnect();
}

#[test]
fn graceful_shutdown_terminates_both_loops() {
    let _guard = TEST_LOCK.lock().unwrap();

    let a = TcpComms::new("shutdown-a");
    a.set_local_target("localhost");
    a.set_port_number(24210);
    let a_payloads = payload_channel(&a);

    let mut peers = Vec::new();
    for (i, port) in [24211, 24212, 24213].iter().enumerate() {
        let peer = TcpComms::new(format!("shutdown-peer-{}", i));
        peer.set_local_target("localhost");
        peer.set_port_number(*port);
        let _ = payload_channel(&peer);
        assert!(peer.connect());
        peers.push(peer);
    }

    assert!(a.connect());
    a.add_route(RouteId(1), "localhost:24211");
    a.add_route(RouteId(2), "localhost:24212");
    a.add_route(RouteId(3), "localhost:24213");
    a.transmit(RouteId(2), ActionMessage::data(&b"warmup"[..]));

    let start = std::time::Instant::now();
    a.disconnect();
    assert!(
        start.elapsed() < Duration::from_secs(1),
        "disconnect took {:?}",
        start.elapsed()
    );
    assert_eq!(a.core().rx_status().get(), ConnectionStatus::Terminated);
    assert_eq!(a.core().tx_status().get(), ConnectionStatus::Terminated);

    // Idempotent: a second call returns immediately.
    let again = std::time::Instant::now();
    a.disconnect();
    assert!(again.elapsed() < Duration::from_millis(100));

    // No callback fires after disconnect returns.
    assert!(
        a_payloads.recv_timeout(Duration::from_millis(300)).is_err(),
        "no callback after termination"
    );

    for peer in &peers {
        peer.disconnect();
    }
}
