// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 fedlink contributors

//! Abstract endpoint contract shared by every transport.
//!
//! An endpoint owns two worker loops running on their own OS threads:
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                        Endpoint                               |
//! |                                                               |
//! |  transmit(route, msg) --> txQueue --> [tx loop] --> routes    |
//! |                                          |                    |
//! |                                          v (route -1)         |
//! |  ActionCallback <-- [rx loop] <-- rx message queue / network  |
//! +--------------------------------------------------------------+
//! ```
//!
//! The tx loop starts first and owns the route table; the rx loop surfaces
//! inbound frames through the user callback. Both carry an atomic status
//! (`Startup -> Connected -> Terminated`, with `Error` and `Reconnecting`
//! offshoots) and both must reach a terminal state before the endpoint may
//! be destroyed; the [`destructor::DelayedDestructor`] defers that final
//! step until no callback can still be running.

pub mod destructor;
pub mod registry;
pub mod tripwire;

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};

use crate::message::{self, ActionMessage};
use crate::netinfo::{InterfaceNetwork, NetworkBrokerData};
use tripwire::TripWireDetector;

// ============================================================================
// Constants
// ============================================================================

/// Initial tx-side wait for the receiver to leave `Startup`.
const RX_WAIT_INITIAL_MS: u64 = 50;

/// The tx-side receiver wait gives up once the doubling backoff passes this.
const RX_WAIT_LIMIT_MS: u64 = 1700;

/// Poll interval while waiting for loop status transitions.
const STATUS_POLL: Duration = Duration::from_millis(20);

/// Upper bound on the `disconnect()` wait for both loops to terminate.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Status
// ============================================================================

/// Lifecycle state of one worker loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionStatus {
    /// Constructed, loop not yet running or still initializing.
    Startup = 0,
    /// Loop is up and moving traffic.
    Connected = 1,
    /// Loop failed and exited.
    Error = 2,
    /// Loop exited cleanly.
    Terminated = 3,
    /// Loop is retrying its transport binding.
    Reconnecting = 4,
}

impl ConnectionStatus {
    /// True once the loop can never run again.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionStatus::Error | ConnectionStatus::Terminated)
    }
}

/// Atomic cell holding a [`ConnectionStatus`].
#[derive(Debug)]
pub struct StatusCell(AtomicU8);

impl StatusCell {
    fn new() -> Self {
        StatusCell(AtomicU8::new(ConnectionStatus::Startup as u8))
    }

    /// Current status.
    pub fn get(&self) -> ConnectionStatus {
        match self.0.load(Ordering::Acquire) {
            0 => ConnectionStatus::Startup,
            1 => ConnectionStatus::Connected,
            2 => ConnectionStatus::Error,
            4 => ConnectionStatus::Reconnecting,
            _ => ConnectionStatus::Terminated,
        }
    }

    /// Store a new status.
    pub fn set(&self, status: ConnectionStatus) {
        self.0.store(status as u8, Ordering::Release);
    }
}

// ============================================================================
// Routes
// ============================================================================

/// Identifier of an outbound channel.
///
/// Positive ids are assigned by the layer above the substrate. Two ids are
/// reserved: [`RouteId::BROKER`] sends up the hierarchy and
/// [`RouteId::LOOPBACK`] targets the endpoint's own receiver (protocol
/// commands addressed there are handled on the tx thread itself).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RouteId(pub i32);

impl RouteId {
    /// Route to the parent broker.
    pub const BROKER: RouteId = RouteId(0);
    /// Route to this endpoint's own receive loop.
    pub const LOOPBACK: RouteId = RouteId(-1);
}

// ============================================================================
// Configuration
// ============================================================================

/// Mutable endpoint configuration, guarded by the property lock.
#[derive(Clone, Debug)]
pub struct CommsConfig {
    /// Broker target string; empty for a root endpoint.
    pub broker_target: String,
    /// Local target string; empty to derive from the broker target.
    pub local_target: String,
    /// Broker port; negative selects the transport default.
    pub broker_port: i32,
    /// Preassigned local port; negative requests one from the broker.
    pub port_number: i32,
    /// First port handed out when this endpoint assigns ports.
    pub port_start: i32,
    /// The local port was not preassigned.
    pub auto_port_number: bool,
    /// Bind with address reuse.
    pub reuse_address: bool,
    /// Interface scope used when deriving the local target.
    pub network: InterfaceNetwork,
    /// Largest frame accepted on the wire.
    pub max_message_size: usize,
    /// Queue-transport receive queue depth.
    pub max_message_count: usize,
    /// Budget for broker connection and port negotiation.
    pub connection_timeout: Duration,
}

impl Default for CommsConfig {
    fn default() -> Self {
        Self {
            broker_target: String::new(),
            local_target: String::new(),
            broker_port: -1,
            port_number: -1,
            port_start: -1,
            auto_port_number: true,
            reuse_address: false,
            network: InterfaceNetwork::default(),
            max_message_size: 16 * 1024,
            max_message_count: 256,
            connection_timeout: Duration::from_millis(5000),
        }
    }
}

/// Callback invoked from the rx thread for every surfaced message.
pub type ActionCallback = Arc<dyn Fn(ActionMessage) + Send + Sync>;

// ============================================================================
// Core state
// ============================================================================

/// State shared between the public surface and the two worker loops.
pub struct CommsCore {
    name: String,
    config: Mutex<CommsConfig>,
    rx_status: StatusCell,
    tx_status: StatusCell,
    disconnecting: AtomicBool,
    has_broker: AtomicBool,
    tx_sender: Sender<(RouteId, ActionMessage)>,
    tx_receiver: Mutex<Option<Receiver<(RouteId, ActionMessage)>>>,
    callback: Mutex<Option<ActionCallback>>,
    rx_thread: Mutex<Option<JoinHandle<()>>>,
    tx_thread: Mutex<Option<JoinHandle<()>>>,
}

impl CommsCore {
    /// Create core state for a named endpoint.
    pub fn new(name: impl Into<String>) -> Self {
        let (tx_sender, tx_receiver) = channel();
        Self {
            name: name.into(),
            config: Mutex::new(CommsConfig::default()),
            rx_status: StatusCell::new(),
            tx_status: StatusCell::new(),
            disconnecting: AtomicBool::new(false),
            has_broker: AtomicBool::new(false),
            tx_sender,
            tx_receiver: Mutex::new(Some(tx_receiver)),
            callback: Mutex::new(None),
            rx_thread: Mutex::new(None),
            tx_thread: Mutex::new(None),
        }
    }

    /// Endpoint name, used for thread names and log prefixes.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Receive-loop status cell.
    pub fn rx_status(&self) -> &StatusCell {
        &self.rx_status
    }

    /// Transmit-loop status cell.
    pub fn tx_status(&self) -> &StatusCell {
        &self.tx_status
    }

    /// True once shutdown has been requested.
    pub fn is_disconnecting(&self) -> bool {
        self.disconnecting.load(Ordering::Acquire)
    }

    pub(crate) fn set_disconnecting(&self) {
        self.disconnecting.store(true, Ordering::Release);
    }

    /// True when a broker target is configured (valid once the tx loop ran).
    pub fn has_broker(&self) -> bool {
        self.has_broker.load(Ordering::Acquire)
    }

    pub(crate) fn set_has_broker(&self, value: bool) {
        self.has_broker.store(value, Ordering::Release);
    }

    /// Append a message to the transmit queue.
    ///
    /// Never blocks; the queue is unbounded. Messages queued after the tx
    /// loop has exited are silently discarded.
    pub fn transmit(&self, route: RouteId, msg: ActionMessage) {
        let _ = self.tx_sender.send((route, msg));
    }

    /// Hand the transmit queue to the tx loop. Yields `None` on a second call.
    pub(crate) fn take_tx_queue(&self) -> Option<Receiver<(RouteId, ActionMessage)>> {
        self.tx_receiver.lock().take()
    }

    /// Acquire the configuration while both loops are still in `Startup`.
    ///
    /// Past that point configuration is frozen and `None` is returned;
    /// setters fail silently, as sequencing is the caller's responsibility.
    pub fn property_lock(&self) -> Option<MutexGuard<'_, CommsConfig>> {
        let guard = self.config.lock();
        if self.rx_status.get() == ConnectionStatus::Startup
            && self.tx_status.get() == ConnectionStatus::Startup
        {
            Some(guard)
        } else {
            None
        }
    }

    /// Snapshot the configuration for a worker loop.
    pub(crate) fn config_snapshot(&self) -> CommsConfig {
        self.config.lock().clone()
    }

    pub(crate) fn install_callback(&self, cb: ActionCallback) {
        *self.callback.lock() = Some(cb);
    }

    /// Deliver a message through the user callback, outside any lock.
    pub(crate) fn deliver(&self, msg: ActionMessage) {
        let cb = self.callback.lock().clone();
        if let Some(cb) = cb {
            cb(msg);
        }
    }

    /// Deliver a synthetic `CMD_ERROR` describing a substrate failure.
    pub(crate) fn error_callback(&self, text: impl Into<String>) {
        let text = text.into();
        log::error!("[{}] {}", self.name, text);
        self.deliver(ActionMessage::error(text));
    }

    /// Tx-side wait for the receiver to leave `Startup`.
    ///
    /// Capped doubling backoff starting at 50 ms; gives up past ~1700 ms.
    /// Returns the rx status observed when the wait ended.
    pub(crate) fn wait_for_receiver(&self) -> ConnectionStatus {
        let mut backoff = RX_WAIT_INITIAL_MS;
        while self.rx_status.get() == ConnectionStatus::Startup {
            thread::sleep(Duration::from_millis(backoff));
            backoff *= 2;
            if backoff > RX_WAIT_LIMIT_MS {
                break;
            }
        }
        self.rx_status.get()
    }
}

// ============================================================================
// Endpoint trait
// ============================================================================

/// Contract every transport endpoint implements.
///
/// Concrete transports supply the two loop bodies and the receiver close
/// path; lifecycle orchestration lives in the default methods. Endpoints
/// are operated behind `Arc` so the loops can run on their own threads.
pub trait CommsInterface: Send + Sync + 'static {
    /// Shared core state.
    fn core(&self) -> &CommsCore;

    /// Receive-loop body; runs on the `<name>-rx` thread.
    fn queue_rx_function(self: Arc<Self>);

    /// Transmit-loop body; runs on the `<name>-tx` thread.
    fn queue_tx_function(self: Arc<Self>);

    /// Ask the receive loop to exit. Transport-specific because the rx loop
    /// may be parked on an OS primitive rather than an in-process queue.
    fn close_receiver(&self);

    /// Local address other endpoints can route to.
    fn address(&self) -> String;

    /// Shared handle to this endpoint, used to hand each worker thread its
    /// reference. `None` only while the endpoint is being torn down.
    fn endpoint_arc(&self) -> Option<Arc<dyn CommsInterface>>;

    /// Ask the transmit loop to drain and exit.
    fn close_transmitter(&self) {
        self.core()
            .transmit(RouteId::LOOPBACK, ActionMessage::protocol(message::DISCONNECT));
    }

    /// Install the user callback. Must happen before `connect`; changing it
    /// afterwards is undefined.
    fn set_callback(&self, cb: impl Fn(ActionMessage) + Send + Sync + 'static)
    where
        Self: Sized,
    {
        self.core().install_callback(Arc::new(cb));
    }

    /// Append a message to the transmit queue.
    fn transmit(&self, route: RouteId, msg: ActionMessage) {
        self.core().transmit(route, msg);
    }

    /// Install a new outbound route.
    ///
    /// Shaped as a `NEW_ROUTE` protocol command through the loopback route,
    /// so the route table only ever mutates on the tx thread.
    fn add_route(&self, route: RouteId, address: &str) {
        let mut cmd = ActionMessage::protocol(message::NEW_ROUTE);
        cmd.dest_id = route.0;
        cmd.payload = address.as_bytes().to_vec();
        self.core().transmit(RouteId::LOOPBACK, cmd);
    }

    /// Apply a network configuration aggregate under the property lock.
    fn load_network_info(&self, info: &NetworkBrokerData) {
        if let Some(mut cfg) = self.core().property_lock() {
            cfg.broker_target = info.broker_address.clone();
            cfg.local_target = info.local_interface.clone();
            cfg.broker_port = info.broker_port;
            cfg.port_number = info.port_number;
            if info.port_start > 0 {
                cfg.port_start = info.port_start;
            }
            cfg.auto_port_number = cfg.port_number <= 0;
            cfg.reuse_address = info.reuse_address;
            cfg.network = info.network;
        }
    }

    /// Set the broker port (startup only).
    fn set_broker_port(&self, port: i32) {
        if let Some(mut cfg) = self.core().property_lock() {
            cfg.broker_port = port;
        }
    }

    /// Preassign the local port (startup only).
    fn set_port_number(&self, port: i32) {
        if let Some(mut cfg) = self.core().property_lock() {
            cfg.port_number = port;
            if port > 0 {
                cfg.auto_port_number = false;
            }
        }
    }

    /// Set the first port handed out to children (startup only).
    fn set_port_start(&self, start: i32) {
        if let Some(mut cfg) = self.core().property_lock() {
            cfg.port_start = start;
        }
    }

    /// Set the broker target string (startup only).
    fn set_broker_target(&self, target: &str) {
        if let Some(mut cfg) = self.core().property_lock() {
            cfg.broker_target = target.to_string();
        }
    }

    /// Set the local target string (startup only).
    fn set_local_target(&self, target: &str) {
        if let Some(mut cfg) = self.core().property_lock() {
            cfg.local_target = target.to_string();
        }
    }

    /// Bind with address reuse (startup only).
    fn set_reuse_address(&self, reuse: bool) {
        if let Some(mut cfg) = self.core().property_lock() {
            cfg.reuse_address = reuse;
        }
    }

    /// Set the largest accepted frame size (startup only).
    fn set_max_message_size(&self, size: usize) {
        if let Some(mut cfg) = self.core().property_lock() {
            cfg.max_message_size = size;
        }
    }

    /// Set the queue-transport receive depth (startup only).
    fn set_max_message_count(&self, count: usize) {
        if let Some(mut cfg) = self.core().property_lock() {
            cfg.max_message_count = count;
        }
    }

    /// Set the connection/negotiation budget (startup only).
    fn set_connection_timeout(&self, timeout: Duration) {
        if let Some(mut cfg) = self.core().property_lock() {
            cfg.connection_timeout = timeout;
        }
    }

    /// Spawn both worker loops and wait for them to come up.
    ///
    /// The tx loop starts first; it owns the broker connection and, once a
    /// port is assigned, can inject into the local receiver. Returns `true`
    /// iff both loops reached `Connected`.
    fn connect(&self) -> bool {
        let core = self.core();
        if core.rx_status.get() != ConnectionStatus::Startup
            || core.tx_status.get() != ConnectionStatus::Startup
        {
            return false;
        }
        let timeout = core.config_snapshot().connection_timeout;

        let Some(this) = self.endpoint_arc() else {
            return false;
        };
        match thread::Builder::new()
            .name(format!("{}-tx", core.name()))
            .spawn(move || this.queue_tx_function())
        {
            Ok(handle) => *core.tx_thread.lock() = Some(handle),
            Err(e) => {
                log::error!("[{}] failed to spawn tx thread: {}", core.name(), e);
                core.tx_status.set(ConnectionStatus::Error);
                return false;
            }
        }

        let Some(this) = self.endpoint_arc() else {
            core.rx_status.set(ConnectionStatus::Error);
            self.disconnect();
            return false;
        };
        match thread::Builder::new()
            .name(format!("{}-rx", core.name()))
            .spawn(move || this.queue_rx_function())
        {
            Ok(handle) => *core.rx_thread.lock() = Some(handle),
            Err(e) => {
                log::error!("[{}] failed to spawn rx thread: {}", core.name(), e);
                core.rx_status.set(ConnectionStatus::Error);
                self.disconnect();
                return false;
            }
        }

        // Negotiation and bind retries are individually bounded; double the
        // configured budget covers their worst-case chain.
        let deadline = Instant::now() + timeout * 2 + Duration::from_secs(3);
        loop {
            let rx = core.rx_status.get();
            let tx = core.tx_status.get();
            let settled = |s: ConnectionStatus| {
                !matches!(s, ConnectionStatus::Startup | ConnectionStatus::Reconnecting)
            };
            if settled(rx) && settled(tx) {
                if rx == ConnectionStatus::Connected && tx == ConnectionStatus::Connected {
                    return true;
                }
                self.disconnect();
                return false;
            }
            // One loop failing dooms the endpoint; do not wait the other out.
            if rx == ConnectionStatus::Error || tx == ConnectionStatus::Error {
                self.disconnect();
                return false;
            }
            if Instant::now() > deadline {
                log::error!("[{}] worker loops failed to settle", core.name());
                self.disconnect();
                return false;
            }
            thread::sleep(STATUS_POLL);
        }
    }

    /// Drive both loops to termination and join their threads.
    ///
    /// Idempotent: returns immediately once both statuses are terminal.
    fn disconnect(&self) {
        let core = self.core();
        core.set_disconnecting();

        // Loops that were never spawned cannot terminate themselves.
        if core.tx_thread.lock().is_none() && core.tx_status.get() == ConnectionStatus::Startup {
            core.tx_status.set(ConnectionStatus::Terminated);
        }
        if core.rx_thread.lock().is_none() && core.rx_status.get() == ConnectionStatus::Startup {
            core.rx_status.set(ConnectionStatus::Terminated);
        }

        let deadline = Instant::now() + DISCONNECT_TIMEOUT;
        let trip = TripWireDetector::new();
        let mut last_prod = Instant::now() - Duration::from_secs(1);
        loop {
            let tx = core.tx_status.get();
            let rx = core.rx_status.get();
            if tx.is_terminal() && rx.is_terminal() {
                break;
            }
            if trip.is_tripped() {
                return;
            }
            // Re-prod periodically: a close request sent while a loop was
            // still initializing can arrive before the loop listens for it.
            if last_prod.elapsed() >= Duration::from_millis(200) {
                if !tx.is_terminal() {
                    self.close_transmitter();
                }
                if !rx.is_terminal() {
                    self.close_receiver();
                }
                last_prod = Instant::now();
            }
            if Instant::now() > deadline {
                log::warn!("[{}] disconnect timed out waiting for worker loops", core.name());
                break;
            }
            thread::sleep(STATUS_POLL);
        }

        join_worker(&core.tx_thread);
        join_worker(&core.rx_thread);
    }
}

/// Join a worker thread unless we are that thread.
fn join_worker(slot: &Mutex<Option<JoinHandle<()>>>) {
    let handle = {
        let mut guard = slot.lock();
        match guard.as_ref() {
            Some(h) if h.thread().id() == thread::current().id() => None,
            _ => guard.take(),
        }
    };
    if let Some(handle) = handle {
        let _ = handle.join();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_cell_roundtrip() {
        let cell = StatusCell::new();
        assert_eq!(cell.get(), ConnectionStatus::Startup);
        for status in [
            ConnectionStatus::Connected,
            ConnectionStatus::Error,
            ConnectionStatus::Terminated,
            ConnectionStatus::Reconnecting,
            ConnectionStatus::Startup,
        ] {
            cell.set(status);
            assert_eq!(cell.get(), status);
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(ConnectionStatus::Error.is_terminal());
        assert!(ConnectionStatus::Terminated.is_terminal());
        assert!(!ConnectionStatus::Startup.is_terminal());
        assert!(!ConnectionStatus::Connected.is_terminal());
        assert!(!ConnectionStatus::Reconnecting.is_terminal());
    }

    #[test]
    fn property_lock_fails_after_startup() {
        let core = CommsCore::new("prop");
        {
            let mut cfg = core.property_lock().expect("startup allows the lock");
            cfg.port_number = 24200;
        }
        core.tx_status().set(ConnectionStatus::Connected);
        assert!(core.property_lock().is_none());
        core.tx_status().set(ConnectionStatus::Startup);
        core.rx_status().set(ConnectionStatus::Terminated);
        assert!(core.property_lock().is_none());
        assert_eq!(core.config_snapshot().port_number, 24200);
    }

    #[test]
    fn tx_queue_is_fifo_and_single_consumer() {
        let core = CommsCore::new("fifo");
        core.transmit(RouteId(3), ActionMessage::data(&b"a"[..]));
        core.transmit(RouteId(3), ActionMessage::data(&b"b"[..]));
        let rx = core.take_tx_queue().expect("first take succeeds");
        assert!(core.take_tx_queue().is_none());
        assert_eq!(rx.recv().unwrap().1.payload, b"a");
        assert_eq!(rx.recv().unwrap().1.payload, b"b");
    }

    #[test]
    fn transmit_after_tx_loop_exit_is_discarded() {
        let core = CommsCore::new("late");
        drop(core.take_tx_queue());
        // Must not panic or block.
        core.transmit(RouteId::BROKER, ActionMessage::data(&b"x"[..]));
    }

    #[test]
    fn deliver_uses_installed_callback() {
        use std::sync::atomic::AtomicUsize;
        let core = CommsCore::new("cb");
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        core.install_callback(Arc::new(move |m: ActionMessage| {
            assert_eq!(m.payload, b"seen");
            hits2.fetch_add(1, Ordering::SeqCst);
        }));
        core.deliver(ActionMessage::data(&b"seen"[..]));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn receiver_wait_gives_up_past_limit() {
        let core = CommsCore::new("slow-rx");
        let start = Instant::now();
        assert_eq!(core.wait_for_receiver(), ConnectionStatus::Startup);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1500), "gave up too early: {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(5), "waited too long: {:?}", elapsed);
    }

    #[test]
    fn receiver_wait_observes_transition() {
        let core = Arc::new(CommsCore::new("fast-rx"));
        let core2 = Arc::clone(&core);
        let setter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(60));
            core2.rx_status().set(ConnectionStatus::Connected);
        });
        assert_eq!(core.wait_for_receiver(), ConnectionStatus::Connected);
        setter.join().unwrap();
    }
}
