// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 fedlink contributors

//! Stream transport: connection-per-route TCP with length-framed messages.
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                         TcpComms                              |
//! |                                                               |
//! |  tx loop: txQueue -> route table -> per-route TCP streams     |
//! |             |                                                 |
//! |             +-- broker stream (route 0, port negotiation)     |
//! |                                                               |
//! |  rx loop: listener (accept) -> frames -> ActionCallback       |
//! |             ^                                                 |
//! |             +-- port-wait phase, bind auto-retry              |
//! |                                                               |
//! |  io thread: mio poll loop shared by both (see io_thread)      |
//! +--------------------------------------------------------------+
//! ```
//!
//! An endpoint without a preassigned port asks its broker for one
//! (`REQUEST_PORTS` / `PORT_DEFINITIONS`) before the listener binds; an
//! endpoint acting as a broker answers those queries from a process-wide
//! monotonic port allocator.

mod io_thread;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::comms::{CommsConfig, CommsCore, CommsInterface, ConnectionStatus, RouteId};
use crate::message::{
    self, is_disconnect_command, is_protocol_command, ActionMessage,
};
use crate::netinfo::{
    derive_local_target, extract_interface_and_port, make_port_address, strip_protocol,
};
use io_thread::{IoThread, IoThreadHandle, RxEvent};

// ============================================================================
// Constants
// ============================================================================

/// Default broker listen port.
pub const DEFAULT_BROKER_PORT: i32 = 24160;

/// First port handed out by a top-level endpoint.
pub const OPEN_PORT_RANGE_START: i32 = 24228;

/// First port handed out by an endpoint that itself has a parent broker.
pub const SUBBROKER_PORT_RANGE_START: i32 = 24328;

/// Delay between bind attempts when the port is not auto-assigned.
const BIND_RETRY_DELAY: Duration = Duration::from_millis(150);

/// Poll interval while the tx loop waits for a port reply.
const PORT_POLL: Duration = Duration::from_millis(100);

/// Ports allocated by this process; never handed out twice.
static USED_PORT_NUMBERS: Mutex<BTreeSet<i32>> = Mutex::new(BTreeSet::new());

// ============================================================================
// TcpComms
// ============================================================================

/// Stream-transport endpoint.
pub struct TcpComms {
    core: CommsCore,
    self_ref: std::sync::Weak<TcpComms>,
    /// Listener port; negative until assigned.
    port_number: AtomicI32,
    /// First port to hand out to children; negative until decided.
    open_port_start: AtomicI32,
    rx_event_tx: Sender<RxEvent>,
    rx_event_rx: Mutex<Option<Receiver<RxEvent>>>,
    io: std::sync::OnceLock<IoThreadHandle>,
    io_init: Mutex<()>,
}

/// Why the tx loop could not finish its startup sequence.
enum TxStartupError {
    /// A disconnect arrived mid-handshake.
    Disconnect,
    /// The handshake failed; the message becomes a `CMD_ERROR` callback.
    Failed(String),
}

impl TcpComms {
    /// Create an endpoint. Configure it through the setters, then `connect`.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let (rx_event_tx, rx_event_rx) = channel();
        let name = name.into();
        Arc::new_cyclic(|self_ref| Self {
            core: CommsCore::new(name),
            self_ref: self_ref.clone(),
            port_number: AtomicI32::new(-1),
            open_port_start: AtomicI32::new(-1),
            rx_event_tx,
            rx_event_rx: Mutex::new(Some(rx_event_rx)),
            io: std::sync::OnceLock::new(),
            io_init: Mutex::new(()),
        })
    }

    /// Currently assigned listener port, negative while unknown.
    pub fn port_number(&self) -> i32 {
        self.port_number.load(Ordering::Acquire)
    }

    fn set_port(&self, port: i32) {
        self.port_number.store(port, Ordering::Release);
    }

    /// Spawn the shared I/O thread on first use.
    fn io_handle(&self) -> io::Result<&IoThreadHandle> {
        if let Some(handle) = self.io.get() {
            return Ok(handle);
        }
        let _guard = self.io_init.lock();
        if self.io.get().is_none() {
            let max = self.core.config_snapshot().max_message_size;
            let handle = IoThread::spawn(self.core.name(), max, self.rx_event_tx.clone())?;
            let _ = self.io.set(handle);
        }
        self.io
            .get()
            .ok_or_else(|| io::Error::other("tcp io thread unavailable"))
    }

    fn sync_port_from_config(&self, cfg: &CommsConfig) {
        if cfg.port_number > 0 {
            self.set_port(cfg.port_number);
        }
        if cfg.port_start > 0 {
            self.open_port_start.store(cfg.port_start, Ordering::Release);
        }
    }

    /// Record a `PORT_DEFINITIONS` reply: fix the listener port and, when
    /// still undecided, derive the range this endpoint hands out itself so
    /// sub-broker allocations never collide with the parent's.
    fn apply_port_definitions(&self, msg: &ActionMessage) {
        let assigned = msg.source_handle;
        if self.open_port_start.load(Ordering::Acquire) < 0 {
            let start = if assigned < OPEN_PORT_RANGE_START {
                OPEN_PORT_RANGE_START
            } else if assigned < SUBBROKER_PORT_RANGE_START {
                SUBBROKER_PORT_RANGE_START + 10 * (assigned - OPEN_PORT_RANGE_START)
            } else {
                SUBBROKER_PORT_RANGE_START + 10 * (assigned - SUBBROKER_PORT_RANGE_START) + 10
            };
            self.open_port_start.store(start, Ordering::Release);
        }
        self.set_port(assigned);
    }

    /// Allocate a fresh port from the process-wide in-use set.
    fn find_open_port(&self) -> i32 {
        let mut used = USED_PORT_NUMBERS.lock();
        let mut start = self.open_port_start.load(Ordering::Acquire);
        if start < 0 {
            start = if self.core.has_broker() {
                SUBBROKER_PORT_RANGE_START
            } else {
                OPEN_PORT_RANGE_START
            };
        }
        while used.contains(&start) {
            start += 1;
        }
        used.insert(start);
        start
    }

    fn push_control(&self, msg: ActionMessage) {
        let _ = self.rx_event_tx.send(RxEvent::Control(msg));
    }

    // ========================================================================
    // Receive loop
    // ========================================================================

    fn run_receiver(&self) {
        let core = &self.core;
        let cfg = core.config_snapshot();
        self.sync_port_from_config(&cfg);

        let Some(events) = self.rx_event_rx.lock().take() else {
            core.rx_status().set(ConnectionStatus::Error);
            return;
        };

        // Phase 1: wait until a port is known. The assignment arrives either
        // as a broker frame relayed by the I/O thread or as a synthetic
        // control message from the tx loop.
        while self.port_number() < 0 {
            match events.recv() {
                Ok(RxEvent::Control(msg)) | Ok(RxEvent::Frame { msg, .. })
                    if is_protocol_command(&msg) =>
                {
                    match msg.message_id {
                        message::PORT_DEFINITIONS => self.apply_port_definitions(&msg),
                        message::CLOSE_RECEIVER | message::DISCONNECT => {
                            core.set_disconnecting();
                            core.rx_status().set(ConnectionStatus::Terminated);
                            return;
                        }
                        _ => {}
                    }
                }
                Ok(_) => {}
                Err(_) => {
                    core.rx_status().set(ConnectionStatus::Error);
                    return;
                }
            }
        }

        // Phase 2: bind the listener, retrying per the auto-port policy.
        let io = match self.io_handle() {
            Ok(io) => io,
            Err(e) => {
                core.error_callback(format!("unable to start tcp io thread: {}", e));
                core.rx_status().set(ConnectionStatus::Error);
                return;
            }
        };
        let local_target = if cfg.local_target.is_empty() {
            derive_local_target(&cfg.broker_target, cfg.network)
        } else {
            strip_protocol(&cfg.local_target).to_string()
        };
        let has_broker = !strip_protocol(&cfg.broker_target).is_empty();
        let deadline = Instant::now() + cfg.connection_timeout;

        'bind: loop {
            let port = self.port_number();
            let addr = match bind_addr(&local_target, port) {
                Ok(addr) => addr,
                Err(e) => {
                    core.error_callback(format!(
                        "invalid local interface '{}': {}",
                        local_target, e
                    ));
                    core.rx_status().set(ConnectionStatus::Error);
                    return;
                }
            };
            if io.listen(addr).is_err() {
                core.rx_status().set(ConnectionStatus::Error);
                return;
            }
            // Wait for this attempt's outcome; unrelated traffic may
            // interleave while the broker stream is already live.
            loop {
                match events.recv() {
                    Ok(RxEvent::Listening(_)) => break 'bind,
                    Ok(RxEvent::BindFailed(e)) => {
                        if cfg.auto_port_number && has_broker {
                            // Auto-assigned port in use elsewhere; take the next one.
                            self.set_port(port + 1);
                            continue 'bind;
                        }
                        log::warn!("[{}] retrying tcp bind: {}", core.name(), e);
                        core.rx_status().set(ConnectionStatus::Reconnecting);
                        thread::sleep(BIND_RETRY_DELAY);
                        if Instant::now() > deadline {
                            core.error_callback("unable to bind tcp listener socket");
                            core.rx_status().set(ConnectionStatus::Error);
                            return;
                        }
                        continue 'bind;
                    }
                    Ok(RxEvent::Control(msg))
                        if is_protocol_command(&msg)
                            && matches!(
                                msg.message_id,
                                message::CLOSE_RECEIVER | message::DISCONNECT
                            ) =>
                    {
                        core.set_disconnecting();
                        core.rx_status().set(ConnectionStatus::Terminated);
                        return;
                    }
                    Ok(_) => {}
                    Err(_) => {
                        core.rx_status().set(ConnectionStatus::Error);
                        return;
                    }
                }
            }
        }
        core.rx_status().set(ConnectionStatus::Connected);

        // Steady state: surface frames, answer port queries, exit on close.
        loop {
            match events.recv() {
                Ok(RxEvent::Frame { conn_id, msg }) => {
                    if is_protocol_command(&msg) {
                        match msg.message_id {
                            message::QUERY_PORTS => {
                                let mut reply = ActionMessage::protocol(message::PORT_DEFINITIONS);
                                reply.source_id = self.port_number();
                                let _ = io.send(conn_id, reply.packetize(), false);
                            }
                            message::REQUEST_PORTS => {
                                let open_port = self.find_open_port();
                                let mut reply = ActionMessage::protocol(message::PORT_DEFINITIONS);
                                reply.source_id = self.port_number();
                                reply.source_handle = open_port;
                                let _ = io.send(conn_id, reply.packetize(), false);
                            }
                            message::CLOSE_RECEIVER | message::DISCONNECT => break,
                            _ => {} // unknown subcommand: ignore
                        }
                    } else {
                        core.deliver(msg);
                    }
                }
                Ok(RxEvent::Control(msg)) => {
                    if is_protocol_command(&msg) {
                        if matches!(
                            msg.message_id,
                            message::CLOSE_RECEIVER | message::DISCONNECT
                        ) {
                            break;
                        }
                    } else {
                        // Loopback route: deliver locally queued traffic.
                        core.deliver(msg);
                    }
                }
                Ok(RxEvent::Closed { .. }) => {} // peer disconnects are quiet
                Ok(_) => {}
                Err(_) => break,
            }
        }

        core.set_disconnecting();
        core.rx_status().set(ConnectionStatus::Terminated);
    }

    // ========================================================================
    // Transmit loop
    // ========================================================================

    fn run_transmitter(&self) {
        let core = &self.core;
        let cfg = core.config_snapshot();
        self.sync_port_from_config(&cfg);

        let Some(tx_queue) = core.take_tx_queue() else {
            core.tx_status().set(ConnectionStatus::Error);
            return;
        };
        let io = match self.io_handle() {
            Ok(io) => io,
            Err(e) => {
                core.error_callback(format!("unable to start tcp io thread: {}", e));
                core.tx_status().set(ConnectionStatus::Error);
                return;
            }
        };

        let has_broker = !strip_protocol(&cfg.broker_target).is_empty();
        core.set_has_broker(has_broker);

        let mut routes: BTreeMap<i32, u64> = BTreeMap::new();
        let mut broker_conn: Option<u64> = None;
        let mut stash: Vec<(RouteId, ActionMessage)> = Vec::new();

        if has_broker {
            match self.establish_broker_connection(&cfg, io, &tx_queue, &mut stash) {
                Ok(conn) => broker_conn = Some(conn),
                Err(TxStartupError::Disconnect) => {
                    core.tx_status().set(ConnectionStatus::Terminated);
                    return;
                }
                Err(TxStartupError::Failed(text)) => {
                    core.error_callback(text);
                    core.tx_status().set(ConnectionStatus::Error);
                    return;
                }
            }
        } else if self.port_number() < 0 {
            // Broker role with no preset port: adopt the default broker port
            // and unblock the receiver's port-wait phase.
            self.set_port(DEFAULT_BROKER_PORT);
            let mut msg = ActionMessage::protocol(message::PORT_DEFINITIONS);
            msg.source_handle = DEFAULT_BROKER_PORT;
            self.push_control(msg);
        }

        match core.wait_for_receiver() {
            ConnectionStatus::Startup => {
                core.error_callback("unable to link with receiver");
                core.tx_status().set(ConnectionStatus::Error);
                return;
            }
            ConnectionStatus::Error => {
                core.tx_status().set(ConnectionStatus::Error);
                return;
            }
            ConnectionStatus::Terminated => {
                core.tx_status().set(ConnectionStatus::Terminated);
                return;
            }
            _ => {}
        }
        core.tx_status().set(ConnectionStatus::Connected);

        // Replay anything popped during the handshake, then drain the queue.
        let mut open = true;
        for item in stash.drain(..) {
            if !self.process_tx(item, io, &mut routes, broker_conn, &cfg) {
                open = false;
                break;
            }
        }
        while open {
            match tx_queue.recv() {
                Ok(item) => {
                    if !self.process_tx(item, io, &mut routes, broker_conn, &cfg) {
                        break;
                    }
                }
                Err(_) => break,
            }
        }

        for (_, conn) in routes {
            io.close(conn);
        }
        if let Some(conn) = broker_conn {
            io.close(conn);
        }
        if core.rx_status().get() == ConnectionStatus::Connected {
            self.push_control(ActionMessage::protocol(message::CLOSE_RECEIVER));
        }
        core.tx_status().set(ConnectionStatus::Terminated);
    }

    /// Handle one popped queue entry. Returns `false` when the loop should
    /// stop.
    fn process_tx(
        &self,
        (route, cmd): (RouteId, ActionMessage),
        io: &IoThreadHandle,
        routes: &mut BTreeMap<i32, u64>,
        broker_conn: Option<u64>,
        cfg: &CommsConfig,
    ) -> bool {
        if is_protocol_command(&cmd) && route == RouteId::LOOPBACK {
            match cmd.message_id {
                message::NEW_ROUTE => {
                    self.open_route(&cmd, io, routes, cfg);
                    return true;
                }
                message::CLOSE_RECEIVER => {
                    self.push_control(cmd);
                    return true;
                }
                message::DISCONNECT => return false,
                _ => {} // fall through to dispatch
            }
        }

        let quiet = is_disconnect_command(&cmd);
        if route == RouteId::BROKER {
            if let Some(conn) = broker_conn {
                self.send_on(io, conn, &cmd, quiet);
            }
            // No broker: nothing above us to hear it; drop silently.
        } else if route == RouteId::LOOPBACK {
            self.push_control(cmd);
        } else if let Some(&conn) = routes.get(&route.0) {
            self.send_on(io, conn, &cmd, quiet);
        } else if let Some(conn) = broker_conn {
            self.send_on(io, conn, &cmd, quiet);
        } else {
            debug_assert!(false, "no route {} and no broker", route.0);
            log::warn!(
                "[{}] dropping {} for unknown route {}",
                self.core.name(),
                cmd.action.name(),
                route.0
            );
        }
        true
    }

    fn send_on(&self, io: &IoThreadHandle, conn: u64, cmd: &ActionMessage, quiet: bool) {
        if io.send(conn, cmd.packetize(), quiet).is_err() && !quiet {
            log::error!(
                "[{}] send {} failed: io thread stopped",
                self.core.name(),
                cmd.action.name()
            );
        }
    }

    /// Open the connection named by a `NEW_ROUTE` payload. Failures are
    /// swallowed; traffic for the missing route falls back to the broker.
    fn open_route(
        &self,
        cmd: &ActionMessage,
        io: &IoThreadHandle,
        routes: &mut BTreeMap<i32, u64>,
        cfg: &CommsConfig,
    ) {
        if routes.contains_key(&cmd.dest_id) {
            return; // first handle wins
        }
        let address = cmd.payload_str().into_owned();
        let (interface, port) = match extract_interface_and_port(strip_protocol(&address)) {
            Ok(parts) => parts,
            Err(e) => {
                log::warn!("[{}] bad NEW_ROUTE address: {}", self.core.name(), e);
                return;
            }
        };
        match open_stream(interface, port, cfg.connection_timeout) {
            Ok(stream) => match io.add_stream(stream, format!("route {}", cmd.dest_id)) {
                Ok(conn) => {
                    routes.insert(cmd.dest_id, conn);
                }
                Err(e) => {
                    log::warn!(
                        "[{}] failed to register route {}: {}",
                        self.core.name(),
                        cmd.dest_id,
                        e
                    );
                }
            },
            Err(e) => {
                log::warn!(
                    "[{}] NEW_ROUTE {} connect to {} failed: {}",
                    self.core.name(),
                    cmd.dest_id,
                    address,
                    e
                );
            }
        }
    }

    /// Connect to the broker and, when no port is preassigned, run the
    /// `REQUEST_PORTS` handshake. The rx loop records the reply; this side
    /// polls for it in 100 ms slices within the connection budget.
    fn establish_broker_connection(
        &self,
        cfg: &CommsConfig,
        io: &IoThreadHandle,
        tx_queue: &Receiver<(RouteId, ActionMessage)>,
        stash: &mut Vec<(RouteId, ActionMessage)>,
    ) -> Result<u64, TxStartupError> {
        let target = strip_protocol(&cfg.broker_target);
        let (host, port) = match extract_interface_and_port(target) {
            Ok((host, port)) => (host.to_string(), port),
            Err(_) => {
                let port = if cfg.broker_port < 0 {
                    DEFAULT_BROKER_PORT
                } else {
                    cfg.broker_port
                };
                (target.to_string(), port)
            }
        };

        let stream = open_stream(&host, port, cfg.connection_timeout).map_err(|e| {
            TxStartupError::Failed(format!(
                "initial connection to broker ({}:{}) failed: {}",
                host, port, e
            ))
        })?;
        let conn = io
            .add_stream(stream, "broker")
            .map_err(|e| TxStartupError::Failed(format!("broker stream rejected: {}", e)))?;

        if self.port_number() <= 0 {
            let request = ActionMessage::protocol_priority(message::REQUEST_PORTS);
            io.send(conn, request.packetize(), false)
                .map_err(|e| TxStartupError::Failed(format!("port request failed: {}", e)))?;

            let mut waited = Duration::ZERO;
            while self.port_number() < 0 {
                thread::sleep(PORT_POLL);
                waited += PORT_POLL;
                while let Ok((route, msg)) = tx_queue.try_recv() {
                    if is_protocol_command(&msg) {
                        match msg.message_id {
                            message::PORT_DEFINITIONS => {
                                self.apply_port_definitions(&msg);
                            }
                            message::DISCONNECT => {
                                io.close(conn);
                                return Err(TxStartupError::Disconnect);
                            }
                            _ => stash.push((route, msg)),
                        }
                    } else {
                        stash.push((route, msg));
                    }
                }
                if waited >= cfg.connection_timeout {
                    io.close(conn);
                    return Err(TxStartupError::Failed(
                        "port number query to broker timed out".to_string(),
                    ));
                }
            }
        }
        Ok(conn)
    }
}

impl CommsInterface for TcpComms {
    fn core(&self) -> &CommsCore {
        &self.core
    }

    fn queue_rx_function(self: Arc<Self>) {
        self.run_receiver();
    }

    fn queue_tx_function(self: Arc<Self>) {
        self.run_transmitter();
    }

    fn close_receiver(&self) {
        self.push_control(ActionMessage::protocol(message::CLOSE_RECEIVER));
    }

    fn endpoint_arc(&self) -> Option<Arc<dyn CommsInterface>> {
        self.self_ref
            .upgrade()
            .map(|this| this as Arc<dyn CommsInterface>)
    }

    fn address(&self) -> String {
        let cfg = self.core.config_snapshot();
        let local = if cfg.local_target.is_empty() {
            derive_local_target(&cfg.broker_target, cfg.network)
        } else {
            strip_protocol(&cfg.local_target).to_string()
        };
        make_port_address(&local, self.port_number())
    }
}

impl Drop for TcpComms {
    fn drop(&mut self) {
        self.disconnect();
        if let Some(io) = self.io.get() {
            io.shutdown();
        }
    }
}

// ============================================================================
// Address resolution
// ============================================================================

fn bind_addr(interface: &str, port: i32) -> io::Result<SocketAddr> {
    let host = match interface {
        "" | "*" => "0.0.0.0",
        "localhost" => "127.0.0.1",
        other => other,
    };
    (host, port as u16)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "unresolvable interface"))
}

fn open_stream(host: &str, port: i32, timeout: Duration) -> io::Result<TcpStream> {
    let host = match host {
        "" | "*" | "localhost" => "127.0.0.1",
        other => other,
    };
    let addr = (host, port as u16)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "unresolvable target"))?;
    let stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

// ============================================================================
// Tests
// ============================================================================
