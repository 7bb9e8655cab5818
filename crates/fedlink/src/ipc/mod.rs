// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 fedlink contributors

//! Queue transport: named OS message queues with shared-memory state.
//!
//! ```text
//! +------------------+                    +------------------+
//! |   Endpoint A     |   POSIX mq         |   Endpoint B     |
//! |     tx loop -----+--> /fed_B -------->+---> rx loop      |
//! |                  |                    |       |          |
//! |                  |   shm state        |       v          |
//! |   peer_state <---+--- /fed_B_state <--+--- Startup ->    |
//! |                  |                    |     Operating -> |
//! +------------------+                    |     Closing      |
//!                                         +------------------+
//! ```
//!
//! Every endpoint owns one receive queue (named after its local target) and
//! a state segment beside it. Messages ride the queue at two priorities:
//! elevated commands at 3, everything else at 1. The first `CMD_INIT_GRANT`
//! seen by the tx loop emits a single `SET_TO_OPERATING` to the local
//! receiver, which flips the shared state and unblocks remote senders.

mod queue;
mod state;

pub use queue::{OwnedQueue, SendQueue};
pub use state::{
    state_segment_name, translate_queue_name, QueueState, StateSegment, STATE_SEGMENT_SIZE,
};

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::Arc;

use crate::comms::{CommsCore, CommsInterface, ConnectionStatus, RouteId};
use crate::message::{
    self, is_disconnect_command, is_priority_command, is_protocol_command, Action, ActionMessage,
};

// ============================================================================
// Errors
// ============================================================================

/// Errors raised by the queue transport.
#[derive(Debug)]
pub enum IpcError {
    /// Target name cannot be translated to a queue identifier.
    InvalidName(String),
    /// Shared-memory state segment creation failed.
    SegmentCreate(io::Error),
    /// Shared-memory state segment open failed.
    SegmentOpen(io::Error),
    /// Memory mapping failed.
    Mmap(io::Error),
    /// Message queue creation failed.
    QueueCreate(io::Error),
    /// Message queue open failed.
    QueueOpen(io::Error),
    /// Send failed.
    Send(io::Error),
    /// Receive failed.
    Receive(io::Error),
    /// The peer's receiver reports `Closing`.
    ReceiverClosing(String),
}

impl fmt::Display for IpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpcError::InvalidName(name) => write!(f, "invalid queue name '{}'", name),
            IpcError::SegmentCreate(e) => write!(f, "state segment create failed: {}", e),
            IpcError::SegmentOpen(e) => write!(f, "state segment open failed: {}", e),
            IpcError::Mmap(e) => write!(f, "state segment mmap failed: {}", e),
            IpcError::QueueCreate(e) => write!(f, "queue create failed: {}", e),
            IpcError::QueueOpen(e) => write!(f, "queue open failed: {}", e),
            IpcError::Send(e) => write!(f, "queue send failed: {}", e),
            IpcError::Receive(e) => write!(f, "queue receive failed: {}", e),
            IpcError::ReceiverClosing(name) => write!(f, "receiver {} is closing", name),
        }
    }
}

impl std::error::Error for IpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IpcError::SegmentCreate(e)
            | IpcError::SegmentOpen(e)
            | IpcError::Mmap(e)
            | IpcError::QueueCreate(e)
            | IpcError::QueueOpen(e)
            | IpcError::Send(e)
            | IpcError::Receive(e) => Some(e),
            _ => None,
        }
    }
}

/// Result alias for queue-transport operations.
pub type Result<T> = std::result::Result<T, IpcError>;

// ============================================================================
// Constants
// ============================================================================

/// Open attempts for the broker queue before the tx loop gives up.
const BROKER_OPEN_RETRIES: u32 = 20;

/// Open attempts for a `NEW_ROUTE` queue.
const ROUTE_OPEN_RETRIES: u32 = 3;

/// Elevated mq priority.
const PRIORITY_HIGH: u32 = 3;

/// Default mq priority.
const PRIORITY_NORMAL: u32 = 1;

// ============================================================================
// IpcComms
// ============================================================================

/// Queue-transport endpoint.
///
/// The local target doubles as the queue name; it defaults to the endpoint
/// name and can be overridden through the configuration setters before
/// `connect`.
pub struct IpcComms {
    core: CommsCore,
    self_ref: std::sync::Weak<IpcComms>,
}

impl IpcComms {
    /// Create an endpoint whose receive queue is named after `name`.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let name = name.into();
        let core = CommsCore::new(name.clone());
        if let Some(mut cfg) = core.property_lock() {
            cfg.local_target = name;
        }
        Arc::new_cyclic(|self_ref| Self {
            core,
            self_ref: self_ref.clone(),
        })
    }

    fn mq_priority(cmd: &ActionMessage) -> u32 {
        if is_protocol_command(cmd) && cmd.message_id == message::SET_TO_OPERATING {
            PRIORITY_HIGH
        } else if is_priority_command(cmd) {
            PRIORITY_HIGH
        } else {
            PRIORITY_NORMAL
        }
    }

    fn send_logged(&self, target: &SendQueue, route: i32, cmd: &ActionMessage) {
        if let Err(e) = target.send(cmd, Self::mq_priority(cmd)) {
            if !is_disconnect_command(cmd) {
                log::error!(
                    "[{}] route {} send {} failed: {}",
                    self.core.name(),
                    route,
                    cmd.action.name(),
                    e
                );
            }
        }
    }

    // ========================================================================
    // Receive loop
    // ========================================================================

    fn run_receiver(&self) {
        let core = &self.core;
        let cfg = core.config_snapshot();

        let rx_queue = match OwnedQueue::create(
            &cfg.local_target,
            cfg.max_message_count,
            cfg.max_message_size,
        ) {
            Ok(queue) => queue,
            Err(e) => {
                core.error_callback(format!("unable to create receive queue: {}", e));
                core.rx_status().set(ConnectionStatus::Error);
                return;
            }
        };

        core.rx_status().set(ConnectionStatus::Connected);
        let mut operating = false;
        loop {
            let (bytes, _priority) = match rx_queue.receive() {
                Ok(item) => item,
                Err(e) => {
                    if core.is_disconnecting() {
                        break;
                    }
                    core.error_callback(format!("receive queue failed: {}", e));
                    rx_queue.change_state(QueueState::Closing);
                    core.rx_status().set(ConnectionStatus::Error);
                    return;
                }
            };
            let cmd = match ActionMessage::depacketize(&bytes) {
                Ok(Some((cmd, _))) => cmd,
                _ => {
                    log::warn!("[{}] dropping malformed queue message", core.name());
                    continue;
                }
            };

            if is_protocol_command(&cmd) {
                match cmd.message_id {
                    message::CLOSE_RECEIVER | message::DISCONNECT => break,
                    message::SET_TO_OPERATING => {
                        if !operating {
                            rx_queue.change_state(QueueState::Operating);
                            operating = true;
                        }
                    }
                    _ => {} // unknown subcommand: ignore
                }
                continue;
            }
            if cmd.action == Action::INIT_GRANT && !operating {
                rx_queue.change_state(QueueState::Operating);
                operating = true;
            }
            core.deliver(cmd);
        }

        core.set_disconnecting();
        rx_queue.change_state(QueueState::Closing);
        core.rx_status().set(ConnectionStatus::Terminated);
    }

    // ========================================================================
    // Transmit loop
    // ========================================================================

    fn run_transmitter(&self) {
        let core = &self.core;
        let cfg = core.config_snapshot();

        let Some(tx_queue) = core.take_tx_queue() else {
            core.tx_status().set(ConnectionStatus::Error);
            return;
        };

        let has_broker = !cfg.broker_target.is_empty();
        core.set_has_broker(has_broker);

        let broker = if has_broker {
            match SendQueue::open(&cfg.broker_target, BROKER_OPEN_RETRIES, true) {
                Ok(queue) => Some(queue),
                Err(e) => {
                    core.error_callback(format!("unable to open broker connection -> {}", e));
                    core.tx_status().set(ConnectionStatus::Error);
                    return;
                }
            }
        } else {
            None
        };

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

        let loopback = match SendQueue::open(&cfg.local_target, 1, false) {
            Ok(queue) => queue,
            Err(e) => {
                core.error_callback(format!("unable to open receiver connection -> {}", e));
                core.tx_status().set(ConnectionStatus::Error);
                return;
            }
        };

        core.tx_status().set(ConnectionStatus::Connected);
        let mut routes: BTreeMap<i32, SendQueue> = BTreeMap::new();
        let mut operating_signaled = false;

        'dispatch: while let Ok((route, cmd)) = tx_queue.recv() {
            if is_protocol_command(&cmd) && route == RouteId::LOOPBACK {
                match cmd.message_id {
                    message::NEW_ROUTE => {
                        self.open_route(&cmd, &mut routes);
                        continue;
                    }
                    message::DISCONNECT => break 'dispatch,
                    _ => {} // fall through to dispatch (CLOSE_RECEIVER included)
                }
            }

            if cmd.action == Action::INIT_GRANT && !operating_signaled {
                let signal = ActionMessage::protocol(message::SET_TO_OPERATING);
                self.send_logged(&loopback, RouteId::LOOPBACK.0, &signal);
                operating_signaled = true;
            }

            if route == RouteId::BROKER {
                if let Some(broker) = &broker {
                    self.send_logged(broker, route.0, &cmd);
                }
                // No broker above us: drop silently.
            } else if route == RouteId::LOOPBACK {
                self.send_logged(&loopback, route.0, &cmd);
            } else if let Some(target) = routes.get(&route.0) {
                self.send_logged(target, route.0, &cmd);
            } else if let Some(broker) = &broker {
                self.send_logged(broker, route.0, &cmd);
            } else {
                log::warn!(
                    "[{}] dropping {} for unknown route {}",
                    core.name(),
                    cmd.action.name(),
                    route.0
                );
            }
        }

        // Per-route handles close here; then tell the receiver to wind down
        // through the still-open loopback queue.
        drop(routes);
        if core.rx_status().get() == ConnectionStatus::Connected {
            let close = ActionMessage::protocol(message::CLOSE_RECEIVER);
            if let Err(e) = loopback.send(&close, PRIORITY_HIGH) {
                log::warn!("[{}] unable to send close message: {}", core.name(), e);
            }
        }
        core.tx_status().set(ConnectionStatus::Terminated);
    }

    /// Open the queue named by a `NEW_ROUTE` payload. Failures leave the
    /// route absent; its traffic falls back to the broker.
    fn open_route(&self, cmd: &ActionMessage, routes: &mut BTreeMap<i32, SendQueue>) {
        if routes.contains_key(&cmd.dest_id) {
            return; // first handle wins
        }
        let target = cmd.payload_str().into_owned();
        match SendQueue::open(&target, ROUTE_OPEN_RETRIES, true) {
            Ok(queue) => {
                routes.insert(cmd.dest_id, queue);
            }
            Err(e) => {
                log::warn!(
                    "[{}] NEW_ROUTE {} open of '{}' failed: {}",
                    self.core.name(),
                    cmd.dest_id,
                    target,
                    e
                );
            }
        }
    }
}

impl CommsInterface for IpcComms {
    fn core(&self) -> &CommsCore {
        &self.core
    }

    fn queue_rx_function(self: Arc<Self>) {
        self.run_receiver();
    }

    fn queue_tx_function(self: Arc<Self>) {
        self.run_transmitter();
    }

    /// Wake the receive loop out of its blocking queue read.
    ///
    /// Goes through the tx loop when that is still up; otherwise opens the
    /// local queue directly and injects the close at elevated priority.
    fn close_receiver(&self) {
        let core = &self.core;
        if core.rx_status().get().is_terminal() {
            return;
        }
        let cmd = ActionMessage::protocol(message::CLOSE_RECEIVER);
        if core.tx_status().get() == ConnectionStatus::Connected {
            core.transmit(RouteId::LOOPBACK, cmd);
            return;
        }
        let target = core.config_snapshot().local_target;
        match SendQueue::open(&target, 0, false) {
            Ok(queue) => {
                if let Err(e) = queue.send(&cmd, PRIORITY_HIGH) {
                    log::warn!("[{}] unable to send close message: {}", core.name(), e);
                }
            }
            Err(e) => {
                log::warn!("[{}] unable to open own queue for close: {}", core.name(), e);
            }
        }
    }

    fn endpoint_arc(&self) -> Option<Arc<dyn CommsInterface>> {
        self.self_ref
            .upgrade()
            .map(|this| this as Arc<dyn CommsInterface>)
    }

    fn address(&self) -> String {
        self.core.config_snapshot().local_target
    }
}

impl Drop for IpcComms {
    fn drop(&mut self) {
        self.disconnect();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priorities_follow_the_command_class() {
        assert_eq!(
            IpcComms::mq_priority(&ActionMessage::data(&b"x"[..])),
            PRIORITY_NORMAL
        );
        assert_eq!(
            IpcComms::mq_priority(&ActionMessage::protocol(message::NEW_ROUTE)),
            PRIORITY_NORMAL
        );
        assert_eq!(
            IpcComms::mq_priority(&ActionMessage::protocol_priority(message::REQUEST_PORTS)),
            PRIORITY_HIGH
        );
        assert_eq!(
            IpcComms::mq_priority(&ActionMessage::new(Action::INIT_GRANT)),
            PRIORITY_HIGH
        );
        assert_eq!(
            IpcComms::mq_priority(&ActionMessage::protocol(message::SET_TO_OPERATING)),
            PRIORITY_HIGH
        );
    }

    #[test]
    fn local_target_defaults_to_endpoint_name() {
        let comms = IpcComms::new("fed_ep_default");
        assert_eq!(comms.address(), "fed_ep_default");
    }
}
