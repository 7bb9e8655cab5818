// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 fedlink contributors

//! # fedlink: federation communications substrate
//!
//! Transport-agnostic plumbing for a co-simulation federation runtime:
//! framed action messages moved between a local federate/core endpoint, a
//! hierarchy of brokers, and sibling routes.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fedlink::comms::{CommsInterface, RouteId};
//! use fedlink::message::ActionMessage;
//! use fedlink::tcp::TcpComms;
//!
//! let endpoint = TcpComms::new("fed1");
//! endpoint.set_port_number(24200);
//! endpoint.set_callback(|msg| println!("got {:?}", msg.action));
//! assert!(endpoint.connect());
//!
//! endpoint.add_route(RouteId(7), "localhost:24201");
//! endpoint.transmit(RouteId(7), ActionMessage::data(&b"hello"[..]));
//!
//! endpoint.disconnect();
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                       Federation layer (elsewhere)                  |
//! |        federates | brokers | value handling | time coordination     |
//! +---------------------------------------------------------------------+
//! |                        Endpoint contract                            |
//! |   CommsInterface: two worker loops, status atoms, route dispatch    |
//! +---------------------------------------------------------------------+
//! |                          Transports                                 |
//! |   tcp: connection-per-route, length-framed, port negotiation        |
//! |   ipc: named OS message queues, shared-memory state descriptor      |
//! +---------------------------------------------------------------------+
//! |                        Teardown discipline                          |
//! |   DelayedDestructor + TripWire + process-scoped registry            |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`message::ActionMessage`] | Opaque framed unit of transport |
//! | [`comms::CommsInterface`] | Endpoint lifecycle and queue contract |
//! | [`tcp::TcpComms`] | Stream transport endpoint |
//! | `ipc::IpcComms` | Queue transport endpoint (Linux) |
//! | [`comms::destructor::DelayedDestructor`] | Deferred endpoint retirement |
//!
//! Routes are unidirectional push channels; replies ride the reverse graph.
//! Nothing is durable across process exit, and trust is assumed within the
//! federation.

/// Endpoint contract, worker-loop orchestration, and teardown machinery.
pub mod comms;
/// Action-message codec and protocol-command taxonomy.
pub mod message;
/// Target-string utilities and network configuration.
pub mod netinfo;
/// Stream transport (TCP, connection-per-route).
pub mod tcp;

/// Queue transport (POSIX message queues + shared memory).
#[cfg(target_os = "linux")]
pub mod ipc;

pub use comms::{CommsInterface, ConnectionStatus, RouteId};
pub use message::{Action, ActionMessage};
pub use netinfo::NetworkBrokerData;
pub use tcp::TcpComms;

#[cfg(target_os = "linux")]
pub use ipc::IpcComms;
