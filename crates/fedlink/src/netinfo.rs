// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 fedlink contributors

//! Target-string handling and network configuration.
//!
//! Endpoint and broker targets arrive as loosely formatted strings
//! (`"tcp://10.0.0.4:24160"`, `"localhost:24160"`, `"*"`, a bare queue
//! name). This module normalizes them: transport prefixes are stripped,
//! `host:port` pairs are split and rejoined, and an empty local target is
//! derived from the broker target so both ends sit on a matching interface.

use std::fmt;

/// Which address family / scope an endpoint binds to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InterfaceNetwork {
    /// Loopback only.
    Local,
    /// Any IPv4 interface.
    #[default]
    Ipv4,
    /// Any IPv6 interface.
    Ipv6,
    /// All interfaces.
    All,
}

/// Network configuration aggregate applied to an endpoint in one call.
///
/// Field meanings follow the endpoint configuration surface: a negative
/// port means "not assigned yet".
#[derive(Clone, Debug)]
pub struct NetworkBrokerData {
    /// Broker target string, empty for a root endpoint.
    pub broker_address: String,
    /// Local interface string, empty to derive from the broker target.
    pub local_interface: String,
    /// Broker port, negative to use the transport default.
    pub broker_port: i32,
    /// Preassigned local port, negative to request one from the broker.
    pub port_number: i32,
    /// First port to hand out when acting as a broker, negative for default.
    pub port_start: i32,
    /// Bind with address reuse.
    pub reuse_address: bool,
    /// Interface scope.
    pub network: InterfaceNetwork,
}

impl Default for NetworkBrokerData {
    fn default() -> Self {
        Self {
            broker_address: String::new(),
            local_interface: String::new(),
            broker_port: -1,
            port_number: -1,
            port_start: -1,
            reuse_address: false,
            network: InterfaceNetwork::default(),
        }
    }
}

// ============================================================================
// String utilities
// ============================================================================

/// Strip a `<transport>://` prefix, if any.
pub fn strip_protocol(target: &str) -> &str {
    match target.find("://") {
        Some(idx) => &target[idx + 3..],
        None => target,
    }
}

/// Join an interface and a port into `"interface:port"`.
///
/// A negative port yields the bare interface.
pub fn make_port_address(interface: &str, port: i32) -> String {
    if port < 0 {
        interface.to_string()
    } else {
        format!("{}:{}", interface, port)
    }
}

/// Split `"interface:port"` into its parts.
///
/// The split happens at the last colon so bracketed IPv6 literals keep
/// their internal colons.
pub fn extract_interface_and_port(address: &str) -> Result<(&str, i32), AddressError> {
    let idx = address
        .rfind(':')
        .ok_or_else(|| AddressError::MissingPort(address.to_string()))?;
    let (interface, port_str) = (&address[..idx], &address[idx + 1..]);
    let port = port_str
        .parse::<i32>()
        .map_err(|_| AddressError::BadPort(address.to_string()))?;
    Ok((interface, port))
}

/// True for the host spellings that mean "this machine, loopback".
pub fn is_local_host(host: &str) -> bool {
    matches!(host, "" | "localhost" | "127.0.0.1" | "::1")
}

/// Choose a local interface string that matches a broker target.
///
/// A loopback broker pins the endpoint to loopback; anything else binds
/// wide so the broker's network can reach the listener.
pub fn matching_interface(broker_target: &str, network: InterfaceNetwork) -> String {
    let host = strip_protocol(broker_target);
    let host = host.rsplit_once(':').map_or(host, |(h, _)| h);
    if is_local_host(host) {
        "localhost".to_string()
    } else {
        match network {
            InterfaceNetwork::Local => "localhost".to_string(),
            _ => "*".to_string(),
        }
    }
}

/// Derive the local target when none was configured.
///
/// Mirrors the endpoint startup rule: a loopback (or absent) broker keeps
/// the endpoint on loopback; a remote broker selects the matching wide
/// interface.
pub fn derive_local_target(broker_target: &str, network: InterfaceNetwork) -> String {
    let stripped = strip_protocol(broker_target);
    if stripped.is_empty() {
        return match network {
            InterfaceNetwork::Local => "localhost".to_string(),
            _ => "*".to_string(),
        };
    }
    let host = stripped.rsplit_once(':').map_or(stripped, |(h, _)| h);
    if is_local_host(host) {
        "localhost".to_string()
    } else {
        matching_interface(stripped, network)
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Address-string parse failures.
#[derive(Debug)]
pub enum AddressError {
    /// No `:port` suffix present.
    MissingPort(String),
    /// The port suffix was not an integer.
    BadPort(String),
}

impl fmt::Display for AddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressError::MissingPort(a) => write!(f, "no port in address '{}'", a),
            AddressError::BadPort(a) => write!(f, "invalid port in address '{}'", a),
        }
    }
}

impl std::error::Error for AddressError {}

// ============================================================================
// Tests
// ============================================================================
