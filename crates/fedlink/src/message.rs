// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 fedlink contributors

//! Action-message codec.
//!
//! An [`ActionMessage`] is the opaque unit of transport in a federation:
//! a small fixed header (action tag, addressing fields) plus an opaque
//! payload. The substrate never interprets the payload; it only frames it.
//!
//! # Wire Format
//!
//! ```text
//! +----------------+----------------------------+----------------+
//! | Length (4B BE) | Header (24B)               | Payload        |
//! +----------------+----------------------------+----------------+
//! ```
//!
//! The length field is a 32-bit big-endian integer covering the header and
//! payload (not itself). [`ActionMessage::depacketize`] consumes exactly one
//! frame and reports how many bytes it used, so a receive buffer can be
//! drained frame by frame and a truncated tail left for the next read.

use std::fmt;

// ============================================================================
// Constants
// ============================================================================

/// Frame length prefix size (4 bytes, big endian).
pub const FRAME_PREFIX_SIZE: usize = 4;

/// Fixed header size following the length prefix.
pub const HEADER_SIZE: usize = 24;

/// Protocol subcommand: shut down the receive loop.
pub const CLOSE_RECEIVER: i32 = 23405;

/// Protocol subcommand: shut down the transmit loop.
pub const DISCONNECT: i32 = 2523;

/// Protocol subcommand: install a new outbound route.
pub const NEW_ROUTE: i32 = 233;

/// Protocol subcommand: ask an endpoint which port it listens on.
pub const QUERY_PORTS: i32 = 1453;

/// Protocol subcommand: ask a broker to assign an open port.
pub const REQUEST_PORTS: i32 = 1454;

/// Protocol subcommand: port reply (`source_id` = replier's port,
/// `source_handle` = assigned port when answering `REQUEST_PORTS`).
pub const PORT_DEFINITIONS: i32 = 1451;

/// Protocol subcommand: move a queue-transport receiver to `Operating`.
pub const SET_TO_OPERATING: i32 = 135111;

// ============================================================================
// Action tag
// ============================================================================

/// Action tag carried by every message.
///
/// Kept as a transparent `i32` so tags this build does not know about
/// survive a codec round trip unchanged; receivers forward what they do not
/// understand. Negative codes mark commands that deserve elevated delivery
/// priority, mirroring the sign convention of the federation command set.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Action(pub i32);

impl Action {
    /// Placeholder command; dropped by every handler.
    pub const IGNORE: Action = Action(0);
    /// Substrate control traffic.
    pub const PROTOCOL: Action = Action(45);
    /// Substrate control traffic with a large payload.
    pub const PROTOCOL_BIG: Action = Action(47);
    /// Substrate control traffic, elevated delivery priority.
    pub const PROTOCOL_PRIORITY: Action = Action(-60);
    /// Synthetic error notice delivered through the user callback.
    pub const ERROR: Action = Action(-5);
    /// Federation init grant; watched by the queue transport.
    pub const INIT_GRANT: Action = Action(-22);
    /// Opaque application data.
    pub const DATA: Action = Action(85);

    /// Human-readable tag name for logs.
    pub fn name(self) -> &'static str {
        match self {
            Action::IGNORE => "ignore",
            Action::PROTOCOL => "protocol",
            Action::PROTOCOL_BIG => "protocol_big",
            Action::PROTOCOL_PRIORITY => "protocol_priority",
            Action::ERROR => "error",
            Action::INIT_GRANT => "init_grant",
            Action::DATA => "data",
            _ => "unknown",
        }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Action({}:{})", self.0, self.name())
    }
}

// ============================================================================
// ActionMessage
// ============================================================================

/// One framed unit of transport.
///
/// The addressing fields are written by the layer above the substrate; the
/// substrate reads `action`, `message_id`/`index` (protocol subcommand) and
/// `dest_id` (route id on `NEW_ROUTE`), and treats `payload` as opaque bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActionMessage {
    /// Action tag.
    pub action: Action,
    /// Protocol subcommand, or an application-level message id.
    pub message_id: i32,
    /// Source federate/broker id.
    pub source_id: i32,
    /// Source handle (port replies reuse this for the assigned port).
    pub source_handle: i32,
    /// Destination id (route id on `NEW_ROUTE`).
    pub dest_id: i32,
    /// Secondary subcommand slot; mirrors `message_id` on protocol commands.
    pub index: i32,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
}

impl ActionMessage {
    /// Create an empty message with the given action tag.
    pub fn new(action: Action) -> Self {
        Self {
            action,
            message_id: 0,
            source_id: 0,
            source_handle: 0,
            dest_id: 0,
            index: 0,
            payload: Vec::new(),
        }
    }

    /// Create a `CMD_PROTOCOL` message with the given subcommand.
    pub fn protocol(sub: i32) -> Self {
        let mut m = Self::new(Action::PROTOCOL);
        m.message_id = sub;
        m.index = sub;
        m
    }

    /// Create a `CMD_PROTOCOL_PRIORITY` message with the given subcommand.
    pub fn protocol_priority(sub: i32) -> Self {
        let mut m = Self::new(Action::PROTOCOL_PRIORITY);
        m.message_id = sub;
        m.index = sub;
        m
    }

    /// Create a synthetic `CMD_ERROR` with a descriptive payload.
    pub fn error(text: impl Into<String>) -> Self {
        let mut m = Self::new(Action::ERROR);
        m.payload = text.into().into_bytes();
        m
    }

    /// Create an application data message.
    pub fn data(payload: impl Into<Vec<u8>>) -> Self {
        let mut m = Self::new(Action::DATA);
        m.payload = payload.into();
        m
    }

    /// Protocol subcommand carried by this message.
    pub fn protocol_sub(&self) -> i32 {
        self.message_id
    }

    /// Payload interpreted as UTF-8, lossily.
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Serialized frame size of this message.
    pub fn packet_size(&self) -> usize {
        FRAME_PREFIX_SIZE + HEADER_SIZE + self.payload.len()
    }

    /// Serialize into a fresh length-prefixed frame.
    pub fn packetize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.packet_size());
        self.packetize_into(&mut buf);
        buf
    }

    /// Append a length-prefixed frame to `buf`.
    pub fn packetize_into(&self, buf: &mut Vec<u8>) {
        let len = (HEADER_SIZE + self.payload.len()) as u32;
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&self.action.0.to_be_bytes());
        buf.extend_from_slice(&self.message_id.to_be_bytes());
        buf.extend_from_slice(&self.source_id.to_be_bytes());
        buf.extend_from_slice(&self.source_handle.to_be_bytes());
        buf.extend_from_slice(&self.dest_id.to_be_bytes());
        buf.extend_from_slice(&self.index.to_be_bytes());
        buf.extend_from_slice(&self.payload);
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns:
    /// - `Ok(Some((msg, consumed)))` - one complete frame was decoded
    /// - `Ok(None)` - the buffer holds a truncated frame; zero bytes consumed
    /// - `Err(_)` - the frame is malformed and the connection should be dropped
    pub fn depacketize(buf: &[u8]) -> Result<Option<(ActionMessage, usize)>, CodecError> {
        let Some(frame_len) = peek_frame_len(buf) else {
            return Ok(None);
        };
        if frame_len < HEADER_SIZE {
            return Err(CodecError::ShortFrame(frame_len));
        }
        if buf.len() < FRAME_PREFIX_SIZE + frame_len {
            return Ok(None);
        }
        let h = &buf[FRAME_PREFIX_SIZE..FRAME_PREFIX_SIZE + HEADER_SIZE];
        let field = |i: usize| i32::from_be_bytes([h[i], h[i + 1], h[i + 2], h[i + 3]]);
        let msg = ActionMessage {
            action: Action(field(0)),
            message_id: field(4),
            source_id: field(8),
            source_handle: field(12),
            dest_id: field(16),
            index: field(20),
            payload: buf[FRAME_PREFIX_SIZE + HEADER_SIZE..FRAME_PREFIX_SIZE + frame_len].to_vec(),
        };
        Ok(Some((msg, FRAME_PREFIX_SIZE + frame_len)))
    }
}

/// Peek the declared frame length (excluding the prefix itself).
///
/// Returns `None` when fewer than four bytes are available.
pub fn peek_frame_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < FRAME_PREFIX_SIZE {
        return None;
    }
    Some(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize)
}

// ============================================================================
// Predicates
// ============================================================================

/// True when the message is control traffic consumed by the substrate.
pub fn is_protocol_command(m: &ActionMessage) -> bool {
    matches!(
        m.action,
        Action::PROTOCOL | Action::PROTOCOL_PRIORITY | Action::PROTOCOL_BIG
    )
}

/// True when the message deserves elevated delivery priority.
pub fn is_priority_command(m: &ActionMessage) -> bool {
    m.action.0 < 0
}

/// True when the message tears a loop down; send failures on these stay quiet.
pub fn is_disconnect_command(m: &ActionMessage) -> bool {
    is_protocol_command(m) && matches!(m.message_id, DISCONNECT | CLOSE_RECEIVER)
}

// ============================================================================
// Errors
// ============================================================================

/// Framing errors raised by [`ActionMessage::depacketize`].
#[derive(Debug)]
pub enum CodecError {
    /// Declared frame length cannot hold the fixed header.
    ShortFrame(usize),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::ShortFrame(len) => {
                write!(f, "frame length {} below header size {}", len, HEADER_SIZE)
            }
        }
    }
}

impl std::error::Error for CodecError {}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ActionMessage {
        ActionMessage {
            action: Action::DATA,
            message_id: 17,
            source_id: 3,
            source_handle: 24231,
            dest_id: 7,
            index: 17,
            payload: b"ping".to_vec(),
        }
    }

    #[test]
    fn roundtrip_identity() {
        let m = sample();
        let frame = m.packetize();
        let (out, used) = ActionMessage::depacketize(&frame).unwrap().unwrap();
        assert_eq!(out, m);
        assert_eq!(used, frame.len());
    }

    #[test]
    fn roundtrip_empty_payload() {
        let m = ActionMessage::protocol(NEW_ROUTE);
        let frame = m.packetize();
        assert_eq!(frame.len(), FRAME_PREFIX_SIZE + HEADER_SIZE);
        let (out, used) = ActionMessage::depacketize(&frame).unwrap().unwrap();
        assert_eq!(out, m);
        assert_eq!(used, frame.len());
    }

    #[test]
    fn truncated_buffer_consumes_nothing() {
        let frame = sample().packetize();
        for cut in 0..frame.len() {
            assert!(
                ActionMessage::depacketize(&frame[..cut]).unwrap().is_none(),
                "cut at {} should be incomplete",
                cut
            );
        }
    }

    #[test]
    fn multiple_frames_drain_in_order() {
        let mut buf = Vec::new();
        ActionMessage::data(&b"first"[..]).packetize_into(&mut buf);
        ActionMessage::data(&b"second"[..]).packetize_into(&mut buf);
        ActionMessage::protocol(DISCONNECT).packetize_into(&mut buf);

        let mut consumed = 0;
        let mut seen = Vec::new();
        while let Some((m, used)) = ActionMessage::depacketize(&buf[consumed..]).unwrap() {
            consumed += used;
            seen.push(m);
        }
        assert_eq!(consumed, buf.len());
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].payload, b"first");
        assert_eq!(seen[1].payload, b"second");
        assert_eq!(seen[2].message_id, DISCONNECT);
    }

    #[test]
    fn short_frame_is_malformed() {
        // Declared length below the header size cannot be a valid frame.
        let mut buf = 8u32.to_be_bytes().to_vec();
        buf.extend_from_slice(&[0u8; 8]);
        assert!(ActionMessage::depacketize(&buf).is_err());
    }

    #[test]
    fn predicates() {
        assert!(is_protocol_command(&ActionMessage::protocol(NEW_ROUTE)));
        assert!(is_protocol_command(&ActionMessage::protocol_priority(
            REQUEST_PORTS
        )));
        assert!(is_protocol_command(&ActionMessage::new(
            Action::PROTOCOL_BIG
        )));
        assert!(!is_protocol_command(&ActionMessage::data(&b"x"[..])));

        assert!(is_priority_command(&ActionMessage::protocol_priority(
            REQUEST_PORTS
        )));
        assert!(is_priority_command(&ActionMessage::new(Action::INIT_GRANT)));
        assert!(is_priority_command(&ActionMessage::error("boom")));
        assert!(!is_priority_command(&ActionMessage::protocol(NEW_ROUTE)));
        assert!(!is_priority_command(&ActionMessage::data(&b"x"[..])));

        assert!(is_disconnect_command(&ActionMessage::protocol(DISCONNECT)));
        assert!(is_disconnect_command(&ActionMessage::protocol(
            CLOSE_RECEIVER
        )));
        assert!(!is_disconnect_command(&ActionMessage::protocol(NEW_ROUTE)));
        assert!(!is_disconnect_command(&ActionMessage::data(&b"x"[..])));
    }

    #[test]
    fn protocol_predicate_survives_roundtrip() {
        for m in [
            ActionMessage::protocol(QUERY_PORTS),
            ActionMessage::data(&b"payload"[..]),
            ActionMessage::new(Action(777)),
        ] {
            let frame = m.packetize();
            let (out, _) = ActionMessage::depacketize(&frame).unwrap().unwrap();
            assert_eq!(is_protocol_command(&out), is_protocol_command(&m));
        }
    }

    #[test]
    fn unknown_action_roundtrips_unchanged() {
        let mut m = ActionMessage::new(Action(90210));
        m.payload = vec![1, 2, 3];
        let (out, _) = ActionMessage::depacketize(&m.packetize()).unwrap().unwrap();
        assert_eq!(out.action, Action(90210));
        assert_eq!(out.action.name(), "unknown");
    }

    #[test]
    fn peek_reports_declared_length() {
        let frame = sample().packetize();
        assert_eq!(peek_frame_len(&frame), Some(HEADER_SIZE + 4));
        assert_eq!(peek_frame_len(&frame[..3]), None);
    }
}
