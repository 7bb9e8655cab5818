// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 fedlink contributors

//! I/O thread for the stream transport.
//!
//! One dedicated thread multiplexes the endpoint's listener, its broker
//! stream, and every per-route stream over a mio poll loop:
//!
//! ```text
//! +-------------------------------------------------------------+
//! |                        IoThread                              |
//! |  +-------------------------------------------------------+  |
//! |  |                    mio::Poll                           |  |
//! |  |  - TCP listener (accept inbound route connections)    |  |
//! |  |  - TCP streams  (read/write framed action messages)   |  |
//! |  |  - Waker        (commands from the worker loops)      |  |
//! |  +-------------------------------------------------------+  |
//! |                              |                               |
//! |            depacketize ------+------ flush send queues       |
//! |                              v                               |
//! |  +-------------------------------------------------------+  |
//! |  |          Event channel -> endpoint rx loop             |  |
//! |  +-------------------------------------------------------+  |
//! +-------------------------------------------------------------+
//! ```
//!
//! Inbound bytes accumulate per connection and are depacketized into whole
//! [`ActionMessage`] frames before they leave this thread; a malformed frame
//! or one longer than the configured limit closes its connection. Peer
//! disconnects (`eof`, reset, abort) are deliberately quiet.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};

use parking_lot::Mutex;

use crate::message::{peek_frame_len, ActionMessage};

// ============================================================================
// Constants
// ============================================================================

/// Token for the TCP listener.
const LISTENER_TOKEN: Token = Token(0);

/// Token for the waker (command channel).
const WAKER_TOKEN: Token = Token(1);

/// Starting token for connections.
const CONNECTION_TOKEN_START: usize = 2;

/// Poll timeout.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Maximum events to process per poll.
const MAX_EVENTS: usize = 128;

/// Connection ids for accepted (inbound) streams start here; ids handed out
/// by [`IoThreadHandle::add_stream`] count up from 1 and never collide.
const ACCEPTED_ID_START: u64 = 1 << 32;

/// Read chunk size.
const READ_CHUNK: usize = 4096;

// ============================================================================
// Commands and events
// ============================================================================

/// Commands sent to the I/O thread.
enum IoCommand {
    /// Bind (or rebind) the listener.
    Listen { addr: SocketAddr },

    /// Register an already-connected stream.
    AddStream {
        conn_id: u64,
        stream: std::net::TcpStream,
        label: String,
    },

    /// Queue one framed message on a connection.
    Send {
        conn_id: u64,
        frame: Vec<u8>,
        quiet: bool,
    },

    /// Close a connection.
    Close { conn_id: u64 },

    /// Shut the I/O thread down.
    Shutdown,
}

/// Events delivered to the endpoint's rx loop.
///
/// The rx loop consumes one channel that carries both network events from
/// this thread and in-process control messages, so it can block on a single
/// `recv`.
pub enum RxEvent {
    /// In-process control message (loopback route, shutdown requests,
    /// synthetic port definitions).
    Control(ActionMessage),

    /// The listener is bound and accepting.
    Listening(SocketAddr),

    /// The listener could not bind.
    BindFailed(String),

    /// A complete frame arrived on a connection.
    Frame { conn_id: u64, msg: ActionMessage },

    /// A connection went away. `reason` is `None` for quiet peer
    /// disconnects.
    Closed {
        conn_id: u64,
        reason: Option<String>,
    },
}

// ============================================================================
// Handle
// ============================================================================

/// Handle for driving the I/O thread from the worker loops.
pub struct IoThreadHandle {
    cmd_tx: Sender<IoCommand>,
    waker: Arc<Waker>,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
    next_conn_id: AtomicU64,
}

impl IoThreadHandle {
    fn command(&self, cmd: IoCommand) -> io::Result<()> {
        self.cmd_tx
            .send(cmd)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "I/O thread stopped"))?;
        self.waker.wake()
    }

    /// Bind the listener; the outcome arrives as a
    /// [`RxEvent::Listening`] or [`RxEvent::BindFailed`] event.
    pub fn listen(&self, addr: SocketAddr) -> io::Result<()> {
        self.command(IoCommand::Listen { addr })
    }

    /// Register a connected stream and return its connection id.
    pub fn add_stream(
        &self,
        stream: std::net::TcpStream,
        label: impl Into<String>,
    ) -> io::Result<u64> {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        self.command(IoCommand::AddStream {
            conn_id,
            stream,
            label: label.into(),
        })?;
        Ok(conn_id)
    }

    /// Queue one framed message for transmission.
    ///
    /// `quiet` suppresses failure logging (disconnect traffic during
    /// shutdown).
    pub fn send(&self, conn_id: u64, frame: Vec<u8>, quiet: bool) -> io::Result<()> {
        self.command(IoCommand::Send {
            conn_id,
            frame,
            quiet,
        })
    }

    /// Close one connection.
    pub fn close(&self, conn_id: u64) {
        let _ = self.command(IoCommand::Close { conn_id });
    }

    /// True while the I/O thread runs.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Stop the I/O thread and join it.
    pub fn shutdown(&self) {
        if self.running.load(Ordering::Relaxed) {
            let _ = self.cmd_tx.send(IoCommand::Shutdown);
            let _ = self.waker.wake();
        }
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for IoThreadHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// I/O thread
// ============================================================================

/// Poll-loop state.
pub struct IoThread {
    name: String,
    poll: Poll,
    listener: Option<TcpListener>,
    connections: HashMap<Token, IoConnection>,
    conn_tokens: HashMap<u64, Token>,
    next_token: usize,
    next_accept_id: u64,
    cmd_rx: Receiver<IoCommand>,
    event_tx: Sender<RxEvent>,
    max_frame_size: usize,
    running: Arc<AtomicBool>,
}

/// Per-connection state.
struct IoConnection {
    stream: TcpStream,
    conn_id: u64,
    label: String,
    rx_buf: Vec<u8>,
    send_queue: Vec<u8>,
    send_offset: usize,
    quiet: bool,
}

/// Error kinds a closing peer produces in the normal course of shutdown.
fn is_quiet_disconnect(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

impl IoThread {
    /// Spawn the I/O thread for an endpoint.
    ///
    /// `event_tx` is the endpoint rx loop's channel; frames and connection
    /// events are pushed there alongside in-process control messages.
    pub fn spawn(
        name: &str,
        max_frame_size: usize,
        event_tx: Sender<RxEvent>,
    ) -> io::Result<IoThreadHandle> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (cmd_tx, cmd_rx) = channel();
        let running = Arc::new(AtomicBool::new(true));

        let io_thread = IoThread {
            name: name.to_string(),
            poll,
            listener: None,
            connections: HashMap::new(),
            conn_tokens: HashMap::new(),
            next_token: CONNECTION_TOKEN_START,
            next_accept_id: ACCEPTED_ID_START,
            cmd_rx,
            event_tx,
            max_frame_size,
            running: Arc::clone(&running),
        };

        let thread = thread::Builder::new()
            .name(format!("{}-tcp-io", name))
            .spawn(move || io_thread.run())?;

        Ok(IoThreadHandle {
            cmd_tx,
            waker,
            running,
            thread: Mutex::new(Some(thread)),
            next_conn_id: AtomicU64::new(1),
        })
    }

    fn run(mut self) {
        let mut events = Events::with_capacity(MAX_EVENTS);

        while self.running.load(Ordering::Relaxed) {
            if let Err(e) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("[{}] tcp poll error: {}", self.name, e);
                break;
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.handle_accept(),
                    WAKER_TOKEN => self.handle_commands(),
                    token => {
                        if event.is_readable() {
                            self.handle_readable(token);
                        }
                        if event.is_writable() {
                            self.handle_writable(token);
                        }
                    }
                }
            }
        }

        self.running.store(false, Ordering::Relaxed);
        for (_, mut conn) in self.connections.drain() {
            let _ = self.poll.registry().deregister(&mut conn.stream);
        }
    }

    fn handle_commands(&mut self) {
        loop {
            match self.cmd_rx.try_recv() {
                Ok(IoCommand::Listen { addr }) => self.handle_listen(addr),
                Ok(IoCommand::AddStream {
                    conn_id,
                    stream,
                    label,
                }) => self.handle_add_stream(conn_id, stream, label),
                Ok(IoCommand::Send {
                    conn_id,
                    frame,
                    quiet,
                }) => self.handle_send(conn_id, frame, quiet),
                Ok(IoCommand::Close { conn_id }) => self.handle_close(conn_id),
                Ok(IoCommand::Shutdown) | Err(TryRecvError::Disconnected) => {
                    self.running.store(false, Ordering::Relaxed);
                    break;
                }
                Err(TryRecvError::Empty) => break,
            }
        }
    }

    fn handle_listen(&mut self, addr: SocketAddr) {
        // Drop any previous listener first; bind retry replaces it.
        if let Some(mut old) = self.listener.take() {
            let _ = self.poll.registry().deregister(&mut old);
        }
        match TcpListener::bind(addr) {
            Ok(mut listener) => {
                let local = listener.local_addr().unwrap_or(addr);
                if let Err(e) =
                    self.poll
                        .registry()
                        .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
                {
                    let _ = self.event_tx.send(RxEvent::BindFailed(e.to_string()));
                    return;
                }
                self.listener = Some(listener);
                let _ = self.event_tx.send(RxEvent::Listening(local));
            }
            Err(e) => {
                let _ = self.event_tx.send(RxEvent::BindFailed(e.to_string()));
            }
        }
    }

    fn handle_add_stream(&mut self, conn_id: u64, stream: std::net::TcpStream, label: String) {
        if let Err(e) = stream.set_nonblocking(true) {
            let _ = self.event_tx.send(RxEvent::Closed {
                conn_id,
                reason: Some(format!("{}: set_nonblocking failed: {}", label, e)),
            });
            return;
        }
        let mut stream = TcpStream::from_std(stream);
        let token = Token(self.next_token);
        self.next_token += 1;

        if let Err(e) = self.poll.registry().register(
            &mut stream,
            token,
            Interest::READABLE | Interest::WRITABLE,
        ) {
            let _ = self.event_tx.send(RxEvent::Closed {
                conn_id,
                reason: Some(format!("{}: register failed: {}", label, e)),
            });
            return;
        }

        self.connections.insert(
            token,
            IoConnection {
                stream,
                conn_id,
                label,
                rx_buf: Vec::new(),
                send_queue: Vec::new(),
                send_offset: 0,
                quiet: false,
            },
        );
        self.conn_tokens.insert(conn_id, token);
    }

    fn handle_accept(&mut self) {
        loop {
            let listener = match &self.listener {
                Some(l) => l,
                None => return,
            };
            match listener.accept() {
                Ok((mut stream, remote_addr)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    let conn_id = self.next_accept_id;
                    self.next_accept_id += 1;

                    let _ = stream.set_nodelay(true);
                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        log::warn!("[{}] failed to register inbound stream: {}", self.name, e);
                        continue;
                    }

                    self.connections.insert(
                        token,
                        IoConnection {
                            stream,
                            conn_id,
                            label: format!("peer {}", remote_addr),
                            rx_buf: Vec::new(),
                            send_queue: Vec::new(),
                            send_offset: 0,
                            quiet: false,
                        },
                    );
                    self.conn_tokens.insert(conn_id, token);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("[{}] accept error: {}", self.name, e);
                    break;
                }
            }
        }
    }

    fn handle_send(&mut self, conn_id: u64, frame: Vec<u8>, quiet: bool) {
        let token = match self.conn_tokens.get(&conn_id) {
            Some(t) => *t,
            None => {
                if !quiet {
                    log::debug!("[{}] send on closed connection {}", self.name, conn_id);
                }
                return;
            }
        };
        match self.connections.get_mut(&token) {
            Some(conn) => {
                conn.quiet = quiet;
                conn.send_queue.extend_from_slice(&frame);
            }
            None => return,
        }
        self.try_flush(token);
    }

    fn handle_close(&mut self, conn_id: u64) {
        if let Some(token) = self.conn_tokens.remove(&conn_id) {
            if let Some(mut conn) = self.connections.remove(&token) {
                // Push out whatever is already queued before dropping.
                let _ = conn.stream.write(&conn.send_queue[conn.send_offset..]);
                let _ = self.poll.registry().deregister(&mut conn.stream);
            }
        }
    }

    fn handle_readable(&mut self, token: Token) {
        // Close decision is made while the connection is borrowed and acted
        // on afterwards; `Some(reason)` means drop the connection.
        let mut close: Option<Option<String>> = None;
        let mut frames = Vec::new();

        {
            let max_frame_size = self.max_frame_size;
            let conn = match self.connections.get_mut(&token) {
                Some(c) => c,
                None => return,
            };

            let mut chunk = [0u8; READ_CHUNK];
            loop {
                match conn.stream.read(&mut chunk) {
                    Ok(0) => {
                        close = Some(None);
                        break;
                    }
                    Ok(n) => conn.rx_buf.extend_from_slice(&chunk[..n]),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        close = Some(
                            (!is_quiet_disconnect(e.kind()))
                                .then(|| format!("{}: read error: {}", conn.label, e)),
                        );
                        break;
                    }
                }
            }

            // Drain complete frames; a truncated tail stays for the next read.
            let mut consumed = 0;
            loop {
                let remaining = &conn.rx_buf[consumed..];
                if let Some(len) = peek_frame_len(remaining) {
                    if len > max_frame_size {
                        close = Some(Some(format!(
                            "{}: frame of {} bytes exceeds limit {}",
                            conn.label, len, max_frame_size
                        )));
                        break;
                    }
                }
                match ActionMessage::depacketize(remaining) {
                    Ok(Some((msg, used))) => {
                        consumed += used;
                        frames.push((conn.conn_id, msg));
                    }
                    Ok(None) => break,
                    Err(e) => {
                        close = Some(Some(format!("{}: malformed frame: {}", conn.label, e)));
                        break;
                    }
                }
            }
            if consumed > 0 {
                conn.rx_buf.drain(..consumed);
            }
        }

        for (conn_id, msg) in frames {
            let _ = self.event_tx.send(RxEvent::Frame { conn_id, msg });
        }
        if let Some(reason) = close {
            self.close_connection(token, reason);
        }
    }

    fn handle_writable(&mut self, token: Token) {
        self.try_flush(token);
    }

    fn try_flush(&mut self, token: Token) {
        let close: Option<Option<String>> = {
            let conn = match self.connections.get_mut(&token) {
                Some(c) => c,
                None => return,
            };
            if conn.send_queue.is_empty() {
                return;
            }

            let mut close = None;
            while conn.send_offset < conn.send_queue.len() {
                match conn.stream.write(&conn.send_queue[conn.send_offset..]) {
                    Ok(0) => {
                        close =
                            Some((!conn.quiet).then(|| format!("{}: write returned 0", conn.label)));
                        break;
                    }
                    Ok(n) => conn.send_offset += n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        close = Some(
                            (!conn.quiet && !is_quiet_disconnect(e.kind()))
                                .then(|| format!("{}: write error: {}", conn.label, e)),
                        );
                        break;
                    }
                }
            }
            if close.is_none() {
                conn.send_queue.clear();
                conn.send_offset = 0;
            }
            close
        };

        if let Some(reason) = close {
            self.close_connection(token, reason);
        }
    }

    fn close_connection(&mut self, token: Token, reason: Option<String>) {
        if let Some(mut conn) = self.connections.remove(&token) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            self.conn_tokens.remove(&conn.conn_id);
            if let Some(text) = &reason {
                log::error!("[{}] {}", self.name, text);
            }
            let _ = self.event_tx.send(RxEvent::Closed {
                conn_id: conn.conn_id,
                reason,
            });
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Action, FRAME_PREFIX_SIZE};
    use std::net::TcpStream as StdTcpStream;

    fn recv_event(rx: &Receiver<RxEvent>, what: &str) -> RxEvent {
        rx.recv_timeout(Duration::from_secs(2))
            .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
    }

    #[test]
    fn bind_and_accept_frames() {
        let (event_tx, event_rx) = channel();
        let handle = IoThread::spawn("io-test", 16 * 1024, event_tx).unwrap();

        handle.listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = match recv_event(&event_rx, "listening") {
            RxEvent::Listening(a) => a,
            RxEvent::BindFailed(e) => panic!("bind failed: {}", e),
            _ => panic!("unexpected event"),
        };

        let mut client = StdTcpStream::connect(addr).unwrap();
        let msg = ActionMessage::data(&b"hello"[..]);
        client.write_all(&msg.packetize()).unwrap();

        match recv_event(&event_rx, "frame") {
            RxEvent::Frame { msg: got, .. } => assert_eq!(got.payload, b"hello"),
            _ => panic!("expected a frame"),
        }

        drop(client);
        match recv_event(&event_rx, "close") {
            RxEvent::Closed { reason, .. } => assert!(reason.is_none(), "peer eof must be quiet"),
            _ => panic!("expected a close"),
        }
        handle.shutdown();
    }

    #[test]
    fn oversize_frame_closes_connection() {
        let (event_tx, event_rx) = channel();
        let handle = IoThread::spawn("io-limit", 64, event_tx).unwrap();

        handle.listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = match recv_event(&event_rx, "listening") {
            RxEvent::Listening(a) => a,
            _ => panic!("expected listening"),
        };

        let mut client = StdTcpStream::connect(addr).unwrap();
        let mut big = ActionMessage::new(Action::DATA);
        big.payload = vec![0u8; 256];
        client.write_all(&big.packetize()).unwrap();

        match recv_event(&event_rx, "close") {
            RxEvent::Closed { reason, .. } => {
                assert!(reason.unwrap().contains("exceeds limit"));
            }
            _ => panic!("expected close"),
        }
        handle.shutdown();
    }

    #[test]
    fn frame_at_exact_limit_passes() {
        use crate::message::HEADER_SIZE;

        let limit = HEADER_SIZE + 16;
        let (event_tx, event_rx) = channel();
        let handle = IoThread::spawn("io-exact", limit, event_tx).unwrap();

        handle.listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = match recv_event(&event_rx, "listening") {
            RxEvent::Listening(a) => a,
            _ => panic!("expected listening"),
        };

        let mut client = StdTcpStream::connect(addr).unwrap();
        // Payload sized so the declared frame length equals the limit.
        let exact = ActionMessage::data(vec![7u8; 16]);
        client.write_all(&exact.packetize()).unwrap();
        match recv_event(&event_rx, "frame") {
            RxEvent::Frame { msg, .. } => assert_eq!(msg.payload.len(), 16),
            _ => panic!("frame at the limit must pass"),
        }

        // One byte over the limit closes the connection.
        let over = ActionMessage::data(vec![7u8; 17]);
        client.write_all(&over.packetize()).unwrap();
        match recv_event(&event_rx, "close") {
            RxEvent::Closed { reason, .. } => {
                assert!(reason.unwrap().contains("exceeds limit"));
            }
            _ => panic!("frame over the limit must close"),
        }
        handle.shutdown();
    }

    #[test]
    fn split_frame_reassembles() {
        let (event_tx, event_rx) = channel();
        let handle = IoThread::spawn("io-split", 16 * 1024, event_tx).unwrap();

        handle.listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = match recv_event(&event_rx, "listening") {
            RxEvent::Listening(a) => a,
            _ => panic!("expected listening"),
        };

        let mut client = StdTcpStream::connect(addr).unwrap();
        let frame = ActionMessage::data(&b"split-me"[..]).packetize();
        let mid = FRAME_PREFIX_SIZE + 3;
        client.write_all(&frame[..mid]).unwrap();
        client.flush().unwrap();
        thread::sleep(Duration::from_millis(50));
        client.write_all(&frame[mid..]).unwrap();

        match recv_event(&event_rx, "frame") {
            RxEvent::Frame { msg, .. } => assert_eq!(msg.payload, b"split-me"),
            _ => panic!("expected a frame"),
        }
        handle.shutdown();
    }

    #[test]
    fn outbound_stream_sends_and_receives() {
        let (event_tx, event_rx) = channel();
        let handle = IoThread::spawn("io-out", 16 * 1024, event_tx).unwrap();

        let server = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();

        let stream = StdTcpStream::connect(addr).unwrap();
        let conn_id = handle.add_stream(stream, "broker").unwrap();
        let (mut peer, _) = server.accept().unwrap();

        handle
            .send(conn_id, ActionMessage::data(&b"out"[..]).packetize(), false)
            .unwrap();

        let mut buf = vec![0u8; 128];
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let n = peer.read(&mut buf).unwrap();
        let (msg, _) = ActionMessage::depacketize(&buf[..n]).unwrap().unwrap();
        assert_eq!(msg.payload, b"out");

        // Reverse direction rides the same registered stream.
        peer.write_all(&ActionMessage::data(&b"back"[..]).packetize())
            .unwrap();
        match recv_event(&event_rx, "frame") {
            RxEvent::Frame { conn_id: c, msg } => {
                assert_eq!(c, conn_id);
                assert_eq!(msg.payload, b"back");
            }
            _ => panic!("expected a frame"),
        }
        handle.shutdown();
    }
}
