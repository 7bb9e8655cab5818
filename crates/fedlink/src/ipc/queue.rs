// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 fedlink contributors

//! POSIX message-queue wrappers for the queue transport.
//!
//! [`OwnedQueue`] is the receive side: it creates the named queue plus the
//! paired shared-memory state segment and pumps blocking receives.
//! [`SendQueue`] opens a peer's queue in send mode, watching that peer's
//! state segment so it stops delivering once the receiver is closing.
//!
//! Queue depth and message size come from the endpoint configuration; when
//! the kernel rejects them (default `fs.mqueue` rlimits for unprivileged
//! processes) creation falls back once to conservative attributes before
//! giving up.

use super::state::{state_segment_name, translate_queue_name, QueueState, StateSegment};
use super::{IpcError, Result};
use crate::message::{is_disconnect_command, is_priority_command, ActionMessage};
use std::ffi::CString;
use std::io;
use std::thread;
use std::time::Duration;

/// Fallback queue depth when the configured attributes are rejected.
const FALLBACK_MAX_MESSAGES: i64 = 10;

/// Fallback message size when the configured attributes are rejected.
const FALLBACK_MESSAGE_SIZE: i64 = 8192;

/// Delay between open attempts on a queue that does not exist yet.
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Budget a sender spends waiting for a remote receiver to reach
/// `Operating` before delivering plain data anyway.
const OPERATING_WAIT: Duration = Duration::from_millis(5000);

fn last_os_error() -> io::Error {
    io::Error::last_os_error()
}

// ============================================================================
// OwnedQueue (receive side)
// ============================================================================

/// The receive side of a named message queue, plus its state segment.
pub struct OwnedQueue {
    mqd: libc::mqd_t,
    queue_name: String,
    state: StateSegment,
    msg_size: usize,
}

// SAFETY: a message-queue descriptor may be used from any thread; this
// wrapper performs no descriptor-state mutation besides close-on-drop.
unsafe impl Send for OwnedQueue {}
unsafe impl Sync for OwnedQueue {}

impl OwnedQueue {
    /// Create the queue and its state segment, replacing stale leftovers.
    pub fn create(target: &str, max_count: usize, max_size: usize) -> Result<Self> {
        let queue_name = translate_queue_name(target);
        let c_name =
            CString::new(queue_name.as_str()).map_err(|_| IpcError::InvalidName(queue_name.clone()))?;

        // SAFETY: best-effort removal of a stale queue from a crashed run.
        unsafe {
            libc::mq_unlink(c_name.as_ptr());
        }

        let attempts = [
            (max_count as i64, max_size as i64),
            (FALLBACK_MAX_MESSAGES, FALLBACK_MESSAGE_SIZE),
        ];
        let mut mqd: libc::mqd_t = -1 as libc::mqd_t;
        let mut last_err = io::Error::from(io::ErrorKind::Other);
        for (i, (maxmsg, msgsize)) in attempts.iter().enumerate() {
            // SAFETY: mq_attr is plain-old-data; zeroing then setting the
            // two relevant fields is the documented initialization.
            let mut attr: libc::mq_attr = unsafe { std::mem::zeroed() };
            attr.mq_maxmsg = *maxmsg;
            attr.mq_msgsize = *msgsize;

            // SAFETY: c_name is a valid CString; with O_CREAT the mode and
            // attr pointer are read by the kernel; attr outlives the call.
            let fd = unsafe {
                libc::mq_open(
                    c_name.as_ptr(),
                    libc::O_RDONLY | libc::O_CREAT | libc::O_EXCL,
                    0o600 as libc::mode_t,
                    &mut attr as *mut libc::mq_attr,
                )
            };
            if fd != -1 as libc::mqd_t {
                mqd = fd;
                break;
            }
            last_err = last_os_error();
            let retryable = matches!(
                last_err.raw_os_error(),
                Some(libc::EINVAL) | Some(libc::ENOMEM) | Some(libc::EPERM)
            );
            if i + 1 < attempts.len() && retryable {
                log::warn!(
                    "queue attributes {}x{} rejected ({}), retrying with {}x{}",
                    maxmsg,
                    msgsize,
                    last_err,
                    FALLBACK_MAX_MESSAGES,
                    FALLBACK_MESSAGE_SIZE
                );
                continue;
            }
            break;
        }
        if mqd == -1 as libc::mqd_t {
            return Err(IpcError::QueueCreate(last_err));
        }

        // Read back the granted attributes; the receive buffer must cover
        // the actual message size.
        // SAFETY: mqd is valid; attr is a plain output struct.
        let mut granted: libc::mq_attr = unsafe { std::mem::zeroed() };
        let ret = unsafe { libc::mq_getattr(mqd, &mut granted) };
        if ret < 0 {
            let err = last_os_error();
            // SAFETY: mqd is valid and closed exactly once on this path.
            unsafe {
                libc::mq_close(mqd);
                libc::mq_unlink(c_name.as_ptr());
            }
            return Err(IpcError::QueueCreate(err));
        }

        let state = match StateSegment::create(&state_segment_name(target)) {
            Ok(state) => state,
            Err(e) => {
                // SAFETY: mqd is valid and closed exactly once on this path.
                unsafe {
                    libc::mq_close(mqd);
                    libc::mq_unlink(c_name.as_ptr());
                }
                return Err(e);
            }
        };

        Ok(Self {
            mqd,
            queue_name,
            state,
            msg_size: granted.mq_msgsize as usize,
        })
    }

    /// Block for the next message. Returns the raw bytes and its priority.
    pub fn receive(&self) -> Result<(Vec<u8>, u32)> {
        let mut buf = vec![0u8; self.msg_size];
        let mut priority: libc::c_uint = 0;
        loop {
            // SAFETY: buf is at least mq_msgsize bytes, as mq_receive
            // requires; priority is a valid out-pointer.
            let n = unsafe {
                libc::mq_receive(
                    self.mqd,
                    buf.as_mut_ptr().cast::<libc::c_char>(),
                    buf.len(),
                    &mut priority,
                )
            };
            if n >= 0 {
                buf.truncate(n as usize);
                return Ok((buf, priority));
            }
            let err = last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(IpcError::Receive(err));
        }
    }

    /// Publish a new lifecycle state for this queue.
    pub fn change_state(&self, state: QueueState) {
        self.state.set_state(state);
    }

    /// Translated queue name.
    pub fn name(&self) -> &str {
        &self.queue_name
    }

    /// Granted per-message size.
    pub fn message_size(&self) -> usize {
        self.msg_size
    }
}

impl Drop for OwnedQueue {
    fn drop(&mut self) {
        // SAFETY: mqd is the descriptor created in `create`; close and
        // unlink once. Open send-side descriptors keep working until closed.
        unsafe {
            libc::mq_close(self.mqd);
        }
        if let Ok(c_name) = CString::new(self.queue_name.as_str()) {
            // SAFETY: best-effort unlink of the name this side created.
            unsafe {
                libc::mq_unlink(c_name.as_ptr());
            }
        }
    }
}

// ============================================================================
// SendQueue (transmit side)
// ============================================================================

/// Send-mode handle on a peer's queue.
#[derive(Debug)]
pub struct SendQueue {
    mqd: libc::mqd_t,
    queue_name: String,
    /// Peer state segment; absent when the peer has not published one.
    state: Option<StateSegment>,
    /// Remote peers gate plain data on the `Operating` state.
    remote: bool,
    msg_size: usize,
}

// SAFETY: see OwnedQueue; descriptors are thread-safe.
unsafe impl Send for SendQueue {}
unsafe impl Sync for SendQueue {}

impl SendQueue {
    /// Open a peer queue in send mode, retrying while it does not exist.
    ///
    /// `remote` marks queues owned by another endpoint (broker, routes);
    /// sends of plain data to those wait for the peer to reach `Operating`.
    pub fn open(target: &str, retries: u32, remote: bool) -> Result<Self> {
        let queue_name = translate_queue_name(target);
        let c_name =
            CString::new(queue_name.as_str()).map_err(|_| IpcError::InvalidName(queue_name.clone()))?;

        let mut attempt = 0;
        let mqd = loop {
            // SAFETY: c_name is a valid CString; no attr argument is needed
            // without O_CREAT.
            let fd = unsafe { libc::mq_open(c_name.as_ptr(), libc::O_WRONLY) };
            if fd != -1 as libc::mqd_t {
                break fd;
            }
            let err = last_os_error();
            if err.raw_os_error() == Some(libc::ENOENT) && attempt < retries {
                attempt += 1;
                thread::sleep(OPEN_RETRY_DELAY);
                continue;
            }
            return Err(IpcError::QueueOpen(err));
        };

        // SAFETY: mqd is valid; attr is a plain output struct.
        let mut granted: libc::mq_attr = unsafe { std::mem::zeroed() };
        let ret = unsafe { libc::mq_getattr(mqd, &mut granted) };
        if ret < 0 {
            let err = last_os_error();
            // SAFETY: mqd is valid and closed exactly once on this path.
            unsafe { libc::mq_close(mqd) };
            return Err(IpcError::QueueOpen(err));
        }

        let state = StateSegment::open(&state_segment_name(target)).ok();
        Ok(Self {
            mqd,
            queue_name,
            state,
            remote,
            msg_size: granted.mq_msgsize as usize,
        })
    }

    /// Peer state, when the peer published a segment.
    pub fn peer_state(&self) -> Option<QueueState> {
        self.state.as_ref().map(StateSegment::state)
    }

    /// Send one message at the given priority.
    ///
    /// Refuses traffic to a closing receiver (except close traffic itself)
    /// and, for remote peers, delays plain data until the receiver reports
    /// `Operating`.
    pub fn send(&self, msg: &ActionMessage, priority: u32) -> Result<()> {
        if let Some(state) = self.peer_state() {
            if state == QueueState::Closing && !is_disconnect_command(msg) {
                return Err(IpcError::ReceiverClosing(self.queue_name.clone()));
            }
            if self.remote && state == QueueState::Startup && !is_priority_command(msg) {
                self.wait_for_operating();
            }
        }

        let bytes = msg.packetize();
        if bytes.len() > self.msg_size {
            return Err(IpcError::Send(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "message of {} bytes exceeds queue message size {}",
                    bytes.len(),
                    self.msg_size
                ),
            )));
        }

        loop {
            // SAFETY: bytes points at len valid bytes for the duration of
            // the call.
            let ret = unsafe {
                libc::mq_send(
                    self.mqd,
                    bytes.as_ptr().cast::<libc::c_char>(),
                    bytes.len(),
                    priority,
                )
            };
            if ret == 0 {
                return Ok(());
            }
            let err = last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(IpcError::Send(err));
        }
    }

    fn wait_for_operating(&self) {
        let Some(state) = &self.state else { return };
        let mut waited = Duration::ZERO;
        while state.state() == QueueState::Startup && waited < OPERATING_WAIT {
            thread::sleep(Duration::from_millis(10));
            waited += Duration::from_millis(10);
        }
        if state.state() == QueueState::Startup {
            log::warn!(
                "receiver {} never reached operating; sending anyway",
                self.queue_name
            );
        }
    }

    /// Translated queue name.
    pub fn name(&self) -> &str {
        &self.queue_name
    }
}

impl Drop for SendQueue {
    fn drop(&mut self) {
        // SAFETY: mqd is the descriptor opened in `open`; closed once here.
        unsafe {
            libc::mq_close(self.mqd);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message;

    #[test]
    fn create_send_receive_roundtrip() {
        let target = "fedlink_qtest_roundtrip";
        let owned = match OwnedQueue::create(target, 4, 2048) {
            Ok(q) => q,
            Err(IpcError::QueueCreate(e)) if e.raw_os_error() == Some(libc::ENOSYS) => {
                // Kernel without POSIX mq support; nothing to test here.
                return;
            }
            Err(e) => panic!("queue create failed: {}", e),
        };
        let sender = SendQueue::open(target, 0, false).expect("open send side");

        let msg = ActionMessage::data(&b"over-the-queue"[..]);
        sender.send(&msg, 1).expect("send");

        let (bytes, priority) = owned.receive().expect("receive");
        assert_eq!(priority, 1);
        let (got, _) = ActionMessage::depacketize(&bytes).unwrap().unwrap();
        assert_eq!(got.payload, b"over-the-queue");
    }

    #[test]
    fn priority_orders_delivery() {
        let target = "fedlink_qtest_priority";
        let owned = match OwnedQueue::create(target, 8, 2048) {
            Ok(q) => q,
            Err(_) => return,
        };
        let sender = SendQueue::open(target, 0, false).expect("open send side");

        sender
            .send(&ActionMessage::data(&b"low"[..]), 1)
            .expect("send low");
        let mut urgent = ActionMessage::protocol(message::SET_TO_OPERATING);
        urgent.payload = b"high".to_vec();
        sender.send(&urgent, 3).expect("send high");

        let (first, p1) = owned.receive().expect("first");
        assert_eq!(p1, 3);
        let (msg, _) = ActionMessage::depacketize(&first).unwrap().unwrap();
        assert_eq!(msg.payload, b"high");

        let (_, p2) = owned.receive().expect("second");
        assert_eq!(p2, 1);
    }

    #[test]
    fn closing_receiver_refuses_plain_traffic() {
        let target = "fedlink_qtest_closing";
        let owned = match OwnedQueue::create(target, 4, 2048) {
            Ok(q) => q,
            Err(_) => return,
        };
        let sender = SendQueue::open(target, 0, true).expect("open send side");

        owned.change_state(QueueState::Closing);
        let err = sender
            .send(&ActionMessage::data(&b"late"[..]), 1)
            .expect_err("closing receiver must refuse data");
        assert!(matches!(err, IpcError::ReceiverClosing(_)));

        // Close traffic still passes so the receiver can drain out.
        sender
            .send(&ActionMessage::protocol(message::CLOSE_RECEIVER), 3)
            .expect("close traffic passes");
    }

    #[test]
    fn missing_queue_open_fails_after_retries() {
        let err = SendQueue::open("fedlink_qtest_absent", 1, false)
            .expect_err("open of a missing queue must fail");
        assert!(matches!(err, IpcError::QueueOpen(_)));
    }
}
