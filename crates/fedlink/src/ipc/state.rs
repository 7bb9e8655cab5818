// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 fedlink contributors

//! Shared-memory state descriptor for the queue transport.
//!
//! Each owned receive queue publishes a tiny POSIX shm segment holding its
//! lifecycle state:
//!
//! ```text
//! Startup(0) ---> Operating(1) ---> Closing(2)
//! ```
//!
//! Only the receive side writes the state; peers read it to serialize
//! against receiver readiness and to stop sending once the receiver is
//! closing. The segment is the sole inter-process synchronization primitive
//! beyond the message queues themselves.

use super::{IpcError, Result};
use std::ffi::CString;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

/// Size of the state segment. One atomic word, padded to a cache line.
pub const STATE_SEGMENT_SIZE: usize = 64;

/// Longest accepted target name; keeps translated identifiers well under
/// the POSIX NAME_MAX limit.
const NAME_LIMIT: usize = 200;

/// Lifecycle state of an owned receive queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum QueueState {
    /// Queue created, receiver not yet told to operate.
    Startup = 0,
    /// Receiver accepted an operating signal; data may flow.
    Operating = 1,
    /// Receiver is going away; stop sending.
    Closing = 2,
}

/// Translate an arbitrary target string into a platform-legal queue name.
///
/// Deterministic: leading slash, fixed prefix, `[A-Za-z0-9_]` alphabet.
pub fn translate_queue_name(target: &str) -> String {
    let mut out = String::with_capacity(target.len().min(NAME_LIMIT) + 6);
    out.push_str("/fed_");
    for ch in target.chars().take(NAME_LIMIT) {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    out
}

/// Name of the state segment paired with a queue.
pub fn state_segment_name(target: &str) -> String {
    let mut name = translate_queue_name(target);
    name.push_str("_state");
    name
}

/// Mapped state segment. Unmaps on drop; the creating side also unlinks.
#[derive(Debug)]
pub struct StateSegment {
    ptr: *mut AtomicU32,
    name: String,
    owner: bool,
}

// SAFETY: the mapping holds a single AtomicU32 accessed only through atomic
// operations; the pointer itself never changes after construction.
unsafe impl Send for StateSegment {}
unsafe impl Sync for StateSegment {}

impl StateSegment {
    /// Create (replacing any stale segment) and initialize to `Startup`.
    pub fn create(name: &str) -> Result<Self> {
        let c_name = CString::new(name).map_err(|_| IpcError::InvalidName(name.to_string()))?;

        // SAFETY:
        // - c_name is a valid null-terminated CString
        // - shm_unlink of a stale segment is best-effort; errors are ignored
        // - shm_open with O_CREAT|O_RDWR|O_EXCL either creates fresh or fails
        // - 0o600 is a valid permission mask
        let fd = unsafe {
            libc::shm_unlink(c_name.as_ptr());
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                0o600 as libc::mode_t,
            )
        };
        if fd < 0 {
            return Err(IpcError::SegmentCreate(io::Error::last_os_error()));
        }

        // SAFETY: fd is the valid descriptor returned above; the size is a
        // small constant.
        let ret = unsafe { libc::ftruncate(fd, STATE_SEGMENT_SIZE as libc::off_t) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is still valid and closed exactly once on this path.
            unsafe { libc::close(fd) };
            return Err(IpcError::SegmentCreate(err));
        }

        let ptr = Self::map(fd)?;

        // SAFETY: ptr points to a zero-filled, writable mapping of at least
        // STATE_SEGMENT_SIZE bytes; AtomicU32 has alignment 4 and page-aligned
        // mappings satisfy it.
        unsafe {
            (*ptr).store(QueueState::Startup as u32, Ordering::Release);
        }

        Ok(Self {
            ptr,
            name: name.to_string(),
            owner: true,
        })
    }

    /// Open an existing segment read/write.
    pub fn open(name: &str) -> Result<Self> {
        let c_name = CString::new(name).map_err(|_| IpcError::InvalidName(name.to_string()))?;

        // SAFETY: c_name is a valid null-terminated CString; mode is ignored
        // without O_CREAT.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0 as libc::mode_t) };
        if fd < 0 {
            return Err(IpcError::SegmentOpen(io::Error::last_os_error()));
        }

        let ptr = Self::map(fd)?;
        Ok(Self {
            ptr,
            name: name.to_string(),
            owner: false,
        })
    }

    fn map(fd: libc::c_int) -> Result<*mut AtomicU32> {
        // SAFETY:
        // - null base lets the kernel pick the address
        // - the length is a small constant matching ftruncate above
        // - PROT_READ|PROT_WRITE with MAP_SHARED is the standard shared mapping
        // - fd is valid; offset 0 maps from the start
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                STATE_SEGMENT_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        // SAFETY: fd is valid; the mapping (when successful) keeps its own
        // reference, so closing here is correct on both paths.
        unsafe { libc::close(fd) };
        if ptr == libc::MAP_FAILED {
            return Err(IpcError::Mmap(io::Error::last_os_error()));
        }
        Ok(ptr.cast::<AtomicU32>())
    }

    /// Current state.
    pub fn state(&self) -> QueueState {
        // SAFETY: ptr is a valid mapping for the lifetime of self.
        let raw = unsafe { (*self.ptr).load(Ordering::Acquire) };
        match raw {
            1 => QueueState::Operating,
            2 => QueueState::Closing,
            _ => QueueState::Startup,
        }
    }

    /// Publish a new state.
    pub fn set_state(&self, state: QueueState) {
        // SAFETY: ptr is a valid mapping for the lifetime of self.
        unsafe {
            (*self.ptr).store(state as u32, Ordering::Release);
        }
    }

    /// Segment name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for StateSegment {
    fn drop(&mut self) {
        // SAFETY: ptr/len describe the mapping created in map(); unmapping
        // once on drop is correct.
        unsafe {
            libc::munmap(self.ptr.cast(), STATE_SEGMENT_SIZE);
        }
        if self.owner {
            if let Ok(c_name) = CString::new(self.name.as_str()) {
                // SAFETY: best-effort unlink of the segment this side created.
                unsafe {
                    libc::shm_unlink(c_name.as_ptr());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_translation_is_deterministic_and_legal() {
        let name = translate_queue_name("my broker/endpoint:1");
        assert_eq!(name, "/fed_my_broker_endpoint_1");
        assert_eq!(name, translate_queue_name("my broker/endpoint:1"));
        assert!(name.starts_with('/'));
        assert!(!name[1..].contains('/'));
        assert!(!name.contains(' '));
    }

    #[test]
    fn state_name_appends_suffix() {
        assert_eq!(state_segment_name("core0"), "/fed_core0_state");
    }

    #[test]
    fn long_names_are_bounded() {
        let long = "x".repeat(4096);
        assert!(translate_queue_name(&long).len() < 250);
    }

    #[test]
    fn create_open_share_state() {
        let name = "/fed_test_state_share";
        let owner = StateSegment::create(name).expect("create segment");
        assert_eq!(owner.state(), QueueState::Startup);

        let viewer = StateSegment::open(name).expect("open segment");
        assert_eq!(viewer.state(), QueueState::Startup);

        owner.set_state(QueueState::Operating);
        assert_eq!(viewer.state(), QueueState::Operating);

        owner.set_state(QueueState::Closing);
        assert_eq!(viewer.state(), QueueState::Closing);
    }

    #[test]
    fn open_missing_segment_fails() {
        assert!(StateSegment::open("/fed_test_state_missing").is_err());
    }
}
