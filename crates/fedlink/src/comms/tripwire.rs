// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 fedlink contributors

//! Process-wide teardown trip line.
//!
//! When the runtime is being torn down, late destructions must not block on
//! threads that are already being reaped. A [`TripWireTrigger`] is held by
//! whatever owns the process lifetime (the endpoint registry here); when it
//! drops, every [`TripWireDetector`] observes the trip and shutdown paths
//! switch to best-effort.

use std::sync::atomic::{AtomicBool, Ordering};

static TRIPLINE: AtomicBool = AtomicBool::new(false);

/// Read-only view of the process trip line.
#[derive(Clone, Copy, Debug, Default)]
pub struct TripWireDetector;

impl TripWireDetector {
    /// Create a detector attached to the process trip line.
    pub fn new() -> Self {
        TripWireDetector
    }

    /// True once the trip line has fired.
    pub fn is_tripped(&self) -> bool {
        TRIPLINE.load(Ordering::Acquire)
    }
}

/// Owner handle for the process trip line; fires on drop.
#[derive(Debug, Default)]
pub struct TripWireTrigger;

impl TripWireTrigger {
    /// Create a trigger. Dropping it trips the line.
    pub fn new() -> Self {
        TripWireTrigger
    }

    /// Fire the trip line explicitly.
    pub fn trip(&self) {
        TRIPLINE.store(true, Ordering::Release);
    }
}

impl Drop for TripWireTrigger {
    fn drop(&mut self) {
        TRIPLINE.store(true, Ordering::Release);
    }
}

#[cfg(test)]
pub(crate) fn reset_for_tests() {
    TRIPLINE.store(false, Ordering::Release);
}
