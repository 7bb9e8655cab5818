// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 fedlink contributors

//! Process-scoped endpoint registry.
//!
//! Endpoints and brokers are reachable by name anywhere in the process.
//! Releasing a name does not destroy the endpoint immediately: the `Arc`
//! moves into a [`DelayedDestructor`] whose pre-delete hook disconnects it,
//! and the object is freed only once nothing else holds a reference. The
//! [`shutdown`] path trips the process trip line first so late destructions
//! during exit never block on threads already being reaped.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;

use super::destructor::DelayedDestructor;
use super::tripwire::TripWireTrigger;
use super::CommsInterface;

struct Registry {
    endpoints: Mutex<HashMap<String, Arc<dyn CommsInterface>>>,
    reaper: DelayedDestructor<dyn CommsInterface>,
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| Registry {
        endpoints: Mutex::new(HashMap::new()),
        reaper: DelayedDestructor::with_hook(|endpoint: &Arc<dyn CommsInterface>| {
            endpoint.disconnect();
        }),
    })
}

/// Register an endpoint under a name. Returns `false` if the name is taken.
pub fn register(name: impl Into<String>, endpoint: Arc<dyn CommsInterface>) -> bool {
    let name = name.into();
    let mut endpoints = registry().endpoints.lock();
    if endpoints.contains_key(&name) {
        return false;
    }
    endpoints.insert(name, endpoint);
    true
}

/// Look up an endpoint by name.
pub fn find(name: &str) -> Option<Arc<dyn CommsInterface>> {
    registry().endpoints.lock().get(name).cloned()
}

/// Release a name. The endpoint is parked for delayed destruction; its
/// pre-delete hook disconnects it once no external references remain.
pub fn release(name: &str) -> bool {
    let removed = registry().endpoints.lock().remove(name);
    match removed {
        Some(endpoint) => {
            registry().reaper.add(endpoint);
            true
        }
        None => false,
    }
}

/// Scan once for endpoints whose external references are gone. Returns the
/// number still parked.
pub fn cleanup() -> usize {
    registry().reaper.destroy_objects()
}

/// Scan for up to `delay`, in 50 ms slices. Returns the number still parked.
pub fn cleanup_within(delay: Duration) -> usize {
    registry().reaper.destroy_objects_within(delay)
}

/// Tear the registry down at process exit.
///
/// Trips the process trip line, releases every remaining name, and makes a
/// bounded cleanup pass; whatever is still externally held is abandoned to
/// the OS rather than blocked on.
pub fn shutdown() {
    let trigger = TripWireTrigger::new();
    trigger.trip();
    let drained: Vec<_> = registry().endpoints.lock().drain().collect();
    for (_, endpoint) in drained {
        registry().reaper.add(endpoint);
    }
    registry().reaper.destroy_objects_within(Duration::from_millis(250));
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comms::{CommsCore, ConnectionStatus};
    use crate::message::ActionMessage;
    use crate::comms::RouteId;

    /// Serialize registry tests; they share the process-wide reaper.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    /// Transport stub whose loops exit immediately.
    struct NullComms {
        core: CommsCore,
        self_ref: std::sync::Weak<NullComms>,
    }

    impl NullComms {
        fn new(name: &str) -> Arc<Self> {
            Arc::new_cyclic(|self_ref| Self {
                core: CommsCore::new(name),
                self_ref: self_ref.clone(),
            })
        }
    }

    impl CommsInterface for NullComms {
        fn core(&self) -> &CommsCore {
            &self.core
        }

        fn queue_rx_function(self: Arc<Self>) {
            self.core.rx_status().set(ConnectionStatus::Terminated);
        }

        fn queue_tx_function(self: Arc<Self>) {
            self.core.tx_status().set(ConnectionStatus::Terminated);
        }

        fn close_receiver(&self) {}

        fn endpoint_arc(&self) -> Option<Arc<dyn CommsInterface>> {
            self.self_ref
                .upgrade()
                .map(|this| this as Arc<dyn CommsInterface>)
        }

        fn address(&self) -> String {
            self.core.name().to_string()
        }
    }

    #[test]
    fn register_find_release() {
        let _guard = TEST_LOCK.lock();
        let ep = NullComms::new("reg-ep-1");
        assert!(register("reg-ep-1", ep.clone()));
        assert!(!register("reg-ep-1", ep.clone()), "duplicate names rejected");

        let found = find("reg-ep-1").expect("registered endpoint is findable");
        found.transmit(RouteId::BROKER, ActionMessage::data(&b"x"[..]));

        assert!(release("reg-ep-1"));
        assert!(find("reg-ep-1").is_none());
        assert!(!release("reg-ep-1"), "second release is a no-op");

        // Both the local Arc and the find() clone are gone; the reaper can
        // now let go of it.
        drop(found);
        drop(ep);
        assert_eq!(cleanup(), 0);
    }

    #[test]
    fn held_endpoint_survives_cleanup() {
        let _guard = TEST_LOCK.lock();
        let ep = NullComms::new("reg-ep-held");
        assert!(register("reg-ep-held", ep.clone()));
        assert!(release("reg-ep-held"));
        // `ep` is still held here, so the reaper must keep it parked.
        assert!(cleanup() >= 1);
        drop(ep);
        assert_eq!(cleanup(), 0);
    }
}
