// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 fedlink contributors

//! Delayed destruction of shared-owned endpoints.
//!
//! Callbacks registered on OS handles (sockets, message queues) can fire for
//! a short window after the owning endpoint has nominally shut down. Rather
//! than force every callback to carry a back-reference, endpoints are parked
//! here and released only once this container holds the sole `Arc`; at that
//! point no callback can still be executing against them.
//!
//! The optional pre-delete hook (typically `disconnect`) always runs outside
//! the internal lock, so a hook that re-enters the destructor cannot
//! deadlock and the final drop never happens under the lock.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use super::tripwire::TripWireDetector;

type PreDeleteHook<T> = Box<dyn Fn(&Arc<T>) + Send + Sync>;

/// Container that retires `Arc`-owned objects once they are sole-owned.
pub struct DelayedDestructor<T: ?Sized> {
    elements: Mutex<Vec<Arc<T>>>,
    call_before_delete: Option<PreDeleteHook<T>>,
    trip_detect: TripWireDetector,
}

impl<T: ?Sized> Default for DelayedDestructor<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> DelayedDestructor<T> {
    /// Create a destructor with no pre-delete hook.
    pub fn new() -> Self {
        Self {
            elements: Mutex::new(Vec::new()),
            call_before_delete: None,
            trip_detect: TripWireDetector::new(),
        }
    }

    /// Create a destructor that runs `hook` on each object just before it
    /// is released.
    pub fn with_hook(hook: impl Fn(&Arc<T>) + Send + Sync + 'static) -> Self {
        Self {
            elements: Mutex::new(Vec::new()),
            call_before_delete: Some(Box::new(hook)),
            trip_detect: TripWireDetector::new(),
        }
    }

    /// Park an object for later destruction.
    pub fn add(&self, obj: Arc<T>) {
        self.elements.lock().push(obj);
    }

    /// Number of objects still parked.
    pub fn len(&self) -> usize {
        self.elements.lock().len()
    }

    /// True when nothing is parked.
    pub fn is_empty(&self) -> bool {
        self.elements.lock().is_empty()
    }

    /// Scan once and release every object whose external share count has
    /// dropped to zero (this container is the sole holder). Returns the
    /// number of objects still parked.
    pub fn destroy_objects(&self) -> usize {
        let mut release = Vec::new();
        let remaining;
        {
            let mut guard = self.elements.lock();
            guard.retain(|element| {
                if Arc::strong_count(element) == 1 {
                    release.push(Arc::clone(element));
                    false
                } else {
                    true
                }
            });
            remaining = guard.len();
        }
        // Hook and final drop happen strictly outside the lock.
        if let Some(hook) = &self.call_before_delete {
            for element in &release {
                hook(element);
            }
        }
        drop(release);
        remaining
    }

    /// Scan repeatedly for up to `delay`, in 50 ms slices, until everything
    /// releasable is gone. Returns the number of objects still parked.
    pub fn destroy_objects_within(&self, delay: Duration) -> usize {
        let slice = if delay < Duration::from_millis(100) {
            delay
        } else {
            Duration::from_millis(50)
        };
        let attempts = if delay < Duration::from_millis(100) {
            1
        } else {
            (delay.as_millis() / 50) as usize
        };

        let mut cnt = 0;
        loop {
            let remaining = self.destroy_objects();
            if remaining == 0 || cnt >= attempts {
                return remaining;
            }
            thread::sleep(slice);
            cnt += 1;
        }
    }
}

impl<T: ?Sized> Drop for DelayedDestructor<T> {
    fn drop(&mut self) {
        let mut ii = 0;
        while !self.is_empty() {
            ii += 1;
            self.destroy_objects();
            if self.is_empty() {
                break;
            }
            // A tripped line means the process is going down; do not block.
            if self.trip_detect.is_tripped() {
                return;
            }
            if ii > 4 {
                self.destroy_objects();
                break;
            }
            if ii % 2 == 0 {
                thread::sleep(Duration::from_millis(100));
            } else {
                thread::yield_now();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    struct Tracked(Arc<AtomicUsize>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn held_object_is_never_released() {
        let drops = Arc::new(AtomicUsize::new(0));
        let dd = DelayedDestructor::new();
        let held = Arc::new(Tracked(drops.clone()));
        dd.add(Arc::clone(&held));

        assert_eq!(dd.destroy_objects(), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        drop(held);
        assert_eq!(dd.destroy_objects(), 0);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hook_runs_once_per_released_object() {
        let hooked = Arc::new(AtomicUsize::new(0));
        let hooked2 = hooked.clone();
        let dd: DelayedDestructor<Tracked> =
            DelayedDestructor::with_hook(move |_| {
                hooked2.fetch_add(1, Ordering::SeqCst);
            });

        let drops = Arc::new(AtomicUsize::new(0));
        dd.add(Arc::new(Tracked(drops.clone())));
        dd.add(Arc::new(Tracked(drops.clone())));
        let held = Arc::new(Tracked(drops.clone()));
        dd.add(Arc::clone(&held));

        assert_eq!(dd.destroy_objects(), 1);
        assert_eq!(hooked.load(Ordering::SeqCst), 2);
        assert_eq!(drops.load(Ordering::SeqCst), 2);

        drop(held);
        assert_eq!(dd.destroy_objects(), 0);
        assert_eq!(hooked.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn hook_does_not_hold_the_internal_lock() {
        let dd: Arc<DelayedDestructor<Tracked>> = Arc::new(DelayedDestructor::with_hook(|_| {
            thread::sleep(Duration::from_millis(150));
        }));
        let drops = Arc::new(AtomicUsize::new(0));
        dd.add(Arc::new(Tracked(drops.clone())));

        let dd2 = Arc::clone(&dd);
        let adder = thread::spawn(move || {
            // Give the scanner time to enter the hook, then add under the lock.
            thread::sleep(Duration::from_millis(30));
            let start = Instant::now();
            dd2.add(Arc::new(Tracked(Arc::new(AtomicUsize::new(0)))));
            start.elapsed()
        });

        dd.destroy_objects();
        let elapsed = adder.join().unwrap();
        assert!(
            elapsed < Duration::from_millis(100),
            "add() blocked for {:?} while the hook ran",
            elapsed
        );
    }

    #[test]
    fn pressure_release_drains_within_budget() {
        let drops = Arc::new(AtomicUsize::new(0));
        let dd = Arc::new(DelayedDestructor::new());
        let mut held = Vec::new();
        for _ in 0..100 {
            let obj = Arc::new(Tracked(drops.clone()));
            dd.add(Arc::clone(&obj));
            held.push(obj);
        }

        let releaser = thread::spawn(move || {
            for obj in held {
                drop(obj);
                thread::sleep(Duration::from_micros(500));
            }
        });

        let deadline = Instant::now() + Duration::from_millis(500);
        let mut remaining = dd.len();
        while remaining > 0 && Instant::now() < deadline {
            remaining = dd.destroy_objects();
            thread::sleep(Duration::from_millis(20));
        }
        releaser.join().unwrap();
        assert_eq!(dd.destroy_objects(), 0);
        assert_eq!(drops.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn timed_variant_waits_for_stragglers() {
        let drops = Arc::new(AtomicUsize::new(0));
        let dd = Arc::new(DelayedDestructor::new());
        let held = Arc::new(Tracked(drops.clone()));
        dd.add(Arc::clone(&held));

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(80));
            drop(held);
        });

        assert_eq!(dd.destroy_objects_within(Duration::from_millis(400)), 0);
        releaser.join().unwrap();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}
