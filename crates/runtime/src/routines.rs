//! Routine lifecycle tracking.
//!
//! A routine is a unit of concurrent execution: it owns its own value and
//! frame stacks and shares the globals table, module cache, and open
//! channels with every other routine. Routines run on host threads; the
//! host scheduler is the only source of true concurrency.
//!
//! ## Lifecycle accounting
//!
//! - `active`: current live routines, guarded by the mutex backing the
//!   shutdown condvar so `wait_all` blocks without polling.
//! - `TOTAL_SPAWNED`-style counters are kept lock-free for diagnostics.
//!
//! A routine that panics prints a diagnostic and dies alone; the host VM
//! and its sibling routines keep running.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

#[derive(Debug, Default)]
pub struct Routines {
    active: Mutex<usize>,
    done: Condvar,
    /// Monotonic count of routines ever spawned (diagnostics only).
    spawned: AtomicU64,
    /// Monotonic count of routines that finished (diagnostics only).
    completed: AtomicU64,
}

impl Routines {
    pub fn new() -> Arc<Self> {
        Arc::new(Routines::default())
    }

    /// Spawn a routine body on a host thread. Panics inside the body are
    /// contained: they print a diagnostic and terminate only that routine.
    pub fn spawn(self: &Arc<Self>, body: impl FnOnce() + Send + 'static) {
        {
            let mut active = self
                .active
                .lock()
                .expect("routine counter lock poisoned");
            *active += 1;
        }
        self.spawned.fetch_add(1, Ordering::Relaxed);

        let tracker = Arc::clone(self);
        thread::spawn(move || {
            let result = catch_unwind(AssertUnwindSafe(body));
            if let Err(panic) = result {
                let message = panic
                    .downcast_ref::<String>()
                    .map(String::as_str)
                    .or_else(|| panic.downcast_ref::<&str>().copied())
                    .unwrap_or("unknown panic");
                eprintln!("routine panicked: {}", message);
            }
            tracker.finish();
        });
    }

    fn finish(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        let mut active = self
            .active
            .lock()
            .expect("routine counter lock poisoned");
        *active -= 1;
        if *active == 0 {
            self.done.notify_all();
        }
    }

    /// Block until every spawned routine has finished. Called by the
    /// driver after the top-level script returns so producers are never
    /// cut off mid-print.
    pub fn wait_all(&self) {
        let mut active = self
            .active
            .lock()
            .expect("routine counter lock poisoned");
        while *active > 0 {
            active = self
                .done
                .wait(active)
                .expect("routine condvar poisoned");
        }
        tracing::debug!(
            spawned = self.spawned.load(Ordering::Relaxed),
            completed = self.completed.load(Ordering::Relaxed),
            "all routines finished"
        );
    }

    pub fn active_count(&self) -> usize {
        *self
            .active
            .lock()
            .expect("routine counter lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_wait_all_blocks_until_done() {
        static RAN: AtomicUsize = AtomicUsize::new(0);
        let routines = Routines::new();
        for _ in 0..4 {
            routines.spawn(|| {
                thread::sleep(Duration::from_millis(5));
                RAN.fetch_add(1, Ordering::SeqCst);
            });
        }
        routines.wait_all();
        assert_eq!(routines.active_count(), 0);
        assert!(RAN.load(Ordering::SeqCst) >= 4);
    }

    #[test]
    fn test_panic_is_contained() {
        let routines = Routines::new();
        routines.spawn(|| panic!("boom"));
        routines.wait_all();
        assert_eq!(routines.active_count(), 0);
    }
}
