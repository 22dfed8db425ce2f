//! Wait groups: counting latches for routine coordination.
//!
//! `wg_add` raises the counter before work is handed out, each worker calls
//! `wg_done` when finished, and `wg_wait` blocks until the counter reaches
//! zero. Event-driven via a condvar so waiting burns no CPU.

use std::sync::{Arc, Condvar, Mutex};

#[derive(Debug, Default)]
pub struct WaitGroup {
    count: Mutex<i64>,
    zero: Condvar,
}

impl WaitGroup {
    pub fn new() -> Arc<Self> {
        Arc::new(WaitGroup::default())
    }

    /// Adjust the counter by `n` (negative to mark work done).
    ///
    /// Driving the counter below zero is a caller bug and reported as an
    /// error rather than a panic so the VM can surface it with a line.
    pub fn add(&self, n: i64) -> Result<(), String> {
        let mut count = self
            .count
            .lock()
            .expect("wait group lock poisoned - a routine panicked while holding it");
        let next = *count + n;
        if next < 0 {
            return Err(format!(
                "wait group counter went negative ({} + {})",
                *count, n
            ));
        }
        *count = next;
        if next == 0 {
            self.zero.notify_all();
        }
        Ok(())
    }

    /// Equivalent to `add(-1)`.
    pub fn done(&self) -> Result<(), String> {
        self.add(-1)
    }

    /// Block until the counter reaches zero.
    pub fn wait(&self) {
        let mut count = self
            .count
            .lock()
            .expect("wait group lock poisoned - a routine panicked while holding it");
        while *count > 0 {
            count = self.zero.wait(count).expect("wait group condvar poisoned");
        }
    }

    pub fn count(&self) -> i64 {
        *self
            .count
            .lock()
            .expect("wait group lock poisoned - a routine panicked while holding it")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_wait_returns_when_zero() {
        let wg = WaitGroup::new();
        wg.add(2).unwrap();
        let worker = Arc::clone(&wg);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            worker.done().unwrap();
            worker.done().unwrap();
        });
        wg.wait();
        assert_eq!(wg.count(), 0);
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_with_zero_count_is_immediate() {
        let wg = WaitGroup::new();
        wg.wait();
    }

    #[test]
    fn test_negative_counter_is_error() {
        let wg = WaitGroup::new();
        assert!(wg.done().is_err());
    }
}
