//! Channels for CSP-style concurrency.
//!
//! Channels are the only communication mechanism between routines. A
//! channel is a typed conduit (typing is enforced by the compiler; the
//! conduit itself is untyped) with a fixed capacity. Capacity 0 means a
//! synchronous rendezvous: `send` does not return until a receiver has
//! taken the value.
//!
//! ## Close semantics
//!
//! `close` marks the channel closed. Sends after close fail; receives
//! drain whatever is buffered and then return nothing. `is_closed` reports
//! the flag regardless of buffered values.
//!
//! ## Select support
//!
//! The VM's `when` operator polls channels with [`Channel::try_send`] /
//! [`Channel::try_recv`] and, when nothing is ready, registers a
//! [`SelectWaker`] on every involved channel. Any state change (send,
//! receive, close) fires the registered wakers, so a blocked select
//! re-polls exactly when something could have become ready.
//!
//! Locks are never held across a blocking wait other than the condvar
//! waits themselves; wakers are fired while holding the state lock, which
//! is safe because firing only flips a flag and notifies.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use crate::value::Value;

/// Error returned by operations on a closed channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelClosed;

impl std::fmt::Display for ChannelClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "channel is closed")
    }
}

impl std::error::Error for ChannelClosed {}

/// Result of a non-blocking send attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum TrySend {
    Sent,
    Full,
    Closed,
}

/// Result of a non-blocking receive attempt.
#[derive(Debug, PartialEq)]
pub enum TryRecv {
    Value(Value),
    Empty,
    Closed,
}

#[derive(Debug)]
struct ChanState {
    queue: VecDeque<Value>,
    closed: bool,
    /// Receivers currently blocked in `recv` (rendezvous `try_send` needs
    /// to know whether a hand-off partner exists).
    recv_waiting: usize,
    /// Values taken by receivers, ever. Rendezvous senders wait for their
    /// ticket to be overtaken by this counter.
    taken: u64,
    /// Rendezvous tickets issued, ever.
    parked: u64,
    waiters: Vec<Arc<SelectWaker>>,
}

/// A buffered or rendezvous conduit carrying [`Value`]s.
#[derive(Debug)]
pub struct Channel {
    capacity: usize,
    state: Mutex<ChanState>,
    /// Signalled when buffer space frees or a rendezvous hand-off completes.
    space: Condvar,
    /// Signalled when a value arrives or the channel closes.
    ready: Condvar,
}

impl Channel {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Channel {
            capacity,
            state: Mutex::new(ChanState {
                queue: VecDeque::new(),
                closed: false,
                recv_waiting: 0,
                taken: 0,
                parked: 0,
                waiters: Vec::new(),
            }),
            space: Condvar::new(),
            ready: Condvar::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChanState> {
        self.state
            .lock()
            .expect("channel state lock poisoned - a routine panicked while holding it")
    }

    fn wake_waiters(state: &ChanState) {
        for waiter in &state.waiters {
            waiter.fire();
        }
    }

    /// Send a value, blocking until there is buffer space (buffered) or a
    /// receiver has taken the value (rendezvous).
    pub fn send(&self, value: Value) -> Result<(), ChannelClosed> {
        let mut state = self.lock();
        if self.capacity == 0 {
            // Rendezvous: park at most one value, then wait for a receiver
            // to take ours.
            while !state.closed && !state.queue.is_empty() {
                state = self.space.wait(state).expect("channel condvar poisoned");
            }
            if state.closed {
                return Err(ChannelClosed);
            }
            let ticket = state.parked;
            state.parked += 1;
            state.queue.push_back(value);
            Self::wake_waiters(&state);
            self.ready.notify_one();
            while !state.closed && state.taken <= ticket {
                state = self.space.wait(state).expect("channel condvar poisoned");
            }
            if state.taken > ticket {
                Ok(())
            } else {
                // Closed while our value was still parked; withdraw it so a
                // failed send is never observed.
                let pos = (ticket - state.taken) as usize;
                if pos < state.queue.len() {
                    state.queue.remove(pos);
                    state.parked -= 1;
                }
                Err(ChannelClosed)
            }
        } else {
            while !state.closed && state.queue.len() >= self.capacity {
                state = self.space.wait(state).expect("channel condvar poisoned");
            }
            if state.closed {
                return Err(ChannelClosed);
            }
            state.queue.push_back(value);
            Self::wake_waiters(&state);
            self.ready.notify_one();
            Ok(())
        }
    }

    /// Receive a value, blocking until one arrives. Returns None when the
    /// channel is closed and its buffer drained.
    pub fn recv(&self) -> Option<Value> {
        let mut state = self.lock();
        state.recv_waiting += 1;
        loop {
            if let Some(value) = state.queue.pop_front() {
                state.recv_waiting -= 1;
                state.taken += 1;
                Self::wake_waiters(&state);
                // notify_all: rendezvous senders wait on distinct tickets.
                self.space.notify_all();
                return Some(value);
            }
            if state.closed {
                state.recv_waiting -= 1;
                return None;
            }
            state = self.ready.wait(state).expect("channel condvar poisoned");
        }
    }

    /// Non-blocking send used by select polling.
    pub fn try_send(&self, value: Value) -> TrySend {
        let mut state = self.lock();
        if state.closed {
            return TrySend::Closed;
        }
        let can_send = if self.capacity == 0 {
            state.recv_waiting > 0 && state.queue.is_empty()
        } else {
            state.queue.len() < self.capacity
        };
        if !can_send {
            return TrySend::Full;
        }
        if self.capacity == 0 {
            state.parked += 1;
        }
        state.queue.push_back(value);
        Self::wake_waiters(&state);
        self.ready.notify_one();
        TrySend::Sent
    }

    /// Non-blocking receive used by select polling.
    pub fn try_recv(&self) -> TryRecv {
        let mut state = self.lock();
        if let Some(value) = state.queue.pop_front() {
            state.taken += 1;
            Self::wake_waiters(&state);
            self.space.notify_all();
            return TryRecv::Value(value);
        }
        if state.closed {
            TryRecv::Closed
        } else {
            TryRecv::Empty
        }
    }

    /// Mark the channel closed and wake everything blocked on it.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        Self::wake_waiters(&state);
        self.ready.notify_all();
        self.space.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Buffered values awaiting a receiver (diagnostics only).
    pub fn queue_depth(&self) -> usize {
        self.lock().queue.len()
    }

    /// Register a select waiter; fired on every subsequent state change.
    pub fn register_waiter(&self, waker: &Arc<SelectWaker>) {
        self.lock().waiters.push(Arc::clone(waker));
    }

    /// Remove a previously registered select waiter.
    pub fn unregister_waiter(&self, waker: &Arc<SelectWaker>) {
        self.lock().waiters.retain(|w| !Arc::ptr_eq(w, waker));
    }
}

/// One-shot-resettable notification flag a blocked select waits on.
#[derive(Debug, Default)]
pub struct SelectWaker {
    fired: Mutex<bool>,
    cv: Condvar,
}

impl SelectWaker {
    pub fn new() -> Arc<Self> {
        Arc::new(SelectWaker::default())
    }

    /// Block until fired, then reset the flag for the next round.
    pub fn wait(&self) {
        let mut fired = self
            .fired
            .lock()
            .expect("select waker lock poisoned");
        while !*fired {
            fired = self.cv.wait(fired).expect("select waker condvar poisoned");
        }
        *fired = false;
    }

    pub fn fire(&self) {
        let mut fired = self
            .fired
            .lock()
            .expect("select waker lock poisoned");
        *fired = true;
        self.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_buffered_send_recv() {
        let chan = Channel::new(2);
        chan.send(Value::Int(1)).unwrap();
        chan.send(Value::Int(2)).unwrap();
        assert_eq!(chan.recv(), Some(Value::Int(1)));
        assert_eq!(chan.recv(), Some(Value::Int(2)));
    }

    #[test]
    fn test_closed_channel_drains_then_none() {
        let chan = Channel::new(4);
        chan.send(Value::Int(7)).unwrap();
        chan.close();
        assert!(chan.is_closed());
        assert_eq!(chan.recv(), Some(Value::Int(7)));
        assert_eq!(chan.recv(), None);
        assert_eq!(chan.send(Value::Int(8)), Err(ChannelClosed));
    }

    #[test]
    fn test_rendezvous_blocks_until_taken() {
        let chan = Channel::new(0);
        let side = Arc::clone(&chan);
        let handle = thread::spawn(move || {
            // Give the sender time to park.
            thread::sleep(Duration::from_millis(20));
            side.recv()
        });
        chan.send(Value::Int(42)).unwrap();
        assert_eq!(handle.join().unwrap(), Some(Value::Int(42)));
    }

    #[test]
    fn test_rendezvous_ordered_handoff() {
        let chan = Channel::new(0);
        let mut handles = Vec::new();
        for i in 0..3 {
            let side = Arc::clone(&chan);
            handles.push(thread::spawn(move || side.send(Value::Int(i)).unwrap()));
        }
        let mut got = Vec::new();
        for _ in 0..3 {
            if let Some(Value::Int(n)) = chan.recv() {
                got.push(n);
            }
        }
        for handle in handles {
            handle.join().unwrap();
        }
        got.sort_unstable();
        assert_eq!(got, vec![0, 1, 2]);
    }

    #[test]
    fn test_try_send_full_and_closed() {
        let chan = Channel::new(1);
        assert_eq!(chan.try_send(Value::Int(1)), TrySend::Sent);
        assert_eq!(chan.try_send(Value::Int(2)), TrySend::Full);
        chan.close();
        assert_eq!(chan.try_send(Value::Int(3)), TrySend::Closed);
    }

    #[test]
    fn test_try_recv_states() {
        let chan = Channel::new(1);
        assert_eq!(chan.try_recv(), TryRecv::Empty);
        chan.send(Value::Int(5)).unwrap();
        assert_eq!(chan.try_recv(), TryRecv::Value(Value::Int(5)));
        chan.close();
        assert_eq!(chan.try_recv(), TryRecv::Closed);
    }

    #[test]
    fn test_rendezvous_try_send_needs_receiver() {
        let chan = Channel::new(0);
        assert_eq!(chan.try_send(Value::Int(1)), TrySend::Full);
    }

    #[test]
    fn test_waiter_fires_on_send() {
        let chan = Channel::new(1);
        let waker = SelectWaker::new();
        chan.register_waiter(&waker);
        let side = Arc::clone(&chan);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            side.send(Value::Int(9)).unwrap();
        });
        waker.wait();
        handle.join().unwrap();
        chan.unregister_waiter(&waker);
        assert_eq!(chan.try_recv(), TryRecv::Value(Value::Int(9)));
    }

    #[test]
    fn test_waiter_fires_on_close() {
        let chan = Channel::new(0);
        let waker = SelectWaker::new();
        chan.register_waiter(&waker);
        let side = Arc::clone(&chan);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            side.close();
        });
        waker.wait();
        handle.join().unwrap();
    }

    #[test]
    fn test_send_blocked_then_closed_errors() {
        let chan = Channel::new(1);
        chan.send(Value::Int(1)).unwrap();
        let side = Arc::clone(&chan);
        let handle = thread::spawn(move || side.send(Value::Int(2)));
        thread::sleep(Duration::from_millis(20));
        chan.close();
        assert_eq!(handle.join().unwrap(), Err(ChannelClosed));
    }
}
