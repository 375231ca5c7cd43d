//! Counting events and triggered operations

use crate::handle::Handle;
use crate::initiator::OpRequest;
use crate::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// `(success, failure)` pair
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CtValue {
    pub success: u64,
    pub failure: u64,
}

impl CtValue {
    pub const fn new(success: u64, failure: u64) -> Self {
        Self { success, failure }
    }

    pub const fn success(n: u64) -> Self {
        Self::new(n, 0)
    }

    pub const fn failure(n: u64) -> Self {
        Self::new(0, n)
    }

    fn total(self) -> u64 {
        self.success.saturating_add(self.failure)
    }
}

/// Deferred work attached to a counting event
pub(crate) enum TriggeredAction {
    Put(Box<OpRequest>),
    CtInc { ct: Arc<CountingEvent>, by: CtValue },
    CtSet { ct: Arc<CountingEvent>, to: CtValue },
}

struct Triggered {
    threshold: u64,
    action: TriggeredAction,
}

struct CtState {
    value: CtValue,
    retired: bool,
}

pub struct CountingEvent {
    handle: Handle,
    state: Mutex<CtState>,
    changed: Condvar,
    triggered: Mutex<Vec<Triggered>>,
    armed: AtomicU32,
}

impl CountingEvent {
    pub(crate) fn new(handle: Handle) -> Self {
        Self {
            handle,
            state: Mutex::new(CtState {
                value: CtValue::default(),
                retired: false,
            }),
            changed: Condvar::new(),
            triggered: Mutex::new(Vec::new()),
            armed: AtomicU32::new(0),
        }
    }

    pub(crate) fn handle(&self) -> Handle {
        self.handle
    }

    pub fn get(&self) -> Result<CtValue> {
        let state = self.state.lock();
        if state.retired {
            return Err(Error::InvalidHandle(self.handle.raw()));
        }
        Ok(state.value)
    }

    pub(crate) fn inc(&self, by: CtValue) {
        let mut state = self.state.lock();
        state.value.success = state.value.success.wrapping_add(by.success);
        state.value.failure = state.value.failure.wrapping_add(by.failure);
        drop(state);
        self.changed.notify_all();
    }

    pub(crate) fn set(&self, to: CtValue) {
        self.state.lock().value = to;
        self.changed.notify_all();
    }

    /// Block until `success + failure >= test`.
    pub fn wait(&self, test: u64) -> Result<CtValue> {
        let mut state = self.state.lock();
        loop {
            if state.retired {
                return Err(Error::Interrupted);
            }
            if state.value.total() >= test {
                return Ok(state.value);
            }
            self.changed.wait(&mut state);
        }
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`.
    pub fn poll(&self, test: u64, timeout: Duration) -> Result<CtValue> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.retired {
                return Err(Error::Interrupted);
            }
            if state.value.total() >= test {
                return Ok(state.value);
            }
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return if state.value.total() >= test {
                    Ok(state.value)
                } else {
                    Err(Error::CtNoneReached)
                };
            }
        }
    }

    pub(crate) fn add_trigger(&self, threshold: u64, action: TriggeredAction) {
        self.triggered.lock().push(Triggered { threshold, action });
        self.armed.fetch_add(1, Ordering::Release);
    }

    /// Triggered operations are waiting on this event
    pub(crate) fn has_triggers(&self) -> bool {
        self.armed.load(Ordering::Acquire) != 0
    }

    /// Remove and return every operation whose threshold has been reached,
    /// in registration order.
    pub(crate) fn take_ready(&self) -> Vec<TriggeredAction> {
        if !self.has_triggers() {
            return Vec::new();
        }
        let success = self.state.lock().value.success;
        let mut triggered = self.triggered.lock();
        let mut ready = Vec::new();
        let mut i = 0;
        while i < triggered.len() {
            if triggered[i].threshold <= success {
                ready.push(triggered.remove(i).action);
            } else {
                i += 1;
            }
        }
        self.armed.fetch_sub(ready.len() as u32, Ordering::Release);
        ready
    }

    /// Mark freed: waiters return `Interrupted`, pending triggers are dropped.
    /// Returns the number of discarded triggered operations.
    pub(crate) fn retire(&self) -> Result<usize> {
        let mut state = self.state.lock();
        if state.retired {
            return Err(Error::InvalidHandle(self.handle.raw()));
        }
        state.retired = true;
        drop(state);
        self.changed.notify_all();
        let discarded = std::mem::take(&mut *self.triggered.lock()).len();
        self.armed.store(0, Ordering::Release);
        Ok(discarded)
    }
}

/// Destination of counting-event increments.
///
/// The data-movement thread applies increments in place and fires any
/// triggered operations itself; application threads route increments on armed
/// events through that thread so thresholds are checked in one place.
pub(crate) trait CtSink {
    fn increment(&mut self, ct: &Arc<CountingEvent>, by: CtValue);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::HandleKind;
    use std::thread;

    fn new_ct() -> Arc<CountingEvent> {
        Arc::new(CountingEvent::new(Handle::new(HandleKind::Ct, 0, 0, 0)))
    }

    #[test]
    fn test_inc_set_get() {
        let ct = new_ct();
        ct.inc(CtValue::success(2));
        ct.inc(CtValue::failure(1));
        assert_eq!(ct.get().unwrap(), CtValue::new(2, 1));
        ct.set(CtValue::default());
        assert_eq!(ct.get().unwrap(), CtValue::default());
    }

    #[test]
    fn test_wait_counts_failures() {
        let ct = new_ct();
        let waiter = {
            let ct = Arc::clone(&ct);
            thread::spawn(move || ct.wait(2).unwrap())
        };
        ct.inc(CtValue::success(1));
        ct.inc(CtValue::failure(1));
        assert_eq!(waiter.join().unwrap(), CtValue::new(1, 1));
    }

    #[test]
    fn test_poll_timeout() {
        let ct = new_ct();
        ct.inc(CtValue::success(1));
        assert!(matches!(ct.poll(2, Duration::from_millis(5)), Err(Error::CtNoneReached)));
        assert_eq!(ct.poll(1, Duration::from_millis(5)).unwrap().success, 1);
    }

    #[test]
    fn test_triggers_fire_in_order_at_threshold() {
        let ct = new_ct();
        let other = new_ct();
        let set = TriggeredAction::CtSet {
            ct: Arc::clone(&other),
            to: CtValue::success(7),
        };
        let inc = TriggeredAction::CtInc {
            ct: Arc::clone(&other),
            by: CtValue::success(1),
        };
        ct.add_trigger(2, set);
        ct.add_trigger(1, inc);
        assert!(ct.take_ready().is_empty());
        ct.inc(CtValue::success(1));
        let ready = ct.take_ready();
        assert_eq!(ready.len(), 1);
        assert!(matches!(ready[0], TriggeredAction::CtInc { .. }));
        assert!(ct.has_triggers());
        ct.inc(CtValue::success(1));
        assert_eq!(ct.take_ready().len(), 1);
        assert!(!ct.has_triggers());
    }

    #[test]
    fn test_retire_interrupts_waiters() {
        let ct = new_ct();
        let waiter = {
            let ct = Arc::clone(&ct);
            thread::spawn(move || ct.wait(1))
        };
        thread::sleep(Duration::from_millis(10));
        assert_eq!(ct.retire().unwrap(), 0);
        assert!(matches!(waiter.join().unwrap(), Err(Error::Interrupted)));
        assert!(ct.get().is_err());
        assert!(ct.retire().is_err());
    }
}
