//! Cross-process wakeup for the blocking queue variant.
//!
//! The consumer bumps `frustration` on every empty poll and resets it once it
//! finds work. Producers that observe a non-zero frustration ring the bell by
//! bumping `word`; once frustration has reached the sleep threshold they also
//! issue a futex wake. The futex lives in the shared mapping, so a
//! non-private futex reaches a consumer in another process.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Doorbell as laid out in shared memory (one cache line)
#[repr(C, align(64))]
pub struct Doorbell {
    frustration: AtomicU32,
    word: AtomicU32,
    threshold: AtomicU32,
}

const _: () = assert!(std::mem::size_of::<Doorbell>() == crate::layout::CACHE_LINE_SIZE);

impl Doorbell {
    pub const fn new() -> Self {
        Self {
            frustration: AtomicU32::new(0),
            word: AtomicU32::new(0),
            threshold: AtomicU32::new(u32::MAX),
        }
    }

    /// Reset; called once by the owner before its queues are used.
    pub fn init(&self, threshold: u32) {
        self.frustration.store(0, Ordering::Relaxed);
        self.word.store(0, Ordering::Relaxed);
        self.threshold.store(threshold.max(1), Ordering::Release);
    }

    /// Producer side, called after an enqueue has been published.
    pub fn ring(&self) {
        let frustration = self.frustration.load(Ordering::SeqCst);
        if frustration == 0 {
            return;
        }
        self.word.fetch_add(1, Ordering::SeqCst);
        if frustration >= self.threshold.load(Ordering::Relaxed) {
            futex_wake(&self.word);
        }
    }

    /// Consumer found work.
    #[inline]
    pub fn satisfied(&self) {
        if self.frustration.load(Ordering::Relaxed) != 0 {
            self.frustration.store(0, Ordering::Relaxed);
        }
    }

    /// Consumer found nothing.
    ///
    /// Returns `Some(token)` once the sleep threshold is reached. The caller
    /// must recheck its queues and only then pass the token to
    /// [`sleep`](Self::sleep).
    pub fn frustrated(&self) -> Option<u32> {
        let frustration = self.frustration.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        if frustration >= self.threshold.load(Ordering::Relaxed) {
            Some(self.word.load(Ordering::SeqCst))
        } else {
            None
        }
    }

    /// Sleep until rung or `timeout` elapses, unless rung since `token`.
    pub fn sleep(&self, token: u32, timeout: Duration) {
        if self.word.load(Ordering::SeqCst) != token {
            return;
        }
        futex_wait(&self.word, token, timeout);
    }
}

impl Default for Doorbell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
fn futex_wait(word: &AtomicU32, expected: u32, timeout: Duration) {
    let ts = libc::timespec {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as libc::c_long,
    };
    // Safety: `word` is a valid, aligned u32 for the duration of the call.
    // EAGAIN, EINTR and ETIMEDOUT all just return to the poll loop.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32,
            libc::FUTEX_WAIT,
            expected,
            &ts as *const libc::timespec,
        );
    }
}

#[cfg(target_os = "linux")]
fn futex_wake(word: &AtomicU32) {
    // Safety: as above
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32,
            libc::FUTEX_WAKE,
            i32::MAX,
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn futex_wait(word: &AtomicU32, expected: u32, timeout: Duration) {
    let deadline = std::time::Instant::now() + timeout;
    while word.load(Ordering::Acquire) == expected && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_micros(100));
    }
}

#[cfg(not(target_os = "linux"))]
fn futex_wake(_word: &AtomicU32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_threshold() {
        let bell = Doorbell::new();
        bell.init(3);
        assert!(bell.frustrated().is_none());
        assert!(bell.frustrated().is_none());
        assert!(bell.frustrated().is_some());
        bell.satisfied();
        assert!(bell.frustrated().is_none());
    }

    #[test]
    fn test_ring_without_frustration_is_silent() {
        let bell = Doorbell::new();
        bell.init(1);
        bell.ring();
        let token = bell.frustrated().unwrap();
        // Nothing rang after the token was taken: a short sleep times out
        let start = Instant::now();
        bell.sleep(token, Duration::from_millis(20));
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn test_ring_after_token_skips_sleep() {
        let bell = Doorbell::new();
        bell.init(1);
        let token = bell.frustrated().unwrap();
        bell.ring();
        let start = Instant::now();
        bell.sleep(token, Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_wake_sleeping_consumer() {
        let bell = Arc::new(Doorbell::new());
        bell.init(1);
        let token = bell.frustrated().unwrap();
        let waker = {
            let bell = Arc::clone(&bell);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                bell.ring();
            })
        };
        let start = Instant::now();
        bell.sleep(token, Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(4));
        waker.join().unwrap();
    }
}
