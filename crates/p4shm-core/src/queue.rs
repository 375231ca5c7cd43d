//! NEMESIS multiple-producer/single-consumer queue
//!
//! Elements are linked through an `AtomicU64` holding a [`RelRef`] at offset 0
//! of the element. Any process may enqueue; only the owning data-movement
//! thread dequeues.

use crate::layout::CachePadded;
use crate::offset::{BaseTable, RelRef};
use std::hint::spin_loop;
use std::sync::atomic::{AtomicU64, Ordering};

/// Queue header as laid out in shared memory.
///
/// `tail` is written by producers and `head`/`shadow_head` by the consumer
/// (`head` also by the producer that finds the queue empty); each sits on its
/// own cache line.
#[repr(C)]
pub struct QueueHeader {
    head: CachePadded<AtomicU64>,
    tail: CachePadded<AtomicU64>,
    shadow_head: CachePadded<AtomicU64>,
}

const _: () = assert!(std::mem::size_of::<QueueHeader>() == 3 * crate::layout::CACHE_LINE_SIZE);

impl QueueHeader {
    pub const fn new() -> Self {
        Self {
            head: CachePadded::new(AtomicU64::new(0)),
            tail: CachePadded::new(AtomicU64::new(0)),
            shadow_head: CachePadded::new(AtomicU64::new(0)),
        }
    }
}

impl Default for QueueHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// A queue header bound to the base table used to follow its links.
#[derive(Clone, Copy)]
pub struct Queue<'a> {
    hdr: &'a QueueHeader,
    bases: &'a BaseTable,
}

impl<'a> Queue<'a> {
    /// # Safety
    /// Every reference ever enqueued must resolve through `bases` to an
    /// element whose first eight bytes are its link word.
    pub unsafe fn new(hdr: &'a QueueHeader, bases: &'a BaseTable) -> Self {
        Self { hdr, bases }
    }

    /// Reset to empty. No concurrent access allowed.
    pub fn init(&self) {
        self.hdr.head.store(0, Ordering::Relaxed);
        self.hdr.tail.store(0, Ordering::Relaxed);
        self.hdr.shadow_head.store(0, Ordering::Relaxed);
    }

    #[inline]
    fn link(&self, r: RelRef) -> &AtomicU64 {
        // Safety: guaranteed by the contract of `Queue::new`
        unsafe { &*(self.bases.resolve(r) as *const AtomicU64) }
    }

    /// Append `entry`. Safe to call from any number of producers.
    pub fn enqueue(&self, entry: RelRef) {
        debug_assert!(!entry.is_null());
        self.link(entry).store(0, Ordering::Relaxed);
        let prev = RelRef::from_raw(self.hdr.tail.swap(entry.raw(), Ordering::SeqCst));
        if prev.is_null() {
            self.hdr.head.store(entry.raw(), Ordering::Release);
        } else {
            self.link(prev).store(entry.raw(), Ordering::Release);
        }
    }

    /// Remove the oldest element. Consumer only.
    pub fn dequeue(&self) -> Option<RelRef> {
        let mut e = self.hdr.shadow_head.load(Ordering::Relaxed);
        if e == 0 {
            e = self.hdr.head.load(Ordering::Acquire);
            if e == 0 {
                return None;
            }
            self.hdr.head.store(0, Ordering::Relaxed);
        }
        let entry = RelRef::from_raw(e);
        let link = self.link(entry);

        let next = link.load(Ordering::Acquire);
        if next != 0 {
            self.hdr.shadow_head.store(next, Ordering::Relaxed);
        } else {
            self.hdr.shadow_head.store(0, Ordering::Relaxed);
            if self
                .hdr
                .tail
                .compare_exchange(e, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // A producer swapped `tail` but has not linked us yet
                let next = loop {
                    let n = link.load(Ordering::Acquire);
                    if n != 0 {
                        break n;
                    }
                    spin_loop();
                };
                self.hdr.shadow_head.store(next, Ordering::Relaxed);
            }
        }
        link.store(0, Ordering::Relaxed);
        Some(entry)
    }

    /// Whether a dequeue could observe an element now or shortly.
    ///
    /// Counts in-flight enqueues that have swapped `tail` but not yet
    /// published their link, which is what the doorbell recheck needs.
    pub fn has_pending(&self) -> bool {
        self.hdr.shadow_head.load(Ordering::Relaxed) != 0
            || self.hdr.tail.load(Ordering::SeqCst) != 0
    }
}
