//! Lock-free free list of slot indices (tagged Treiber stack).
//!
//! The head packs a generation in the upper 32 bits and `index + 1` in the
//! lower 32 bits, with 0 meaning empty. Each slot stores the packed index of
//! its successor in its own link word. Every push and pop bumps the
//! generation, so a head that was popped and pushed back between a reader's
//! load and its CAS is still detected.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Access to the per-slot link words of a pool
pub trait SlotLinks {
    fn link(&self, index: u32) -> &AtomicU32;
}

#[repr(transparent)]
pub struct FreeListHead(AtomicU64);

#[inline]
fn pack(generation: u32, link: u32) -> u64 {
    ((generation as u64) << 32) | link as u64
}

#[inline]
fn unpack(raw: u64) -> (u32, u32) {
    ((raw >> 32) as u32, raw as u32)
}

impl FreeListHead {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn init(&self) {
        self.0.store(0, Ordering::Relaxed);
    }

    /// Push slot `index`. The caller must own the slot.
    pub fn push<L: SlotLinks + ?Sized>(&self, links: &L, index: u32) {
        let link = links.link(index);
        let mut cur = self.0.load(Ordering::Relaxed);
        loop {
            let (generation, top) = unpack(cur);
            link.store(top, Ordering::Relaxed);
            let new = pack(generation.wrapping_add(1), index + 1);
            match self
                .0
                .compare_exchange_weak(cur, new, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Pop a slot, or `None` if the list is empty right now.
    pub fn pop<L: SlotLinks + ?Sized>(&self, links: &L) -> Option<u32> {
        let mut cur = self.0.load(Ordering::Acquire);
        loop {
            let (generation, top) = unpack(cur);
            if top == 0 {
                return None;
            }
            let next = links.link(top - 1).load(Ordering::Relaxed);
            let new = pack(generation.wrapping_add(1), next);
            match self
                .0
                .compare_exchange_weak(cur, new, Ordering::Acquire, Ordering::Acquire)
            {
                Ok(_) => {
                    links.link(top - 1).store(0, Ordering::Relaxed);
                    return Some(top - 1);
                }
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        unpack(self.0.load(Ordering::Relaxed)).1 == 0
    }
}

impl Default for FreeListHead {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotLinks for [AtomicU32] {
    fn link(&self, index: u32) -> &AtomicU32 {
        &self[index as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicU8;
    use std::sync::Arc;
    use std::thread;

    fn links(n: usize) -> Vec<AtomicU32> {
        (0..n).map(|_| AtomicU32::new(0)).collect()
    }

    #[test]
    fn test_lifo() {
        let l = links(4);
        let head = FreeListHead::new();
        assert!(head.is_empty());
        for i in 0..4 {
            head.push(&l[..], i);
        }
        assert_eq!(head.pop(&l[..]), Some(3));
        assert_eq!(head.pop(&l[..]), Some(2));
        head.push(&l[..], 3);
        assert_eq!(head.pop(&l[..]), Some(3));
        assert_eq!(head.pop(&l[..]), Some(1));
        assert_eq!(head.pop(&l[..]), Some(0));
        assert_eq!(head.pop(&l[..]), None);
    }

    #[test]
    fn test_drain_yields_each_slot_once() {
        let l = links(64);
        let head = FreeListHead::new();
        for i in 0..64 {
            head.push(&l[..], i);
        }
        let mut seen = HashSet::new();
        while let Some(i) = head.pop(&l[..]) {
            assert!(seen.insert(i));
        }
        assert_eq!(seen.len(), 64);
    }

    /// Concurrent fetch/free storm with ownership tracked in a side table.
    #[test]
    fn test_concurrent_single_owner() {
        const SLOTS: usize = 32;
        struct Pool {
            links: Vec<AtomicU32>,
            head: FreeListHead,
            owned: Vec<AtomicU8>,
        }
        let pool = Arc::new(Pool {
            links: links(SLOTS),
            head: FreeListHead::new(),
            owned: (0..SLOTS).map(|_| AtomicU8::new(0)).collect(),
        });
        for i in 0..SLOTS as u32 {
            pool.head.push(&pool.links[..], i);
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    let mut held = Vec::new();
                    for round in 0..20_000 {
                        if round % 3 != 2 {
                            if let Some(i) = pool.head.pop(&pool.links[..]) {
                                let prev = pool.owned[i as usize].swap(1, Ordering::AcqRel);
                                assert_eq!(prev, 0, "slot {i} handed out twice");
                                held.push(i);
                            }
                        } else if let Some(i) = held.pop() {
                            pool.owned[i as usize].store(0, Ordering::Release);
                            pool.head.push(&pool.links[..], i);
                        }
                    }
                    for i in held {
                        pool.owned[i as usize].store(0, Ordering::Release);
                        pool.head.push(&pool.links[..], i);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut count = 0;
        while pool.head.pop(&pool.links[..]).is_some() {
            count += 1;
        }
        assert_eq!(count, SLOTS);
    }
}
