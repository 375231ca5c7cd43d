//! Buffered unexpected headers
//!
//! Messages that matched nothing, or that landed in an overflow-list entry,
//! are remembered here so a later append or search can resolve them. Slots
//! are preallocated and handed out through the same tagged free list as
//! fragments.

use crate::entry::Entry;
use crate::freelist::FreeListHead;
use crate::header::MsgHeader;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Where the data of a buffered message lives
pub(crate) enum Payload {
    /// Copied out of the fragments
    Owned(Vec<u8>),
    /// Already delivered into an overflow-list entry at `offset`
    Overflow { entry: Arc<Entry>, offset: u64 },
}

pub(crate) struct Buffered {
    /// Header as it arrived; `mlength` is the delivered length for overflow
    /// payloads and the buffered length otherwise
    pub hdr: MsgHeader,
    pub payload: Payload,
    /// All fragments of the message have arrived
    pub complete: bool,
}

impl Buffered {
    pub fn from_overflow(&self) -> bool {
        matches!(self.payload, Payload::Overflow { .. })
    }

    /// Message bytes, `buf.len()` at most
    pub fn read(&self, buf: &mut [u8]) -> usize {
        match &self.payload {
            Payload::Owned(data) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                n
            }
            Payload::Overflow { entry, offset } => {
                let n = (self.hdr.mlength as usize).min(buf.len());
                match entry.read(*offset, &mut buf[..n]) {
                    Ok(()) => n,
                    Err(_) => 0,
                }
            }
        }
    }
}

pub(crate) struct UnexpectedPool {
    links: Box<[AtomicU32]>,
    free: FreeListHead,
    slots: Box<[Mutex<Option<Buffered>>]>,
    in_use: AtomicU32,
}

impl UnexpectedPool {
    pub fn new(capacity: u32) -> Self {
        let pool = Self {
            links: (0..capacity).map(|_| AtomicU32::new(0)).collect(),
            free: FreeListHead::new(),
            slots: (0..capacity).map(|_| Mutex::new(None)).collect(),
            in_use: AtomicU32::new(0),
        };
        for i in (0..capacity).rev() {
            pool.free.push(&pool.links[..], i);
        }
        pool
    }

    /// Store `buffered`, or hand it back if the pool is exhausted.
    pub fn insert(&self, buffered: Buffered) -> std::result::Result<u32, Buffered> {
        let Some(slot) = self.free.pop(&self.links[..]) else {
            return Err(buffered);
        };
        *self.slots[slot as usize].lock() = Some(buffered);
        self.in_use.fetch_add(1, Ordering::Relaxed);
        Ok(slot)
    }

    pub fn get(&self, slot: u32) -> MutexGuard<'_, Option<Buffered>> {
        self.slots[slot as usize].lock()
    }

    /// Remove and release a slot.
    pub fn take(&self, slot: u32) -> Option<Buffered> {
        let buffered = self.slots[slot as usize].lock().take();
        if buffered.is_some() {
            self.free.push(&self.links[..], slot);
            self.in_use.fetch_sub(1, Ordering::Relaxed);
        }
        buffered
    }

    pub fn in_use(&self) -> u32 {
        self.in_use.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owned(data: &[u8]) -> Buffered {
        Buffered {
            hdr: MsgHeader::default(),
            payload: Payload::Owned(data.to_vec()),
            complete: true,
        }
    }

    #[test]
    fn test_insert_take_reuse() {
        let pool = UnexpectedPool::new(2);
        let a = pool.insert(owned(b"ab")).ok().unwrap();
        let b = pool.insert(owned(b"cd")).ok().unwrap();
        assert_ne!(a, b);
        assert!(pool.insert(owned(b"ef")).is_err());
        assert_eq!(pool.in_use(), 2);

        let mut out = [0u8; 4];
        assert_eq!(pool.get(b).as_ref().unwrap().read(&mut out), 2);
        assert_eq!(&out[..2], b"cd");

        assert!(pool.take(a).is_some());
        assert!(pool.take(a).is_none());
        assert_eq!(pool.insert(owned(b"gh")).ok(), Some(a));
    }
}
