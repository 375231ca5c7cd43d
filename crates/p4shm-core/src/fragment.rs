//! Fixed-size fragment allocator
//!
//! Each pad carries a small and a large slab. A slab is a [`SlabHeader`]
//! (free list head and a free counter) followed by fragments of one fixed
//! stride. A fragment's class is written once when the slab is carved and
//! never changes, so a fragment can only ever return to the list it came from.

use crate::freelist::{FreeListHead, SlotLinks};
use crate::header::MsgHeader;
use crate::layout::{PadLayout, SizeClass, FRAG_HEADER_SIZE};
use crate::offset::RelRef;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

const FRAG_FREE: u32 = 0;
const FRAG_BUSY: u32 = 1;

/// Private header preceding every fragment payload
#[repr(C, align(64))]
pub struct FragHeader {
    /// Queue link; must stay the first field
    next: AtomicU64,
    free_next: AtomicU32,
    class: u32,
    owner: u32,
    index: u32,
    state: AtomicU32,
}

const _: () = assert!(std::mem::size_of::<FragHeader>() == FRAG_HEADER_SIZE);

/// Free list header at the start of each slab
#[repr(C, align(64))]
pub struct SlabHeader {
    free: FreeListHead,
    available: AtomicU32,
}

const _: () = assert!(std::mem::size_of::<SlabHeader>() == crate::layout::SLAB_HEADER_SIZE);

struct SlabLinks<'p> {
    pool: &'p FragmentPool<'p>,
    class: SizeClass,
}

impl SlotLinks for SlabLinks<'_> {
    fn link(&self, index: u32) -> &AtomicU32 {
        &self.pool.frag_header(self.class, index).free_next
    }
}

/// Allocator over the slabs of one pad.
///
/// Only the pad's owner fetches and frees; any of its threads may do so
/// concurrently.
pub struct FragmentPool<'a> {
    pad: *mut u8,
    rank: u32,
    layout: PadLayout,
    _segment: PhantomData<&'a ()>,
}

impl<'a> FragmentPool<'a> {
    /// # Safety
    /// `pad` must point at a mapped pad laid out per `layout` that outlives
    /// `'a`.
    pub unsafe fn new(pad: *mut u8, rank: u32, layout: PadLayout) -> Self {
        Self {
            pad,
            rank,
            layout,
            _segment: PhantomData,
        }
    }

    fn slab(&self, class: SizeClass) -> &SlabHeader {
        // Safety: slab offsets are inside the pad and 64-byte aligned
        unsafe { &*(self.pad.add(self.layout.slab_offset(class)) as *const SlabHeader) }
    }

    fn frag_header(&self, class: SizeClass, index: u32) -> &FragHeader {
        // Safety: index < count for every caller
        unsafe { &*(self.pad.add(self.layout.frag_offset(class, index)) as *const FragHeader) }
    }

    fn links(&self, class: SizeClass) -> SlabLinks<'_> {
        SlabLinks { pool: self, class }
    }

    /// Carve both slabs into free lists. Runs once, before the owner sends.
    pub fn setup(&self) {
        for class in [SizeClass::Small, SizeClass::Large] {
            let slab = self.slab(class);
            slab.free.init();
            slab.available.store(0, Ordering::Relaxed);
            let count = self.layout.count(class);
            let ptr = |i: u32| unsafe { self.pad.add(self.layout.frag_offset(class, i)) };
            for i in 0..count {
                // Safety: nobody references the slab before setup completes
                unsafe {
                    std::ptr::write(
                        ptr(i) as *mut FragHeader,
                        FragHeader {
                            next: AtomicU64::new(0),
                            free_next: AtomicU32::new(0),
                            class: class as u32,
                            owner: self.rank,
                            index: i,
                            state: AtomicU32::new(FRAG_FREE),
                        },
                    );
                }
            }
            // Push in reverse so the lowest fragments are handed out first
            for i in (0..count).rev() {
                slab.free.push(&self.links(class), i);
            }
            slab.available.store(count, Ordering::Release);
        }
        tracing::debug!(
            rank = self.rank,
            small = self.layout.count(SizeClass::Small),
            large = self.layout.count(SizeClass::Large),
            "fragment slabs carved"
        );
    }

    /// Pop a fragment able to carry `payload_size` bytes, if one is free now.
    pub fn try_fetch(&self, payload_size: usize) -> Option<RelRef> {
        let class = self.layout.class_for(payload_size);
        let slab = self.slab(class);
        let index = slab.free.pop(&self.links(class))?;
        slab.available.fetch_sub(1, Ordering::Relaxed);

        let hdr = self.frag_header(class, index);
        let prev = hdr.state.swap(FRAG_BUSY, Ordering::AcqRel);
        debug_assert_eq!(prev, FRAG_FREE, "fragment {index} fetched while busy");
        debug_assert_eq!(hdr.next.load(Ordering::Relaxed), 0);
        Some(RelRef::new(
            self.rank,
            self.layout.frag_offset(class, index) as u32,
        ))
    }

    /// Pop a fragment, retrying while the list is momentarily empty.
    pub fn fetch(&self, payload_size: usize) -> RelRef {
        let mut spins = 0u32;
        loop {
            if let Some(frag) = self.try_fetch(payload_size) {
                return frag;
            }
            spins += 1;
            if spins == 1024 {
                tracing::debug!(rank = self.rank, payload_size, "fragment list exhausted, waiting");
            }
            if spins < 64 {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }

    /// Return a fragment to the free list of its class.
    pub fn free(&self, frag: RelRef) {
        debug_assert_eq!(frag.owner(), self.rank, "fragment freed to a foreign pad");
        let (class, index) = self.locate(frag);
        let hdr = self.frag_header(class, index);
        debug_assert_eq!(
            hdr.next.load(Ordering::Relaxed),
            0,
            "fragment freed while linked into a queue"
        );
        let prev = hdr.state.swap(FRAG_FREE, Ordering::AcqRel);
        debug_assert_eq!(prev, FRAG_BUSY, "double free of fragment {index}");
        let slab = self.slab(class);
        slab.free.push(&self.links(class), index);
        slab.available.fetch_add(1, Ordering::Relaxed);
    }

    /// Free fragments of `class` (approximate under concurrency)
    pub fn available(&self, class: SizeClass) -> u32 {
        self.slab(class).available.load(Ordering::Relaxed)
    }

    /// Class and slab index of `frag`, read from its immutable header
    fn locate(&self, frag: RelRef) -> (SizeClass, u32) {
        // Safety: `frag` was handed out by this pool
        let hdr = unsafe { &*(self.pad.add(frag.offset() as usize) as *const FragHeader) };
        let class = SizeClass::from_u32(hdr.class).unwrap_or(SizeClass::Large);
        debug_assert_eq!(
            self.layout.frag_index(class, frag.offset() as usize),
            Some(hdr.index)
        );
        (class, hdr.index)
    }
}

/// Exclusive view of one fragment's payload.
///
/// Holding a view asserts ownership: the fragment is neither on a free list
/// nor linked into a queue.
pub struct FragView<'a> {
    frag: RelRef,
    class: SizeClass,
    payload: *mut u8,
    payload_size: usize,
    _segment: PhantomData<&'a mut ()>,
}

impl<'a> FragView<'a> {
    /// # Safety
    /// `header` must be the mapped fragment header of `frag` and the caller
    /// must own the fragment for `'a`.
    pub(crate) unsafe fn new(frag: RelRef, header: *mut u8, layout: &PadLayout) -> Self {
        let class = SizeClass::from_u32((*(header as *const FragHeader)).class)
            .unwrap_or(SizeClass::Large);
        Self {
            frag,
            class,
            payload: header.add(FRAG_HEADER_SIZE),
            payload_size: layout.payload_size(class),
            _segment: PhantomData,
        }
    }

    pub fn rel(&self) -> RelRef {
        self.frag
    }

    pub fn class(&self) -> SizeClass {
        self.class
    }

    /// Payload bytes, header included
    pub fn size(&self) -> usize {
        self.payload_size
    }

    /// Inline data bytes available after the message header
    pub fn capacity(&self) -> usize {
        self.payload_size - MsgHeader::SIZE
    }

    pub fn header(&self) -> &MsgHeader {
        // Safety: payload is 64-byte aligned and at least MsgHeader::SIZE long
        unsafe { &*(self.payload as *const MsgHeader) }
    }

    pub fn header_mut(&mut self) -> &mut MsgHeader {
        // Safety: as above, and the view is exclusive
        unsafe { &mut *(self.payload as *mut MsgHeader) }
    }

    pub fn data(&self) -> &[u8] {
        // Safety: data area lies inside the payload
        unsafe { std::slice::from_raw_parts(self.payload.add(MsgHeader::SIZE), self.capacity()) }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        // Safety: as above, and the view is exclusive
        unsafe {
            std::slice::from_raw_parts_mut(self.payload.add(MsgHeader::SIZE), self.capacity())
        }
    }

    /// Header and data borrowed together
    pub fn split_mut(&mut self) -> (&mut MsgHeader, &mut [u8]) {
        let cap = self.capacity();
        // Safety: header and data do not overlap
        unsafe {
            (
                &mut *(self.payload as *mut MsgHeader),
                std::slice::from_raw_parts_mut(self.payload.add(MsgHeader::SIZE), cap),
            )
        }
    }
}
