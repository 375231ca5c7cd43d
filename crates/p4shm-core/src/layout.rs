//! Segment and communication pad geometry
//!
//! The segment is a 64-byte header followed by one pad per rank. Every pad is
//! laid out as
//!
//! ```text
//! [receive queue + doorbell][ack queue][small slab][large slab]
//! ```
//!
//! and each slab is a 64-byte free-list header followed by fixed-stride
//! fragments. All offsets are pad-relative and identical across pads.

use std::ops::{Deref, DerefMut};

pub const CACHE_LINE_SIZE: usize = 64;

/// Bytes reserved at the start of the segment for [`crate::segment::SegmentHeader`]
pub const SEGMENT_HEADER_SIZE: usize = 64;
/// Receive queue header (three cache lines) plus its doorbell line
pub const RECV_BLOCK_SIZE: usize = 4 * CACHE_LINE_SIZE;
/// Ack queue header, padded to the same block size
pub const ACK_BLOCK_SIZE: usize = 4 * CACHE_LINE_SIZE;
/// Free-list header at the start of each slab
pub const SLAB_HEADER_SIZE: usize = CACHE_LINE_SIZE;
/// Private fragment header preceding each payload
pub const FRAG_HEADER_SIZE: usize = CACHE_LINE_SIZE;

/// Cache-line aligned wrapper keeping producer and consumer fields apart.
#[repr(C, align(64))]
pub struct CachePadded<T> {
    value: T,
}

impl<T> CachePadded<T> {
    pub const fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T> Deref for CachePadded<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for CachePadded<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

/// Fragment size class; immutable once a fragment is carved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SizeClass {
    Small = 0,
    Large = 1,
}

impl SizeClass {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(SizeClass::Small),
            1 => Some(SizeClass::Large),
            _ => None,
        }
    }
}

#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Geometry of one communication pad
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PadLayout {
    small_frag_size: usize,
    small_frag_count: u32,
    large_frag_size: usize,
    large_frag_count: u32,
}

impl PadLayout {
    pub fn new(
        small_frag_size: usize,
        small_frag_count: u32,
        large_frag_size: usize,
        large_frag_count: u32,
    ) -> Self {
        Self {
            small_frag_size,
            small_frag_count,
            large_frag_size,
            large_frag_count,
        }
    }

    pub const fn recv_queue_offset(&self) -> usize {
        0
    }

    pub const fn ack_queue_offset(&self) -> usize {
        RECV_BLOCK_SIZE
    }

    /// Payload bytes of a fragment of `class`
    pub fn payload_size(&self, class: SizeClass) -> usize {
        match class {
            SizeClass::Small => self.small_frag_size,
            SizeClass::Large => self.large_frag_size,
        }
    }

    pub fn count(&self, class: SizeClass) -> u32 {
        match class {
            SizeClass::Small => self.small_frag_count,
            SizeClass::Large => self.large_frag_count,
        }
    }

    /// Distance between consecutive fragments of `class`
    pub fn stride(&self, class: SizeClass) -> usize {
        FRAG_HEADER_SIZE + align_up(self.payload_size(class), CACHE_LINE_SIZE)
    }

    pub fn slab_offset(&self, class: SizeClass) -> usize {
        let small = RECV_BLOCK_SIZE + ACK_BLOCK_SIZE;
        match class {
            SizeClass::Small => small,
            SizeClass::Large => {
                small
                    + SLAB_HEADER_SIZE
                    + self.small_frag_count as usize * self.stride(SizeClass::Small)
            }
        }
    }

    /// Pad-relative offset of fragment `index` of `class`
    pub fn frag_offset(&self, class: SizeClass, index: u32) -> usize {
        self.slab_offset(class) + SLAB_HEADER_SIZE + index as usize * self.stride(class)
    }

    /// Inverse of [`frag_offset`](Self::frag_offset)
    pub fn frag_index(&self, class: SizeClass, offset: usize) -> Option<u32> {
        let first = self.slab_offset(class) + SLAB_HEADER_SIZE;
        if offset < first {
            return None;
        }
        let rel = offset - first;
        let stride = self.stride(class);
        let index = rel / stride;
        if rel % stride != 0 || index >= self.count(class) as usize {
            return None;
        }
        Some(index as u32)
    }

    /// Smallest class whose payload fits `payload_size`, falling back to large
    pub fn class_for(&self, payload_size: usize) -> SizeClass {
        if payload_size <= self.small_frag_size {
            SizeClass::Small
        } else {
            SizeClass::Large
        }
    }

    pub fn pad_size(&self) -> usize {
        self.slab_offset(SizeClass::Large)
            + SLAB_HEADER_SIZE
            + self.large_frag_count as usize * self.stride(SizeClass::Large)
    }

    /// Total segment size for `num_procs` pads
    pub fn segment_size(&self, num_procs: u32) -> usize {
        SEGMENT_HEADER_SIZE + num_procs as usize * self.pad_size()
    }

    /// Segment-relative offset of the pad owned by `rank`
    pub fn pad_offset(&self, rank: u32) -> usize {
        SEGMENT_HEADER_SIZE + rank as usize * self.pad_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> PadLayout {
        PadLayout::new(512, 4, 4096, 2)
    }

    #[test]
    fn test_pad_ordering() {
        let l = layout();
        assert!(l.recv_queue_offset() < l.ack_queue_offset());
        assert!(l.ack_queue_offset() < l.slab_offset(SizeClass::Small));
        assert!(l.slab_offset(SizeClass::Small) < l.slab_offset(SizeClass::Large));
        assert_eq!(l.pad_size() % CACHE_LINE_SIZE, 0);
    }

    #[test]
    fn test_frag_offsets_round_trip() {
        let l = layout();
        for class in [SizeClass::Small, SizeClass::Large] {
            for i in 0..l.count(class) {
                let off = l.frag_offset(class, i);
                assert_eq!(off % CACHE_LINE_SIZE, 0);
                assert_eq!(l.frag_index(class, off), Some(i));
            }
        }
        assert_eq!(l.frag_index(SizeClass::Small, 0), None);
        let past_end = l.frag_offset(SizeClass::Small, 4);
        assert_eq!(l.frag_index(SizeClass::Small, past_end), None);
    }

    #[test]
    fn test_class_for() {
        let l = layout();
        assert_eq!(l.class_for(512), SizeClass::Small);
        assert_eq!(l.class_for(513), SizeClass::Large);
    }

    #[test]
    fn test_cache_padded_alignment() {
        assert_eq!(std::mem::align_of::<CachePadded<u64>>(), CACHE_LINE_SIZE);
        assert_eq!(std::mem::size_of::<CachePadded<u64>>(), CACHE_LINE_SIZE);
    }
}
