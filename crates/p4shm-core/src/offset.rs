//! Relative references into communication pads
//!
//! Ranks map the segment at different addresses, so nothing stored in shared
//! memory may hold a raw pointer. Links are `(owner rank, pad offset)` pairs
//! resolved through a per-process [`BaseTable`].

use std::fmt;
use std::sync::OnceLock;

/// `(owner rank, pad-relative byte offset)` packed into 64 bits.
///
/// Offset 0 is the owner's receive queue header, never a linkable element,
/// so the all-zero value doubles as the null reference.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct RelRef(u64);

impl RelRef {
    pub const NULL: RelRef = RelRef(0);

    #[inline]
    pub fn new(owner: u32, offset: u32) -> Self {
        debug_assert!(offset != 0, "offset 0 is reserved for null");
        RelRef(((owner as u64) << 32) | offset as u64)
    }

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        RelRef(raw)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn owner(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline]
    pub const fn offset(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Debug for RelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "RelRef(null)")
        } else {
            write!(f, "RelRef({}:{:#x})", self.owner(), self.offset())
        }
    }
}

/// Per-process table of pad base addresses, filled lazily on first reference
/// to each owner.
pub struct BaseTable {
    base: *mut u8,
    first_pad: usize,
    pad_size: usize,
    pads: Box<[OnceLock<usize>]>,
}

// Safety: the table only hands out addresses inside a mapping that outlives it;
// the cached entries are write-once.
unsafe impl Send for BaseTable {}
unsafe impl Sync for BaseTable {}

impl BaseTable {
    /// Build a table over `num_pads` pads of `pad_size` bytes starting
    /// `first_pad` bytes past `base`.
    ///
    /// # Safety
    /// `base..base + first_pad + num_pads * pad_size` must stay mapped for the
    /// lifetime of the table.
    pub unsafe fn new(base: *mut u8, first_pad: usize, pad_size: usize, num_pads: u32) -> Self {
        let pads = (0..num_pads).map(|_| OnceLock::new()).collect();
        Self {
            base,
            first_pad,
            pad_size,
            pads,
        }
    }

    pub fn num_pads(&self) -> u32 {
        self.pads.len() as u32
    }

    pub fn pad_size(&self) -> usize {
        self.pad_size
    }

    /// Base address of the pad owned by `rank`
    pub fn pad_base(&self, rank: u32) -> *mut u8 {
        let slot = &self.pads[rank as usize];
        let addr = *slot.get_or_init(|| {
            let addr = self.base as usize + self.first_pad + rank as usize * self.pad_size;
            tracing::trace!(rank, addr = format_args!("{addr:#x}"), "mapped pad base");
            addr
        });
        addr as *mut u8
    }

    /// Resolve a non-null reference to an address in this process
    #[inline]
    pub fn resolve(&self, r: RelRef) -> *mut u8 {
        debug_assert!(!r.is_null());
        debug_assert!((r.offset() as usize) < self.pad_size);
        // Safety: in bounds of the owner's pad by construction of `r`
        unsafe { self.pad_base(r.owner()).add(r.offset() as usize) }
    }
}
