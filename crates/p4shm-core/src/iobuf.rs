//! User memory handed to entries and memory descriptors
//!
//! An [`IoBuf`] is shared between the application and the data-movement
//! thread. As with any Portals memory region, the application must not touch
//! bytes that an in-flight operation is reading or writing; completion is
//! observed through a counting event or an event queue.

use crate::{Error, Result};
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::Arc;

struct Region {
    data: UnsafeCell<Box<[u8]>>,
}

// Safety: access is coordinated through Portals completion semantics; every
// copy goes through raw pointers bounded by the region length.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

/// Reference-counted byte region
#[derive(Clone)]
pub struct IoBuf {
    region: Arc<Region>,
    len: usize,
}

impl IoBuf {
    /// Zero-filled region of `len` bytes
    pub fn new(len: usize) -> Self {
        Self::from_vec(vec![0u8; len])
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        let len = data.len();
        Self {
            region: Arc::new(Region {
                data: UnsafeCell::new(data.into_boxed_slice()),
            }),
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn ptr(&self) -> *mut u8 {
        // Safety: the box is never reallocated after construction
        unsafe { (*self.region.data.get()).as_mut_ptr() }
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(Error::InvalidArgument(format!(
                "range {offset}+{len} outside buffer of {} bytes",
                self.len
            ))),
        }
    }

    /// Copy `dst.len()` bytes starting at `offset` out of the region.
    pub fn read(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.check(offset, dst.len())?;
        // Safety: range checked above; `dst` is a distinct allocation
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr().add(offset), dst.as_mut_ptr(), dst.len())
        };
        Ok(())
    }

    /// Copy `src` into the region at `offset`.
    pub fn write(&self, offset: usize, src: &[u8]) -> Result<()> {
        self.check(offset, src.len())?;
        // Safety: as above
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr().add(offset), src.len()) };
        Ok(())
    }

    /// Snapshot of the whole region
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len];
        // Infallible: full range of our own length
        let _ = self.read(0, &mut out);
        out
    }

    /// Mutable view of `offset..offset + len`.
    ///
    /// # Safety
    /// The caller must be the only party accessing the range while the slice
    /// lives; the data-movement thread holds it only for one delivery.
    pub(crate) unsafe fn slice_mut(&self, offset: usize, len: usize) -> Result<&mut [u8]> {
        self.check(offset, len)?;
        Ok(std::slice::from_raw_parts_mut(self.ptr().add(offset), len))
    }

    pub(crate) fn same_region(&self, other: &IoBuf) -> bool {
        Arc::ptr_eq(&self.region, &other.region)
    }
}

impl fmt::Debug for IoBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoBuf").field("len", &self.len).finish()
    }
}
