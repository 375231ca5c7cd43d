//! Initiator memory descriptors

use crate::ct::CountingEvent;
use crate::eq::EventQueue;
use crate::handle::{CtHandle, EqHandle};
use crate::iobuf::IoBuf;
use crate::types::MdOptions;
use crate::{Error, Result};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Arguments of `md_bind`
#[derive(Debug, Clone)]
pub struct MdSpec {
    pub buf: IoBuf,
    pub start: usize,
    pub length: usize,
    pub options: MdOptions,
    pub eq: Option<EqHandle>,
    pub ct: Option<CtHandle>,
}

impl MdSpec {
    /// Describe the whole of `buf`.
    pub fn new(buf: IoBuf) -> Self {
        let length = buf.len();
        Self {
            buf,
            start: 0,
            length,
            options: MdOptions::empty(),
            eq: None,
            ct: None,
        }
    }

    pub fn with_range(mut self, start: usize, length: usize) -> Self {
        self.start = start;
        self.length = length;
        self
    }

    pub fn with_options(mut self, options: MdOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_eq(mut self, eq: EqHandle) -> Self {
        self.eq = Some(eq);
        self
    }

    pub fn with_ct(mut self, ct: CtHandle) -> Self {
        self.ct = Some(ct);
        self
    }
}

pub(crate) struct MemoryDescriptor {
    buf: IoBuf,
    start: usize,
    length: usize,
    pub options: MdOptions,
    pub eq: Option<Arc<EventQueue>>,
    pub ct: Option<Arc<CountingEvent>>,
    outstanding: AtomicU32,
}

impl MemoryDescriptor {
    pub fn new(
        spec: &MdSpec,
        eq: Option<Arc<EventQueue>>,
        ct: Option<Arc<CountingEvent>>,
    ) -> Result<Self> {
        if !matches!(spec.start.checked_add(spec.length), Some(end) if end <= spec.buf.len()) {
            return Err(Error::InvalidArgument(format!(
                "md range {}+{} outside buffer of {} bytes",
                spec.start,
                spec.length,
                spec.buf.len()
            )));
        }
        Ok(Self {
            buf: spec.buf.clone(),
            start: spec.start,
            length: spec.length,
            options: spec.options,
            eq,
            ct,
            outstanding: AtomicU32::new(0),
        })
    }

    /// Reject `offset..offset + len` if it leaves the descriptor.
    pub fn check(&self, offset: u64, len: u64) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.length as u64 => Ok(()),
            _ => Err(Error::InvalidArgument(format!(
                "local range {offset}+{len} outside md of {} bytes",
                self.length
            ))),
        }
    }

    pub fn read(&self, offset: u64, dst: &mut [u8]) -> Result<()> {
        self.check(offset, dst.len() as u64)?;
        self.buf.read(self.start + offset as usize, dst)
    }

    pub fn write(&self, offset: u64, src: &[u8]) -> Result<()> {
        self.check(offset, src.len() as u64)?;
        self.buf.write(self.start + offset as usize, src)
    }

    /// One more operation references this descriptor.
    pub fn acquire(&self) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    pub fn release(&self) {
        let prev = self.outstanding.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "md released more often than acquired");
    }

    pub fn outstanding(&self) -> u32 {
        self.outstanding.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_is_relative_to_start() {
        let buf = IoBuf::new(32);
        let spec = MdSpec::new(buf.clone()).with_range(8, 16);
        let md = MemoryDescriptor::new(&spec, None, None).unwrap();
        md.write(0, &[9, 9]).unwrap();
        assert_eq!(&buf.to_vec()[8..10], &[9, 9]);
        assert!(md.check(15, 1).is_ok());
        assert!(md.check(15, 2).is_err());
        assert!(md.write(16, &[1]).is_err());
    }

    #[test]
    fn test_bind_rejects_out_of_range() {
        let spec = MdSpec::new(IoBuf::new(4)).with_range(2, 4);
        assert!(MemoryDescriptor::new(&spec, None, None).is_err());
    }

    #[test]
    fn test_outstanding_count() {
        let md = MemoryDescriptor::new(&MdSpec::new(IoBuf::new(1)), None, None).unwrap();
        md.acquire();
        md.acquire();
        md.release();
        assert_eq!(md.outstanding(), 1);
    }
}
