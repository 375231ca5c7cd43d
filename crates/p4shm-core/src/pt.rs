//! Portal table entries

use crate::entry::Entry;
use crate::eq::EventQueue;
use crate::handle::Handle;
use crate::types::ListKind;
use crate::{Error, Result};
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PtStatus {
    Free = 0,
    Disabled = 1,
    Enabled = 2,
}

impl PtStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => PtStatus::Disabled,
            2 => PtStatus::Enabled,
            _ => PtStatus::Free,
        }
    }
}

/// Everything the portal-table lock guards
#[derive(Default)]
pub(crate) struct PtLists {
    pub priority: VecDeque<Arc<Entry>>,
    pub overflow: VecDeque<Arc<Entry>>,
    /// Slots of the unexpected pool, in arrival order
    pub unexpected: VecDeque<u32>,
    pub eq: Option<Arc<EventQueue>>,
}

impl PtLists {
    pub fn list(&self, kind: ListKind) -> &VecDeque<Arc<Entry>> {
        match kind {
            ListKind::Priority => &self.priority,
            ListKind::Overflow => &self.overflow,
        }
    }

    pub fn list_mut(&mut self, kind: ListKind) -> &mut VecDeque<Arc<Entry>> {
        match kind {
            ListKind::Priority => &mut self.priority,
            ListKind::Overflow => &mut self.overflow,
        }
    }

    /// Remove the entry with `handle` from whichever list holds it.
    pub fn remove(&mut self, handle: Handle) -> Option<Arc<Entry>> {
        for kind in [ListKind::Priority, ListKind::Overflow] {
            let list = self.list_mut(kind);
            if let Some(pos) = list.iter().position(|e| e.handle == handle) {
                return list.remove(pos);
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.priority.is_empty() && self.overflow.is_empty() && self.unexpected.is_empty()
    }
}

/// One portal index of one interface
pub(crate) struct PtEntry {
    status: AtomicU8,
    lists: Mutex<PtLists>,
}

impl PtEntry {
    pub fn new() -> Self {
        Self {
            status: AtomicU8::new(PtStatus::Free as u8),
            lists: Mutex::new(PtLists::default()),
        }
    }

    pub fn status(&self) -> PtStatus {
        PtStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn cas(&self, from: PtStatus, to: PtStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Free -> Disabled -> Enabled. Returns false if already allocated.
    pub fn alloc(&self, eq: Option<Arc<EventQueue>>) -> bool {
        if !self.cas(PtStatus::Free, PtStatus::Disabled) {
            return false;
        }
        self.lists.lock().eq = eq;
        self.status.store(PtStatus::Enabled as u8, Ordering::Release);
        true
    }

    pub fn enable(&self) -> Result<()> {
        match self.status() {
            PtStatus::Free => Err(Error::InvalidArgument("portal index not allocated".to_string())),
            _ => {
                self.cas(PtStatus::Disabled, PtStatus::Enabled);
                Ok(())
            }
        }
    }

    pub fn disable(&self) -> Result<()> {
        match self.status() {
            PtStatus::Free => Err(Error::InvalidArgument("portal index not allocated".to_string())),
            _ => {
                // Wait out a delivery in progress
                let _lists = self.lists.lock();
                self.cas(PtStatus::Enabled, PtStatus::Disabled);
                Ok(())
            }
        }
    }

    /// Release; refused while entries or buffered headers remain.
    pub fn free(&self) -> Result<()> {
        let mut lists = self.lists.lock();
        if self.status() == PtStatus::Free {
            return Err(Error::InvalidArgument("portal index not allocated".to_string()));
        }
        if !lists.is_empty() {
            return Err(Error::InUse);
        }
        lists.eq = None;
        self.status.store(PtStatus::Free as u8, Ordering::Release);
        Ok(())
    }

    pub fn lock(&self) -> MutexGuard<'_, PtLists> {
        self.lists.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        let pt = PtEntry::new();
        assert_eq!(pt.status(), PtStatus::Free);
        assert!(pt.enable().is_err());
        assert!(pt.alloc(None));
        assert!(!pt.alloc(None));
        assert_eq!(pt.status(), PtStatus::Enabled);
        pt.disable().unwrap();
        assert_eq!(pt.status(), PtStatus::Disabled);
        pt.enable().unwrap();
        assert_eq!(pt.status(), PtStatus::Enabled);
        pt.free().unwrap();
        assert_eq!(pt.status(), PtStatus::Free);
        assert!(pt.free().is_err());
    }

    #[test]
    fn test_free_refused_with_buffered_headers() {
        let pt = PtEntry::new();
        assert!(pt.alloc(None));
        pt.lock().unexpected.push_back(3);
        assert!(matches!(pt.free(), Err(Error::InUse)));
        pt.lock().unexpected.clear();
        pt.free().unwrap();
    }
}
