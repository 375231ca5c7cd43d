//! Capability-checked handles and the slot tables behind them
//!
//! A handle packs `kind (8) | ni (8) | generation (16) | index (32)`. The
//! application never sees a raw slot index: a handle whose kind, interface or
//! generation does not match the slot is rejected as invalid.

use crate::freelist::FreeListHead;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Object class addressed by a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HandleKind {
    Entry = 1,
    Md = 2,
    Ct = 3,
    Eq = 4,
}

impl HandleKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(HandleKind::Entry),
            2 => Some(HandleKind::Md),
            3 => Some(HandleKind::Ct),
            4 => Some(HandleKind::Eq),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            HandleKind::Entry => "list entries",
            HandleKind::Md => "memory descriptors",
            HandleKind::Ct => "counting events",
            HandleKind::Eq => "event queues",
        }
    }
}

/// Untyped handle
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u64);

impl Handle {
    pub const INVALID: Handle = Handle(0);

    pub(crate) fn new(kind: HandleKind, ni: u8, generation: u16, index: u32) -> Self {
        Handle(
            ((kind as u64) << 56)
                | ((ni as u64) << 48)
                | ((generation as u64) << 32)
                | index as u64,
        )
    }

    pub const fn from_raw(raw: u64) -> Self {
        Handle(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub fn kind(self) -> Option<HandleKind> {
        HandleKind::from_u8((self.0 >> 56) as u8)
    }

    pub const fn ni(self) -> u8 {
        (self.0 >> 48) as u8
    }

    pub const fn generation(self) -> u16 {
        (self.0 >> 32) as u16
    }

    pub const fn index(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            Some(kind) => write!(
                f,
                "{:?}(ni={}, gen={}, idx={})",
                kind,
                self.ni(),
                self.generation(),
                self.index()
            ),
            None => write!(f, "Handle({:#x})", self.0),
        }
    }
}

macro_rules! typed_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(Handle);

        impl $name {
            pub const fn raw(self) -> u64 {
                self.0.raw()
            }

            pub const fn from_raw(raw: u64) -> Self {
                $name(Handle::from_raw(raw))
            }

            pub(crate) const fn handle(self) -> Handle {
                self.0
            }
        }

        impl From<Handle> for $name {
            fn from(h: Handle) -> Self {
                $name(h)
            }
        }
    };
}

typed_handle!(
    /// List or match entry
    EntryHandle
);
typed_handle!(
    /// Memory descriptor
    MdHandle
);
typed_handle!(
    /// Counting event
    CtHandle
);
typed_handle!(
    /// Event queue
    EqHandle
);

/// Lifecycle of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SlotState {
    Free = 0,
    /// Owned by the application, possibly linked into a list
    Allocated = 1,
    /// The matching engine is delivering into it
    InUse = 2,
}

const FREE: u32 = SlotState::Free as u32;
const ALLOCATED: u32 = SlotState::Allocated as u32;
/// `IN_USE + n` means `n + 1` deliveries in flight
const IN_USE: u32 = SlotState::InUse as u32;

impl SlotState {
    fn from_u32(v: u32) -> Self {
        match v {
            FREE => SlotState::Free,
            ALLOCATED => SlotState::Allocated,
            _ => SlotState::InUse,
        }
    }
}

struct Slot<T> {
    state: AtomicU32,
    generation: AtomicU32,
    /// Freed while in use; the last delivery recycles the slot
    retiring: AtomicBool,
    value: Mutex<Option<Arc<T>>>,
}

/// Preallocated table of objects addressed by handles.
///
/// Free slots sit on a [`FreeListHead`]; state transitions are CAS-guarded
/// so unlinking an entry that is mid-delivery is detected instead of racing.
pub(crate) struct SlotTable<T> {
    kind: HandleKind,
    ni: u8,
    slots: Box<[Slot<T>]>,
    links: Box<[AtomicU32]>,
    free: FreeListHead,
    live: AtomicU32,
}

impl<T> SlotTable<T> {
    pub fn new(kind: HandleKind, ni: u8, capacity: u32) -> Self {
        let table = Self {
            kind,
            ni,
            slots: (0..capacity)
                .map(|_| Slot {
                    state: AtomicU32::new(SlotState::Free as u32),
                    generation: AtomicU32::new(0),
                    retiring: AtomicBool::new(false),
                    value: Mutex::new(None),
                })
                .collect(),
            links: (0..capacity).map(|_| AtomicU32::new(0)).collect(),
            free: FreeListHead::new(),
            live: AtomicU32::new(0),
        };
        for i in (0..capacity).rev() {
            table.free.push(&table.links[..], i);
        }
        table
    }

    /// Allocate a slot and build its object from the new handle.
    pub fn alloc(&self, make: impl FnOnce(Handle) -> T) -> Result<(Handle, Arc<T>)> {
        let index = self
            .free
            .pop(&self.links[..])
            .ok_or(Error::NoSpace(self.kind.name()))?;
        let slot = &self.slots[index as usize];
        let generation = slot.generation.load(Ordering::Acquire) as u16;
        let handle = Handle::new(self.kind, self.ni, generation, index);
        let value = Arc::new(make(handle));
        *slot.value.lock() = Some(Arc::clone(&value));
        slot.state.store(SlotState::Allocated as u32, Ordering::Release);
        self.live.fetch_add(1, Ordering::Relaxed);
        Ok((handle, value))
    }

    fn slot(&self, handle: Handle) -> Result<&Slot<T>> {
        let invalid = Error::InvalidHandle(handle.raw());
        if handle.kind() != Some(self.kind) || handle.ni() != self.ni {
            return Err(invalid);
        }
        let slot = self.slots.get(handle.index() as usize).ok_or(invalid)?;
        if slot.generation.load(Ordering::Acquire) as u16 != handle.generation() {
            return Err(Error::InvalidHandle(handle.raw()));
        }
        Ok(slot)
    }

    /// Object behind a live handle
    pub fn get(&self, handle: Handle) -> Result<Arc<T>> {
        let slot = self.slot(handle)?;
        if SlotState::from_u32(slot.state.load(Ordering::Acquire)) == SlotState::Free {
            return Err(Error::InvalidHandle(handle.raw()));
        }
        let value = slot.value.lock().clone();
        // The slot may have been recycled between the checks and the clone
        match value {
            Some(v) if slot.generation.load(Ordering::Acquire) as u16 == handle.generation() => {
                Ok(v)
            }
            _ => Err(Error::InvalidHandle(handle.raw())),
        }
    }

    pub fn state(&self, handle: Handle) -> SlotState {
        match self.slot(handle) {
            Ok(slot) => SlotState::from_u32(slot.state.load(Ordering::Acquire)),
            Err(_) => SlotState::Free,
        }
    }

    /// Allocated -> InUse, or one more delivery into an InUse slot
    pub fn begin_use(&self, handle: Handle) -> bool {
        let Ok(slot) = self.slot(handle) else {
            return false;
        };
        if slot.retiring.load(Ordering::Acquire) {
            return false;
        }
        slot.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| match s {
                FREE => None,
                ALLOCATED => Some(IN_USE),
                n => Some(n + 1),
            })
            .is_ok()
    }

    /// One delivery finished. The last one returns the slot to Allocated, or
    /// frees it when [`free_in_use`](Self::free_in_use) retired it meanwhile.
    pub fn end_use(&self, handle: Handle) {
        let released = self.release_use(handle);
        debug_assert!(released.is_ok(), "{handle:?} was not in use");
    }

    /// Retire a slot the matching engine is delivering into (use-once or
    /// exhausted entries). Returns whether the slot was freed right away.
    pub fn free_in_use(&self, handle: Handle) -> Result<bool> {
        let slot = self.slot(handle)?;
        if slot.state.load(Ordering::Acquire) < IN_USE {
            return Err(Error::InvalidHandle(handle.raw()));
        }
        slot.retiring.store(true, Ordering::Release);
        self.release_use(handle)
    }

    fn release_use(&self, handle: Handle) -> Result<bool> {
        let slot = self.slot(handle)?;
        let retiring = slot.retiring.load(Ordering::Acquire);
        let prev = slot
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| match s {
                FREE | ALLOCATED => None,
                IN_USE if retiring => Some(FREE),
                IN_USE => Some(ALLOCATED),
                n => Some(n - 1),
            })
            .map_err(|_| Error::InvalidHandle(handle.raw()))?;
        if prev == IN_USE && retiring {
            slot.retiring.store(false, Ordering::Release);
            self.recycle(handle)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Release a slot owned by the application.
    pub fn free(&self, handle: Handle) -> Result<Arc<T>> {
        let slot = self.slot(handle)?;
        match slot.state.compare_exchange(ALLOCATED, FREE, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => self.recycle(handle),
            Err(s) if s >= IN_USE => Err(Error::InUse),
            Err(_) => Err(Error::InvalidHandle(handle.raw())),
        }
    }

    fn recycle(&self, handle: Handle) -> Result<Arc<T>> {
        let slot = &self.slots[handle.index() as usize];
        let value = slot.value.lock().take();
        slot.generation.fetch_add(1, Ordering::AcqRel);
        self.free.push(&self.links[..], handle.index());
        self.live.fetch_sub(1, Ordering::Relaxed);
        value.ok_or(Error::InvalidHandle(handle.raw()))
    }

    /// Allocated slots
    pub fn live(&self) -> u32 {
        self.live.load(Ordering::Relaxed)
    }

    /// Every live object, for teardown
    pub fn drain(&self) -> Vec<Arc<T>> {
        self.slots
            .iter()
            .filter_map(|slot| slot.value.lock().clone())
            .collect()
    }
}
