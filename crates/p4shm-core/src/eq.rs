//! Event queues
//!
//! A bounded ring of full completion records. When the ring is full the
//! oldest record is overwritten and the next `get` reports the loss once.

use crate::atomic::AtomicOp;
use crate::datatype::Datatype;
use crate::handle::Handle;
use crate::types::{NiFail, ProcessId};
use crate::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Get,
    GetOverflow,
    Put,
    PutOverflow,
    Atomic,
    AtomicOverflow,
    FetchAtomic,
    FetchAtomicOverflow,
    Reply,
    Send,
    Ack,
    PtDisabled,
    Link,
    AutoUnlink,
    AutoFree,
    Search,
}

impl EventKind {
    /// Variant reported when a buffered header is resolved by a later append
    pub fn overflow_variant(self) -> Self {
        match self {
            EventKind::Get => EventKind::GetOverflow,
            EventKind::Put => EventKind::PutOverflow,
            EventKind::Atomic => EventKind::AtomicOverflow,
            EventKind::FetchAtomic => EventKind::FetchAtomicOverflow,
            other => other,
        }
    }
}

/// Completion record
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub kind: EventKind,
    pub initiator: ProcessId,
    pub pt_index: u32,
    pub uid: u32,
    pub jid: u32,
    pub match_bits: u64,
    /// Requested length
    pub rlength: u64,
    /// Delivered length
    pub mlength: u64,
    /// Offset into the target entry, or the offset requested by the initiator
    pub remote_offset: u64,
    /// Offset of the delivered data inside the entry buffer
    pub start: u64,
    pub user_ptr: u64,
    pub hdr_data: u64,
    pub ni_fail: NiFail,
    pub atomic_op: Option<AtomicOp>,
    pub atomic_type: Option<Datatype>,
    /// Entry the event refers to, if any
    pub entry: Option<Handle>,
}

impl Event {
    pub(crate) fn new(kind: EventKind, initiator: ProcessId) -> Self {
        Self {
            kind,
            initiator,
            pt_index: 0,
            uid: 0,
            jid: 0,
            match_bits: 0,
            rlength: 0,
            mlength: 0,
            remote_offset: 0,
            start: 0,
            user_ptr: 0,
            hdr_data: 0,
            ni_fail: NiFail::Ok,
            atomic_op: None,
            atomic_type: None,
            entry: None,
        }
    }
}

struct Ring {
    events: VecDeque<Event>,
    capacity: usize,
    dropped: bool,
    retired: bool,
}

pub struct EventQueue {
    ring: Mutex<Ring>,
    ready: Condvar,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(Ring {
                events: VecDeque::with_capacity(capacity),
                capacity: capacity.max(1),
                dropped: false,
                retired: false,
            }),
            ready: Condvar::new(),
        }
    }

    pub(crate) fn push(&self, event: Event) {
        let mut ring = self.ring.lock();
        if ring.retired {
            return;
        }
        if ring.events.len() == ring.capacity {
            ring.events.pop_front();
            ring.dropped = true;
        }
        ring.events.push_back(event);
        drop(ring);
        self.ready.notify_all();
    }

    fn take(ring: &mut Ring) -> Option<Result<Event>> {
        if ring.dropped {
            ring.dropped = false;
            return Some(Err(Error::EqDropped));
        }
        ring.events.pop_front().map(Ok)
    }

    /// Next event without blocking
    pub fn get(&self) -> Result<Event> {
        let mut ring = self.ring.lock();
        if ring.retired {
            return Err(Error::Interrupted);
        }
        Self::take(&mut ring).unwrap_or(Err(Error::EqEmpty))
    }

    /// Block until an event is available.
    pub fn wait(&self) -> Result<Event> {
        let mut ring = self.ring.lock();
        loop {
            if ring.retired {
                return Err(Error::Interrupted);
            }
            if let Some(r) = Self::take(&mut ring) {
                return r;
            }
            self.ready.wait(&mut ring);
        }
    }

    /// Block until an event is available or `timeout` elapses.
    pub fn poll(&self, timeout: Duration) -> Result<Event> {
        let deadline = Instant::now() + timeout;
        let mut ring = self.ring.lock();
        loop {
            if ring.retired {
                return Err(Error::Interrupted);
            }
            if let Some(r) = Self::take(&mut ring) {
                return r;
            }
            if self.ready.wait_until(&mut ring, deadline).timed_out() {
                return Self::take(&mut ring).unwrap_or(Err(Error::EqEmpty));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.ring.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wake every waiter with `Interrupted`; later pushes are discarded.
    pub(crate) fn retire(&self) {
        self.ring.lock().retired = true;
        self.ready.notify_all();
    }
}
