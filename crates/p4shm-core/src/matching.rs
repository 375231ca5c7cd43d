//! Match-and-deliver engine
//!
//! The data-movement thread runs [`Matcher::request`] for every request
//! fragment. The portal-table lock is held while an entry is selected; a
//! use-once (or exhausted managed-local) entry is unlinked and the lock
//! released before its data moves, a persistent entry is delivered under the
//! lock. Messages larger than one fragment leave a continuation behind that
//! the following chunks resume.
//!
//! Appends run the same logic in reverse against buffered unexpected headers.

use crate::atomic::{self, AtomicOp};
use crate::ct::{CtSink, CtValue};
use crate::datatype::Datatype;
use crate::entry::{delivered_length, Entry, EntrySpec};
use crate::eq::{Event, EventKind, EventQueue};
use crate::error::fatal;
use crate::handle::{EntryHandle, SlotState};
use crate::header::{MsgHeader, OpKind, ResultCode, FLAG_TRUNCATED};
use crate::ni::NiState;
use crate::pt::{PtLists, PtStatus};
use crate::types::{AckReq, EntryOptions, ListKind, NiFail, SearchOp};
use crate::unexpected::{Buffered, Payload};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// State kept between the chunks of one oversized message
pub(crate) enum Continuation {
    Deliver {
        entry: Arc<Entry>,
        list: ListKind,
        offset: u64,
        unlinked: bool,
        eq: Option<Arc<EventQueue>>,
    },
    Buffer {
        pt_index: u32,
        slot: u32,
    },
}

fn event_kind(op: OpKind) -> EventKind {
    match op {
        OpKind::Put => EventKind::Put,
        OpKind::Get => EventKind::Get,
        OpKind::Atomic => EventKind::Atomic,
        OpKind::FetchAtomic | OpKind::Swap => EventKind::FetchAtomic,
    }
}

/// Operations that may land in the overflow list or be buffered unexpected
fn bufferable(op: OpKind) -> bool {
    matches!(op, OpKind::Put | OpKind::Atomic)
}

fn atomic_args(hdr: &MsgHeader) -> Option<(AtomicOp, Datatype)> {
    Some((AtomicOp::from_u8(hdr.atomic_op)?, Datatype::from_u8(hdr.atomic_dt)?))
}

/// Accepted length, rounded down to whole elements for atomics
fn accepted(entry: &Entry, op: OpKind, hdr: &MsgHeader, offset: u64, length: u64) -> u64 {
    let mlength = delivered_length(entry.length, offset, length);
    match (op, atomic_args(hdr)) {
        (OpKind::Put | OpKind::Get, _) => mlength,
        (_, Some((_, dt))) => mlength - mlength % dt.size() as u64,
        (_, None) => 0,
    }
}

/// Complete event record for a delivery into `entry`
fn target_event(ni: &NiState, kind: EventKind, entry: &Entry, hdr: &MsgHeader) -> Event {
    let mut event = Event::new(kind, ni.peer(hdr.src));
    event.pt_index = hdr.pt_index;
    event.uid = hdr.uid;
    event.jid = hdr.jid;
    event.match_bits = hdr.match_bits;
    event.rlength = hdr.length;
    event.mlength = hdr.mlength;
    event.remote_offset = hdr.remote_offset;
    event.start = entry.start as u64 + hdr.delivered_offset;
    event.user_ptr = entry.user_ptr;
    event.hdr_data = hdr.hdr_data;
    let is_atomic = !matches!(hdr.op(), Some(OpKind::Put | OpKind::Get));
    if let Some((op, dt)) = atomic_args(hdr).filter(|_| is_atomic) {
        event.atomic_op = Some(op);
        event.atomic_type = Some(dt);
    }
    event.entry = Some(entry.handle);
    event
}

fn unlink_event(ni: &NiState, kind: EventKind, entry: &Entry, eq: Option<&EventQueue>) {
    if let Some(eq) = eq {
        let mut event = Event::new(kind, ni.peer(ni.rank));
        event.pt_index = entry.pt_index;
        event.user_ptr = entry.user_ptr;
        event.entry = Some(entry.handle);
        eq.push(event);
    }
}

/// Report a completed delivery on the entry's event queue and counter.
fn announce(
    entry: &Entry,
    eq: Option<&EventQueue>,
    event: Event,
    resolved: bool,
    sink: &mut dyn CtSink,
) {
    let (disable, count) = if resolved {
        (EntryOptions::EVENT_OVER_DISABLE, EntryOptions::EVENT_CT_OVERFLOW)
    } else {
        (EntryOptions::EVENT_COMM_DISABLE, EntryOptions::EVENT_CT_COMM)
    };
    if let Some(ct) = entry.ct.as_ref().filter(|_| entry.has(count)) {
        let n = if entry.has(EntryOptions::EVENT_CT_BYTES) {
            event.mlength
        } else {
            1
        };
        sink.increment(ct, CtValue::success(n));
    }
    if let Some(eq) = eq {
        if !entry.has(disable) && !entry.has(EntryOptions::EVENT_SUCCESS_DISABLE) {
            eq.push(event);
        }
    }
}

/// Move this fragment's share of a delivery. Returns the bytes consumed.
fn transfer(entry: &Entry, op: OpKind, hdr: &mut MsgHeader, data: &mut [u8], offset: u64) -> u64 {
    let done = hdr.transferred;
    let left = hdr.mlength - done;
    let moved = match op {
        _ if left == 0 => {
            if op.has_reply() {
                hdr.chunk_len = 0;
            }
            Ok(0)
        }
        OpKind::Put => {
            let n = hdr.chunk_len.min(left);
            entry.write(offset + done, &data[..n as usize]).map(|_| n)
        }
        OpKind::Get => {
            let n = left.min(data.len() as u64);
            hdr.chunk_len = n;
            entry.read(offset + done, &mut data[..n as usize]).map(|_| n)
        }
        OpKind::Atomic | OpKind::FetchAtomic | OpKind::Swap => {
            let Some((aop, dt)) = atomic_args(hdr) else {
                fatal("atomic request without operation")
            };
            let len = left as usize;
            // Safety: the data-movement thread owns the entry for this delivery
            unsafe { entry.target_mut(offset, left) }.and_then(|target| match op {
                OpKind::Atomic => atomic::perform(aop, dt, target, &data[..len]),
                OpKind::FetchAtomic => atomic::perform_fetch(aop, dt, target, &mut data[..len]),
                _ => atomic::perform_with_operand(aop, dt, target, &mut data[..len], &hdr.operand),
            })
            .map(|_| {
                if op.has_reply() {
                    hdr.chunk_len = left;
                }
                left
            })
        }
    };
    match moved {
        Ok(n) => n,
        Err(e) => {
            tracing::error!(error = %e, handle = ?entry.handle, "delivery outside entry bounds");
            fatal("delivery failed")
        }
    }
}

/// Reject a request without moving data.
fn refuse(hdr: &mut MsgHeader, code: ResultCode) {
    hdr.mlength = 0;
    hdr.remaining = 0;
    hdr.moredata = 0;
    hdr.chunk_len = 0;
    hdr.set_result(code);
}

/// Result code of a finished operation
fn ack_result(op: OpKind, hdr: &MsgHeader, entry: Option<&Entry>, list: ListKind) -> ResultCode {
    let no_ack = AckReq::from_u8(hdr.ack_req) == Some(AckReq::NoAck)
        || entry.is_some_and(|e| e.has(EntryOptions::ACK_DISABLE));
    if !op.has_reply() && no_ack {
        ResultCode::Silent
    } else if list == ListKind::Overflow {
        ResultCode::Overflow
    } else {
        ResultCode::Success
    }
}

/// Target side of the data-movement engine. Owned by the data-movement thread.
pub(crate) struct Matcher {
    continuations: HashMap<u64, Continuation>,
    next_token: u64,
}

impl Matcher {
    pub fn new() -> Self {
        Self {
            continuations: HashMap::new(),
            next_token: 1,
        }
    }

    /// Transfers waiting for their next chunk
    pub fn pending(&self) -> usize {
        self.continuations.len()
    }

    fn park(&mut self, continuation: Continuation) -> u64 {
        let token = self.next_token;
        self.next_token += 1;
        self.continuations.insert(token, continuation);
        token
    }

    /// Apply one request fragment. On return the header carries the ack.
    pub fn request(
        &mut self,
        ni: Option<&NiState>,
        hdr: &mut MsgHeader,
        data: &mut [u8],
        sink: &mut dyn CtSink,
    ) {
        let Some(ni) = ni else {
            tracing::warn!(src = hdr.src, ni = hdr.ni, "request for an uninitialized interface");
            return refuse(hdr, ResultCode::Dropped);
        };
        if hdr.moredata != 0 {
            return self.resume(ni, hdr, data, sink);
        }
        let Some(op) = hdr.op() else {
            ni.count_drop();
            tracing::warn!(src = hdr.src, op = hdr.op, "unknown operation dropped");
            return refuse(hdr, ResultCode::Dropped);
        };
        let Some(pt) = ni.pt(hdr.pt_index) else {
            ni.count_drop();
            tracing::warn!(src = hdr.src, pt_index = hdr.pt_index, "portal index out of range");
            return refuse(hdr, ResultCode::Dropped);
        };

        let lists = pt.lock();
        match pt.status() {
            PtStatus::Enabled => {}
            PtStatus::Disabled => {
                let eq = lists.eq.clone();
                drop(lists);
                ni.count_drop();
                let (src, pt_index) = (hdr.src, hdr.pt_index);
                tracing::warn!(src, pt_index, "message to disabled portal dropped");
                if let Some(eq) = eq {
                    let mut event = Event::new(EventKind::PtDisabled, ni.peer(hdr.src));
                    event.pt_index = hdr.pt_index;
                    event.match_bits = hdr.match_bits;
                    event.rlength = hdr.length;
                    event.ni_fail = NiFail::PtDisabled;
                    eq.push(event);
                }
                return refuse(hdr, ResultCode::PtDisabled);
            }
            PtStatus::Free => {
                drop(lists);
                ni.count_drop();
                let (src, pt_index) = (hdr.src, hdr.pt_index);
                tracing::warn!(src, pt_index, "message to unallocated portal dropped");
                return refuse(hdr, ResultCode::Dropped);
            }
        }

        let found = lists
            .priority
            .iter()
            .position(|e| e.matches_header(hdr))
            .map(|pos| (ListKind::Priority, pos))
            .or_else(|| {
                if !bufferable(op) {
                    return None;
                }
                lists
                    .overflow
                    .iter()
                    .position(|e| e.matches_header(hdr))
                    .map(|pos| (ListKind::Overflow, pos))
            });

        match found {
            Some((list, pos)) => self.deliver(ni, lists, list, pos, op, hdr, data, sink),
            None if bufferable(op) => self.buffer(ni, lists, hdr, data),
            None => {
                drop(lists);
                ni.count_drop();
                let (src, pt_index) = (hdr.src, hdr.pt_index);
                tracing::warn!(src, pt_index, ?op, "no matching entry, dropped");
                refuse(hdr, ResultCode::Dropped);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn deliver(
        &mut self,
        ni: &NiState,
        mut lists: parking_lot::MutexGuard<'_, PtLists>,
        list: ListKind,
        pos: usize,
        op: OpKind,
        hdr: &mut MsgHeader,
        data: &mut [u8],
        sink: &mut dyn CtSink,
    ) {
        let entry = Arc::clone(&lists.list(list)[pos]);
        if !entry.permits(hdr, op) {
            drop(lists);
            ni.count_violation();
            tracing::warn!(
                src = hdr.src,
                uid = hdr.uid,
                jid = hdr.jid,
                ?op,
                handle = ?entry.handle,
                "permission violation"
            );
            return refuse(hdr, ResultCode::PermViolation);
        }

        let offset = entry.dest_offset(hdr.remote_offset);
        let mlength = accepted(&entry, op, hdr, offset, hdr.length);
        let exhausted = entry.claim_local(mlength);
        let unlinked = entry.unlinks_after(exhausted);
        if !ni.entries.begin_use(entry.handle) {
            fatal("matched entry was freed");
        }
        if unlinked {
            lists.list_mut(list).remove(pos);
        }
        let eq = lists.eq.clone();

        hdr.mlength = mlength;
        hdr.delivered_offset = offset;
        hdr.transferred = 0;
        if mlength < hdr.length {
            hdr.flags |= FLAG_TRUNCATED;
        }

        if list == ListKind::Overflow {
            if op == OpKind::Put && hdr.chunk_len < mlength {
                fatal("multi-fragment message delivered into the overflow list");
            }
            entry.hold_header();
            let remembered = Buffered {
                hdr: *hdr,
                payload: Payload::Overflow {
                    entry: Arc::clone(&entry),
                    offset,
                },
                complete: true,
            };
            match ni.unexpected.insert(remembered) {
                Ok(slot) => lists.unexpected.push_back(slot),
                Err(_) => fatal("unexpected header pool exhausted"),
            }
        }

        // Use-once deliveries do not block appends on this portal index
        let guard = if unlinked {
            drop(lists);
            None
        } else {
            Some(lists)
        };

        let moved = transfer(&entry, op, hdr, data, offset);
        hdr.transferred = moved;
        hdr.remaining = mlength - moved;
        tracing::debug!(
            src = hdr.src,
            pt_index = hdr.pt_index,
            ?op,
            ?list,
            mlength,
            moved,
            "delivered"
        );
        if hdr.remaining > 0 {
            if !op.has_reply() {
                hdr.chunk_len = 0;
            }
            hdr.moredata = self.park(Continuation::Deliver {
                entry,
                list,
                offset,
                unlinked,
                eq,
            });
            hdr.set_result(ResultCode::Success);
            return;
        }
        self.finish(ni, &entry, list, unlinked, eq.as_deref(), op, hdr, sink);
        drop(guard);
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &mut self,
        ni: &NiState,
        entry: &Arc<Entry>,
        list: ListKind,
        unlinked: bool,
        eq: Option<&EventQueue>,
        op: OpKind,
        hdr: &mut MsgHeader,
        sink: &mut dyn CtSink,
    ) {
        if !op.has_reply() {
            hdr.chunk_len = 0;
        }
        hdr.moredata = 0;
        hdr.remaining = 0;
        announce(entry, eq, target_event(ni, event_kind(op), entry, hdr), false, sink);
        if unlinked {
            if !entry.has(EntryOptions::EVENT_UNLINK_DISABLE) {
                unlink_event(ni, EventKind::AutoUnlink, entry, eq);
            }
            if entry.mark_unlinked() && list == ListKind::Overflow {
                unlink_event(ni, EventKind::AutoFree, entry, eq);
            }
            if ni.entries.free_in_use(entry.handle).is_err() {
                fatal("use-once entry freed twice");
            }
        } else {
            ni.entries.end_use(entry.handle);
        }
        let code = ack_result(op, hdr, Some(entry), list);
        hdr.set_result(code);
    }

    /// No entry matched: remember the message for a later append.
    fn buffer(
        &mut self,
        ni: &NiState,
        mut lists: parking_lot::MutexGuard<'_, PtLists>,
        hdr: &mut MsgHeader,
        data: &[u8],
    ) {
        let n = hdr.chunk_len.min(hdr.length);
        let mut owned = Vec::with_capacity(hdr.length as usize);
        owned.extend_from_slice(&data[..n as usize]);
        hdr.mlength = hdr.length;
        hdr.delivered_offset = 0;
        hdr.transferred = n;
        hdr.remaining = hdr.length - n;
        let remembered = Buffered {
            hdr: *hdr,
            payload: Payload::Owned(owned),
            complete: hdr.remaining == 0,
        };
        let slot = match ni.unexpected.insert(remembered) {
            Ok(slot) => slot,
            Err(_) => fatal("unexpected header pool exhausted"),
        };
        lists.unexpected.push_back(slot);
        drop(lists);
        tracing::debug!(
            src = hdr.src,
            pt_index = hdr.pt_index,
            length = hdr.length,
            slot,
            "buffered unexpected header"
        );

        if hdr.remaining > 0 {
            hdr.moredata = self.park(Continuation::Buffer {
                pt_index: hdr.pt_index,
                slot,
            });
            hdr.set_result(ResultCode::Success);
        } else {
            hdr.moredata = 0;
            let op = hdr.op().unwrap_or(OpKind::Put);
            let code = ack_result(op, hdr, None, ListKind::Priority);
            hdr.set_result(code);
        }
    }

    /// Next chunk of a message that did not fit one fragment.
    fn resume(
        &mut self,
        ni: &NiState,
        hdr: &mut MsgHeader,
        data: &mut [u8],
        sink: &mut dyn CtSink,
    ) {
        let token = hdr.moredata;
        let Some(continuation) = self.continuations.remove(&token) else {
            fatal("chunk for an unknown transfer")
        };
        let op = hdr.op().unwrap_or(OpKind::Put);
        match continuation {
            Continuation::Deliver {
                entry,
                list,
                offset,
                unlinked,
                eq,
            } => {
                let moved = transfer(&entry, op, hdr, data, offset);
                hdr.transferred += moved;
                hdr.remaining = hdr.mlength - hdr.transferred;
                if hdr.remaining > 0 {
                    if !op.has_reply() {
                        hdr.chunk_len = 0;
                    }
                    self.continuations.insert(
                        token,
                        Continuation::Deliver {
                            entry,
                            list,
                            offset,
                            unlinked,
                            eq,
                        },
                    );
                    hdr.set_result(ResultCode::Success);
                    return;
                }
                self.finish(ni, &entry, list, unlinked, eq.as_deref(), op, hdr, sink);
            }
            Continuation::Buffer { pt_index, slot } => {
                let n = hdr.chunk_len.min(hdr.remaining);
                let complete = {
                    let mut guard = ni.unexpected.get(slot);
                    let Some(buffered) = guard.as_mut() else {
                        fatal("buffered header vanished mid-transfer")
                    };
                    if let Payload::Owned(owned) = &mut buffered.payload {
                        owned.extend_from_slice(&data[..n as usize]);
                    }
                    buffered.complete = owned_len(buffered) == buffered.hdr.length;
                    buffered.complete
                };
                hdr.transferred += n;
                hdr.remaining -= n;
                if !complete {
                    self.continuations.insert(token, Continuation::Buffer { pt_index, slot });
                    hdr.set_result(ResultCode::Success);
                    return;
                }
                hdr.moredata = 0;
                let code = ack_result(op, hdr, None, ListKind::Priority);
                hdr.set_result(code);
                // Entries appended while the message was still arriving
                ni.resolve_late(pt_index, slot, sink);
            }
        }
    }
}

fn owned_len(buffered: &Buffered) -> u64 {
    match &buffered.payload {
        Payload::Owned(data) => data.len() as u64,
        Payload::Overflow { .. } => buffered.hdr.mlength,
    }
}

impl NiState {
    /// Deliver a buffered header into `entry`. The entry must be Allocated;
    /// `linked_at` is its position in its list if it is already linked.
    /// Returns whether the entry was unlinked by the delivery.
    fn resolve(
        &self,
        lists: &mut PtLists,
        entry: &Arc<Entry>,
        linked_at: Option<usize>,
        buffered: Buffered,
        sink: &mut dyn CtSink,
    ) -> bool {
        let op = buffered.hdr.op().unwrap_or(OpKind::Put);
        let mut hdr = buffered.hdr;
        let (unlinked, start) = match &buffered.payload {
            // Already in the overflow entry's memory; report it there
            Payload::Overflow { entry: holder, offset } => {
                (entry.unlinks_after(false), holder.start as u64 + offset)
            }
            Payload::Owned(_) => {
                let offset = entry.dest_offset(hdr.remote_offset);
                let mlength = accepted(entry, op, &hdr, offset, hdr.length);
                let exhausted = entry.claim_local(mlength);
                let mut data = vec![0u8; mlength as usize];
                buffered.read(&mut data);
                let moved = match (op, atomic_args(&hdr)) {
                    (OpKind::Atomic, Some((aop, dt))) if mlength > 0 => {
                        // Safety: the entry is InUse and owned by this call
                        unsafe { entry.target_mut(offset, mlength) }
                            .and_then(|target| atomic::perform(aop, dt, target, &data))
                    }
                    (OpKind::Atomic, _) => Ok(()),
                    _ if mlength == 0 => Ok(()),
                    _ => entry.write(offset, &data),
                };
                if let Err(e) = moved {
                    tracing::warn!(error = %e, "buffered header could not be delivered");
                }
                hdr.mlength = mlength;
                hdr.delivered_offset = offset;
                (entry.unlinks_after(exhausted), entry.start as u64 + offset)
            }
        };
        if let (true, Some(pos)) = (unlinked, linked_at) {
            lists.list_mut(entry.list).remove(pos);
        }

        let eq = lists.eq.clone();
        let (kind, resolved) = if buffered.from_overflow() {
            (event_kind(op).overflow_variant(), true)
        } else {
            (event_kind(op), false)
        };
        let mut event = target_event(self, kind, entry, &hdr);
        event.start = start;
        announce(entry, eq.as_deref(), event, resolved, sink);
        if let Payload::Overflow { entry: holder, .. } = &buffered.payload {
            if holder.release_header() {
                unlink_event(self, EventKind::AutoFree, holder, eq.as_deref());
            }
        }
        tracing::debug!(
            src = hdr.src,
            pt_index = hdr.pt_index,
            mlength = hdr.mlength,
            "resolved buffered header"
        );

        if unlinked {
            if !entry.has(EntryOptions::EVENT_UNLINK_DISABLE) {
                unlink_event(self, EventKind::AutoUnlink, entry, eq.as_deref());
            }
            entry.mark_unlinked();
            if self.entries.free_in_use(entry.handle).is_err() {
                tracing::error!(handle = ?entry.handle, "resolved entry was not in use");
            }
        } else {
            self.entries.end_use(entry.handle);
        }
        unlinked
    }

    /// A buffered message just completed; hand it to the first priority
    /// entry that was appended while it was still arriving.
    fn resolve_late(&self, pt_index: u32, slot: u32, sink: &mut dyn CtSink) {
        let Some(pt) = self.pt(pt_index) else { return };
        let mut lists = pt.lock();
        let Some(at) = lists.unexpected.iter().position(|&s| s == slot) else {
            return;
        };
        let hdr = match self.unexpected.get(slot).as_ref() {
            Some(buffered) => buffered.hdr,
            None => return,
        };
        let op = hdr.op().unwrap_or(OpKind::Put);
        let Some(pos) = lists
            .priority
            .iter()
            .position(|e| e.matches_header(&hdr) && e.permits(&hdr, op))
        else {
            return;
        };
        let entry = Arc::clone(&lists.priority[pos]);
        if !self.entries.begin_use(entry.handle) {
            return;
        }
        lists.unexpected.remove(at);
        if let Some(buffered) = self.unexpected.take(slot) {
            self.resolve(&mut lists, &entry, Some(pos), buffered, sink);
        }
    }

    /// Post an entry, first resolving buffered headers it would have matched.
    pub(crate) fn append(
        &self,
        pt_index: u32,
        list: ListKind,
        spec: &EntrySpec,
        sink: &mut dyn CtSink,
    ) -> Result<EntryHandle> {
        let pt = self
            .pt(pt_index)
            .filter(|pt| pt.status() != PtStatus::Free)
            .ok_or_else(|| {
                Error::InvalidArgument(format!("portal index {pt_index} not allocated"))
            })?;
        if !matches!(spec.start.checked_add(spec.length), Some(end) if end <= spec.buf.len()) {
            return Err(Error::InvalidArgument("entry range outside its buffer".to_string()));
        }
        let ct = spec.ct.map(|h| self.cts.get(h.handle())).transpose()?;
        let matching = self.kind.is_matching();
        let (handle, entry) = self
            .entries
            .alloc(|h| Entry::new(h, pt_index, list, matching, spec, ct))?;

        let mut lists = pt.lock();
        if list == ListKind::Priority {
            let mut i = 0;
            while i < lists.unexpected.len() {
                let slot = lists.unexpected[i];
                let eligible = self.unexpected.get(slot).as_ref().is_some_and(|b| {
                    b.complete
                        && entry.matches_header(&b.hdr)
                        && b.hdr.op().is_some_and(|op| entry.permits(&b.hdr, op))
                });
                if !eligible {
                    i += 1;
                    continue;
                }
                lists.unexpected.remove(i);
                let Some(buffered) = self.unexpected.take(slot) else {
                    continue;
                };
                if !self.entries.begin_use(handle) {
                    fatal("fresh entry is not allocated");
                }
                if self.resolve(&mut lists, &entry, None, buffered, sink) {
                    return Ok(handle.into());
                }
            }
        }

        if !entry.has(EntryOptions::EVENT_LINK_DISABLE) {
            if let Some(eq) = lists.eq.as_deref() {
                unlink_event(self, EventKind::Link, &entry, Some(eq));
            }
        }
        lists.list_mut(list).push_back(entry);
        tracing::debug!(pt_index, ?list, ?handle, "entry linked");
        Ok(handle.into())
    }

    /// Remove a posted entry and free its slot.
    pub(crate) fn unlink(&self, handle: EntryHandle) -> Result<()> {
        let h = handle.handle();
        let entry = self.entries.get(h)?;
        let pt = self.pt(entry.pt_index).ok_or(Error::InvalidHandle(h.raw()))?;
        let mut lists = pt.lock();
        if self.entries.state(h) == SlotState::InUse {
            return Err(Error::InUse);
        }
        lists.remove(h);
        self.entries.free(h)?;
        entry.mark_unlinked();
        tracing::debug!(?handle, pt_index = entry.pt_index, "entry unlinked");
        Ok(())
    }

    /// Look up the first buffered header `spec` would match.
    pub(crate) fn search(
        &self,
        pt_index: u32,
        spec: &EntrySpec,
        op: SearchOp,
        sink: &mut dyn CtSink,
    ) -> Result<()> {
        let pt = self
            .pt(pt_index)
            .filter(|pt| pt.status() != PtStatus::Free)
            .ok_or_else(|| {
                Error::InvalidArgument(format!("portal index {pt_index} not allocated"))
            })?;
        let ct = spec.ct.map(|h| self.cts.get(h.handle())).transpose()?;
        let matching = self.kind.is_matching();
        let mut lists = pt.lock();
        let eq = lists.eq.clone();
        let found = lists.unexpected.iter().position(|&slot| {
            self.unexpected
                .get(slot)
                .as_ref()
                .is_some_and(|b| b.complete && spec.matches(matching, b.hdr.src, b.hdr.match_bits))
        });

        let mut event = Event::new(EventKind::Search, self.peer(self.rank));
        event.pt_index = pt_index;
        event.ni_fail = NiFail::NoMatch;
        if let Some(pos) = found {
            let slot = lists.unexpected[pos];
            if let Some(b) = self.unexpected.get(slot).as_ref() {
                event.initiator = self.peer(b.hdr.src);
                event.uid = b.hdr.uid;
                event.jid = b.hdr.jid;
                event.match_bits = b.hdr.match_bits;
                event.rlength = b.hdr.length;
                event.mlength = b.hdr.mlength;
                event.remote_offset = b.hdr.remote_offset;
                event.start = b.hdr.delivered_offset;
                event.hdr_data = b.hdr.hdr_data;
                event.ni_fail = NiFail::Ok;
                if let Payload::Overflow { entry, .. } = &b.payload {
                    event.entry = Some(entry.handle);
                }
            }
            if op == SearchOp::SearchDelete {
                lists.unexpected.remove(pos);
                if let Some(Buffered {
                    payload: Payload::Overflow { entry, .. },
                    ..
                }) = self.unexpected.take(slot)
                {
                    if entry.release_header() {
                        unlink_event(self, EventKind::AutoFree, &entry, eq.as_deref());
                    }
                }
            }
            let counts = spec.options.contains(EntryOptions::EVENT_CT_COMM);
            if let Some(ct) = ct.as_ref().filter(|_| counts) {
                let n = if spec.options.contains(EntryOptions::EVENT_CT_BYTES) {
                    event.mlength
                } else {
                    1
                };
                sink.increment(ct, CtValue::success(n));
            }
        }
        drop(lists);
        event.user_ptr = spec.user_ptr;
        if let Some(eq) = eq {
            eq.push(event);
        }
        Ok(())
    }
}
