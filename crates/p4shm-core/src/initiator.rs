//! Initiator side of data movement
//!
//! An operation takes one fragment from the caller's pad, fills it with the
//! header and the first chunk of data and enqueues it on the target's
//! receive queue. The target answers on the same fragment through our ack
//! queue; [`complete`] either sends the next chunk in it (stop and wait) or
//! posts the completion and frees it.

use crate::atomic::{self, AtomicOp};
use crate::ct::{CtSink, CtValue, TriggeredAction};
use crate::datatype::Datatype;
use crate::eq::{Event, EventKind};
use crate::handle::{CtHandle, Handle, MdHandle};
use crate::header::{MsgHeader, MsgKind, OpKind, ResultCode, FLAG_SEND_DONE, OPERAND_SIZE};
use crate::layout::SizeClass;
use crate::md::MemoryDescriptor;
use crate::ni::{AppSink, Ni, NiState};
use crate::offset::RelRef;
use crate::process::Shared;
use crate::types::{AckReq, MdOptions, NiFail, NiKind, ProcessId};
use crate::{Error, Result};
use std::sync::Arc;

/// Where an operation goes on the target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Remote {
    pub target: ProcessId,
    pub pt_index: u32,
    pub match_bits: u64,
    /// Offset into the target entry
    pub offset: u64,
    pub user_ptr: u64,
    pub hdr_data: u64,
}

impl Remote {
    pub fn new(target: ProcessId, pt_index: u32) -> Self {
        Self {
            target,
            pt_index,
            match_bits: 0,
            offset: 0,
            user_ptr: 0,
            hdr_data: 0,
        }
    }

    pub fn with_match_bits(mut self, match_bits: u64) -> Self {
        self.match_bits = match_bits;
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_user_ptr(mut self, user_ptr: u64) -> Self {
        self.user_ptr = user_ptr;
        self
    }

    pub fn with_hdr_data(mut self, hdr_data: u64) -> Self {
        self.hdr_data = hdr_data;
        self
    }
}

/// A validated range of a bound descriptor
pub(crate) struct LocalRange {
    pub handle: Handle,
    pub md: Arc<MemoryDescriptor>,
    pub offset: u64,
}

/// A fully validated operation, ready to be sent now or when triggered
pub(crate) struct OpRequest {
    pub ni: NiKind,
    pub op: OpKind,
    /// Source of outgoing data
    pub put: Option<LocalRange>,
    /// Destination of reply data
    pub get: Option<LocalRange>,
    pub length: u64,
    pub ack_req: AckReq,
    pub remote: Remote,
    pub target_rank: u32,
    pub atomic: Option<(AtomicOp, Datatype)>,
    pub operand: [u8; OPERAND_SIZE],
}

impl OpRequest {
    /// Payload size of the fragment the first chunk travels in
    pub fn payload_size(&self, shared: &Shared) -> usize {
        let large = shared.large_capacity() as u64;
        MsgHeader::SIZE + self.length.min(large) as usize
    }
}

fn send_event(ni: &NiState, md: &MemoryDescriptor, hdr: &MsgHeader, sink: &mut dyn CtSink) {
    if let Some(ct) = md.ct.as_ref().filter(|_| md.options.contains(MdOptions::EVENT_CT_SEND)) {
        let n = if md.options.contains(MdOptions::EVENT_CT_BYTES) {
            hdr.length
        } else {
            1
        };
        sink.increment(ct, CtValue::success(n));
    }
    let suppressed = md.options.contains(MdOptions::EVENT_SEND_DISABLE)
        || md.options.contains(MdOptions::EVENT_SUCCESS_DISABLE);
    if let Some(eq) = md.eq.as_ref().filter(|_| !suppressed) {
        let mut event = Event::new(EventKind::Send, ni.peer(hdr.target));
        event.pt_index = hdr.pt_index;
        event.match_bits = hdr.match_bits;
        event.rlength = hdr.length;
        event.mlength = hdr.length;
        event.remote_offset = hdr.remote_offset;
        event.user_ptr = hdr.user_ptr;
        event.hdr_data = hdr.hdr_data;
        eq.push(event);
    }
}

/// Ack or reply once the target is done with the operation.
fn final_event(
    ni: &NiState,
    md: &MemoryDescriptor,
    op: OpKind,
    hdr: &MsgHeader,
    sink: &mut dyn CtSink,
) {
    let Some(fail) = hdr.result().ni_fail() else {
        return;
    };
    let (kind, count) = if op.has_reply() {
        (EventKind::Reply, MdOptions::EVENT_CT_REPLY)
    } else {
        (EventKind::Ack, MdOptions::EVENT_CT_ACK)
    };
    if let Some(ct) = md.ct.as_ref().filter(|_| md.options.contains(count)) {
        let by = match fail {
            NiFail::Ok if md.options.contains(MdOptions::EVENT_CT_BYTES) => {
                CtValue::success(hdr.mlength)
            }
            NiFail::Ok => CtValue::success(1),
            _ => CtValue::failure(1),
        };
        sink.increment(ct, by);
    }
    let ack_req = AckReq::from_u8(hdr.ack_req).unwrap_or(AckReq::Ack);
    if kind == EventKind::Ack && ack_req == AckReq::CtAck {
        return;
    }
    if fail == NiFail::Ok && md.options.contains(MdOptions::EVENT_SUCCESS_DISABLE) {
        return;
    }
    if let Some(eq) = md.eq.as_ref() {
        let mut event = Event::new(kind, ni.peer(hdr.target));
        event.pt_index = hdr.pt_index;
        event.match_bits = hdr.match_bits;
        event.rlength = hdr.length;
        event.mlength = hdr.mlength;
        event.remote_offset = hdr.delivered_offset;
        event.user_ptr = hdr.user_ptr;
        event.hdr_data = hdr.hdr_data;
        event.ni_fail = fail;
        if !matches!(op, OpKind::Put | OpKind::Get) {
            event.atomic_op = AtomicOp::from_u8(hdr.atomic_op);
            event.atomic_type = Datatype::from_u8(hdr.atomic_dt);
        }
        eq.push(event);
    }
}

/// Fill `frag` with the first chunk of `req` and send it.
pub(crate) fn start(
    shared: &Shared,
    ni: &NiState,
    req: &OpRequest,
    frag: RelRef,
    sink: &mut dyn CtSink,
) {
    // Safety: `frag` was just fetched from our own pad
    let mut view = unsafe { shared.segment.fragment(frag) };
    let capacity = view.capacity() as u64;
    let (hdr, data) = view.split_mut();

    *hdr = MsgHeader {
        kind: MsgKind::Request as u8,
        op: req.op as u8,
        ni: req.ni as u8,
        ack_req: req.ack_req as u8,
        src: ni.rank,
        target: req.target_rank,
        pt_index: req.remote.pt_index,
        uid: ni.uid,
        jid: ni.jid,
        match_bits: req.remote.match_bits,
        remote_offset: req.remote.offset,
        length: req.length,
        user_ptr: req.remote.user_ptr,
        hdr_data: req.remote.hdr_data,
        operand: req.operand,
        ..MsgHeader::default()
    };
    if let Some((op, dt)) = req.atomic {
        hdr.atomic_op = op as u8;
        hdr.atomic_dt = dt as u8;
    }
    if let Some(get) = &req.get {
        get.md.acquire();
        hdr.get_md = get.handle.raw();
        hdr.get_offset = get.offset;
    }
    if let Some(put) = &req.put {
        put.md.acquire();
        hdr.put_md = put.handle.raw();
        hdr.put_offset = put.offset;
        let n = req.length.min(capacity);
        if let Err(e) = put.md.read(put.offset, &mut data[..n as usize]) {
            tracing::error!(error = %e, "validated md range unreadable");
        }
        hdr.chunk_len = n;
        hdr.remaining = req.length - n;
        if n == req.length && matches!(req.op, OpKind::Put | OpKind::Atomic) {
            hdr.flags |= FLAG_SEND_DONE;
            send_event(ni, &put.md, hdr, sink);
        }
    } else {
        hdr.remaining = req.length;
    }
    tracing::debug!(
        src = ni.rank,
        target = req.target_rank,
        op = ?req.op,
        length = req.length,
        pt_index = req.remote.pt_index,
        "operation started"
    );
    shared.segment.send_request(req.target_rank, frag);
}

fn lookup(ni: &NiState, raw: u64) -> Option<Arc<MemoryDescriptor>> {
    if raw == 0 {
        return None;
    }
    ni.mds.get(Handle::from_raw(raw)).ok()
}

/// Handle a fragment returned by a target on our ack queue.
pub(crate) fn complete(shared: &Shared, frag: RelRef, sink: &mut dyn CtSink) {
    // Safety: the target handed the fragment back; we own it again
    let mut view = unsafe { shared.segment.fragment(frag) };
    let capacity = view.capacity() as u64;
    let (hdr, data) = view.split_mut();

    let ni = NiKind::from_u8(hdr.ni).and_then(|kind| shared.ni(kind));
    let (Some(ni), Some(op)) = (ni, hdr.op()) else {
        tracing::debug!(?frag, "ack for a finalized interface discarded");
        shared.segment.pool(shared.rank()).free(frag);
        return;
    };
    let put = lookup(&ni, hdr.put_md);
    let get = lookup(&ni, hdr.get_md);
    let failed = !matches!(
        hdr.result(),
        ResultCode::Silent | ResultCode::Success | ResultCode::Overflow
    );

    if op.has_reply() && !failed && hdr.chunk_len > 0 {
        if let Some(md) = &get {
            let at = hdr.get_offset + hdr.transferred - hdr.chunk_len;
            if let Err(e) = md.write(at, &data[..hdr.chunk_len as usize]) {
                tracing::error!(error = %e, "reply outside get md");
            }
        }
    }

    if hdr.remaining > 0 && !failed {
        hdr.kind = MsgKind::Request as u8;
        hdr.chunk_len = 0;
        if op == OpKind::Put {
            let n = hdr.remaining.min(capacity);
            if let Some(md) = &put {
                if let Err(e) = md.read(hdr.put_offset + hdr.transferred, &mut data[..n as usize]) {
                    tracing::error!(error = %e, "validated md range unreadable");
                }
                hdr.chunk_len = n;
                if n == hdr.remaining {
                    hdr.flags |= FLAG_SEND_DONE;
                    send_event(&ni, md, hdr, sink);
                }
            }
        }
        tracing::debug!(
            target = hdr.target,
            transferred = hdr.transferred,
            remaining = hdr.remaining,
            "next chunk"
        );
        shared.segment.send_request(hdr.target, frag);
        return;
    }

    if let Some(md) = &put {
        if hdr.flags & FLAG_SEND_DONE == 0 && matches!(op, OpKind::Put | OpKind::Atomic) {
            send_event(&ni, md, hdr, sink);
        }
        md.release();
    }
    if let Some(md) = &get {
        md.release();
    }
    let completion = if op.has_reply() { &get } else { &put };
    if let Some(md) = completion {
        final_event(&ni, md, op, hdr, sink);
    }
    tracing::debug!(
        target = hdr.target,
        ?op,
        result = ?hdr.result(),
        mlength = hdr.mlength,
        "operation complete"
    );
    shared.segment.pool(shared.rank()).free(frag);
}

impl Ni {
    fn local(&self, md: MdHandle, offset: u64, length: u64) -> Result<LocalRange> {
        let handle = md.handle();
        let md = self.state.mds.get(handle)?;
        md.check(offset, length)?;
        Ok(LocalRange { handle, md, offset })
    }

    fn request(
        &self,
        op: OpKind,
        length: u64,
        ack_req: AckReq,
        remote: &Remote,
    ) -> Result<OpRequest> {
        let target_rank = self.state.target_rank(remote.target)?;
        if length > self.state.limits.max_msg_size {
            return Err(Error::InvalidArgument(format!(
                "length {length} exceeds max message size {}",
                self.state.limits.max_msg_size
            )));
        }
        if remote.pt_index > self.state.limits.max_pt_index {
            return Err(Error::InvalidArgument(format!(
                "portal index {} out of range",
                remote.pt_index
            )));
        }
        Ok(OpRequest {
            ni: self.state.kind,
            op,
            put: None,
            get: None,
            length,
            ack_req,
            remote: *remote,
            target_rank,
            atomic: None,
            operand: [0; OPERAND_SIZE],
        })
    }

    fn atomic_request(
        &self,
        kind: OpKind,
        length: u64,
        ack_req: AckReq,
        remote: &Remote,
        op: AtomicOp,
        dt: Datatype,
    ) -> Result<OpRequest> {
        let mut req = self.request(kind, length, ack_req, remote)?;
        atomic::validate(kind, op, dt, length)?;
        let limit = self
            .state
            .limits
            .max_atomic_size
            .min(self.shared.large_capacity() as u64);
        if length > limit {
            return Err(Error::InvalidArgument(format!(
                "atomic length {length} exceeds {limit}"
            )));
        }
        req.atomic = Some((op, dt));
        Ok(req)
    }

    /// Send `req` now, blocking for a fragment if the pad is momentarily dry.
    fn submit(&self, req: OpRequest) -> Result<()> {
        let frag = self
            .shared
            .segment
            .pool(self.shared.rank())
            .fetch(req.payload_size(&self.shared));
        start(&self.shared, &self.state, &req, frag, &mut AppSink { shared: &self.shared });
        Ok(())
    }

    /// Write `length` bytes at `local_offset` of `md` to the target entry.
    pub fn put(
        &self,
        md: MdHandle,
        local_offset: u64,
        length: u64,
        ack_req: AckReq,
        remote: &Remote,
    ) -> Result<()> {
        let mut req = self.request(OpKind::Put, length, ack_req, remote)?;
        req.put = Some(self.local(md, local_offset, length)?);
        self.submit(req)
    }

    /// Read `length` bytes of the target entry into `md` at `local_offset`.
    pub fn get(&self, md: MdHandle, local_offset: u64, length: u64, remote: &Remote) -> Result<()> {
        let mut req = self.request(OpKind::Get, length, AckReq::Ack, remote)?;
        req.get = Some(self.local(md, local_offset, length)?);
        self.submit(req)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn atomic(
        &self,
        md: MdHandle,
        local_offset: u64,
        length: u64,
        ack_req: AckReq,
        remote: &Remote,
        op: AtomicOp,
        dt: Datatype,
    ) -> Result<()> {
        let mut req = self.atomic_request(OpKind::Atomic, length, ack_req, remote, op, dt)?;
        req.put = Some(self.local(md, local_offset, length)?);
        self.submit(req)
    }

    /// Apply `op` at the target and return the previous contents into
    /// `get_md`.
    #[allow(clippy::too_many_arguments)]
    pub fn fetch_atomic(
        &self,
        get_md: MdHandle,
        get_offset: u64,
        put_md: MdHandle,
        put_offset: u64,
        length: u64,
        remote: &Remote,
        op: AtomicOp,
        dt: Datatype,
    ) -> Result<()> {
        let mut req =
            self.atomic_request(OpKind::FetchAtomic, length, AckReq::Ack, remote, op, dt)?;
        req.get = Some(self.local(get_md, get_offset, length)?);
        req.put = Some(self.local(put_md, put_offset, length)?);
        self.submit(req)
    }

    /// Swap family. `operand` is compared against the target (`Cswap*`) or
    /// used as the bit mask (`Mswap`).
    #[allow(clippy::too_many_arguments)]
    pub fn swap(
        &self,
        get_md: MdHandle,
        get_offset: u64,
        put_md: MdHandle,
        put_offset: u64,
        length: u64,
        remote: &Remote,
        operand: &[u8],
        op: AtomicOp,
        dt: Datatype,
    ) -> Result<()> {
        let mut req = self.atomic_request(OpKind::Swap, length, AckReq::Ack, remote, op, dt)?;
        if op.needs_operand() {
            if operand.len() != dt.size() {
                return Err(Error::InvalidArgument(format!(
                    "operand of {} bytes for {dt:?}",
                    operand.len()
                )));
            }
            req.operand[..operand.len()].copy_from_slice(operand);
        }
        req.get = Some(self.local(get_md, get_offset, length)?);
        req.put = Some(self.local(put_md, put_offset, length)?);
        self.submit(req)
    }

    /// Like [`put`](Self::put), issued once `trigger` counts `threshold`
    /// successes.
    #[allow(clippy::too_many_arguments)]
    pub fn triggered_put(
        &self,
        md: MdHandle,
        local_offset: u64,
        length: u64,
        ack_req: AckReq,
        remote: &Remote,
        trigger: CtHandle,
        threshold: u64,
    ) -> Result<()> {
        let mut req = self.request(OpKind::Put, length, ack_req, remote)?;
        req.put = Some(self.local(md, local_offset, length)?);
        self.arm(trigger, threshold, TriggeredAction::Put(Box::new(req)))
    }
}

/// Inline data capacity of a large fragment
pub(crate) fn large_capacity(layout: &crate::layout::PadLayout) -> usize {
    layout.payload_size(SizeClass::Large) - MsgHeader::SIZE
}
