//! Network interfaces
//!
//! [`NiState`] holds the per-interface tables shared by the application and
//! the data-movement thread; [`Ni`] is the application's handle to it.

use crate::config::Config;
use crate::ct::{CountingEvent, CtSink, CtValue, TriggeredAction};
use crate::entry::{Entry, EntrySpec};
use crate::eq::{Event, EventQueue};
use crate::handle::{CtHandle, EntryHandle, EqHandle, HandleKind, MdHandle, SlotTable};
use crate::header::Command;
use crate::md::{MdSpec, MemoryDescriptor};
use crate::process::Shared;
use crate::pt::{PtEntry, PtStatus};
use crate::types::{ListKind, NiKind, NiLimits, ProcessId, SearchOp, StatusRegister, PT_ANY};
use crate::unexpected::UnexpectedPool;
use crate::{Error, Result};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub(crate) struct NiState {
    pub kind: NiKind,
    pub rank: u32,
    pub num_procs: u32,
    pub uid: u32,
    pub jid: u32,
    pub limits: NiLimits,
    pts: Box<[PtEntry]>,
    pub entries: SlotTable<Entry>,
    pub mds: SlotTable<MemoryDescriptor>,
    pub cts: SlotTable<CountingEvent>,
    pub eqs: SlotTable<EventQueue>,
    pub unexpected: UnexpectedPool,
    drop_count: AtomicU64,
    perm_violations: AtomicU64,
    pub triggered: AtomicU32,
}

impl NiState {
    pub fn new(kind: NiKind, config: &Config, limits: NiLimits) -> Self {
        let ni = kind as u8;
        Self {
            kind,
            rank: config.rank,
            num_procs: config.num_procs,
            uid: config.uid,
            jid: config.jid,
            limits,
            pts: (0..=limits.max_pt_index).map(|_| PtEntry::new()).collect(),
            entries: SlotTable::new(HandleKind::Entry, ni, limits.max_entries),
            mds: SlotTable::new(HandleKind::Md, ni, limits.max_mds),
            cts: SlotTable::new(HandleKind::Ct, ni, limits.max_cts),
            eqs: SlotTable::new(HandleKind::Eq, ni, limits.max_eqs),
            unexpected: UnexpectedPool::new(limits.max_unexpected_headers),
            drop_count: AtomicU64::new(0),
            perm_violations: AtomicU64::new(0),
            triggered: AtomicU32::new(0),
        }
    }

    pub fn pt(&self, index: u32) -> Option<&PtEntry> {
        self.pts.get(index as usize)
    }

    /// Peer id in the addressing mode of this interface
    pub fn peer(&self, rank: u32) -> ProcessId {
        ProcessId::for_ni(self.kind, rank)
    }

    pub fn count_drop(&self) {
        self.drop_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_violation(&self) {
        self.perm_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn status(&self, register: StatusRegister) -> u64 {
        match register {
            StatusRegister::DropCount => self.drop_count.load(Ordering::Relaxed),
            StatusRegister::PermissionViolations => self.perm_violations.load(Ordering::Relaxed),
        }
    }

    /// Resolve a peer address to a rank of this group.
    pub fn target_rank(&self, target: ProcessId) -> Result<u32> {
        let addressing_ok = matches!(
            (target, self.kind.is_logical()),
            (ProcessId::Logical { .. }, true) | (ProcessId::Physical { .. }, false)
        );
        match target.rank() {
            Some(rank) if addressing_ok && rank < self.num_procs => Ok(rank),
            _ => Err(Error::InvalidArgument(format!("no such peer {target:?}"))),
        }
    }

    /// Wake every waiter on this interface's queues and counters.
    pub fn retire(&self) {
        for eq in self.eqs.drain() {
            eq.retire();
        }
        for ct in self.cts.drain() {
            // Counters freed through `ct_free` settled their triggers there
            if let Ok(discarded) = ct.retire() {
                if discarded > 0 {
                    self.triggered.fetch_sub(discarded as u32, Ordering::AcqRel);
                    let ct = ct.handle();
                    tracing::debug!(?ct, discarded, "triggered operations discarded");
                }
            }
        }
    }
}

/// Counting-event increments issued by application threads
pub(crate) struct AppSink<'a> {
    pub shared: &'a Shared,
}

impl CtSink for AppSink<'_> {
    fn increment(&mut self, ct: &Arc<CountingEvent>, by: CtValue) {
        let raw = ct.handle().raw();
        if ct.has_triggers() {
            self.shared.send_command(Command::CtUnorderedInc {
                ct: raw,
                success: by.success,
                failure: by.failure,
            });
            return;
        }
        ct.inc(by);
        // A trigger armed in between still gets its threshold checked
        if ct.has_triggers() {
            self.shared.send_command(Command::CtTriggerCheck { ct: raw });
        }
    }
}

/// Application handle to an initialized network interface
#[derive(Clone)]
pub struct Ni {
    pub(crate) shared: Arc<Shared>,
    pub(crate) state: Arc<NiState>,
}

impl Ni {
    pub(crate) fn new(shared: Arc<Shared>, state: Arc<NiState>) -> Self {
        Self { shared, state }
    }

    pub fn kind(&self) -> NiKind {
        self.state.kind
    }

    pub fn limits(&self) -> NiLimits {
        self.state.limits
    }

    /// This process as peers of this interface address it
    pub fn id(&self) -> ProcessId {
        self.state.peer(self.state.rank)
    }

    pub fn status(&self, register: StatusRegister) -> u64 {
        self.state.status(register)
    }

    /// Tear the interface down; outstanding handles become invalid.
    pub fn fini(&self) -> Result<()> {
        self.shared.remove_ni(self.state.kind)?;
        self.state.retire();
        tracing::info!(
            rank = self.state.rank,
            kind = ?self.state.kind,
            "network interface finalized"
        );
        Ok(())
    }

    fn pt(&self, index: u32) -> Result<&PtEntry> {
        self.state
            .pt(index)
            .ok_or_else(|| Error::InvalidArgument(format!("portal index {index} out of range")))
    }

    /// Allocate portal index `index`, or the lowest free one for [`PT_ANY`].
    pub fn pt_alloc(&self, index: u32, eq: Option<EqHandle>) -> Result<u32> {
        let eq = eq.map(|h| self.state.eqs.get(h.handle())).transpose()?;
        if index == PT_ANY {
            for (i, pt) in self.state.pts.iter().enumerate() {
                if pt.alloc(eq.clone()) {
                    return Ok(i as u32);
                }
            }
            return Err(Error::NoSpace("portal table entries"));
        }
        if self.pt(index)?.alloc(eq) {
            Ok(index)
        } else {
            Err(Error::InUse)
        }
    }

    pub fn pt_free(&self, index: u32) -> Result<()> {
        self.pt(index)?.free()
    }

    pub fn pt_enable(&self, index: u32) -> Result<()> {
        self.pt(index)?.enable()
    }

    pub fn pt_disable(&self, index: u32) -> Result<()> {
        self.pt(index)?.disable()
    }

    pub fn pt_status(&self, index: u32) -> Result<PtStatus> {
        Ok(self.pt(index)?.status())
    }

    fn append(
        &self,
        matching: bool,
        pt_index: u32,
        spec: &EntrySpec,
        list: ListKind,
    ) -> Result<EntryHandle> {
        if self.state.kind.is_matching() != matching {
            return Err(Error::InvalidArgument(format!(
                "{} on a {:?} interface",
                if matching { "match entry" } else { "list entry" },
                self.state.kind
            )));
        }
        self.state.append(pt_index, list, spec, &mut AppSink { shared: &self.shared })
    }

    /// Post a list entry (non-matching interfaces).
    pub fn le_append(
        &self,
        pt_index: u32,
        spec: &EntrySpec,
        list: ListKind,
    ) -> Result<EntryHandle> {
        self.append(false, pt_index, spec, list)
    }

    /// Post a match entry (matching interfaces).
    pub fn me_append(
        &self,
        pt_index: u32,
        spec: &EntrySpec,
        list: ListKind,
    ) -> Result<EntryHandle> {
        self.append(true, pt_index, spec, list)
    }

    /// Remove a posted entry; `InUse` while a delivery into it is running.
    pub fn le_unlink(&self, entry: EntryHandle) -> Result<()> {
        self.state.unlink(entry)
    }

    pub fn me_unlink(&self, entry: EntryHandle) -> Result<()> {
        self.state.unlink(entry)
    }

    /// Look for a buffered unexpected header; the outcome arrives as a
    /// `Search` event on the portal's event queue.
    pub fn le_search(&self, pt_index: u32, spec: &EntrySpec, op: SearchOp) -> Result<()> {
        self.state
            .search(pt_index, spec, op, &mut AppSink { shared: &self.shared })
    }

    pub fn me_search(&self, pt_index: u32, spec: &EntrySpec, op: SearchOp) -> Result<()> {
        self.le_search(pt_index, spec, op)
    }

    pub fn md_bind(&self, spec: &MdSpec) -> Result<MdHandle> {
        let eq = spec.eq.map(|h| self.state.eqs.get(h.handle())).transpose()?;
        let ct = spec.ct.map(|h| self.state.cts.get(h.handle())).transpose()?;
        let md = MemoryDescriptor::new(spec, eq, ct)?;
        let (handle, _) = self.state.mds.alloc(|_| md)?;
        Ok(handle.into())
    }

    /// Release a descriptor; `InUse` while operations on it are outstanding.
    pub fn md_release(&self, md: MdHandle) -> Result<()> {
        let h = md.handle();
        if self.state.mds.get(h)?.outstanding() > 0 {
            return Err(Error::InUse);
        }
        self.state.mds.free(h).map(|_| ())
    }

    pub fn ct_alloc(&self) -> Result<CtHandle> {
        let (handle, _) = self.state.cts.alloc(CountingEvent::new)?;
        Ok(handle.into())
    }

    /// Invalidate a counting event. Waiters return `Interrupted`; the slot is
    /// recycled by the data-movement thread after work already queued for it.
    pub fn ct_free(&self, ct: CtHandle) -> Result<()> {
        let event = self.state.cts.get(ct.handle())?;
        let discarded = event.retire()?;
        if discarded > 0 {
            self.state.triggered.fetch_sub(discarded as u32, Ordering::AcqRel);
        }
        self.shared.send_command(Command::CtFree { ct: ct.raw() });
        Ok(())
    }

    pub(crate) fn ct(&self, ct: CtHandle) -> Result<Arc<CountingEvent>> {
        self.state.cts.get(ct.handle())
    }

    pub fn ct_get(&self, ct: CtHandle) -> Result<CtValue> {
        self.ct(ct)?.get()
    }

    /// Block until `success + failure >= test`.
    pub fn ct_wait(&self, ct: CtHandle, test: u64) -> Result<CtValue> {
        self.ct(ct)?.wait(test)
    }

    pub fn ct_poll(&self, ct: CtHandle, test: u64, timeout: Duration) -> Result<CtValue> {
        self.ct(ct)?.poll(test, timeout)
    }

    pub fn ct_set(&self, ct: CtHandle, value: CtValue) -> Result<()> {
        let event = self.ct(ct)?;
        event.get()?;
        event.set(value);
        if event.has_triggers() {
            self.shared.send_command(Command::CtTriggerCheck { ct: ct.raw() });
        }
        Ok(())
    }

    pub fn ct_inc(&self, ct: CtHandle, by: CtValue) -> Result<()> {
        let event = self.ct(ct)?;
        event.get()?;
        AppSink { shared: &self.shared }.increment(&event, by);
        Ok(())
    }

    /// Register a triggered increment or set of `target` on `trigger`.
    pub(crate) fn arm(
        &self,
        trigger: CtHandle,
        threshold: u64,
        action: TriggeredAction,
    ) -> Result<()> {
        let event = self.ct(trigger)?;
        event.get()?;
        let limit = self.state.limits.max_triggered_ops;
        if self
            .state
            .triggered
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < limit).then_some(n + 1))
            .is_err()
        {
            return Err(Error::NoSpace("triggered operations"));
        }
        event.add_trigger(threshold, action);
        // The threshold may already be met
        self.shared.send_command(Command::CtTriggerCheck { ct: trigger.raw() });
        Ok(())
    }

    /// When `trigger` reaches `threshold` successes, add `by` to `target`.
    pub fn triggered_ct_inc(
        &self,
        target: CtHandle,
        by: CtValue,
        trigger: CtHandle,
        threshold: u64,
    ) -> Result<()> {
        let ct = self.ct(target)?;
        self.arm(trigger, threshold, TriggeredAction::CtInc { ct, by })
    }

    /// When `trigger` reaches `threshold` successes, set `target` to `to`.
    pub fn triggered_ct_set(
        &self,
        target: CtHandle,
        to: CtValue,
        trigger: CtHandle,
        threshold: u64,
    ) -> Result<()> {
        let ct = self.ct(target)?;
        self.arm(trigger, threshold, TriggeredAction::CtSet { ct, to })
    }

    pub fn eq_alloc(&self, count: usize) -> Result<EqHandle> {
        if count == 0 {
            return Err(Error::InvalidArgument("event queue of zero events".to_string()));
        }
        let (handle, _) = self.state.eqs.alloc(|_| EventQueue::new(count))?;
        Ok(handle.into())
    }

    pub fn eq_free(&self, eq: EqHandle) -> Result<()> {
        let queue = self.state.eqs.free(eq.handle())?;
        queue.retire();
        Ok(())
    }

    fn eq(&self, eq: EqHandle) -> Result<Arc<EventQueue>> {
        self.state.eqs.get(eq.handle())
    }

    /// Next event; `EqEmpty` if none, `EqDropped` once after an overflow.
    pub fn eq_get(&self, eq: EqHandle) -> Result<Event> {
        self.eq(eq)?.get()
    }

    pub fn eq_wait(&self, eq: EqHandle) -> Result<Event> {
        self.eq(eq)?.wait()
    }

    pub fn eq_poll(&self, eq: EqHandle, timeout: Duration) -> Result<Event> {
        self.eq(eq)?.poll(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retire_releases_triggered_budget() {
        let ni = NiState::new(
            NiKind::NonMatchingLogical,
            &Config::new().with_num_procs(2),
            NiLimits::default(),
        );
        let (_, armed) = ni.cts.alloc(CountingEvent::new).unwrap();
        let (_, target) = ni.cts.alloc(CountingEvent::new).unwrap();
        let (_, freed) = ni.cts.alloc(CountingEvent::new).unwrap();
        for threshold in [5, 6] {
            let action = TriggeredAction::CtInc {
                ct: Arc::clone(&target),
                by: CtValue::success(1),
            };
            armed.add_trigger(threshold, action);
        }
        let action = TriggeredAction::CtSet {
            ct: Arc::clone(&target),
            to: CtValue::success(9),
        };
        freed.add_trigger(3, action);
        ni.triggered.store(3, Ordering::Release);

        // As `ct_free` does before the slot is recycled
        let discarded = freed.retire().unwrap();
        ni.triggered.fetch_sub(discarded as u32, Ordering::AcqRel);

        ni.retire();
        assert_eq!(ni.triggered.load(Ordering::Acquire), 0);
        assert!(matches!(armed.get(), Err(Error::InvalidHandle(_))));
        assert!(matches!(armed.retire(), Err(Error::InvalidHandle(_))));
    }
}
