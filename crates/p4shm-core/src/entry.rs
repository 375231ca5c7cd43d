//! List and match entries

use crate::ct::CountingEvent;
use crate::handle::{CtHandle, Handle};
use crate::header::{MsgHeader, OpKind};
use crate::iobuf::IoBuf;
use crate::types::{EntryOptions, ListKind, MatchId, JID_ANY, UID_ANY};
use crate::Result;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Bytes delivered for a message of `length` bytes at `offset` into an entry
/// of `entry_len` bytes.
pub fn delivered_length(entry_len: u64, offset: u64, length: u64) -> u64 {
    if offset < entry_len {
        (entry_len - offset).min(length)
    } else {
        0
    }
}

/// Arguments of `le_append`, `me_append` and the search calls.
///
/// Match fields are ignored on non-matching interfaces.
#[derive(Debug, Clone)]
pub struct EntrySpec {
    pub buf: IoBuf,
    pub start: usize,
    pub length: usize,
    pub ct: Option<CtHandle>,
    pub uid: u32,
    pub jid: u32,
    pub options: EntryOptions,
    pub match_id: MatchId,
    pub match_bits: u64,
    pub ignore_bits: u64,
    /// Managed-local entries unlink once less than this many bytes are left
    pub min_free: u64,
    pub user_ptr: u64,
}

impl EntrySpec {
    /// Whole of `buf`, any initiator, put and get allowed.
    pub fn new(buf: IoBuf) -> Self {
        let length = buf.len();
        Self {
            buf,
            start: 0,
            length,
            ct: None,
            uid: UID_ANY,
            jid: JID_ANY,
            options: EntryOptions::OP_PUT | EntryOptions::OP_GET,
            match_id: MatchId::Any,
            match_bits: 0,
            ignore_bits: 0,
            min_free: 0,
            user_ptr: 0,
        }
    }

    pub fn with_range(mut self, start: usize, length: usize) -> Self {
        self.start = start;
        self.length = length;
        self
    }

    pub fn with_options(mut self, options: EntryOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_ct(mut self, ct: CtHandle) -> Self {
        self.ct = Some(ct);
        self
    }

    pub fn with_uid(mut self, uid: u32) -> Self {
        self.uid = uid;
        self
    }

    pub fn with_jid(mut self, jid: u32) -> Self {
        self.jid = jid;
        self
    }

    pub fn with_match(mut self, match_id: MatchId, match_bits: u64, ignore_bits: u64) -> Self {
        self.match_id = match_id;
        self.match_bits = match_bits;
        self.ignore_bits = ignore_bits;
        self
    }

    pub fn with_min_free(mut self, min_free: u64) -> Self {
        self.min_free = min_free;
        self
    }

    pub fn with_user_ptr(mut self, user_ptr: u64) -> Self {
        self.user_ptr = user_ptr;
        self
    }

    /// Would an entry built from this spec accept a message with these fields
    pub(crate) fn matches(&self, matching: bool, src: u32, match_bits: u64) -> bool {
        !matching
            || (((match_bits ^ self.match_bits) & !self.ignore_bits) == 0
                && self.match_id.accepts(src))
    }
}

/// A posted entry as the matching engine sees it
pub(crate) struct Entry {
    pub handle: Handle,
    pub pt_index: u32,
    pub list: ListKind,
    /// Match fields apply (ME on a matching interface)
    pub matching: bool,
    pub buf: IoBuf,
    pub start: usize,
    pub length: u64,
    pub ct: Option<Arc<CountingEvent>>,
    pub uid: u32,
    pub jid: u32,
    pub options: EntryOptions,
    pub match_id: MatchId,
    pub match_bits: u64,
    pub ignore_bits: u64,
    pub min_free: u64,
    pub user_ptr: u64,
    local_offset: AtomicU64,
    /// Buffered headers whose data still lives in this entry's memory
    pending_headers: AtomicU32,
    unlinked: AtomicBool,
}

impl Entry {
    pub fn new(
        handle: Handle,
        pt_index: u32,
        list: ListKind,
        matching: bool,
        spec: &EntrySpec,
        ct: Option<Arc<CountingEvent>>,
    ) -> Self {
        Self {
            handle,
            pt_index,
            list,
            matching,
            buf: spec.buf.clone(),
            start: spec.start,
            length: spec.length as u64,
            ct,
            uid: spec.uid,
            jid: spec.jid,
            options: spec.options,
            match_id: spec.match_id,
            match_bits: spec.match_bits,
            ignore_bits: spec.ignore_bits,
            min_free: spec.min_free,
            user_ptr: spec.user_ptr,
            local_offset: AtomicU64::new(0),
            pending_headers: AtomicU32::new(0),
            unlinked: AtomicBool::new(false),
        }
    }

    pub fn has(&self, option: EntryOptions) -> bool {
        self.options.contains(option)
    }

    fn managed(&self) -> bool {
        self.matching && self.has(EntryOptions::MANAGE_LOCAL)
    }

    /// Offset into the entry where a message requesting `remote_offset` lands
    pub fn dest_offset(&self, remote_offset: u64) -> u64 {
        if self.managed() {
            self.local_offset.load(Ordering::Acquire)
        } else {
            remote_offset
        }
    }

    /// Match-bits, initiator and no-truncate tests
    pub fn matches(&self, src: u32, match_bits: u64, length: u64, remote_offset: u64) -> bool {
        if !self.matching {
            return true;
        }
        if ((match_bits ^ self.match_bits) & !self.ignore_bits) != 0 {
            return false;
        }
        if !self.match_id.accepts(src) {
            return false;
        }
        if self.has(EntryOptions::NO_TRUNCATE) {
            let offset = self.dest_offset(remote_offset);
            return delivered_length(self.length, offset, length) == length;
        }
        true
    }

    pub fn matches_header(&self, hdr: &MsgHeader) -> bool {
        self.matches(hdr.src, hdr.match_bits, hdr.length, hdr.remote_offset)
    }

    /// Access control and operation permission
    pub fn permits(&self, hdr: &MsgHeader, op: OpKind) -> bool {
        let authorized = if self.has(EntryOptions::AUTH_USE_JID) {
            self.jid == JID_ANY || self.jid == hdr.jid
        } else {
            self.uid == UID_ANY || self.uid == hdr.uid
        };
        authorized
            && (!op.writes_target() || self.has(EntryOptions::OP_PUT))
            && (!op.reads_target() || self.has(EntryOptions::OP_GET))
    }

    /// Consume `mlength` bytes of a managed-local entry. Returns whether the
    /// entry is exhausted afterwards.
    pub fn claim_local(&self, mlength: u64) -> bool {
        if !self.managed() {
            return false;
        }
        let used = self.local_offset.fetch_add(mlength, Ordering::AcqRel) + mlength;
        self.length.saturating_sub(used) < self.min_free.max(1)
    }

    /// Whether a delivery of `mlength` bytes removes the entry from its list
    pub fn unlinks_after(&self, exhausted: bool) -> bool {
        self.has(EntryOptions::USE_ONCE) || exhausted
    }

    pub fn write(&self, offset: u64, src: &[u8]) -> Result<()> {
        self.buf.write(self.start + offset as usize, src)
    }

    pub fn read(&self, offset: u64, dst: &mut [u8]) -> Result<()> {
        self.buf.read(self.start + offset as usize, dst)
    }

    /// Mutable target range for atomic operations.
    ///
    /// # Safety
    /// Only the data-movement thread or an append holding the entry
    /// exclusively may call this, for the duration of one delivery.
    pub unsafe fn target_mut(&self, offset: u64, len: u64) -> Result<&mut [u8]> {
        self.buf.slice_mut(self.start + offset as usize, len as usize)
    }

    pub fn hold_header(&self) {
        self.pending_headers.fetch_add(1, Ordering::AcqRel);
    }

    /// A buffered header pointing into this entry was consumed. Returns true
    /// when the entry is unlinked and nothing references its memory anymore.
    pub fn release_header(&self) -> bool {
        let prev = self.pending_headers.fetch_sub(1, Ordering::AcqRel);
        prev == 1 && self.unlinked.load(Ordering::Acquire)
    }

    /// Mark unlinked. Returns true when no buffered header references it.
    pub fn mark_unlinked(&self) -> bool {
        self.unlinked.store(true, Ordering::Release);
        self.pending_headers.load(Ordering::Acquire) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::HandleKind;
    use crate::types::ProcessId;

    fn entry(spec: &EntrySpec, matching: bool) -> Entry {
        Entry::new(
            Handle::new(HandleKind::Entry, 0, 0, 0),
            0,
            ListKind::Priority,
            matching,
            spec,
            None,
        )
    }

    #[test]
    fn test_delivered_length() {
        assert_eq!(delivered_length(8, 0, 8), 8);
        assert_eq!(delivered_length(8, 2, 8), 6);
        assert_eq!(delivered_length(8, 0, 3), 3);
        assert_eq!(delivered_length(8, 8, 3), 0);
        assert_eq!(delivered_length(8, 20, 3), 0);
    }

    #[test]
    fn test_match_bits_and_ignore() {
        let spec = EntrySpec::new(IoBuf::new(8)).with_match(MatchId::Any, 0xf0, 0x0f);
        let me = entry(&spec, true);
        assert!(me.matches(0, 0xf3, 1, 0));
        assert!(!me.matches(0, 0xe0, 1, 0));
        // Non-matching interfaces ignore match bits
        assert!(entry(&spec, false).matches(0, 0xe0, 1, 0));
    }

    #[test]
    fn test_match_id_and_no_truncate() {
        let spec = EntrySpec::new(IoBuf::new(8))
            .with_match(MatchId::Id(ProcessId::Logical { rank: 1 }), 0, 0)
            .with_options(EntryOptions::OP_PUT | EntryOptions::NO_TRUNCATE);
        let me = entry(&spec, true);
        assert!(me.matches(1, 0, 8, 0));
        assert!(!me.matches(2, 0, 8, 0));
        assert!(!me.matches(1, 0, 8, 1));
    }

    #[test]
    fn test_permissions() {
        let mut hdr = MsgHeader {
            uid: 5,
            jid: 9,
            ..Default::default()
        };
        let spec = EntrySpec::new(IoBuf::new(8)).with_options(EntryOptions::OP_PUT);
        let put_only = entry(&spec, false);
        assert!(put_only.permits(&hdr, OpKind::Put));
        assert!(!put_only.permits(&hdr, OpKind::Get));
        assert!(!put_only.permits(&hdr, OpKind::Swap));

        let by_uid = entry(&EntrySpec::new(IoBuf::new(8)).with_uid(6), false);
        assert!(!by_uid.permits(&hdr, OpKind::Put));
        hdr.uid = 6;
        assert!(by_uid.permits(&hdr, OpKind::Get));

        let by_jid = entry(
            &EntrySpec::new(IoBuf::new(8))
                .with_jid(9)
                .with_options(EntryOptions::OP_PUT | EntryOptions::AUTH_USE_JID),
            false,
        );
        assert!(by_jid.permits(&hdr, OpKind::Put));
        hdr.jid = 1;
        assert!(!by_jid.permits(&hdr, OpKind::Put));
    }

    #[test]
    fn test_managed_local_cursor() {
        let spec = EntrySpec::new(IoBuf::new(16))
            .with_options(EntryOptions::OP_PUT | EntryOptions::MANAGE_LOCAL)
            .with_min_free(4);
        let me = entry(&spec, true);
        assert_eq!(me.dest_offset(99), 0);
        assert!(!me.claim_local(8));
        assert_eq!(me.dest_offset(0), 8);
        assert!(me.claim_local(5));
    }
}
