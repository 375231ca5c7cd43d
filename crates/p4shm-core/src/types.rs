//! Portals identifiers, option sets and limits

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// Wildcard user id accepted by an entry
pub const UID_ANY: u32 = u32::MAX;
/// Wildcard job id accepted by an entry
pub const JID_ANY: u32 = u32::MAX;
/// Job id of a process that was launched outside of any job
pub const JID_NONE: u32 = 0;
/// Wildcard portal index for `pt_alloc`
pub const PT_ANY: u32 = u32::MAX;
/// The only node id of a shared-memory fabric
pub const LOCAL_NID: u32 = 0;

/// One of the four logical interfaces a process can initialize
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NiKind {
    MatchingLogical = 0,
    NonMatchingLogical = 1,
    MatchingPhysical = 2,
    NonMatchingPhysical = 3,
}

impl NiKind {
    pub const ALL: [NiKind; 4] = [
        NiKind::MatchingLogical,
        NiKind::NonMatchingLogical,
        NiKind::MatchingPhysical,
        NiKind::NonMatchingPhysical,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(NiKind::MatchingLogical),
            1 => Some(NiKind::NonMatchingLogical),
            2 => Some(NiKind::MatchingPhysical),
            3 => Some(NiKind::NonMatchingPhysical),
            _ => None,
        }
    }

    pub const fn is_matching(self) -> bool {
        matches!(self, NiKind::MatchingLogical | NiKind::MatchingPhysical)
    }

    pub const fn is_logical(self) -> bool {
        matches!(self, NiKind::MatchingLogical | NiKind::NonMatchingLogical)
    }
}

/// Address of a peer process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessId {
    Logical { rank: u32 },
    Physical { nid: u32, pid: u32 },
}

impl ProcessId {
    /// Express a rank the way an interface of `kind` reports peers.
    pub fn for_ni(kind: NiKind, rank: u32) -> Self {
        if kind.is_logical() {
            ProcessId::Logical { rank }
        } else {
            ProcessId::Physical {
                nid: LOCAL_NID,
                pid: rank,
            }
        }
    }

    /// Resolve to a rank; physical ids map pid to rank on the local node.
    pub fn rank(&self) -> Option<u32> {
        match *self {
            ProcessId::Logical { rank } => Some(rank),
            ProcessId::Physical { nid, pid } if nid == LOCAL_NID => Some(pid),
            ProcessId::Physical { .. } => None,
        }
    }
}

/// Initiator filter of a match entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchId {
    Any,
    Id(ProcessId),
}

impl MatchId {
    pub fn accepts(&self, src_rank: u32) -> bool {
        match self {
            MatchId::Any => true,
            MatchId::Id(id) => id.rank() == Some(src_rank),
        }
    }
}

macro_rules! option_set {
    ($(#[$meta:meta])* $name:ident { $($(#[$cmeta:meta])* $flag:ident = $bit:expr,)* }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
        pub struct $name(u32);

        impl $name {
            $($(#[$cmeta])* pub const $flag: $name = $name($bit);)*

            pub const fn empty() -> Self {
                $name(0)
            }

            pub const fn bits(self) -> u32 {
                self.0
            }

            pub const fn from_bits(bits: u32) -> Self {
                $name(bits)
            }

            pub const fn contains(self, other: $name) -> bool {
                self.0 & other.0 == other.0
            }
        }

        impl BitOr for $name {
            type Output = $name;
            fn bitor(self, rhs: $name) -> $name {
                $name(self.0 | rhs.0)
            }
        }

        impl BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: $name) {
                self.0 |= rhs.0;
            }
        }

        impl BitAnd for $name {
            type Output = $name;
            fn bitand(self, rhs: $name) -> $name {
                $name(self.0 & rhs.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }
    };
}

option_set! {
    /// Options of a list or match entry
    EntryOptions {
        OP_PUT = 1 << 0,
        OP_GET = 1 << 1,
        USE_ONCE = 1 << 2,
        ACK_DISABLE = 1 << 3,
        /// ME only: refuse messages that would be truncated
        NO_TRUNCATE = 1 << 4,
        /// ME only: the entry hands out its own offsets
        MANAGE_LOCAL = 1 << 5,
        /// Check the job id instead of the user id
        AUTH_USE_JID = 1 << 6,
        EVENT_COMM_DISABLE = 1 << 7,
        EVENT_SUCCESS_DISABLE = 1 << 8,
        EVENT_OVER_DISABLE = 1 << 9,
        EVENT_LINK_DISABLE = 1 << 10,
        EVENT_UNLINK_DISABLE = 1 << 11,
        EVENT_CT_COMM = 1 << 12,
        EVENT_CT_OVERFLOW = 1 << 13,
        EVENT_CT_BYTES = 1 << 14,
    }
}

option_set! {
    /// Options of a memory descriptor
    MdOptions {
        EVENT_SEND_DISABLE = 1 << 0,
        EVENT_SUCCESS_DISABLE = 1 << 1,
        EVENT_CT_SEND = 1 << 2,
        EVENT_CT_REPLY = 1 << 3,
        EVENT_CT_ACK = 1 << 4,
        EVENT_CT_BYTES = 1 << 5,
    }
}

/// Acknowledgment requested by a put-like operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AckReq {
    NoAck = 0,
    Ack = 1,
    /// Count the acknowledgment but do not post a full event
    CtAck = 2,
    /// Acknowledge once the operation completed at the target
    OcAck = 3,
}

impl AckReq {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(AckReq::NoAck),
            1 => Some(AckReq::Ack),
            2 => Some(AckReq::CtAck),
            3 => Some(AckReq::OcAck),
            _ => None,
        }
    }
}

/// List an entry is appended to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ListKind {
    Priority = 0,
    Overflow = 1,
}

/// Behavior of `search` over buffered unexpected headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOp {
    SearchOnly,
    SearchDelete,
}

/// Failure type reported in events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NiFail {
    Ok,
    Undeliverable,
    PtDisabled,
    Dropped,
    PermViolation,
    NoMatch,
}

/// Per-NI status registers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusRegister {
    DropCount,
    PermissionViolations,
}

/// Resource limits of one network interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NiLimits {
    pub max_entries: u32,
    pub max_unexpected_headers: u32,
    pub max_mds: u32,
    pub max_cts: u32,
    pub max_eqs: u32,
    pub max_pt_index: u32,
    pub max_msg_size: u64,
    pub max_atomic_size: u64,
    pub max_triggered_ops: u32,
}

impl Default for NiLimits {
    fn default() -> Self {
        Self {
            max_entries: 1024,
            max_unexpected_headers: 1024,
            max_mds: 1024,
            max_cts: 256,
            max_eqs: 64,
            max_pt_index: 63,
            max_msg_size: u32::MAX as u64,
            max_atomic_size: 256,
            max_triggered_ops: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_id_rank() {
        assert_eq!(ProcessId::Logical { rank: 3 }.rank(), Some(3));
        assert_eq!(ProcessId::Physical { nid: 0, pid: 5 }.rank(), Some(5));
        assert_eq!(ProcessId::Physical { nid: 7, pid: 5 }.rank(), None);
        assert_eq!(
            ProcessId::for_ni(NiKind::NonMatchingPhysical, 2),
            ProcessId::Physical { nid: 0, pid: 2 }
        );
    }

    #[test]
    fn test_match_id() {
        assert!(MatchId::Any.accepts(9));
        let one = MatchId::Id(ProcessId::Logical { rank: 1 });
        assert!(one.accepts(1));
        assert!(!one.accepts(0));
    }

    #[test]
    fn test_option_set_ops() {
        let opts = EntryOptions::OP_PUT | EntryOptions::USE_ONCE;
        assert!(opts.contains(EntryOptions::OP_PUT));
        assert!(!opts.contains(EntryOptions::OP_GET));
        assert!(!opts.contains(EntryOptions::OP_PUT | EntryOptions::OP_GET));
    }
}
