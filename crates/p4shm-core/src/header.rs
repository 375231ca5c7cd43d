//! Message header carried at the start of every fragment payload

use crate::types::NiFail;

/// What a fragment currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgKind {
    /// New operation, or the next chunk of one, travelling to the target
    Request = 1,
    /// Returning to the initiator's ack queue
    Ack = 2,
    /// Local control message for the owner's own data-movement thread
    Command = 3,
    /// Stops the owner's data-movement thread
    Terminate = 4,
}

impl MsgKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(MsgKind::Request),
            2 => Some(MsgKind::Ack),
            3 => Some(MsgKind::Command),
            4 => Some(MsgKind::Terminate),
            _ => None,
        }
    }
}

/// Data-movement operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpKind {
    Put = 1,
    Get = 2,
    Atomic = 3,
    FetchAtomic = 4,
    Swap = 5,
}

impl OpKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(OpKind::Put),
            2 => Some(OpKind::Get),
            3 => Some(OpKind::Atomic),
            4 => Some(OpKind::FetchAtomic),
            5 => Some(OpKind::Swap),
            _ => None,
        }
    }

    /// Writes target memory and therefore needs `OP_PUT`
    pub fn writes_target(self) -> bool {
        !matches!(self, OpKind::Get)
    }

    /// Reads target memory and therefore needs `OP_GET`
    pub fn reads_target(self) -> bool {
        matches!(self, OpKind::Get | OpKind::FetchAtomic | OpKind::Swap)
    }

    /// Carries a reply back to the initiator
    pub fn has_reply(self) -> bool {
        self.reads_target()
    }
}

/// Target-side outcome written into the ack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResultCode {
    /// No acknowledgment is reported to the application
    Silent = 0,
    Success = 1,
    /// Accepted through the overflow list or buffered as unexpected
    Overflow = 2,
    PermViolation = 3,
    Dropped = 4,
    PtDisabled = 5,
}

impl ResultCode {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => ResultCode::Success,
            2 => ResultCode::Overflow,
            3 => ResultCode::PermViolation,
            4 => ResultCode::Dropped,
            5 => ResultCode::PtDisabled,
            _ => ResultCode::Silent,
        }
    }

    /// Failure type surfaced in the initiator's event, `None` for silent acks
    pub fn ni_fail(self) -> Option<NiFail> {
        match self {
            ResultCode::Silent => None,
            ResultCode::Success | ResultCode::Overflow => Some(NiFail::Ok),
            ResultCode::PermViolation => Some(NiFail::PermViolation),
            ResultCode::Dropped => Some(NiFail::Dropped),
            ResultCode::PtDisabled => Some(NiFail::PtDisabled),
        }
    }
}

/// Local commands serialized through the data-movement thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    CtFree { ct: u64 },
    CtTriggerCheck { ct: u64 },
    CtUnorderedInc { ct: u64, success: u64, failure: u64 },
}

impl Command {
    pub fn encode(&self, hdr: &mut MsgHeader) {
        hdr.kind = MsgKind::Command as u8;
        match *self {
            Command::CtFree { ct } => {
                hdr.command = 1;
                hdr.cmd_args = [ct, 0, 0];
            }
            Command::CtTriggerCheck { ct } => {
                hdr.command = 2;
                hdr.cmd_args = [ct, 0, 0];
            }
            Command::CtUnorderedInc {
                ct,
                success,
                failure,
            } => {
                hdr.command = 3;
                hdr.cmd_args = [ct, success, failure];
            }
        }
    }

    pub fn decode(hdr: &MsgHeader) -> Option<Self> {
        let [a, b, c] = hdr.cmd_args;
        match hdr.command {
            1 => Some(Command::CtFree { ct: a }),
            2 => Some(Command::CtTriggerCheck { ct: a }),
            3 => Some(Command::CtUnorderedInc {
                ct: a,
                success: b,
                failure: c,
            }),
            _ => None,
        }
    }
}

pub const FLAG_TRUNCATED: u8 = 1 << 0;
/// Initiator already reported the send completion
pub const FLAG_SEND_DONE: u8 = 1 << 1;

/// Largest atomic operand (one double-complex element plus slack)
pub const OPERAND_SIZE: usize = 32;

/// Header at the start of a fragment payload, followed by inline data.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgHeader {
    pub kind: u8,
    pub op: u8,
    pub ni: u8,
    pub ack_req: u8,
    pub atomic_op: u8,
    pub atomic_dt: u8,
    pub result: u8,
    pub flags: u8,
    pub src: u32,
    pub target: u32,
    pub pt_index: u32,
    pub uid: u32,
    pub jid: u32,
    pub command: u32,
    pub match_bits: u64,
    /// Offset requested by the initiator
    pub remote_offset: u64,
    /// Requested length
    pub length: u64,
    /// Bytes the target accepts; set by the first delivery
    pub mlength: u64,
    /// Bytes moved so far
    pub transferred: u64,
    /// Bytes still to move after this round trip
    pub remaining: u64,
    /// Payload bytes carried by this fragment
    pub chunk_len: u64,
    pub user_ptr: u64,
    pub hdr_data: u64,
    pub put_md: u64,
    pub put_offset: u64,
    pub get_md: u64,
    pub get_offset: u64,
    /// Continuation token of a multi-fragment transfer, 0 if none
    pub moredata: u64,
    /// Offset in the target entry where delivery starts
    pub delivered_offset: u64,
    pub cmd_args: [u64; 3],
    pub operand: [u8; OPERAND_SIZE],
}

impl MsgHeader {
    pub const SIZE: usize = std::mem::size_of::<Self>();

    pub fn kind(&self) -> Option<MsgKind> {
        MsgKind::from_u8(self.kind)
    }

    pub fn op(&self) -> Option<OpKind> {
        OpKind::from_u8(self.op)
    }

    pub fn result(&self) -> ResultCode {
        ResultCode::from_u8(self.result)
    }

    pub fn set_result(&mut self, result: ResultCode) {
        self.result = result as u8;
    }

    pub fn is_truncated(&self) -> bool {
        self.flags & FLAG_TRUNCATED != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_size_is_stable() {
        assert_eq!(MsgHeader::SIZE % 8, 0);
        assert!(MsgHeader::SIZE <= 256);
    }

    #[test]
    fn test_command_codec() {
        let mut hdr = MsgHeader::default();
        let cmd = Command::CtUnorderedInc {
            ct: 0x0104_0000_0000_0002,
            success: 5,
            failure: 1,
        };
        cmd.encode(&mut hdr);
        assert_eq!(hdr.kind(), Some(MsgKind::Command));
        assert_eq!(Command::decode(&hdr), Some(cmd));
    }

    #[test]
    fn test_result_to_fail() {
        assert_eq!(ResultCode::Silent.ni_fail(), None);
        assert_eq!(ResultCode::Overflow.ni_fail(), Some(NiFail::Ok));
        assert_eq!(ResultCode::from_u8(4).ni_fail(), Some(NiFail::Dropped));
    }

    #[test]
    fn test_op_permissions() {
        assert!(OpKind::Put.writes_target() && !OpKind::Put.reads_target());
        assert!(OpKind::Get.reads_target() && !OpKind::Get.writes_target());
        assert!(OpKind::Swap.reads_target() && OpKind::Swap.writes_target());
    }
}
