//! p4shm - Portals4 messaging over shared memory

pub mod atomic;
pub mod config;
pub mod ct;
pub mod datatype;
pub mod doorbell;
pub mod entry;
pub mod eq;
pub mod error;
pub mod fragment;
pub mod freelist;
pub mod handle;
pub mod header;
pub mod initiator;
pub mod iobuf;
pub mod layout;
pub mod md;
pub mod ni;
pub mod offset;
pub mod process;
pub mod pt;
pub mod queue;
pub mod segment;
pub mod shm;
pub mod types;

mod dm;
mod matching;
mod unexpected;

pub use atomic::AtomicOp;
pub use config::Config;
pub use ct::CtValue;
pub use datatype::Datatype;
pub use entry::EntrySpec;
pub use eq::{Event, EventKind};
pub use error::{Error, Result};
pub use handle::{CtHandle, EntryHandle, EqHandle, Handle, MdHandle};
pub use initiator::Remote;
pub use iobuf::IoBuf;
pub use md::MdSpec;
pub use ni::Ni;
pub use process::Process;
pub use pt::PtStatus;
pub use segment::Segment;
pub use types::{
    AckReq, EntryOptions, ListKind, MatchId, MdOptions, NiFail, NiKind, NiLimits, ProcessId,
    SearchOp, StatusRegister, JID_ANY, PT_ANY, UID_ANY,
};
