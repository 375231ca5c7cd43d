//! Error types for p4shm

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("shared memory error: {0}")]
    SharedMemory(String),

    #[error("segment mismatch: {0}")]
    SegmentMismatch(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid handle: {0:#x}")]
    InvalidHandle(u64),

    #[error("network interface not initialized")]
    NotInitialized,

    #[error("resource in use")]
    InUse,

    #[error("no space left: {0}")]
    NoSpace(&'static str),

    #[error("event queue empty")]
    EqEmpty,

    #[error("event queue overflowed, events were dropped")]
    EqDropped,

    #[error("counting event threshold not reached")]
    CtNoneReached,

    #[error("process is shutting down")]
    Interrupted,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Unrecoverable internal condition detected where no caller can receive an
/// error (inside the data-movement thread).
#[cold]
pub(crate) fn fatal(what: &str) -> ! {
    tracing::error!(what, "fatal condition, aborting");
    std::process::abort()
}
