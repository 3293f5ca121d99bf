//! Error types for the client-node bridge.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("not supported: {0}")]
    NotSupported(&'static str),

    #[error("out of {0}")]
    Exhausted(&'static str),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("can't change callbacks on an active client")]
    ActiveClient,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no driver attached")]
    NoDriver,

    #[error("timebase is owned by another client")]
    Busy,

    #[error("timebase is not ours to release")]
    NotOwner,

    #[error("connection to server lost")]
    Disconnected,

    #[error("shared memory error: {0}")]
    SharedMemory(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Encoding(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, NodeError>;

/// Status bits reported by `open`, legacy-compatible values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Status(pub u32);

impl Status {
    pub const EMPTY: Status = Status(0);
    pub const FAILURE: Status = Status(0x01);
    pub const INVALID_OPTION: Status = Status(0x02);
    pub const NAME_NOT_UNIQUE: Status = Status(0x04);
    pub const SERVER_STARTED: Status = Status(0x08);
    pub const SERVER_FAILED: Status = Status(0x10);
    pub const SERVER_ERROR: Status = Status(0x20);
    pub const NO_SUCH_CLIENT: Status = Status(0x40);
    pub const LOAD_FAILURE: Status = Status(0x80);
    pub const INIT_FAILURE: Status = Status(0x100);
    pub const SHM_FAILURE: Status = Status(0x200);
    pub const VERSION_ERROR: Status = Status(0x400);

    #[inline]
    pub fn contains(self, other: Status) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for Status {
    type Output = Status;
    #[inline]
    fn bitor(self, rhs: Status) -> Status {
        Status(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Status {
    #[inline]
    fn bitor_assign(&mut self, rhs: Status) {
        self.0 |= rhs.0;
    }
}

/// Failure to open a client, with the legacy status word attached.
#[derive(Error, Debug)]
#[error("client open failed ({status:?}): {reason}")]
pub struct OpenError {
    pub status: Status,
    pub reason: String,
}

impl OpenError {
    pub fn new(status: Status, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }
}
