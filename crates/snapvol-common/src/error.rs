//! Error definitions for snapvol.

use thiserror::Error;

/// Errors surfaced by the metadata engine.
///
/// Allocation and lookup failures propagate to the immediate caller for
/// a decision; nothing is retried internally. `Corrupt` aborts an
/// open/reopen entirely.
#[derive(Error, Debug, Clone)]
pub enum SnapError {
    #[error("IO error: {0}")]
    Io(String),

    /// Lookup miss. Expected during normal operation, not fatal.
    #[error("not found: {0}")]
    NotFound(String),

    /// Allocation exhausted. The caller decides (e.g. reject the write).
    #[error("out of space")]
    OutOfSpace,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Re-entrant lock attempt on a block. A programmer error; the
    /// block manager does not support recursive locking.
    #[error("block {0} is already locked")]
    AlreadyLocked(u64),

    /// A device has open handles, or a second open was attempted.
    #[error("busy: {0}")]
    Busy(String),

    #[error("corruption detected in {location}: {details}")]
    Corrupt { location: String, details: String },

    #[error("checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
}

pub type Result<T> = std::result::Result<T, SnapError>;

impl SnapError {
    /// Short error kind name, useful for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            SnapError::Io(_) => "io_error",
            SnapError::NotFound(_) => "not_found",
            SnapError::OutOfSpace => "out_of_space",
            SnapError::InvalidArgument(_) => "invalid_argument",
            SnapError::AlreadyLocked(_) => "already_locked",
            SnapError::Busy(_) => "busy",
            SnapError::Corrupt { .. } => "corrupt",
            SnapError::ChecksumMismatch { .. } => "checksum_mismatch",
        }
    }
}

impl From<std::io::Error> for SnapError {
    fn from(err: std::io::Error) -> Self {
        SnapError::Io(err.to_string())
    }
}
