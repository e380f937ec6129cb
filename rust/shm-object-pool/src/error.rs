//! Error taxonomy for the shared-memory object pool.

use std::fmt;
use std::io;

/// Errors returned by [`crate::Pool`] operations.
#[derive(Debug)]
pub enum PoolError {
    /// No pool attached in this process.
    NotRunning,
    /// `create` was called but `link_path` already resolves to a live segment.
    AlreadyExists,
    /// `open` was called but `link_path` does not resolve to a segment.
    NotFound,
    /// The segment's layout version does not match this build.
    VersionMismatch { expected: u32, found: u32 },
    /// The segment's header failed validation, or the control mutex was left
    /// inconsistent after a holder died mid-recovery.
    Corrupt(&'static str),
    /// The data-region allocator could not satisfy a request.
    OutOfMemory,
    /// The slot table has no free entry left.
    OutOfSlots,
    /// `add_object` was called with an id that already has a live slot.
    DuplicateId,
    /// `attach_object` / `detach_object` / `memview_of` was called with an id
    /// that has no live slot.
    UnknownId,
    /// A timed lock acquisition did not complete in time.
    Timeout,
    /// Underlying OS failure (file, mmap, shm_open, ...).
    Io(io::Error),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotRunning => write!(f, "no pool attached in this process"),
            Self::AlreadyExists => write!(f, "link path already resolves to a live segment"),
            Self::NotFound => write!(f, "link path does not resolve to a running pool"),
            Self::VersionMismatch { expected, found } => write!(
                f,
                "incompatible segment layout version: expected {expected}, found {found}"
            ),
            Self::Corrupt(reason) => write!(f, "pool segment is corrupt: {reason}"),
            Self::OutOfMemory => write!(f, "data region exhausted, no free range large enough"),
            Self::OutOfSlots => write!(f, "slot table exhausted, no free slot left"),
            Self::DuplicateId => write!(f, "id already has a live slot"),
            Self::UnknownId => write!(f, "id has no live slot"),
            Self::Timeout => write!(f, "timed out waiting for the control mutex"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for PoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for PoolError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, PoolError>;
