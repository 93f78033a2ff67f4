use core::fmt;

use crate::fs::error::FsError;
use crate::loader::ExecError;
use crate::memory::paging::MapError;

/// Failure of a kernel operation reachable from a syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysError {
    /// Process table exhausted.
    NoProcessSlot,
    /// Every thread slot of the process is live.
    NoThreadSlot,
    /// Physical page or page-table allocation failed.
    NoMemory,
    InvalidArgument,
    Misaligned,
    /// User pointer outside user space, unmapped, or lacking the needed permission.
    BadAddress,
    AlreadyMapped,
    NotMapped,
    NameTooLong,
    BadFileDescriptor,
    TooManyOpenFiles,
    /// Handle refers to a recycled or unused process slot.
    StaleHandle,
    /// No thread is bound to this core.
    NoCurrentThread,
    /// A sibling's exit or exec ended the calling thread.
    ThreadEnded,
    NoChild,
    UnknownSyscall(usize),
    Fs(FsError),
    Exec(ExecError),
}

impl SysError {
    /// Value written to the return register. The user ABI only
    /// distinguishes failure from success.
    pub const fn as_ret(self) -> isize {
        -1
    }
}

impl fmt::Display for SysError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SysError::NoProcessSlot => write!(f, "Process table full"),
            SysError::NoThreadSlot => write!(f, "No free thread slot"),
            SysError::NoMemory => write!(f, "Out of memory"),
            SysError::InvalidArgument => write!(f, "Invalid argument"),
            SysError::Misaligned => write!(f, "Address not page aligned"),
            SysError::BadAddress => write!(f, "Bad address"),
            SysError::AlreadyMapped => write!(f, "Page already mapped"),
            SysError::NotMapped => write!(f, "Page not mapped"),
            SysError::NameTooLong => write!(f, "String too long"),
            SysError::BadFileDescriptor => write!(f, "Bad file descriptor"),
            SysError::TooManyOpenFiles => write!(f, "Too many open files"),
            SysError::StaleHandle => write!(f, "Stale process handle"),
            SysError::NoCurrentThread => write!(f, "No current thread"),
            SysError::ThreadEnded => write!(f, "Thread ended by a sibling"),
            SysError::NoChild => write!(f, "No matching child"),
            SysError::UnknownSyscall(id) => write!(f, "Unknown syscall {}", id),
            SysError::Fs(e) => write!(f, "{}", e),
            SysError::Exec(e) => write!(f, "{}", e),
        }
    }
}

impl From<FsError> for SysError {
    fn from(e: FsError) -> Self {
        SysError::Fs(e)
    }
}

impl From<ExecError> for SysError {
    fn from(e: ExecError) -> Self {
        match e {
            ExecError::MemoryError => SysError::NoMemory,
            e => SysError::Exec(e),
        }
    }
}

impl From<MapError> for SysError {
    fn from(e: MapError) -> Self {
        match e {
            MapError::AlreadyMapped => SysError::AlreadyMapped,
            MapError::NotMapped => SysError::NotMapped,
            MapError::NoMemory => SysError::NoMemory,
            MapError::BadAddress => SysError::BadAddress,
        }
    }
}

pub type SysResult<T> = Result<T, SysError>;
