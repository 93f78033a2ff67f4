use core::fmt;

/// Errors reported by the file layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    NotFound,
    AlreadyExists,
    NotADirectory,
    IsADirectory,
    InvalidPath,
    IoError,
    NoSpace,
    /// Descriptor opened without the access the operation needs.
    AccessDenied,
    /// Descriptor has no inode behind it (console).
    NoInode,
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FsError::NotFound => write!(f, "No such file or directory"),
            FsError::AlreadyExists => write!(f, "File exists"),
            FsError::NotADirectory => write!(f, "Not a directory"),
            FsError::IsADirectory => write!(f, "Is a directory"),
            FsError::InvalidPath => write!(f, "Invalid path"),
            FsError::IoError => write!(f, "I/O error"),
            FsError::NoSpace => write!(f, "No space left"),
            FsError::AccessDenied => write!(f, "Bad access mode"),
            FsError::NoInode => write!(f, "No inode behind descriptor"),
        }
    }
}

pub type FsResult<T> = Result<T, FsError>;
