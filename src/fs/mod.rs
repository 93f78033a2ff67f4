//! Interface to the file layer plus the per-process descriptor table.

pub mod error;
pub mod fd;

use alloc::sync::Arc;
use bitflags::bitflags;

use error::FsResult;

bitflags! {
    /// `openat` mode bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const RDONLY = 0;
        const WRONLY = 1 << 0;
        const RDWR = 1 << 1;
        const CREATE = 1 << 9;
        const TRUNC = 1 << 10;
    }
}

impl OpenFlags {
    /// `(readable, writable)` for a descriptor opened with these flags.
    pub fn access(self) -> (bool, bool) {
        if self.contains(Self::WRONLY) {
            (false, true)
        } else if self.contains(Self::RDWR) {
            (true, true)
        } else {
            (true, false)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeKind {
    File,
    Directory,
}

/// Inode metadata reported by `fstat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeStat {
    pub dev: u64,
    pub ino: u64,
    pub kind: InodeKind,
    pub nlink: u32,
}

/// A file as seen through the file layer.
pub trait Inode: Send + Sync {
    fn stat(&self) -> InodeStat;
    /// Reads up to `buf.len()` bytes at `offset`; returns the count read (0 at end of file).
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> FsResult<usize>;
    fn write_at(&self, offset: usize, data: &[u8]) -> FsResult<usize>;
}

/// Path-level operations of the mounted file system.
pub trait FileSystem: Send + Sync {
    /// Opens `path`, creating or truncating it when `flags` ask for it.
    fn open(&self, path: &str, flags: OpenFlags) -> FsResult<Arc<dyn Inode>>;
    /// Adds `new_path` as another name for the inode at `old_path`.
    fn link(&self, old_path: &str, new_path: &str) -> FsResult<()>;
    fn unlink(&self, path: &str) -> FsResult<()>;
}
