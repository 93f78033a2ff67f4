pub mod elf;

use core::fmt;

use crate::memory::address_space::AddressSpace;
use crate::memory::PhysMemory;

/// Where a loaded program starts and where its image ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedImage {
    pub entry: u64,
    /// First page-aligned address above every loaded segment.
    pub image_end: u64,
}

/// Loads a program image into a fresh user address space.
pub trait Loader: Send + Sync {
    /// On failure the caller releases `space`; nothing else needs undoing.
    fn load(
        &self,
        path: &str,
        space: &mut AddressSpace,
        mem: &dyn PhysMemory,
    ) -> Result<LoadedImage, ExecError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecError {
    FileNotFound,
    InvalidFormat,
    UnsupportedArch,
    UnsupportedType,
    /// A segment lies outside user space or past the end of the file.
    BadSegment,
    MemoryError,
    ReadError,
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExecError::FileNotFound    => write!(f, "File not found"),
            ExecError::InvalidFormat   => write!(f, "Invalid ELF format"),
            ExecError::UnsupportedArch => write!(f, "Unsupported architecture"),
            ExecError::UnsupportedType => write!(f, "Unsupported ELF type (need ET_EXEC)"),
            ExecError::BadSegment      => write!(f, "Segment outside user space"),
            ExecError::MemoryError     => write!(f, "Memory allocation error"),
            ExecError::ReadError       => write!(f, "File read error"),
        }
    }
}
