use alloc::sync::Arc;
use spin::Mutex;

use super::error::{FsError, FsResult};
use super::{Inode, OpenFlags};
use crate::config::FD_BUFFER_SIZE;
use crate::error::{SysError, SysResult};

pub enum FileKind {
    /// Console, for descriptors 0, 1 and 2.
    Stdio,
    Inode(Arc<dyn Inode>),
}

/// An open file. Descriptors sharing one `File` share its offset.
pub struct File {
    pub kind: FileKind,
    pub offset: usize,
    pub readable: bool,
    pub writable: bool,
}

pub type FileRef = Arc<Mutex<File>>;

impl File {
    pub fn new_stdio() -> FileRef {
        Arc::new(Mutex::new(File {
            kind: FileKind::Stdio,
            offset: 0,
            readable: true,
            writable: true,
        }))
    }

    pub fn new_inode(inode: Arc<dyn Inode>, flags: OpenFlags) -> FileRef {
        let (readable, writable) = flags.access();
        Arc::new(Mutex::new(File { kind: FileKind::Inode(inode), offset: 0, readable, writable }))
    }

    pub fn inode(&self) -> FsResult<&Arc<dyn Inode>> {
        match &self.kind {
            FileKind::Inode(inode) => Ok(inode),
            FileKind::Stdio => Err(FsError::NoInode),
        }
    }

    /// Reads at the current offset and advances it.
    pub fn read(&mut self, buf: &mut [u8]) -> FsResult<usize> {
        if !self.readable {
            return Err(FsError::AccessDenied);
        }
        let n = self.inode()?.read_at(self.offset, buf)?;
        self.offset += n;
        Ok(n)
    }

    /// Writes at the current offset and advances it.
    pub fn write(&mut self, data: &[u8]) -> FsResult<usize> {
        if !self.writable {
            return Err(FsError::AccessDenied);
        }
        let n = self.inode()?.write_at(self.offset, data)?;
        self.offset += n;
        Ok(n)
    }
}

/// Fixed-size descriptor table; the index is the descriptor number.
#[derive(Clone)]
pub struct FdTable {
    slots: [Option<FileRef>; FD_BUFFER_SIZE],
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FdTable {
    pub fn new() -> Self {
        FdTable { slots: core::array::from_fn(|_| None) }
    }

    /// Table with the console on descriptors 0, 1 and 2.
    pub fn with_stdio() -> Self {
        let mut table = Self::new();
        for slot in table.slots.iter_mut().take(3) {
            *slot = Some(File::new_stdio());
        }
        table
    }

    fn index(fd: isize) -> SysResult<usize> {
        if fd < 0 || fd as usize >= FD_BUFFER_SIZE {
            return Err(SysError::BadFileDescriptor);
        }
        Ok(fd as usize)
    }

    pub fn get(&self, fd: isize) -> SysResult<FileRef> {
        let slot = &self.slots[Self::index(fd)?];
        slot.clone().ok_or(SysError::BadFileDescriptor)
    }

    /// Installs `file` in the lowest free slot.
    pub fn alloc(&mut self, file: FileRef) -> SysResult<usize> {
        let fd = self
            .slots
            .iter()
            .position(|slot| slot.is_none())
            .ok_or(SysError::TooManyOpenFiles)?;
        self.slots[fd] = Some(file);
        Ok(fd)
    }

    /// Empties the slot. The file itself lives on while other slots hold it.
    pub fn close(&mut self, fd: isize) -> SysResult<()> {
        let idx = Self::index(fd)?;
        self.slots[idx].take().map(|_| ()).ok_or(SysError::BadFileDescriptor)
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
    }

    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}
