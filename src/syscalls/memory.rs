use crate::error::SysResult;
use crate::kernel::Kernel;
use crate::memory::mmap::{mmap, munmap};
use crate::scheduler::task::ThreadRef;

impl Kernel {
    /// Moves the program break; returns the old one.
    pub(super) fn sys_sbrk(&self, cur: ThreadRef, delta: isize) -> SysResult<isize> {
        let old = self.with_space(cur, |space, mem| space.grow_heap(delta, mem))?;
        Ok(old as isize)
    }

    pub(super) fn sys_mmap(&self, cur: ThreadRef, start: u64, len: usize, prot: usize) -> SysResult<isize> {
        self.with_space(cur, |space, mem| mmap(space, mem, start, len, prot))?;
        log::debug!("mmap: {:#x} len {:#x} prot {:#x}", start, len, prot);
        Ok(0)
    }

    pub(super) fn sys_munmap(&self, cur: ThreadRef, start: u64, len: usize) -> SysResult<isize> {
        self.with_space(cur, |space, mem| munmap(space, mem, start, len))?;
        Ok(0)
    }
}
