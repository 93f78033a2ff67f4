//! Anonymous user mappings.

use super::address_space::AddressSpace;
use super::paging::MapPermission;
use super::{is_page_aligned, pages_for, PhysMemory};
use crate::config::{MMAP_MAX_LEN, PAGE_SIZE, USER_SPACE_END};
use crate::error::{SysError, SysResult};

/// Maps `len` bytes of fresh zeroed memory at `start` with the user
/// permissions encoded in `prot`. A zero length maps nothing and succeeds.
pub fn mmap(
    space: &mut AddressSpace,
    mem: &dyn PhysMemory,
    start: u64,
    len: usize,
    prot: usize,
) -> SysResult<()> {
    if len == 0 {
        return Ok(());
    }
    if len > MMAP_MAX_LEN {
        return Err(SysError::InvalidArgument);
    }
    if !is_page_aligned(start) {
        return Err(SysError::Misaligned);
    }
    let perm = MapPermission::from_prot(prot).ok_or(SysError::InvalidArgument)?;
    let npages = pages_for(len);
    let end = start
        .checked_add((npages * PAGE_SIZE) as u64)
        .ok_or(SysError::BadAddress)?;
    if end > USER_SPACE_END {
        return Err(SysError::BadAddress);
    }
    space.map_region(start, npages, perm, mem)
}

/// Removes the mappings covering `[start, start + len)` and frees their frames.
pub fn munmap(space: &mut AddressSpace, mem: &dyn PhysMemory, start: u64, len: usize) -> SysResult<()> {
    if !is_page_aligned(start) {
        return Err(SysError::Misaligned);
    }
    if len == 0 {
        return Ok(());
    }
    let npages = pages_for(len);
    let end = start
        .checked_add((npages * PAGE_SIZE) as u64)
        .ok_or(SysError::BadAddress)?;
    // Trapframe pages are kernel state even though they sit in the lower half.
    if end > USER_SPACE_END {
        return Err(SysError::BadAddress);
    }
    space.unmap_region(start, npages, mem)
}
