use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use x86_64::{PhysAddr, VirtAddr};

use super::paging::{MapPermission, PageMapper};
use super::{is_page_aligned, page_round_down, PhysMemory};
use crate::config::{PAGE_SIZE, USER_SPACE_END};
use crate::error::{SysError, SysResult};

/// One process's virtual address space: the page table plus the frames it owns.
pub struct AddressSpace {
    table: Box<dyn PageMapper>,
    /// Page-aligned virtual address -> backing frame, for every page this
    /// space allocated itself.
    frames: BTreeMap<u64, PhysAddr>,
    /// One past the highest user page index ever mapped.
    max_page: u64,
    heap_bottom: u64,
    program_brk: u64,
}

impl AddressSpace {
    pub fn new(table: Box<dyn PageMapper>) -> Self {
        AddressSpace { table, frames: BTreeMap::new(), max_page: 0, heap_bottom: 0, program_brk: 0 }
    }

    pub fn root(&self) -> PhysAddr {
        self.table.root()
    }

    pub fn max_page(&self) -> u64 {
        self.max_page
    }

    pub fn mapped_pages(&self) -> usize {
        self.frames.len()
    }

    pub fn heap_bottom(&self) -> u64 {
        self.heap_bottom
    }

    pub fn program_brk(&self) -> u64 {
        self.program_brk
    }

    /// Places an empty heap at `bottom`.
    pub fn set_heap(&mut self, bottom: u64) {
        self.heap_bottom = bottom;
        self.program_brk = bottom;
    }

    pub fn is_mapped(&self, va: u64) -> bool {
        self.frames.contains_key(&page_round_down(va))
    }

    pub fn translate(&self, va: u64) -> Option<(PhysAddr, MapPermission)> {
        let va = VirtAddr::try_new(va).ok()?;
        self.table.translate(va)
    }

    /// Backs `va` with a fresh zeroed frame.
    pub fn map_page(&mut self, va: u64, perm: MapPermission, mem: &dyn PhysMemory) -> SysResult<PhysAddr> {
        if !is_page_aligned(va) {
            return Err(SysError::Misaligned);
        }
        let virt = VirtAddr::try_new(va).map_err(|_| SysError::BadAddress)?;
        let pa = mem.alloc_page().ok_or(SysError::NoMemory)?;
        mem.zero_frame(pa);
        if let Err(e) = self.table.map_page(virt, pa, perm, mem) {
            mem.free_page(pa);
            return Err(e.into());
        }
        self.frames.insert(va, pa);
        if perm.contains(MapPermission::U) {
            self.max_page = self.max_page.max(va / PAGE_SIZE as u64 + 1);
        }
        Ok(pa)
    }

    /// Maps `npages` fresh pages from `start`. Either every page gets mapped
    /// or none does.
    pub fn map_region(
        &mut self,
        start: u64,
        npages: usize,
        perm: MapPermission,
        mem: &dyn PhysMemory,
    ) -> SysResult<()> {
        let pages = page_range(start, npages)?;
        if pages.clone().any(|va| self.frames.contains_key(&va) || self.translate(va).is_some()) {
            return Err(SysError::AlreadyMapped);
        }
        for (done, va) in pages.enumerate() {
            if let Err(e) = self.map_page(va, perm, mem) {
                for undo in page_range(start, done)? {
                    self.unmap_page(undo, mem)?;
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn unmap_page(&mut self, va: u64, mem: &dyn PhysMemory) -> SysResult<()> {
        let pa = self.frames.remove(&va).ok_or(SysError::NotMapped)?;
        let virt = VirtAddr::try_new(va).map_err(|_| SysError::BadAddress)?;
        self.table.unmap_page(virt)?;
        mem.free_page(pa);
        Ok(())
    }

    /// Unmaps `npages` pages from `start` and frees their frames. Fails
    /// without touching anything if one of them is not mapped.
    pub fn unmap_region(&mut self, start: u64, npages: usize, mem: &dyn PhysMemory) -> SysResult<()> {
        let pages = page_range(start, npages)?;
        if pages.clone().any(|va| !self.frames.contains_key(&va)) {
            return Err(SysError::NotMapped);
        }
        for va in pages {
            self.unmap_page(va, mem)?;
        }
        Ok(())
    }

    /// Copies every owned page of `self` into the empty space `dst`, keeping
    /// addresses and permissions. On failure `dst` is emptied again.
    pub fn duplicate_into(&self, dst: &mut AddressSpace, mem: &dyn PhysMemory) -> SysResult<()> {
        for (&va, &src_pa) in self.frames.iter() {
            let (_, perm) = self.translate(va).ok_or(SysError::NotMapped)?;
            match dst.map_page(va, perm, mem) {
                Ok(dst_pa) => mem.copy_frame(dst_pa, src_pa),
                Err(e) => {
                    dst.clear(mem);
                    return Err(e);
                }
            }
        }
        dst.max_page = self.max_page;
        dst.heap_bottom = self.heap_bottom;
        dst.program_brk = self.program_brk;
        Ok(())
    }

    fn clear(&mut self, mem: &dyn PhysMemory) {
        let pages: Vec<u64> = self.frames.keys().copied().collect();
        for va in pages {
            if let Err(e) = self.unmap_page(va, mem) {
                log::warn!("clear: page {:#x}: {}", va, e);
            }
        }
        self.max_page = 0;
    }

    /// Frees every owned frame and then the page table itself.
    pub fn release(mut self, mem: &dyn PhysMemory) {
        for (_, pa) in core::mem::take(&mut self.frames) {
            mem.free_page(pa);
        }
        self.table.release(mem);
    }

    /// Moves the program break by `delta` bytes, returning the old break.
    pub fn grow_heap(&mut self, delta: isize, mem: &dyn PhysMemory) -> SysResult<u64> {
        let old = self.program_brk;
        let new = if delta >= 0 {
            old.checked_add(delta as u64).ok_or(SysError::NoMemory)?
        } else {
            old.checked_sub(delta.unsigned_abs() as u64).ok_or(SysError::InvalidArgument)?
        };
        if new < self.heap_bottom {
            return Err(SysError::InvalidArgument);
        }
        if new > USER_SPACE_END {
            return Err(SysError::NoMemory);
        }
        let old_top = super::page_round_up(old);
        let new_top = super::page_round_up(new);
        if new_top > old_top {
            let npages = ((new_top - old_top) / PAGE_SIZE as u64) as usize;
            let perm = MapPermission::R | MapPermission::W | MapPermission::U;
            self.map_region(old_top, npages, perm, mem)?;
        } else if new_top < old_top {
            let npages = ((old_top - new_top) / PAGE_SIZE as u64) as usize;
            self.unmap_region(new_top, npages, mem)?;
        }
        self.program_brk = new;
        Ok(old)
    }

    /// Walks `[va, va + len)` page by page, handing each piece's frame,
    /// in-frame offset and position within the range to `f`.
    fn for_each_chunk(
        &self,
        va: u64,
        len: usize,
        need: MapPermission,
        mut f: impl FnMut(PhysAddr, usize, core::ops::Range<usize>),
    ) -> SysResult<()> {
        let end = va.checked_add(len as u64).ok_or(SysError::BadAddress)?;
        if need.contains(MapPermission::U) && end > USER_SPACE_END {
            return Err(SysError::BadAddress);
        }
        let mut done = 0usize;
        while done < len {
            let cur = va + done as u64;
            let page = page_round_down(cur);
            let (pa, perm) = self.translate(page).ok_or(SysError::BadAddress)?;
            if !perm.contains(need) {
                return Err(SysError::BadAddress);
            }
            let offset = (cur - page) as usize;
            let n = (PAGE_SIZE - offset).min(len - done);
            f(pa, offset, done..done + n);
            done += n;
        }
        Ok(())
    }

    /// Copies user memory at `src` into `dst`.
    pub fn copy_in(&self, mem: &dyn PhysMemory, dst: &mut [u8], src: u64) -> SysResult<()> {
        let need = MapPermission::U | MapPermission::R;
        self.for_each_chunk(src, dst.len(), need, |pa, off, range| {
            mem.read_frame(pa, off, &mut dst[range]);
        })
    }

    /// Copies `src` into user memory at `dst`; every page must be user-writable.
    pub fn copy_out(&self, mem: &dyn PhysMemory, dst: u64, src: &[u8]) -> SysResult<()> {
        let need = MapPermission::U | MapPermission::W;
        self.for_each_chunk(dst, src.len(), need, |pa, off, range| {
            mem.write_frame(pa, off, &src[range]);
        })
    }

    /// Checks that `[va, va + len)` could be read by `copy_in`.
    pub fn check_user_readable(&self, va: u64, len: usize) -> SysResult<()> {
        self.for_each_chunk(va, len, MapPermission::U | MapPermission::R, |_, _, _| {})
    }

    /// Checks that `[va, va + len)` could be written by `copy_out`.
    pub fn check_user_writable(&self, va: u64, len: usize) -> SysResult<()> {
        self.for_each_chunk(va, len, MapPermission::U | MapPermission::W, |_, _, _| {})
    }

    /// Kernel write ignoring user permissions (image loading, trapframes).
    pub fn write_kernel(&self, mem: &dyn PhysMemory, dst: u64, src: &[u8]) -> SysResult<()> {
        self.for_each_chunk(dst, src.len(), MapPermission::empty(), |pa, off, range| {
            mem.write_frame(pa, off, &src[range]);
        })
    }

    /// Reads a NUL-terminated string of at most `max_len` bytes (terminator
    /// excluded) from user memory.
    pub fn copy_in_string(&self, mem: &dyn PhysMemory, src: u64, max_len: usize) -> SysResult<String> {
        let mut bytes = Vec::new();
        let mut cur = src;
        loop {
            let page_left = PAGE_SIZE - (cur - page_round_down(cur)) as usize;
            let want = page_left.min(max_len + 1 - bytes.len());
            let mut chunk = [0u8; PAGE_SIZE];
            self.copy_in(mem, &mut chunk[..want], cur)?;
            if let Some(nul) = chunk[..want].iter().position(|&b| b == 0) {
                bytes.extend_from_slice(&chunk[..nul]);
                break;
            }
            bytes.extend_from_slice(&chunk[..want]);
            if bytes.len() > max_len {
                return Err(SysError::NameTooLong);
            }
            cur += want as u64;
        }
        String::from_utf8(bytes).map_err(|_| SysError::InvalidArgument)
    }

    /// Reads one user word, as when walking an `argv` array.
    pub fn fetch_u64(&self, mem: &dyn PhysMemory, va: u64) -> SysResult<u64> {
        let mut word = [0u8; 8];
        self.copy_in(mem, &mut word, va)?;
        Ok(u64::from_le_bytes(word))
    }
}

/// Page addresses `start, start + PAGE_SIZE, ...`, `npages` of them.
fn page_range(start: u64, npages: usize) -> SysResult<impl Iterator<Item = u64> + Clone> {
    if !is_page_aligned(start) {
        return Err(SysError::Misaligned);
    }
    let len = (npages as u64).checked_mul(PAGE_SIZE as u64).ok_or(SysError::InvalidArgument)?;
    start.checked_add(len).ok_or(SysError::BadAddress)?;
    Ok((0..npages as u64).map(move |i| start + i * PAGE_SIZE as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::frame_allocator::FramePool;
    use crate::testing::{empty_space, phys_window};

    fn rw() -> MapPermission {
        MapPermission::R | MapPermission::W | MapPermission::U
    }

    fn setup() -> (&'static FramePool, AddressSpace) {
        let pool: &'static FramePool = alloc::boxed::Box::leak(alloc::boxed::Box::new(phys_window(64)));
        let space = empty_space(pool);
        (pool, space)
    }

    #[test]
    fn copy_out_then_copy_in_across_a_page_boundary() {
        let (pool, mut space) = setup();
        space.map_region(0x10000, 2, rw(), pool).unwrap();
        let data: Vec<u8> = (0..64u8).collect();
        let at = 0x10000 + PAGE_SIZE as u64 - 20;
        space.copy_out(pool, at, &data).unwrap();

        let mut back = [0u8; 64];
        space.copy_in(pool, &mut back, at).unwrap();
        assert_eq!(&back[..], &data[..]);
    }

    #[test]
    fn copy_fails_on_unmapped_or_read_only_pages() {
        let (pool, mut space) = setup();
        space.map_region(0x10000, 1, MapPermission::R | MapPermission::U, pool).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(space.copy_in(pool, &mut buf, 0x20000), Err(SysError::BadAddress));
        assert_eq!(space.copy_out(pool, 0x10000, b"nope"), Err(SysError::BadAddress));
        // Crossing into the unmapped next page fails as a whole.
        let mut big = [0u8; 16];
        assert_eq!(space.copy_in(pool, &mut big, 0x10ff8), Err(SysError::BadAddress));
    }

    #[test]
    fn kernel_only_pages_are_invisible_to_user_copies() {
        let (pool, mut space) = setup();
        space.map_region(0x10000, 1, MapPermission::R | MapPermission::W, pool).unwrap();
        assert_eq!(space.copy_out(pool, 0x10000, b"x"), Err(SysError::BadAddress));
        space.write_kernel(pool, 0x10000, b"x").unwrap();
    }

    #[test]
    fn strings_stop_at_nul_and_respect_the_limit() {
        let (pool, mut space) = setup();
        space.map_region(0x10000, 1, rw(), pool).unwrap();
        space.copy_out(pool, 0x10000, b"/bin/init\0").unwrap();
        assert_eq!(space.copy_in_string(pool, 0x10000, 64).unwrap(), "/bin/init");
        assert_eq!(space.copy_in_string(pool, 0x10000, 4), Err(SysError::NameTooLong));
    }

    #[test]
    fn map_region_is_all_or_nothing() {
        let (pool, mut space) = setup();
        space.map_region(0x12000, 1, rw(), pool).unwrap();
        let before = pool.free_frames();
        assert_eq!(space.map_region(0x10000, 4, rw(), pool), Err(SysError::AlreadyMapped));
        assert!(!space.is_mapped(0x10000));
        assert_eq!(pool.free_frames(), before);
    }

    #[test]
    fn map_region_rolls_back_when_memory_runs_out() {
        let pool: &'static FramePool = alloc::boxed::Box::leak(alloc::boxed::Box::new(phys_window(8)));
        let mut space = empty_space(pool);
        assert_eq!(space.map_region(0x10000, 16, rw(), pool), Err(SysError::NoMemory));
        assert_eq!(space.mapped_pages(), 0);
        assert!(space.translate(0x10000).is_none());
    }

    #[test]
    fn duplicate_copies_bytes_into_independent_frames() {
        let (pool, mut space) = setup();
        space.map_region(0x10000, 1, rw(), pool).unwrap();
        space.copy_out(pool, 0x10000, b"parent").unwrap();

        let mut child = empty_space(pool);
        space.duplicate_into(&mut child, pool).unwrap();
        child.copy_out(pool, 0x10000, b"child!").unwrap();

        let mut buf = [0u8; 6];
        space.copy_in(pool, &mut buf, 0x10000).unwrap();
        assert_eq!(&buf, b"parent");
        child.copy_in(pool, &mut buf, 0x10000).unwrap();
        assert_eq!(&buf, b"child!");
        assert_eq!(child.max_page(), space.max_page());
    }

    #[test]
    fn heap_grows_and_shrinks_but_not_below_bottom() {
        let (pool, mut space) = setup();
        space.set_heap(0x40000);
        assert_eq!(space.grow_heap(100, pool), Ok(0x40000));
        assert!(space.is_mapped(0x40000));
        assert_eq!(space.grow_heap(PAGE_SIZE as isize, pool), Ok(0x40000 + 100));
        assert!(space.is_mapped(0x41000));
        assert_eq!(space.grow_heap(-(PAGE_SIZE as isize), pool), Ok(0x41000 + 100));
        assert!(!space.is_mapped(0x41000));
        assert_eq!(space.grow_heap(-(PAGE_SIZE as isize), pool), Err(SysError::InvalidArgument));
        assert_eq!(space.program_brk(), 0x40000 + 100);
    }

    #[test]
    fn release_gives_back_all_frames() {
        let pool: &'static FramePool = alloc::boxed::Box::leak(alloc::boxed::Box::new(phys_window(32)));
        let before = pool.free_frames();
        let mut space = empty_space(pool);
        space.map_region(0x10000, 3, rw(), pool).unwrap();
        space.release(pool);
        assert_eq!(pool.free_frames(), before);
    }
}
