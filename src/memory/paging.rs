use alloc::vec::Vec;
use bitflags::bitflags;
use x86_64::{
    structures::paging::{
        mapper::{MapToError, TranslateResult, UnmapError},
        FrameAllocator, Mapper, OffsetPageTable, Page, PageTable, PageTableFlags, PhysFrame,
        Size4KiB, Translate,
    },
    PhysAddr, VirtAddr,
};

use super::PhysMemory;

bitflags! {
    /// Page permissions as the kernel sees them; converted to hardware
    /// flags by the page-table implementation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapPermission: u8 {
        const R = 1 << 1;
        const W = 1 << 2;
        const X = 1 << 3;
        const U = 1 << 4;
    }
}

impl MapPermission {
    /// Decodes the low three `prot` bits (read = 1, write = 2, exec = 4)
    /// into a user mapping. Rejects an empty set and any other bit.
    pub fn from_prot(prot: usize) -> Option<Self> {
        if prot & !0x7 != 0 || prot & 0x7 == 0 {
            return None;
        }
        Some(Self::from_bits_truncate((prot as u8) << 1) | Self::U)
    }
}

/// Failure of a page-table primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    AlreadyMapped,
    NotMapped,
    NoMemory,
    BadAddress,
}

/// Raw page-table primitives for one address space.
pub trait PageMapper: Send {
    /// Physical address of the top-level table.
    fn root(&self) -> PhysAddr;
    fn map_page(
        &mut self,
        va: VirtAddr,
        pa: PhysAddr,
        perm: MapPermission,
        mem: &dyn PhysMemory,
    ) -> Result<(), MapError>;
    /// Removes the entry for `va`, returning the frame it pointed at.
    fn unmap_page(&mut self, va: VirtAddr) -> Result<PhysAddr, MapError>;
    /// Frame address plus page offset for `va`, with the entry's permissions.
    fn translate(&self, va: VirtAddr) -> Option<(PhysAddr, MapPermission)>;
    /// Frees every table frame this mapper allocated, root included.
    /// Leaf frames are not touched.
    fn release(&mut self, mem: &dyn PhysMemory);
}

/// Four-level x86_64 page table reached through a linear physical mapping.
pub struct X86PageTable {
    root: PhysFrame,
    phys_offset: VirtAddr,
    tables: Vec<PhysFrame>,
    flush: fn(VirtAddr),
}

impl X86PageTable {
    /// Allocates an empty top-level table. When `kernel_root` is given, its
    /// upper half is shared so kernel code stays mapped after a switch.
    pub fn new(
        mem: &dyn PhysMemory,
        phys_offset: VirtAddr,
        kernel_root: Option<PhysAddr>,
        flush: fn(VirtAddr),
    ) -> Option<Self> {
        let root_pa = mem.alloc_page()?;
        mem.zero_frame(root_pa);
        let root = PhysFrame::containing_address(root_pa);
        let table = X86PageTable { root, phys_offset, tables: Vec::new(), flush };

        if let Some(kernel_root) = kernel_root {
            let kernel: &PageTable = unsafe { &*(phys_offset + kernel_root.as_u64()).as_ptr() };
            let own = unsafe { table.root_table() };
            for i in 256..512 {
                own[i] = kernel[i].clone();
            }
        }
        Some(table)
    }

    /// # Safety
    /// Caller must not hold another reference into the root table.
    #[allow(clippy::mut_from_ref)]
    unsafe fn root_table(&self) -> &'static mut PageTable {
        &mut *(self.phys_offset + self.root.start_address().as_u64()).as_mut_ptr()
    }

    fn mapper(&self) -> OffsetPageTable<'static> {
        unsafe { OffsetPageTable::new(self.root_table(), self.phys_offset) }
    }

    fn to_flags(perm: MapPermission) -> PageTableFlags {
        let mut flags = PageTableFlags::PRESENT;
        if perm.contains(MapPermission::W) {
            flags |= PageTableFlags::WRITABLE;
        }
        if perm.contains(MapPermission::U) {
            flags |= PageTableFlags::USER_ACCESSIBLE;
        }
        if !perm.contains(MapPermission::X) {
            flags |= PageTableFlags::NO_EXECUTE;
        }
        flags
    }

    fn from_flags(flags: PageTableFlags) -> MapPermission {
        let mut perm = MapPermission::R;
        if flags.contains(PageTableFlags::WRITABLE) {
            perm |= MapPermission::W;
        }
        if flags.contains(PageTableFlags::USER_ACCESSIBLE) {
            perm |= MapPermission::U;
        }
        if !flags.contains(PageTableFlags::NO_EXECUTE) {
            perm |= MapPermission::X;
        }
        perm
    }
}

/// Feeds intermediate-table allocations from `PhysMemory` and records them
/// so `release` can give them back.
struct TableFrames<'a> {
    mem: &'a dyn PhysMemory,
    taken: &'a mut Vec<PhysFrame>,
}

unsafe impl FrameAllocator<Size4KiB> for TableFrames<'_> {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        let pa = self.mem.alloc_page()?;
        self.mem.zero_frame(pa);
        let frame = PhysFrame::containing_address(pa);
        self.taken.push(frame);
        Some(frame)
    }
}

impl PageMapper for X86PageTable {
    fn root(&self) -> PhysAddr {
        self.root.start_address()
    }

    fn map_page(
        &mut self,
        va: VirtAddr,
        pa: PhysAddr,
        perm: MapPermission,
        mem: &dyn PhysMemory,
    ) -> Result<(), MapError> {
        let page = Page::<Size4KiB>::containing_address(va);
        let frame = PhysFrame::containing_address(pa);
        let parent_flags = PageTableFlags::PRESENT
            | PageTableFlags::WRITABLE
            | PageTableFlags::USER_ACCESSIBLE;
        let mut mapper = self.mapper();
        let mut frames = TableFrames { mem, taken: &mut self.tables };
        let result = unsafe {
            mapper.map_to_with_table_flags(
                page,
                frame,
                Self::to_flags(perm),
                parent_flags,
                &mut frames,
            )
        };
        match result {
            Ok(flush) => {
                flush.ignore();
                Ok(())
            }
            Err(MapToError::PageAlreadyMapped(_)) => Err(MapError::AlreadyMapped),
            Err(MapToError::FrameAllocationFailed) => Err(MapError::NoMemory),
            Err(MapToError::ParentEntryHugePage) => Err(MapError::BadAddress),
        }
    }

    fn unmap_page(&mut self, va: VirtAddr) -> Result<PhysAddr, MapError> {
        let page = Page::<Size4KiB>::containing_address(va);
        match self.mapper().unmap(page) {
            Ok((frame, flush)) => {
                flush.ignore();
                (self.flush)(page.start_address());
                Ok(frame.start_address())
            }
            Err(UnmapError::PageNotMapped) => Err(MapError::NotMapped),
            Err(_) => Err(MapError::BadAddress),
        }
    }

    fn translate(&self, va: VirtAddr) -> Option<(PhysAddr, MapPermission)> {
        match self.mapper().translate(va) {
            TranslateResult::Mapped { frame, offset, flags } => {
                Some((frame.start_address() + offset, Self::from_flags(flags)))
            }
            _ => None,
        }
    }

    fn release(&mut self, mem: &dyn PhysMemory) {
        for frame in self.tables.drain(..) {
            mem.free_page(frame.start_address());
        }
        mem.free_page(self.root.start_address());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::phys_window;

    #[test]
    fn prot_bits_are_shifted_next_to_the_user_bit() {
        let rw = MapPermission::from_prot(0b011).unwrap();
        assert_eq!(rw, MapPermission::R | MapPermission::W | MapPermission::U);
        let x = MapPermission::from_prot(0b100).unwrap();
        assert_eq!(x, MapPermission::X | MapPermission::U);
    }

    #[test]
    fn prot_rejects_empty_and_foreign_bits() {
        assert!(MapPermission::from_prot(0).is_none());
        assert!(MapPermission::from_prot(0b1000).is_none());
        assert!(MapPermission::from_prot(0b1001).is_none());
    }

    #[test]
    fn map_translate_unmap() {
        let pool = phys_window(16);
        let mut table = X86PageTable::new(&pool, pool.phys_offset(), None, |_| {}).unwrap();
        let frame = pool.alloc_page().unwrap();
        let va = VirtAddr::new(0x40_0000);
        let perm = MapPermission::R | MapPermission::W | MapPermission::U;

        table.map_page(va, frame, perm, &pool).unwrap();
        assert_eq!(table.map_page(va, frame, perm, &pool), Err(MapError::AlreadyMapped));

        let (pa, got) = table.translate(va + 0x10u64).unwrap();
        assert_eq!(pa, frame + 0x10u64);
        assert_eq!(got, perm);

        assert_eq!(table.unmap_page(va), Ok(frame));
        assert!(table.translate(va).is_none());
        assert_eq!(table.unmap_page(va), Err(MapError::NotMapped));
    }

    #[test]
    fn release_returns_every_table_frame() {
        let pool = phys_window(16);
        let before = pool.free_frames();
        let mut table = X86PageTable::new(&pool, pool.phys_offset(), None, |_| {}).unwrap();
        let frame = pool.alloc_page().unwrap();
        table
            .map_page(VirtAddr::new(0x1000), frame, MapPermission::R | MapPermission::U, &pool)
            .unwrap();
        table.release(&pool);
        pool.free_page(frame);
        assert_eq!(pool.free_frames(), before);
    }

    #[test]
    fn kernel_pages_keep_no_user_bit() {
        let pool = phys_window(16);
        let mut table = X86PageTable::new(&pool, pool.phys_offset(), None, |_| {}).unwrap();
        let frame = pool.alloc_page().unwrap();
        let va = VirtAddr::new(0x7fff_ffff_d000);
        table.map_page(va, frame, MapPermission::R | MapPermission::W, &pool).unwrap();
        let (_, perm) = table.translate(va).unwrap();
        assert!(!perm.contains(MapPermission::U));
        assert!(!perm.contains(MapPermission::X));
    }
}
