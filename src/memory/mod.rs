pub mod address_space;
pub mod frame_allocator;
#[cfg(target_os = "none")]
pub mod heap;
pub mod mmap;
pub mod paging;

use core::ptr;

pub use x86_64::{PhysAddr, VirtAddr};

use crate::config::PAGE_SIZE;

/// Physical page allocator plus kernel access to the frames it hands out.
///
/// # Safety
/// `frame_ptr` must return a kernel-writable pointer valid for `PAGE_SIZE`
/// bytes and aligned to `PAGE_SIZE` for every frame returned by `alloc_page`
/// (and for every page-table frame reachable from a table built on it).
pub unsafe trait PhysMemory: Send + Sync {
    fn alloc_page(&self) -> Option<PhysAddr>;
    fn free_page(&self, pa: PhysAddr);
    fn frame_ptr(&self, pa: PhysAddr) -> *mut u8;

    fn zero_frame(&self, pa: PhysAddr) {
        unsafe { ptr::write_bytes(self.frame_ptr(pa), 0, PAGE_SIZE) }
    }

    fn copy_frame(&self, dst: PhysAddr, src: PhysAddr) {
        unsafe { ptr::copy_nonoverlapping(self.frame_ptr(src), self.frame_ptr(dst), PAGE_SIZE) }
    }

    /// Copies `buf.len()` bytes starting `offset` bytes into the frame.
    fn read_frame(&self, pa: PhysAddr, offset: usize, buf: &mut [u8]) {
        assert!(offset + buf.len() <= PAGE_SIZE, "read_frame: range crosses frame");
        unsafe {
            ptr::copy_nonoverlapping(self.frame_ptr(pa).add(offset), buf.as_mut_ptr(), buf.len())
        }
    }

    fn write_frame(&self, pa: PhysAddr, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= PAGE_SIZE, "write_frame: range crosses frame");
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.frame_ptr(pa).add(offset), data.len())
        }
    }
}

pub const fn page_round_up(n: u64) -> u64 {
    (n + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

pub const fn page_round_down(n: u64) -> u64 {
    n & !(PAGE_SIZE as u64 - 1)
}

pub const fn is_page_aligned(n: u64) -> bool {
    n & (PAGE_SIZE as u64 - 1) == 0
}

/// Number of pages needed to cover `len` bytes.
pub const fn pages_for(len: usize) -> usize {
    (len + PAGE_SIZE - 1) / PAGE_SIZE
}
