use alloc::vec::Vec;
use spin::Mutex;
use x86_64::{PhysAddr, VirtAddr};

use super::PhysMemory;
use crate::config::PAGE_SIZE;

/// Bump allocator over a physical range with a recycle list for freed frames.
///
/// Frames are reached through a linear mapping of physical memory at
/// `phys_offset`.
pub struct FramePool {
    phys_offset: VirtAddr,
    inner: Mutex<PoolInner>,
}

struct PoolInner {
    next_free_frame: u64,
    current_limit: u64,
    recycled: Vec<u64>,
}

impl FramePool {
    /// Hand out the frames in `[start, end)`.
    ///
    /// # Safety
    /// The range must be unused RAM, mapped writable at `phys_offset + pa`.
    pub unsafe fn new(start: PhysAddr, end: PhysAddr, phys_offset: VirtAddr) -> Self {
        FramePool {
            phys_offset,
            inner: Mutex::new(PoolInner {
                next_free_frame: start.align_up(PAGE_SIZE as u64).as_u64(),
                current_limit: end.align_down(PAGE_SIZE as u64).as_u64(),
                recycled: Vec::new(),
            }),
        }
    }

    pub fn phys_offset(&self) -> VirtAddr {
        self.phys_offset
    }

    /// Frames still available for allocation.
    pub fn free_frames(&self) -> usize {
        let inner = self.inner.lock();
        let untouched = (inner.current_limit - inner.next_free_frame) / PAGE_SIZE as u64;
        untouched as usize + inner.recycled.len()
    }
}

unsafe impl PhysMemory for FramePool {
    fn alloc_page(&self) -> Option<PhysAddr> {
        let mut inner = self.inner.lock();
        if let Some(pa) = inner.recycled.pop() {
            return Some(PhysAddr::new(pa));
        }
        if inner.next_free_frame < inner.current_limit {
            let frame = inner.next_free_frame;
            inner.next_free_frame += PAGE_SIZE as u64;
            Some(PhysAddr::new(frame))
        } else {
            None
        }
    }

    fn free_page(&self, pa: PhysAddr) {
        debug_assert!(pa.is_aligned(PAGE_SIZE as u64), "free_page: unaligned frame {:?}", pa);
        let mut inner = self.inner.lock();
        debug_assert!(!inner.recycled.contains(&pa.as_u64()), "free_page: double free {:?}", pa);
        inner.recycled.push(pa.as_u64());
    }

    fn frame_ptr(&self, pa: PhysAddr) -> *mut u8 {
        (self.phys_offset + pa.as_u64()).as_mut_ptr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::phys_window;

    #[test]
    fn recycles_freed_frames_before_bumping() {
        let pool = phys_window(4);
        assert_eq!(pool.free_frames(), 4);
        let a = pool.alloc_page().unwrap();
        let b = pool.alloc_page().unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.free_frames(), 2);

        pool.free_page(a);
        assert_eq!(pool.alloc_page(), Some(a));
    }

    #[test]
    fn exhaustion_returns_none() {
        let pool = phys_window(2);
        assert!(pool.alloc_page().is_some());
        assert!(pool.alloc_page().is_some());
        assert!(pool.alloc_page().is_none());
    }

    #[test]
    fn frame_bytes_are_reachable_through_the_window() {
        let pool = phys_window(2);
        let pa = pool.alloc_page().unwrap();
        pool.zero_frame(pa);
        pool.write_frame(pa, 100, b"atomic");
        let mut buf = [0u8; 6];
        pool.read_frame(pa, 100, &mut buf);
        assert_eq!(&buf, b"atomic");

        let other = pool.alloc_page().unwrap();
        pool.copy_frame(other, pa);
        pool.read_frame(other, 100, &mut buf);
        assert_eq!(&buf, b"atomic");
    }
}
