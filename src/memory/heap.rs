use linked_list_allocator::LockedHeap;

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Hands `[start, start + size)` to the kernel heap.
///
/// # Safety
/// The range must be mapped, writable and unused, and this may only be
/// called once, before the first allocation.
pub unsafe fn init_heap(start: usize, size: usize) {
    ALLOCATOR.lock().init(start as *mut u8, size);
}
