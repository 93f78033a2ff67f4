//! What the process core needs from the machine underneath it.

#[cfg(target_os = "none")]
pub mod pc;

use alloc::boxed::Box;

use crate::memory::paging::PageMapper;
use crate::memory::{PhysAddr, PhysMemory};
use crate::scheduler::context::Context;
use crate::scheduler::trapframe::TrapFrame;

pub trait Machine: Send + Sync {
    /// Index of the executing core, below `MAX_CPUS`.
    fn cpu_id(&self) -> usize;
    /// Time since boot in microseconds.
    fn uptime_us(&self) -> u64;
    /// Idles the core until something may have become runnable.
    fn park(&self);

    fn console_write(&self, bytes: &[u8]);
    /// Next input byte, if one is pending.
    fn console_getc(&self) -> Option<u8>;

    /// Saves the callee-saved registers into `old` and resumes `new`.
    /// Returns when something switches back to `old`.
    ///
    /// # Safety
    /// Both contexts must stay valid and untouched by other cores until the
    /// switch completes.
    unsafe fn switch(&self, old: *mut Context, new: *const Context);

    /// Makes the page table at `root` the active user address space.
    fn activate(&self, root: PhysAddr);
    /// Empty user page table sharing the kernel mappings.
    fn new_page_table(&self, mem: &dyn PhysMemory) -> Option<Box<dyn PageMapper>>;

    /// Leaves the kernel with the registers in `tf`.
    fn return_to_user(&self, tf: &TrapFrame) -> !;
}
