use core::ptr;

use crate::config::{PAGE_SIZE, TRAPFRAME};
use crate::memory::{PhysAddr, PhysMemory};

/// User register snapshot taken by the trap entry code.
///
/// The first four words are filled by the kernel before returning to user
/// mode so the entry stub can find its way back. The layout is shared with
/// that stub and must not change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct TrapFrame {
    pub kernel_cr3: u64,
    pub kernel_rsp: u64,
    pub kernel_trap: u64,
    pub cpu_id: u64,

    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
    pub rsp: u64,
}

const RFLAGS_IF: u64 = 0x202;

impl TrapFrame {
    /// Frame that starts user execution at `entry` with stack `user_sp`.
    pub fn init_user(entry: u64, user_sp: u64, kernel_sp: u64) -> Self {
        TrapFrame {
            kernel_rsp: kernel_sp,
            rip: entry,
            rsp: user_sp,
            rflags: RFLAGS_IF,
            ..TrapFrame::default()
        }
    }

    pub fn syscall_id(&self) -> usize {
        self.rax as usize
    }

    /// Syscall arguments in ABI order: rdi, rsi, rdx, r10, r8, r9.
    pub fn args(&self) -> [usize; 6] {
        [self.rdi, self.rsi, self.rdx, self.r10, self.r8, self.r9].map(|r| r as usize)
    }

    pub fn set_return(&mut self, value: isize) {
        self.rax = value as u64;
    }
}

/// Virtual address of thread `tid`'s trapframe page. Slots grow downwards
/// from `TRAPFRAME`, one page per thread.
pub const fn trapframe_va(tid: usize) -> u64 {
    TRAPFRAME - (tid * PAGE_SIZE) as u64
}

pub fn read_trapframe(mem: &dyn PhysMemory, pa: PhysAddr) -> TrapFrame {
    unsafe { ptr::read(mem.frame_ptr(pa) as *const TrapFrame) }
}

pub fn write_trapframe(mem: &dyn PhysMemory, pa: PhysAddr, tf: &TrapFrame) {
    unsafe { ptr::write(mem.frame_ptr(pa) as *mut TrapFrame, *tf) }
}
