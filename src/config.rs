//! Compile-time limits and the fixed user address-space layout.

/// Process table capacity.
pub const NPROC: usize = 128;
/// Threads per process.
pub const NTHREAD: usize = 16;
/// Open-file slots per process; descriptors are indices into this table.
pub const FD_BUFFER_SIZE: usize = 16;
/// Cores that may run a scheduler loop.
pub const MAX_CPUS: usize = 8;

pub const PAGE_SIZE: usize = 4096;

/// Kernel stack of every thread (16 KiB).
pub const KERNEL_STACK_SIZE: usize = 4096 * 4;
/// User stack of every thread (16 KiB), preceded by an unmapped guard page.
pub const USER_STACK_SIZE: usize = 4096 * 4;

pub const MAX_PATH_LEN: usize = 200;
/// Largest chunk copied out of user memory at once for console writes.
pub const MAX_STR_LEN: usize = 256;
pub const MAX_ARG_NUM: usize = 32;
pub const MAX_SYSCALL_NUM: usize = 500;

/// Hard cap on a single mmap request.
pub const MMAP_MAX_LEN: usize = 1 << 30;

pub const IDLE_PID: usize = 0;
pub const MIN_PRIORITY: i64 = 2;
pub const DEFAULT_PRIORITY: i64 = 16;
/// Exit code of a process killed by a fault in user mode.
pub const FAULT_EXIT_CODE: i32 = -2;

/// Top of the lower canonical half, exclusive.
pub const USER_TOP: u64 = 0x0000_8000_0000_0000;
/// Page holding the user/kernel transition code.
pub const TRAMPOLINE: u64 = USER_TOP - PAGE_SIZE as u64;
/// Trapframe page of thread 0; thread `n` sits `n` pages lower.
pub const TRAPFRAME: u64 = TRAMPOLINE - PAGE_SIZE as u64;
/// Everything at or above this address belongs to the trapframe window.
pub const USER_SPACE_END: u64 = TRAPFRAME - ((NTHREAD - 1) * PAGE_SIZE) as u64;
