use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec;

use super::context::Context;
use crate::config::{DEFAULT_PRIORITY, KERNEL_STACK_SIZE, MAX_SYSCALL_NUM, NTHREAD};
use crate::fs::fd::FdTable;
use crate::memory::address_space::AddressSpace;
use crate::memory::PhysAddr;

/// Process state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Unused,
    Used,
    Zombie,
}

/// Thread state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Unused,
    Used,
    Sleeping,
    Runnable,
    Running,
    Exited,
}

/// Index of a process-table slot plus the generation it was allocated in.
/// A handle whose generation no longer matches the slot is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcHandle {
    pub slot: usize,
    pub generation: u64,
}

/// Non-owning link to another process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcLink {
    pub handle: ProcHandle,
    pub pid: usize,
}

/// A thread, named by its process and its index in the thread array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadRef {
    pub proc: ProcHandle,
    pub tid: usize,
}

/// Which children a sleeping `wait` accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTarget {
    Any,
    Pid(usize),
}

impl WaitTarget {
    /// `-1` waits for any child.
    pub fn from_pid(pid: isize) -> Self {
        if pid == -1 { WaitTarget::Any } else { WaitTarget::Pid(pid as usize) }
    }

    pub fn matches(self, pid: usize) -> bool {
        match self {
            WaitTarget::Any => true,
            WaitTarget::Pid(want) => want == pid,
        }
    }
}

/// Owned kernel stack memory.
pub struct KernelStack(Box<[u8]>);

impl KernelStack {
    pub fn new() -> Self {
        KernelStack(vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice())
    }

    pub fn top(&self) -> u64 {
        (self.0.as_ptr() as u64 + KERNEL_STACK_SIZE as u64) & !0xF
    }
}

impl Default for KernelStack {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Thread {
    pub state: ThreadState,
    pub tid: usize,
    /// Top of this thread's user stack.
    pub ustack: u64,
    pub kstack: Option<KernelStack>,
    /// Frame holding the trapframe, also mapped at `trapframe_va(tid)`.
    pub trapframe: PhysAddr,
    pub context: Context,
    pub exit_code: i32,
    /// Set while a core is executing on this thread's kernel stack, from
    /// the switch in until the scheduler is back on its idle context.
    pub on_cpu: bool,
    pub waiting: Option<WaitTarget>,
}

impl Thread {
    pub fn new(tid: usize) -> Self {
        Thread {
            state: ThreadState::Unused,
            tid,
            ustack: 0,
            kstack: None,
            trapframe: PhysAddr::zero(),
            context: Context::empty(),
            exit_code: 0,
            on_cpu: false,
            waiting: None,
        }
    }

    pub fn is_live(&self) -> bool {
        !matches!(self.state, ThreadState::Unused | ThreadState::Exited)
    }
}

/// Per-process syscall counters and start time, reported by `task_info`.
pub struct SyscallStats {
    pub syscall_times: [u32; MAX_SYSCALL_NUM],
    pub start_ms: u64,
}

impl SyscallStats {
    pub const fn new() -> Self {
        SyscallStats { syscall_times: [0; MAX_SYSCALL_NUM], start_ms: 0 }
    }

    /// Counts one invocation of syscall `id`; ids past the table are ignored.
    pub fn record(&mut self, id: usize) {
        if let Some(n) = self.syscall_times.get_mut(id) {
            *n += 1;
        }
    }
}

impl Default for SyscallStats {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Process {
    pub state: ProcessState,
    pub pid: usize,
    pub slot: usize,
    pub generation: u64,
    pub name: String,
    pub space: Option<AddressSpace>,
    /// Base of the per-thread user stack slots.
    pub ustack_base: u64,
    pub parent: Option<ProcLink>,
    pub exit_code: i32,
    pub files: FdTable,
    pub threads: [Thread; NTHREAD],
    pub priority: i64,
    pub stats: SyscallStats,
}

impl Process {
    pub fn new(slot: usize) -> Self {
        Process {
            state: ProcessState::Unused,
            pid: 0,
            slot,
            generation: 0,
            name: String::new(),
            space: None,
            ustack_base: 0,
            parent: None,
            exit_code: 0,
            files: FdTable::new(),
            threads: core::array::from_fn(Thread::new),
            priority: DEFAULT_PRIORITY,
            stats: SyscallStats::new(),
        }
    }

    pub fn handle(&self) -> ProcHandle {
        ProcHandle { slot: self.slot, generation: self.generation }
    }

    pub fn link(&self) -> ProcLink {
        ProcLink { handle: self.handle(), pid: self.pid }
    }

    pub fn is_child_of(&self, parent: ProcHandle) -> bool {
        self.state != ProcessState::Unused && self.parent.map(|l| l.handle) == Some(parent)
    }

    pub fn live_threads(&self) -> usize {
        self.threads.iter().filter(|t| t.is_live()).count()
    }

    pub fn any_on_cpu(&self) -> bool {
        self.threads.iter().any(|t| t.on_cpu)
    }
}
