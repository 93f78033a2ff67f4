mod fs;
mod memory;
mod process;

pub use process::{TaskInfo, TaskStatus, TimeVal};
pub use fs::Stat;

use crate::error::{SysError, SysResult};
use crate::kernel::Kernel;
use crate::memory::address_space::AddressSpace;
use crate::memory::PhysMemory;
use crate::scheduler::task::{ThreadRef, ThreadState};
use crate::scheduler::trapframe::{read_trapframe, write_trapframe};

/// Syscall numbers (passed in RAX from userland).
pub const SYS_UNLINKAT: usize = 35;
pub const SYS_LINKAT: usize = 37;
pub const SYS_OPENAT: usize = 56;
pub const SYS_CLOSE: usize = 57;
pub const SYS_READ: usize = 63;
pub const SYS_WRITE: usize = 64;
pub const SYS_FSTAT: usize = 80;
pub const SYS_EXIT: usize = 93;
pub const SYS_SCHED_YIELD: usize = 124;
pub const SYS_SETPRIORITY: usize = 140;
pub const SYS_GETTIMEOFDAY: usize = 169;
pub const SYS_GETPID: usize = 172;
pub const SYS_GETPPID: usize = 173;
pub const SYS_SBRK: usize = 214;
pub const SYS_MUNMAP: usize = 215;
pub const SYS_CLONE: usize = 220;
pub const SYS_EXECVE: usize = 221;
pub const SYS_MMAP: usize = 222;
pub const SYS_WAIT4: usize = 260;
pub const SYS_SPAWN: usize = 400;
pub const SYS_TASK_INFO: usize = 410;

/// Views a padding-free `repr(C)` value as the bytes user programs expect.
fn as_bytes<T: Copy>(value: &T) -> &[u8] {
    unsafe { core::slice::from_raw_parts(value as *const T as *const u8, core::mem::size_of::<T>()) }
}

impl Kernel {
    /// Entry from the trap handler for a syscall made by the current thread.
    /// Reads the number and arguments from its trapframe and writes the
    /// result back.
    pub fn handle_syscall(&self) {
        let cur = match self.current() {
            Ok(t) => t,
            Err(_) => panic!("syscall trap without a current thread"),
        };
        let tf = match self.procs.lock(cur.proc) {
            Ok(mut p) => {
                let tf = read_trapframe(&*self.mem, p.threads[cur.tid].trapframe);
                p.stats.record(tf.syscall_id());
                tf
            }
            Err(e) => panic!("syscall from dead process: {}", e),
        };

        let id = tf.syscall_id();
        let args = tf.args();
        log::trace!("syscall {} args = {:x?}", id, args);
        let ret = match self.dispatch(cur, id, args) {
            Ok(v) => v,
            Err(e) => {
                log::debug!("syscall {} failed: {}", id, e);
                e.as_ret()
            }
        };
        log::trace!("syscall {} ret {}", id, ret);

        let Ok(p) = self.procs.lock(cur.proc) else {
            panic!("process vanished during syscall {}", id);
        };
        let thread = &p.threads[cur.tid];
        // exec moves the trapframe, so look it up again.
        let mut tf = read_trapframe(&*self.mem, thread.trapframe);
        tf.set_return(ret);
        write_trapframe(&*self.mem, thread.trapframe, &tf);

        if thread.state == ThreadState::Exited {
            // A sibling exited or exec'd while this thread was in the kernel.
            drop(p);
            self.sched();
            panic!("ended thread rescheduled");
        }
    }

    /// Central syscall dispatcher.
    pub fn dispatch(&self, cur: ThreadRef, id: usize, args: [usize; 6]) -> SysResult<isize> {
        match id {
            SYS_WRITE => self.sys_write(cur, args[0] as isize, args[1] as u64, args[2]),
            SYS_READ => self.sys_read(cur, args[0] as isize, args[1] as u64, args[2]),
            SYS_OPENAT => self.sys_openat(cur, args[0] as u64, args[1] as u32),
            SYS_CLOSE => self.sys_close(cur, args[0] as isize),
            SYS_FSTAT => self.sys_fstat(cur, args[0] as isize, args[1] as u64),
            SYS_LINKAT => self.sys_linkat(cur, args[1] as u64, args[3] as u64),
            SYS_UNLINKAT => self.sys_unlinkat(cur, args[1] as u64),
            SYS_EXIT => self.exit(args[0] as i32),
            SYS_SCHED_YIELD => self.yield_now().map(|_| 0),
            SYS_SETPRIORITY => self.sys_set_priority(cur, args[0] as i64),
            SYS_GETTIMEOFDAY => self.sys_gettimeofday(cur, args[0] as u64),
            SYS_GETPID => self.sys_getpid(cur),
            SYS_GETPPID => self.sys_getppid(cur),
            SYS_CLONE => self.fork().map(|pid| pid as isize),
            SYS_EXECVE => self.sys_execve(cur, args[0] as u64, args[1] as u64),
            SYS_WAIT4 => self.sys_wait4(cur, args[0] as isize, args[1] as u64),
            SYS_SPAWN => self.sys_spawn(cur, args[0] as u64),
            SYS_TASK_INFO => self.sys_task_info(cur, args[0] as u64),
            SYS_SBRK => self.sys_sbrk(cur, args[0] as isize),
            SYS_MMAP => self.sys_mmap(cur, args[0] as u64, args[1], args[2]),
            SYS_MUNMAP => self.sys_munmap(cur, args[0] as u64, args[1]),
            _ => {
                log::error!("unknown syscall {}", id);
                Err(SysError::UnknownSyscall(id))
            }
        }
    }

    /// Runs `f` on the caller's address space with its process locked.
    fn with_space<R>(
        &self,
        cur: ThreadRef,
        f: impl FnOnce(&mut AddressSpace, &dyn PhysMemory) -> SysResult<R>,
    ) -> SysResult<R> {
        let mut p = self.procs.lock(cur.proc)?;
        let space = p.space.as_mut().ok_or(SysError::StaleHandle)?;
        f(space, &*self.mem)
    }

    fn copy_out_value<T: Copy>(&self, cur: ThreadRef, va: u64, value: &T) -> SysResult<()> {
        self.with_space(cur, |space, mem| space.copy_out(mem, va, as_bytes(value)))
    }

    fn user_string(&self, cur: ThreadRef, va: u64, max_len: usize) -> SysResult<alloc::string::String> {
        self.with_space(cur, |space, mem| space.copy_in_string(mem, va, max_len))
    }
}
