use alloc::string::String;
use alloc::vec::Vec;

use crate::config::{IDLE_PID, MAX_ARG_NUM, MAX_PATH_LEN, MAX_STR_LEN, MAX_SYSCALL_NUM, MIN_PRIORITY};
use crate::error::{SysError, SysResult};
use crate::kernel::Kernel;
use crate::scheduler::task::ThreadRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TaskStatus {
    UnInit = 0,
    Ready = 1,
    Running = 2,
    Exited = 3,
}

/// `task_info` result as laid out for user programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct TaskInfo {
    pub status: u32,
    pub syscall_times: [u32; MAX_SYSCALL_NUM],
    /// Milliseconds since the process was created.
    pub time: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct TimeVal {
    pub sec: u64,
    pub usec: u64,
}

impl Kernel {
    pub(super) fn sys_getpid(&self, cur: ThreadRef) -> SysResult<isize> {
        Ok(self.procs.lock(cur.proc)?.pid as isize)
    }

    pub(super) fn sys_getppid(&self, cur: ThreadRef) -> SysResult<isize> {
        let parent = self.procs.lock(cur.proc)?.parent;
        Ok(parent.map_or(IDLE_PID, |l| l.pid) as isize)
    }

    pub(super) fn sys_gettimeofday(&self, cur: ThreadRef, va: u64) -> SysResult<isize> {
        let us = self.machine.uptime_us();
        let tv = TimeVal { sec: us / 1_000_000, usec: us % 1_000_000 };
        self.copy_out_value(cur, va, &tv)?;
        Ok(0)
    }

    pub(super) fn sys_set_priority(&self, cur: ThreadRef, prio: i64) -> SysResult<isize> {
        if prio < MIN_PRIORITY {
            return Err(SysError::InvalidArgument);
        }
        self.procs.lock(cur.proc)?.priority = prio;
        Ok(prio as isize)
    }

    pub(super) fn sys_task_info(&self, cur: ThreadRef, va: u64) -> SysResult<isize> {
        let now_ms = self.machine.uptime_us() / 1000;
        let info = {
            let p = self.procs.lock(cur.proc)?;
            TaskInfo {
                status: TaskStatus::Running as u32,
                syscall_times: p.stats.syscall_times,
                time: now_ms.saturating_sub(p.stats.start_ms) as i32,
            }
        };
        self.copy_out_value(cur, va, &info)?;
        Ok(0)
    }

    pub(super) fn sys_spawn(&self, cur: ThreadRef, path_va: u64) -> SysResult<isize> {
        let path = self.user_string(cur, path_va, MAX_PATH_LEN)?;
        log::debug!("sys_spawn {}", path);
        Ok(self.spawn(&path)? as isize)
    }

    pub(super) fn sys_execve(&self, cur: ThreadRef, path_va: u64, argv_va: u64) -> SysResult<isize> {
        let path = self.user_string(cur, path_va, MAX_PATH_LEN)?;
        let argv = self.with_space(cur, |space, mem| {
            let mut argv: Vec<String> = Vec::new();
            if argv_va == 0 {
                return Ok(argv);
            }
            loop {
                let at = argv_va + (argv.len() * 8) as u64;
                let ptr = space.fetch_u64(mem, at)?;
                if ptr == 0 {
                    return Ok(argv);
                }
                if argv.len() == MAX_ARG_NUM {
                    return Err(SysError::InvalidArgument);
                }
                argv.push(space.copy_in_string(mem, ptr, MAX_STR_LEN)?);
            }
        })?;
        Ok(self.exec(&path, &argv)? as isize)
    }

    pub(super) fn sys_wait4(&self, cur: ThreadRef, pid: isize, code_va: u64) -> SysResult<isize> {
        // Check before reaping so a bad pointer cannot lose the exit code.
        if code_va != 0 {
            self.with_space(cur, |space, _| space.check_user_writable(code_va, 4))?;
        }
        let (pid, code) = self.wait(pid)?;
        if code_va != 0 {
            self.copy_out_value(cur, code_va, &code)?;
        }
        Ok(pid as isize)
    }
}
