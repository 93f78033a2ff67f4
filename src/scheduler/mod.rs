pub mod context;
pub mod lifecycle;
pub mod registry;
pub mod task;
pub mod trapframe;

use alloc::collections::VecDeque;

use crate::error::{SysError, SysResult};
use crate::kernel::{kernel, Kernel};
use crate::memory::PhysAddr;
use context::Context;
use task::{ThreadRef, ThreadState};
use trapframe::read_trapframe;

/// FIFO of runnable threads shared by every core.
pub struct ReadyQueue {
    queue: VecDeque<ThreadRef>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        ReadyQueue { queue: VecDeque::new() }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-core scheduling state.
pub struct Processor {
    /// Thread whose kernel context this core is executing, if any.
    pub current: Option<ThreadRef>,
    /// Where `sched` returns to: the core's scheduler loop.
    pub idle: Context,
}

impl Processor {
    pub const fn new() -> Self {
        Processor { current: None, idle: Context::empty() }
    }
}

impl Default for Processor {
    fn default() -> Self {
        Self::new()
    }
}

/// First code a new thread runs after its initial switch: drops into user
/// mode with the registers in its trapframe.
pub extern "C" fn thread_entry() -> ! {
    let k = kernel();
    let tf = k
        .current()
        .and_then(|t| {
            let p = k.procs.lock(t.proc)?;
            Ok(read_trapframe(&*k.mem, p.threads[t.tid].trapframe))
        })
        .unwrap_or_else(|e| panic!("thread_entry: {}", e));
    k.machine.return_to_user(&tf)
}

impl Kernel {
    /// The thread bound to the executing core.
    pub fn current(&self) -> SysResult<ThreadRef> {
        let cpu = self.machine.cpu_id();
        self.cpus[cpu].lock().current.ok_or(SysError::NoCurrentThread)
    }

    pub fn push_ready(&self, t: ThreadRef) {
        self.ready.lock().queue.push_back(t);
    }

    pub fn pop_ready(&self) -> Option<ThreadRef> {
        self.ready.lock().queue.pop_front()
    }

    /// Takes the next runnable thread off the queue and binds it to `cpu`.
    /// Returns its saved context and page table root.
    ///
    /// Entries for threads that died while queued are dropped. A thread
    /// still finishing a switch on another core goes back to the tail.
    pub fn pick_next(&self, cpu: usize) -> Option<(*const Context, PhysAddr)> {
        let t = self.pop_ready()?;
        let mut p = match self.procs.lock(t.proc) {
            Ok(p) => p,
            Err(_) => return None,
        };
        let root = p.space.as_ref()?.root();
        let thread = &mut p.threads[t.tid];
        if thread.state != ThreadState::Runnable {
            return None;
        }
        if thread.on_cpu {
            drop(p);
            self.push_ready(t);
            return None;
        }
        thread.state = ThreadState::Running;
        thread.on_cpu = true;
        let ctx = &thread.context as *const Context;
        drop(p);

        self.cpus[cpu].lock().current = Some(t);
        Some((ctx, root))
    }

    /// Runs after a thread switched back to the scheduler on `cpu`: the
    /// thread's context is saved, so other cores may pick it again.
    pub fn finish_switch(&self, cpu: usize) {
        let Some(prev) = self.cpus[cpu].lock().current.take() else { return };
        if let Ok(mut p) = self.procs.lock(prev.proc) {
            p.threads[prev.tid].on_cpu = false;
        }
    }

    fn idle_context(&self, cpu: usize) -> *mut Context {
        &mut self.cpus[cpu].lock().idle as *mut Context
    }

    /// Runs one thread until it gives the core back. Returns false when no
    /// thread could be started.
    pub fn run_next(&self) -> bool {
        let cpu = self.machine.cpu_id();
        let Some((ctx, root)) = self.pick_next(cpu) else { return false };
        self.machine.activate(root);
        let idle = self.idle_context(cpu);
        unsafe { self.machine.switch(idle, ctx) };
        self.finish_switch(cpu);
        true
    }

    /// Per-core scheduler. Parks the core while there is nothing to run.
    pub fn scheduler_loop(&self) -> ! {
        log::info!("cpu {}: entering scheduler", self.machine.cpu_id());
        loop {
            if !self.run_next() && self.ready.lock().is_empty() {
                self.machine.park();
            }
        }
    }

    /// Switches from the current thread back to this core's scheduler.
    /// The caller has already moved the thread out of RUNNING.
    pub fn sched(&self) {
        let cpu = self.machine.cpu_id();
        let t = match self.current() {
            Ok(t) => t,
            Err(_) => panic!("sched: no current thread on cpu {}", cpu),
        };
        let ctx = match self.procs.lock(t.proc) {
            Ok(mut p) => {
                let thread = &mut p.threads[t.tid];
                assert_ne!(thread.state, ThreadState::Running, "sched: thread still running");
                &mut thread.context as *mut Context
            }
            Err(e) => panic!("sched: {}", e),
        };
        let idle = self.idle_context(cpu);
        unsafe { self.machine.switch(ctx, idle) };
    }

    /// Gives up the core; the thread rejoins the tail of the ready queue.
    pub fn yield_now(&self) -> SysResult<()> {
        let t = self.current()?;
        {
            let mut p = self.procs.lock(t.proc)?;
            let thread = &mut p.threads[t.tid];
            // A sibling's exit or exec may already have ended this thread.
            if thread.state == ThreadState::Running {
                thread.state = ThreadState::Runnable;
                drop(p);
                self.push_ready(t);
            }
        }
        self.sched();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestKernel;

    #[test]
    fn ready_queue_is_fifo() {
        let t = TestKernel::new();
        let a = t.spawn_runnable();
        let b = t.spawn_runnable();
        assert_eq!(t.k.pop_ready(), Some(a));
        assert_eq!(t.k.pop_ready(), Some(b));
        assert_eq!(t.k.pop_ready(), None);
    }

    #[test]
    fn pick_next_binds_the_thread_to_the_core() {
        let t = TestKernel::new();
        let a = t.spawn_runnable();
        assert!(t.k.pick_next(0).is_some());
        assert_eq!(t.k.current(), Ok(a));
        assert_eq!(t.thread_state(a), ThreadState::Running);
        assert!(t.k.procs.lock(a.proc).unwrap().threads[a.tid].on_cpu);
        assert!(t.k.pick_next(0).is_none());
    }

    #[test]
    fn yield_on_the_only_thread_comes_back_to_it() {
        let t = TestKernel::new();
        let a = t.spawn_runnable();
        t.k.pick_next(0).unwrap();

        t.k.yield_now().unwrap();
        assert_eq!(t.thread_state(a), ThreadState::Runnable);
        assert_eq!(t.k.ready.lock().len(), 1);
        t.k.finish_switch(0);

        assert!(t.k.pick_next(0).is_some());
        assert_eq!(t.k.current(), Ok(a));
        assert_eq!(t.thread_state(a), ThreadState::Running);
    }

    #[test]
    fn thread_still_switching_out_is_not_picked_twice() {
        let t = TestKernel::new();
        let a = t.spawn_runnable();
        t.k.pick_next(0).unwrap();
        t.k.yield_now().unwrap();
        // Core 0 has not finished switching away from `a` yet.
        assert!(t.k.pick_next(1).is_none());
        assert_eq!(t.k.ready.lock().len(), 1);
        t.k.finish_switch(0);
        assert!(t.k.pick_next(1).is_some());
        assert_eq!(t.k.cpus[1].lock().current, Some(a));
    }

    #[test]
    fn dead_queue_entries_are_dropped() {
        let t = TestKernel::new();
        let a = t.spawn_runnable();
        t.k.procs.lock(a.proc).unwrap().threads[a.tid].state = ThreadState::Exited;
        assert!(t.k.pick_next(0).is_none());
        assert!(t.k.ready.lock().is_empty());
        assert_eq!(t.k.current(), Err(SysError::NoCurrentThread));
    }

    #[test]
    fn run_next_switches_and_unbinds() {
        let t = TestKernel::new();
        let a = t.spawn_runnable();
        assert!(t.k.run_next());
        // The test machine's switch returns at once, as if the thread had
        // immediately gone back to the scheduler.
        assert_eq!(t.k.current(), Err(SysError::NoCurrentThread));
        assert!(!t.k.procs.lock(a.proc).unwrap().threads[a.tid].on_cpu);
        assert_eq!(t.machine.switches(), 1);
        assert!(!t.k.run_next());
    }
}
