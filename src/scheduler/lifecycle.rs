//! Creating, replacing and reaping processes.

use alloc::string::String;
use alloc::vec::Vec;

use super::registry::map_thread_pages;
use super::task::{ProcHandle, ProcLink, Process, ProcessState, Thread, ThreadRef, ThreadState, WaitTarget};
use super::trapframe::{read_trapframe, write_trapframe, TrapFrame};
use crate::config::{FAULT_EXIT_CODE, NTHREAD, PAGE_SIZE, USER_STACK_SIZE};
use crate::error::{SysError, SysResult};
use crate::fs::fd::FdTable;
use crate::kernel::Kernel;
use crate::memory::address_space::AddressSpace;
use crate::memory::PhysMemory;

/// Result of one scan for a child to reap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Reaped { pid: usize, code: i32 },
    /// A matching child is a zombie but one of its threads has not left
    /// its core yet.
    Busy,
    /// Matching children exist, none has exited.
    Pending,
    NoChild,
}

/// Writes `argv` to the stack below `top`: the strings, then a NULL
/// terminated pointer array. Returns the new stack pointer, which is also
/// the address of that array.
pub fn push_argv(space: &AddressSpace, mem: &dyn PhysMemory, top: u64, argv: &[String]) -> SysResult<u64> {
    let mut sp = top;
    let mut ptrs = Vec::with_capacity(argv.len() + 1);
    for arg in argv {
        sp = sp.checked_sub(arg.len() as u64 + 1).ok_or(SysError::BadAddress)?;
        space.copy_out(mem, sp, arg.as_bytes())?;
        space.copy_out(mem, sp + arg.len() as u64, &[0])?;
        ptrs.push(sp);
    }
    ptrs.push(0);

    sp = (sp - (ptrs.len() * 8) as u64) & !0xF;
    let table: Vec<u8> = ptrs.iter().flat_map(|p| p.to_le_bytes()).collect();
    space.copy_out(mem, sp, &table)?;
    Ok(sp)
}

/// A freshly loaded program, not yet attached to any process.
struct Image {
    space: AddressSpace,
    entry: u64,
    ustack_base: u64,
}

impl Kernel {
    /// Loads `path` into a new address space with the stack slots and heap
    /// laid out above the image.
    fn load_image(&self, path: &str) -> SysResult<Image> {
        let table = self.machine.new_page_table(&*self.mem).ok_or(SysError::NoMemory)?;
        let mut space = AddressSpace::new(table);
        match self.loader.load(path, &mut space, &*self.mem) {
            Ok(img) => {
                let ustack_base = img.image_end + PAGE_SIZE as u64;
                let heap = ustack_base + (NTHREAD * (USER_STACK_SIZE + PAGE_SIZE)) as u64;
                space.set_heap(heap);
                Ok(Image { space, entry: img.entry, ustack_base })
            }
            Err(e) => {
                space.release(&*self.mem);
                Err(e.into())
            }
        }
    }

    /// Frees everything a process owns and returns its slot to the table.
    /// No thread of `p` may be on a core.
    pub fn reclaim(&self, p: &mut Process) {
        if let Some(space) = p.space.take() {
            space.release(&*self.mem);
        }
        p.files.clear();
        for (tid, t) in p.threads.iter_mut().enumerate() {
            *t = Thread::new(tid);
        }
        p.parent = None;
        p.name.clear();
        p.state = ProcessState::Unused;
    }

    /// Duplicates the calling process. The child resumes from the same trap
    /// with 0 in its return register; the parent gets the child's pid.
    pub fn fork(&self) -> SysResult<usize> {
        let cur = self.current()?;
        let parent = self.procs.lock(cur.proc)?;
        let (child_h, mut child) = self.procs.allocate_process(&*self.machine, &*self.mem)?;

        if let Err(e) = self.copy_process(&parent, &mut child, cur) {
            log::debug!("fork: {}", e);
            self.reclaim(&mut child);
            return Err(e);
        }
        let pid = child.pid;
        log::info!("fork: pid {} -> child {}", parent.pid, pid);
        drop(child);
        drop(parent);
        self.push_ready(ThreadRef { proc: child_h, tid: cur.tid });
        Ok(pid)
    }

    fn copy_process(&self, parent: &Process, child: &mut Process, cur: ThreadRef) -> SysResult<()> {
        let mem = &*self.mem;
        let src = parent.space.as_ref().ok_or(SysError::StaleHandle)?;
        let dst = child.space.as_mut().ok_or(SysError::StaleHandle)?;
        src.duplicate_into(dst, mem)?;

        child.files = parent.files.clone();
        child.ustack_base = parent.ustack_base;
        child.parent = Some(ProcLink { handle: cur.proc, pid: parent.pid });
        child.name = parent.name.clone();
        child.priority = parent.priority;

        child.install_thread(cur.tid, 0, false, mem)?;
        let thread = &mut child.threads[cur.tid];
        thread.ustack = parent.threads[cur.tid].ustack;
        let mut tf = read_trapframe(mem, thread.trapframe);
        tf.set_return(0);
        write_trapframe(mem, thread.trapframe, &tf);
        Ok(())
    }

    /// Replaces the calling process's image with `path`. On success the
    /// calling thread resumes at the new entry with `argv` on its stack and
    /// the other threads are gone. On failure nothing has changed.
    pub fn exec(&self, path: &str, argv: &[String]) -> SysResult<usize> {
        let cur = self.current()?;
        let mem = &*self.mem;
        let mut image = self.load_image(path)?;
        let prepared = map_thread_pages(&mut image.space, image.ustack_base, cur.tid, mem)
            .and_then(|(top, tf_pa)| Ok((top, tf_pa, push_argv(&image.space, mem, top, argv)?)));
        let (ustack_top, tf_pa, sp) = match prepared {
            Ok(v) => v,
            Err(e) => {
                image.space.release(mem);
                return Err(e);
            }
        };

        let mut p = loop {
            let mut p = match self.procs.lock(cur.proc) {
                Ok(p) => p,
                Err(e) => {
                    image.space.release(mem);
                    return Err(e);
                }
            };
            if p.threads[cur.tid].state == ThreadState::Exited {
                // A sibling's exec or exit got here first.
                drop(p);
                image.space.release(mem);
                return Err(SysError::ThreadEnded);
            }
            for (tid, t) in p.threads.iter_mut().enumerate() {
                if tid != cur.tid && t.state != ThreadState::Unused {
                    t.state = ThreadState::Exited;
                }
            }
            // Siblings running elsewhere still use the old page table.
            if !p.threads.iter().enumerate().any(|(tid, t)| tid != cur.tid && t.on_cpu) {
                break p;
            }
            drop(p);
            core::hint::spin_loop();
        };

        let root = image.space.root();
        let thread = &mut p.threads[cur.tid];
        let kstack_top = thread.kstack.as_ref().map(|k| k.top()).unwrap_or(0);
        let mut tf = TrapFrame::init_user(image.entry, sp, kstack_top);
        tf.rdi = argv.len() as u64;
        tf.rsi = sp;
        write_trapframe(mem, tf_pa, &tf);
        thread.trapframe = tf_pa;
        thread.ustack = ustack_top;

        p.ustack_base = image.ustack_base;
        p.name = String::from(path);
        let old = p.space.replace(image.space);
        self.machine.activate(root);
        drop(p);

        if let Some(old) = old {
            old.release(mem);
        }
        log::info!("exec: '{}' argc={}", path, argv.len());
        Ok(argv.len())
    }

    /// Creates a process running `path` directly, as a child of the caller
    /// (or of init when called outside any process). Returns its pid.
    pub fn spawn(&self, path: &str) -> SysResult<usize> {
        let parent = match self.current() {
            Ok(t) => Some(self.procs.lock(t.proc)?.link()),
            Err(_) => self.root.get().copied(),
        };
        self.spawn_process(path, parent).map(|link| link.pid)
    }

    /// Starts the first user process. Orphans are handed to it from then on.
    pub fn spawn_init(&self, path: &str) -> SysResult<usize> {
        let link = self.spawn_process(path, None)?;
        self.root.call_once(|| link);
        log::info!("init: pid {} from '{}'", link.pid, path);
        Ok(link.pid)
    }

    fn spawn_process(&self, path: &str, parent: Option<ProcLink>) -> SysResult<ProcLink> {
        let image = self.load_image(path)?;
        let (handle, mut p) = match self.procs.allocate_process(&*self.machine, &*self.mem) {
            Ok(v) => v,
            Err(e) => {
                image.space.release(&*self.mem);
                return Err(e);
            }
        };
        if let Some(blank) = p.space.replace(image.space) {
            blank.release(&*self.mem);
        }
        p.ustack_base = image.ustack_base;
        p.parent = parent;
        p.name = String::from(path);
        p.files = FdTable::with_stdio();

        let started = p.allocate_thread(image.entry, &*self.mem).and_then(|tid| {
            let space = p.space.as_ref().ok_or(SysError::StaleHandle)?;
            let thread = &p.threads[tid];
            let sp = push_argv(space, &*self.mem, thread.ustack, &[])?;
            let mut tf = read_trapframe(&*self.mem, thread.trapframe);
            tf.rsp = sp;
            tf.rsi = sp;
            write_trapframe(&*self.mem, thread.trapframe, &tf);
            Ok(tid)
        });
        match started {
            Ok(tid) => {
                let link = p.link();
                drop(p);
                self.push_ready(ThreadRef { proc: handle, tid });
                Ok(link)
            }
            Err(e) => {
                self.reclaim(&mut p);
                Err(e)
            }
        }
    }

    /// Ends the calling process: every thread stops, `code` is kept for the
    /// parent, children move to init, and a parent sleeping in `wait` for
    /// this process is woken. The caller must `sched` afterwards.
    pub fn exit_current(&self, code: i32) -> SysResult<()> {
        let cur = self.current()?;
        let root = self.root.get().copied();
        if root.map(|r| r.handle) == Some(cur.proc) {
            panic!("init exiting with code {}", code);
        }

        let _guard = self.wait_lock.lock();
        let (pid, parent) = {
            let mut p = self.procs.lock(cur.proc)?;
            for t in p.threads.iter_mut() {
                if t.state != ThreadState::Unused {
                    t.state = ThreadState::Exited;
                }
                t.waiting = None;
            }
            p.threads[cur.tid].exit_code = code;
            p.exit_code = code;
            p.state = ProcessState::Zombie;
            (p.pid, p.parent)
        };
        log::info!("exit: pid {} code {}", pid, code);

        if let Some(root) = root {
            self.reparent_children(cur.proc, root);
        }
        if let Some(parent) = parent {
            self.wake_waiter(parent.handle, pid);
        }
        Ok(())
    }

    /// `exit_current` followed by the final switch away.
    /// Ends the current process after it faulted in user mode.
    pub fn fault_current(&self, rip: u64, code: u64) -> SysResult<()> {
        log::warn!("user fault at {:#x} (error code {:#x}), killing process", rip, code);
        self.exit_current(FAULT_EXIT_CODE)
    }

    pub fn exit(&self, code: i32) -> ! {
        if let Err(e) = self.exit_current(code) {
            panic!("exit: {}", e);
        }
        self.sched();
        panic!("exit: dead thread rescheduled");
    }

    fn reparent_children(&self, dying: ProcHandle, root: ProcLink) {
        let mut adopted_zombie = None;
        for slot in 0..self.procs.capacity() {
            if slot == dying.slot {
                continue;
            }
            let mut p = self.procs.slot(slot).lock();
            if p.is_child_of(dying) {
                p.parent = Some(root);
                if p.state == ProcessState::Zombie {
                    adopted_zombie = Some(p.pid);
                }
            }
        }
        if let Some(pid) = adopted_zombie {
            self.wake_waiter(root.handle, pid);
        }
    }

    /// Wakes the first thread of `parent` sleeping in a wait that `pid`
    /// satisfies. Called with `wait_lock` held.
    fn wake_waiter(&self, parent: ProcHandle, pid: usize) {
        let Ok(mut p) = self.procs.lock(parent) else { return };
        let Some(t) = p.threads.iter_mut().find(|t| {
            t.state == ThreadState::Sleeping && t.waiting.map_or(false, |w| w.matches(pid))
        }) else {
            return;
        };
        t.state = ThreadState::Runnable;
        t.waiting = None;
        let woken = ThreadRef { proc: parent, tid: t.tid };
        drop(p);
        self.push_ready(woken);
    }

    /// One scan of the process table for a child of `parent` to reap.
    /// Called with `wait_lock` held.
    pub fn try_reap(&self, parent: ProcHandle, target: WaitTarget) -> WaitOutcome {
        let mut found = false;
        let mut busy = false;
        for slot in 0..self.procs.capacity() {
            if slot == parent.slot {
                continue;
            }
            let mut p = self.procs.slot(slot).lock();
            if !p.is_child_of(parent) || !target.matches(p.pid) {
                continue;
            }
            found = true;
            if p.state != ProcessState::Zombie {
                continue;
            }
            if p.any_on_cpu() {
                busy = true;
                continue;
            }
            let (pid, code) = (p.pid, p.exit_code);
            self.reclaim(&mut p);
            log::info!("wait: reaped pid {} code {}", pid, code);
            return WaitOutcome::Reaped { pid, code };
        }
        match (found, busy) {
            (false, _) => WaitOutcome::NoChild,
            (true, true) => WaitOutcome::Busy,
            (true, false) => WaitOutcome::Pending,
        }
    }

    /// Sleeps until a child matching `pid` (`-1` for any) has exited, then
    /// frees it and returns its pid and exit code.
    pub fn wait(&self, pid: isize) -> SysResult<(usize, i32)> {
        let cur = self.current()?;
        let target = WaitTarget::from_pid(pid);
        loop {
            let guard = self.wait_lock.lock();
            match self.try_reap(cur.proc, target) {
                WaitOutcome::Reaped { pid, code } => return Ok((pid, code)),
                WaitOutcome::NoChild => return Err(SysError::NoChild),
                WaitOutcome::Busy => {
                    drop(guard);
                    core::hint::spin_loop();
                }
                WaitOutcome::Pending => {
                    {
                        let mut p = self.procs.lock(cur.proc)?;
                        let thread = &mut p.threads[cur.tid];
                        thread.state = ThreadState::Sleeping;
                        thread.waiting = Some(target);
                    }
                    drop(guard);
                    self.sched();
                }
            }
        }
    }
}
