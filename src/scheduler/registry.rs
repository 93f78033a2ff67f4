use alloc::boxed::Box;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::{Mutex, MutexGuard};

use super::context::Context;
use super::task::{KernelStack, ProcHandle, Process, ProcessState, ThreadState};
use super::thread_entry;
use super::trapframe::{read_trapframe, trapframe_va, write_trapframe, TrapFrame};
use crate::config::{NTHREAD, PAGE_SIZE, USER_STACK_SIZE};
use crate::error::{SysError, SysResult};
use crate::fs::fd::FdTable;
use crate::hal::Machine;
use crate::memory::address_space::AddressSpace;
use crate::memory::paging::MapPermission;
use crate::memory::{PhysAddr, PhysMemory};

/// Full scans `allocate_process` makes while other cores hold slot locks.
const ALLOC_SCAN_PASSES: usize = 4;

/// Fixed arena of process slots.
pub struct ProcessTable {
    slots: Box<[Mutex<Process>]>,
    next_pid: AtomicUsize,
}

impl ProcessTable {
    pub fn new(capacity: usize) -> Self {
        ProcessTable {
            slots: (0..capacity).map(|i| Mutex::new(Process::new(i))).collect(),
            next_pid: AtomicUsize::new(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Raw slot access for table scans. Callers check the state themselves.
    pub fn slot(&self, index: usize) -> &Mutex<Process> {
        &self.slots[index]
    }

    /// Locks the process behind `h`, failing if the slot was freed or reused.
    pub fn lock(&self, h: ProcHandle) -> SysResult<MutexGuard<'_, Process>> {
        let p = self.slots.get(h.slot).ok_or(SysError::StaleHandle)?.lock();
        if p.generation != h.generation || p.state == ProcessState::Unused {
            return Err(SysError::StaleHandle);
        }
        Ok(p)
    }

    /// Handle of the live process with this pid.
    pub fn find(&self, pid: usize) -> Option<ProcHandle> {
        self.slots.iter().find_map(|slot| {
            let p = slot.lock();
            (p.state != ProcessState::Unused && p.pid == pid).then(|| p.handle())
        })
    }

    /// Claims an unused slot, gives it a fresh page table and pid, and
    /// returns it still locked so the caller can finish setting it up.
    ///
    /// Slots locked by someone else are skipped, so this may be called while
    /// holding another process's lock. A scan that skipped a slot is repeated
    /// a few times before the table is reported full.
    pub fn allocate_process(
        &self,
        machine: &dyn Machine,
        mem: &dyn PhysMemory,
    ) -> SysResult<(ProcHandle, MutexGuard<'_, Process>)> {
        for _ in 0..ALLOC_SCAN_PASSES {
            let mut skipped = false;
            for slot in self.slots.iter() {
                let Some(p) = slot.try_lock() else {
                    skipped = true;
                    continue;
                };
                if p.state == ProcessState::Unused {
                    return self.claim(p, machine, mem);
                }
            }
            if !skipped {
                break;
            }
            machine.park();
        }
        log::warn!("allocate_process: process table full");
        Err(SysError::NoProcessSlot)
    }

    fn claim<'a>(
        &self,
        mut p: MutexGuard<'a, Process>,
        machine: &dyn Machine,
        mem: &dyn PhysMemory,
    ) -> SysResult<(ProcHandle, MutexGuard<'a, Process>)> {
        let table = machine.new_page_table(mem).ok_or_else(|| {
            log::warn!("allocate_process: no memory for a page table");
            SysError::NoMemory
        })?;
        p.space = Some(AddressSpace::new(table));
        p.files = FdTable::new();
        p.generation = p.generation.wrapping_add(1);
        p.pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        p.state = ProcessState::Used;
        p.parent = None;
        p.exit_code = 0;
        p.ustack_base = 0;
        p.priority = crate::config::DEFAULT_PRIORITY;
        p.stats = Default::default();
        p.stats.start_ms = machine.uptime_us() / 1000;
        Ok((p.handle(), p))
    }
}

/// Lowest address of thread `tid`'s user stack, above its guard page.
pub fn ustack_bottom(ustack_base: u64, tid: usize) -> u64 {
    ustack_base + (tid * (USER_STACK_SIZE + PAGE_SIZE) + PAGE_SIZE) as u64
}

/// Maps the user stack and trapframe page of thread `tid`, returning the
/// stack top and the trapframe frame. Nothing stays mapped on failure.
pub fn map_thread_pages(
    space: &mut AddressSpace,
    ustack_base: u64,
    tid: usize,
    mem: &dyn PhysMemory,
) -> SysResult<(u64, PhysAddr)> {
    let bottom = ustack_bottom(ustack_base, tid);
    let npages = USER_STACK_SIZE / PAGE_SIZE;
    space.map_region(bottom, npages, MapPermission::R | MapPermission::W | MapPermission::U, mem)?;
    match space.map_page(trapframe_va(tid), MapPermission::R | MapPermission::W, mem) {
        Ok(tf) => Ok((bottom + USER_STACK_SIZE as u64, tf)),
        Err(e) => {
            space.unmap_region(bottom, npages, mem)?;
            Err(e)
        }
    }
}

/// Drops whatever a previous occupant of slot `tid` left mapped.
fn unmap_thread_pages(space: &mut AddressSpace, ustack_base: u64, tid: usize, mem: &dyn PhysMemory) {
    let bottom = ustack_bottom(ustack_base, tid);
    for i in 0..USER_STACK_SIZE / PAGE_SIZE {
        let va = bottom + (i * PAGE_SIZE) as u64;
        if space.is_mapped(va) {
            if let Err(e) = space.unmap_region(va, 1, mem) {
                log::warn!("stale user stack page {:#x} of thread {}: {}", va, tid, e);
            }
        }
    }
    if space.is_mapped(trapframe_va(tid)) {
        if let Err(e) = space.unmap_region(trapframe_va(tid), 1, mem) {
            log::warn!("stale trapframe of thread {}: {}", tid, e);
        }
    }
}

impl Process {
    /// Finds a free thread slot and prepares a thread in it that enters user
    /// mode at `entry`. Returns the thread id.
    pub fn allocate_thread(&mut self, entry: u64, mem: &dyn PhysMemory) -> SysResult<usize> {
        let tid = self
            .threads
            .iter()
            .position(|t| matches!(t.state, ThreadState::Unused | ThreadState::Exited) && !t.on_cpu)
            .ok_or(SysError::NoThreadSlot)?;
        let base = self.ustack_base;
        let space = self.space.as_mut().ok_or(SysError::StaleHandle)?;
        unmap_thread_pages(space, base, tid, mem);
        self.install_thread(tid, entry, true, mem)?;
        Ok(tid)
    }

    /// Makes slot `tid` runnable.
    ///
    /// With `alloc_user_res` the user stack and trapframe page are mapped and
    /// a fresh trapframe starting at `entry` is written. Without it they must
    /// already exist (copied by fork) and only the kernel fields are updated.
    pub fn install_thread(
        &mut self,
        tid: usize,
        entry: u64,
        alloc_user_res: bool,
        mem: &dyn PhysMemory,
    ) -> SysResult<()> {
        if tid >= NTHREAD {
            return Err(SysError::NoThreadSlot);
        }
        let base = self.ustack_base;
        let space = self.space.as_mut().ok_or(SysError::StaleHandle)?;
        let thread = &mut self.threads[tid];
        let kstack_top = thread.kstack.get_or_insert_with(KernelStack::new).top();

        if alloc_user_res {
            let (ustack_top, tf_pa) = map_thread_pages(space, base, tid, mem)?;
            write_trapframe(mem, tf_pa, &TrapFrame::init_user(entry, ustack_top, kstack_top));
            thread.ustack = ustack_top;
            thread.trapframe = tf_pa;
        } else {
            let (tf_pa, _) = space.translate(trapframe_va(tid)).ok_or(SysError::NotMapped)?;
            let mut tf = read_trapframe(mem, tf_pa);
            tf.kernel_rsp = kstack_top;
            write_trapframe(mem, tf_pa, &tf);
            thread.trapframe = tf_pa;
        }

        thread.tid = tid;
        thread.context = Context::new(thread_entry as usize as u64, kstack_top);
        thread.exit_code = 0;
        thread.waiting = None;
        thread.state = ThreadState::Runnable;
        Ok(())
    }
}
