use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::{Mutex, Once};

use crate::config::{MAX_CPUS, NPROC};
use crate::fs::FileSystem;
use crate::hal::Machine;
use crate::loader::Loader;
use crate::memory::PhysMemory;
use crate::scheduler::registry::ProcessTable;
use crate::scheduler::task::{ProcLink, ProcessState};
use crate::scheduler::{Processor, ReadyQueue};

/// Collaborators handed to the kernel once at boot.
pub struct KernelDeps {
    pub machine: Arc<dyn Machine>,
    pub mem: Arc<dyn PhysMemory>,
    pub fs: Arc<dyn FileSystem>,
    pub loader: Arc<dyn Loader>,
}

/// All process-management state.
///
/// Lock order: `wait_lock`, then process slots, then the ready queue. A
/// processor lock is never held together with any other lock.
pub struct Kernel {
    pub machine: Arc<dyn Machine>,
    pub mem: Arc<dyn PhysMemory>,
    pub fs: Arc<dyn FileSystem>,
    pub loader: Arc<dyn Loader>,
    pub procs: ProcessTable,
    pub ready: Mutex<ReadyQueue>,
    pub cpus: Box<[Mutex<Processor>]>,
    /// Serializes exit against wait so a wakeup cannot slip in between a
    /// parent's scan and its going to sleep.
    pub wait_lock: Mutex<()>,
    /// The init process; orphans are handed to it.
    pub root: Once<ProcLink>,
}

impl Kernel {
    pub fn new(deps: KernelDeps) -> Self {
        Self::with_capacity(deps, NPROC)
    }

    /// A kernel whose process table holds `nproc` slots.
    pub fn with_capacity(deps: KernelDeps, nproc: usize) -> Self {
        Kernel {
            machine: deps.machine,
            mem: deps.mem,
            fs: deps.fs,
            loader: deps.loader,
            procs: ProcessTable::new(nproc),
            ready: Mutex::new(ReadyQueue::new()),
            cpus: (0..MAX_CPUS).map(|_| Mutex::new(Processor::new())).collect(),
            wait_lock: Mutex::new(()),
            root: Once::new(),
        }
    }

    /// One line per live process, for the console `ps`.
    pub fn list_tasks(&self) -> Vec<TaskSnapshot> {
        (0..self.procs.capacity())
            .filter_map(|slot| {
                let p = self.procs.slot(slot).lock();
                (p.state != ProcessState::Unused).then(|| TaskSnapshot {
                    pid: p.pid,
                    name: p.name.clone(),
                    state: p.state,
                    threads: p.live_threads(),
                    priority: p.priority,
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSnapshot {
    pub pid: usize,
    pub name: String,
    pub state: ProcessState,
    pub threads: usize,
    pub priority: i64,
}

static KERNEL: Once<Kernel> = Once::new();

/// Builds the global kernel. Later calls return the first instance.
pub fn init(deps: KernelDeps) -> &'static Kernel {
    let k = KERNEL.call_once(|| Kernel::new(deps));
    log::info!("Process core initialized ({} slots, {} cpus).", NPROC, MAX_CPUS);
    k
}

/// The global kernel. Trap and thread entry code only run after `init`.
pub fn kernel() -> &'static Kernel {
    match KERNEL.get() {
        Some(k) => k,
        None => panic!("kernel used before init"),
    }
}
