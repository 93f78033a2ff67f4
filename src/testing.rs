//! Host-side fixtures: a physical memory window on the heap, a recording
//! machine, an in-memory file system and an ELF image builder.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use spin::Mutex;

use crate::config::{NPROC, PAGE_SIZE};
use crate::fs::error::{FsError, FsResult};
use crate::fs::{FileSystem, Inode, InodeKind, InodeStat, OpenFlags};
use crate::hal::Machine;
use crate::kernel::{Kernel, KernelDeps};
use crate::loader::elf::ElfLoader;
use crate::memory::address_space::AddressSpace;
use crate::memory::frame_allocator::FramePool;
use crate::memory::paging::{MapPermission, PageMapper, X86PageTable};
use crate::memory::{PhysAddr, PhysMemory, VirtAddr};
use crate::scheduler::context::Context;
use crate::scheduler::task::{ProcessState, ThreadRef, ThreadState, WaitTarget};
use crate::scheduler::trapframe::{read_trapframe, write_trapframe, TrapFrame};

// ── Physical memory ──────────────────────────────────────────────

#[derive(Clone, Copy)]
#[repr(C, align(4096))]
struct Page([u8; PAGE_SIZE]);

/// Physical address of the first frame in every window.
const WINDOW_BASE: u64 = 0x1000;

/// A frame pool over `frames` leaked, page-aligned heap pages.
pub fn phys_window(frames: usize) -> FramePool {
    let pages: &'static mut [Page] = Box::leak(vec![Page([0; PAGE_SIZE]); frames].into_boxed_slice());
    let offset = pages.as_mut_ptr() as u64 - WINDOW_BASE;
    let end = WINDOW_BASE + (frames * PAGE_SIZE) as u64;
    unsafe { FramePool::new(PhysAddr::new(WINDOW_BASE), PhysAddr::new(end), VirtAddr::new(offset)) }
}

fn page_table(mem: &dyn PhysMemory, phys_offset: VirtAddr) -> Option<X86PageTable> {
    X86PageTable::new(mem, phys_offset, None, |_| {})
}

pub fn empty_space(pool: &FramePool) -> AddressSpace {
    let table = page_table(pool, pool.phys_offset()).expect("pool too small for a page table");
    AddressSpace::new(Box::new(table))
}

// ── File system ──────────────────────────────────────────────────

pub struct MemInode {
    ino: u64,
    data: Mutex<Vec<u8>>,
    nlink: AtomicU32,
}

impl Inode for MemInode {
    fn stat(&self) -> InodeStat {
        InodeStat { dev: 0, ino: self.ino, kind: InodeKind::File, nlink: self.nlink.load(Ordering::SeqCst) }
    }

    fn read_at(&self, offset: usize, buf: &mut [u8]) -> FsResult<usize> {
        let data = self.data.lock();
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write_at(&self, offset: usize, bytes: &[u8]) -> FsResult<usize> {
        let mut data = self.data.lock();
        if data.len() < offset + bytes.len() {
            data.resize(offset + bytes.len(), 0);
        }
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(bytes.len())
    }
}

/// Flat name -> inode map with hard-link counting.
pub struct MemFs {
    names: Mutex<BTreeMap<String, Arc<MemInode>>>,
    next_ino: AtomicU64,
}

impl MemFs {
    pub fn new() -> Self {
        MemFs { names: Mutex::new(BTreeMap::new()), next_ino: AtomicU64::new(1) }
    }

    /// `/bin/init`, `/bin/echo` and a non-ELF `/bin/garbage`.
    pub fn with_programs() -> Self {
        let fs = Self::new();
        fs.add_file("/bin/init", &elf_image(INIT_ENTRY, &[Segment {
            vaddr: INIT_ENTRY,
            flags: 5,
            data: b"\x90\xeb\xfe",
            memsz: 3,
        }]));
        fs.add_file("/bin/echo", &elf_image(ECHO_ENTRY, &[Segment {
            vaddr: ECHO_ENTRY,
            flags: 5,
            data: b"\x90\x90\xc3",
            memsz: 0x10,
        }]));
        fs.add_file("/bin/garbage", b"not an executable");
        fs
    }

    fn new_inode(&self, bytes: &[u8]) -> Arc<MemInode> {
        Arc::new(MemInode {
            ino: self.next_ino.fetch_add(1, Ordering::SeqCst),
            data: Mutex::new(bytes.to_vec()),
            nlink: AtomicU32::new(1),
        })
    }

    pub fn add_file(&self, path: &str, bytes: &[u8]) {
        let inode = self.new_inode(bytes);
        self.names.lock().insert(String::from(path), inode);
    }
}

impl FileSystem for MemFs {
    fn open(&self, path: &str, flags: OpenFlags) -> FsResult<Arc<dyn Inode>> {
        if !path.starts_with('/') {
            return Err(FsError::InvalidPath);
        }
        let mut names = self.names.lock();
        if let Some(inode) = names.get(path) {
            if flags.contains(OpenFlags::TRUNC) {
                inode.data.lock().clear();
            }
            return Ok(inode.clone());
        }
        if !flags.contains(OpenFlags::CREATE) {
            return Err(FsError::NotFound);
        }
        let inode = self.new_inode(&[]);
        names.insert(String::from(path), inode.clone());
        Ok(inode)
    }

    fn link(&self, old_path: &str, new_path: &str) -> FsResult<()> {
        let mut names = self.names.lock();
        let inode = names.get(old_path).cloned().ok_or(FsError::NotFound)?;
        if names.contains_key(new_path) {
            return Err(FsError::AlreadyExists);
        }
        inode.nlink.fetch_add(1, Ordering::SeqCst);
        names.insert(String::from(new_path), inode);
        Ok(())
    }

    fn unlink(&self, path: &str) -> FsResult<()> {
        let inode = self.names.lock().remove(path).ok_or(FsError::NotFound)?;
        inode.nlink.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

// ── ELF images ───────────────────────────────────────────────────

pub const INIT_ENTRY: u64 = 0x40_1000;
pub const ECHO_ENTRY: u64 = 0x50_0000;

pub struct Segment<'a> {
    pub vaddr: u64,
    pub flags: u32,
    pub data: &'a [u8],
    pub memsz: u64,
}

fn put(out: &mut [u8], off: usize, bytes: &[u8]) {
    out[off..off + bytes.len()].copy_from_slice(bytes);
}

/// Minimal static ELF64 x86_64 executable with one PT_LOAD per segment.
pub fn elf_image(entry: u64, segments: &[Segment]) -> Vec<u8> {
    const EHDR: usize = 64;
    const PHDR: usize = 56;
    let mut out = vec![0u8; EHDR + PHDR * segments.len()];
    put(&mut out, 0, &[0x7F, b'E', b'L', b'F', 2, 1, 1]);
    put(&mut out, 16, &2u16.to_le_bytes());
    put(&mut out, 18, &62u16.to_le_bytes());
    put(&mut out, 20, &1u32.to_le_bytes());
    put(&mut out, 24, &entry.to_le_bytes());
    put(&mut out, 32, &(EHDR as u64).to_le_bytes());
    put(&mut out, 52, &(EHDR as u16).to_le_bytes());
    put(&mut out, 54, &(PHDR as u16).to_le_bytes());
    put(&mut out, 56, &(segments.len() as u16).to_le_bytes());

    for (i, seg) in segments.iter().enumerate() {
        let offset = out.len() as u64;
        out.extend_from_slice(seg.data);
        let ph = EHDR + i * PHDR;
        put(&mut out, ph, &1u32.to_le_bytes());
        put(&mut out, ph + 4, &seg.flags.to_le_bytes());
        put(&mut out, ph + 8, &offset.to_le_bytes());
        put(&mut out, ph + 16, &seg.vaddr.to_le_bytes());
        put(&mut out, ph + 24, &seg.vaddr.to_le_bytes());
        put(&mut out, ph + 32, &(seg.data.len() as u64).to_le_bytes());
        put(&mut out, ph + 40, &seg.memsz.to_le_bytes());
        put(&mut out, ph + 48, &(PAGE_SIZE as u64).to_le_bytes());
    }
    out
}

// ── Machine ──────────────────────────────────────────────────────

/// Records what the kernel asks of the hardware. Context switches return
/// immediately, as if the other side had switched straight back.
pub struct TestMachine {
    phys_offset: VirtAddr,
    clock_us: AtomicU64,
    switches: AtomicUsize,
    active: Mutex<Option<PhysAddr>>,
    output: Mutex<Vec<u8>>,
    input: Mutex<VecDeque<u8>>,
    parks: AtomicUsize,
    park_hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl TestMachine {
    pub fn new(phys_offset: VirtAddr) -> Self {
        TestMachine {
            phys_offset,
            clock_us: AtomicU64::new(0),
            switches: AtomicUsize::new(0),
            active: Mutex::new(None),
            output: Mutex::new(Vec::new()),
            input: Mutex::new(VecDeque::new()),
            parks: AtomicUsize::new(0),
            park_hook: Mutex::new(None),
        }
    }

    pub fn advance_us(&self, us: u64) {
        self.clock_us.fetch_add(us, Ordering::SeqCst);
    }

    pub fn switches(&self) -> usize {
        self.switches.load(Ordering::SeqCst)
    }

    pub fn active_root(&self) -> Option<PhysAddr> {
        *self.active.lock()
    }

    pub fn console_output(&self) -> Vec<u8> {
        self.output.lock().clone()
    }

    pub fn feed_console(&self, bytes: &[u8]) {
        self.input.lock().extend(bytes.iter().copied());
    }

    pub fn parks(&self) -> usize {
        self.parks.load(Ordering::SeqCst)
    }

    /// Runs `f` the next time the kernel parks the core.
    pub fn on_park(&self, f: impl FnOnce() + Send + 'static) {
        *self.park_hook.lock() = Some(Box::new(f));
    }
}

impl Machine for TestMachine {
    fn cpu_id(&self) -> usize {
        0
    }

    fn uptime_us(&self) -> u64 {
        self.clock_us.load(Ordering::SeqCst)
    }

    fn park(&self) {
        self.parks.fetch_add(1, Ordering::SeqCst);
        let hook = self.park_hook.lock().take();
        if let Some(f) = hook {
            f();
        }
    }

    fn console_write(&self, bytes: &[u8]) {
        self.output.lock().extend_from_slice(bytes);
    }

    fn console_getc(&self) -> Option<u8> {
        self.input.lock().pop_front()
    }

    unsafe fn switch(&self, _old: *mut Context, _new: *const Context) {
        self.switches.fetch_add(1, Ordering::SeqCst);
    }

    fn activate(&self, root: PhysAddr) {
        *self.active.lock() = Some(root);
    }

    fn new_page_table(&self, mem: &dyn PhysMemory) -> Option<Box<dyn PageMapper>> {
        let table = page_table(mem, self.phys_offset)?;
        Some(Box::new(table))
    }

    fn return_to_user(&self, tf: &TrapFrame) -> ! {
        panic!("return_to_user({:#x}) on the host", tf.rip)
    }
}

// ── Kernel ───────────────────────────────────────────────────────

const DEFAULT_FRAMES: usize = 256;
/// Where `scratch` maps its user buffer.
const SCRATCH: u64 = 0x2000_0000;

/// A private kernel over a fresh memory window, driven from one test.
pub struct TestKernel {
    pub k: Kernel,
    pub machine: Arc<TestMachine>,
    pub pool: Arc<FramePool>,
}

impl TestKernel {
    pub fn new() -> Self {
        Self::build(NPROC, DEFAULT_FRAMES)
    }

    pub fn with_capacity(nproc: usize) -> Self {
        Self::build(nproc, DEFAULT_FRAMES)
    }

    pub fn with_frames(frames: usize) -> Self {
        Self::build(NPROC, frames)
    }

    fn build(nproc: usize, frames: usize) -> Self {
        let pool = Arc::new(phys_window(frames));
        let machine = Arc::new(TestMachine::new(pool.phys_offset()));
        let fs = Arc::new(MemFs::with_programs());
        let k = Kernel::with_capacity(
            KernelDeps {
                machine: machine.clone(),
                mem: pool.clone(),
                fs: fs.clone(),
                loader: Arc::new(ElfLoader::new(fs)),
            },
            nproc,
        );
        TestKernel { k, machine, pool }
    }

    /// Leaks frames until only `left` remain.
    pub fn exhaust_memory(&self, left: usize) {
        while self.pool.free_frames() > left {
            self.pool.alloc_page().unwrap();
        }
    }

    /// Starts `/bin/init` and puts its thread on core 0.
    pub fn run_init(&self) -> ThreadRef {
        self.k.spawn_init("/bin/init").unwrap();
        self.k.pick_next(0).unwrap();
        self.k.current().unwrap()
    }

    /// Spawns `/bin/echo`; its thread is left on the ready queue.
    pub fn spawn_runnable(&self) -> ThreadRef {
        let pid = self.k.spawn("/bin/echo").unwrap();
        ThreadRef { proc: self.k.procs.find(pid).unwrap(), tid: 0 }
    }

    /// Makes `t` the thread running on core 0, as if the scheduler had
    /// switched to it.
    pub fn switch_to(&self, t: ThreadRef) {
        self.k.finish_switch(0);
        {
            let mut p = self.k.procs.lock(t.proc).unwrap();
            let thread = &mut p.threads[t.tid];
            thread.state = ThreadState::Running;
            thread.on_cpu = true;
        }
        self.k.cpus[0].lock().current = Some(t);
    }

    /// Puts `t` to sleep in `wait` for `target`, as `wait` itself would.
    pub fn sleep_in_wait(&self, t: ThreadRef, target: WaitTarget) {
        let mut p = self.k.procs.lock(t.proc).unwrap();
        p.threads[t.tid].state = ThreadState::Sleeping;
        p.threads[t.tid].waiting = Some(target);
    }

    pub fn thread_state(&self, t: ThreadRef) -> ThreadState {
        self.k.procs.lock(t.proc).unwrap().threads[t.tid].state
    }

    pub fn process_state(&self, t: ThreadRef) -> ProcessState {
        self.k.procs.lock(t.proc).unwrap().state
    }

    pub fn trapframe(&self, t: ThreadRef) -> TrapFrame {
        let p = self.k.procs.lock(t.proc).unwrap();
        read_trapframe(&*self.k.mem, p.threads[t.tid].trapframe)
    }

    fn update_trapframe(&self, t: ThreadRef, f: impl FnOnce(&mut TrapFrame)) {
        let p = self.k.procs.lock(t.proc).unwrap();
        let pa = p.threads[t.tid].trapframe;
        let mut tf = read_trapframe(&*self.k.mem, pa);
        f(&mut tf);
        write_trapframe(&*self.k.mem, pa, &tf);
    }

    pub fn set_return_reg(&self, t: ThreadRef, value: u64) {
        self.update_trapframe(t, |tf| tf.rax = value);
    }

    /// Traps into the kernel from `t`, which must be current on core 0.
    pub fn syscall(&self, t: ThreadRef, id: usize, args: [usize; 6]) -> isize {
        assert_eq!(self.k.current(), Ok(t), "syscall from a thread that is not running");
        self.update_trapframe(t, |tf| {
            tf.rax = id as u64;
            tf.rdi = args[0] as u64;
            tf.rsi = args[1] as u64;
            tf.rdx = args[2] as u64;
            tf.r10 = args[3] as u64;
            tf.r8 = args[4] as u64;
            tf.r9 = args[5] as u64;
        });
        self.k.handle_syscall();
        self.trapframe(t).rax as isize
    }

    // ── User memory ──

    /// An address inside `t`'s current stack.
    pub fn user_stack_addr(&self, t: ThreadRef) -> u64 {
        self.k.procs.lock(t.proc).unwrap().threads[t.tid].ustack - 64
    }

    /// Two user-writable pages in `t`'s address space.
    pub fn scratch(&self, t: ThreadRef) -> u64 {
        let mut p = self.k.procs.lock(t.proc).unwrap();
        let space = p.space.as_mut().unwrap();
        if !space.is_mapped(SCRATCH) {
            let perm = MapPermission::R | MapPermission::W | MapPermission::U;
            space.map_region(SCRATCH, 2, perm, &*self.k.mem).unwrap();
        }
        SCRATCH
    }

    pub fn write_user(&self, t: ThreadRef, va: u64, bytes: &[u8]) {
        let p = self.k.procs.lock(t.proc).unwrap();
        p.space.as_ref().unwrap().copy_out(&*self.k.mem, va, bytes).unwrap();
    }

    /// Writes `s` NUL-terminated at `va` and returns `va`.
    pub fn user_str(&self, t: ThreadRef, va: u64, s: &str) -> u64 {
        self.write_user(t, va, s.as_bytes());
        self.write_user(t, va + s.len() as u64, &[0]);
        va
    }

    pub fn read_user(&self, t: ThreadRef, va: u64, len: usize) -> Vec<u8> {
        let p = self.k.procs.lock(t.proc).unwrap();
        let mut buf = vec![0u8; len];
        p.space.as_ref().unwrap().copy_in(&*self.k.mem, &mut buf, va).unwrap();
        buf
    }

    pub fn read_user_u64(&self, t: ThreadRef, va: u64) -> u64 {
        let p = self.k.procs.lock(t.proc).unwrap();
        p.space.as_ref().unwrap().fetch_u64(&*self.k.mem, va).unwrap()
    }

    /// Reads a `repr(C)` value the kernel copied out.
    pub fn read_user_value<T: Copy>(&self, t: ThreadRef, va: u64) -> T {
        let bytes = self.read_user(t, va, core::mem::size_of::<T>());
        unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const T) }
    }
}
