//! Single-core PC: COM1 console, TSC clock, `int 0x80` syscalls.

mod gdt;
mod trap;

use alloc::boxed::Box;
use alloc::sync::Arc;
use x86_64::instructions::port::Port;
use x86_64::instructions::tlb;
use x86_64::registers::control::Cr3;
use x86_64::structures::paging::PhysFrame;
use x86_64::VirtAddr;

use super::Machine;
use crate::fs::FileSystem;
use crate::kernel::{self, KernelDeps};
use crate::loader::elf::ElfLoader;
use crate::memory::frame_allocator::FramePool;
use crate::memory::paging::{PageMapper, X86PageTable};
use crate::memory::{heap, PhysAddr, PhysMemory};
use crate::scheduler::context::{switch_context, Context};
use crate::scheduler::trapframe::TrapFrame;
use crate::serial::{self, SERIAL1};

/// What the boot stub knows about the machine.
pub struct BootInfo {
    /// Virtual address at which all physical memory is mapped. Must lie in
    /// the upper half so every user page table shares it.
    pub phys_offset: u64,
    pub heap_start: usize,
    pub heap_size: usize,
    /// Physical range handed to the frame allocator.
    pub frames_start: u64,
    pub frames_end: u64,
    pub tsc_per_us: u64,
}

pub struct Pc {
    phys_offset: VirtAddr,
    tsc_per_us: u64,
    boot_tsc: u64,
}

fn rdtsc() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// Masks every line on both legacy PICs; nothing here is interrupt driven.
fn mask_pics() {
    unsafe {
        Port::<u8>::new(0x21).write(0xff);
        Port::<u8>::new(0xA1).write(0xff);
    }
}

impl Pc {
    pub fn new(phys_offset: VirtAddr, tsc_per_us: u64) -> Self {
        Pc { phys_offset, tsc_per_us: tsc_per_us.max(1), boot_tsc: rdtsc() }
    }
}

impl Machine for Pc {
    fn cpu_id(&self) -> usize {
        0
    }

    fn uptime_us(&self) -> u64 {
        (rdtsc() - self.boot_tsc) / self.tsc_per_us
    }

    fn park(&self) {
        // Without device interrupts nothing would wake a halted core.
        core::hint::spin_loop();
    }

    fn console_write(&self, bytes: &[u8]) {
        let mut port = SERIAL1.lock();
        for &b in bytes {
            port.send(b);
        }
    }

    fn console_getc(&self) -> Option<u8> {
        SERIAL1.lock().receive()
    }

    unsafe fn switch(&self, old: *mut Context, new: *const Context) {
        x86_64::instructions::interrupts::without_interrupts(|| switch_context(old, new));
    }

    fn activate(&self, root: PhysAddr) {
        let (current, flags) = Cr3::read();
        if current.start_address() == root {
            return;
        }
        unsafe { Cr3::write(PhysFrame::containing_address(root), flags) };
    }

    fn new_page_table(&self, mem: &dyn PhysMemory) -> Option<Box<dyn PageMapper>> {
        let kernel_root = Cr3::read().0.start_address();
        let table = X86PageTable::new(mem, self.phys_offset, Some(kernel_root), tlb::flush)?;
        Some(Box::new(table))
    }

    fn return_to_user(&self, tf: &TrapFrame) -> ! {
        trap::return_to_user(tf)
    }
}

/// Brings up the heap, logging, descriptor tables and the process core,
/// starts `init_path` as the first process and runs the scheduler.
///
/// # Safety
/// `info` must describe memory nobody else uses, and this may only be
/// called once, on the boot core, with interrupts disabled.
pub unsafe fn boot(info: &BootInfo, fs: Arc<dyn FileSystem>, init_path: &str) -> ! {
    heap::init_heap(info.heap_start, info.heap_size);
    serial::init_logger();
    gdt::init();
    trap::init();
    mask_pics();
    log::info!("AtomicOS descriptor tables loaded.");

    let phys_offset = VirtAddr::new(info.phys_offset);
    let mem = Arc::new(FramePool::new(
        PhysAddr::new(info.frames_start),
        PhysAddr::new(info.frames_end),
        phys_offset,
    ));
    log::info!("Frame pool: {} frames.", mem.free_frames());

    let k = kernel::init(KernelDeps {
        machine: Arc::new(Pc::new(phys_offset, info.tsc_per_us)),
        mem,
        fs: fs.clone(),
        loader: Arc::new(ElfLoader::new(fs)),
    });
    if let Err(e) = k.spawn_init(init_path) {
        panic!("cannot start {}: {}", init_path, e);
    }
    k.scheduler_loop()
}
