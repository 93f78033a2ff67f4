//! `int 0x80` syscall gate and the way back to ring 3.
//!
//! Convention: RAX = syscall number, RDI, RSI, RDX, R10, R8, R9 = arguments.
//! The result comes back in RAX.

use core::arch::{asm, naked_asm};

use lazy_static::lazy_static;
use x86_64::registers::control::Cr2;
use x86_64::structures::idt::InterruptDescriptorTable;
use x86_64::{PrivilegeLevel, VirtAddr};

use super::gdt;
use crate::kernel::{kernel, Kernel};
use crate::memory::PhysAddr;
use crate::scheduler::trapframe::{read_trapframe, write_trapframe, TrapFrame};

pub const SYSCALL_VECTOR: u8 = 0x80;

/// Registers as the entry stub leaves them on the kernel stack: general
/// registers in reverse push order, then the frame the CPU pushed.
#[repr(C)]
struct UserRegs {
    r15: u64,
    r14: u64,
    r13: u64,
    r12: u64,
    r11: u64,
    r10: u64,
    r9: u64,
    r8: u64,
    rbp: u64,
    rdi: u64,
    rsi: u64,
    rdx: u64,
    rcx: u64,
    rbx: u64,
    rax: u64,
    rip: u64,
    cs: u64,
    rflags: u64,
    rsp: u64,
    ss: u64,
}

impl UserRegs {
    fn from_trapframe(tf: &TrapFrame) -> Self {
        UserRegs {
            r15: tf.r15,
            r14: tf.r14,
            r13: tf.r13,
            r12: tf.r12,
            r11: tf.r11,
            r10: tf.r10,
            r9: tf.r9,
            r8: tf.r8,
            rbp: tf.rbp,
            rdi: tf.rdi,
            rsi: tf.rsi,
            rdx: tf.rdx,
            rcx: tf.rcx,
            rbx: tf.rbx,
            rax: tf.rax,
            rip: tf.rip,
            cs: gdt::user_code_selector().0 as u64,
            rflags: tf.rflags,
            rsp: tf.rsp,
            ss: gdt::user_data_selector().0 as u64,
        }
    }

    fn save(&self, tf: &mut TrapFrame) {
        tf.r15 = self.r15;
        tf.r14 = self.r14;
        tf.r13 = self.r13;
        tf.r12 = self.r12;
        tf.r11 = self.r11;
        tf.r10 = self.r10;
        tf.r9 = self.r9;
        tf.r8 = self.r8;
        tf.rbp = self.rbp;
        tf.rdi = self.rdi;
        tf.rsi = self.rsi;
        tf.rdx = self.rdx;
        tf.rcx = self.rcx;
        tf.rbx = self.rbx;
        tf.rax = self.rax;
        tf.rip = self.rip;
        tf.rflags = self.rflags;
        tf.rsp = self.rsp;
    }
}

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        unsafe {
            idt.double_fault
                .set_handler_addr(VirtAddr::new(double_fault_entry as usize as u64))
                .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
            idt.page_fault.set_handler_addr(VirtAddr::new(fault_entry as usize as u64));
            idt.general_protection_fault
                .set_handler_addr(VirtAddr::new(fault_entry as usize as u64));
            idt[SYSCALL_VECTOR]
                .set_handler_addr(VirtAddr::new(syscall_entry as usize as u64))
                .set_privilege_level(PrivilegeLevel::Ring3);
        }
        idt
    };
}

pub fn init() {
    IDT.load();
}

#[unsafe(naked)]
extern "C" fn syscall_entry() {
    naked_asm!(
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        // 5 CPU words + 15 pushes keep the 16-byte alignment the CPU set up.
        "mov rdi, rsp",
        "call {handler}",
        "jmp {restore}",
        handler = sym syscall_trap,
        restore = sym restore_user,
    );
}

#[unsafe(naked)]
extern "C" fn restore_user() {
    naked_asm!(
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "iretq",
    );
}

#[unsafe(naked)]
extern "C" fn fault_entry() {
    naked_asm!(
        "mov rdi, rsp",
        "and rsp, -16",
        "call {handler}",
        "ud2",
        handler = sym fault_trap,
    );
}

extern "C" fn fault_trap(frame: *const u64) -> ! {
    // Every vector routed here pushes an error code first.
    let (code, rip, cs) = unsafe { (*frame, *frame.add(1), *frame.add(2)) };
    if cs & 3 != PrivilegeLevel::Ring3 as u64 {
        panic!("EXCEPTION at {:#x}: error code {:#x}, CR2 {:?}", rip, code, Cr2::read());
    }
    log::warn!("user fault, CR2 {:?}", Cr2::read());
    let k = kernel();
    if let Err(e) = k.fault_current(rip, code) {
        panic!("user fault without a process: {}", e);
    }
    k.sched();
    panic!("faulted thread rescheduled");
}

/// Runs on its own IST stack, so it never tries to switch away.
#[unsafe(naked)]
extern "C" fn double_fault_entry() {
    naked_asm!(
        "mov rdi, rsp",
        "and rsp, -16",
        "call {handler}",
        "ud2",
        handler = sym double_fault_trap,
    );
}

extern "C" fn double_fault_trap(frame: *const u64) -> ! {
    let rip = unsafe { *frame.add(1) };
    panic!("DOUBLE FAULT at {:#x}, CR2 {:?}", rip, Cr2::read());
}

fn current_trapframe(k: &Kernel) -> Option<PhysAddr> {
    let t = k.current().ok()?;
    let p = k.procs.lock(t.proc).ok()?;
    Some(p.threads[t.tid].trapframe)
}

extern "C" fn syscall_trap(regs: &mut UserRegs) {
    let k = kernel();
    let Some(pa) = current_trapframe(k) else {
        panic!("syscall trap without a current thread");
    };
    let mut tf = read_trapframe(&*k.mem, pa);
    regs.save(&mut tf);
    write_trapframe(&*k.mem, pa, &tf);

    k.handle_syscall();

    // exec moves the trapframe, and a blocking call may have resumed on a
    // different stack pointer in the TSS.
    let Some(pa) = current_trapframe(k) else {
        panic!("thread lost during syscall");
    };
    let tf = read_trapframe(&*k.mem, pa);
    *regs = UserRegs::from_trapframe(&tf);
    gdt::set_kernel_stack(tf.kernel_rsp);
}

/// Enters ring 3 with the registers in `tf`.
pub fn return_to_user(tf: &TrapFrame) -> ! {
    gdt::set_kernel_stack(tf.kernel_rsp);
    let regs = UserRegs::from_trapframe(tf);
    unsafe {
        asm!(
            "mov rsp, {regs}",
            "jmp {restore}",
            regs = in(reg) &regs as *const UserRegs,
            restore = sym restore_user,
            options(noreturn),
        )
    }
}
