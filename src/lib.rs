//! Process, thread, scheduler and syscall core of the AtomicOS kernel.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod error;
pub mod fs;
pub mod hal;
pub mod kernel;
pub mod loader;
pub mod memory;
pub mod scheduler;
pub mod serial;
pub mod syscalls;

#[cfg(test)]
mod testing;

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    log::error!("{}", info);
    loop {
        x86_64::instructions::hlt();
    }
}
