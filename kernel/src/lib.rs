//! Sable microkernel
//!
//! A small x86-64 microkernel. All inter-process communication goes through
//! reference-counted channels and message queues; every kernel object a
//! process can touch is named by a handle in its per-process handle table.
//!
//! # Architecture
//!
//! - `arch`: x86-64 specifics (control registers, TSC, APIC, context switch)
//! - `boot`: the bootloader handoff contract (memory map, video mode, image)
//! - `debug`: kernel console output and logging
//! - `memory`: page frame allocator, page tables, kernel heap, kernel stacks
//! - `ipc`: channels, messages, message queues
//! - `process`: process objects, handle tables, resources, ELF load, spawn
//! - `sched`: per-CPU scheduling, blocking, the deadline wait queue
//! - `time`: TSC timestamps and the deadline interrupt
//! - `syscall`: the syscall dispatcher
//!
//! The crate is a library; entry is [`kernel_main`], called by the boot stub
//! with interrupts disabled on the bootstrap processor.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod boot;
pub mod debug;
pub mod error;
pub mod ipc;
pub mod memory;
pub mod process;
pub mod sched;
pub mod syscall;
pub mod time;

pub use error::{KError, KResult};

use boot::BootInfo;

/// Kernel entry point.
///
/// Expects the boot stub to have loaded the kernel high, established the
/// recursive page-map slot, and collected the [`BootInfo`] tables. Brings up
/// each subsystem in dependency order and never returns; the final step hands
/// the CPU to the scheduler, which runs the spawned init process.
///
/// # Safety
///
/// Must be called exactly once, on the bootstrap processor, with interrupts
/// disabled.
pub unsafe fn kernel_main(boot_info: &'static BootInfo) -> ! {
    memory::frame::init(boot_info.memory_ranges());
    if !memory::paging::identity_mapping_init() {
        panic!("failed to establish the physical identity window");
    }
    memory::heap::init().expect("kernel heap init failed");
    memory::stack::init(boot_info.cpu_count as usize).expect("kernel stack area init failed");
    crate::kinfo!(
        "memory: {} KiB free after early init",
        memory::frame::free_count() * 4
    );

    time::init(boot_info.tsc_frequency_hz, boot_info.boot_timestamp);
    sched::percpu::init_bootstrap();

    // The bootloader's low identity mapping is only needed while the memory
    // map and boot image are being consumed.
    let image = boot_info.initial_image();
    memory::paging::remove_identity_mapping();

    process::spawn::spawn_init(image).expect("failed to spawn the init process");
    crate::kinfo!("init process spawned, entering scheduler");
    sched::idle_loop();
}

#[cfg(not(test))]
mod runtime {
    /// All kernel allocations go through the region heap.
    #[global_allocator]
    static HEAP: crate::memory::heap::KernelHeap = crate::memory::heap::KernelHeap;

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        crate::kprintln!("kernel panic: {}", info);
        loop {
            crate::arch::halt();
        }
    }
}
