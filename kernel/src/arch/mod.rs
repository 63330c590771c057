//! Architecture support
//!
//! Everything the portable kernel needs from the CPU: control registers, TLB
//! maintenance, the timestamp counter, the local APIC, and context switching.
//! Only x86-64 is implemented.

pub mod x86_64;

pub use x86_64::{
    debug_putc, halt, interrupts_disable, interrupts_enable, invlpg, read_cr3, reload_cr3,
    write_cr3,
};
pub use x86_64::{rdtsc, read_msr, write_msr};
