//! Local APIC access
//!
//! Only the operations the scheduler and timer need: end-of-interrupt, the
//! TSC-deadline timer, and the wakeup IPI used to rouse idle CPUs. APIC
//! discovery and mode setup belong to the boot stub.

use crate::memory::address::phys_to_identity;

/// Local APIC MMIO base (xAPIC default).
const LAPIC_BASE: u64 = 0xFEE0_0000;

const REG_EOI: u64 = 0xB0;
const REG_ICR_LOW: u64 = 0x300;
const REG_ICR_HIGH: u64 = 0x310;

/// IA32_TSC_DEADLINE MSR.
const MSR_TSC_DEADLINE: u32 = 0x6E0;

/// Interrupt vector used for cross-CPU wakeups.
pub const WAKEUP_VECTOR: u8 = 0xF0;

#[inline]
fn reg_ptr(offset: u64) -> *mut u32 {
    phys_to_identity(LAPIC_BASE + offset) as *mut u32
}

/// Signal end-of-interrupt for the in-service interrupt.
pub fn eoi() {
    #[cfg(not(test))]
    unsafe {
        reg_ptr(REG_EOI).write_volatile(0);
    }
}

/// Send the wakeup IPI to the CPU with the given LAPIC ID.
pub fn send_wakeup_ipi(lapic_id: u32) {
    #[cfg(not(test))]
    unsafe {
        reg_ptr(REG_ICR_HIGH).write_volatile(lapic_id << 24);
        reg_ptr(REG_ICR_LOW).write_volatile(WAKEUP_VECTOR as u32);
    }
    #[cfg(test)]
    let _ = lapic_id;
}

/// Arm the one-shot deadline timer to fire when the TSC reaches `tsc`.
pub fn arm_tsc_deadline(tsc: u64) {
    unsafe { super::write_msr(MSR_TSC_DEADLINE, tsc) }
}

/// Disarm the deadline timer.
pub fn disarm_tsc_deadline() {
    unsafe { super::write_msr(MSR_TSC_DEADLINE, 0) }
}
