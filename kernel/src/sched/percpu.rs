//! Per-CPU state
//!
//! Each CPU owns one `PerCpu` block, reached through the GS segment base so
//! no lock is ever needed for it. The first field holds the block's own
//! address; `cpu_local()` reads it with a single GS-relative load.
//!
//! Cross-CPU access happens in exactly two places: pushes onto the idle-CPU
//! list and pushes onto another CPU's run queue, both behind locks.

use core::ptr;

use spin::Mutex;

use crate::arch::x86_64::context::CpuContext;
use crate::process::Process;

/// A CPU's private scheduling state.
#[repr(C)]
pub struct PerCpu {
    /// The block's own address; read via GS to find the block.
    pub self_ptr: *mut PerCpu,
    /// Currently running process, or null while idle.
    pub current_process: *mut Process,
    /// Saved context of this CPU's idle loop.
    pub idle_context: CpuContext,
    /// Set while the CPU sits in the idle loop waiting for work.
    pub idle: bool,
    /// LAPIC ID, used to address wakeup IPIs.
    pub lapic_id: u32,
    /// Nesting depth of preemption-disabled sections.
    pub preempt_disable: u64,
    /// A preemption arrived while disabled and is still owed.
    pub preempt_delayed: bool,
    /// TSC value when the current timeslice began.
    pub timeslice_start: u64,
    /// TSC value at which the current timeslice expires.
    pub timeslice_timeout: u64,
    pub timeslice_interrupt_enabled: bool,
    /// Currently armed TSC deadline; zero when disarmed.
    pub tsc_deadline: u64,
    /// Wait-queue entry whose deadline this CPU's timer is armed for.
    pub waiting_process: *mut Process,
    /// Link in the global idle-CPU list.
    pub next_idle_cpu: *mut PerCpu,

    /// This CPU's run queue.
    pub run_queue: Mutex<RunQueue>,

    /// Lock handed to `block_current`, released on the next context.
    pub pending_unlock: Option<(unsafe fn(*const ()), *const ())>,
    /// Process we just switched away from; its `on_cpu` flag is cleared by
    /// the next context.
    pub prev_process: *mut Process,
}

unsafe impl Send for PerCpu {}
unsafe impl Sync for PerCpu {}

impl PerCpu {
    pub const fn new() -> PerCpu {
        PerCpu {
            self_ptr: ptr::null_mut(),
            current_process: ptr::null_mut(),
            idle_context: CpuContext::new(),
            idle: false,
            lapic_id: 0,
            preempt_disable: 0,
            preempt_delayed: false,
            timeslice_start: 0,
            timeslice_timeout: 0,
            timeslice_interrupt_enabled: false,
            tsc_deadline: 0,
            waiting_process: ptr::null_mut(),
            next_idle_cpu: ptr::null_mut(),
            run_queue: Mutex::new(RunQueue::new()),
            pending_unlock: None,
            prev_process: ptr::null_mut(),
        }
    }
}

/// Intrusive FIFO of runnable processes, linked through `Process::run_next`.
pub struct RunQueue {
    head: *mut Process,
    tail: *mut Process,
}

unsafe impl Send for RunQueue {}

impl RunQueue {
    pub const fn new() -> RunQueue {
        RunQueue {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
        }
    }

    /// Append a process.
    ///
    /// # Safety
    ///
    /// `process` must not currently be linked into any run queue.
    pub unsafe fn push(&mut self, process: *mut Process) {
        (*process).run_next = ptr::null_mut();
        if self.tail.is_null() {
            self.head = process;
        } else {
            (*self.tail).run_next = process;
        }
        self.tail = process;
    }

    /// Pop the oldest entry.
    pub fn pop(&mut self) -> Option<*mut Process> {
        if self.head.is_null() {
            return None;
        }
        let process = self.head;
        unsafe {
            self.head = (*process).run_next;
        }
        if self.head.is_null() {
            self.tail = ptr::null_mut();
        }
        Some(process)
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }
}

/// List of CPUs with nothing to run, consumed by `enqueue` to spread load.
static IDLE_CPUS: Mutex<IdleList> = Mutex::new(IdleList {
    head: ptr::null_mut(),
});

struct IdleList {
    head: *mut PerCpu,
}

unsafe impl Send for IdleList {}

/// Announce this CPU as idle.
pub fn idle_list_push(cpu: *mut PerCpu) {
    let mut list = IDLE_CPUS.lock();
    unsafe {
        (*cpu).next_idle_cpu = list.head;
    }
    list.head = cpu;
}

/// Claim an idle CPU, if any.
pub fn idle_list_pop() -> Option<*mut PerCpu> {
    let mut list = IDLE_CPUS.lock();
    if list.head.is_null() {
        return None;
    }
    let cpu = list.head;
    unsafe {
        list.head = (*cpu).next_idle_cpu;
    }
    Some(cpu)
}

#[cfg(not(test))]
mod access {
    use super::PerCpu;

    /// IA32_GS_BASE.
    const MSR_GS_BASE: u32 = 0xC000_0101;

    /// The bootstrap processor's block. Application processors allocate
    /// theirs during AP bring-up.
    static mut BOOT_CPU: PerCpu = PerCpu::new();

    /// Point GS at the bootstrap processor's per-CPU block. Called once on
    /// the BSP during boot.
    pub fn init_bootstrap() {
        unsafe {
            let cpu = core::ptr::addr_of_mut!(BOOT_CPU);
            (*cpu).self_ptr = cpu;
            crate::arch::write_msr(MSR_GS_BASE, cpu as u64);
        }
    }

    /// This CPU's block.
    #[inline]
    pub fn cpu_local() -> &'static mut PerCpu {
        unsafe {
            let cpu: *mut PerCpu;
            core::arch::asm!(
                "mov {}, qword ptr gs:[0]",
                out(reg) cpu,
                options(nostack, readonly)
            );
            &mut *cpu
        }
    }
}

#[cfg(test)]
mod access {
    use super::PerCpu;

    pub fn init_bootstrap() {}

    /// Host tests get one leaked block per thread.
    pub fn cpu_local() -> &'static mut PerCpu {
        use std::cell::Cell;
        thread_local! {
            static CPU: Cell<*mut PerCpu> = const { Cell::new(core::ptr::null_mut()) };
        }
        CPU.with(|cell| {
            if cell.get().is_null() {
                let cpu = Box::into_raw(Box::new(PerCpu::new()));
                unsafe { (*cpu).self_ptr = cpu };
                cell.set(cpu);
            }
            unsafe { &mut *cell.get() }
        })
    }
}

pub use access::{cpu_local, init_bootstrap};
