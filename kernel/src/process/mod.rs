//! Processes
//!
//! A process owns an address space, a kernel stack, a handle table and a
//! resource namespace. Scheduling state lives directly in the process
//! structure as intrusive links: the run-queue link and the wait-queue links
//! are guarded by their queues' locks, never by a process lock.
//!
//! Kernel service threads are processes too; they share the boot address
//! space and never drop to ring 3.

pub mod elf;
pub mod handle;
pub mod resource;
pub mod spawn;

use alloc::boxed::Box;
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};

use spin::Mutex;

use crate::arch::x86_64::context::CpuContext;
use crate::error::KResult;
use crate::memory::{stack, PhysAddr};

pub use handle::{Handle, HandleTable};
pub use resource::{Resource, ResourceMap};

/// Run states. Stored as an `AtomicU8` in the process.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running = 0,
    Runnable = 1,
    Blocked = 2,
    Zombie = 3,
}

impl ProcessState {
    pub fn from_raw(raw: u8) -> ProcessState {
        match raw {
            0 => ProcessState::Running,
            1 => ProcessState::Runnable,
            2 => ProcessState::Blocked,
            _ => ProcessState::Zombie,
        }
    }
}

/// What the process executes once its kernel context first runs.
pub enum ProcessKind {
    /// Drops to ring 3 at `entry` with `stack_top`.
    User { entry: u64, stack_top: u64 },
    /// Stays in the kernel, running a service loop.
    Kernel { entry: fn() -> ! },
}

pub struct Process {
    /// Saved kernel stack pointer while not running.
    pub context: CpuContext,
    pub state: AtomicU8,
    /// Set by a waker that caught the process before it finished blocking.
    pub wake_pending: AtomicBool,
    /// True from just before a CPU switches into this process until just
    /// after it has switched away; guards against running a stale context.
    pub on_cpu: AtomicBool,
    /// Set by wait-queue expiry so the woken blocker can tell timeout from
    /// delivery.
    pub timed_out: AtomicBool,

    /// Physical address of the top-level page table.
    pub address_space: PhysAddr,
    /// Whether this process owns its address space (kernel threads share
    /// the boot one).
    pub owns_address_space: bool,
    /// One past the top of the kernel stack.
    pub kernel_stack_top: u64,
    pub kind: ProcessKind,

    pub handles: Mutex<HandleTable>,
    pub resources: ResourceMap,

    // Run-queue link, guarded by the owning run queue's lock.
    pub run_next: *mut Process,

    // Wait-queue state, guarded by the wait queue lock.
    pub wait_next: *mut Process,
    pub wait_prev: *mut Process,
    pub in_wait_queue: bool,
    /// The deadline interrupt of some CPU is armed for this entry.
    pub timeout_scheduled: bool,
    /// Absolute deadline while in the wait queue.
    pub timeout: i64,

    /// Accumulated CPU time in ticks.
    pub cpu_time: AtomicI64,
}

unsafe impl Send for Process {}
unsafe impl Sync for Process {}

impl Process {
    fn new(
        address_space: PhysAddr,
        owns_address_space: bool,
        kind: ProcessKind,
        resources: ResourceMap,
        entry_thunk: u64,
    ) -> KResult<*mut Process> {
        let kernel_stack_top = stack::alloc()?;
        // Born blocked; the creator's enqueue performs the first wakeup.
        let mut process = Box::new(Process {
            context: CpuContext::new(),
            state: AtomicU8::new(ProcessState::Blocked as u8),
            wake_pending: AtomicBool::new(false),
            on_cpu: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
            address_space,
            owns_address_space,
            kernel_stack_top,
            kind,
            handles: Mutex::new(HandleTable::new()),
            resources,
            run_next: core::ptr::null_mut(),
            wait_next: core::ptr::null_mut(),
            wait_prev: core::ptr::null_mut(),
            in_wait_queue: false,
            timeout_scheduled: false,
            timeout: 0,
            cpu_time: AtomicI64::new(0),
        });
        unsafe { process.context.prepare(kernel_stack_top, entry_thunk) };
        Ok(Box::into_raw(process))
    }

    /// Create a user process, runnable but not yet enqueued.
    pub fn new_user(
        address_space: PhysAddr,
        entry: u64,
        stack_top: u64,
        resources: ResourceMap,
    ) -> KResult<*mut Process> {
        Process::new(
            address_space,
            true,
            ProcessKind::User { entry, stack_top },
            resources,
            crate::sched::user_entry_thunk as usize as u64,
        )
    }

    /// Create a kernel service thread in the boot address space.
    pub fn new_kernel(entry: fn() -> !, resources: ResourceMap) -> KResult<*mut Process> {
        Process::new(
            PhysAddr::new(crate::arch::read_cr3()),
            false,
            ProcessKind::Kernel { entry },
            resources,
            crate::sched::kernel_entry_thunk as usize as u64,
        )
    }

    #[inline]
    pub fn load_state(&self) -> ProcessState {
        ProcessState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Free everything a zombie still holds.
    ///
    /// # Safety
    ///
    /// The process must be off-CPU for good: no run-queue or wait-queue
    /// membership, no registration as a blocked receiver anywhere.
    pub unsafe fn destroy(process: *mut Process) {
        let process = Box::from_raw(process);
        if process.owns_address_space {
            crate::memory::paging::address_space_destroy(process.address_space);
        }
        stack::free(process.kernel_stack_top);
        // Handle table and resource map drop with the box, releasing their
        // capabilities.
    }
}

/// A process block with no kernel stack or address space behind it, for
/// exercising the intrusive queues on the host.
#[cfg(test)]
pub(crate) fn test_process() -> Box<Process> {
    fn never() -> ! {
        unreachable!("test processes never run");
    }
    Box::new(Process {
        context: CpuContext::new(),
        state: AtomicU8::new(ProcessState::Blocked as u8),
        wake_pending: AtomicBool::new(false),
        on_cpu: AtomicBool::new(false),
        timed_out: AtomicBool::new(false),
        address_space: PhysAddr::new(0),
        owns_address_space: false,
        kernel_stack_top: 0,
        kind: ProcessKind::Kernel { entry: never },
        handles: Mutex::new(HandleTable::new()),
        resources: ResourceMap::empty(),
        run_next: core::ptr::null_mut(),
        wait_next: core::ptr::null_mut(),
        wait_prev: core::ptr::null_mut(),
        in_wait_queue: false,
        timeout_scheduled: false,
        timeout: 0,
        cpu_time: AtomicI64::new(0),
    })
}
