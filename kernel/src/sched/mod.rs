//! Scheduler
//!
//! One current process and one FIFO run queue per CPU, cooperative and
//! preemptive switching, and the blocking primitive every IPC suspension
//! point is built on.
//!
//! The lost-wakeup problem is handled in two layers:
//!
//! - the lock passed to [`block_current`] is released only *after* the
//!   blocker's context is saved, on the next context, so a waker that finds
//!   the registration can always wake a fully-saved process;
//! - a waker that catches the process before it finished blocking (possible
//!   for wait-queue expiry, whose registration precedes the block) sets
//!   `wake_pending`, which [`block_current`] consumes to abort the block.
//!
//! A process picked off a run queue is claimed with a state CAS; stale
//! entries from aborted blocks simply fail the claim and are dropped.

pub mod percpu;
pub mod wait;

use core::sync::atomic::Ordering;

use spin::{Mutex, MutexGuard};

use crate::arch;
use crate::arch::x86_64::apic;
use crate::arch::x86_64::context::{switch_context, CpuContext};
use crate::process::{Process, ProcessKind, ProcessState};
use crate::time;

pub use percpu::{cpu_local, PerCpu};

/// The process currently executing on this CPU.
#[inline]
pub fn current() -> *mut Process {
    cpu_local().current_process
}

/// Make a blocked process runnable and place it on a CPU's run queue,
/// preferring an idle CPU and kicking it with a wakeup IPI.
///
/// Safe against every wakeup race: a process that has not finished blocking
/// gets its `wake_pending` flag set instead, and a process that is already
/// runnable or dead is left alone.
///
/// # Safety
///
/// `process` must point to a live process.
pub unsafe fn enqueue(process: *mut Process) {
    loop {
        let state = (*process).load_state();
        match state {
            ProcessState::Blocked => {
                if (*process)
                    .state
                    .compare_exchange(
                        ProcessState::Blocked as u8,
                        ProcessState::Runnable as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_err()
                {
                    continue;
                }
                match percpu::idle_list_pop() {
                    Some(idle_cpu) => {
                        (*idle_cpu).run_queue.lock().push(process);
                        apic::send_wakeup_ipi((*idle_cpu).lapic_id);
                    }
                    None => {
                        cpu_local().run_queue.lock().push(process);
                    }
                }
                return;
            }
            ProcessState::Running => {
                // Still on its way into the block; tell it to turn back.
                (*process).wake_pending.store(true, Ordering::Release);
                return;
            }
            ProcessState::Runnable | ProcessState::Zombie => return,
        }
    }
}

/// Pop the next claimable process from this CPU's run queue.
///
/// Entries whose state CAS fails are stale wakeups and are discarded.
unsafe fn pick_next(cpu: &mut PerCpu) -> Option<*mut Process> {
    loop {
        let process = cpu.run_queue.lock().pop()?;
        if (*process)
            .state
            .compare_exchange(
                ProcessState::Runnable as u8,
                ProcessState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            return Some(process);
        }
    }
}

/// Housekeeping on the first instructions of a freshly resumed context:
/// release the blocker's lock, retire the previous process.
pub fn finish_switch() {
    let cpu = cpu_local();
    let prev = cpu.prev_process;
    cpu.prev_process = core::ptr::null_mut();
    if !prev.is_null() {
        unsafe {
            let was_zombie = (*prev).load_state() == ProcessState::Zombie;
            (*prev).on_cpu.store(false, Ordering::Release);
            if was_zombie {
                Process::destroy(prev);
            }
        }
    }
    run_pending_unlock(cpu);
}

fn run_pending_unlock(cpu: &mut PerCpu) {
    if let Some((unlock, lock)) = cpu.pending_unlock.take() {
        unsafe { unlock(lock) };
    }
}

unsafe fn unlock_thunk<T>(lock: *const ()) {
    (*(lock as *const Mutex<T>)).force_unlock();
}

/// Charge the outgoing process for its slice and start a fresh one.
unsafe fn account_switch(cpu: &mut PerCpu, outgoing: *mut Process) {
    let now = arch::rdtsc();
    if !outgoing.is_null() {
        let slice = time::tsc_delta_to_ticks(now.saturating_sub(cpu.timeslice_start));
        (*outgoing).cpu_time.fetch_add(slice, Ordering::Relaxed);
    }
    cpu.timeslice_start = now;
}

/// Switch away from the current process, which has already been put in its
/// target state (blocked, runnable-and-queued, or zombie). Runs the idle
/// context when no process is claimable.
unsafe fn switch_away(cpu: &mut PerCpu) {
    let old = cpu.current_process;
    let next = pick_next(cpu);
    account_switch(cpu, old);
    match next {
        Some(next) if next == old => {
            // Requeued and immediately re-picked: nothing to switch.
            cpu.prev_process = core::ptr::null_mut();
            run_pending_unlock(cpu);
        }
        Some(next) => {
            // Wait out a CPU that is still saving this context.
            while (*next).on_cpu.load(Ordering::Acquire) {
                core::hint::spin_loop();
            }
            (*next).on_cpu.store(true, Ordering::Release);
            cpu.current_process = next;
            cpu.prev_process = old;
            if (*next).address_space.as_u64() != arch::read_cr3() {
                arch::write_cr3((*next).address_space.as_u64());
            }
            switch_context(&mut (*old).context, &(*next).context);
            finish_switch();
        }
        None => {
            cpu.current_process = core::ptr::null_mut();
            cpu.prev_process = old;
            let idle = &cpu.idle_context as *const CpuContext;
            switch_context(&mut (*old).context, idle);
            finish_switch();
        }
    }
}

/// Block the current process and atomically release the lock behind
/// `guard`; `lock` must be the mutex the guard came from.
///
/// The caller must have registered itself with whatever structure will wake
/// it *before* calling, under this same lock. Returns when something calls
/// [`enqueue`] on this process; the caller re-checks its condition.
#[cfg(not(test))]
pub fn block_current<T>(lock: &Mutex<T>, guard: MutexGuard<'_, T>) {
    let cpu = cpu_local();
    let current = cpu.current_process;
    unsafe {
        (*current)
            .state
            .store(ProcessState::Blocked as u8, Ordering::Release);
        core::mem::forget(guard);
        cpu.pending_unlock = Some((unlock_thunk::<T>, lock as *const Mutex<T> as *const ()));
        if (*current).wake_pending.swap(false, Ordering::AcqRel) {
            // A waker beat us to it; undo the block on the spot.
            (*current)
                .state
                .store(ProcessState::Running as u8, Ordering::Release);
            run_pending_unlock(cpu);
            return;
        }
        switch_away(cpu);
    }
}

/// Host tests must never reach a real block; the IPC tests only exercise
/// non-blocking paths.
#[cfg(test)]
pub fn block_current<T>(_lock: &Mutex<T>, _guard: MutexGuard<'_, T>) {
    panic!("block_current reached in a host test");
}

/// Give up the CPU voluntarily, staying runnable.
pub fn yield_current() {
    let cpu = cpu_local();
    let current = cpu.current_process;
    if current.is_null() {
        return;
    }
    unsafe {
        (*current)
            .state
            .store(ProcessState::Runnable as u8, Ordering::Release);
        cpu.run_queue.lock().push(current);
        switch_away(cpu);
    }
}

/// Preempt the current process at end of timeslice. Called from the timer
/// interrupt with preemption not disabled.
pub fn preempt() {
    yield_current();
}

/// Terminate the current process. The next context reaps it.
pub fn exit_current() -> ! {
    let cpu = cpu_local();
    let current = cpu.current_process;
    unsafe {
        (*current)
            .state
            .store(ProcessState::Zombie as u8, Ordering::Release);
        switch_away(cpu);
    }
    unreachable!("a zombie was rescheduled");
}

/// Disable preemption on this CPU. Pairs with [`preempt_enable`].
pub fn preempt_disable() {
    cpu_local().preempt_disable += 1;
}

/// Re-enable preemption, servicing a preemption that arrived while it was
/// disabled.
pub fn preempt_enable() {
    let cpu = cpu_local();
    cpu.preempt_disable -= 1;
    if cpu.preempt_disable == 0 && cpu.preempt_delayed {
        cpu.preempt_delayed = false;
        wait::delayed_timer_interrupt();
    }
}

/// First instructions of every user process: leave the scheduler's shadow,
/// then drop to ring 3.
pub extern "C" fn user_entry_thunk() -> ! {
    finish_switch();
    let current = current();
    unsafe {
        let (entry, stack_top) = match &(*current).kind {
            ProcessKind::User { entry, stack_top } => (*entry, *stack_top),
            ProcessKind::Kernel { .. } => {
                unreachable!("kernel thread entered the user thunk")
            }
        };
        time::start_timeslice();
        crate::arch::x86_64::context::enter_user(entry, stack_top)
    }
}

/// First instructions of every kernel service thread.
pub extern "C" fn kernel_entry_thunk() -> ! {
    finish_switch();
    let current = current();
    unsafe {
        let entry = match &(*current).kind {
            ProcessKind::Kernel { entry } => *entry,
            ProcessKind::User { .. } => {
                unreachable!("user process entered the kernel thunk")
            }
        };
        entry()
    }
}

/// The per-CPU idle loop. Enters the scheduler whenever work appears;
/// otherwise parks the CPU until the next interrupt.
pub fn idle_loop() -> ! {
    let cpu = cpu_local();
    loop {
        unsafe {
            if let Some(next) = pick_next(cpu) {
                cpu.idle = false;
                while (*next).on_cpu.load(Ordering::Acquire) {
                    core::hint::spin_loop();
                }
                (*next).on_cpu.store(true, Ordering::Release);
                cpu.current_process = next;
                cpu.prev_process = core::ptr::null_mut();
                cpu.timeslice_start = arch::rdtsc();
                if (*next).address_space.as_u64() != arch::read_cr3() {
                    arch::write_cr3((*next).address_space.as_u64());
                }
                let idle = &mut cpu.idle_context as *mut CpuContext;
                switch_context(idle, &(*next).context);
                // Back from a switch-to-idle: retire whatever ran last.
                finish_switch();
            } else {
                cpu.idle = true;
                percpu::idle_list_push(cpu as *mut PerCpu);
                arch::interrupts_enable();
                arch::halt();
                arch::interrupts_disable();
            }
        }
    }
}
