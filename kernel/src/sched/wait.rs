//! The wait queue and the deadline interrupt
//!
//! One global queue of sleeping processes, doubly linked through the
//! process structure and ordered by absolute deadline. Each CPU arms its
//! one-shot TSC-deadline timer for either the earliest not-yet-claimed
//! wait-queue entry or its own timeslice end, whichever comes first;
//! reassignment is lazy, happening whenever an insert or expiry changes the
//! picture.

use spin::Mutex;

use crate::arch;
use crate::arch::x86_64::apic;
use crate::error::KResult;
use crate::process::Process;
use crate::sched;
use crate::sched::percpu::cpu_local;
use crate::time;

struct WaitQueue {
    start: *mut Process,
    end: *mut Process,
}

unsafe impl Send for WaitQueue {}

static WAIT_QUEUE: Mutex<WaitQueue> = Mutex::new(WaitQueue {
    start: core::ptr::null_mut(),
    end: core::ptr::null_mut(),
});

/// Arm this CPU's one-shot timer for the given TSC value.
fn start_interrupt_timer(tsc_deadline: u64) {
    cpu_local().tsc_deadline = tsc_deadline;
    apic::arm_tsc_deadline(tsc_deadline);
}

fn disable_interrupt_timer() {
    cpu_local().tsc_deadline = 0;
    apic::disarm_tsc_deadline();
}

/// Insert a process before the first entry with a later deadline.
///
/// Must run with the wait-queue lock held.
unsafe fn insert_locked(queue: &mut WaitQueue, process: *mut Process, deadline: i64) {
    let mut after = queue.start;
    while !after.is_null() && (*after).timeout <= deadline {
        after = (*after).wait_next;
    }
    if after.is_null() {
        // Later than everything in the queue; append.
        (*process).wait_prev = queue.end;
        (*process).wait_next = core::ptr::null_mut();
        if queue.end.is_null() {
            queue.start = process;
        } else {
            (*queue.end).wait_next = process;
        }
        queue.end = process;
    } else {
        (*process).wait_next = after;
        (*process).wait_prev = (*after).wait_prev;
        if (*after).wait_prev.is_null() {
            queue.start = process;
        } else {
            (*(*after).wait_prev).wait_next = process;
        }
        (*after).wait_prev = process;
    }
    (*process).in_wait_queue = true;
    (*process).timeout_scheduled = false;
    (*process).timeout = deadline;
}

/// Unlink a process; returns whether it was queued.
///
/// Must run with the wait-queue lock held.
unsafe fn remove_locked(queue: &mut WaitQueue, process: *mut Process) -> bool {
    if !(*process).in_wait_queue {
        return false;
    }
    if (*process).wait_prev.is_null() {
        queue.start = (*process).wait_next;
    } else {
        (*(*process).wait_prev).wait_next = (*process).wait_next;
    }
    if (*process).wait_next.is_null() {
        queue.end = (*process).wait_prev;
    } else {
        (*(*process).wait_next).wait_prev = (*process).wait_prev;
    }
    (*process).in_wait_queue = false;
    true
}

/// Re-arm this CPU's timer after the queue or the timeslice changed.
///
/// Must run with the wait-queue lock held.
unsafe fn update_interrupt_timer(queue: &mut WaitQueue) {
    let cpu = cpu_local();
    // Earliest entry no CPU has claimed yet.
    let mut first_unscheduled = core::ptr::null_mut();
    let mut p = queue.start;
    while !p.is_null() {
        if !(*p).timeout_scheduled {
            first_unscheduled = p;
            break;
        }
        p = (*p).wait_next;
    }

    if !first_unscheduled.is_null()
        && (!cpu.timeslice_interrupt_enabled
            || time::timestamp_to_tsc((*first_unscheduled).timeout) < cpu.timeslice_timeout)
        && (cpu.waiting_process.is_null()
            || (*cpu.waiting_process).timeout > (*first_unscheduled).timeout)
    {
        if !cpu.waiting_process.is_null() {
            (*cpu.waiting_process).timeout_scheduled = false;
        }
        (*first_unscheduled).timeout_scheduled = true;
        cpu.waiting_process = first_unscheduled;
        start_interrupt_timer(time::timestamp_to_tsc((*first_unscheduled).timeout));
    } else if cpu.timeslice_interrupt_enabled
        && (cpu.waiting_process.is_null()
            || time::timestamp_to_tsc((*cpu.waiting_process).timeout) > cpu.timeslice_timeout)
    {
        if !cpu.waiting_process.is_null() {
            (*cpu.waiting_process).timeout_scheduled = false;
        }
        cpu.waiting_process = core::ptr::null_mut();
        start_interrupt_timer(cpu.timeslice_timeout);
    } else if cpu.waiting_process.is_null() {
        disable_interrupt_timer();
    }
}

/// Queue the current process with an absolute deadline. The caller blocks
/// afterwards; expiry will set its `timed_out` flag and enqueue it.
///
/// # Safety
///
/// Must be followed by a block; the registration is consumed either by
/// expiry or by an explicit [`remove`].
pub unsafe fn insert_current(deadline: i64) {
    let mut queue = WAIT_QUEUE.lock();
    insert_locked(&mut queue, sched::current(), deadline);
    update_interrupt_timer(&mut queue);
}

/// Withdraw a process from the wait queue (its wakeup arrived by another
/// path). No-op if it was not queued.
///
/// # Safety
///
/// `process` must point to a live process.
pub unsafe fn remove(process: *mut Process) {
    let mut queue = WAIT_QUEUE.lock();
    remove_locked(&mut queue, process);
}

/// Sleep until an absolute deadline. Returns immediately if it has passed.
pub fn process_wait(deadline: i64) -> KResult<()> {
    if time::timestamp_to_tsc(deadline) <= arch::rdtsc() {
        return Ok(());
    }
    let mut queue = WAIT_QUEUE.lock();
    let current = sched::current();
    unsafe {
        insert_locked(&mut queue, current, deadline);
        update_interrupt_timer(&mut queue);
    }
    sched::block_current(&WAIT_QUEUE, queue);
    unsafe {
        // A plain sleep does not care how it was woken.
        (*current)
            .timed_out
            .store(false, core::sync::atomic::Ordering::Release);
    }
    Ok(())
}

/// Wake every entry whose deadline has passed.
///
/// Must run with the wait-queue lock held.
unsafe fn unblock_expired(queue: &mut WaitQueue) {
    let now = arch::rdtsc();
    while !queue.start.is_null()
        && time::timestamp_to_tsc((*queue.start).timeout) <= now
    {
        let process = queue.start;
        let next = (*process).wait_next;
        (*process)
            .timed_out
            .store(true, core::sync::atomic::Ordering::Release);
        (*process).in_wait_queue = false;
        if cpu_local().waiting_process == process {
            cpu_local().waiting_process = core::ptr::null_mut();
        }
        queue.start = next;
        if next.is_null() {
            queue.end = core::ptr::null_mut();
        } else {
            (*next).wait_prev = core::ptr::null_mut();
        }
        sched::enqueue(process);
    }
    update_interrupt_timer(queue);
}

/// Begin a timeslice ending at the given TSC value.
pub fn schedule_timeslice_interrupt(tsc_timeout: u64) {
    let mut queue = WAIT_QUEUE.lock();
    let cpu = cpu_local();
    cpu.timeslice_interrupt_enabled = true;
    cpu.timeslice_timeout = tsc_timeout;
    unsafe { update_interrupt_timer(&mut queue) };
}

/// Stop timeslice accounting (the CPU is about to idle or stay in-kernel).
pub fn cancel_timeslice_interrupt() {
    let mut queue = WAIT_QUEUE.lock();
    let cpu = cpu_local();
    cpu.timeslice_interrupt_enabled = false;
    unsafe { update_interrupt_timer(&mut queue) };
}

/// The TSC-deadline interrupt handler.
///
/// Spurious firings (the deadline was moved after the interrupt was
/// raised) are detected by re-checking the TSC against the armed deadline.
/// With preemption disabled the work is deferred to [`preempt_enable`].
pub fn timer_interrupt() {
    apic::eoi();
    let cpu = cpu_local();
    if cpu.tsc_deadline == 0 || arch::rdtsc() < cpu.tsc_deadline {
        return;
    }
    cpu.tsc_deadline = 0;
    if cpu.preempt_disable != 0 && !cpu.idle {
        cpu.preempt_delayed = true;
        return;
    }
    service_deadline();
}

/// A deadline that had to wait for preemption to be re-enabled.
pub fn delayed_timer_interrupt() {
    service_deadline();
}

fn service_deadline() {
    let mut queue = WAIT_QUEUE.lock();
    let cpu = cpu_local();
    if cpu.waiting_process.is_null() {
        // Timeslice expiry.
        drop(queue);
        if !cpu.idle {
            sched::preempt();
        }
    } else {
        unsafe { unblock_expired(&mut queue) };
        drop(queue);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::test_process;
    use alloc::boxed::Box;
    use alloc::vec::Vec;

    // The global queue is shared between tests running in parallel, so each
    // test uses its own local WaitQueue value.
    fn local_queue() -> WaitQueue {
        WaitQueue {
            start: core::ptr::null_mut(),
            end: core::ptr::null_mut(),
        }
    }

    unsafe fn deadlines(queue: &WaitQueue) -> Vec<i64> {
        let mut out = Vec::new();
        let mut p = queue.start;
        while !p.is_null() {
            out.push((*p).timeout);
            p = (*p).wait_next;
        }
        out
    }

    unsafe fn back_links_consistent(queue: &WaitQueue) -> bool {
        let mut prev: *mut Process = core::ptr::null_mut();
        let mut p = queue.start;
        while !p.is_null() {
            if (*p).wait_prev != prev {
                return false;
            }
            prev = p;
            p = (*p).wait_next;
        }
        queue.end == prev
    }

    #[test]
    fn inserts_keep_deadline_order() {
        let mut queue = local_queue();
        let processes: Vec<Box<Process>> = (0..5).map(|_| test_process()).collect();
        let order = [50i64, 10, 30, 10, 40];
        unsafe {
            for (p, &deadline) in processes.iter().zip(&order) {
                insert_locked(
                    &mut queue,
                    p.as_ref() as *const Process as *mut Process,
                    deadline,
                );
            }
            assert_eq!(deadlines(&queue), [10, 10, 30, 40, 50]);
            assert!(back_links_consistent(&queue));
        }
    }

    #[test]
    fn equal_deadlines_preserve_insertion_order() {
        let mut queue = local_queue();
        let a = test_process();
        let b = test_process();
        unsafe {
            let ap = a.as_ref() as *const Process as *mut Process;
            let bp = b.as_ref() as *const Process as *mut Process;
            insert_locked(&mut queue, ap, 7);
            insert_locked(&mut queue, bp, 7);
            // The earlier insert stays in front.
            assert_eq!(queue.start, ap);
            assert_eq!(queue.end, bp);
        }
    }

    #[test]
    fn removal_relinks_both_neighbors() {
        let mut queue = local_queue();
        let processes: Vec<Box<Process>> = (0..3).map(|_| test_process()).collect();
        unsafe {
            for (i, p) in processes.iter().enumerate() {
                insert_locked(
                    &mut queue,
                    p.as_ref() as *const Process as *mut Process,
                    (i as i64 + 1) * 10,
                );
            }
            let middle = processes[1].as_ref() as *const Process as *mut Process;
            assert!(remove_locked(&mut queue, middle));
            assert_eq!(deadlines(&queue), [10, 30]);
            assert!(back_links_consistent(&queue));
            // A second removal is a no-op.
            assert!(!remove_locked(&mut queue, middle));

            let first = processes[0].as_ref() as *const Process as *mut Process;
            assert!(remove_locked(&mut queue, first));
            let last = processes[2].as_ref() as *const Process as *mut Process;
            assert!(remove_locked(&mut queue, last));
            assert!(queue.start.is_null());
            assert!(queue.end.is_null());
        }
    }

    #[test]
    fn membership_flag_tracks_queue_state() {
        let mut queue = local_queue();
        let p = test_process();
        let ptr = p.as_ref() as *const Process as *mut Process;
        unsafe {
            assert!(!(*ptr).in_wait_queue);
            insert_locked(&mut queue, ptr, 5);
            assert!((*ptr).in_wait_queue);
            remove_locked(&mut queue, ptr);
            assert!(!(*ptr).in_wait_queue);
        }
    }
}
