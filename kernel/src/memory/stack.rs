//! Kernel stack allocator
//!
//! Kernel stacks live in their own top-level slot, one page each, with an
//! unmapped guard page between neighbors so an overflow faults instead of
//! silently corrupting the next stack. Freed stacks form a free list
//! threaded through the first word of each stack's page.

use spin::Mutex;

use crate::error::{KError, KResult};
use crate::memory::address::{assemble_addr_pml4e, PAGE_SIZE, PDPT_SPAN, STACK_PML4E};
use crate::memory::paging;

/// Size of one kernel stack.
pub const KERNEL_STACK_SIZE: u64 = PAGE_SIZE;

struct StackArea {
    /// Start of the last stack that has memory behind it.
    last: u64,
    /// Start of the first unused allocated stack, or 0 when every allocated
    /// stack is in use. Free stacks link through their first word.
    first_free: u64,
}

static STACK_AREA: Mutex<StackArea> = Mutex::new(StackArea {
    last: 0,
    first_free: 0,
});

#[inline]
fn area_start() -> u64 {
    assemble_addr_pml4e(STACK_PML4E, 0)
}

#[inline]
fn area_end() -> u64 {
    area_start() + PDPT_SPAN
}

/// Map the bootstrap stacks for the application processors.
///
/// The BSP's initial stack is the first in the area; each further CPU gets
/// the next guarded slot, claimed by the AP startup code.
///
/// # Safety
///
/// Must run once at boot, before the APs start.
pub unsafe fn init(cpu_count: usize) -> KResult<()> {
    let mut area = STACK_AREA.lock();
    area.last = area_start();
    for i in 1..cpu_count as u64 {
        paging::map_kernel_pages(area_start() + 2 * i * PAGE_SIZE, PAGE_SIZE, true, false)?;
        area.last = area_start() + 2 * i * PAGE_SIZE;
    }
    Ok(())
}

/// Allocate a kernel stack; returns the address one past its top.
pub fn alloc() -> KResult<u64> {
    let mut area = STACK_AREA.lock();
    if area.first_free != 0 {
        let stack = area.first_free;
        area.first_free = unsafe { *(stack as *const u64) };
        return Ok(stack + KERNEL_STACK_SIZE);
    }
    // Advance by two pages so every pair of stacks is separated by an
    // unmapped guard page.
    let stack = area.last + 2 * PAGE_SIZE;
    if stack + KERNEL_STACK_SIZE > area_end() {
        return Err(KError::NoMemory);
    }
    unsafe { paging::map_kernel_pages(stack, KERNEL_STACK_SIZE, true, false)? };
    area.last = stack;
    Ok(stack + KERNEL_STACK_SIZE)
}

/// Return a stack to the free list.
///
/// # Safety
///
/// `stack_top` must have come from [`alloc`] and the stack must no longer
/// be executing.
pub unsafe fn free(stack_top: u64) {
    let stack = stack_top - KERNEL_STACK_SIZE;
    let mut area = STACK_AREA.lock();
    *(stack as *mut u64) = area.first_free;
    area.first_free = stack;
}
