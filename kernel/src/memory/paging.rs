//! Virtual memory manager
//!
//! All page-table access goes through the recursive slot, so an entry at any
//! level of any address is one pointer dereference away. The identity window
//! (one top-level slot mapping the first 512 GiB of physical memory with
//! 2 MiB pages) exists for the few places that must touch memory by physical
//! address: zeroing fresh frames, building a new address space, and tearing
//! one down.
//!
//! The kernel half of every address space is shared: kernel entries are
//! global, and new top-level tables copy the kernel half of the current one.

use crate::arch;
use crate::error::{KError, KResult};
use crate::memory::address::*;
use crate::memory::frame;

/// Bits that must match for an existing leaf mapping to be considered the
/// same mapping.
const LEAF_FLAG_MASK: u64 = (PageFlags::PRESENT.bits())
    | (PageFlags::WRITE.bits())
    | (PageFlags::USER.bits())
    | (PageFlags::GLOBAL.bits())
    | (PageFlags::NX.bits());

/// Compose leaf entry bits for a fresh frame.
fn leaf_flags(user: bool, global: bool, write: bool, execute: bool) -> u64 {
    let mut flags = PageFlags::PRESENT;
    if !execute {
        flags |= PageFlags::NX;
    }
    if global {
        flags |= PageFlags::GLOBAL;
    }
    if user {
        flags |= PageFlags::USER;
    }
    if write {
        flags |= PageFlags::WRITE;
    }
    flags.bits()
}

/// If the entry is empty, fill it with a newly allocated frame.
///
/// `clear` zeroes the new frame through its recursive contents address and
/// must be set for page-table pages.
///
/// # Safety
///
/// `entry` must be the recursive address of a page-map entry in the current
/// address space.
unsafe fn ensure_entry_filled(
    entry: *mut u64,
    user: bool,
    global: bool,
    write: bool,
    execute: bool,
    clear: bool,
) -> KResult<()> {
    if *entry & PageFlags::PRESENT.bits() == 0 {
        let page = frame::alloc().ok_or(KError::NoMemory)?;
        *entry = (page.as_u64() & ENTRY_ADDR_MASK) | leaf_flags(user, global, write, execute);
        if clear {
            core::ptr::write_bytes(entry_contents_ptr(entry), 0, PAGE_SIZE as usize);
        }
    }
    Ok(())
}

/// Map the page containing `addr`, allocating intermediate tables and the
/// backing frame as needed.
///
/// An existing mapping with the same permission bits is left alone; one with
/// different bits fails with `PageAlreadyMapped`. Intermediate tables
/// allocated before a failure are kept; they are harmless and will be reused.
///
/// # Safety
///
/// Operates on the current address space through the recursive slot.
pub unsafe fn map_page(
    addr: u64,
    user: bool,
    global: bool,
    write: bool,
    execute: bool,
) -> KResult<()> {
    // Intermediate tables are writable and executable; the leaf bits decide.
    ensure_entry_filled(pml4e_ptr(addr), user, global, true, true, true)?;
    ensure_entry_filled(pdpte_ptr(addr), user, global, true, true, true)?;
    ensure_entry_filled(pde_ptr(addr), user, global, true, true, true)?;

    let pte = pte_ptr(addr);
    if *pte & PageFlags::PRESENT.bits() != 0 {
        let wanted = leaf_flags(user, global, write, execute);
        if *pte & LEAF_FLAG_MASK != wanted {
            return Err(KError::PageAlreadyMapped);
        }
        return Ok(());
    }
    ensure_entry_filled(pte, user, global, write, execute, false)
}

/// Map every page spanning `[start, start + length)`.
///
/// # Safety
///
/// As [`map_page`].
pub unsafe fn map_pages(
    start: u64,
    length: u64,
    user: bool,
    global: bool,
    write: bool,
    execute: bool,
) -> KResult<()> {
    let end = start.checked_add(length).ok_or(KError::InvalidArg)?;
    let mut page = page_align_down(start);
    let end_page = page_align_up(end);
    while page < end_page {
        map_page(page, user, global, write, execute)?;
        page += PAGE_SIZE;
    }
    Ok(())
}

/// Map kernel memory: global, supervisor-only.
///
/// # Safety
///
/// As [`map_page`]; `start` must be in the kernel half.
pub unsafe fn map_kernel_pages(start: u64, length: u64, write: bool, execute: bool) -> KResult<()> {
    map_pages(start, length, false, true, write, execute)
}

/// Map user memory in the current address space: per-process, user-visible.
///
/// # Safety
///
/// As [`map_page`]; `start` must be in the user half.
pub unsafe fn map_user_pages(start: u64, length: u64, write: bool, execute: bool) -> KResult<()> {
    map_pages(start, length, true, false, write, execute)
}

/// Build the identity window over the first 512 GiB of physical memory,
/// using 2 MiB pages marked global and no-execute.
///
/// Returns false if the required page-table frames are not available.
///
/// # Safety
///
/// Must run once at boot, after [`frame::init`].
pub unsafe fn identity_mapping_init() -> bool {
    let base = assemble_addr_pml4e(IDENTITY_PML4E, 0);
    let Some(pml4e_page) = frame::alloc() else {
        return false;
    };
    *pml4e_ptr(base) =
        (pml4e_page.as_u64() & ENTRY_ADDR_MASK) | (PageFlags::WRITE | PageFlags::PRESENT).bits();
    core::ptr::write_bytes(entry_contents_ptr(pml4e_ptr(base)), 0, PAGE_SIZE as usize);
    for i in 0..ENTRIES_PER_TABLE {
        let region = assemble_addr_pdpte(IDENTITY_PML4E, i, 0);
        let Some(pdpte_page) = frame::alloc() else {
            return false;
        };
        *pdpte_ptr(region) = (pdpte_page.as_u64() & ENTRY_ADDR_MASK)
            | (PageFlags::WRITE | PageFlags::PRESENT).bits();
        core::ptr::write_bytes(entry_contents_ptr(pdpte_ptr(region)), 0, PAGE_SIZE as usize);
        for j in 0..ENTRIES_PER_TABLE {
            let phys = i * PD_SPAN + j * PT_SPAN;
            *pde_ptr(assemble_addr_pde(IDENTITY_PML4E, i, j, 0)) = phys
                | (PageFlags::NX
                    | PageFlags::GLOBAL
                    | PageFlags::LARGE
                    | PageFlags::WRITE
                    | PageFlags::PRESENT)
                    .bits();
        }
    }
    true
}

/// Drop the bootloader's identity mapping of low memory (top-level slot 0)
/// once nothing reads low addresses anymore.
///
/// # Safety
///
/// No live pointer may reference the low identity mapping after this.
pub unsafe fn remove_identity_mapping() {
    *pml4e_ptr(0) = 0;
    arch::reload_cr3();
}

/// Check that a user-supplied buffer lies entirely below the user/kernel
/// split and does not wrap.
///
/// Does not check that pages are mapped: a fault on access is the process's
/// own and kills it.
pub fn verify_user_buffer(start: u64, length: u64) -> KResult<()> {
    let end = start.checked_add(length).ok_or(KError::InvalidAddress)?;
    if end > USER_ADDR_UPPER_BOUND {
        return Err(KError::InvalidAddress);
    }
    Ok(())
}

/// Create a new address space: fresh top-level table with the kernel half
/// copied from the current one and its recursive slot wired to itself.
///
/// Returns the physical address of the new top-level table.
pub fn address_space_create() -> KResult<PhysAddr> {
    let pml4_page = frame::alloc_clear().ok_or(KError::NoMemory)?;
    unsafe {
        let new_table = phys_to_identity(pml4_page.as_u64()) as *mut u64;
        let current_table = pml4e_ptr(0);
        // Kernel half: shared global mappings.
        for i in (ENTRIES_PER_TABLE / 2)..ENTRIES_PER_TABLE {
            *new_table.add(i as usize) = *current_table.add(i as usize);
        }
        *new_table.add(RECURSIVE_PML4E as usize) =
            (pml4_page.as_u64() & ENTRY_ADDR_MASK) | (PageFlags::WRITE | PageFlags::PRESENT).bits();
    }
    Ok(pml4_page)
}

/// Free every user-half frame and page table of an address space, then the
/// top-level table itself.
///
/// # Safety
///
/// The address space must not be active on any CPU and must never be
/// switched to again.
pub unsafe fn address_space_destroy(pml4: PhysAddr) {
    let pml4_table = phys_to_identity(pml4.as_u64()) as *const u64;
    for i in 0..(ENTRIES_PER_TABLE / 2) as usize {
        let pml4e = *pml4_table.add(i);
        if pml4e & PageFlags::PRESENT.bits() == 0 {
            continue;
        }
        let pdpt = phys_to_identity(pml4e & ENTRY_ADDR_MASK) as *const u64;
        for j in 0..ENTRIES_PER_TABLE as usize {
            let pdpte = *pdpt.add(j);
            if pdpte & PageFlags::PRESENT.bits() == 0 {
                continue;
            }
            let pd = phys_to_identity(pdpte & ENTRY_ADDR_MASK) as *const u64;
            for k in 0..ENTRIES_PER_TABLE as usize {
                let pde = *pd.add(k);
                if pde & PageFlags::PRESENT.bits() == 0 {
                    continue;
                }
                let pt = phys_to_identity(pde & ENTRY_ADDR_MASK) as *const u64;
                for l in 0..ENTRIES_PER_TABLE as usize {
                    let pte = *pt.add(l);
                    if pte & PageFlags::PRESENT.bits() != 0 {
                        frame::free(PhysAddr::new(pte & ENTRY_ADDR_MASK));
                    }
                }
                frame::free(PhysAddr::new(pde & ENTRY_ADDR_MASK));
            }
            frame::free(PhysAddr::new(pdpte & ENTRY_ADDR_MASK));
        }
        frame::free(PhysAddr::new(pml4e & ENTRY_ADDR_MASK));
    }
    frame::free(pml4);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_flag_composition() {
        let rw = leaf_flags(false, true, true, false);
        assert_ne!(rw & PageFlags::NX.bits(), 0);
        assert_ne!(rw & PageFlags::GLOBAL.bits(), 0);
        assert_ne!(rw & PageFlags::WRITE.bits(), 0);
        assert_eq!(rw & PageFlags::USER.bits(), 0);

        let user_exec = leaf_flags(true, false, false, true);
        assert_eq!(user_exec & PageFlags::NX.bits(), 0);
        assert_ne!(user_exec & PageFlags::USER.bits(), 0);
        assert_eq!(user_exec & PageFlags::WRITE.bits(), 0);
    }

    #[test]
    fn user_buffer_bounds() {
        assert!(verify_user_buffer(0, 0x1000).is_ok());
        assert!(verify_user_buffer(USER_ADDR_UPPER_BOUND - 0x1000, 0x1000).is_ok());
        assert_eq!(
            verify_user_buffer(USER_ADDR_UPPER_BOUND - 0xFFF, 0x1000),
            Err(KError::InvalidAddress)
        );
        assert_eq!(
            verify_user_buffer(u64::MAX, 2),
            Err(KError::InvalidAddress)
        );
        // Zero-length buffers at the boundary are fine.
        assert!(verify_user_buffer(USER_ADDR_UPPER_BOUND, 0).is_ok());
    }
}
