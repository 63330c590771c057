//! Kernel heap
//!
//! The heap window is a run of consecutive regions, each prefixed by a
//! header carrying an allocated flag and links to the neighboring regions.
//! A region's size is the distance to the next header, so there are no size
//! fields to keep coherent. A dummy region header sits at the very top of
//! the mapped window and closes both lists into rings: the region list of
//! everything, and a second ring threading only the free regions (plus the
//! dummy, which is marked allocated so nothing ever coalesces with it).
//!
//! Allocation is first-fit over the free ring with splitting; freeing
//! coalesces with either neighbor by header surgery alone. When nothing
//! fits, the window grows by whole pages and the old dummy dissolves into
//! the tail region.
//!
//! Growth goes through [`HeapBacking`] so the allocator itself never touches
//! page tables; the kernel backing maps pages into the heap's top-level
//! slot, and tests run the allocator over a plain buffer.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

use spin::Mutex;

use crate::error::{KError, KResult};
use crate::memory::address::{assemble_addr_pml4e, KERNEL_HEAP_PML4E, PAGE_SIZE};
use crate::memory::paging;

/// All payloads are aligned to this.
pub const MALLOC_ALIGNMENT: usize = 16;

/// Initial window size mapped at boot.
const INIT_HEAP_SIZE: u64 = 1 << 20;
/// Minimum growth step.
const MIN_HEAP_EXTEND_SIZE: u64 = 1 << 20;

/// Bottom of the kernel heap window.
pub const KERNEL_HEAP_START: u64 = assemble_addr_pml4e(KERNEL_HEAP_PML4E, 0);
/// The window may not grow past the next top-level slot.
pub const KERNEL_HEAP_END_MAX: u64 = assemble_addr_pml4e(KERNEL_HEAP_PML4E + 1, 0);

/// Provides the memory behind the heap window.
pub trait HeapBacking {
    /// Make `[start, start + length)` usable; both are page-aligned.
    fn map(&mut self, start: u64, length: u64) -> KResult<()>;
}

/// Backing for the real kernel heap: map fresh kernel pages.
pub struct PageBacking;

impl HeapBacking for PageBacking {
    fn map(&mut self, start: u64, length: u64) -> KResult<()> {
        unsafe { paging::map_kernel_pages(start, length, true, false) }
    }
}

/// Header of every region. Size is implicit: `next - self - header`.
#[repr(C, align(16))]
struct Region {
    allocated: bool,
    prev: *mut Region,
    next: *mut Region,
}

/// A free region's header is extended with the free-ring links.
#[repr(C, align(16))]
struct FreeRegion {
    header: Region,
    prev_free: *mut FreeRegion,
    next_free: *mut FreeRegion,
}

const HEADER_SIZE: usize = core::mem::size_of::<Region>();
const FREE_HEADER_SIZE: usize = core::mem::size_of::<FreeRegion>();
/// Smallest payload that can later hold the free-ring links.
const MIN_PAYLOAD: usize = FREE_HEADER_SIZE - HEADER_SIZE;

static_assertions::const_assert_eq!(HEADER_SIZE % MALLOC_ALIGNMENT, 0);
static_assertions::const_assert_eq!(FREE_HEADER_SIZE % MALLOC_ALIGNMENT, 0);

/// The region allocator over one contiguous, growable window.
pub struct RegionHeap {
    start: u64,
    end: u64,
    end_max: u64,
    dummy: *mut FreeRegion,
}

unsafe impl Send for RegionHeap {}

impl RegionHeap {
    /// Establish a heap over `[start, min(start + INIT, end_max))`.
    ///
    /// # Safety
    ///
    /// `start` must be `MALLOC_ALIGNMENT`-aligned and the backing must hand
    /// out memory exclusively owned by this heap.
    pub unsafe fn new(
        start: u64,
        end_max: u64,
        backing: &mut dyn HeapBacking,
    ) -> KResult<RegionHeap> {
        let mut heap = RegionHeap {
            start,
            end: start,
            end_max,
            dummy: ptr::null_mut(),
        };
        heap.extend(INIT_HEAP_SIZE, backing)?;
        let first = start as *mut FreeRegion;
        let dummy = (heap.end - FREE_HEADER_SIZE as u64) as *mut FreeRegion;
        *first = FreeRegion {
            header: Region {
                allocated: false,
                prev: dummy as *mut Region,
                next: dummy as *mut Region,
            },
            prev_free: dummy,
            next_free: dummy,
        };
        *dummy = FreeRegion {
            header: Region {
                allocated: true,
                prev: first as *mut Region,
                next: first as *mut Region,
            },
            prev_free: first,
            next_free: first,
        };
        heap.dummy = dummy;
        Ok(heap)
    }

    /// Grow the window by at least `increment` bytes, in whole pages.
    fn extend(&mut self, increment: u64, backing: &mut dyn HeapBacking) -> KResult<()> {
        let increment = (increment + PAGE_SIZE - 1) / PAGE_SIZE * PAGE_SIZE;
        let new_end = self.end.checked_add(increment).ok_or(KError::NoMemory)?;
        if new_end > self.end_max {
            return Err(KError::NoMemory);
        }
        backing.map(self.end, increment)?;
        self.end = new_end;
        Ok(())
    }

    unsafe fn insert_into_region_list(region: *mut Region, prev: *mut Region) {
        (*region).next = (*prev).next;
        (*(*prev).next).prev = region;
        (*region).prev = prev;
        (*prev).next = region;
    }

    unsafe fn remove_from_region_list(region: *mut Region) {
        (*(*region).prev).next = (*region).next;
        (*(*region).next).prev = (*region).prev;
    }

    unsafe fn insert_into_free_list(&mut self, region: *mut FreeRegion) {
        (*region).next_free = (*self.dummy).next_free;
        (*(*self.dummy).next_free).prev_free = region;
        (*region).prev_free = self.dummy;
        (*self.dummy).next_free = region;
    }

    unsafe fn remove_from_free_list(region: *mut FreeRegion) {
        (*(*region).prev_free).next_free = (*region).next_free;
        (*(*region).next_free).prev_free = (*region).prev_free;
    }

    unsafe fn region_size(region: *const Region) -> usize {
        ((*region).next as usize) - (region as usize) - HEADER_SIZE
    }

    /// Carve `n` bytes out of a free region, splitting off the slack if it
    /// can hold another free region.
    unsafe fn allocate_in_region(&mut self, n: usize, region: *mut FreeRegion) -> *mut u8 {
        if Self::region_size(region as *const Region) >= n + FREE_HEADER_SIZE {
            let new_region =
                ((region as usize) + HEADER_SIZE + n) as *mut FreeRegion;
            (*new_region).header.allocated = false;
            Self::insert_into_region_list(new_region as *mut Region, region as *mut Region);
            self.insert_into_free_list(new_region);
        }
        (*region).header.allocated = true;
        Self::remove_from_free_list(region);
        (region as *mut u8).add(HEADER_SIZE)
    }

    /// First-fit allocate; grows the window when no free region fits.
    ///
    /// Returns null when `n` is zero or the window cannot grow any further.
    pub fn malloc(&mut self, n: usize, backing: &mut dyn HeapBacking) -> *mut u8 {
        if n == 0 {
            return ptr::null_mut();
        }
        let n = (n + MALLOC_ALIGNMENT - 1) / MALLOC_ALIGNMENT * MALLOC_ALIGNMENT;
        let n = n.max(MIN_PAYLOAD);
        unsafe {
            let mut region = (*self.dummy).next_free;
            while region != self.dummy {
                if Self::region_size(region as *const Region) >= n {
                    return self.allocate_in_region(n, region);
                }
                region = (*region).next_free;
            }
            // Nothing fits: grow and allocate from the enlarged tail.
            let extend_size = ((n + HEADER_SIZE) as u64).max(MIN_HEAP_EXTEND_SIZE);
            if self.extend(extend_size, backing).is_err() {
                return ptr::null_mut();
            }
            let new_dummy = (self.end - FREE_HEADER_SIZE as u64) as *mut FreeRegion;
            (*new_dummy).header.allocated = true;
            Self::insert_into_region_list(new_dummy as *mut Region, self.dummy as *mut Region);
            self.insert_into_free_list(new_dummy);
            let old_dummy = self.dummy;
            self.dummy = new_dummy;
            // The old dummy dissolves into the tail: coalesce with a free
            // predecessor, or become a free region itself.
            if !(*(*old_dummy).header.prev).allocated {
                Self::remove_from_free_list(old_dummy);
                Self::remove_from_region_list(old_dummy as *mut Region);
            } else {
                (*old_dummy).header.allocated = false;
            }
            let tail = (*self.dummy).header.prev as *mut FreeRegion;
            self.allocate_in_region(n, tail)
        }
    }

    /// Return a payload pointer to the heap, coalescing with free neighbors.
    ///
    /// # Safety
    ///
    /// `p` must have come from [`RegionHeap::malloc`] on this heap and must
    /// not be used afterwards.
    pub unsafe fn free(&mut self, p: *mut u8) {
        if p.is_null() {
            return;
        }
        let region = p.sub(HEADER_SIZE) as *mut FreeRegion;
        if !(*(*region).header.next).allocated {
            Self::remove_from_free_list((*region).header.next as *mut FreeRegion);
            Self::remove_from_region_list((*region).header.next);
        }
        if !(*(*region).header.prev).allocated {
            // The freed region disappears into its predecessor.
            Self::remove_from_region_list(region as *mut Region);
            return;
        }
        (*region).header.allocated = false;
        self.insert_into_free_list(region);
    }

    /// Allocate-copy-free resize. No in-place growth is attempted.
    ///
    /// # Safety
    ///
    /// As [`RegionHeap::free`] for `p`.
    pub unsafe fn realloc(
        &mut self,
        p: *mut u8,
        n: usize,
        backing: &mut dyn HeapBacking,
    ) -> *mut u8 {
        if p.is_null() || n == 0 {
            return ptr::null_mut();
        }
        let np = self.malloc(n, backing);
        if np.is_null() {
            return ptr::null_mut();
        }
        let old_size = Self::region_size(p.sub(HEADER_SIZE) as *const Region);
        ptr::copy_nonoverlapping(p, np, old_size.min(n));
        self.free(p);
        np
    }

    /// Walk both rings and report their state. Panics in debug builds if the
    /// structure is inconsistent; used by the allocator tests.
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            heap_size: self.end - self.start,
            regions: 0,
            free_regions: 0,
            free_bytes: 0,
        };
        unsafe {
            // Region ring, checking back links and ordering.
            let mut region = (*self.dummy).header.next;
            loop {
                debug_assert_eq!((*(*region).next).prev, region, "broken back link");
                if region != self.dummy as *mut Region {
                    debug_assert!((*region).next > region, "broken region order");
                    stats.regions += 1;
                    if !(*region).allocated {
                        stats.free_regions += 1;
                        stats.free_bytes += Self::region_size(region);
                    }
                }
                if region == self.dummy as *mut Region {
                    break;
                }
                region = (*region).next;
            }
            // Free ring: everything on it except the dummy must be free.
            let mut count = 0;
            let mut free = (*self.dummy).next_free;
            while free != self.dummy {
                debug_assert!(!(*free).header.allocated, "allocated region on free ring");
                count += 1;
                free = (*free).next_free;
            }
            debug_assert_eq!(count, stats.free_regions, "free ring out of sync");
        }
        stats
    }
}

/// Snapshot of the heap's structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub heap_size: u64,
    pub regions: usize,
    pub free_regions: usize,
    pub free_bytes: usize,
}

static KERNEL_HEAP: Mutex<Option<RegionHeap>> = Mutex::new(None);

/// Map the initial window and set up the kernel heap.
///
/// # Safety
///
/// Must run once at boot before the first allocation.
pub unsafe fn init() -> KResult<()> {
    let heap = RegionHeap::new(KERNEL_HEAP_START, KERNEL_HEAP_END_MAX, &mut PageBacking)?;
    *KERNEL_HEAP.lock() = Some(heap);
    Ok(())
}

/// Structure snapshot of the kernel heap, for diagnostics.
pub fn kernel_heap_stats() -> Option<HeapStats> {
    KERNEL_HEAP.lock().as_ref().map(|heap| heap.stats())
}

/// The global allocator: every `alloc::*` container in the kernel lands in
/// the region heap.
pub struct KernelHeap;

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > MALLOC_ALIGNMENT {
            return ptr::null_mut();
        }
        match KERNEL_HEAP.lock().as_mut() {
            Some(heap) => heap.malloc(layout.size(), &mut PageBacking),
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, p: *mut u8, _layout: Layout) {
        if let Some(heap) = KERNEL_HEAP.lock().as_mut() {
            heap.free(p);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Backing over one large host allocation; `map` only checks bounds,
    /// the memory is already there.
    struct BufBacking {
        buf: Vec<u8>,
    }

    impl BufBacking {
        fn new(size: usize) -> BufBacking {
            BufBacking {
                buf: vec![0u8; size + MALLOC_ALIGNMENT],
            }
        }

        fn start(&self) -> u64 {
            let addr = self.buf.as_ptr() as u64;
            (addr + MALLOC_ALIGNMENT as u64 - 1) / MALLOC_ALIGNMENT as u64
                * MALLOC_ALIGNMENT as u64
        }
    }

    impl HeapBacking for BufBacking {
        fn map(&mut self, start: u64, length: u64) -> KResult<()> {
            let base = self.start();
            assert!(start >= base);
            if start + length > base + self.buf.len() as u64 - MALLOC_ALIGNMENT as u64 {
                return Err(KError::NoMemory);
            }
            Ok(())
        }
    }

    fn test_heap(window: u64) -> (RegionHeap, BufBacking) {
        let mut backing = BufBacking::new(window as usize);
        let start = backing.start();
        let heap = unsafe { RegionHeap::new(start, start + window, &mut backing) }.unwrap();
        (heap, backing)
    }

    #[test]
    fn alloc_and_free_round_trip() {
        let (mut heap, mut backing) = test_heap(4 << 20);
        let initial = heap.stats();
        assert_eq!(initial.regions, 1);
        assert_eq!(initial.free_regions, 1);

        let p = heap.malloc(100, &mut backing);
        assert!(!p.is_null());
        assert_eq!(p as usize % MALLOC_ALIGNMENT, 0);
        let after_alloc = heap.stats();
        assert_eq!(after_alloc.regions, 2);
        assert_eq!(after_alloc.free_regions, 1);

        unsafe { heap.free(p) };
        let after_free = heap.stats();
        assert_eq!(after_free.regions, 1);
        assert_eq!(after_free.free_bytes, initial.free_bytes);
    }

    #[test]
    fn zero_sized_malloc_is_null() {
        let (mut heap, mut backing) = test_heap(1 << 20);
        assert!(heap.malloc(0, &mut backing).is_null());
    }

    #[test]
    fn live_allocations_never_overlap() {
        let (mut heap, mut backing) = test_heap(4 << 20);
        let sizes = [1usize, 16, 17, 64, 250, 4096, 33, 5000, 12, 1024];
        let mut live: Vec<(usize, usize)> = Vec::new();
        let mut ptrs = Vec::new();
        for (i, &size) in sizes.iter().enumerate() {
            let p = heap.malloc(size, &mut backing) as usize;
            assert!(p != 0);
            for &(q, qsize) in &live {
                assert!(p + size <= q || q + qsize <= p, "allocation {} overlaps", i);
            }
            live.push((p, size));
            ptrs.push(p);
            heap.stats();
        }
        // Free every other one, then reallocate; structure must stay sound.
        for &p in ptrs.iter().step_by(2) {
            unsafe { heap.free(p as *mut u8) };
            heap.stats();
        }
        for _ in 0..5 {
            assert!(!heap.malloc(40, &mut backing).is_null());
            heap.stats();
        }
    }

    #[test]
    fn freeing_adjacent_regions_coalesces() {
        let (mut heap, mut backing) = test_heap(4 << 20);
        let a = heap.malloc(256, &mut backing);
        let b = heap.malloc(256, &mut backing);
        let c = heap.malloc(256, &mut backing);
        assert_eq!(heap.stats().regions, 4);

        // Freeing the middle leaves three regions plus the free tail.
        unsafe { heap.free(b) };
        let mid = heap.stats();
        assert_eq!(mid.regions, 4);
        assert_eq!(mid.free_regions, 2);

        // Freeing a neighbor merges with the hole in one direction.
        unsafe { heap.free(a) };
        let merged = heap.stats();
        assert_eq!(merged.regions, 3);
        assert_eq!(merged.free_regions, 2);

        // Freeing the last allocation collapses everything back to one.
        unsafe { heap.free(c) };
        let done = heap.stats();
        assert_eq!(done.regions, 1);
        assert_eq!(done.free_regions, 1);
    }

    #[test]
    fn realloc_preserves_contents() {
        let (mut heap, mut backing) = test_heap(4 << 20);
        let p = heap.malloc(64, &mut backing);
        unsafe {
            for i in 0..64 {
                *p.add(i) = i as u8;
            }
            let np = heap.realloc(p, 4096, &mut backing);
            assert!(!np.is_null());
            for i in 0..64 {
                assert_eq!(*np.add(i), i as u8);
            }
            // Shrinking keeps the prefix.
            let sp = heap.realloc(np, 16, &mut backing);
            for i in 0..16 {
                assert_eq!(*sp.add(i), i as u8);
            }
            heap.free(sp);
        }
        heap.stats();
    }

    #[test]
    fn exhaustion_count_matches_window() {
        // A 4 MiB window fits exactly floor(4 MiB / (1 MiB + header)) = 3
        // one-megabyte allocations before failing.
        let window: u64 = 4 << 20;
        let (mut heap, mut backing) = test_heap(window);
        let expected = (window / ((1 << 20) + HEADER_SIZE as u64)) as usize;
        let mut count = 0;
        loop {
            let p = heap.malloc(1 << 20, &mut backing);
            if p.is_null() {
                break;
            }
            count += 1;
            assert!(count <= expected + 1, "allocator never failed");
        }
        assert_eq!(count, expected);
        heap.stats();
    }

    #[test]
    fn growth_reuses_the_old_dummy() {
        let (mut heap, mut backing) = test_heap(8 << 20);
        // Exhaust the initial window, forcing an extension whose old dummy
        // must coalesce with the free tail.
        let a = heap.malloc(1 << 20, &mut backing);
        assert!(!a.is_null());
        let grown = heap.stats();
        assert!(grown.heap_size > INIT_HEAP_SIZE);
        unsafe { heap.free(a) };
        let done = heap.stats();
        assert_eq!(done.regions, 1);
        assert_eq!(done.free_regions, 1);
    }
}
