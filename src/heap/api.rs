//! Public allocation operations and administrative interface.
//!
//! These are the operations a malloc-compatible shim would forward to:
//! allocation entry points route requests by size class to an arena or the
//! huge registry, and the non-standard operations expose size queries,
//! pointer classification, stats and purge control.

use crate::heap::arena::{self, Arena};
use crate::heap::arenas::{self, ArenaId};
use crate::heap::classes::{self, ARENA_MAXCLASS, BIN_MAXCLASS, CHUNKSIZE, CHUNK_HEADER_NPAGES, PAGE_2POW, PAGE_SIZE, QUANTUM, QUANTUM_2POW, SMALL_MAX, SMALL_MIN, TINY_MIN_2POW};
use crate::heap::huge;
use crate::heap::map;
use crate::heap::options;
use crate::heap::radix;
use crate::heap::stats::TOTAL_MAPPED;
use crate::heap::vm;
use crate::heap::base;
use std::ptr::NonNull;

#[cfg(unix)]
use libc::{EINVAL, ENOMEM};
#[cfg(not(unix))]
const EINVAL: i32 = 22;
#[cfg(not(unix))]
const ENOMEM: i32 = 12;

/// Classification of an address reported by [`ptr_info`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PtrTag {
    Unknown,
    LiveSmall,
    LiveLarge,
    LiveHuge,
    FreedSmall,
    FreedPageDirty,
    FreedPageDecommitted,
    FreedPageMadvised,
    FreedPageZeroed,
}

/// Where an address lives: its classification, the base address of the
/// containing allocation (or page), and that allocation's size.
#[derive(Clone, Copy, Debug)]
pub struct PtrInfo {
    pub tag: PtrTag,
    pub addr: *mut u8,
    pub size: usize,
}

/// Aggregate allocator statistics.
#[derive(Clone, Copy, Debug, Default)]
pub struct Stats {
    pub opt_junk: bool,
    pub opt_zero: bool,
    pub narenas: usize,
    pub quantum: usize,
    pub small_max: usize,
    pub large_max: usize,
    pub chunksize: usize,
    pub page_size: usize,
    pub dirty_max: usize,
    /// Mapped address space attributed to arenas, the huge registry and the
    /// metadata heap, in bytes.
    pub mapped: usize,
    /// Total mapped address space from the VM shim's gauge; additionally
    /// covers chunks parked in the recycle cache.
    pub mapped_total: usize,
    /// Live allocated bytes.
    pub allocated: usize,
    /// Committed bytes that are neither allocated nor dirty nor accounted
    /// elsewhere.
    pub waste: usize,
    /// Dirty (purgeable) bytes.
    pub page_cache: usize,
    /// Metadata bytes: base pages, run headers, chunk headers.
    pub bookkeeping: usize,
    /// Free region bytes in partially full small runs.
    pub bin_unused: usize,
}

// ---------------------------------------------------------------------------
// Internal routing
// ---------------------------------------------------------------------------

fn imalloc(size: usize, zero: bool, arena: Option<&'static Arena>) -> Option<NonNull<u8>> {
    debug_assert!(size != 0);
    if size <= ARENA_MAXCLASS {
        let arena = arena.unwrap_or_else(arenas::choose_arena);
        arena.malloc(size, zero)
    } else {
        huge::huge_malloc(size, zero)
    }
}

fn ipalloc(alignment: usize, size: usize, arena: Option<&'static Arena>) -> Option<NonNull<u8>> {
    // Round size up to the nearest multiple of alignment.  For small classes
    // every region is aligned to the smallest power of two that is nonzero in
    // the base-2 representation of its size, so the rounded size lands in a
    // class with at least the requested alignment.
    let ceil_size = classes::alignment_ceiling(size, alignment);
    if ceil_size < size {
        // usize wrap-around.
        return None;
    }

    if ceil_size <= PAGE_SIZE || (alignment <= PAGE_SIZE && ceil_size <= ARENA_MAXCLASS) {
        let arena = arena.unwrap_or_else(arenas::choose_arena);
        arena.malloc(ceil_size, false)
    } else {
        // Sub-page alignment cannot be carried through a page run, so round
        // the alignment up to whole pages for the run math.
        let alignment = classes::page_ceiling(alignment);
        let ceil_size = classes::page_ceiling(size);
        if ceil_size < size || ceil_size.checked_add(alignment).is_none() {
            return None;
        }

        // Size of the over-sized run needed to guarantee the alignment.
        let run_size = if ceil_size >= alignment {
            ceil_size + alignment - PAGE_SIZE
        } else {
            // alignment << 1 may wrap; the bogus value then fails the run
            // size check below and is never used.
            (alignment << 1).wrapping_sub(PAGE_SIZE)
        };

        if run_size <= ARENA_MAXCLASS {
            let arena = arena.unwrap_or_else(arenas::choose_arena);
            arena.palloc(alignment, ceil_size, run_size)
        } else if alignment <= CHUNKSIZE {
            huge::huge_malloc(ceil_size, false)
        } else {
            huge::huge_palloc(ceil_size, alignment, false)
        }
    }
}

/// Size of the live allocation at `ptr`; panics for unowned addresses.
fn isalloc(ptr: usize) -> usize {
    let chunk = map::chunk_base(ptr);
    if chunk != ptr {
        // A region within an arena chunk.
        arena::arena_of(chunk)
            .unwrap_or_else(|| panic!("size query for unowned pointer {ptr:#x}"))
            .salloc(ptr)
    } else {
        let size = huge::usable_size(ptr);
        assert!(size != 0, "size query for unowned pointer {ptr:#x}");
        size
    }
}

pub(crate) fn idalloc(ptr: usize) {
    debug_assert!(ptr != 0);
    let offset = map::chunk_offset(ptr);
    if offset != 0 {
        arena::arena_dalloc(ptr, offset);
    } else {
        huge::huge_dalloc(ptr);
    }
}

fn in_place_realloc(ptr: usize, size: usize, oldsize: usize) -> Option<NonNull<u8>> {
    if size < oldsize {
        options::poison_fill(ptr + size, oldsize - size);
    } else if options::options().zero && size > oldsize {
        // Safety: the tail of the region belongs to this allocation.
        unsafe { std::ptr::write_bytes((ptr + oldsize) as *mut u8, 0, size - oldsize) };
    }
    NonNull::new(ptr as *mut u8)
}

/// Resize a large allocation in place if possible.  Returns whether the
/// pointer remains valid for `size` bytes.
fn arena_ralloc_large(ptr: usize, size: usize, oldsize: usize) -> bool {
    let psize = classes::page_ceiling(size);
    if psize == oldsize {
        // Same size class.
        if size < oldsize {
            options::poison_fill(ptr + size, oldsize - size);
        }
        true
    } else {
        let chunk_base = map::chunk_base(ptr);
        let arena = arena::arena_of(chunk_base).expect("realloc of unowned pointer");
        if psize < oldsize {
            // Fill before shrinking, to avoid a window where the trailing
            // pages are reused while still unpoisoned.
            options::poison_fill(ptr + size, oldsize - size);
            arena.ralloc_shrink_large(chunk_base, ptr, psize, oldsize);
            true
        } else {
            let grown = arena.ralloc_grow_large(chunk_base, ptr, psize, oldsize);
            if grown && options::options().zero {
                // Safety: the grown tail belongs to this allocation.
                unsafe { std::ptr::write_bytes((ptr + oldsize) as *mut u8, 0, size - oldsize) };
            }
            grown
        }
    }
}

fn arena_ralloc(
    ptr: usize,
    size: usize,
    oldsize: usize,
    arena: Option<&'static Arena>,
) -> Option<NonNull<u8>> {
    // Try to avoid moving the allocation.
    if size < SMALL_MIN {
        if oldsize < SMALL_MIN
            && classes::ffs(classes::pow2_ceil(size) >> (TINY_MIN_2POW + 1))
                == classes::ffs(classes::pow2_ceil(oldsize) >> (TINY_MIN_2POW + 1))
        {
            return in_place_realloc(ptr, size, oldsize);
        }
    } else if size <= SMALL_MAX {
        if (SMALL_MIN..=SMALL_MAX).contains(&oldsize)
            && classes::quantum_ceiling(size) >> QUANTUM_2POW
                == classes::quantum_ceiling(oldsize) >> QUANTUM_2POW
        {
            return in_place_realloc(ptr, size, oldsize);
        }
    } else if size <= BIN_MAXCLASS {
        if oldsize > SMALL_MAX
            && oldsize <= BIN_MAXCLASS
            && classes::pow2_ceil(size) == classes::pow2_ceil(oldsize)
        {
            return in_place_realloc(ptr, size, oldsize);
        }
    } else if oldsize > BIN_MAXCLASS && oldsize <= ARENA_MAXCLASS {
        debug_assert!(size > BIN_MAXCLASS);
        if arena_ralloc_large(ptr, size, oldsize) {
            return NonNull::new(ptr as *mut u8);
        }
    }

    // The sizes are different enough that a move is needed.
    let arena = arena.unwrap_or_else(arenas::choose_arena);
    let ret = arena.malloc(size, false)?;
    let copysize = size.min(oldsize);
    vm::copy(ret.as_ptr() as usize, ptr, copysize);
    idalloc(ptr);
    Some(ret)
}

fn iralloc(ptr: usize, size: usize, arena: Option<&'static Arena>) -> Option<NonNull<u8>> {
    debug_assert!(ptr != 0 && size != 0);
    let oldsize = isalloc(ptr);
    if size <= ARENA_MAXCLASS {
        arena_ralloc(ptr, size, oldsize, arena)
    } else {
        huge::huge_ralloc(ptr, size, oldsize)
    }
}

// ---------------------------------------------------------------------------
// Allocation entry points
// ---------------------------------------------------------------------------

/// Allocate `size` bytes (at least 1).  Returns `None` on exhaustion.
pub fn malloc(size: usize) -> Option<NonNull<u8>> {
    arenas::ensure_init();
    let size = if size == 0 { 1 } else { size };
    imalloc(size, false, None)
}

/// Allocate a zeroed buffer for `num` elements of `size` bytes, checking for
/// overflow of the product.
pub fn calloc(num: usize, size: usize) -> Option<NonNull<u8>> {
    arenas::ensure_init();
    let num_size = match num.checked_mul(size) {
        Some(0) => 1,
        Some(n) => n,
        None => return None,
    };
    imalloc(num_size, true, None)
}

/// Resize the allocation at `ptr` to `size` bytes, preserving contents up to
/// the smaller of the two sizes.  A null `ptr` behaves like `malloc`.
///
/// # Safety
/// `ptr` must be null or a live pointer returned by this allocator, and must
/// not be used afterwards unless it is returned again.
pub unsafe fn realloc(ptr: *mut u8, size: usize) -> Option<NonNull<u8>> {
    let size = if size == 0 { 1 } else { size };
    if ptr.is_null() {
        arenas::ensure_init();
        imalloc(size, false, None)
    } else {
        iralloc(ptr as usize, size, None)
    }
}

/// Free the allocation at `ptr`.  `free(null)` is a no-op; freeing an
/// address this allocator does not own panics.
///
/// # Safety
/// `ptr` must be null or a live pointer returned by this allocator, and must
/// not be used afterwards.
pub unsafe fn free(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    idalloc(ptr as usize);
}

/// Allocate `size` bytes aligned to `alignment`, which must be a power of
/// two (values below the word size are raised to it).
pub fn memalign(alignment: usize, size: usize) -> Option<NonNull<u8>> {
    debug_assert!(alignment.is_power_of_two());
    arenas::ensure_init();
    let size = if size == 0 { 1 } else { size };
    let alignment = alignment.max(core::mem::size_of::<usize>());
    ipalloc(alignment, size, None)
}

/// POSIX-shaped aligned allocation: writes the result through `out` and
/// returns 0, or returns an errno value without touching `out`.
pub fn posix_memalign(out: &mut *mut u8, alignment: usize, size: usize) -> i32 {
    // The alignment must be a power of two and a multiple of the word size.
    if !alignment.is_power_of_two() || alignment < core::mem::size_of::<usize>() {
        return EINVAL;
    }
    match memalign(alignment, size) {
        Some(p) => {
            *out = p.as_ptr();
            0
        }
        None => ENOMEM,
    }
}

/// C11-shaped aligned allocation: `size` must be a multiple of `alignment`.
pub fn aligned_alloc(alignment: usize, size: usize) -> Option<NonNull<u8>> {
    if alignment == 0 || !alignment.is_power_of_two() || size % alignment != 0 {
        return None;
    }
    memalign(alignment, size)
}

/// Page-aligned allocation.
pub fn valloc(size: usize) -> Option<NonNull<u8>> {
    memalign(PAGE_SIZE, size)
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Usable size of the allocation at `ptr`, or 0 when the address is not a
/// live allocation of this heap.  Unlike [`realloc`], this validates the
/// address instead of assuming it.
///
/// # Safety
/// `ptr` may be any address, but if it is a live allocation it must not be
/// freed concurrently with this call.
pub unsafe fn malloc_usable_size(ptr: *const u8) -> usize {
    if !arenas::initialized() {
        return 0;
    }
    let p = ptr as usize;
    let chunk = map::chunk_base(p);
    if chunk == 0 {
        // Null, or within one chunk of null.
        return 0;
    }
    if radix::chunk_rtree().get(chunk) == 0 {
        return 0;
    }
    if chunk != p {
        match arena::arena_of(chunk) {
            Some(arena) => arena.salloc(p),
            None => 0,
        }
    } else {
        huge::usable_size(p)
    }
}

/// The size class the allocator would use for a request of `size`.
pub fn malloc_good_size(size: usize) -> usize {
    classes::good_size(size)
}

/// Classify `ptr`: live small/large/huge allocation, freed region or page,
/// or unknown.
///
/// # Safety
/// `ptr` may be any address; concurrently freed allocations may be reported
/// with stale tags.
pub unsafe fn ptr_info(ptr: *const u8) -> PtrInfo {
    const UNKNOWN: PtrInfo = PtrInfo {
        tag: PtrTag::Unknown,
        addr: std::ptr::null_mut(),
        size: 0,
    };
    if !arenas::initialized() {
        return UNKNOWN;
    }
    let p = ptr as usize;
    if map::chunk_base(p) == 0 {
        return UNKNOWN;
    }
    // Check huge allocations before the owner index: interior chunks of a
    // huge mapping are not registered there.
    if let Some((base, size)) = huge::lookup_containing(p) {
        return PtrInfo {
            tag: PtrTag::LiveHuge,
            addr: base as *mut u8,
            size,
        };
    }
    arena::ptr_info_arena(p)
}

/// Gather aggregate runtime statistics across all arenas, the huge registry
/// and the metadata heap.
pub fn stats() -> Stats {
    arenas::ensure_init();
    let opts = options::options();
    let mut st = Stats {
        opt_junk: opts.junk,
        opt_zero: opts.zero,
        quantum: QUANTUM,
        small_max: SMALL_MAX,
        large_max: ARENA_MAXCLASS,
        chunksize: CHUNKSIZE,
        page_size: PAGE_SIZE,
        dirty_max: opts.dirty_max,
        ..Default::default()
    };

    let mut non_arena_mapped = 0;
    {
        let h = huge::huge_mutex().lock().unwrap();
        non_arena_mapped += h.mapped;
        st.allocated += h.allocated;
    }
    {
        let (base_mapped, base_committed) = base::base_stats();
        non_arena_mapped += base_mapped;
        st.bookkeeping += base_committed;
    }

    let arenas_list = arenas::all_arenas();
    st.narenas = arenas_list.len();
    for arena in arenas_list {
        let (astats, ndirty, bin_unused, headers) = arena.stats_snapshot();
        let committed = astats.committed << PAGE_2POW;
        let allocated = astats.allocated_small + astats.allocated_large;
        let dirty = ndirty << PAGE_2POW;

        st.mapped += astats.mapped;
        st.allocated += allocated;
        st.page_cache += dirty;
        // Waste is committed memory that is neither live nor dirty nor
        // accounted as bin slack or headers.
        st.waste += committed - allocated - dirty - bin_unused - headers;
        st.bin_unused += bin_unused;
        st.bookkeeping += headers;
    }

    // Chunk headers count as bookkeeping rather than waste.
    let chunk_header_size = ((st.mapped / CHUNKSIZE) * CHUNK_HEADER_NPAGES) << PAGE_2POW;
    st.mapped += non_arena_mapped;
    st.bookkeeping += chunk_header_size;
    st.waste -= chunk_header_size;
    st.mapped_total = TOTAL_MAPPED.value();
    st
}

// ---------------------------------------------------------------------------
// Administrative operations
// ---------------------------------------------------------------------------

/// Bind the calling thread to a fresh arena (`true`) or to the main arena
/// (`false`).
pub fn thread_local_arena(enable: bool) {
    arenas::thread_local_arena(enable);
}

/// Create a new arena and return its id.
pub fn create_arena() -> ArenaId {
    arenas::create_arena()
}

/// Unlist an arena.  Its remaining allocations stay live; the arena just
/// stops being selectable.
pub fn dispose_arena(id: ArenaId) {
    arenas::dispose_arena(id);
}

/// `malloc` serviced by the identified arena.
pub fn arena_malloc(id: ArenaId, size: usize) -> Option<NonNull<u8>> {
    arenas::ensure_init();
    let size = if size == 0 { 1 } else { size };
    imalloc(size, false, Some(arenas::get_by_id(id)))
}

/// `calloc` serviced by the identified arena.
pub fn arena_calloc(id: ArenaId, num: usize, size: usize) -> Option<NonNull<u8>> {
    arenas::ensure_init();
    let num_size = match num.checked_mul(size) {
        Some(0) => 1,
        Some(n) => n,
        None => return None,
    };
    imalloc(num_size, true, Some(arenas::get_by_id(id)))
}

/// `realloc` with moves serviced by the identified arena.
///
/// # Safety
/// Same contract as [`realloc`].
pub unsafe fn arena_realloc(id: ArenaId, ptr: *mut u8, size: usize) -> Option<NonNull<u8>> {
    arenas::ensure_init();
    let size = if size == 0 { 1 } else { size };
    if ptr.is_null() {
        imalloc(size, false, Some(arenas::get_by_id(id)))
    } else {
        iralloc(ptr as usize, size, Some(arenas::get_by_id(id)))
    }
}

/// `memalign` serviced by the identified arena.
pub fn arena_memalign(id: ArenaId, alignment: usize, size: usize) -> Option<NonNull<u8>> {
    debug_assert!(alignment.is_power_of_two());
    arenas::ensure_init();
    let size = if size == 0 { 1 } else { size };
    let alignment = alignment.max(core::mem::size_of::<usize>());
    ipalloc(alignment, size, Some(arenas::get_by_id(id)))
}

/// Purge all dirty pages in every arena.
pub fn free_dirty_pages() {
    arenas::ensure_init();
    for arena in arenas::all_arenas() {
        arena.purge_all();
    }
}

/// Force lazily purged pages out of physical memory.  Only meaningful under
/// the lazy purge strategy; a no-op elsewhere.
pub fn purge_freed_pages() {
    arenas::ensure_init();
    if vm::double_purge() {
        for arena in arenas::all_arenas() {
            arena.hard_purge();
        }
    }
}

#[cfg(all(test, not(loom), not(miri)))]
mod tests {
    use super::*;

    #[test]
    fn test_malloc_free_round_trip() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let p = malloc(100).unwrap();
        // Safety: fresh allocation of at least 100 bytes.
        unsafe {
            std::ptr::write_bytes(p.as_ptr(), 0x42, 100);
            assert_eq!(*p.as_ptr(), 0x42);
            assert_eq!(malloc_usable_size(p.as_ptr()), malloc_good_size(100));
            free(p.as_ptr());
        }
    }

    #[test]
    fn test_malloc_zero_size() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let p = malloc(0).unwrap();
        // Safety: allocation is live.
        unsafe {
            assert!(malloc_usable_size(p.as_ptr()) >= 1);
            free(p.as_ptr());
        }
    }

    #[test]
    fn test_free_null_is_noop() {
        // Safety: null is explicitly allowed.
        unsafe { free(std::ptr::null_mut()) };
    }

    #[test]
    fn test_calloc_overflow() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        assert!(calloc(usize::MAX, 2).is_none());
        assert!(calloc(usize::MAX / 2 + 2, 2).is_none());
    }

    #[test]
    fn test_posix_memalign_einval() {
        let mut out = std::ptr::null_mut();
        assert_eq!(posix_memalign(&mut out, 3, 64), EINVAL);
        assert_eq!(posix_memalign(&mut out, 0, 64), EINVAL);
        assert_eq!(posix_memalign(&mut out, 4, 64), EINVAL);
        assert!(out.is_null());
    }

    #[test]
    fn test_aligned_alloc_rejects_bad_size() {
        assert!(aligned_alloc(64, 65).is_none());
        assert!(aligned_alloc(0, 64).is_none());
    }

    #[test]
    fn test_usable_size_of_foreign_pointer() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        arenas::ensure_init();
        let local = 0usize;
        // A stack address belongs to no chunk we own.
        // Safety: any address is allowed.
        unsafe {
            assert_eq!(malloc_usable_size(&local as *const usize as *const u8), 0);
            assert_eq!(ptr_info(&local as *const usize as *const u8).tag, PtrTag::Unknown);
        }
    }

    #[test]
    fn test_good_size_reexport_consistency() {
        for req in [1, 7, 9, 100, 513, 2049, 70000] {
            let _guard = crate::heap::TEST_MUTEX.read().unwrap();
            let p = malloc(req).unwrap();
            // Safety: allocation is live.
            unsafe {
                assert_eq!(malloc_usable_size(p.as_ptr()), malloc_good_size(req));
                free(p.as_ptr());
            }
        }
    }
}
