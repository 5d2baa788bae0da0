//! Huge allocations: requests above `ARENA_MAXCLASS`, served from dedicated
//! multi-chunk mappings outside any arena.
//!
//! Extents are keyed by base address.  The recorded size is the page ceiling
//! of the request; the mapping itself is the chunk ceiling.  Under the
//! decommit strategy the gap between the two is kept decommitted, elsewhere
//! the kernel simply never backs untouched pages.

use crate::heap::api;
use crate::heap::chunk_cache::{self, ChunkType};
use crate::heap::classes::{chunk_ceiling, page_ceiling, ARENA_MAXCLASS, CHUNKSIZE};
use crate::heap::options;
use crate::heap::radix;
use crate::heap::vm::{self, PurgeStrategy};
use crate::sync::unmodeled::Mutex;
use crate::sync::OnceLock;
use std::collections::BTreeMap;
use std::ptr::NonNull;

pub(crate) struct HugeRegistry {
    /// Base address to recorded (page-ceiled) size.
    tree: BTreeMap<usize, usize>,
    #[allow(dead_code)]
    pub(crate) nmalloc: u64,
    #[allow(dead_code)]
    pub(crate) ndalloc: u64,
    pub(crate) allocated: usize,
    pub(crate) mapped: usize,
}

static HUGE: OnceLock<Mutex<HugeRegistry>> = OnceLock::new();

pub(crate) fn huge_mutex() -> &'static Mutex<HugeRegistry> {
    HUGE.get_or_init(|| {
        Mutex::new(HugeRegistry {
            tree: BTreeMap::new(),
            nmalloc: 0,
            ndalloc: 0,
            allocated: 0,
            mapped: 0,
        })
    })
}

pub(crate) fn huge_malloc(size: usize, zero: bool) -> Option<NonNull<u8>> {
    huge_palloc(size, CHUNKSIZE, zero)
}

pub(crate) fn huge_palloc(size: usize, alignment: usize, zero: bool) -> Option<NonNull<u8>> {
    let csize = chunk_ceiling(size);
    if csize == 0 {
        // size was large enough to cause wrap-around.
        return None;
    }

    let (addr, zeroed) = chunk_cache::chunk_alloc(csize, alignment, false)?;
    if !radix::chunk_rtree().set(addr, radix::HUGE_CHUNK_OWNER) {
        chunk_cache::chunk_dealloc(addr, csize, ChunkType::Huge);
        return None;
    }
    if zero {
        chunk_cache::chunk_ensure_zero(addr, csize, zeroed);
    }

    let psize = page_ceiling(size);
    {
        let mut huge = huge_mutex().lock().unwrap();
        huge.tree.insert(addr, psize);
        huge.nmalloc += 1;
        // Only psize bytes count as allocated: the tail is either explicitly
        // decommitted or never touched, so it has no physical backing, and
        // malloc_usable_size reports psize.
        huge.allocated += psize;
        huge.mapped += csize;
    }

    if vm::purge_strategy() == PurgeStrategy::Decommit && csize - psize > 0 {
        vm::decommit(addr + psize, csize - psize);
    }

    if !zero {
        let fill = if vm::purge_strategy() == PurgeStrategy::Decommit {
            psize
        } else {
            csize
        };
        options::junk_fill(addr, fill);
    }

    NonNull::new(addr as *mut u8)
}

pub(crate) fn huge_dalloc(addr: usize) {
    let psize = {
        let mut huge = huge_mutex().lock().unwrap();
        let psize = huge
            .tree
            .remove(&addr)
            .unwrap_or_else(|| panic!("free of unknown huge allocation {addr:#x}"));
        huge.ndalloc += 1;
        huge.allocated -= psize;
        huge.mapped -= chunk_ceiling(psize);
        psize
    };
    radix::chunk_rtree().unset(addr);
    chunk_cache::chunk_dealloc(addr, chunk_ceiling(psize), ChunkType::Huge);
}

pub(crate) fn huge_ralloc(addr: usize, size: usize, oldsize: usize) -> Option<NonNull<u8>> {
    let new_csize = chunk_ceiling(size);
    if new_csize == 0 {
        return None;
    }
    let old_csize = chunk_ceiling(oldsize);

    // Avoid moving the allocation when the mapping can absorb the change.
    if oldsize > ARENA_MAXCLASS && new_csize == old_csize {
        let psize = page_ceiling(size);
        if size < oldsize {
            options::poison_fill(addr + size, oldsize - size);
        }
        let decommit = vm::purge_strategy() == PurgeStrategy::Decommit;
        if decommit && psize < oldsize {
            vm::decommit(addr + psize, oldsize - psize);
            let mut huge = huge_mutex().lock().unwrap();
            huge.allocated -= oldsize - psize;
            // mapped is unchanged: nothing was (un)mapped.
            *huge.tree.get_mut(&addr).expect("realloc of unknown huge allocation") = psize;
        } else if decommit && psize > oldsize {
            vm::commit(addr + oldsize, psize - oldsize);
        }
        if psize > oldsize {
            // Record the grown size even without a commit, so usable_size
            // never reports less than what realloc granted.
            let mut huge = huge_mutex().lock().unwrap();
            huge.allocated += psize - oldsize;
            *huge.tree.get_mut(&addr).expect("realloc of unknown huge allocation") = psize;
        }
        if options::options().zero && size > oldsize {
            // Safety: the grown range is committed and owned by the caller.
            unsafe { std::ptr::write_bytes((addr + oldsize) as *mut u8, 0, size - oldsize) };
        }
        return NonNull::new(addr as *mut u8);
    }

    // Shrinking to fewer chunks: release the tail in place.  Windows cannot
    // release part of a mapping, so it falls through to the move path.
    if oldsize > ARENA_MAXCLASS && new_csize < old_csize && !cfg!(windows) {
        let psize = page_ceiling(size);
        if size < new_csize {
            options::poison_fill(addr + size, new_csize - size);
        }
        // Only the first chunk of a huge mapping is in the owner index, so
        // the released tail needs no unset.
        chunk_cache::chunk_dealloc(addr + new_csize, old_csize - new_csize, ChunkType::Huge);
        if vm::purge_strategy() == PurgeStrategy::Decommit && new_csize > psize {
            vm::decommit(addr + psize, new_csize - psize);
        }
        {
            let mut huge = huge_mutex().lock().unwrap();
            huge.allocated -= oldsize - psize;
            huge.mapped -= old_csize - new_csize;
            *huge.tree.get_mut(&addr).expect("realloc of unknown huge allocation") = psize;
        }
        return NonNull::new(addr as *mut u8);
    }

    // The size classes are different enough that a new mapping is needed.
    let ret = huge_malloc(size, false)?;
    let copysize = size.min(oldsize);
    vm::copy(ret.as_ptr() as usize, addr, copysize);
    api::idalloc(addr);
    Some(ret)
}

/// Recorded size of the huge allocation based exactly at `addr`, 0 if none.
pub(crate) fn usable_size(addr: usize) -> usize {
    let huge = huge_mutex().lock().unwrap();
    huge.tree.get(&addr).copied().unwrap_or(0)
}

/// Locate the live huge extent whose `[base, base+size)` contains `addr`.
pub(crate) fn lookup_containing(addr: usize) -> Option<(usize, usize)> {
    let huge = huge_mutex().lock().unwrap();
    let (&base, &size) = huge.tree.range(..=addr).next_back()?;
    if addr < base + size {
        Some((base, size))
    } else {
        None
    }
}

#[cfg(all(test, not(loom), not(miri)))]
mod tests {
    use super::*;
    use crate::heap::classes::PAGE_SIZE;

    #[test]
    fn test_huge_round_trip() {
        let _guard = crate::heap::TEST_MUTEX.write().unwrap();
        let p = huge_malloc(CHUNKSIZE, false).unwrap().as_ptr() as usize;
        assert_eq!(p % CHUNKSIZE, 0);
        assert_eq!(usable_size(p), CHUNKSIZE);
        assert_eq!(lookup_containing(p + CHUNKSIZE - 1), Some((p, CHUNKSIZE)));
        // One past the end is outside this extent (a neighboring mapping may
        // own it).
        assert_ne!(lookup_containing(p + CHUNKSIZE).map(|(b, _)| b), Some(p));
        huge_dalloc(p);
        assert_eq!(usable_size(p), 0);
    }

    #[test]
    fn test_huge_zeroed() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let p = huge_malloc(CHUNKSIZE + 1, true).unwrap().as_ptr();
        // Recorded size is the page ceiling.
        assert_eq!(usable_size(p as usize), CHUNKSIZE + PAGE_SIZE);
        // Safety: the mapping is live and at least psize bytes.
        unsafe {
            for i in (0..CHUNKSIZE + PAGE_SIZE).step_by(PAGE_SIZE / 2) {
                assert_eq!(*p.add(i), 0, "byte {i} not zero");
            }
        }
        huge_dalloc(p as usize);
    }

    #[test]
    fn test_huge_registry_counters() {
        let _guard = crate::heap::TEST_MUTEX.write().unwrap();
        let (n0, a0, m0) = {
            let h = huge_mutex().lock().unwrap();
            (h.nmalloc, h.allocated, h.mapped)
        };
        let p = huge_malloc(3 * CHUNKSIZE, false).unwrap().as_ptr() as usize;
        {
            let h = huge_mutex().lock().unwrap();
            assert_eq!(h.nmalloc, n0 + 1);
            assert_eq!(h.allocated, a0 + 3 * CHUNKSIZE);
            assert_eq!(h.mapped, m0 + 3 * CHUNKSIZE);
        }
        huge_dalloc(p);
        {
            let h = huge_mutex().lock().unwrap();
            assert_eq!(h.allocated, a0);
            assert_eq!(h.mapped, m0);
        }
    }
}
