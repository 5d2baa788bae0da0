//! Chunk allocation and recycling.
//!
//! Recently unmapped chunks are parked in two ordered views sharing the same
//! extents: one keyed by `(size, addr)` for best-fit allocation, one keyed by
//! address for coalescing.  A process-wide byte budget gates admission; the
//! excess above the budget is unmapped instead of recycled.

use crate::heap::classes::{alignment_ceiling, CHUNKSIZE, CHUNK_MASK};
use crate::heap::vm;
use crate::sync::atomic::{AtomicUsize, Ordering};
use crate::sync::unmodeled::Mutex;
use crate::sync::OnceLock;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum ChunkType {
    /// Carved out of an arena.
    Arena,
    /// Used for a huge allocation.
    Huge,
    /// Recycled with unknown contents.
    Recycled,
    /// Known to be full of zeroes.
    Zeroed,
}

struct Extent {
    size: usize,
    ty: ChunkType,
}

#[derive(Default)]
pub(crate) struct ChunkCache {
    by_size: BTreeSet<(usize, usize)>,
    by_addr: BTreeMap<usize, Extent>,
}

/// Cap on recycled bytes held by the cache.
pub(crate) const RECYCLE_LIMIT: usize = 128 * CHUNKSIZE;

// Read with acquire before gating a recycle decision; updated under the cache
// mutex with release so the gate never runs ahead of the trees.
crate::sync::loom_static! {
    static RECYCLED_BYTES: AtomicUsize = AtomicUsize::new(0);
}

#[allow(dead_code)]
pub(crate) fn recycled_bytes() -> usize {
    RECYCLED_BYTES.load(Ordering::Acquire)
}

static CACHE: OnceLock<Mutex<ChunkCache>> = OnceLock::new();

pub(crate) fn cache_mutex() -> &'static Mutex<ChunkCache> {
    CACHE.get_or_init(|| Mutex::new(ChunkCache::default()))
}

/// Allocate `size` bytes of chunk-aligned address space, recycled if
/// possible.  Returns the base address and whether the memory is guaranteed
/// zeroed.  `base_mode` marks requests from the base sub-allocator, which
/// never recycle.
pub(crate) fn chunk_alloc(size: usize, alignment: usize, base_mode: bool) -> Option<(usize, bool)> {
    debug_assert!(size != 0 && size & CHUNK_MASK == 0);
    debug_assert!(alignment != 0 && alignment & CHUNK_MASK == 0);

    if vm::can_recycle(size) {
        if let Some(ret) = recycle(size, alignment, base_mode) {
            return Some(ret);
        }
    }
    let addr = vm::map(size, alignment)?;
    Some((addr, true))
}

fn recycle(size: usize, alignment: usize, base_mode: bool) -> Option<(usize, bool)> {
    if base_mode {
        // Base requests must not touch the cache: its bookkeeping lives in
        // ordinary containers whose growth could recurse into base pages.
        return None;
    }
    let alloc_size = size + alignment - CHUNKSIZE;
    if alloc_size < size {
        return None;
    }

    let mut cache = cache_mutex().lock().unwrap();
    let &(node_size, node_addr) = cache.by_size.range((alloc_size, 0)..).next()?;
    let ty = cache.by_addr[&node_addr].ty;

    let leadsize = alignment_ceiling(node_addr, alignment) - node_addr;
    debug_assert!(node_size >= leadsize + size);
    let trailsize = node_size - leadsize - size;
    let ret = node_addr + leadsize;
    let mut zeroed = ty == ChunkType::Zeroed;

    cache.by_size.remove(&(node_size, node_addr));
    cache.by_addr.remove(&node_addr);
    if leadsize != 0 {
        cache.by_size.insert((leadsize, node_addr));
        cache.by_addr.insert(node_addr, Extent { size: leadsize, ty });
    }
    if trailsize != 0 {
        cache.by_size.insert((trailsize, ret + size));
        cache.by_addr.insert(ret + size, Extent { size: trailsize, ty });
    }
    RECYCLED_BYTES.fetch_sub(size, Ordering::Release);
    drop(cache);

    if vm::purge_strategy() == vm::PurgeStrategy::Decommit {
        vm::commit(ret, size);
        // Commit is guaranteed to zero the chunk.
        zeroed = true;
    }
    Some((ret, zeroed))
}

/// Release a chunk range, recycling the portion that fits under the budget
/// and unmapping the rest.
pub(crate) fn chunk_dealloc(addr: usize, size: usize, ty: ChunkType) {
    debug_assert!(addr != 0 && addr & CHUNK_MASK == 0);
    debug_assert!(size != 0 && size & CHUNK_MASK == 0);

    if vm::can_recycle(size) {
        let recycled_so_far = RECYCLED_BYTES.load(Ordering::Acquire);
        // A racing dealloc may have put us above the limit already.
        if recycled_so_far < RECYCLE_LIMIT {
            let recycle_remaining = RECYCLE_LIMIT - recycled_so_far;
            let to_recycle = if size > recycle_remaining {
                // Unmap the portion that would overflow the budget.
                vm::unmap(addr + recycle_remaining, size - recycle_remaining);
                recycle_remaining
            } else {
                size
            };
            record(addr, to_recycle, ty);
            return;
        }
    }
    vm::unmap(addr, size);
}

fn record(chunk: usize, size: usize, ty: ChunkType) {
    let mut ty = ty;
    if ty != ChunkType::Zeroed && vm::purge(chunk, size, ty == ChunkType::Huge) {
        ty = ChunkType::Zeroed;
    }

    let mut cache = cache_mutex().lock().unwrap();
    let mut addr = chunk;
    let mut total = size;

    // Try to coalesce forward.
    let next = cache
        .by_addr
        .range(chunk + size..)
        .next()
        .map(|(&a, e)| (a, e.size, e.ty));
    if let Some((next_addr, next_size, next_ty)) = next {
        if next_addr == chunk + size {
            cache.by_size.remove(&(next_size, next_addr));
            cache.by_addr.remove(&next_addr);
            if next_ty != ty {
                ty = ChunkType::Recycled;
            }
            total += next_size;
        }
    }

    // Try to coalesce backward.
    let prev = cache
        .by_addr
        .range(..chunk)
        .next_back()
        .map(|(&a, e)| (a, e.size, e.ty));
    if let Some((prev_addr, prev_size, prev_ty)) = prev {
        if prev_addr + prev_size == chunk {
            cache.by_size.remove(&(prev_size, prev_addr));
            cache.by_addr.remove(&prev_addr);
            if prev_ty != ty {
                ty = ChunkType::Recycled;
            }
            addr = prev_addr;
            total += prev_size;
        }
    }

    cache.by_addr.insert(addr, Extent { size: total, ty });
    cache.by_size.insert((total, addr));
    RECYCLED_BYTES.fetch_add(size, Ordering::Release);
}

/// Zero `[addr, addr+size)` unless the mapping is already known to be zeroed.
pub(crate) fn chunk_ensure_zero(addr: usize, size: usize, zeroed: bool) {
    if !zeroed {
        // Safety: the caller owns the freshly allocated range.
        unsafe { std::ptr::write_bytes(addr as *mut u8, 0, size) };
    } else {
        #[cfg(debug_assertions)]
        {
            // Safety: the caller owns the freshly allocated range.
            let words = unsafe {
                std::slice::from_raw_parts(addr as *const usize, size / core::mem::size_of::<usize>())
            };
            for (i, &w) in words.iter().enumerate() {
                assert_eq!(w, 0, "chunk claimed zeroed but word {i} is {w:#x}");
            }
        }
    }
}

#[cfg(all(test, not(loom), not(miri)))]
mod tests {
    use super::*;

    #[test]
    fn test_dealloc_then_alloc_recycles() {
        if !vm::can_recycle(CHUNKSIZE) {
            return;
        }
        let _guard = crate::heap::TEST_MUTEX.write().unwrap();
        let (addr, _zeroed) = chunk_alloc(CHUNKSIZE, CHUNKSIZE, false).unwrap();
        let before = recycled_bytes();
        chunk_dealloc(addr, CHUNKSIZE, ChunkType::Arena);
        assert_eq!(recycled_bytes(), before + CHUNKSIZE);

        let (addr2, _zeroed) = chunk_alloc(CHUNKSIZE, CHUNKSIZE, false).unwrap();
        assert_eq!(recycled_bytes(), before);
        // Drain what we put in so other tests see a clean budget.
        chunk_dealloc(addr2, CHUNKSIZE, ChunkType::Arena);
        let (addr3, _zeroed) = chunk_alloc(CHUNKSIZE, CHUNKSIZE, false).unwrap();
        vm::unmap(addr3, CHUNKSIZE);
    }

    #[test]
    fn test_adjacent_extents_coalesce() {
        if !vm::can_recycle(2 * CHUNKSIZE) {
            return;
        }
        let _guard = crate::heap::TEST_MUTEX.write().unwrap();
        let (addr, _zeroed) = chunk_alloc(2 * CHUNKSIZE, CHUNKSIZE, false).unwrap();
        chunk_dealloc(addr, CHUNKSIZE, ChunkType::Arena);
        chunk_dealloc(addr + CHUNKSIZE, CHUNKSIZE, ChunkType::Arena);

        // The two halves must have merged into a single extent covering the
        // whole range (possibly further coalesced with older neighbors).
        {
            let cache = cache_mutex().lock().unwrap();
            let (cover_addr, cover_size) = cache
                .by_addr
                .range(..=addr)
                .next_back()
                .map(|(&a, e)| (a, e.size))
                .expect("released range missing from cache");
            assert!(cover_addr <= addr && cover_addr + cover_size >= addr + 2 * CHUNKSIZE);
            assert_eq!(cache.by_size.len(), cache.by_addr.len());
        }
        // A two-chunk request is now served from the cache.
        let (merged, _zeroed) = chunk_alloc(2 * CHUNKSIZE, CHUNKSIZE, false).unwrap();
        vm::unmap(merged, 2 * CHUNKSIZE);
    }

    #[test]
    fn test_base_mode_never_recycles() {
        let _guard = crate::heap::TEST_MUTEX.write().unwrap();
        let (addr, _zeroed) = chunk_alloc(CHUNKSIZE, CHUNKSIZE, false).unwrap();
        chunk_dealloc(addr, CHUNKSIZE, ChunkType::Arena);
        let before = recycled_bytes();
        let (base_addr, base_zeroed) = chunk_alloc(CHUNKSIZE, CHUNKSIZE, true).unwrap();
        // The cached chunk was not consumed.
        assert_eq!(recycled_bytes(), before);
        assert!(base_zeroed);
        vm::unmap(base_addr, CHUNKSIZE);
        // Drain the cached chunk.
        let (drained, _zeroed) = chunk_alloc(CHUNKSIZE, CHUNKSIZE, false).unwrap();
        vm::unmap(drained, CHUNKSIZE);
    }

    #[test]
    fn test_ensure_zero_fills() {
        let (addr, _) = chunk_alloc(CHUNKSIZE, CHUNKSIZE, true).unwrap();
        // Safety: freshly mapped chunk.
        unsafe { std::ptr::write_bytes(addr as *mut u8, 0x7f, 64) };
        chunk_ensure_zero(addr, CHUNKSIZE, false);
        // Safety: chunk is mapped and zeroed.
        unsafe {
            assert_eq!(*(addr as *const u8), 0);
            assert_eq!(*((addr + 63) as *const u8), 0);
        }
        vm::unmap(addr, CHUNKSIZE);
    }
}
