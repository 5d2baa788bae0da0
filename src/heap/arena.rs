//! Arena: per-arena chunks, runs, bins, dirty tracking and purging.
//!
//! Each arena owns a set of chunks carved into page runs.  Small requests are
//! served from bitmap-indexed runs grouped into per-size-class bins; large
//! requests get a dedicated run.  All arena state is guarded by the arena's
//! mutex; chunk records are reached through the owner index and only
//! dereferenced while that mutex is held.

use crate::heap::chunk_cache::{self, ChunkType};
use crate::heap::classes::{self, ARENA_MAXCLASS, BIN_MAXCLASS, CHUNKSIZE, CHUNK_HEADER_NPAGES, CHUNK_NPAGES, NBINS, PAGE_2POW, PAGE_MASK, PAGE_SIZE};
use crate::heap::map::{self, MapEntry, MAP_ALLOCATED, MAP_DECOMMITTED, MAP_DIRTY, MAP_LARGE, MAP_MADVISED, MAP_MADVISED_OR_DECOMMITTED, MAP_ZEROED};
use crate::heap::options;
use crate::heap::radix;
use crate::heap::vm::{self, PurgeStrategy};
use crate::sync::Mutex;
#[cfg(debug_assertions)]
use fixedbitset::FixedBitSet;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::ptr::NonNull;

/// Header for a live small run, kept in the owning chunk's record and keyed
/// by the run's first page index.
pub(crate) struct SmallRun {
    pub(crate) bin_ix: usize,
    pub(crate) nfree: u32,
    /// Lowest bitmask word that may contain a free region.
    regs_minelm: u32,
    /// One bit per region; set means free.
    pub(crate) regs_mask: Box<[u32]>,
    /// Regions currently freed, for double-free detection.
    #[cfg(debug_assertions)]
    freed: FixedBitSet,
}

impl SmallRun {
    fn new(bin_ix: usize, nregs: u32, mask_nelms: u32) -> Self {
        let mut mask = vec![u32::MAX; mask_nelms as usize].into_boxed_slice();
        let remainder = nregs & 31;
        if remainder != 0 {
            // The last element has spare bits that need to be unset.
            mask[mask_nelms as usize - 1] = u32::MAX >> (32 - remainder);
        }
        Self {
            bin_ix,
            nfree: nregs,
            regs_minelm: 0,
            regs_mask: mask,
            #[cfg(debug_assertions)]
            freed: {
                let mut f = FixedBitSet::with_capacity(nregs as usize);
                f.insert_range(..);
                f
            },
        }
    }
}

/// Record for one arena chunk.  The chunk's leading header pages are
/// reserved; the record itself lives on the metadata heap and is reachable
/// through the owner index.
pub(crate) struct ArenaChunk {
    pub(crate) base: usize,
    pub(crate) arena: *const Arena,
    pub(crate) ndirty: usize,
    pub(crate) map: Box<[MapEntry]>,
    pub(crate) runs: BTreeMap<usize, SmallRun>,
}

/// Resolve an arena chunk record from its base address.
///
/// # Safety
/// `base` must be a registered arena chunk and the owning arena's lock must
/// be held (or the record otherwise unreachable by other threads).
unsafe fn chunk_at<'a>(base: usize) -> &'a mut ArenaChunk {
    let val = radix::chunk_rtree().get(base);
    debug_assert!(val != 0 && val != radix::HUGE_CHUNK_OWNER);
    unsafe { &mut *(val as *mut ArenaChunk) }
}

pub(crate) struct Bin {
    pub(crate) reg_size: usize,
    pub(crate) run_size: usize,
    pub(crate) nregs: u32,
    pub(crate) mask_nelms: u32,
    pub(crate) reg0_offset: u32,
    /// Current run; always the lowest-addressed non-full run if non-null.
    pub(crate) runcur: Option<usize>,
    /// Other non-full runs, by address.  Full runs appear nowhere.
    pub(crate) runs: BTreeSet<usize>,
    pub(crate) curruns: usize,
}

#[derive(Clone, Copy, Default)]
pub(crate) struct ArenaStats {
    pub(crate) mapped: usize,
    /// In pages.
    pub(crate) committed: usize,
    pub(crate) allocated_small: usize,
    pub(crate) allocated_large: usize,
}

pub(crate) struct ArenaInner {
    /// Chunks containing dirty pages, by address.
    pub(crate) chunks_dirty: BTreeSet<usize>,
    /// Chunks with lazily purged pages, most recent first.
    pub(crate) chunks_madvised: VecDeque<usize>,
    pub(crate) spare: Option<NonNull<ArenaChunk>>,
    /// Free runs, keyed by (size in bytes, address) for best fit.
    pub(crate) runs_avail: BTreeSet<(usize, usize)>,
    pub(crate) ndirty: usize,
    pub(crate) max_dirty: usize,
    pub(crate) bins: Box<[Bin]>,
    pub(crate) stats: ArenaStats,
}

// Safety: the raw chunk pointers are only dereferenced under the arena lock.
unsafe impl Send for ArenaInner {}

pub struct Arena {
    pub(crate) id: u32,
    pub(crate) inner: Mutex<ArenaInner>,
}

fn run_reg_alloc(run: &mut SmallRun, mask_nelms: u32) -> u32 {
    let mut i = run.regs_minelm as usize;
    let mask = run.regs_mask[i];
    if mask != 0 {
        let bit = mask.trailing_zeros();
        run.regs_mask[i] ^= 1 << bit;
        return i as u32 * 32 + bit;
    }
    i += 1;
    while i < mask_nelms as usize {
        let mask = run.regs_mask[i];
        if mask != 0 {
            let bit = mask.trailing_zeros();
            run.regs_mask[i] ^= 1 << bit;
            // Nothing before this element contains a free region.
            run.regs_minelm = i as u32;
            return i as u32 * 32 + bit;
        }
        i += 1;
    }
    unreachable!("small run bitmask empty with nfree > 0");
}

fn run_reg_dalloc(run: &mut SmallRun, diff: usize, reg_size: usize, nregs: u32) {
    let regind = classes::region_index(diff, reg_size);
    assert_eq!(diff, regind * reg_size, "free of misaligned small region");
    assert!(regind < nregs as usize, "region index out of range");

    #[cfg(debug_assertions)]
    {
        assert!(
            !run.freed.contains(regind),
            "double free of small region (index {regind})"
        );
        run.freed.insert(regind);
    }

    let elm = regind >> 5;
    if (elm as u32) < run.regs_minelm {
        run.regs_minelm = elm as u32;
    }
    let bit = regind & 31;
    assert_eq!(
        run.regs_mask[elm] & (1 << bit),
        0,
        "double free of small region (index {regind})"
    );
    run.regs_mask[elm] |= 1 << bit;
}

impl ArenaInner {
    fn run_nfree(&self, run_addr: usize) -> u32 {
        // Safety: arena lock held by the caller.
        let chunk = unsafe { chunk_at(map::chunk_base(run_addr)) };
        let run_ind = map::page_index(chunk.base, run_addr);
        chunk.runs[&run_ind].nfree
    }

    /// Split `size` bytes off the front of the free run at `run_addr`,
    /// committing or zeroing pages as required.
    fn split_run(&mut self, run_addr: usize, size: usize, large: bool, zero: bool) {
        // Safety: arena lock held.
        let chunk = unsafe { chunk_at(map::chunk_base(run_addr)) };
        let old_ndirty = chunk.ndirty;
        let run_ind = map::page_index(chunk.base, run_addr);
        let total_pages = chunk.map[run_ind].size() >> PAGE_2POW;
        let need_pages = size >> PAGE_2POW;
        debug_assert!(need_pages > 0);
        debug_assert!(need_pages <= total_pages);
        let rem_pages = total_pages - need_pages;

        let removed = self.runs_avail.remove(&(total_pages << PAGE_2POW, run_addr));
        debug_assert!(removed);

        // Keep track of trailing unused pages for later use.
        if rem_pages > 0 {
            let rem_size = rem_pages << PAGE_2POW;
            chunk.map[run_ind + need_pages].set_size(rem_size);
            chunk.map[run_ind + total_pages - 1].set_size(rem_size);
            self.runs_avail
                .insert((rem_size, chunk.base + ((run_ind + need_pages) << PAGE_2POW)));
        }

        for i in 0..need_pages {
            let page = run_ind + i;
            let flagged = chunk.map[page].is(MAP_MADVISED_OR_DECOMMITTED);
            if flagged {
                // Commit decommitted pages in a maximal adjacent group, to
                // amortize the system call.
                let mut j = 0;
                while i + j < need_pages
                    && chunk.map[page + j].is(MAP_MADVISED_OR_DECOMMITTED)
                {
                    debug_assert!(
                        !(chunk.map[page + j].is(MAP_DECOMMITTED)
                            && chunk.map[page + j].is(MAP_MADVISED))
                    );
                    chunk.map[page + j].clear(MAP_MADVISED_OR_DECOMMITTED);
                    j += 1;
                }
                if vm::purge_strategy() == PurgeStrategy::Decommit {
                    vm::commit(chunk.base + (page << PAGE_2POW), j << PAGE_2POW);
                }
                self.stats.committed += j;
            }

            // No zeroing needed for freshly committed pages: commit zeroes.
            let skip_zero = flagged && vm::purge_strategy() == PurgeStrategy::Decommit;
            if zero && !skip_zero && !chunk.map[page].is(MAP_ZEROED) {
                // Safety: the page is committed and owned by this run.
                unsafe {
                    std::ptr::write_bytes(
                        (chunk.base + (page << PAGE_2POW)) as *mut u8,
                        0,
                        PAGE_SIZE,
                    )
                };
            }

            if chunk.map[page].is(MAP_DIRTY) {
                chunk.ndirty -= 1;
                self.ndirty -= 1;
            }

            chunk.map[page] = if large {
                MapEntry(MAP_LARGE | MAP_ALLOCATED)
            } else {
                MapEntry(run_addr | MAP_ALLOCATED)
            };
        }

        // Only the first page of a large run carries the size; the lack of
        // size info for trailing pages only matters for interior pointers.
        if large {
            chunk.map[run_ind].set(size);
        }

        if chunk.ndirty == 0 && old_ndirty > 0 {
            self.chunks_dirty.remove(&chunk.base);
        }
    }

    /// Set up the record for a freshly obtained chunk: one maximal free
    /// untouched run after the header pages.
    fn init_chunk(&mut self, arena: *const Arena, base: usize, zeroed: bool) -> NonNull<ArenaChunk> {
        // A zeroed chunk starts out decommitted-and-zeroed; a recycled chunk
        // can only contain stale contents and starts out madvised.
        let flags = if zeroed {
            MAP_DECOMMITTED | MAP_ZEROED
        } else {
            MAP_MADVISED
        };

        self.stats.mapped += CHUNKSIZE;

        let mut pmap = vec![MapEntry(0); CHUNK_NPAGES].into_boxed_slice();
        pmap[CHUNK_HEADER_NPAGES] = MapEntry(ARENA_MAXCLASS | flags);
        for entry in pmap.iter_mut().take(CHUNK_NPAGES - 1).skip(CHUNK_HEADER_NPAGES + 1) {
            *entry = MapEntry(flags);
        }
        pmap[CHUNK_NPAGES - 1] = MapEntry(ARENA_MAXCLASS | flags);

        if vm::purge_strategy() == PurgeStrategy::Decommit {
            // Start out decommitted, for a closer correspondence between
            // dirty pages and committed untouched pages.
            vm::decommit(base + (CHUNK_HEADER_NPAGES << PAGE_2POW), ARENA_MAXCLASS);
        }
        self.stats.committed += CHUNK_HEADER_NPAGES;

        let record = Box::new(ArenaChunk {
            base,
            arena,
            ndirty: 0,
            map: pmap,
            runs: BTreeMap::new(),
        });
        let ptr = NonNull::from(Box::leak(record));

        self.runs_avail
            .insert((ARENA_MAXCLASS, base + (CHUNK_HEADER_NPAGES << PAGE_2POW)));
        ptr
    }

    /// Obtain a run of `size` bytes: best fit from the available runs, else
    /// the spare chunk, else a new chunk.
    fn alloc_run(&mut self, arena: *const Arena, size: usize, large: bool, zero: bool) -> Option<usize> {
        debug_assert!(size <= ARENA_MAXCLASS);
        debug_assert_eq!(size & PAGE_MASK, 0);

        if let Some(&(_, run_addr)) = self.runs_avail.range((size, 0)..).next() {
            self.split_run(run_addr, size, large, zero);
            return Some(run_addr);
        }

        if let Some(spare) = self.spare.take() {
            // Safety: arena lock held; the spare belongs to this arena.
            let chunk = unsafe { &mut *spare.as_ptr() };
            let run_addr = chunk.base + (CHUNK_HEADER_NPAGES << PAGE_2POW);
            debug_assert_eq!(chunk.map[CHUNK_HEADER_NPAGES].size(), ARENA_MAXCLASS);
            self.runs_avail.insert((ARENA_MAXCLASS, run_addr));
            self.split_run(run_addr, size, large, zero);
            return Some(run_addr);
        }

        // No usable runs; create a new chunk to allocate from.
        let (base, zeroed) = chunk_cache::chunk_alloc(CHUNKSIZE, CHUNKSIZE, false)?;
        let record = self.init_chunk(arena, base, zeroed);
        if !radix::chunk_rtree().set(base, record.as_ptr() as usize) {
            // Roll the chunk back out; the owner index could not grow.
            let run_addr = base + (CHUNK_HEADER_NPAGES << PAGE_2POW);
            self.runs_avail.remove(&(ARENA_MAXCLASS, run_addr));
            self.stats.mapped -= CHUNKSIZE;
            self.stats.committed -= CHUNK_HEADER_NPAGES;
            // Safety: the record was never published.
            unsafe { drop(Box::from_raw(record.as_ptr())) };
            chunk_cache::chunk_dealloc(base, CHUNKSIZE, ChunkType::Arena);
            return None;
        }
        let run_addr = base + (CHUNK_HEADER_NPAGES << PAGE_2POW);
        self.split_run(run_addr, size, large, zero);
        Some(run_addr)
    }

    /// Return a run to the free state, marking its pages dirty if requested,
    /// and coalesce with free neighbors.
    fn dalloc_run(&mut self, run_addr: usize, dirty: bool) {
        let chunk_base = map::chunk_base(run_addr);
        // Safety: arena lock held.
        let chunk = unsafe { chunk_at(chunk_base) };
        let mut run_ind = map::page_index(chunk_base, run_addr);
        debug_assert!(run_ind >= CHUNK_HEADER_NPAGES);
        debug_assert!(run_ind < CHUNK_NPAGES);

        let mut size = if chunk.map[run_ind].is(MAP_LARGE) {
            chunk.map[run_ind].size()
        } else {
            let run = chunk
                .runs
                .remove(&run_ind)
                .expect("freed small run missing its header");
            self.bins[run.bin_ix].run_size
        };
        let mut run_pages = size >> PAGE_2POW;

        // Mark pages as unallocated in the chunk map.
        if dirty {
            for i in 0..run_pages {
                debug_assert!(!chunk.map[run_ind + i].is(MAP_DIRTY));
                chunk.map[run_ind + i] = MapEntry(MAP_DIRTY);
            }
            if chunk.ndirty == 0 {
                self.chunks_dirty.insert(chunk_base);
            }
            chunk.ndirty += run_pages;
            self.ndirty += run_pages;
        } else {
            for i in 0..run_pages {
                chunk.map[run_ind + i].clear(MAP_LARGE | MAP_ALLOCATED);
            }
        }
        chunk.map[run_ind].set_size(size);
        chunk.map[run_ind + run_pages - 1].set_size(size);

        // Try to coalesce forward.
        if run_ind + run_pages < CHUNK_NPAGES
            && !chunk.map[run_ind + run_pages].is(MAP_ALLOCATED)
        {
            let nrun_size = chunk.map[run_ind + run_pages].size();
            let removed = self
                .runs_avail
                .remove(&(nrun_size, chunk_base + ((run_ind + run_pages) << PAGE_2POW)));
            debug_assert!(removed);
            size += nrun_size;
            run_pages = size >> PAGE_2POW;
            debug_assert_eq!(chunk.map[run_ind + run_pages - 1].size(), nrun_size);
            chunk.map[run_ind].set_size(size);
            chunk.map[run_ind + run_pages - 1].set_size(size);
        }

        // Try to coalesce backward.
        if run_ind > CHUNK_HEADER_NPAGES && !chunk.map[run_ind - 1].is(MAP_ALLOCATED) {
            let prun_size = chunk.map[run_ind - 1].size();
            run_ind -= prun_size >> PAGE_2POW;
            let removed = self
                .runs_avail
                .remove(&(prun_size, chunk_base + (run_ind << PAGE_2POW)));
            debug_assert!(removed);
            size += prun_size;
            run_pages = size >> PAGE_2POW;
            debug_assert_eq!(chunk.map[run_ind].size(), prun_size);
            chunk.map[run_ind].set_size(size);
            chunk.map[run_ind + run_pages - 1].set_size(size);
        }

        self.runs_avail
            .insert((size, chunk_base + (run_ind << PAGE_2POW)));

        // Deallocate the chunk if it is now completely unused.
        let head = chunk.map[CHUNK_HEADER_NPAGES];
        if head.size() == ARENA_MAXCLASS && !head.is(MAP_ALLOCATED) {
            self.dealloc_chunk(chunk_base);
        }

        if self.ndirty > self.max_dirty {
            self.purge(false);
        }
    }

    /// Make the now-empty chunk the spare, evicting any existing spare to
    /// the chunk cache.
    fn dealloc_chunk(&mut self, chunk_base: usize) {
        if let Some(spare) = self.spare.take() {
            // Safety: arena lock held; the spare belongs to this arena.
            let sp = unsafe { &mut *spare.as_ptr() };
            let spare_base = sp.base;
            if sp.ndirty > 0 {
                self.chunks_dirty.remove(&spare_base);
                self.ndirty -= sp.ndirty;
                self.stats.committed -= sp.ndirty;
            }
            if vm::double_purge() {
                if let Some(pos) = self.chunks_madvised.iter().position(|&c| c == spare_base) {
                    self.chunks_madvised.remove(pos);
                }
            }
            radix::chunk_rtree().unset(spare_base);
            // Safety: the record is unpublished and no longer referenced.
            unsafe { drop(Box::from_raw(spare.as_ptr())) };
            chunk_cache::chunk_dealloc(spare_base, CHUNKSIZE, ChunkType::Arena);
            self.stats.mapped -= CHUNKSIZE;
            self.stats.committed -= CHUNK_HEADER_NPAGES;
        }

        // Remove the maximal run so the arena stops using this chunk.  Dirty
        // page flushing only uses the dirty chunk tree, so the chunk may stay
        // there.
        let run_addr = chunk_base + (CHUNK_HEADER_NPAGES << PAGE_2POW);
        let removed = self.runs_avail.remove(&(ARENA_MAXCLASS, run_addr));
        debug_assert!(removed);
        let val = radix::chunk_rtree().get(chunk_base);
        self.spare = NonNull::new(val as *mut ArenaChunk);
    }

    fn trim_run_head(&mut self, chunk_base: usize, run_addr: usize, oldsize: usize, newsize: usize) {
        debug_assert!(oldsize > newsize);
        {
            // Safety: arena lock held.
            let chunk = unsafe { chunk_at(chunk_base) };
            let pageind = map::page_index(chunk_base, run_addr);
            let head_npages = (oldsize - newsize) >> PAGE_2POW;
            // Update the map so the leading run appears separately allocated.
            chunk.map[pageind] = MapEntry((oldsize - newsize) | MAP_LARGE | MAP_ALLOCATED);
            chunk.map[pageind + head_npages] = MapEntry(newsize | MAP_LARGE | MAP_ALLOCATED);
        }
        self.dalloc_run(run_addr, false);
    }

    fn trim_run_tail(
        &mut self,
        chunk_base: usize,
        run_addr: usize,
        oldsize: usize,
        newsize: usize,
        dirty: bool,
    ) {
        debug_assert!(oldsize > newsize);
        {
            // Safety: arena lock held.
            let chunk = unsafe { chunk_at(chunk_base) };
            let pageind = map::page_index(chunk_base, run_addr);
            let npages = newsize >> PAGE_2POW;
            // Update the map so the trailing run appears separately allocated.
            chunk.map[pageind] = MapEntry(newsize | MAP_LARGE | MAP_ALLOCATED);
            chunk.map[pageind + npages] =
                MapEntry((oldsize - newsize) | MAP_LARGE | MAP_ALLOCATED);
        }
        self.dalloc_run(run_addr + newsize, dirty);
    }

    /// Find or create a run with free regions for the given bin.
    fn get_non_full_bin_run(&mut self, arena: *const Arena, bin_ix: usize) -> Option<usize> {
        if let Some(&run_addr) = self.bins[bin_ix].runs.iter().next() {
            self.bins[bin_ix].runs.remove(&run_addr);
            return Some(run_addr);
        }

        let (run_size, nregs, mask_nelms) = {
            let bin = &self.bins[bin_ix];
            (bin.run_size, bin.nregs, bin.mask_nelms)
        };
        let run_addr = self.alloc_run(arena, run_size, false, false)?;
        {
            // Safety: arena lock held.
            let chunk = unsafe { chunk_at(map::chunk_base(run_addr)) };
            let run_ind = map::page_index(chunk.base, run_addr);
            chunk
                .runs
                .insert(run_ind, SmallRun::new(bin_ix, nregs, mask_nelms));
        }
        self.bins[bin_ix].curruns += 1;
        Some(run_addr)
    }

    /// Allocate one region from the bin, refilling `runcur` as needed.
    /// Returns the region address.
    fn malloc_bin(&mut self, arena: *const Arena, bin_ix: usize) -> Option<usize> {
        let runcur = self.bins[bin_ix].runcur;
        let run_addr = match runcur {
            Some(addr) if self.run_nfree(addr) > 0 => addr,
            _ => {
                let addr = self.get_non_full_bin_run(arena, bin_ix)?;
                self.bins[bin_ix].runcur = Some(addr);
                addr
            }
        };

        let (reg_size, reg0_offset, mask_nelms) = {
            let bin = &self.bins[bin_ix];
            (bin.reg_size, bin.reg0_offset as usize, bin.mask_nelms)
        };
        // Safety: arena lock held.
        let chunk = unsafe { chunk_at(map::chunk_base(run_addr)) };
        let run_ind = map::page_index(chunk.base, run_addr);
        let run = chunk.runs.get_mut(&run_ind).expect("current run missing its header");
        debug_assert!(run.nfree > 0);

        let regind = run_reg_alloc(run, mask_nelms);
        run.nfree -= 1;
        #[cfg(debug_assertions)]
        run.freed.set(regind as usize, false);

        Some(run_addr + reg0_offset + reg_size * regind as usize)
    }

    fn dalloc_small(&mut self, chunk_base: usize, ptr: usize, mapelm: MapEntry) {
        let run_addr = mapelm.run_addr();
        // Safety: arena lock held.
        let chunk = unsafe { chunk_at(chunk_base) };
        let run_ind = map::page_index(chunk_base, run_addr);

        let (bin_ix, nfree_after, nregs, size) = {
            let run = chunk
                .runs
                .get_mut(&run_ind)
                .expect("freed pointer's run missing its header");
            let bin_ix = run.bin_ix;
            let (reg_size, reg0_offset, nregs) = {
                let bin = &self.bins[bin_ix];
                (bin.reg_size, bin.reg0_offset as usize, bin.nregs)
            };
            assert!(ptr >= run_addr + reg0_offset, "free of run header address");
            let diff = ptr - run_addr - reg0_offset;

            options::poison_fill(ptr, reg_size);

            run_reg_dalloc(run, diff, reg_size, nregs);
            run.nfree += 1;
            (bin_ix, run.nfree, nregs, reg_size)
        };

        if nfree_after == nregs {
            // The run is completely freed.
            if self.bins[bin_ix].runcur == Some(run_addr) {
                self.bins[bin_ix].runcur = None;
            } else if nregs != 1 {
                // A one-region run never enters the non-full tree.
                let removed = self.bins[bin_ix].runs.remove(&run_addr);
                debug_assert!(removed);
            }
            self.dalloc_run(run_addr, true);
            self.bins[bin_ix].curruns -= 1;
        } else if nfree_after == 1 && Some(run_addr) != self.bins[bin_ix].runcur {
            // The run went from full to non-full.  Keep runcur as the lowest
            // non-full run.
            match self.bins[bin_ix].runcur {
                None => self.bins[bin_ix].runcur = Some(run_addr),
                Some(runcur) if run_addr < runcur => {
                    if self.run_nfree(runcur) > 0 {
                        self.bins[bin_ix].runs.insert(runcur);
                    }
                    self.bins[bin_ix].runcur = Some(run_addr);
                }
                Some(_) => {
                    self.bins[bin_ix].runs.insert(run_addr);
                }
            }
        }
        self.stats.allocated_small -= size;
    }

    fn dalloc_large(&mut self, chunk_base: usize, ptr: usize) {
        debug_assert_eq!(ptr & PAGE_MASK, 0);
        let size = {
            // Safety: arena lock held.
            let chunk = unsafe { chunk_at(chunk_base) };
            let pageind = map::page_index(chunk_base, ptr);
            chunk.map[pageind].size()
        };
        options::poison_fill(ptr, size);
        self.stats.allocated_large -= size;
        self.dalloc_run(ptr, true);
    }

    /// Release dirty pages to the OS until `ndirty` drops to half the cap
    /// (or nearly zero when `all`), most recently dirtied chunks first.
    fn purge(&mut self, all: bool) {
        let dirty_max = if all { 1 } else { self.max_dirty };
        #[cfg(debug_assertions)]
        {
            let mut total = 0;
            for &base in &self.chunks_dirty {
                // Safety: arena lock held.
                total += unsafe { chunk_at(base) }.ndirty;
            }
            debug_assert_eq!(total, self.ndirty);
        }
        debug_assert!(all || self.ndirty > self.max_dirty);

        while self.ndirty > (dirty_max >> 1) {
            let mut madvised = false;
            let &chunk_base = self
                .chunks_dirty
                .iter()
                .next_back()
                .expect("dirty count out of sync with the dirty chunk tree");
            // Safety: arena lock held.
            let chunk = unsafe { chunk_at(chunk_base) };
            debug_assert!(chunk.ndirty > 0);

            let free_operation = if vm::purge_strategy() == PurgeStrategy::Decommit {
                MAP_DECOMMITTED
            } else {
                MAP_MADVISED
            };

            let mut i = CHUNK_NPAGES - 1;
            while chunk.ndirty > 0 {
                debug_assert!(i >= CHUNK_HEADER_NPAGES);
                if chunk.map[i].is(MAP_DIRTY) {
                    debug_assert!(!chunk.map[i].is(MAP_MADVISED_OR_DECOMMITTED));
                    chunk.map[i].0 ^= free_operation | MAP_DIRTY;
                    // Extend to the adjacent dirty run below.
                    let mut npages = 1;
                    while i > CHUNK_HEADER_NPAGES && chunk.map[i - 1].is(MAP_DIRTY) {
                        i -= 1;
                        debug_assert!(!chunk.map[i].is(MAP_MADVISED_OR_DECOMMITTED));
                        chunk.map[i].0 ^= free_operation | MAP_DIRTY;
                        npages += 1;
                    }
                    chunk.ndirty -= npages;
                    self.ndirty -= npages;

                    let addr = chunk_base + (i << PAGE_2POW);
                    let len = npages << PAGE_2POW;
                    if vm::purge_strategy() == PurgeStrategy::Decommit {
                        vm::decommit(addr, len);
                    } else {
                        vm::purge(addr, len, false);
                        madvised = true;
                    }
                    self.stats.committed -= npages;

                    if self.ndirty <= (dirty_max >> 1) {
                        break;
                    }
                }
                i -= 1;
            }

            if chunk.ndirty == 0 {
                self.chunks_dirty.remove(&chunk_base);
            }
            if vm::double_purge() && madvised {
                // The chunk might already be in the list; make sure it moves
                // to the front.
                if let Some(pos) = self.chunks_madvised.iter().position(|&c| c == chunk_base) {
                    self.chunks_madvised.remove(pos);
                }
                self.chunks_madvised.push_front(chunk_base);
            }
        }
    }
}

impl Arena {
    pub(crate) fn new(id: u32, max_dirty: usize) -> Arena {
        let mut bins = Vec::with_capacity(NBINS);
        let mut prev_run_size = PAGE_SIZE;
        for i in 0..NBINS {
            let reg_size = classes::bin_reg_size(i);
            let layout = classes::bin_run_size_calc(reg_size, prev_run_size);
            prev_run_size = layout.run_size;
            bins.push(Bin {
                reg_size,
                run_size: layout.run_size,
                nregs: layout.nregs,
                mask_nelms: layout.mask_nelms,
                reg0_offset: layout.reg0_offset,
                runcur: None,
                runs: BTreeSet::new(),
                curruns: 0,
            });
        }
        Arena {
            id,
            inner: Mutex::new(ArenaInner {
                chunks_dirty: BTreeSet::new(),
                chunks_madvised: VecDeque::new(),
                spare: None,
                runs_avail: BTreeSet::new(),
                ndirty: 0,
                max_dirty,
                bins: bins.into_boxed_slice(),
                stats: ArenaStats::default(),
            }),
        }
    }

    pub(crate) fn malloc(&self, size: usize, zero: bool) -> Option<NonNull<u8>> {
        debug_assert!(size != 0);
        debug_assert!(classes::quantum_ceiling(size) <= ARENA_MAXCLASS);
        if size <= BIN_MAXCLASS {
            self.malloc_small(size, zero)
        } else {
            self.malloc_large(size, zero)
        }
    }

    fn malloc_small(&self, size: usize, zero: bool) -> Option<NonNull<u8>> {
        let size = classes::small_class_size(size);
        let bin_ix = classes::bin_index(size);

        let mut inner = self.inner.lock().unwrap();
        debug_assert_eq!(inner.bins[bin_ix].reg_size, size);
        let ret = inner.malloc_bin(self as *const Arena, bin_ix)?;
        inner.stats.allocated_small += size;
        drop(inner);

        if zero {
            // Safety: the region was just carved out for this caller.
            unsafe { std::ptr::write_bytes(ret as *mut u8, 0, size) };
        } else {
            options::junk_fill(ret, size);
        }
        NonNull::new(ret as *mut u8)
    }

    fn malloc_large(&self, size: usize, zero: bool) -> Option<NonNull<u8>> {
        let size = classes::page_ceiling(size);
        let mut inner = self.inner.lock().unwrap();
        let ret = inner.alloc_run(self as *const Arena, size, true, zero)?;
        inner.stats.allocated_large += size;
        drop(inner);

        if !zero {
            options::junk_fill(ret, size);
        }
        NonNull::new(ret as *mut u8)
    }

    /// Large allocation with more than page alignment: over-allocate, then
    /// trim the misaligned head and the excess tail.
    pub(crate) fn palloc(
        &self,
        alignment: usize,
        size: usize,
        alloc_size: usize,
    ) -> Option<NonNull<u8>> {
        debug_assert_eq!(size & PAGE_MASK, 0);
        debug_assert_eq!(alignment & PAGE_MASK, 0);

        let mut inner = self.inner.lock().unwrap();
        let run = inner.alloc_run(self as *const Arena, alloc_size, true, false)?;
        let chunk_base = map::chunk_base(run);

        let offset = run & (alignment - 1);
        debug_assert_eq!(offset & PAGE_MASK, 0);
        debug_assert!(offset < alloc_size);
        let ret;
        if offset == 0 {
            ret = run;
            inner.trim_run_tail(chunk_base, run, alloc_size, size, false);
        } else {
            let leadsize = alignment - offset;
            ret = run + leadsize;
            inner.trim_run_head(chunk_base, run, alloc_size, alloc_size - leadsize);
            let trailsize = alloc_size - leadsize - size;
            if trailsize != 0 {
                inner.trim_run_tail(chunk_base, ret, size + trailsize, size, false);
            }
        }
        inner.stats.allocated_large += size;
        drop(inner);

        options::junk_fill(ret, size);
        debug_assert_eq!(ret & (alignment - 1), 0);
        NonNull::new(ret as *mut u8)
    }

    /// Shrink a large allocation in place, freeing the tail pages.
    pub(crate) fn ralloc_shrink_large(
        &self,
        chunk_base: usize,
        ptr: usize,
        size: usize,
        oldsize: usize,
    ) {
        debug_assert!(size < oldsize);
        let mut inner = self.inner.lock().unwrap();
        inner.trim_run_tail(chunk_base, ptr, oldsize, size, true);
        inner.stats.allocated_large -= oldsize - size;
    }

    /// Try to grow a large allocation into the following free run.  Returns
    /// whether the allocation now spans `size` bytes.
    pub(crate) fn ralloc_grow_large(
        &self,
        chunk_base: usize,
        ptr: usize,
        size: usize,
        oldsize: usize,
    ) -> bool {
        debug_assert!(size > oldsize);
        let mut inner = self.inner.lock().unwrap();
        let pageind = map::page_index(chunk_base, ptr);
        let npages = oldsize >> PAGE_2POW;
        {
            // Safety: arena lock held.
            let chunk = unsafe { chunk_at(chunk_base) };
            debug_assert_eq!(oldsize, chunk.map[pageind].size());

            let next = pageind + npages;
            if !(next < CHUNK_NPAGES
                && !chunk.map[next].is(MAP_ALLOCATED)
                && chunk.map[next].size() >= size - oldsize)
            {
                return false;
            }
        }

        // The next run is free and big enough.  Split the part we need off
        // its front and merge it into the allocation.
        inner.split_run(ptr + oldsize, size - oldsize, true, false);
        {
            // Safety: arena lock held.
            let chunk = unsafe { chunk_at(chunk_base) };
            chunk.map[pageind] = MapEntry(size | MAP_LARGE | MAP_ALLOCATED);
            chunk.map[pageind + npages] = MapEntry(MAP_LARGE | MAP_ALLOCATED);
        }
        inner.stats.allocated_large += size - oldsize;
        true
    }

    /// Size of the allocation at `ptr`, which must be a live arena pointer.
    pub(crate) fn salloc(&self, ptr: usize) -> usize {
        let inner = self.inner.lock().unwrap();
        let chunk_base = map::chunk_base(ptr);
        // Safety: arena lock held.
        let chunk = unsafe { chunk_at(chunk_base) };
        let pageind = map::page_index(chunk_base, ptr);
        let mapbits = chunk.map[pageind];
        assert!(mapbits.is(MAP_ALLOCATED), "size query for unallocated address");
        if !mapbits.is(MAP_LARGE) {
            let run_ind = map::page_index(chunk_base, mapbits.run_addr());
            let run = &chunk.runs[&run_ind];
            inner.bins[run.bin_ix].reg_size
        } else {
            let size = mapbits.size();
            debug_assert!(size != 0);
            size
        }
    }

    pub(crate) fn purge_all(&self) {
        self.inner.lock().unwrap().purge(true);
    }

    /// Force lazily purged pages out of memory via a decommit/commit cycle.
    pub(crate) fn hard_purge(&self) {
        let mut inner = self.inner.lock().unwrap();
        while let Some(chunk_base) = inner.chunks_madvised.pop_front() {
            // Safety: arena lock held.
            let chunk = unsafe { chunk_at(chunk_base) };
            let mut i = CHUNK_HEADER_NPAGES;
            while i < CHUNK_NPAGES {
                // Find the adjacent lazily-purged group starting at i.
                let mut npages = 0;
                while i + npages < CHUNK_NPAGES && chunk.map[i + npages].is(MAP_MADVISED) {
                    debug_assert!(!chunk.map[i + npages].is(MAP_DECOMMITTED));
                    chunk.map[i + npages].0 ^= MAP_MADVISED_OR_DECOMMITTED;
                    npages += 1;
                }
                if npages > 0 {
                    let addr = chunk_base + (i << PAGE_2POW);
                    vm::decommit(addr, npages << PAGE_2POW);
                    vm::commit(addr, npages << PAGE_2POW);
                }
                i += npages + 1;
            }
        }
    }

    /// Dirty page count, for the purge policy's observers.
    pub(crate) fn dirty_pages(&self) -> usize {
        self.inner.lock().unwrap().ndirty
    }

    /// (stats, ndirty, bin_unused bytes, run header bytes) under one lock
    /// acquisition, for aggregate reporting.
    pub(crate) fn stats_snapshot(&self) -> (ArenaStats, usize, usize, usize) {
        let inner = self.inner.lock().unwrap();
        let mut bin_unused = 0;
        let mut headers = 0;
        for bin in inner.bins.iter() {
            for &run_addr in &bin.runs {
                bin_unused += inner.run_nfree(run_addr) as usize * bin.reg_size;
            }
            if let Some(runcur) = bin.runcur {
                bin_unused += inner.run_nfree(runcur) as usize * bin.reg_size;
            }
            headers += bin.curruns * bin.reg0_offset as usize;
        }
        (inner.stats, inner.ndirty, bin_unused, headers)
    }
}

/// Owning arena of a registered arena chunk, if any.
pub(crate) fn arena_of(chunk_base: usize) -> Option<&'static Arena> {
    let val = radix::chunk_rtree().get(chunk_base);
    if val == 0 || val == radix::HUGE_CHUNK_OWNER {
        return None;
    }
    // Safety: live arena chunks keep their record until unregistered, and the
    // owning arena is never destroyed while its chunks exist.
    Some(unsafe { &*(*(val as *const ArenaChunk)).arena })
}

/// Classify an address within an arena chunk for `ptr_info`.
pub(crate) fn ptr_info_arena(ptr: usize) -> crate::heap::api::PtrInfo {
    use crate::heap::api::{PtrInfo, PtrTag};
    const UNKNOWN: PtrInfo = PtrInfo {
        tag: PtrTag::Unknown,
        addr: std::ptr::null_mut(),
        size: 0,
    };

    let chunk_base = map::chunk_base(ptr);
    let Some(arena) = arena_of(chunk_base) else {
        return UNKNOWN;
    };
    let inner = arena.inner.lock().unwrap();
    // Safety: arena lock held.
    let chunk = unsafe { chunk_at(chunk_base) };

    let mut pageind = map::page_index(chunk_base, ptr);
    if pageind < CHUNK_HEADER_NPAGES {
        // Within the reserved chunk header.
        return UNKNOWN;
    }

    let mut mapbits = chunk.map[pageind];
    if !mapbits.is(MAP_ALLOCATED) {
        let tag = if mapbits.is(MAP_DIRTY) {
            PtrTag::FreedPageDirty
        } else if mapbits.is(MAP_DECOMMITTED) {
            PtrTag::FreedPageDecommitted
        } else if mapbits.is(MAP_MADVISED) {
            PtrTag::FreedPageMadvised
        } else if mapbits.is(MAP_ZEROED) {
            PtrTag::FreedPageZeroed
        } else {
            panic!("chunk map entry for freed page carries no state");
        };
        let pageaddr = ptr & !PAGE_MASK;
        return PtrInfo {
            tag,
            addr: pageaddr as *mut u8,
            size: PAGE_SIZE,
        };
    }

    if mapbits.is(MAP_LARGE) {
        // Only the first page of a large allocation records the size, so
        // interior pointers scan back to it.
        loop {
            let size = mapbits.size();
            if size != 0 {
                let addr = chunk_base + (pageind << PAGE_2POW);
                return PtrInfo {
                    tag: PtrTag::LiveLarge,
                    addr: addr as *mut u8,
                    size,
                };
            }
            pageind -= 1;
            if pageind < CHUNK_HEADER_NPAGES {
                return UNKNOWN;
            }
            mapbits = chunk.map[pageind];
            if !mapbits.is(MAP_LARGE) {
                return UNKNOWN;
            }
        }
    }

    // A small allocation.
    let run_addr = mapbits.run_addr();
    let run_ind = map::page_index(chunk_base, run_addr);
    let run = &chunk.runs[&run_ind];
    let bin = &inner.bins[run.bin_ix];
    let size = bin.reg_size;

    let reg0_addr = run_addr + bin.reg0_offset as usize;
    if ptr < reg0_addr {
        // In the run header.
        return UNKNOWN;
    }
    let regind = (ptr - reg0_addr) / size;
    let addr = reg0_addr + regind * size;
    let elm = regind >> 5;
    let bit = regind & 31;
    let tag = if run.regs_mask[elm] & (1 << bit) != 0 {
        PtrTag::FreedSmall
    } else {
        PtrTag::LiveSmall
    };
    PtrInfo {
        tag,
        addr: addr as *mut u8,
        size,
    }
}

/// Free an arena pointer; `offset` is its nonzero offset within the chunk.
pub(crate) fn arena_dalloc(ptr: usize, offset: usize) {
    debug_assert!(offset != 0);
    debug_assert_eq!(map::chunk_offset(ptr), offset);
    let chunk_base = ptr - offset;

    let val = radix::chunk_rtree().get(chunk_base);
    assert!(
        val != 0 && val != radix::HUGE_CHUNK_OWNER,
        "free of unowned pointer {ptr:#x}"
    );
    // Safety: live arena chunks keep their record until unregistered, and the
    // owning arena is never destroyed while its chunks exist.
    let arena = unsafe { &*(*(val as *const ArenaChunk)).arena };

    let mut inner = arena.inner.lock().unwrap();
    let pageind = offset >> PAGE_2POW;
    // Safety: arena lock held.
    let mapelm = unsafe { chunk_at(chunk_base) }.map[pageind];
    assert!(
        mapelm.is(MAP_ALLOCATED),
        "free of unallocated address {ptr:#x}"
    );
    if !mapelm.is(MAP_LARGE) {
        inner.dalloc_small(chunk_base, ptr, mapelm);
    } else {
        inner.dalloc_large(chunk_base, ptr);
    }
}

#[cfg(all(test, not(loom), not(miri)))]
mod tests {
    use super::*;

    fn test_arena() -> &'static Arena {
        Box::leak(Box::new(Arena::new(u32::MAX, 256)))
    }

    #[test]
    fn test_small_alloc_free_cycle() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let arena = test_arena();
        let p = arena.malloc(1, false).unwrap().as_ptr() as usize;
        assert_eq!(arena.salloc(p), classes::good_size(1));
        // The chunk map routes the pointer back to this arena.
        let chunk_base = map::chunk_base(p);
        let val = radix::chunk_rtree().get(chunk_base);
        assert!(val != 0 && val != radix::HUGE_CHUNK_OWNER);
        arena_dalloc(p, map::chunk_offset(p));
        // The chunk is now the arena's spare.
        let inner = arena.inner.lock().unwrap();
        assert!(inner.spare.is_some());
        assert_eq!(inner.stats.allocated_small, 0);
    }

    #[test]
    fn test_small_regions_distinct() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let arena = test_arena();
        let mut seen = std::collections::BTreeSet::new();
        let mut ptrs = Vec::new();
        for _ in 0..500 {
            let p = arena.malloc(48, false).unwrap().as_ptr() as usize;
            assert!(seen.insert(p), "region {p:#x} handed out twice");
            ptrs.push(p);
        }
        // Regions are region-size aligned relative to each other.
        for w in ptrs.windows(2) {
            assert!(w[0].abs_diff(w[1]) >= 48);
        }
        for p in ptrs {
            arena_dalloc(p, map::chunk_offset(p));
        }
    }

    #[test]
    fn test_large_alloc_size_recorded() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let arena = test_arena();
        let p = arena.malloc(3 * PAGE_SIZE + 1, false).unwrap().as_ptr() as usize;
        assert_eq!(p & PAGE_MASK, 0);
        assert_eq!(arena.salloc(p), 4 * PAGE_SIZE);
        arena_dalloc(p, map::chunk_offset(p));
    }

    #[test]
    fn test_free_marks_dirty_and_purge_clears() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let arena = test_arena();
        let p = arena.malloc(16 * PAGE_SIZE, false).unwrap().as_ptr() as usize;
        arena_dalloc(p, map::chunk_offset(p));
        assert!(arena.dirty_pages() > 0);
        arena.purge_all();
        assert_eq!(arena.dirty_pages(), 0);
    }

    #[test]
    fn test_runcur_is_lowest_nonfull() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let arena = test_arena();
        let bin_ix = classes::bin_index(64);
        let nregs = {
            let inner = arena.inner.lock().unwrap();
            inner.bins[bin_ix].nregs as usize
        };
        // Fill two whole runs.
        let mut ptrs = Vec::new();
        for _ in 0..2 * nregs {
            ptrs.push(arena.malloc(64, false).unwrap().as_ptr() as usize);
        }
        // Free one region in the higher run, then one in the lower: runcur
        // must follow the lower address.
        let hi = *ptrs.iter().max().unwrap();
        let lo = *ptrs.iter().min().unwrap();
        arena_dalloc(hi, map::chunk_offset(hi));
        arena_dalloc(lo, map::chunk_offset(lo));
        {
            let inner = arena.inner.lock().unwrap();
            let runcur = inner.bins[bin_ix].runcur.unwrap();
            for &other in &inner.bins[bin_ix].runs {
                assert!(runcur < other);
            }
        }
        for &p in &ptrs {
            if p != hi && p != lo {
                arena_dalloc(p, map::chunk_offset(p));
            }
        }
    }
}
