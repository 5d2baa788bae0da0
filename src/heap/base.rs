//! Base sub-allocator for internal metadata.
//!
//! Serves cacheline-rounded bump allocations out of dedicated chunks mapped
//! straight from the VM shim.  Base chunks are never registered in the owner
//! index and never freed; under the decommit purge strategy the unused tail
//! of the current chunk is kept decommitted and committed on demand.

use crate::heap::classes::{cacheline_ceiling, chunk_ceiling, page_ceiling, CHUNKSIZE};
use crate::heap::vm::{self, PurgeStrategy};
use crate::sync::unmodeled::Mutex;
use crate::sync::OnceLock;
use std::ptr::NonNull;

pub(crate) struct BaseState {
    next: usize,
    past: usize,
    next_decommitted: usize,
    mapped: usize,
    committed: usize,
}

static BASE: OnceLock<Mutex<BaseState>> = OnceLock::new();

pub(crate) fn base_mutex() -> &'static Mutex<BaseState> {
    BASE.get_or_init(|| {
        Mutex::new(BaseState {
            next: 0,
            past: 0,
            next_decommitted: 0,
            mapped: 0,
            committed: 0,
        })
    })
}

fn base_pages_alloc(st: &mut BaseState, minsize: usize) -> Option<()> {
    debug_assert!(minsize != 0);
    let csize = chunk_ceiling(minsize);
    let addr = vm::map(csize, CHUNKSIZE)?;
    st.next = addr;
    st.past = addr + csize;
    // Leave enough pages for minsize committed, since otherwise they would
    // have to be immediately recommitted.
    let pminsize = page_ceiling(minsize);
    st.next_decommitted = addr + pminsize;
    if vm::purge_strategy() == PurgeStrategy::Decommit && pminsize < csize {
        vm::decommit(st.next_decommitted, csize - pminsize);
    }
    st.mapped += csize;
    st.committed += pminsize;
    Some(())
}

/// Allocate `size` bytes of metadata memory, rounded up to a cacheline
/// multiple.  The memory is never freed.
pub(crate) fn base_alloc(size: usize) -> Option<NonNull<u8>> {
    let csize = cacheline_ceiling(size);

    let mut st = base_mutex().lock().unwrap();
    if st.next + csize > st.past {
        base_pages_alloc(&mut st, csize)?;
    }
    let ret = st.next;
    st.next += csize;
    if st.next > st.next_decommitted {
        let pnext = page_ceiling(st.next);
        let delta = pnext - st.next_decommitted;
        if vm::purge_strategy() == PurgeStrategy::Decommit {
            vm::commit(st.next_decommitted, delta);
        }
        st.next_decommitted = pnext;
        st.committed += delta;
    }
    NonNull::new(ret as *mut u8)
}

/// (mapped, committed) byte totals for stats reporting.
pub(crate) fn base_stats() -> (usize, usize) {
    let st = base_mutex().lock().unwrap();
    (st.mapped, st.committed)
}
