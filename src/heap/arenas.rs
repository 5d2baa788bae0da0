//! Arena directory, per-thread arena binding and process-wide init.
//!
//! Arenas are id-keyed in a process-wide ordered map behind the directory
//! lock.  Each thread remembers its preferred arena in a lazily-initialized
//! thread-local slot; the default is the main arena created on first use.

use crate::heap::arena::{Arena, ArenaInner};
use crate::heap::base::{self, BaseState};
use crate::heap::chunk_cache::{self, ChunkCache};
use crate::heap::huge::{self, HugeRegistry};
use crate::heap::options;
use crate::heap::radix;
use crate::heap::vm;
use crate::sync::unmodeled;
use crate::sync::{MutexGuard, OnceLock};
use std::cell::Cell;
use std::collections::BTreeMap;

pub type ArenaId = u32;

// Arena records are placed in base memory, which is cacheline aligned.
const _: () = assert!(
    core::mem::align_of::<Arena>() <= crate::heap::classes::CACHELINE
);

pub(crate) struct Directory {
    tree: BTreeMap<ArenaId, &'static Arena>,
    next_id: ArenaId,
}

static DIRECTORY: OnceLock<unmodeled::Mutex<Directory>> = OnceLock::new();

fn directory() -> &'static unmodeled::Mutex<Directory> {
    DIRECTORY.get_or_init(|| {
        unmodeled::Mutex::new(Directory {
            tree: BTreeMap::new(),
            next_id: 0,
        })
    })
}

static MAIN_ARENA: OnceLock<&'static Arena> = OnceLock::new();

/// One-time global setup: sanity-check the page size, read the runtime
/// options, create the main arena and the owner index.
pub(crate) fn ensure_init() {
    MAIN_ARENA.get_or_init(|| {
        vm::check_kernel_page_size();
        let opts = options::options();
        radix::chunk_rtree();
        let arena = extend_inner().expect("failed to initialize the main arena");
        // Thread-local arenas run with a reduced dirty cap; the main arena
        // gets the full default.
        arena.inner.lock().unwrap().max_dirty = opts.dirty_max;
        arena
    });
}

pub(crate) fn initialized() -> bool {
    MAIN_ARENA.get().is_some()
}

fn main_arena() -> &'static Arena {
    ensure_init();
    MAIN_ARENA.get().unwrap()
}

fn extend_inner() -> Option<&'static Arena> {
    let opts = options::options();
    let mut dir = directory().lock().unwrap();
    let id = dir.next_id;

    // The record lives in base memory: arenas are never destroyed, and an
    // unlisted arena must stay valid for its remaining allocations.
    let mem = base::base_alloc(core::mem::size_of::<Arena>())?;
    let record = mem.as_ptr() as *mut Arena;
    // Safety: the base allocation is exclusively ours and suitably aligned.
    unsafe { record.write(Arena::new(id, opts.dirty_max >> 3)) };
    // Safety: the record is never moved or freed.
    let arena: &'static Arena = unsafe { &*record };

    dir.next_id += 1;
    dir.tree.insert(id, arena);
    Some(arena)
}

/// Create a new arena, falling back to the main arena when the metadata heap
/// cannot grow.
pub(crate) fn arenas_extend() -> &'static Arena {
    match extend_inner() {
        Some(arena) => arena,
        None => {
            eprintln!("arenalloc: error initializing arena; falling back to the main arena");
            main_arena()
        }
    }
}

thread_local! {
    static THREAD_ARENA: Cell<Option<&'static Arena>> = const { Cell::new(None) };
}

/// The calling thread's preferred arena, bound on first use.
pub(crate) fn choose_arena() -> &'static Arena {
    THREAD_ARENA.with(|slot| match slot.get() {
        Some(arena) => arena,
        None => {
            let arena = main_arena();
            slot.set(Some(arena));
            arena
        }
    })
}

/// Bind the calling thread to a fresh arena (`true`) or back to the main
/// arena (`false`).  A fresh arena created here is effectively retained for
/// the life of the process.
pub(crate) fn thread_local_arena(enable: bool) -> &'static Arena {
    ensure_init();
    let arena = if enable { arenas_extend() } else { main_arena() };
    THREAD_ARENA.with(|slot| slot.set(Some(arena)));
    arena
}

pub(crate) fn create_arena() -> ArenaId {
    ensure_init();
    arenas_extend().id
}

/// Unlist an arena.  Remaining allocations in it stay live and the arena
/// object is retained for them; it just stops being selectable.
pub(crate) fn dispose_arena(id: ArenaId) {
    let mut dir = directory().lock().unwrap();
    let removed = dir.tree.remove(&id);
    assert!(removed.is_some(), "dispose of unknown arena {id}");
}

pub(crate) fn get_by_id(id: ArenaId) -> &'static Arena {
    let dir = directory().lock().unwrap();
    dir.tree
        .get(&id)
        .copied()
        .unwrap_or_else(|| panic!("unknown arena id {id}"))
}

pub(crate) fn all_arenas() -> Vec<&'static Arena> {
    let dir = directory().lock().unwrap();
    dir.tree.values().copied().collect()
}

// ---------------------------------------------------------------------------
// Fork protection
// ---------------------------------------------------------------------------

/// Holds every heap lock across a fork.  Acquisition order: arena directory,
/// each arena in id order, base, chunk cache, huge registry, owner index.
/// Dropping the guard releases them in reverse.
pub struct ForkGuard {
    _rtree: MutexGuard<'static, ()>,
    _huge: unmodeled::MutexGuard<'static, HugeRegistry>,
    _cache: unmodeled::MutexGuard<'static, ChunkCache>,
    _base: unmodeled::MutexGuard<'static, BaseState>,
    _arenas: Vec<MutexGuard<'static, ArenaInner>>,
    _dir: unmodeled::MutexGuard<'static, Directory>,
}

/// Acquire all heap locks in a safe order before forking.
pub fn prefork() -> ForkGuard {
    ensure_init();
    let dir = directory().lock().unwrap();
    let arenas: Vec<_> = dir
        .tree
        .values()
        .map(|arena| arena.inner.lock().unwrap())
        .collect();
    let base = base::base_mutex().lock().unwrap();
    let cache = chunk_cache::cache_mutex().lock().unwrap();
    let huge = huge::huge_mutex().lock().unwrap();
    let rtree = radix::chunk_rtree().lock();
    ForkGuard {
        _rtree: rtree,
        _huge: huge,
        _cache: cache,
        _base: base,
        _arenas: arenas,
        _dir: dir,
    }
}

/// Release all heap locks in the parent after `fork()` has completed.
pub fn postfork_parent(guard: ForkGuard) {
    drop(guard);
}

/// Release the child's copies of all heap locks after `fork()`.  The child
/// inherits the locked state and this guard, so dropping it restores every
/// lock to a usable state without assuming anything about lock holders.
pub fn postfork_child(guard: ForkGuard) {
    drop(guard);
}

#[cfg(all(test, not(loom), not(miri)))]
mod tests {
    use super::*;

    #[test]
    fn test_main_arena_bound_by_default() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let a = choose_arena();
        let b = choose_arena();
        assert!(std::ptr::eq(a, b));
        assert!(std::ptr::eq(a, main_arena()));
    }

    #[test]
    fn test_thread_local_arena_binding() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        std::thread::spawn(|| {
            let fresh = thread_local_arena(true);
            assert!(!std::ptr::eq(fresh, main_arena()));
            assert!(std::ptr::eq(choose_arena(), fresh));
            let back = thread_local_arena(false);
            assert!(std::ptr::eq(back, main_arena()));
            assert!(std::ptr::eq(choose_arena(), back));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_create_and_dispose_arena() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let id = create_arena();
        let arena = get_by_id(id);
        assert_eq!(arena.id, id);
        assert!(all_arenas().iter().any(|a| a.id == id));
        dispose_arena(id);
        assert!(!all_arenas().iter().any(|a| a.id == id));
    }

    #[test]
    fn test_fork_guard_acquire_release() {
        let _guard = crate::heap::TEST_MUTEX.write().unwrap();
        ensure_init();
        let guard = prefork();
        postfork_parent(guard);
        // Locks are usable again.
        drop(main_arena().inner.lock().unwrap());
        let guard = prefork();
        postfork_child(guard);
        drop(main_arena().inner.lock().unwrap());
    }
}
