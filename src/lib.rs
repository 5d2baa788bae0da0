#[cfg(not(target_pointer_width = "64"))]
compile_error!("arenalloc requires a 64-bit target: chunk map words pack an address and flags into one machine word.");

pub(crate) mod sync;

// Implementation tree; everything inside is pub(crate) and surfaces only
// through the re-exports below.
pub mod heap;

// allocation entry points
pub use heap::api::{
    aligned_alloc, calloc, create_arena, dispose_arena, free, free_dirty_pages, malloc,
    malloc_good_size, malloc_usable_size, memalign, posix_memalign, purge_freed_pages, realloc,
    stats, thread_local_arena, valloc,
};
pub use heap::api::{arena_calloc, arena_malloc, arena_memalign, arena_realloc};
pub use heap::api::{ptr_info, PtrInfo, PtrTag, Stats};

// fork protection
pub use heap::arenas::{postfork_child, postfork_parent, prefork, ForkGuard};
pub use heap::arenas::ArenaId;

// errors
pub use heap::vm::VmError;
