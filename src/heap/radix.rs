//! Chunk-owner radix tree.
//!
//! Maps any chunk-aligned address to the owning chunk record with a fixed
//! number of indirections.  `get` is lockless: readers walk acquire-loaded
//! slots and treat a zero anywhere as "not owned".  `set`/`unset` are
//! serialised by an internal mutex and publish with release stores, so a
//! reader that observes a published value also observes the record it points
//! to.  Node memory comes from the base sub-allocator; this structure must
//! never re-enter the user allocator.

use crate::heap::base;
use crate::heap::classes::CHUNK_2POW;
use crate::sync::atomic::{AtomicUsize, Ordering};
use crate::sync::{Mutex, OnceLock};

/// Leaf value marking the first chunk of a huge allocation; details live in
/// the huge registry.
pub(crate) const HUGE_CHUNK_OWNER: usize = 1;

// Significant address bits above chunk granularity.
const BITS: usize = (usize::BITS as usize) - CHUNK_2POW;
const LEVEL_BITS: usize = 11;
const HEIGHT: usize = 4;
// The first level absorbs the remainder so the per-level bits sum to BITS.
const BITS_AT_LEVEL1: usize = BITS - (HEIGHT - 1) * LEVEL_BITS;

const _: () = assert!(BITS_AT_LEVEL1 + (HEIGHT - 1) * LEVEL_BITS == BITS);
const _: () = assert!(BITS_AT_LEVEL1 > 0 && BITS_AT_LEVEL1 <= LEVEL_BITS);

pub(crate) struct AddressRadixTree {
    root: *mut AtomicUsize,
    lock: Mutex<()>,
}

// Safety: the raw node pointers are only ever read through atomics and all
// mutation is serialised by the internal lock.
unsafe impl Send for AddressRadixTree {}
unsafe impl Sync for AddressRadixTree {}

impl AddressRadixTree {
    pub(crate) fn new() -> Option<Self> {
        Some(Self {
            root: Self::alloc_node(BITS_AT_LEVEL1)?,
            lock: Mutex::new(()),
        })
    }

    #[cfg(not(loom))]
    fn alloc_node(bits: usize) -> Option<*mut AtomicUsize> {
        let slots = 1usize << bits;
        let bytes = slots * core::mem::size_of::<AtomicUsize>();
        let mem = base::base_alloc(bytes)?;
        // Safety: the node is private until a release store publishes it;
        // AtomicUsize has the same in-memory representation as usize.
        unsafe { std::ptr::write_bytes(mem.as_ptr(), 0, bytes) };
        Some(mem.as_ptr() as *mut AtomicUsize)
    }

    // loom's AtomicUsize is not representation-compatible with usize, so the
    // modeled build constructs nodes properly and leaks them.
    #[cfg(loom)]
    fn alloc_node(bits: usize) -> Option<*mut AtomicUsize> {
        let slots = 1usize << bits;
        let v: Vec<AtomicUsize> = (0..slots).map(|_| AtomicUsize::new(0)).collect();
        Some(Box::leak(v.into_boxed_slice()).as_mut_ptr())
    }

    fn get_slot(&self, key: usize, create: bool) -> Option<*const AtomicUsize> {
        let mut node = self.root;
        let mut lshift = 0;
        for i in 0..HEIGHT - 1 {
            let bits = if i == 0 { BITS_AT_LEVEL1 } else { LEVEL_BITS };
            let subkey = (key << lshift) >> (usize::BITS as usize - bits);
            lshift += bits;
            // Safety: subkey is in range for the node's slot count.
            let slot = unsafe { &*node.add(subkey) };
            let mut child = slot.load(Ordering::Acquire);
            if child == 0 {
                if !create {
                    return None;
                }
                let newc = Self::alloc_node(LEVEL_BITS)?;
                slot.store(newc as usize, Ordering::Release);
                child = newc as usize;
            }
            node = child as *mut AtomicUsize;
        }
        let subkey = (key << lshift) >> (usize::BITS as usize - LEVEL_BITS);
        // Safety: subkey is in range for the leaf node's slot count.
        Some(unsafe { node.add(subkey) as *const AtomicUsize })
    }

    /// Lockless lookup; 0 means the chunk is not owned.
    pub(crate) fn get(&self, key: usize) -> usize {
        match self.get_slot(key, false) {
            // Safety: slot points into a live node.
            Some(slot) => unsafe { (*slot).load(Ordering::Acquire) },
            None => 0,
        }
    }

    /// Returns whether the value was properly set.
    pub(crate) fn set(&self, key: usize, value: usize) -> bool {
        let _guard = self.lock.lock().unwrap();
        match self.get_slot(key, true) {
            Some(slot) => {
                // Safety: slot points into a live node.
                unsafe { (*slot).store(value, Ordering::Release) };
                true
            }
            None => false,
        }
    }

    pub(crate) fn unset(&self, key: usize) -> bool {
        self.set(key, 0)
    }

    /// Hold the tree's write lock, for fork protection.
    pub(crate) fn lock(&self) -> crate::sync::MutexGuard<'_, ()> {
        self.lock.lock().unwrap()
    }
}

static CHUNK_RTREE: OnceLock<AddressRadixTree> = OnceLock::new();

pub(crate) fn chunk_rtree() -> &'static AddressRadixTree {
    CHUNK_RTREE.get_or_init(|| {
        AddressRadixTree::new().expect("failed to initialize the chunk owner index")
    })
}
