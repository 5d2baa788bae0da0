//! Synchronization primitives, routed through one module so the loom build
//! can swap in its model-checked versions.
//!
//! Everything re-exports std by default and loom under `cfg(loom)`.  Code
//! elsewhere in the crate must not name `std::sync` primitives directly: a
//! stray std atomic would be invisible to the loom scheduler and quietly
//! weaken the models in `heap/loom_tests.rs`.
#![allow(unused_imports, unused_macros)]

pub(crate) mod atomic {
    #[cfg(not(loom))]
    pub(crate) use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};

    #[cfg(loom)]
    pub(crate) use loom::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
}

#[cfg(not(loom))]
pub(crate) use std::sync::{Arc, Mutex, MutexGuard, RwLock};

#[cfg(loom)]
pub(crate) use loom::sync::{Arc, Mutex, MutexGuard, RwLock};

// The singleton registries (base, chunk cache, huge registry, arena
// directory) outlive any single loom execution, and loom cannot model state
// that crosses executions.  Their locks therefore stay std under every cfg;
// the cross-thread orderings worth modeling all go through the atomics
// above.
pub(crate) mod unmodeled {
    pub(crate) use std::sync::{Mutex, MutexGuard};
}

pub(crate) mod thread {
    #[cfg(not(loom))]
    pub(crate) use std::thread::spawn;

    #[cfg(loom)]
    pub(crate) use loom::thread::spawn;
}

// Barrier only appears in tests that are compiled out under loom.
#[cfg(not(loom))]
pub(crate) mod barrier {
    pub(crate) use std::sync::Barrier;
}

// loom has no OnceLock.  A mutex-protected Option covers the one-shot
// initialization this crate needs, and the inner mutex is std on purpose:
// these singletons live in statics, and loom's Mutex is neither
// const-constructible nor allowed to survive between executions.  Handing
// out `&T` from behind the mutex is sound because the slot is write-once and
// nothing is dropped while the OnceLock is borrowed.
#[cfg(not(loom))]
pub(crate) use std::sync::OnceLock;

#[cfg(loom)]
pub(crate) struct OnceLock<T>(std::sync::Mutex<Option<T>>);

#[cfg(loom)]
impl<T> OnceLock<T> {
    pub(crate) const fn new() -> Self {
        Self(std::sync::Mutex::new(None))
    }

    pub(crate) fn get(&self) -> Option<&T> {
        let slot = self.0.lock().unwrap();
        slot.as_ref().map(|value| {
            let ptr: *const T = value;
            // Safety: write-once slot; the value outlives &self.
            unsafe { &*ptr }
        })
    }

    pub(crate) fn get_or_init<F: FnOnce() -> T>(&self, init: F) -> &T {
        let mut slot = self.0.lock().unwrap();
        if slot.is_none() {
            *slot = Some(init());
        }
        let ptr: *const T = slot.as_ref().unwrap();
        // Safety: write-once slot; the value outlives &self.
        unsafe { &*ptr }
    }
}

#[cfg(loom)]
// Safety: every access is serialised by the inner mutex.
unsafe impl<T: Send> Sync for OnceLock<T> {}

/// Declare a static synchronization object that builds under both cfgs:
/// const initialization normally, `loom::lazy_static!` under loom so the
/// value is rebuilt for each model execution.
///
/// Usage: `loom_static! { [pub] static NAME: Type = init_expr; }`
macro_rules! loom_static {
    ($vis:vis static $NAME:ident : $Ty:ty = $init:expr ;) => {
        #[cfg(not(loom))]
        $vis static $NAME: $Ty = $init;

        #[cfg(loom)]
        loom::lazy_static! {
            $vis static ref $NAME: $Ty = $init;
        }
    };
}
pub(crate) use loom_static;
