//! OS virtual-memory shim.
//!
//! Chunk-aligned mappings are obtained by optimistically mapping exactly the
//! requested amount and falling back to an over-sized mapping with the
//! leading/trailing excess trimmed.  `purge` returns physical backing to the
//! OS using one of three mutually exclusive strategies:
//!
//! - decommit: immediate physical release, pages are zero on recommit
//! - madvise-dontneed: pages are zeroed by the kernel on next touch
//! - madvise-free: lazy reclamation, contents are stale until reclaimed
//!
//! Under `cfg(any(loom, miri))` real syscalls are replaced by a heap-backed
//! mock: loom runs inside a single process with its own scheduler and Miri
//! cannot model page faults.  The mock only supports whole-mapping unmap,
//! which is all the lockless paths under test need.

use crate::heap::classes::{alignment_ceiling, CHUNKSIZE, PAGE_MASK, PAGE_SIZE};
use crate::heap::stats;
use std::fmt;

#[derive(Debug)]
pub enum VmError {
    MapFailed(std::io::Error),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::MapFailed(e) => write!(f, "VM mapping failed: {e}"),
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::MapFailed(e) => Some(e),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum PurgeStrategy {
    Decommit,
    MadviseFree,
    MadviseDontneed,
}

pub(crate) const fn purge_strategy() -> PurgeStrategy {
    if cfg!(windows) {
        PurgeStrategy::Decommit
    } else if cfg!(target_os = "macos") {
        PurgeStrategy::MadviseFree
    } else {
        PurgeStrategy::MadviseDontneed
    }
}

/// Whether lazily purged pages must be tracked for a later forced purge.
pub(crate) const fn double_purge() -> bool {
    matches!(purge_strategy(), PurgeStrategy::MadviseFree)
}

/// On platforms where unmap must match the original mapping, recycling is
/// restricted to whole-chunk sizes.
pub(crate) fn can_recycle(size: usize) -> bool {
    if cfg!(windows) {
        size == CHUNKSIZE
    } else {
        true
    }
}

/// Map `size` bytes aligned to `alignment`.  Returns the base address.
pub(crate) fn map(size: usize, alignment: usize) -> Option<usize> {
    debug_assert!(size != 0 && size & PAGE_MASK == 0);
    debug_assert!(alignment.is_power_of_two() && alignment >= PAGE_SIZE);

    let addr = sys::map_anon(size)?;
    let ret = if addr & (alignment - 1) == 0 {
        addr
    } else {
        // Misaligned; start over with an over-sized mapping.
        sys::unmap_raw(addr, size);
        map_slow(size, alignment)?
    };
    stats::TOTAL_MAPPED.add(size);
    Some(ret)
}

fn map_slow(size: usize, alignment: usize) -> Option<usize> {
    let alloc_size = size + alignment - PAGE_SIZE;
    if alloc_size < size {
        return None;
    }
    loop {
        let pages = sys::map_anon(alloc_size)?;
        let leadsize = alignment_ceiling(pages, alignment) - pages;
        if let Some(ret) = sys::trim(pages, alloc_size, leadsize, size) {
            return Some(ret);
        }
    }
}

pub(crate) fn unmap(addr: usize, size: usize) {
    sys::unmap_raw(addr, size);
    stats::TOTAL_MAPPED.sub(size);
}

/// Back `[addr, addr+size)` with read/write pages.
pub(crate) fn commit(addr: usize, size: usize) {
    sys::commit(addr, size);
}

/// Release physical backing and access for `[addr, addr+size)`, keeping the
/// virtual reservation.
pub(crate) fn decommit(addr: usize, size: usize) {
    sys::decommit(addr, size);
}

/// Purge `[addr, addr+size)` according to the configured strategy.  Returns
/// whether the pages are guaranteed to read as zero afterwards.  `force_zero`
/// requests that guarantee even under the lazy strategy.
pub(crate) fn purge(addr: usize, size: usize, force_zero: bool) -> bool {
    match purge_strategy() {
        PurgeStrategy::Decommit => {
            decommit(addr, size);
            true
        }
        PurgeStrategy::MadviseDontneed => sys::purge_dontneed(addr, size),
        PurgeStrategy::MadviseFree => {
            if force_zero {
                // Safety: the range is mapped, writable, and owned by the
                // caller.
                unsafe { std::ptr::write_bytes(addr as *mut u8, 0, size) };
            }
            let ok = sys::purge_lazy(addr, size);
            force_zero && ok
        }
    }
}

#[allow(dead_code)]
pub(crate) const VM_COPY_MIN: usize = PAGE_SIZE << 5;

/// Copy `n` bytes between disjoint mapped ranges, using the kernel's
/// copy-on-write path for big page-aligned copies where available.
pub(crate) fn copy(dest: usize, src: usize, n: usize) {
    #[cfg(all(target_os = "macos", not(any(loom, miri))))]
    {
        if n >= VM_COPY_MIN && dest & PAGE_MASK == 0 && src & PAGE_MASK == 0 {
            extern "C" {
                static mach_task_self_: libc::c_uint;
                fn vm_copy(
                    task: libc::c_uint,
                    source: usize,
                    size: usize,
                    dest: usize,
                ) -> libc::c_int;
            }
            // Safety: both ranges are page aligned, mapped, and disjoint.
            let rc = unsafe { vm_copy(mach_task_self_, src, n, dest) };
            if rc == 0 {
                return;
            }
        }
    }
    // Safety: caller guarantees valid, disjoint ranges.
    unsafe { std::ptr::copy_nonoverlapping(src as *const u8, dest as *mut u8, n) };
}

/// The page size is fixed at compile time; it must divide the kernel's.
pub(crate) fn check_kernel_page_size() {
    let kps = sys::kernel_page_size();
    assert!(kps.is_power_of_two(), "kernel page size {kps} is not a power of two");
    assert!(
        PAGE_SIZE % kps == 0,
        "compile-time page size {PAGE_SIZE} does not divide the runtime page size {kps}",
    );
}

// ---------------------------------------------------------------------------
// Unix
// ---------------------------------------------------------------------------
#[cfg(all(unix, not(any(loom, miri))))]
mod sys {
    use super::*;

    pub(super) fn map_anon(size: usize) -> Option<usize> {
        // Safety: FFI call to mmap.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            None
        } else {
            Some(ptr as usize)
        }
    }

    pub(super) fn unmap_raw(addr: usize, size: usize) {
        // Safety: FFI call to munmap; the caller owns the mapping.
        if unsafe { libc::munmap(addr as *mut libc::c_void, size) } != 0 {
            panic!(
                "munmap({addr:#x}, {size}) failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }

    pub(super) fn trim(
        addr: usize,
        alloc_size: usize,
        leadsize: usize,
        size: usize,
    ) -> Option<usize> {
        debug_assert!(alloc_size >= leadsize + size);
        let ret = addr + leadsize;
        let trailsize = alloc_size - leadsize - size;
        if leadsize != 0 {
            unmap_raw(addr, leadsize);
        }
        if trailsize != 0 {
            unmap_raw(ret + size, trailsize);
        }
        Some(ret)
    }

    pub(super) fn commit(addr: usize, size: usize) {
        // Safety: FFI call to mmap over our own reservation.
        let ptr = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_FIXED | libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            panic!(
                "commit({addr:#x}, {size}) failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }

    pub(super) fn decommit(addr: usize, size: usize) {
        // Safety: FFI call to mmap over our own reservation.
        let ptr = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                size,
                libc::PROT_NONE,
                libc::MAP_FIXED | libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            panic!(
                "decommit({addr:#x}, {size}) failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }

    pub(super) fn purge_dontneed(addr: usize, size: usize) -> bool {
        // Safety: FFI call to madvise on our own mapping.
        unsafe { libc::madvise(addr as *mut libc::c_void, size, libc::MADV_DONTNEED) == 0 }
    }

    pub(super) fn purge_lazy(addr: usize, size: usize) -> bool {
        // Safety: FFI call to madvise on our own mapping.
        unsafe { libc::madvise(addr as *mut libc::c_void, size, libc::MADV_FREE) == 0 }
    }

    pub(super) fn kernel_page_size() -> usize {
        // Safety: FFI call to sysconf.
        let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        assert!(
            raw > 0,
            "sysconf(_SC_PAGESIZE) failed: {}",
            std::io::Error::last_os_error()
        );
        raw as usize
    }
}

// ---------------------------------------------------------------------------
// Windows
// ---------------------------------------------------------------------------
#[cfg(all(windows, not(any(loom, miri))))]
mod sys {
    use super::*;
    use core::ffi::c_void;

    const MEM_COMMIT: u32 = 0x1000;
    const MEM_RESERVE: u32 = 0x2000;
    const MEM_DECOMMIT: u32 = 0x4000;
    const MEM_RELEASE: u32 = 0x8000;
    const PAGE_READWRITE: u32 = 0x04;

    #[repr(C)]
    struct SystemInfo {
        w_processor_architecture: u16,
        w_reserved: u16,
        dw_page_size: u32,
        lp_minimum_application_address: *mut c_void,
        lp_maximum_application_address: *mut c_void,
        dw_active_processor_mask: usize,
        dw_number_of_processors: u32,
        dw_processor_type: u32,
        dw_allocation_granularity: u32,
        w_processor_level: u16,
        w_processor_revision: u16,
    }

    extern "system" {
        fn VirtualAlloc(addr: *mut c_void, size: usize, fl_type: u32, protect: u32)
            -> *mut c_void;
        fn VirtualFree(addr: *mut c_void, size: usize, free_type: u32) -> i32;
        fn GetSystemInfo(info: *mut SystemInfo);
    }

    pub(super) fn map_anon(size: usize) -> Option<usize> {
        // Safety: FFI call to VirtualAlloc.
        let ptr = unsafe {
            VirtualAlloc(
                std::ptr::null_mut(),
                size,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_READWRITE,
            )
        };
        if ptr.is_null() {
            None
        } else {
            Some(ptr as usize)
        }
    }

    fn map_at(addr: usize, size: usize) -> Option<usize> {
        // Safety: FFI call to VirtualAlloc.
        let ptr = unsafe {
            VirtualAlloc(
                addr as *mut c_void,
                size,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_READWRITE,
            )
        };
        if ptr.is_null() {
            None
        } else {
            Some(ptr as usize)
        }
    }

    pub(super) fn unmap_raw(addr: usize, _size: usize) {
        // MEM_RELEASE must be passed size 0 and the base of the region.
        // Safety: FFI call to VirtualFree; the caller owns the mapping.
        if unsafe { VirtualFree(addr as *mut c_void, 0, MEM_RELEASE) } == 0 {
            panic!(
                "VirtualFree({addr:#x}) failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }

    pub(super) fn trim(
        addr: usize,
        alloc_size: usize,
        leadsize: usize,
        size: usize,
    ) -> Option<usize> {
        // Mappings cannot be partially released, so release the whole thing
        // and race to re-map the aligned portion.
        let ret = addr + leadsize;
        unmap_raw(addr, alloc_size);
        match map_at(ret, size) {
            Some(new_addr) if new_addr == ret => Some(ret),
            Some(new_addr) => {
                unmap_raw(new_addr, size);
                None
            }
            None => None,
        }
    }

    pub(super) fn commit(addr: usize, size: usize) {
        // The region may have been pieced together from multiple mappings, so
        // touch it in chunk-sized steps.
        let mut addr = addr;
        let mut size = size;
        let mut step = size.min(CHUNKSIZE - (addr & (CHUNKSIZE - 1)));
        while size > 0 {
            // Safety: FFI call to VirtualAlloc over our own reservation.
            if unsafe { VirtualAlloc(addr as *mut c_void, step, MEM_COMMIT, PAGE_READWRITE) }
                .is_null()
            {
                panic!(
                    "commit({addr:#x}, {step}) failed: {}",
                    std::io::Error::last_os_error()
                );
            }
            addr += step;
            size -= step;
            step = size.min(CHUNKSIZE);
        }
    }

    pub(super) fn decommit(addr: usize, size: usize) {
        let mut addr = addr;
        let mut size = size;
        let mut step = size.min(CHUNKSIZE - (addr & (CHUNKSIZE - 1)));
        while size > 0 {
            // Safety: FFI call to VirtualFree over our own reservation.
            if unsafe { VirtualFree(addr as *mut c_void, step, MEM_DECOMMIT) } == 0 {
                panic!(
                    "decommit({addr:#x}, {step}) failed: {}",
                    std::io::Error::last_os_error()
                );
            }
            addr += step;
            size -= step;
            step = size.min(CHUNKSIZE);
        }
    }

    // The madvise strategies are never selected on Windows.
    pub(super) fn purge_dontneed(_addr: usize, _size: usize) -> bool {
        false
    }

    pub(super) fn purge_lazy(_addr: usize, _size: usize) -> bool {
        false
    }

    pub(super) fn kernel_page_size() -> usize {
        // Safety: FFI call to GetSystemInfo.
        unsafe {
            let mut info: SystemInfo = std::mem::zeroed();
            GetSystemInfo(&mut info);
            info.dw_page_size as usize
        }
    }
}

// ---------------------------------------------------------------------------
// Loom/Miri mock: heap-backed mappings, no real syscalls.
//
// `commit`/`decommit` are intentional no-ops (the memory stays accessible),
// the dontneed purge zeroes explicitly to preserve its contract, and the lazy
// purge leaves contents stale, matching MADV_FREE.  Only whole-mapping unmap
// is supported.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri))]
mod sys {
    use super::*;
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    pub(super) fn map_anon(size: usize) -> Option<usize> {
        let layout = Layout::from_size_align(size, CHUNKSIZE).ok()?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            None
        } else {
            Some(ptr as usize)
        }
    }

    pub(super) fn unmap_raw(addr: usize, size: usize) {
        let layout = Layout::from_size_align(size, CHUNKSIZE).unwrap();
        // Safety: the mock only ever sees whole mappings from map_anon.
        unsafe { dealloc(addr as *mut u8, layout) };
    }

    pub(super) fn trim(
        _addr: usize,
        _alloc_size: usize,
        _leadsize: usize,
        _size: usize,
    ) -> Option<usize> {
        unreachable!("mock mappings are always chunk aligned");
    }

    pub(super) fn commit(_addr: usize, _size: usize) {}

    pub(super) fn decommit(_addr: usize, _size: usize) {}

    pub(super) fn purge_dontneed(addr: usize, size: usize) -> bool {
        // Safety: the range is a live mock mapping.
        unsafe { std::ptr::write_bytes(addr as *mut u8, 0, size) };
        true
    }

    pub(super) fn purge_lazy(_addr: usize, _size: usize) -> bool {
        true
    }

    pub(super) fn kernel_page_size() -> usize {
        PAGE_SIZE
    }
}
