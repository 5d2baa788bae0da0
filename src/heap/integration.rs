#[cfg(all(test, not(loom), not(miri)))]
mod tests {
    use crate::heap::api::*;
    use crate::heap::arenas;
    use crate::heap::chunk_cache;
    use crate::heap::classes::{self, CHUNKSIZE, PAGE_SIZE, TINY_MIN_2POW};
    use crate::heap::huge;
    use crate::heap::vm::{self, PurgeStrategy};
    use crate::sync::barrier::Barrier;
    use crate::sync::{thread, Arc};

    #[test]
    fn test_steady_state_single_chunk() {
        let _guard = crate::heap::TEST_MUTEX.write().unwrap();
        let id = create_arena();
        let arena = arenas::get_by_id(id);

        for i in 0..200_000 {
            let p = arena_malloc(id, 1).unwrap();
            // Safety: allocation is live.
            unsafe {
                assert_eq!(malloc_usable_size(p.as_ptr()), 1 << TINY_MIN_2POW);
                free(p.as_ptr());
            }
            if i == 0 || i == 199_999 {
                let (stats, _, _, _) = arena.stats_snapshot();
                assert_eq!(stats.mapped, CHUNKSIZE, "mapped drifted at iteration {i}");
            }
        }
        #[cfg(not(windows))]
        assert_eq!(classes::good_size(1), 8);
    }

    #[test]
    fn test_calloc_huge_is_zeroed() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let p = calloc(1024, 1024).unwrap();
        // Safety: allocation is live and 1 MiB long.
        unsafe {
            let bytes = std::slice::from_raw_parts(p.as_ptr(), 1024 * 1024);
            assert!(bytes.iter().all(|&b| b == 0));
            assert_eq!(malloc_usable_size(p.as_ptr()), 1_048_576);
            let info = ptr_info(p.as_ptr());
            assert_eq!(info.tag, PtrTag::LiveHuge);
            assert_eq!(info.addr, p.as_ptr());
            free(p.as_ptr());
        }
    }

    #[test]
    fn test_page_aligned_allocation_is_large() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let mut p = std::ptr::null_mut();
        assert_eq!(posix_memalign(&mut p, 4096, 4096), 0);
        assert_eq!(p as usize % 4096, 0);
        // Safety: allocation is live.
        unsafe {
            let info = ptr_info(p);
            assert_eq!(info.tag, PtrTag::LiveLarge);
            assert_eq!(info.addr, p);
            free(p);
        }
    }

    #[test]
    fn test_dirty_pages_drained_by_purge() {
        let _guard = crate::heap::TEST_MUTEX.write().unwrap();
        let id = create_arena();
        let arena = arenas::get_by_id(id);

        let mut ptrs = Vec::with_capacity(10_000);
        for _ in 0..10_000 {
            ptrs.push(arena_malloc(id, 96).unwrap());
        }
        for (i, p) in ptrs.iter().enumerate() {
            if i % 2 == 0 {
                // Safety: allocation is live and freed once.
                unsafe { free(p.as_ptr()) };
            }
        }
        free_dirty_pages();
        assert_eq!(arena.dirty_pages(), 0);

        for (i, p) in ptrs.iter().enumerate() {
            if i % 2 != 0 {
                // Safety: allocation is live and freed once.
                unsafe { free(p.as_ptr()) };
            }
        }
        free_dirty_pages();
        assert_eq!(arena.dirty_pages(), 0);
    }

    #[test]
    fn test_realloc_grows_large_in_place() {
        let _guard = crate::heap::TEST_MUTEX.write().unwrap();
        let id = create_arena();

        let p = arena_malloc(id, 4096).unwrap().as_ptr();
        // Safety: allocation is live for all of this block.
        unsafe {
            for i in 0..4096 {
                *p.add(i) = (i % 251) as u8;
            }
            // The chunk was fresh, so the following pages are free and the
            // run extends in place.
            let q = arena_realloc(id, p, 8192).unwrap().as_ptr();
            assert_eq!(q, p);
            for i in 0..4096 {
                assert_eq!(*q.add(i), (i % 251) as u8, "byte {i} clobbered");
            }
            assert_eq!(malloc_usable_size(q), 8192);
            free(q);
        }
    }

    #[test]
    fn test_realloc_small_same_class_in_place() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let p = malloc(20).unwrap().as_ptr();
        // Safety: allocation is live for all of this block.
        unsafe {
            *p = 0x77;
            // 20 and 25 both round to the 32-byte class.
            let q = realloc(p, 25).unwrap().as_ptr();
            assert_eq!(q, p);
            assert_eq!(*q, 0x77);
            free(q);
        }
    }

    #[test]
    fn test_huge_shrink_in_place() {
        let _guard = crate::heap::TEST_MUTEX.write().unwrap();
        if cfg!(windows) {
            // Partial release of a mapping is impossible; the shrink moves.
            return;
        }
        let p = malloc(3 * CHUNKSIZE).unwrap().as_ptr();
        let mapped_before = huge::huge_mutex().lock().unwrap().mapped;
        // Safety: allocation is live for all of this block.
        unsafe {
            *p = 0x5c;
            let q = realloc(p, CHUNKSIZE).unwrap().as_ptr();
            assert_eq!(q, p);
            assert_eq!(*q, 0x5c);
            assert_eq!(malloc_usable_size(q), CHUNKSIZE);
            let mapped_after = huge::huge_mutex().lock().unwrap().mapped;
            assert_eq!(mapped_before - mapped_after, 2 * CHUNKSIZE);
            free(q);
        }
    }

    #[test]
    fn test_live_allocations_never_overlap() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let sizes = [1, 8, 17, 96, 511, 600, 2048, 2049, 4096, 40960, 700_000];
        let mut live: Vec<(usize, usize)> = Vec::new();
        for &size in sizes.iter().cycle().take(120) {
            let p = malloc(size).unwrap().as_ptr() as usize;
            // Safety: allocation is live.
            let usable = unsafe { malloc_usable_size(p as *const u8) };
            assert!(usable >= size);
            for &(q, qsize) in &live {
                assert!(
                    p + usable <= q || q + qsize <= p,
                    "allocations overlap: {p:#x}+{usable} and {q:#x}+{qsize}"
                );
            }
            live.push((p, usable));
        }
        for (p, _) in live {
            // Safety: allocation is live and freed once.
            unsafe { free(p as *mut u8) };
        }
    }

    #[test]
    fn test_alignment_grid() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let mut align = core::mem::size_of::<usize>();
        while align <= 16 * PAGE_SIZE {
            for size in [1, align / 2 + 1, align, align + 3] {
                let mut p = std::ptr::null_mut();
                assert_eq!(posix_memalign(&mut p, align, size), 0, "align {align} size {size}");
                assert_eq!(p as usize % align, 0, "misaligned for align {align}");
                // Safety: allocation is live and freed once.
                unsafe { free(p) };
            }
            align <<= 1;
        }
    }

    #[test]
    fn test_full_free_coalesces_to_spare() {
        let _guard = crate::heap::TEST_MUTEX.write().unwrap();
        let id = create_arena();
        let arena = arenas::get_by_id(id);

        let mut ptrs = Vec::new();
        for &size in &[32, 96, 4096, 96, 20000, 32, 512] {
            ptrs.push(arena_malloc(id, size).unwrap());
        }
        for p in ptrs {
            // Safety: allocation is live and freed once.
            unsafe { free(p.as_ptr()) };
        }
        // Everything coalesced back: no partial free runs remain and the one
        // chunk is parked as the spare.
        let inner = arena.inner.lock().unwrap();
        assert!(inner.runs_avail.is_empty());
        assert!(inner.spare.is_some());
    }

    #[test]
    fn test_recycle_budget_never_exceeded() {
        let _guard = crate::heap::TEST_MUTEX.write().unwrap();
        assert!(chunk_cache::recycled_bytes() <= chunk_cache::RECYCLE_LIMIT);
        let mut ptrs = Vec::new();
        for _ in 0..6 {
            ptrs.push(malloc(2 * CHUNKSIZE).unwrap());
        }
        for p in ptrs {
            // Safety: allocation is live and freed once.
            unsafe { free(p.as_ptr()) };
            assert!(chunk_cache::recycled_bytes() <= chunk_cache::RECYCLE_LIMIT);
        }
    }

    #[test]
    fn test_ptr_info_freed_tags() {
        let _guard = crate::heap::TEST_MUTEX.write().unwrap();
        let id = create_arena();
        let p = arena_malloc(id, 8 * PAGE_SIZE).unwrap().as_ptr();
        // Safety: ptr_info accepts any address; p stays unreferenced after
        // free.
        unsafe {
            assert_eq!(ptr_info(p).tag, PtrTag::LiveLarge);
            free(p);
            assert_eq!(ptr_info(p).tag, PtrTag::FreedPageDirty);
            free_dirty_pages();
            let expected = match vm::purge_strategy() {
                PurgeStrategy::Decommit => PtrTag::FreedPageDecommitted,
                _ => PtrTag::FreedPageMadvised,
            };
            assert_eq!(ptr_info(p).tag, expected);
        }
    }

    #[test]
    fn test_ptr_info_freed_small() {
        let _guard = crate::heap::TEST_MUTEX.write().unwrap();
        let p = malloc(64).unwrap().as_ptr();
        let q = malloc(64).unwrap().as_ptr();
        // Safety: ptr_info accepts any address; p stays unreferenced after
        // free.
        unsafe {
            assert_eq!(ptr_info(p).tag, PtrTag::LiveSmall);
            free(p);
            // The run still holds q, so the region is tracked as freed.
            assert_eq!(ptr_info(p).tag, PtrTag::FreedSmall);
            assert_eq!(ptr_info(q).tag, PtrTag::LiveSmall);
            free(q);
        }
    }

    #[test]
    fn test_purge_freed_pages_runs() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        // Exercise the hard-purge path (a no-op outside the lazy strategy).
        let p = malloc(64 * PAGE_SIZE).unwrap();
        // Safety: allocation is live and freed once.
        unsafe { free(p.as_ptr()) };
        free_dirty_pages();
        purge_freed_pages();
    }

    #[test]
    fn test_stats_identities() {
        let _guard = crate::heap::TEST_MUTEX.write().unwrap();
        let keep: Vec<_> = (0..64).map(|i| malloc(32 + i * 8).unwrap()).collect();
        let st = stats();
        assert!(st.narenas >= 1);
        assert_eq!(st.chunksize, CHUNKSIZE);
        assert_eq!(st.page_size, PAGE_SIZE);
        assert!(st.mapped >= st.allocated + st.page_cache);
        // The VM gauge covers everything the per-subsystem totals cover,
        // plus any chunks parked in the recycle cache.
        assert!(st.mapped_total >= st.mapped);
        assert!(st.allocated > 0);
        for p in keep {
            // Safety: allocation is live and freed once.
            unsafe { free(p.as_ptr()) };
        }
    }

    #[test]
    fn test_thread_contention_integrity() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let num_threads = 8u8;
        let iters = 200u8;
        let barrier = Arc::new(Barrier::new(num_threads as usize));

        let handles: Vec<_> = (0..num_threads)
            .map(|t| {
                let b = barrier.clone();
                thread::spawn(move || {
                    if t % 2 == 0 {
                        thread_local_arena(true);
                    }
                    let mut ptrs = Vec::with_capacity(iters as usize);
                    b.wait();

                    for i in 0..iters {
                        let size = 16usize << (i % 5);
                        let ptr = malloc(size).unwrap();
                        // Safety: fresh allocation.
                        unsafe {
                            ptr.as_ptr().write(t.wrapping_mul(31).wrapping_add(i));
                        }
                        ptrs.push(ptr);
                    }

                    for (i, ptr) in (0u8..).zip(ptrs.iter()) {
                        // Safety: allocation is live.
                        unsafe {
                            assert_eq!(
                                ptr.as_ptr().read(),
                                t.wrapping_mul(31).wrapping_add(i),
                                "contention caused corruption in thread {t}"
                            );
                        }
                    }

                    for ptr in ptrs {
                        // Safety: allocation is live and freed once.
                        unsafe { free(ptr.as_ptr()) };
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_realloc_across_classes_preserves_contents() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let mut p = malloc(24).unwrap().as_ptr();
        let mut size = 24usize;
        // Safety: p is kept live through every round.
        unsafe {
            for (i, b) in (0..24).enumerate() {
                *p.add(i) = b as u8;
            }
            for _ in 0..8 {
                size *= 5;
                p = realloc(p, size).unwrap().as_ptr();
                for i in 0..24 {
                    assert_eq!(*p.add(i), i as u8, "byte {i} lost at size {size}");
                }
            }
            free(p);
        }
    }
}
