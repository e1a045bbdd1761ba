//! Behavioural tests for the public allocation API.
//!
//! These run against the process-wide allocator, so they avoid assuming
//! exclusive ownership of any default zone: assertions are phrased in
//! terms of the contracts (alignment, usable size, reuse rules) rather
//! than exact zone bookkeeping.

use std::collections::HashSet;
use std::ptr;
use zonealloc::config::{ALIGNMENT, SMALL_SZ_MAX};

#[test]
fn default_zones_exist_at_startup() {
    // One default zone per configured size, created by the constructor.
    assert!(zonealloc::zones_in_use() >= zonealloc::config::DEFAULT_ZONE_SIZES.len());
}

#[test]
fn alloc_round_trip_across_sizes() {
    unsafe {
        for &size in &[1usize, 8, 16, 17, 32, 48, 64, 100, 128, 256, 512, 1024, 4096, 65536] {
            let p = zonealloc::alloc(size);
            assert!(!p.is_null(), "alloc({}) returned null", size);
            assert_eq!(
                p as usize % ALIGNMENT,
                0,
                "alloc({}) returned a misaligned pointer",
                size
            );

            let usable = zonealloc::chunk_size(p);
            assert!(
                usable >= size,
                "chunk_size {} smaller than request {}",
                usable,
                size
            );

            // The whole chunk must be writable.
            ptr::write_bytes(p, 0xA5, usable);
            zonealloc::free(p);
        }
    }
}

#[test]
fn distinct_live_allocations() {
    unsafe {
        let mut ptrs = Vec::new();
        for _ in 0..256 {
            let p = zonealloc::alloc(64);
            assert!(!p.is_null());
            ptrs.push(p);
        }
        let unique: HashSet<usize> = ptrs.iter().map(|p| *p as usize).collect();
        assert_eq!(unique.len(), ptrs.len(), "live allocations must not alias");
        for p in ptrs {
            zonealloc::free(p);
        }
    }
}

#[test]
fn free_null_is_noop() {
    unsafe {
        zonealloc::free(ptr::null_mut());
        zonealloc::free_size(ptr::null_mut(), 64);
        zonealloc::free_permanently(ptr::null_mut());
    }
}

#[test]
fn chunk_size_of_null_is_zero() {
    unsafe {
        assert_eq!(zonealloc::chunk_size(ptr::null_mut()), 0);
    }
}

#[cfg(not(feature = "no-zero-allocations"))]
#[test]
fn zero_size_allocation_is_usable() {
    unsafe {
        let p = zonealloc::alloc(0);
        assert!(!p.is_null());
        assert!(zonealloc::chunk_size(p) >= zonealloc::config::SMALLEST_CHUNK_SZ);
        zonealloc::free(p);
    }
}

#[cfg(feature = "no-zero-allocations")]
#[test]
fn zero_size_allocation_returns_sentinel() {
    unsafe {
        let p = zonealloc::alloc(0);
        let q = zonealloc::alloc(0);
        assert!(!p.is_null());
        assert_eq!(p, q, "every zero size allocation is the same sentinel");
        assert_eq!(zonealloc::chunk_size(p), 0);
        // Free of the sentinel is a no-op, any number of times.
        zonealloc::free(p);
        zonealloc::free(q);
    }
}

#[test]
fn calloc_zeroes_reused_memory() {
    unsafe {
        // Dirty a chunk, free it, flush so the slot can actually come
        // back, then demand zeroed memory of the same size.
        let p = zonealloc::alloc(256);
        assert!(!p.is_null());
        ptr::write_bytes(p, 0xAB, 256);
        zonealloc::free(p);
        zonealloc::flush_caches();

        let q = zonealloc::calloc(4, 64);
        assert!(!q.is_null());
        let slice = std::slice::from_raw_parts(q, 256);
        assert!(
            slice.iter().all(|&b| b == 0),
            "calloc returned non-zero bytes"
        );
        zonealloc::free(q);
    }
}

#[test]
fn realloc_preserves_data() {
    unsafe {
        let p = zonealloc::realloc(ptr::null_mut(), 64);
        assert!(!p.is_null(), "realloc(null, n) must act like alloc");
        for i in 0..64 {
            p.add(i).write(i as u8);
        }

        // Grow
        let q = zonealloc::realloc(p, 4096);
        assert!(!q.is_null());
        for i in 0..64 {
            assert_eq!(q.add(i).read(), i as u8, "grow lost byte {}", i);
        }

        // Shrink
        let r = zonealloc::realloc(q, 16);
        assert!(!r.is_null());
        for i in 0..16 {
            assert_eq!(r.add(i).read(), i as u8, "shrink lost byte {}", i);
        }

        assert!(zonealloc::realloc(r, 0).is_null(), "realloc(p, 0) frees");
    }
}

#[test]
fn quarantine_delays_same_thread_reuse() {
    unsafe {
        let p = zonealloc::alloc(64);
        assert!(!p.is_null());
        let p_addr = p as usize;
        zonealloc::free(p);

        // The freed chunk sits in this thread's quarantine; it cannot
        // come back until the quarantine drains.
        let q = zonealloc::alloc(64);
        assert!(!q.is_null());
        assert_ne!(
            q as usize, p_addr,
            "freed chunk was reused before the quarantine drained"
        );
        zonealloc::free(q);
        zonealloc::flush_caches();
    }
}

#[test]
fn small_big_boundary() {
    unsafe {
        let p = zonealloc::alloc(SMALL_SZ_MAX);
        assert!(!p.is_null());
        assert_eq!(
            zonealloc::chunk_size(p),
            SMALL_SZ_MAX,
            "a request of exactly SMALL_SZ_MAX stays on the zone path"
        );

        let q = zonealloc::alloc(SMALL_SZ_MAX + 1);
        assert!(!q.is_null());
        let big_usable = zonealloc::chunk_size(q);
        assert!(
            big_usable > SMALL_SZ_MAX,
            "one byte past SMALL_SZ_MAX must take the big path"
        );
        assert_eq!(big_usable % 4096, 0, "big sizes are page rounded");

        zonealloc::free(p);
        zonealloc::free(q);
    }
}

#[test]
fn big_zone_reuse_returns_same_mapping() {
    unsafe {
        const BIG: usize = 5 * 1024 * 1024;

        // Another test can legitimately snatch a freed entry between
        // our free and alloc, so allow a few rounds before concluding
        // reuse is broken.
        let mut reused = false;
        let mut p = zonealloc::alloc(BIG);
        for _ in 0..4 {
            assert!(!p.is_null());
            ptr::write_bytes(p, 0xEE, BIG);
            zonealloc::free(p);

            let q = zonealloc::alloc(BIG);
            assert!(!q.is_null());
            if q == p {
                reused = true;

                // Reuse must not leak the previous contents; the pages
                // were advised away on free.
                #[cfg(target_os = "linux")]
                {
                    let head = std::slice::from_raw_parts(q, 4096);
                    assert!(
                        head.iter().all(|&b| b == 0),
                        "reused big zone leaked stale bytes"
                    );
                }

                zonealloc::free(q);
                break;
            }
            p = q;
        }
        assert!(reused, "freed big zone entries are never reused");
    }
}

#[test]
fn size_classes_are_isolated() {
    unsafe {
        let small = zonealloc::alloc(16);
        let large = zonealloc::alloc(4096);
        assert!(!small.is_null() && !large.is_null());

        let small_usable = zonealloc::chunk_size(small);
        let large_usable = zonealloc::chunk_size(large);

        // A request of 16 bytes must never land in a zone big enough
        // for the 4096 byte request.
        assert!(small_usable < 1024, "small chunk landed in a wide zone");
        assert!(large_usable >= 4096);
        assert_ne!(small_usable, large_usable);

        zonealloc::free(small);
        zonealloc::free(large);
    }
}

#[test]
fn private_zone_lifecycle() {
    unsafe {
        let zone = zonealloc::new_zone(256).expect("new_zone(256) failed");

        let p = zonealloc::zone_alloc(zone, 100);
        assert!(!p.is_null());
        assert_eq!(zonealloc::chunk_size(p), 256);
        ptr::write_bytes(p, 0x5A, 256);

        zonealloc::zone_free(zone, p);
        zonealloc::verify_zone(zone);
        zonealloc::destroy_zone(zone);
    }
}

#[test]
fn private_zone_rejects_big_sizes() {
    unsafe {
        assert!(
            zonealloc::new_zone(SMALL_SZ_MAX * 2).is_none(),
            "zones beyond SMALL_SZ_MAX must be refused"
        );
    }
}

#[test]
fn permanent_free_retires_the_chunk() {
    unsafe {
        let p = zonealloc::alloc(128);
        assert!(!p.is_null());
        zonealloc::free_permanently(p);

        // The chunk is now indistinguishable from a canary chunk and
        // must never be handed out again.
        for _ in 0..512 {
            let q = zonealloc::alloc(128);
            assert!(!q.is_null());
            assert_ne!(q, p, "permanently freed chunk was reallocated");
            zonealloc::free(q);
        }
        zonealloc::flush_caches();
    }
}

#[test]
fn free_size_accepts_wider_zone() {
    unsafe {
        let p = zonealloc::alloc(100);
        assert!(!p.is_null());
        // The owning zone holds chunks of at least 100 bytes; stating
        // the original request is always valid.
        zonealloc::free_size(p, 100);
    }
}

#[test]
fn zone_retirement_rebuilds_user_pages() {
    // Churn a zone until its lifetime allocation count crosses the
    // retirement threshold with no live chunks; the zone is then torn
    // down and rebuilt at the same index with a fresh mapping.
    const CHUNK: usize = 8192;
    const CHUNK_COUNT: u64 = (4 * 1024 * 1024 / CHUNK) as u64;
    const ITERATIONS: u64 = CHUNK_COUNT * 32 + CHUNK_COUNT;

    unsafe {
        let first = zonealloc::alloc(CHUNK);
        assert!(!first.is_null());
        let first_addr = first as usize;
        zonealloc::free_size(first, CHUNK);

        for _ in 0..ITERATIONS {
            let p = zonealloc::alloc(CHUNK);
            assert!(!p.is_null());
            zonealloc::free_size(p, CHUNK);
        }

        let after = zonealloc::alloc(CHUNK);
        assert!(!after.is_null());

        // Concurrent tests can keep a chunk of this size live, which
        // legitimately defers retirement; report instead of failing.
        if after as usize == first_addr {
            eprintln!(
                "WARNING: zone_retirement_rebuilds_user_pages: address unchanged \
                 (retirement deferred by a live chunk or the mapping was reused)"
            );
        }

        zonealloc::free(after);
        zonealloc::flush_caches();
        zonealloc::verify_all();
    }
}

#[test]
fn protect_root_round_trip() {
    unsafe {
        zonealloc::protect_root();
        zonealloc::unprotect_root();

        let p = zonealloc::alloc(64);
        assert!(!p.is_null(), "allocator unusable after unprotect_root");
        zonealloc::free(p);
    }
}

#[test]
fn heap_verifies_after_churn() {
    unsafe {
        let mut live = Vec::new();
        for round in 0..64usize {
            for &size in &[16usize, 32, 100, 256, 1024, 4096] {
                let p = zonealloc::alloc(size);
                assert!(!p.is_null());
                ptr::write_bytes(p, (round & 0xFF) as u8, size);
                live.push(p);
            }
            if round % 3 == 0 {
                for p in live.drain(..) {
                    zonealloc::free(p);
                }
            }
        }
        for p in live.drain(..) {
            zonealloc::free(p);
        }

        zonealloc::flush_caches();
        zonealloc::verify_all();
    }
}
