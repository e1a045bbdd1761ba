//! Per-thread state: a most-recently-used zone cache probed before any
//! lock is taken, and the deferred-free chunk quarantine.
//!
//! Neither structure is ever read by another thread. A terminating
//! thread leaks at most the cached zone references (the zones themselves
//! live in the root) and the pending quarantined frees; the quarantine
//! is a best-effort delay, not a durability guarantee. All accessors go
//! through `try_with` so a thread whose TLS is already torn down simply
//! behaves as if both caches were empty.

use crate::config::{CHUNK_QUARANTINE_SZ, ZONE_CACHE_SZ};
use crate::zone::Zone;
use core::cell::UnsafeCell;
use core::ptr;

#[derive(Clone, Copy)]
pub struct CachedZone {
    pub zone: *mut Zone,
    pub chunk_size: u32,
}

impl CachedZone {
    const fn empty() -> Self {
        CachedZone {
            zone: ptr::null_mut(),
            chunk_size: 0,
        }
    }
}

struct ZoneCache {
    entries: [CachedZone; ZONE_CACHE_SZ],
    count: usize,
}

struct ChunkQuarantine {
    chunks: [usize; CHUNK_QUARANTINE_SZ],
    count: usize,
}

thread_local! {
    static ZONE_CACHE: UnsafeCell<ZoneCache> = const {
        UnsafeCell::new(ZoneCache {
            entries: [CachedZone::empty(); ZONE_CACHE_SZ],
            count: 0,
        })
    };

    static CHUNK_QUARANTINE: UnsafeCell<ChunkQuarantine> = const {
        UnsafeCell::new(ChunkQuarantine {
            chunks: [0; CHUNK_QUARANTINE_SZ],
            count: 0,
        })
    };
}

/// Remember a zone this thread just allocated from or freed to.
/// Duplicate of the most recent entry is skipped; a full cache wraps to
/// the front.
pub fn cache_zone(zone: *mut Zone, chunk_size: u32) {
    let _ = ZONE_CACHE.try_with(|cell| unsafe {
        let cache = &mut *cell.get();

        if cache.count != 0 && cache.entries[cache.count - 1].zone == zone {
            return;
        }

        if cache.count < ZONE_CACHE_SZ {
            cache.entries[cache.count] = CachedZone { zone, chunk_size };
            cache.count += 1;
        } else {
            cache.entries[0] = CachedZone { zone, chunk_size };
            cache.count = 1;
        }
    });
}

/// Copy the current cache entries into `buf`, returning how many are
/// valid. A snapshot keeps the TLS borrow out of the caller's search
/// loop.
pub fn zone_cache_snapshot(buf: &mut [CachedZone; ZONE_CACHE_SZ]) -> usize {
    ZONE_CACHE
        .try_with(|cell| unsafe {
            let cache = &*cell.get();
            buf[..cache.count].copy_from_slice(&cache.entries[..cache.count]);
            cache.count
        })
        .unwrap_or(0)
}

/// Invalidate the zone cache, e.g. ahead of a zone destruction.
pub fn clear_zone_cache() {
    let _ = ZONE_CACHE.try_with(|cell| unsafe {
        let cache = &mut *cell.get();
        cache.entries = [CachedZone::empty(); ZONE_CACHE_SZ];
        cache.count = 0;
    });
}

/// Defer a free. Returns false when the quarantine is full (the caller
/// drains it and retries) or TLS is gone (the caller frees directly).
pub fn quarantine_push(p: usize) -> bool {
    CHUNK_QUARANTINE
        .try_with(|cell| unsafe {
            let quarantine = &mut *cell.get();
            if quarantine.count < CHUNK_QUARANTINE_SZ {
                quarantine.chunks[quarantine.count] = p;
                quarantine.count += 1;
                true
            } else {
                false
            }
        })
        .unwrap_or(false)
}

/// Take every quarantined chunk out, returning how many were copied
/// into `buf`. The quarantine is left empty.
pub fn quarantine_take(buf: &mut [usize; CHUNK_QUARANTINE_SZ]) -> usize {
    CHUNK_QUARANTINE
        .try_with(|cell| unsafe {
            let quarantine = &mut *cell.get();
            let count = quarantine.count;
            buf[..count].copy_from_slice(&quarantine.chunks[..count]);
            quarantine.chunks = [0; CHUNK_QUARANTINE_SZ];
            quarantine.count = 0;
            count
        })
        .unwrap_or(0)
}
