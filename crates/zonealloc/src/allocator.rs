//! Allocation and free control flow.
//!
//! A small request walks: thread zone cache, size-indexed zone chain,
//! linear zone scan, new zone. A free resolves the owning zone, then
//! either lands in the thread quarantine (plain free of a zone chunk)
//! or is carried out immediately (permanent frees and big zones).

use crate::big;
use crate::config::*;
use crate::hardening::{abort_with_message, canary, poison};
use crate::root::{self, Root, ROOT_LOCK};
use crate::tcache::{self, CachedZone};
use crate::util::{align_up, get_bit, is_aligned, set_bit, unset_bit};
use crate::zone::bitmap::bit_slot_coords;
use crate::zone::{self, lookup, UnmaskedZone, Zone};
use core::ptr;

/// Service an allocation request. `zone` names a caller-owned private
/// zone or is null for the shared default zones.
///
/// # Safety
/// The allocator must be initialised. A non-null `zone` must be a live
/// private zone pointer.
pub unsafe fn alloc(zone: *mut Zone, size: usize) -> *mut u8 {
    #[cfg(feature = "no-zero-allocations")]
    if size == 0 {
        return root::zero_page();
    }

    if !zone.is_null() && size > (*zone).chunk_size as usize {
        abort_with_message("zonealloc: private zone cannot hold chunks of this size\n");
    }

    ROOT_LOCK.lock();
    let r = root::root();

    if size <= SMALL_SZ_MAX {
        let mut zone = zone;

        if zone.is_null() {
            // Hot path: a zone this thread recently touched very likely
            // fits a similar request.
            let mut cache_buf = [CachedZone {
                zone: ptr::null_mut(),
                chunk_size: 0,
            }; ZONE_CACHE_SZ];
            let cached = tcache::zone_cache_snapshot(&mut cache_buf);
            for entry in &cache_buf[..cached] {
                if entry.chunk_size as usize >= size && zone::does_zone_fit(entry.zone, size) {
                    zone = entry.zone;
                    break;
                }
            }

            if zone.is_null() {
                zone = find_zone_fit(r, size);
            }
        }

        let free_bit_slot;
        if !zone.is_null() {
            // The search paths above already primed their pick; only a
            // caller-provided private zone still needs the check.
            if !(*zone).internal && !zone::is_zone_usable(zone, size) {
                ROOT_LOCK.unlock();
                return null_or_abort();
            }

            free_bit_slot = (*zone).next_free_bit_slot;
            if free_bit_slot == BAD_BIT_SLOT {
                ROOT_LOCK.unlock();
                return null_or_abort();
            }
        } else {
            // Nothing compatible exists; build a zone of exactly this size.
            zone = match zone::new_zone_unlocked(r, size, true) {
                Some(z) => z,
                None => abort_with_message("zonealloc: failed to create a zone for request\n"),
            };

            free_bit_slot = (*zone).next_free_bit_slot;
            if free_bit_slot == BAD_BIT_SLOT {
                abort_with_message("zonealloc: new zone has no free bit slots\n");
            }
        }

        (*zone).next_free_bit_slot = BAD_BIT_SLOT;

        let p;
        {
            let mut guard = (*zone).unmasked();
            p = alloc_bit_slot_from_zone(&mut guard, free_bit_slot);
        }

        let internal = (*zone).internal;
        let chunk_size = (*zone).chunk_size;
        ROOT_LOCK.unlock();

        if internal {
            tcache::cache_zone(zone, chunk_size);
        }
        p
    } else {
        // The big path runs under its own lock.
        ROOT_LOCK.unlock();

        if !zone.is_null() {
            abort_with_message("zonealloc: a private zone cannot service a big allocation\n");
        }

        big::big_alloc(r, size)
    }
}

/// Transition one bit slot to the in-use state and return its chunk.
///
/// # Safety
/// Requires the root lock. `bit_slot` must lie inside the zone bitmap.
unsafe fn alloc_bit_slot_from_zone(guard: &mut UnmaskedZone<'_>, bit_slot: BitSlot) -> *mut u8 {
    let (word_idx, which_bit) = bit_slot_coords(bit_slot);
    let p = guard.chunk_ptr(bit_slot);
    let bm = guard.bitmap();
    let mut word = bm.word(word_idx);

    if p >= guard.user_pages_start.add(ZONE_USER_SIZE) {
        abort_with_message("zonealloc: bit slot resolves outside the zone user region\n");
    }

    if get_bit(word, which_bit) != 0 {
        abort_with_message("zonealloc: zone cannot return an already allocated chunk\n");
    }

    // A set high bit means the chunk carries a canary: it was freed
    // earlier, or it is a canary chunk a corrupted cache handed us.
    // Verify it, then clear the leading canary word.
    if get_bit(word, which_bit + 1) == 1 {
        canary::check_canary(guard, p);
        (p as *mut u64).write(0);
    }

    set_bit(&mut word, which_bit);
    // In-use is 10, not 11; a previously used chunk would otherwise be
    // indistinguishable from a canary chunk. The high bit returns on free.
    unset_bit(&mut word, which_bit + 1);
    bm.set_word(word_idx, word);

    guard.af_count += 1;
    guard.alloc_count += 1;
    p
}

/// Zeroed multiplicative allocation. Overflow of `nmemb * size` is fatal
/// before any mapping happens.
///
/// # Safety
/// The allocator must be initialised.
pub unsafe fn calloc(nmemb: usize, size: usize) -> *mut u8 {
    let total = match nmemb.checked_mul(size) {
        Some(total) => total,
        None => abort_with_message("zonealloc: calloc request would overflow\n"),
    };

    let p = alloc(ptr::null_mut(), total);
    if !p.is_null() {
        ptr::write_bytes(p, 0, total);
    }
    p
}

/// Allocate-copy-free reallocation. The copy length is bounded by the
/// old chunk size, so growing into a larger zone never over-reads.
///
/// # Safety
/// The allocator must be initialised. `p` must be null or owned by it.
pub unsafe fn realloc(p: *mut u8, size: usize) -> *mut u8 {
    if p.is_null() {
        return alloc(ptr::null_mut(), size);
    }

    if size == 0 {
        free(p, false);
        return ptr::null_mut();
    }

    let old_size = chunk_size_of(p);
    let new = alloc(ptr::null_mut(), size);
    if !new.is_null() {
        ptr::copy_nonoverlapping(p, new, old_size.min(size));
        free(p, false);
    }
    new
}

/// Public free dispatch. Zone chunks are deferred through the thread
/// quarantine unless `permanent`; big zones are freed immediately under
/// their own lock. Null and the zero sentinel are no-ops.
///
/// # Safety
/// The allocator must be initialised. `p` must be null or owned by it.
pub unsafe fn free(p: *mut u8, permanent: bool) {
    if p.is_null() {
        return;
    }

    #[cfg(feature = "no-zero-allocations")]
    if p == root::zero_page() {
        return;
    }

    ROOT_LOCK.lock();
    let r = root::root();
    let zone = find_zone_range(r, p);

    if !zone.is_null() {
        if permanent {
            free_internal_unlocked(r, p, true, zone);
            ROOT_LOCK.unlock();
        } else {
            ROOT_LOCK.unlock();
            quarantine_or_free(p);
        }
        return;
    }
    ROOT_LOCK.unlock();

    // Not a zone chunk: either the big path owns it or the pointer is
    // garbage.
    let big_zone = big::find_big_zone(r, p);
    if big_zone.is_null() {
        abort_with_message("zonealloc: could not find any zone for pointer\n");
    }
    big::free_big_zone(r, big_zone, permanent);
}

/// Defer `p`, draining the quarantine first when it is full. Falls back
/// to an immediate free when thread-local storage is gone.
unsafe fn quarantine_or_free(p: *mut u8) {
    if tcache::quarantine_push(p as usize) {
        return;
    }

    ROOT_LOCK.lock();
    flush_chunk_quarantine_unlocked();
    ROOT_LOCK.unlock();

    if !tcache::quarantine_push(p as usize) {
        ROOT_LOCK.lock();
        let r = root::root();
        free_internal_unlocked(r, p, false, ptr::null_mut());
        ROOT_LOCK.unlock();
    }
}

/// Free with a size assertion: the owning zone must hold chunks at
/// least `size` bytes wide. Runs immediately, skipping the quarantine.
///
/// # Safety
/// The allocator must be initialised. `p` must be null or owned by it.
pub unsafe fn free_size(p: *mut u8, size: usize) {
    if p.is_null() {
        return;
    }

    #[cfg(feature = "no-zero-allocations")]
    {
        if p == root::zero_page() {
            if size != 0 {
                abort_with_message("zonealloc: zero sentinel freed with a non-zero size\n");
            }
            return;
        }
    }

    if size > SMALL_SZ_MAX {
        let r = root::root();
        let big_zone = big::find_big_zone(r, p);
        if big_zone.is_null() {
            abort_with_message("zonealloc: could not find any zone for pointer\n");
        }
        big::free_big_zone(r, big_zone, false);
        return;
    }

    ROOT_LOCK.lock();
    let r = root::root();

    let zone = find_zone_range(r, p);
    if zone.is_null() {
        abort_with_message("zonealloc: could not find any zone for pointer\n");
    }

    // The chunk may legitimately sit in a wider zone than the request
    // that produced it; a narrower zone means the size lied.
    if ((*zone).chunk_size as usize) < size {
        abort_with_message("zonealloc: invalid size for chunk passed to free\n");
    }

    free_internal_unlocked(r, p, false, zone);
    ROOT_LOCK.unlock();
}

/// Free a chunk into its zone and run the retirement policy.
///
/// # Safety
/// Requires the root lock. `zone` may be null, in which case ownership
/// is resolved here; a pointer owned by no zone is fatal.
pub unsafe fn free_internal_unlocked(r: &mut Root, p: *mut u8, permanent: bool, zone: *mut Zone) {
    let zone = if zone.is_null() {
        find_zone_range(r, p)
    } else {
        zone
    };

    if zone.is_null() {
        abort_with_message("zonealloc: could not find any zone for pointer\n");
    }

    free_chunk_from_zone(zone, p, permanent);

    #[cfg(feature = "memory-tagging")]
    if (*zone).tagged && !zone::refresh_zone_mem_tags(&*zone) {
        zone::refresh_chunk_mem_tag(&*zone, p);
    }

    if zone::is_zone_retired(&*zone) {
        zone::destroy_zone_unlocked(r, zone, false, true);
    }
}

/// The free state machine for one chunk.
///
/// # Safety
/// Requires the root lock. `p` must lie inside `zone`'s user region.
pub unsafe fn free_chunk_from_zone(zone: *mut Zone, p: *mut u8, permanent: bool) {
    if !is_aligned(p as usize, ALIGNMENT) {
        abort_with_message("zonealloc: freed pointer is not correctly aligned\n");
    }

    let z = &mut *zone;
    let chunk_size = z.chunk_size as usize;
    let mut guard = z.unmasked();

    let chunk_offset = p as usize - guard.user_pages_start as usize;
    if chunk_offset & (chunk_size - 1) != 0 {
        abort_with_message("zonealloc: freed pointer is not a multiple of the chunk size\n");
    }

    let chunk_number = chunk_offset / chunk_size;
    let bit_slot = (chunk_number as u64) << BITS_PER_CHUNK_SHIFT;
    let (word_idx, which_bit) = bit_slot_coords(bit_slot);

    if word_idx >= (guard.bitmap_size as usize) >> 3 {
        abort_with_message("zonealloc: chunk state lies outside the zone bitmap\n");
    }

    let bm = guard.bitmap();
    let mut word = bm.word(word_idx);

    if get_bit(word, which_bit) == 0 {
        abort_with_message("zonealloc: double free of chunk detected\n");
    }

    // The high bit records that this chunk has history.
    set_bit(&mut word, which_bit + 1);

    if !permanent {
        unset_bit(&mut word, which_bit);
        guard.free_bit_slot_cache.insert(bit_slot);
        guard.is_full = false;
        #[cfg(feature = "sanitize-chunks")]
        poison::poison_chunk(p, chunk_size);
    } else {
        // Leaving the low bit set turns the state into a canary chunk;
        // the slot is never handed out again.
        poison::poison_chunk(p, chunk_size);
    }

    bm.set_word(word_idx, word);
    guard.af_count -= 1;

    canary::write_canary(&guard, p);

    // Validate the neighbours: if they carry canaries, a linear
    // overflow through this chunk corrupted one of them.
    let chunk_count = guard.chunk_count();
    if chunk_number + 1 != chunk_count {
        let over = ((chunk_number + 1) as u64) << BITS_PER_CHUNK_SHIFT;
        let (wi, wb) = bit_slot_coords(over);
        if get_bit(bm.word(wi), wb + 1) == 1 {
            canary::check_canary(&guard, p.add(chunk_size));
        }
    }
    if chunk_number != 0 {
        let under = ((chunk_number - 1) as u64) << BITS_PER_CHUNK_SHIFT;
        let (wi, wb) = bit_slot_coords(under);
        if get_bit(bm.word(wi), wb + 1) == 1 {
            canary::check_canary(&guard, p.sub(chunk_size));
        }
    }

    drop(guard);

    if z.internal {
        tcache::cache_zone(zone, z.chunk_size);
    }
}

/// Owning zone of a chunk pointer. The lookup table bucket resolves the
/// common case in one read; misses walk the thread cache and then every
/// zone. A bucket entry beyond the populated zones is fatal corruption,
/// while a stale entry is caught by the containment check.
///
/// # Safety
/// Requires the root lock.
pub unsafe fn find_zone_range(r: &mut Root, p: *mut u8) -> *mut Zone {
    let index = lookup::chunk_bucket_zone(p);
    if index > r.zones_used {
        abort_with_message("zonealloc: chunk lookup table is corrupted\n");
    }

    let z = r.zones.add(index as usize);
    let user = (*z).unmasked_user_pages();
    if !user.is_null() && user <= p && p < user.add(ZONE_USER_SIZE) {
        return z;
    }

    let mut cache_buf = [CachedZone {
        zone: ptr::null_mut(),
        chunk_size: 0,
    }; ZONE_CACHE_SZ];
    let cached = tcache::zone_cache_snapshot(&mut cache_buf);
    for entry in &cache_buf[..cached] {
        let user = (*entry.zone).unmasked_user_pages();
        if user <= p && p < user.add(ZONE_USER_SIZE) {
            return entry.zone;
        }
    }

    for i in 0..r.zones_used {
        let z = r.zones.add(i as usize);
        let user = (*z).unmasked_user_pages();
        if user <= p && p < user.add(ZONE_USER_SIZE) {
            return z;
        }
    }

    ptr::null_mut()
}

/// Same resolution as [`find_zone_range`], against the bitmap mappings
/// instead of the user regions. Metadata tooling only.
///
/// # Safety
/// Requires the root lock.
#[allow(dead_code)]
pub unsafe fn find_zone_bitmap_range(r: &mut Root, p: *mut u8) -> *mut Zone {
    let index = lookup::chunk_bucket_zone(p);
    if index > r.zones_used {
        abort_with_message("zonealloc: chunk lookup table is corrupted\n");
    }

    let z = r.zones.add(index as usize);
    let bitmap = (*z).unmasked_bitmap();
    if !bitmap.is_null() && bitmap <= p && p < bitmap.add((*z).bitmap_size as usize) {
        return z;
    }

    let mut cache_buf = [CachedZone {
        zone: ptr::null_mut(),
        chunk_size: 0,
    }; ZONE_CACHE_SZ];
    let cached = tcache::zone_cache_snapshot(&mut cache_buf);
    for entry in &cache_buf[..cached] {
        let bitmap = (*entry.zone).unmasked_bitmap();
        if bitmap <= p && p < bitmap.add((*entry.zone).bitmap_size as usize) {
            return entry.zone;
        }
    }

    for i in 0..r.zones_used {
        let z = r.zones.add(i as usize);
        let bitmap = (*z).unmasked_bitmap();
        if bitmap <= p && p < bitmap.add((*z).bitmap_size as usize) {
            return z;
        }
    }

    ptr::null_mut()
}

/// Chunk size backing `p`: the owning zone's chunk size, or the big
/// zone's page-rounded size. Unknown pointers are fatal.
///
/// # Safety
/// The allocator must be initialised.
pub unsafe fn chunk_size_of(p: *mut u8) -> usize {
    if p.is_null() {
        return 0;
    }

    #[cfg(feature = "no-zero-allocations")]
    if p == root::zero_page() {
        return 0;
    }

    ROOT_LOCK.lock();
    let r = root::root();
    let zone = find_zone_range(r, p);
    if !zone.is_null() {
        let size = (*zone).chunk_size as usize;
        ROOT_LOCK.unlock();
        return size;
    }
    ROOT_LOCK.unlock();

    let big_zone = big::find_big_zone(r, p);
    if big_zone.is_null() {
        abort_with_message("zonealloc: could not find any zone for pointer\n");
    }
    (*big_zone).size
}

/// Find a compatible zone for a request: size-indexed chain first, full
/// scan second. Any chain entry disagreeing with its index is fatal.
///
/// # Safety
/// Requires the root lock. `size <= SMALL_SZ_MAX`.
unsafe fn find_zone_fit(r: &mut Root, size: usize) -> *mut Zone {
    let mut size = size;
    if !is_aligned(size, ALIGNMENT) {
        size = align_up(size, ALIGNMENT);
    }

    let first = lookup::zone_index_for_size(size);
    if first != 0 {
        let mut i = first;
        while i < r.zones_used {
            let z = r.zones.add(i as usize);

            if (*z).chunk_size as usize != size {
                abort_with_message("zonealloc: zone lookup table size mismatch\n");
            }
            if !(*z).internal {
                abort_with_message("zonealloc: zone lookup table names a private zone\n");
            }

            if zone::does_zone_fit(z, size) {
                return z;
            }

            if (*z).next_sz_index != 0 {
                i = (*z).next_sz_index;
            } else {
                // End of the chain. The full scan below also covers
                // zones of other compatible sizes.
                break;
            }
        }
    }

    for i in 0..r.zones_used {
        let z = r.zones.add(i as usize);
        if zone::does_zone_fit(z, size) {
            return z;
        }
    }

    ptr::null_mut()
}

/// Drain the calling thread's quarantine.
///
/// # Safety
/// Requires the root lock.
pub unsafe fn flush_chunk_quarantine_unlocked() {
    let mut buf = [0usize; CHUNK_QUARANTINE_SZ];
    let count = tcache::quarantine_take(&mut buf);
    let r = root::root();
    for &chunk in &buf[..count] {
        free_internal_unlocked(r, chunk as *mut u8, false, ptr::null_mut());
    }
}

/// Invalidate the thread zone cache and drain the thread quarantine.
///
/// # Safety
/// The allocator must be initialised.
pub unsafe fn flush_caches() {
    // The zone cache is advisory and needs no lock to clear.
    tcache::clear_zone_cache();

    ROOT_LOCK.lock();
    flush_chunk_quarantine_unlocked();
    ROOT_LOCK.unlock();
}

#[cold]
fn null_or_abort() -> *mut u8 {
    if cfg!(feature = "abort-on-null") {
        abort_with_message("zonealloc: configured to abort instead of returning null\n");
    }
    ptr::null_mut()
}
