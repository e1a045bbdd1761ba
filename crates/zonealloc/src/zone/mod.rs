pub mod bitmap;
pub mod lookup;

use crate::config::*;
use crate::hardening::{abort_with_message, canary};
use crate::platform;
use crate::root::Root;
use crate::util::{next_pow2, round_up_page};
use crate::zone::bitmap::{bit_slot_coords, Bitmap, FreeSlotCache};
use core::ops::{Deref, DerefMut};

/// A fixed-chunk-size arena. The user region and the bitmap are mapped
/// separately, each bracketed by PROT_NONE guard pages. `user_pages_start`
/// and `bitmap_start` are XOR-masked with `pointer_mask` while at rest;
/// every operation that dereferences them goes through [`Zone::unmasked`].
#[repr(C)]
pub struct Zone {
    /// Queue of known-free bit slots.
    pub free_bit_slot_cache: FreeSlotCache,
    /// Pre-dequeued next slot, or BAD_BIT_SLOT.
    pub next_free_bit_slot: BitSlot,
    /// Base of the user region; masked at rest.
    pub user_pages_start: *mut u8,
    /// Base of the bitmap region; masked at rest.
    pub bitmap_start: *mut u8,
    pub canary_secret: u64,
    pub pointer_mask: u64,
    /// Lifetime allocation count; monotonically non-decreasing.
    pub alloc_count: u64,
    /// Live chunk count.
    pub af_count: u32,
    /// Bitmap bytes: two bits per chunk, minimum one machine word.
    pub bitmap_size: u32,
    /// Power of two, immutable after creation.
    pub chunk_size: u32,
    /// Position in the root's zone array.
    pub index: u16,
    /// Index of the next zone with the same chunk size, or 0.
    pub next_sz_index: u16,
    /// Cached "no free slot" flag; cleared on free.
    pub is_full: bool,
    /// Shared default zone, as opposed to a caller-owned private zone.
    pub internal: bool,
    /// A per-chunk tag strip is mapped below the user pages.
    #[cfg(feature = "memory-tagging")]
    pub tagged: bool,
    /// CPU core the zone was created on.
    #[cfg(feature = "cpu-pin")]
    pub cpu_core: i32,
}

impl Zone {
    #[inline]
    pub fn chunk_count(&self) -> usize {
        ZONE_USER_SIZE / self.chunk_size as usize
    }

    /// Unmask a single at-rest pointer without touching the record.
    #[inline]
    pub fn unmasked_user_pages(&self) -> *mut u8 {
        (self.user_pages_start as u64 ^ self.pointer_mask) as *mut u8
    }

    /// Unmask a single at-rest pointer without touching the record.
    #[inline]
    pub fn unmasked_bitmap(&self) -> *mut u8 {
        (self.bitmap_start as u64 ^ self.pointer_mask) as *mut u8
    }

    #[inline]
    fn flip_masks(&mut self) {
        self.user_pages_start = (self.user_pages_start as u64 ^ self.pointer_mask) as *mut u8;
        self.bitmap_start = (self.bitmap_start as u64 ^ self.pointer_mask) as *mut u8;
    }

    /// Unmask the region pointers in place for the duration of the
    /// returned guard. The guard re-masks on drop, which must happen
    /// before the root lock is released.
    ///
    /// # Safety
    /// Requires the root lock, and the pointers must currently be masked.
    #[inline]
    pub unsafe fn unmasked(&mut self) -> UnmaskedZone<'_> {
        self.flip_masks();
        UnmaskedZone { zone: self }
    }
}

/// Scoped view of a zone with its region pointers unmasked.
pub struct UnmaskedZone<'a> {
    zone: &'a mut Zone,
}

impl Deref for UnmaskedZone<'_> {
    type Target = Zone;

    #[inline]
    fn deref(&self) -> &Zone {
        self.zone
    }
}

impl DerefMut for UnmaskedZone<'_> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Zone {
        self.zone
    }
}

impl Drop for UnmaskedZone<'_> {
    #[inline]
    fn drop(&mut self) {
        self.zone.flip_masks();
    }
}

impl UnmaskedZone<'_> {
    /// Word-level view of the bitmap.
    ///
    /// # Safety
    /// The view holds the raw bitmap base; it must not outlive the guard.
    #[inline]
    pub unsafe fn bitmap(&self) -> Bitmap {
        Bitmap::new(self.zone.bitmap_start, self.zone.bitmap_size as usize)
    }

    /// User chunk address for a bit slot.
    ///
    /// # Safety
    /// `bit_slot` must address a chunk inside this zone.
    #[inline]
    pub unsafe fn chunk_ptr(&self, bit_slot: BitSlot) -> *mut u8 {
        self.zone
            .user_pages_start
            .add((bit_slot >> BITS_PER_CHUNK_SHIFT) as usize * self.zone.chunk_size as usize)
    }
}

/// Create a new zone in the next free metadata slot and, for internal
/// zones, publish it through the lookup tables.
///
/// Returns None when the rounded size belongs on the big allocation
/// path. Exhausting the zone array is fatal.
///
/// # Safety
/// Requires the root lock.
pub unsafe fn new_zone_unlocked(root: &mut Root, size: usize, internal: bool) -> Option<*mut Zone> {
    if root.zones_used as usize >= MAX_ZONES {
        abort_with_message("zonealloc: cannot allocate additional zones\n");
    }

    let mut size = size.max(SMALLEST_CHUNK_SZ);

    // The bitmap math only works out when the chunk size is a power of
    // two; anything else either wastes memory or needs slow searches.
    if !size.is_power_of_two() {
        size = next_pow2(size as u64) as usize;
    }

    if size > SMALL_SZ_MAX {
        return None;
    }

    let index = root.zones_used;
    let zone = build_zone_at(root, index, size, internal, 0);

    if internal {
        if lookup::zone_index_for_size(size) == 0 {
            lookup::set_zone_index_for_size(size, index);
        } else {
            // Walk the chain of zones holding this size and hang the new
            // zone off the last one.
            let mut i = lookup::zone_index_for_size(size);
            while i < root.zones_used {
                let zt = &mut *root.zones.add(i as usize);
                if zt.chunk_size as usize != size {
                    abort_with_message("zonealloc: inconsistent lookup table for zone chunk size\n");
                }
                if zt.next_sz_index != 0 {
                    i = zt.next_sz_index;
                } else {
                    zt.next_sz_index = index;
                    break;
                }
            }
        }
    }

    root.zones_used += 1;

    Some(zone)
}

/// Map and initialise a zone record at a fixed index. The caller owns
/// the index bookkeeping: fresh creation appends, replacement reuses.
///
/// # Safety
/// Requires the root lock. `index` must be inside the zone array and its
/// record must not be live.
pub unsafe fn build_zone_at(
    root: &mut Root,
    index: u16,
    size: usize,
    internal: bool,
    next_sz_index: u16,
) -> *mut Zone {
    let page = root.system_page_size;
    let zone_ptr = root.zones.add(index as usize);
    core::ptr::write_bytes(zone_ptr as *mut u8, 0, core::mem::size_of::<Zone>());

    let zone = &mut *zone_ptr;
    zone.index = index;
    zone.internal = internal;
    zone.chunk_size = size as u32;
    zone.next_sz_index = next_sz_index;
    zone.free_bit_slot_cache = FreeSlotCache::new();
    zone.next_free_bit_slot = BAD_BIT_SLOT;

    let chunk_count = zone.chunk_count();

    // Two bits per chunk; the largest chunk size leaves exactly one
    // machine word.
    let bitmap_size =
        ((chunk_count << BITS_PER_CHUNK_SHIFT) >> 3).max(core::mem::size_of::<u64>());
    zone.bitmap_size = bitmap_size as u32;

    // Bitmap region: guard, bitmap pages, guard.
    let bitmap_total = round_up_page(bitmap_size) + (page << 1);
    let bp = platform::map_rw_pages(bitmap_total, true);
    if bp.is_null() {
        abort_with_message("zonealloc: cannot map zone bitmap\n");
    }
    platform::protect_none(bp, page);
    zone.bitmap_start = bp.add(page);
    platform::protect_none(bp.add(page + round_up_page(bitmap_size)), page);

    // Bitmap pages are hit constantly and usually in order.
    platform::advise_need(zone.bitmap_start, bitmap_size);

    #[cfg(feature = "named-mappings")]
    platform::name_pages(bp, bitmap_total, b"zonealloc zone bitmap\0");

    // User region: guard, optional tag strip + guard, user pages, guard.
    #[cfg(feature = "memory-tagging")]
    let (user_total, tag_strip_size) = if internal {
        (ZONE_USER_SIZE + (page << 1), 0)
    } else {
        zone.tagged = true;
        let strip = round_up_page(chunk_count * MEM_TAG_SIZE);
        (ZONE_USER_SIZE + (page << 1) + strip + page, strip)
    };
    #[cfg(not(feature = "memory-tagging"))]
    let user_total = ZONE_USER_SIZE + (page << 1);

    let up = platform::map_rw_pages(user_total, true);
    if up.is_null() {
        abort_with_message("zonealloc: cannot map zone user pages\n");
    }
    platform::protect_none(up, page);

    #[cfg(feature = "memory-tagging")]
    if zone.tagged {
        // Random tag per chunk, refreshed as chunks are freed.
        let strip = up.add(page);
        let words = strip as *mut u64;
        for i in 0..tag_strip_size / core::mem::size_of::<u64>() {
            words.add(i).write(platform::rand_u64());
        }
        platform::protect_none(strip.add(tag_strip_size), page);
        zone.user_pages_start = strip.add(tag_strip_size + page);
    } else {
        zone.user_pages_start = up.add(page);
    }
    #[cfg(not(feature = "memory-tagging"))]
    {
        zone.user_pages_start = up.add(page);
    }

    platform::protect_none(up.add(user_total - page), page);
    platform::advise_need(zone.user_pages_start, ZONE_USER_SIZE);

    #[cfg(feature = "named-mappings")]
    platform::name_pages(
        up,
        user_total,
        if internal {
            b"zonealloc internal zone\0"
        } else {
            b"zonealloc private zone\0"
        },
    );

    zone.canary_secret = platform::rand_u64();
    zone.pointer_mask = platform::rand_u64();

    #[cfg(feature = "cpu-pin")]
    {
        zone.cpu_core = platform::current_cpu();
    }

    create_canary_chunks(zone);

    // A fresh bitmap is the cheapest time to populate the free slot
    // cache with decorrelated entries.
    let bm = Bitmap::new(zone.bitmap_start, zone.bitmap_size as usize);
    bm.refill_cache(&mut zone.free_bit_slot_cache);
    zone.next_free_bit_slot = zone.free_bit_slot_cache.dequeue();

    // Private zones are never published through the lookup tables.
    if internal {
        lookup::set_chunk_bucket(zone.user_pages_start, index);
    }

    zone.flip_masks();

    zone_ptr
}

/// Reserve a random sample of chunks as permanent canary chunks and
/// write their canaries. Zones above the default size ceiling get none;
/// their chunks are too large to sacrifice.
///
/// # Safety
/// Requires unmasked region pointers and an otherwise all-free bitmap.
pub unsafe fn create_canary_chunks(zone: &mut Zone) {
    if zone.chunk_size as usize > MAX_DEFAULT_ZONE_SZ {
        return;
    }

    let chunk_count = zone.chunk_count() as u64;
    let canary_count = chunk_count / CANARY_COUNT_DIV;
    let bm = Bitmap::new(zone.bitmap_start, zone.bitmap_size as usize);

    for _ in 0..canary_count {
        let chunk = platform::rand_u64() % chunk_count;
        let bit_slot = chunk << BITS_PER_CHUNK_SHIFT;
        let (word_idx, which_bit) = bit_slot_coords(bit_slot);
        let mut word = bm.word(word_idx);

        // The random draw may land on an earlier pick; dropping the
        // collision is fine, canary chunks are a statistical defence.
        if crate::util::get_bit(word, which_bit) == 1 {
            continue;
        }

        crate::util::set_bit(&mut word, which_bit);
        crate::util::set_bit(&mut word, which_bit + 1);
        bm.set_word(word_idx, word);

        let p = zone
            .user_pages_start
            .add(chunk as usize * zone.chunk_size as usize);
        canary::write_canary(zone, p);
    }
}

/// Whether a zone can satisfy a request for `size` bytes through the
/// shared search paths.
///
/// # Safety
/// Requires the root lock.
pub unsafe fn does_zone_fit(zone: *mut Zone, size: usize) -> bool {
    let z = &*zone;

    #[cfg(feature = "cpu-pin")]
    if z.cpu_core != platform::current_cpu() {
        return false;
    }

    // Keep small chunks out of large-chunk zones; spatial separation by
    // size is the whole point of the design.
    if z.chunk_size as usize >= 1024 && size <= 128 {
        return false;
    }

    if (z.chunk_size as usize) < size || !z.internal || z.is_full {
        return false;
    }

    is_zone_usable(zone, size)
}

/// Ensure the zone has a dequeued free slot ready, refilling the slot
/// cache and falling back to bitmap scans as needed. Marks the zone full
/// when everything fails.
///
/// # Safety
/// Requires the root lock.
pub unsafe fn is_zone_usable(zone: *mut Zone, size: usize) -> bool {
    let z = &mut *zone;

    if z.is_full {
        return false;
    }

    // A zone created for chunks far larger than the request would burn
    // a lot of memory. Tolerated below 1024 bytes.
    if z.internal
        && size > 1024
        && z.chunk_size as usize >= (size << WASTED_SZ_MULTIPLIER_SHIFT)
    {
        return false;
    }

    if z.next_free_bit_slot != BAD_BIT_SLOT {
        return true;
    }

    let mut guard = z.unmasked();

    if guard.free_bit_slot_cache.is_empty() {
        let bm = guard.bitmap();
        bm.refill_cache(&mut guard.free_bit_slot_cache);
    }

    let slot = guard.free_bit_slot_cache.dequeue();
    if slot != BAD_BIT_SLOT {
        guard.next_free_bit_slot = slot;
        return true;
    }

    let bm = guard.bitmap();
    let slot = bm.scan_first_empty_word();
    if slot != BAD_BIT_SLOT {
        guard.next_free_bit_slot = slot;
        return true;
    }

    let slot = bm.scan_slow();
    if slot != BAD_BIT_SLOT {
        guard.next_free_bit_slot = slot;
        return true;
    }

    guard.is_full = true;
    false
}

/// Retirement predicate: an idle internal zone that has churned through
/// enough allocations is destroyed and rebuilt to break address reuse.
/// Very large zones are never retired.
#[inline]
pub fn is_zone_retired(zone: &Zone) -> bool {
    zone.af_count == 0
        && zone.alloc_count > zone.chunk_count() as u64 * ZONE_ALLOC_RETIRE
        && zone.internal
        && (zone.chunk_size as usize) < MAX_DEFAULT_ZONE_SZ * 2
}

/// Destroy a zone.
///
/// Private zones are wiped and recycled as internal zones (or bricked
/// under `never-reuse-zones`). Internal zones are unmapped, optionally
/// rebuilding a fresh zone of the same size at the same index.
///
/// # Safety
/// Requires the root lock.
pub unsafe fn destroy_zone_unlocked(
    root: &mut Root,
    zone: *mut Zone,
    flush_caches: bool,
    replace: bool,
) {
    if flush_caches {
        // Clear the thread caches now so no stale reference to this
        // zone survives the destruction.
        crate::tcache::clear_zone_cache();
        crate::allocator::flush_chunk_quarantine_unlocked();
    }

    let z = &mut *zone;

    if !z.internal {
        recycle_private_zone(z);
        return;
    }

    if replace {
        let size = z.chunk_size as usize;
        let index = z.index;
        let next_sz_index = z.next_sz_index;
        unmap_zone(root, z);
        // Same index, same size: the size chain stays valid without a
        // fresh splice.
        build_zone_at(root, index, size, true, next_sz_index);
    } else {
        unmap_zone(root, z);
    }
}

/// Wipe a private zone and prime it for reuse as an internal zone.
unsafe fn recycle_private_zone(z: &mut Zone) {
    let mut guard = z.unmasked();

    // Wipe anything the previous owner left behind.
    core::ptr::write_bytes(guard.bitmap_start, 0, guard.bitmap_size as usize);
    core::ptr::write_bytes(guard.user_pages_start, 0, ZONE_USER_SIZE);

    #[cfg(feature = "memory-tagging")]
    if guard.tagged {
        let page = platform::page_size();
        let strip_size = round_up_page(guard.chunk_count() * MEM_TAG_SIZE);
        let strip = guard.user_pages_start.sub(page + strip_size);
        core::ptr::write_bytes(strip, 0, strip_size);
        platform::protect_none(strip, strip_size);
        guard.tagged = false;
    }

    #[cfg(feature = "never-reuse-zones")]
    {
        // Spend the address space: nothing may ever alias this zone.
        platform::protect_none(guard.bitmap_start, guard.bitmap_size as usize);
        platform::protect_none(guard.user_pages_start, ZONE_USER_SIZE);
        drop(guard);
        core::ptr::write_bytes(z as *mut Zone as *mut u8, 0, core::mem::size_of::<Zone>());
        z.next_free_bit_slot = BAD_BIT_SLOT;
        z.is_full = true;
    }

    #[cfg(not(feature = "never-reuse-zones"))]
    {
        guard.internal = true;
        guard.is_full = false;

        // Give the physical pages back before reseeding; the canaries
        // written below pull their pages back in on demand.
        platform::advise_free(guard.bitmap_start, guard.bitmap_size as usize);
        platform::advise_free(guard.user_pages_start, ZONE_USER_SIZE);

        // Reusing a private zone is a zone-use-after-free pattern in
        // the making, so bootstrap it from scratch.
        create_canary_chunks(&mut guard);
        let bm = guard.bitmap();
        bm.refill_cache(&mut guard.free_bit_slot_cache);
        guard.next_free_bit_slot = guard.free_bit_slot_cache.dequeue();
    }
}

/// Unmap a zone's bitmap and user regions, guards included, and clear
/// its lookup table bucket.
///
/// # Safety
/// Requires the root lock. The zone must be internal (tagged private
/// zones are recycled, never unmapped).
unsafe fn unmap_zone(root: &mut Root, z: &mut Zone) {
    let page = root.system_page_size;
    let guard = z.unmasked();

    lookup::clear_chunk_bucket(guard.user_pages_start);

    let bitmap_total = round_up_page(guard.bitmap_size as usize) + (page << 1);
    platform::unmap(guard.bitmap_start.sub(page), bitmap_total);

    let user_total = ZONE_USER_SIZE + (page << 1);
    platform::unmap(guard.user_pages_start.sub(page), user_total);
}

/// Tag byte recorded for a chunk in the zone's tag strip.
///
/// # Safety
/// Requires the root lock. `p` must be a chunk base inside a tagged
/// zone whose pointers are at rest.
#[cfg(feature = "memory-tagging")]
pub unsafe fn chunk_mem_tag(zone: &Zone, p: *const u8) -> u8 {
    let page = platform::page_size();
    let user = zone.unmasked_user_pages();
    let strip_size = round_up_page(zone.chunk_count() * MEM_TAG_SIZE);
    let strip = user.sub(page + strip_size);

    let chunk_offset = p as usize - user as usize;
    if chunk_offset & (zone.chunk_size as usize - 1) != 0 {
        abort_with_message("zonealloc: tag lookup for a pointer that is not a chunk base\n");
    }

    strip.add(chunk_offset / zone.chunk_size as usize).read()
}

/// Write a fresh random tag for one chunk.
///
/// # Safety
/// Same requirements as [`chunk_mem_tag`].
#[cfg(feature = "memory-tagging")]
pub unsafe fn refresh_chunk_mem_tag(zone: &Zone, p: *const u8) {
    let page = platform::page_size();
    let user = zone.unmasked_user_pages();
    let strip_size = round_up_page(zone.chunk_count() * MEM_TAG_SIZE);
    let strip = user.sub(page + strip_size);

    let chunk_offset = p as usize - user as usize;
    strip
        .add(chunk_offset / zone.chunk_size as usize)
        .write(platform::rand_u64() as u8);
}

/// Rewrite the whole tag strip once an idle zone has churned through a
/// quarter of its retirement quota. Returns whether the refresh ran.
///
/// # Safety
/// Requires the root lock; the zone's pointers must be at rest.
#[cfg(feature = "memory-tagging")]
pub unsafe fn refresh_zone_mem_tags(zone: &Zone) -> bool {
    if zone.af_count != 0
        || zone.alloc_count <= (zone.chunk_count() as u64 * ZONE_ALLOC_RETIRE) / 4
    {
        return false;
    }

    let page = platform::page_size();
    let user = zone.unmasked_user_pages();
    let strip_size = round_up_page(zone.chunk_count() * MEM_TAG_SIZE);
    let strip = user.sub(page + strip_size) as *mut u64;

    for i in 0..strip_size / core::mem::size_of::<u64>() {
        strip.add(i).write(platform::rand_u64());
    }

    true
}
