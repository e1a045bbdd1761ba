//! Shared lookup tables, mapped and pinned at root initialisation.
//!
//! The chunk table maps the high bits of a chunk address to the index of
//! the zone whose user region starts in that bucket. Misses are normal
//! (a zone can cross a bucket boundary, buckets alias across the address
//! space) and are resolved by the caller's containment check, so the
//! table is read without any lock; writes happen under the root lock at
//! zone creation and destruction.
//!
//! The zone table maps a chunk size to the index of the first zone of
//! that size; further zones of the size are chained through
//! `next_sz_index`.

use crate::config::SMALL_SZ_MAX;
use crate::platform;
use crate::util::round_up_page;
use core::cell::UnsafeCell;

/// Bucket granularity: one bucket per 16 MiB of address space.
const CHUNK_BUCKET_SHIFT: usize = 24;
const CHUNK_TABLE_ENTRIES: usize = 1 << 16;

const ZONE_TABLE_ENTRIES: usize = SMALL_SZ_MAX + 1;

struct TablePtr(UnsafeCell<*mut u16>);
unsafe impl Sync for TablePtr {}

static CHUNK_TABLE: TablePtr = TablePtr(UnsafeCell::new(core::ptr::null_mut()));
static ZONE_TABLE: TablePtr = TablePtr(UnsafeCell::new(core::ptr::null_mut()));

/// Map and pin both tables. Any failure is fatal.
///
/// # Safety
/// Must be called exactly once, during root initialisation.
pub unsafe fn init() {
    let chunk_bytes = round_up_page(CHUNK_TABLE_ENTRIES * core::mem::size_of::<u16>());
    let chunk_table = platform::map_rw_pages(chunk_bytes, true);
    if chunk_table.is_null() {
        crate::hardening::abort_with_message("zonealloc: cannot map chunk lookup table\n");
    }
    platform::lock_pages(chunk_table, chunk_bytes);
    *CHUNK_TABLE.0.get() = chunk_table as *mut u16;

    let zone_bytes = round_up_page(ZONE_TABLE_ENTRIES * core::mem::size_of::<u16>());
    let zone_table = platform::map_rw_pages(zone_bytes, true);
    if zone_table.is_null() {
        crate::hardening::abort_with_message("zonealloc: cannot map zone lookup table\n");
    }
    platform::lock_pages(zone_table, zone_bytes);
    *ZONE_TABLE.0.get() = zone_table as *mut u16;
}

/// Bucket index for a chunk address.
#[inline(always)]
pub fn chunk_bucket(p: *const u8) -> usize {
    (p as usize >> CHUNK_BUCKET_SHIFT) & (CHUNK_TABLE_ENTRIES - 1)
}

/// Zone index recorded for the bucket holding `p`, or 0.
///
/// # Safety
/// The tables must be initialised.
#[inline(always)]
pub unsafe fn chunk_bucket_zone(p: *const u8) -> u16 {
    (*CHUNK_TABLE.0.get()).add(chunk_bucket(p)).read()
}

/// Record `index` as the zone whose user region starts in `p`'s bucket.
///
/// # Safety
/// Requires the root lock.
#[inline]
pub unsafe fn set_chunk_bucket(p: *const u8, index: u16) {
    (*CHUNK_TABLE.0.get()).add(chunk_bucket(p)).write(index);
}

/// Clear the bucket entry for a zone being unmapped.
///
/// # Safety
/// Requires the root lock.
#[inline]
pub unsafe fn clear_chunk_bucket(p: *const u8) {
    (*CHUNK_TABLE.0.get()).add(chunk_bucket(p)).write(0);
}

/// Index of the first zone holding `size` byte chunks, or 0.
///
/// # Safety
/// The tables must be initialised and `size <= SMALL_SZ_MAX`.
#[inline(always)]
pub unsafe fn zone_index_for_size(size: usize) -> u16 {
    (*ZONE_TABLE.0.get()).add(size).read()
}

/// # Safety
/// Requires the root lock; `size <= SMALL_SZ_MAX`.
#[inline]
pub unsafe fn set_zone_index_for_size(size: usize, index: u16) {
    (*ZONE_TABLE.0.get()).add(size).write(index);
}

/// Unmap both tables at teardown.
///
/// # Safety
/// Requires the root lock; nothing may use the allocator afterwards.
#[cfg(feature = "dtor-cleanup")]
pub unsafe fn teardown() {
    let chunk_bytes = round_up_page(CHUNK_TABLE_ENTRIES * core::mem::size_of::<u16>());
    platform::unmap(*CHUNK_TABLE.0.get() as *mut u8, chunk_bytes);
    *CHUNK_TABLE.0.get() = core::ptr::null_mut();

    let zone_bytes = round_up_page(ZONE_TABLE_ENTRIES * core::mem::size_of::<u16>());
    platform::unmap(*ZONE_TABLE.0.get() as *mut u8, zone_bytes);
    *ZONE_TABLE.0.get() = core::ptr::null_mut();
}
