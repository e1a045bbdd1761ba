//! Public operation surface.
//!
//! Every entry point initialises the allocator lazily, so the crate
//! works both with and without the constructor having run. Zones handed
//! to callers are opaque handles: the zone pointer XOR-masked with a
//! process secret, unmasked only inside this module.

use crate::allocator;
use crate::hardening::verify;
use crate::init;
use crate::root;
use crate::zone::Zone;
use core::ffi::c_void;
use core::ptr;

/// Opaque reference to a caller-owned private zone.
#[repr(transparent)]
#[derive(Clone, Copy)]
pub struct ZoneHandle(*mut c_void);

unsafe fn mask_handle(zone: *mut Zone) -> ZoneHandle {
    ZoneHandle((zone as u64 ^ root::root().zone_handle_mask) as *mut c_void)
}

unsafe fn unmask_handle(handle: ZoneHandle) -> *mut Zone {
    (handle.0 as u64 ^ root::root().zone_handle_mask) as *mut Zone
}

/// Allocate `size` bytes from the shared default zones, or from the big
/// path above SMALL_SZ_MAX. Returns null only when a mapping cannot be
/// satisfied and `abort-on-null` is off.
///
/// # Safety
/// The returned chunk is uninitialised.
pub unsafe fn alloc(size: usize) -> *mut u8 {
    init::ensure_initialized();
    allocator::alloc(ptr::null_mut(), size)
}

/// Allocate from a caller-owned private zone. The request must not
/// exceed the zone's chunk size.
///
/// # Safety
/// `zone` must have come from [`new_zone`] and not been destroyed.
pub unsafe fn zone_alloc(zone: ZoneHandle, size: usize) -> *mut u8 {
    init::ensure_initialized();
    allocator::alloc(unmask_handle(zone), size)
}

/// Zeroed array allocation; multiplicative overflow is fatal.
///
/// # Safety
/// See [`alloc`].
pub unsafe fn calloc(nmemb: usize, size: usize) -> *mut u8 {
    init::ensure_initialized();
    allocator::calloc(nmemb, size)
}

/// Resize an allocation, preserving `min(old, new)` bytes.
///
/// # Safety
/// `p` must be null or owned by this allocator and not yet freed.
pub unsafe fn realloc(p: *mut u8, size: usize) -> *mut u8 {
    init::ensure_initialized();
    allocator::realloc(p, size)
}

/// Free an allocation through the thread quarantine. Null and the zero
/// sentinel are no-ops.
///
/// # Safety
/// `p` must be null or owned by this allocator and not yet freed.
pub unsafe fn free(p: *mut u8) {
    init::ensure_initialized();
    allocator::free(p, false);
}

/// Free an allocation so its chunk is never handed out again. Bypasses
/// the quarantine.
///
/// # Safety
/// See [`free`].
pub unsafe fn free_permanently(p: *mut u8) {
    init::ensure_initialized();
    allocator::free(p, true);
}

/// Free with a size assertion: aborts when the owning zone holds chunks
/// smaller than `size`.
///
/// # Safety
/// See [`free`].
pub unsafe fn free_size(p: *mut u8, size: usize) {
    init::ensure_initialized();
    allocator::free_size(p, size);
}

/// Free a chunk belonging to a known zone, immediately.
///
/// # Safety
/// `p` must be owned by `zone`.
pub unsafe fn zone_free(zone: ZoneHandle, p: *mut u8) {
    init::ensure_initialized();
    if p.is_null() {
        return;
    }
    let z = unmask_handle(zone);
    root::ROOT_LOCK.lock();
    let r = root::root();
    allocator::free_internal_unlocked(r, p, false, z);
    root::ROOT_LOCK.unlock();
}

/// Usable size of an allocation: the owning zone's chunk size, or the
/// page-rounded size of a big allocation. Null and the zero sentinel
/// report 0; an unknown pointer is fatal.
///
/// # Safety
/// `p` must be null or owned by this allocator.
pub unsafe fn chunk_size(p: *mut u8) -> usize {
    init::ensure_initialized();
    allocator::chunk_size_of(p)
}

/// Create a caller-owned private zone for chunks of `size` bytes.
/// Returns None when the rounded size is beyond SMALL_SZ_MAX.
///
/// # Safety
/// The handle must eventually be passed to [`destroy_zone`].
pub unsafe fn new_zone(size: usize) -> Option<ZoneHandle> {
    init::ensure_initialized();
    if size > crate::config::SMALL_SZ_MAX {
        return None;
    }
    root::ROOT_LOCK.lock();
    let r = root::root();
    let zone = crate::zone::new_zone_unlocked(r, size, false);
    root::ROOT_LOCK.unlock();
    match zone {
        Some(z) => Some(mask_handle(z)),
        None => None,
    }
}

/// Destroy a zone. Private zones are wiped and recycled into the shared
/// pool; the handle must not be used again.
///
/// # Safety
/// `zone` must have come from [`new_zone`] and not been destroyed.
pub unsafe fn destroy_zone(zone: ZoneHandle) {
    init::ensure_initialized();
    let z = unmask_handle(zone);
    root::ROOT_LOCK.lock();
    let r = root::root();
    crate::zone::destroy_zone_unlocked(r, z, true, false);
    root::ROOT_LOCK.unlock();
}

/// Audit one zone's canaries and chain links.
///
/// # Safety
/// `zone` must be a live zone handle.
pub unsafe fn verify_zone(zone: ZoneHandle) {
    init::ensure_initialized();
    verify::verify_zone(unmask_handle(zone));
}

/// Audit the whole heap: every zone, then the big zone list.
///
/// # Safety
/// Aborts on the first corruption found.
pub unsafe fn verify_all() {
    init::ensure_initialized();
    verify::verify_all_zones();
}

/// Make the allocator unusable by revoking access to the root. Blocks
/// every other heap operation until [`unprotect_root`].
///
/// # Safety
/// Must be paired with [`unprotect_root`] on the same thread.
pub unsafe fn protect_root() {
    init::ensure_initialized();
    root::protect_root();
}

/// Undo [`protect_root`].
///
/// # Safety
/// Must follow a [`protect_root`] on the same thread.
pub unsafe fn unprotect_root() {
    root::unprotect_root();
}

/// Drop the thread's cached zones and drain its free quarantine.
pub fn flush_caches() {
    init::ensure_initialized();
    unsafe {
        allocator::flush_caches();
    }
}

/// Number of zones currently tracked by the root. Test and tooling hook.
pub fn zones_in_use() -> usize {
    init::ensure_initialized();
    unsafe { root::zones_in_use() }
}

/// Fold a chunk's memory tag into its pointer's high bits.
///
/// # Safety
/// `p` must be a chunk base inside `zone`, which must be tagged.
#[cfg(feature = "memory-tagging")]
pub unsafe fn tag_ptr(zone: ZoneHandle, p: *mut u8) -> *mut u8 {
    init::ensure_initialized();
    if p.is_null() {
        return ptr::null_mut();
    }
    let z = unmask_handle(zone);
    root::ROOT_LOCK.lock();
    let tag = crate::zone::chunk_mem_tag(&*z, p) as u64;
    root::ROOT_LOCK.unlock();
    ((tag << crate::config::UNTAGGED_BITS) | p as u64) as *mut u8
}

/// Recover the raw pointer from a tagged one, verifying the tag.
///
/// # Safety
/// `p` must have come from [`tag_ptr`] against the same zone.
#[cfg(feature = "memory-tagging")]
pub unsafe fn untag_ptr(zone: ZoneHandle, p: *mut u8) -> *mut u8 {
    init::ensure_initialized();
    if p.is_null() {
        return ptr::null_mut();
    }
    let z = unmask_handle(zone);
    let raw = (p as u64 & !(0xFFu64 << crate::config::UNTAGGED_BITS)) as *mut u8;
    root::ROOT_LOCK.lock();
    let tag = crate::zone::chunk_mem_tag(&*z, raw) as u64;
    root::ROOT_LOCK.unlock();
    ((tag << crate::config::UNTAGGED_BITS) ^ p as u64) as *mut u8
}
