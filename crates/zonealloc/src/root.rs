//! The process-wide root: the zone array, the big zone list head and the
//! process secrets. The record itself is mapped between two PROT_NONE
//! pages and pinned; the secrets never leave it.

use crate::big::BigZone;
use crate::config::{DEFAULT_ZONE_SIZES, MAX_ZONES};
use crate::hardening::abort_with_message;
use crate::platform;
use crate::sync::Lock;
use crate::util::round_up_page;
use crate::zone::{self, lookup, Zone};
use core::cell::UnsafeCell;
use core::ptr;

/// Covers the zone engine and the shared thread-cache drain.
pub static ROOT_LOCK: Lock = Lock::new();

/// Covers the big zone list. May be taken while the root lock is held
/// only during full-heap verification and teardown.
pub static BIG_ZONE_LOCK: Lock = Lock::new();

#[repr(C)]
pub struct Root {
    /// Zone metadata array, in its own guarded mapping.
    pub zones: *mut Zone,
    /// Total bytes of the zones mapping, guards included.
    pub zones_size: usize,
    pub zones_used: u16,
    /// Head of the big zone list; masked with `big_zone_next_mask` when
    /// non-null.
    pub big_zone_head: *mut BigZone,
    pub zone_handle_mask: u64,
    pub big_zone_next_mask: u64,
    pub big_zone_canary_secret: u64,
    pub guard_below: *mut u8,
    pub guard_above: *mut u8,
    pub system_page_size: usize,
}

struct RootHolder(UnsafeCell<*mut Root>);
unsafe impl Sync for RootHolder {}

static ROOT: RootHolder = RootHolder(UnsafeCell::new(ptr::null_mut()));

#[cfg(feature = "no-zero-allocations")]
struct ZeroPageHolder(UnsafeCell<*mut u8>);
#[cfg(feature = "no-zero-allocations")]
unsafe impl Sync for ZeroPageHolder {}
#[cfg(feature = "no-zero-allocations")]
static ZERO_PAGE: ZeroPageHolder = ZeroPageHolder(UnsafeCell::new(ptr::null_mut()));

/// The root record.
///
/// # Safety
/// The allocator must be initialised. Mutation requires the root lock.
#[inline(always)]
pub unsafe fn root<'a>() -> &'a mut Root {
    &mut *(*ROOT.0.get())
}

/// The PROT_NONE sentinel returned for zero size allocations.
#[cfg(feature = "no-zero-allocations")]
#[inline(always)]
pub fn zero_page() -> *mut u8 {
    unsafe { *ZERO_PAGE.0.get() }
}

/// Map and populate the global root: the guarded root record, the zone
/// metadata region, the lookup tables and the default zones. Any
/// mapping failure here is fatal.
///
/// # Safety
/// Must be called exactly once, before any other allocator operation.
pub unsafe fn initialize_global_root() {
    if !(*ROOT.0.get()).is_null() {
        return;
    }

    let page = platform::page_size();

    let root_total = round_up_page(core::mem::size_of::<Root>()) + (page << 1);
    let base = platform::map_rw_pages(root_total, true);
    if base.is_null() {
        abort_with_message("zonealloc: cannot allocate pages for the root\n");
    }

    #[cfg(feature = "named-mappings")]
    platform::name_pages(base, root_total, b"zonealloc root\0");

    let r = &mut *(base.add(page) as *mut Root);
    r.system_page_size = page;
    r.guard_below = base;
    platform::protect_none(r.guard_below, page);
    r.guard_above = base.add(root_total - page);
    platform::protect_none(r.guard_above, page);

    // Without pinning, nearly every operation would soft fault on the
    // root page.
    platform::lock_pages(r as *mut Root as *mut u8, core::mem::size_of::<Root>());

    r.zone_handle_mask = platform::rand_u64();
    r.big_zone_next_mask = platform::rand_u64();
    r.big_zone_canary_secret = platform::rand_u64();

    // Zone metadata region, guarded on both sides.
    r.zones_size = round_up_page(MAX_ZONES * core::mem::size_of::<Zone>()) + (page << 1);
    let zones_base = platform::map_rw_pages(r.zones_size, false);
    if zones_base.is_null() {
        abort_with_message("zonealloc: cannot allocate pages for zone metadata\n");
    }
    platform::protect_none(zones_base, page);
    platform::protect_none(zones_base.add(r.zones_size - page), page);
    r.zones = zones_base.add(page) as *mut Zone;

    #[cfg(feature = "named-mappings")]
    platform::name_pages(zones_base, r.zones_size, b"zonealloc zone metadata\0");

    lookup::init();

    *ROOT.0.get() = r;

    for size in DEFAULT_ZONE_SIZES {
        if zone::new_zone_unlocked(r, size, true).is_none() {
            abort_with_message("zonealloc: failed to create a default zone\n");
        }
    }

    #[cfg(feature = "no-zero-allocations")]
    {
        let sentinel = platform::map_pages(page, false, libc::PROT_NONE);
        if sentinel.is_null() {
            abort_with_message("zonealloc: cannot allocate the zero sentinel page\n");
        }
        *ZERO_PAGE.0.get() = sentinel;
    }
}

/// Late-shutdown audit: flush the quarantine, verify every zone and the
/// big zone list. With `dtor-cleanup` everything is also unmapped;
/// without it the allocator stays usable for destructors that still
/// allocate.
///
/// # Safety
/// Must only run once other threads have stopped using the allocator.
pub unsafe fn teardown() {
    if (*ROOT.0.get()).is_null() {
        return;
    }

    ROOT_LOCK.lock();
    let r = root();

    crate::allocator::flush_chunk_quarantine_unlocked();

    for i in 0..r.zones_used {
        let z = r.zones.add(i as usize);
        if (*z).bitmap_start.is_null() || (*z).user_pages_start.is_null() {
            break;
        }
        crate::hardening::verify::verify_zone_unlocked(z);
        #[cfg(feature = "dtor-cleanup")]
        zone::destroy_zone_unlocked(r, z, false, false);
    }

    BIG_ZONE_LOCK.lock();
    let mut big = r.big_zone_head;
    if !big.is_null() {
        big = (big as u64 ^ r.big_zone_next_mask) as *mut BigZone;
    }
    while !big.is_null() {
        crate::big::check_big_canary(r, big);

        let next = (*big).next;

        #[cfg(feature = "dtor-cleanup")]
        {
            let page = r.system_page_size;
            platform::unmap(
                (*big).user_pages_start.sub(page),
                (*big).size + (page << 1),
            );
            platform::unmap(
                crate::util::round_down_page(big as usize).wrapping_sub(page) as *mut u8,
                page * 3,
            );
        }

        if next.is_null() {
            break;
        }
        big = (next as u64 ^ r.big_zone_next_mask) as *mut BigZone;
    }
    BIG_ZONE_LOCK.unlock();

    #[cfg(feature = "dtor-cleanup")]
    {
        let page = r.system_page_size;
        platform::unmap(r.zones as *mut u8, r.zones_size - (page << 1));
        lookup::teardown();
        #[cfg(feature = "no-zero-allocations")]
        platform::unmap(zero_page(), page);
        let base = r.guard_below;
        let total = round_up_page(core::mem::size_of::<Root>()) + (page << 1);
        *ROOT.0.get() = ptr::null_mut();
        platform::unmap(base, total);
    }

    ROOT_LOCK.unlock();
}

/// Make the allocator temporarily unusable by revoking access to the
/// root record. The root lock stays held until `unprotect_root`.
///
/// # Safety
/// The allocator must be initialised. Every other thread touching the
/// heap will block on the root lock until the matching unprotect.
pub unsafe fn protect_root() {
    ROOT_LOCK.lock();
    let r = *ROOT.0.get();
    platform::protect_none(r as *mut u8, round_up_page(core::mem::size_of::<Root>()));
}

/// Restore access to the root and release the lock taken by
/// `protect_root`.
///
/// # Safety
/// Must pair with a prior `protect_root` on the same thread.
pub unsafe fn unprotect_root() {
    let r = *ROOT.0.get();
    platform::protect_read_write(r as *mut u8, round_up_page(core::mem::size_of::<Root>()));
    ROOT_LOCK.unlock();
}

/// Number of zone records currently in use, taken under the root lock.
/// Tooling and test hook.
///
/// # Safety
/// The allocator must be initialised.
pub unsafe fn zones_in_use() -> usize {
    ROOT_LOCK.lock();
    let used = root().zones_used as usize;
    ROOT_LOCK.unlock();
    used
}
