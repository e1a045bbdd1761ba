//! Big allocation path: one mapping per allocation above SMALL_SZ_MAX.
//!
//! Each big zone is two separate mappings. The user mapping is
//! guard + payload + guard. The metadata record lives at a random offset
//! inside its own page, itself bracketed by guard pages, so a leaked
//! user pointer tells an attacker nothing about where the record is.
//! Records form a singly-linked list whose head and next pointers are
//! XOR-masked with a process secret; the list is only walked under the
//! big zone lock.

use crate::config::{ALIGNMENT, BIG_SZ_MAX};
use crate::hardening::{abort_with_message, canary};
use crate::platform;
use crate::root::{Root, BIG_ZONE_LOCK};
use crate::util::{align_down, round_down_page, round_up_page};
use core::ptr;

/// Pages in a big zone metadata mapping: guard, record page, guard.
const META_PAGE_COUNT: usize = 3;

#[repr(C)]
pub struct BigZone {
    pub canary_a: u64,
    pub user_pages_start: *mut u8,
    /// Payload size, page-rounded.
    pub size: usize,
    pub free: bool,
    /// Next record; XOR-masked with the process secret when non-null.
    pub next: *mut BigZone,
    pub canary_b: u64,
}

#[inline(always)]
unsafe fn mask_next(root: &Root, p: *mut BigZone) -> *mut BigZone {
    (p as u64 ^ root.big_zone_next_mask) as *mut BigZone
}

/// Verify both record canaries, aborting on mismatch. Cheap enough to
/// run on every list step.
///
/// # Safety
/// `big` must point to a mapped record.
pub unsafe fn check_big_canary(root: &Root, big: *const BigZone) {
    let expected = canary::big_zone_canary(
        big as usize,
        (*big).user_pages_start as usize,
        root.big_zone_canary_secret,
    );

    if (*big).canary_a != expected {
        abort_with_message("zonealloc: big zone bottom canary has been corrupted\n");
    }

    if (*big).canary_b != expected {
        abort_with_message("zonealloc: big zone top canary has been corrupted\n");
    }
}

/// Allocate a big zone. Reuses a freed entry when one is large enough,
/// otherwise maps a new user region and metadata record and links it in.
///
/// # Safety
/// The root must be initialised. The big zone lock must not be held.
pub unsafe fn big_alloc(root: &mut Root, size: usize) -> *mut u8 {
    let rounded = round_up_page(size);
    if rounded < size || rounded > BIG_SZ_MAX {
        abort_with_message("zonealloc: big allocation request exceeds the size ceiling\n");
    }
    let size = rounded;
    let page = root.system_page_size;

    BIG_ZONE_LOCK.lock();

    let mut big = root.big_zone_head;
    if !big.is_null() {
        big = mask_next(root, big);
    }

    let mut last: *mut BigZone = ptr::null_mut();

    while !big.is_null() {
        check_big_canary(root, big);

        if (*big).free && (*big).size >= size {
            break;
        }

        last = big;

        if (*big).next.is_null() {
            big = ptr::null_mut();
            break;
        }
        big = mask_next(root, (*big).next);
    }

    if !big.is_null() {
        // The payload pages were advised away at free time, so the
        // kernel hands them back zeroed.
        (*big).free = false;
        let user = (*big).user_pages_start;
        BIG_ZONE_LOCK.unlock();
        return user;
    }

    // User data is mapped separately from the record so an overflow in
    // one cannot reach the other.
    let user_mapping = platform::map_rw_pages(size + (page << 1), true);
    if user_mapping.is_null() {
        BIG_ZONE_LOCK.unlock();
        return null_or_abort();
    }

    let meta_mapping = platform::map_rw_pages(page * META_PAGE_COUNT, false);
    if meta_mapping.is_null() {
        platform::unmap(user_mapping, size + (page << 1));
        BIG_ZONE_LOCK.unlock();
        return null_or_abort();
    }

    #[cfg(feature = "named-mappings")]
    {
        platform::name_pages(user_mapping, size + (page << 1), b"zonealloc big zone user data\0");
        platform::name_pages(meta_mapping, page * META_PAGE_COUNT, b"zonealloc big zone metadata\0");
    }

    platform::protect_none(meta_mapping, page);
    let record_page = meta_mapping.add(page);
    platform::advise_need(record_page, page);

    // Place the record at a random aligned offset inside its page.
    let span = page - core::mem::size_of::<BigZone>();
    let offset = align_down(
        (((platform::rand_u64() as u32 as u64) * span as u64) >> 32) as usize,
        ALIGNMENT,
    );
    let big = record_page.add(offset) as *mut BigZone;

    (*big).free = false;
    (*big).size = size;
    (*big).next = ptr::null_mut();

    if !last.is_null() {
        (*last).next = mask_next(root, big);
    }
    if root.big_zone_head.is_null() {
        root.big_zone_head = mask_next(root, big);
    }

    platform::protect_none(meta_mapping.add(page << 1), page);

    platform::protect_none(user_mapping, page);
    let user = user_mapping.add(page);
    platform::advise_need(user, size);
    platform::protect_none(user.add(size), page);

    (*big).user_pages_start = user;

    // Dual canaries bracket the record so a linear overwrite from either
    // direction trips one of them.
    let c = canary::big_zone_canary(big as usize, user as usize, root.big_zone_canary_secret);
    (*big).canary_a = c;
    (*big).canary_b = c;

    BIG_ZONE_LOCK.unlock();
    user
}

/// Find the big zone owning `p`, or null. A pointer into the interior
/// of a big allocation is fatal.
///
/// # Safety
/// The root must be initialised. The big zone lock must not be held.
pub unsafe fn find_big_zone(root: &mut Root, p: *mut u8) -> *mut BigZone {
    BIG_ZONE_LOCK.lock();

    let mut big = root.big_zone_head;
    if !big.is_null() {
        big = mask_next(root, big);
    }

    while !big.is_null() {
        check_big_canary(root, big);

        // Only a free of the exact base address is valid
        if p == (*big).user_pages_start {
            BIG_ZONE_LOCK.unlock();
            return big;
        }

        if p > (*big).user_pages_start && p < (*big).user_pages_start.add((*big).size) {
            abort_with_message("zonealloc: free of an interior big zone address\n");
        }

        if (*big).next.is_null() {
            break;
        }
        big = mask_next(root, (*big).next);
    }

    BIG_ZONE_LOCK.unlock();
    ptr::null_mut()
}

/// Free a big zone. A plain free marks the entry reusable and advises
/// the payload pages away; a permanent free also unlinks the record,
/// wipes it and turns both mappings inaccessible.
///
/// # Safety
/// `big` must be a record returned by [`find_big_zone`]. The big zone
/// lock must not be held.
pub unsafe fn free_big_zone(root: &mut Root, big: *mut BigZone, permanent: bool) {
    BIG_ZONE_LOCK.lock();

    if (*big).free {
        abort_with_message("zonealloc: double free of big zone detected\n");
    }

    #[cfg(feature = "sanitize-chunks")]
    crate::hardening::poison::poison_chunk((*big).user_pages_start, (*big).size);

    // Destructive on anonymous private mappings: the payload reads back
    // zeroed if the entry is ever reused.
    platform::advise_free((*big).user_pages_start, (*big).size);

    if !permanent {
        (*big).free = true;
        BIG_ZONE_LOCK.unlock();
        return;
    }

    // Unlink the record, patching the predecessor's masked next.
    let mut cur = root.big_zone_head;
    if !cur.is_null() {
        cur = mask_next(root, cur);
    }

    if cur == big {
        root.big_zone_head = (*big).next;
    } else {
        let mut found = false;
        while !cur.is_null() {
            check_big_canary(root, cur);

            if !(*cur).next.is_null() && mask_next(root, (*cur).next) == big {
                (*cur).next = (*big).next;
                found = true;
                break;
            }

            if (*cur).next.is_null() {
                break;
            }
            cur = mask_next(root, (*cur).next);
        }

        if !found {
            abort_with_message("zonealloc: big zone list has been corrupted\n");
        }
    }

    let page = root.system_page_size;
    platform::protect_none((*big).user_pages_start, (*big).size);
    ptr::write_bytes(big as *mut u8, crate::config::POISON_BYTE, core::mem::size_of::<BigZone>());
    platform::protect_none(round_down_page(big as usize) as *mut u8, page);

    BIG_ZONE_LOCK.unlock();
}

#[cold]
fn null_or_abort() -> *mut u8 {
    if cfg!(feature = "abort-on-null") {
        abort_with_message("zonealloc: configured to abort instead of returning null\n");
    }
    ptr::null_mut()
}
