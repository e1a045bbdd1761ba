//! Full-heap integrity audit. Walks every zone bitmap verifying the
//! canary of every chunk that should carry one, checks the size-chain
//! links, and validates both canaries of every big zone record.

use crate::big::{self, BigZone};
use crate::config::{BITS_PER_CHUNK, BITS_PER_QWORD, BITS_PER_QWORD_SHIFT};
use crate::hardening::{abort_with_message, canary};
use crate::root::{self, BIG_ZONE_LOCK, ROOT_LOCK};
use crate::util::get_bit;
use crate::zone::Zone;

/// Audit the whole heap. Takes the root lock, then the big zone lock;
/// this is the one place that ordering is permitted.
///
/// # Safety
/// The allocator must be initialised.
pub unsafe fn verify_all_zones() {
    ROOT_LOCK.lock();
    verify_all_zones_unlocked();
    ROOT_LOCK.unlock();
}

/// Audit one zone.
///
/// # Safety
/// The allocator must be initialised. `zone` must be a live zone.
pub unsafe fn verify_zone(zone: *mut Zone) {
    ROOT_LOCK.lock();
    verify_zone_unlocked(zone);
    ROOT_LOCK.unlock();
}

/// # Safety
/// Requires the root lock.
pub unsafe fn verify_all_zones_unlocked() {
    let r = root::root();

    for i in 0..r.zones_used {
        let zone = r.zones.add(i as usize);

        // A record with null region pointers was never built; treat it
        // as the end of the populated zones.
        if (*zone).bitmap_start.is_null() || (*zone).user_pages_start.is_null() {
            break;
        }

        verify_zone_unlocked(zone);
    }

    BIG_ZONE_LOCK.lock();
    let mut big = r.big_zone_head;
    if !big.is_null() {
        big = (big as u64 ^ r.big_zone_next_mask) as *mut BigZone;
    }
    while !big.is_null() {
        big::check_big_canary(r, big);
        if (*big).next.is_null() {
            break;
        }
        big = ((*big).next as u64 ^ r.big_zone_next_mask) as *mut BigZone;
    }
    BIG_ZONE_LOCK.unlock();
}

/// # Safety
/// Requires the root lock. `zone` must be a live zone with pointers at
/// rest.
pub unsafe fn verify_zone_unlocked(zone: *mut Zone) {
    let r = root::root();
    let guard = (*zone).unmasked();

    if guard.next_sz_index > r.zones_used {
        abort_with_message("zonealloc: corrupted next_sz_index in zone\n");
    }

    if guard.next_sz_index != 0 {
        let linked = r.zones.add(guard.next_sz_index as usize);
        if guard.chunk_size != (*linked).chunk_size {
            abort_with_message("zonealloc: inconsistent chunk sizes in zone size chain\n");
        }
    }

    let bm = guard.bitmap();
    for i in 0..bm.max_index() {
        let word = bm.word(i);

        // Chunks whose high bit is set carry a canary: freed chunks and
        // canary chunks alike.
        let mut j = 0u64;
        while j < BITS_PER_QWORD {
            if get_bit(word, j + 1) == 1 {
                let bit_slot = ((i as u64) << BITS_PER_QWORD_SHIFT) + j;
                let p = guard.chunk_ptr(bit_slot);
                canary::check_canary(&guard, p);
            }
            j += BITS_PER_CHUNK;
        }
    }
}
