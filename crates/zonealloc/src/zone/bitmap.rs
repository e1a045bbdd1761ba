//! Two bits of bitmap state per chunk, low bit first:
//!
//! | low | high | meaning                                   |
//! |-----|------|-------------------------------------------|
//! |  0  |  0   | never used                                |
//! |  1  |  0   | currently allocated                       |
//! |  0  |  1   | previously allocated, now free (canaried) |
//! |  1  |  1   | canary chunk, permanently reserved        |
//!
//! Each 64 bit word holds the state of 32 chunks.

use crate::config::{
    BitSlot, ALIGNMENT, ALLOCATED_BITSLOTS, BAD_BIT_SLOT, BITS_PER_CHUNK, BITS_PER_QWORD,
    BITS_PER_QWORD_SHIFT, BIT_SLOT_CACHE_SZ,
};
use crate::platform;
use crate::util::get_bit;

/// Split a bit slot into its bitmap word index and in-word bit offset.
#[inline(always)]
pub fn bit_slot_coords(bit_slot: BitSlot) -> (usize, u64) {
    (
        (bit_slot >> BITS_PER_QWORD_SHIFT) as usize,
        bit_slot & (BITS_PER_QWORD - 1),
    )
}

/// Word-level view of a zone bitmap. Holds the unmasked bitmap base, so
/// a view must never outlive the unmasked window it was created in.
pub struct Bitmap {
    words: *mut u64,
    max_index: usize,
}

impl Bitmap {
    /// # Safety
    /// `start` must point to `size` bytes of mapped bitmap storage.
    #[inline]
    pub unsafe fn new(start: *mut u8, size: usize) -> Self {
        Bitmap {
            words: start as *mut u64,
            max_index: size >> 3,
        }
    }

    #[inline]
    pub fn max_index(&self) -> usize {
        self.max_index
    }

    /// # Safety
    /// `idx` must be below `max_index`.
    #[inline(always)]
    pub unsafe fn word(&self, idx: usize) -> u64 {
        self.words.add(idx).read()
    }

    /// # Safety
    /// `idx` must be below `max_index`.
    #[inline(always)]
    pub unsafe fn set_word(&self, idx: usize, word: u64) {
        self.words.add(idx).write(word);
    }

    /// Refill the free slot cache by scanning forward from a random word.
    /// The random start protects against biasing the free list towards
    /// the front of the user mapping; the bitmap end is a hard stop, so
    /// the cache may come back shorter than its capacity.
    ///
    /// # Safety
    /// The bitmap storage must be mapped and writable.
    pub unsafe fn refill_cache(&self, cache: &mut FreeSlotCache) {
        let max = self.max_index;

        let mut bm_idx = if max > ALIGNMENT {
            (((platform::rand_u64() as u32 as u64) * (max as u64 - 1)) >> 32) as usize
        } else {
            0
        };

        cache.reset();
        let mut collected = 0usize;

        'scan: while bm_idx < max {
            let word = self.word(bm_idx);
            let mut j = 0u64;
            while j < BITS_PER_QWORD {
                if collected >= BIT_SLOT_CACHE_SZ {
                    break 'scan;
                }
                if get_bit(word, j) == 0 {
                    cache.slots[collected] =
                        ((bm_idx as u64) << BITS_PER_QWORD_SHIFT) + j;
                    collected += 1;
                }
                j += BITS_PER_CHUNK;
            }
            bm_idx += 1;
        }

        #[cfg(feature = "shuffle-bit-slot-cache")]
        if collected > 1 {
            // Fisher-Yates, decorrelates the free order from the scan order
            let mut i = collected - 1;
            while i > 0 {
                let j = (platform::rand_u64() % (i as u64 + 1)) as usize;
                cache.slots.swap(i, j);
                i -= 1;
            }
        }

        cache.index = collected as u8;
    }

    /// Find the first bitmap word with no state at all; its first slot
    /// is free.
    ///
    /// # Safety
    /// The bitmap storage must be mapped.
    pub unsafe fn scan_first_empty_word(&self) -> BitSlot {
        for i in 0..self.max_index {
            if self.word(i) == 0 {
                return (i as u64) << BITS_PER_QWORD_SHIFT;
            }
        }
        BAD_BIT_SLOT
    }

    /// Bit-by-bit scan for a clear low bit. Words that encode a full
    /// complement of allocated chunks are skipped in one comparison.
    ///
    /// # Safety
    /// The bitmap storage must be mapped.
    pub unsafe fn scan_slow(&self) -> BitSlot {
        for i in 0..self.max_index {
            let word = self.word(i);
            if word >= ALLOCATED_BITSLOTS {
                continue;
            }
            let mut j = 0u64;
            while j < BITS_PER_QWORD {
                if get_bit(word, j) == 0 {
                    return ((i as u64) << BITS_PER_QWORD_SHIFT) + j;
                }
                j += BITS_PER_CHUNK;
            }
        }
        BAD_BIT_SLOT
    }
}

/// Queue of known-free bit slots. `index` is the write cursor, `usable`
/// the read cursor; the cache is empty once `usable` catches `index`.
#[repr(C)]
pub struct FreeSlotCache {
    pub slots: [BitSlot; BIT_SLOT_CACHE_SZ],
    pub index: u8,
    pub usable: u8,
}

impl FreeSlotCache {
    pub const fn new() -> Self {
        FreeSlotCache {
            slots: [BAD_BIT_SLOT; BIT_SLOT_CACHE_SZ],
            index: 0,
            usable: 0,
        }
    }

    pub fn reset(&mut self) {
        self.slots = [BAD_BIT_SLOT; BIT_SLOT_CACHE_SZ];
        self.index = 0;
        self.usable = 0;
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.usable >= self.index
    }

    /// Take the next cached slot, or BAD_BIT_SLOT on underflow. The
    /// consumed entry is overwritten so a corrupted cursor cannot hand
    /// the same slot out twice.
    pub fn dequeue(&mut self) -> BitSlot {
        if self.usable as usize >= BIT_SLOT_CACHE_SZ || self.usable >= self.index {
            return BAD_BIT_SLOT;
        }
        let slot = self.slots[self.usable as usize];
        self.slots[self.usable as usize] = BAD_BIT_SLOT;
        self.usable += 1;
        slot
    }

    /// Append a freed slot. A full cache drops the slot silently; the
    /// next refill rediscovers it by scanning the bitmap.
    pub fn insert(&mut self, slot: BitSlot) {
        if self.index as usize >= BIT_SLOT_CACHE_SZ {
            return;
        }
        self.slots[self.index as usize] = slot;
        self.index += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    fn make_bitmap(words: usize) -> (Bitmap, *mut u8, Layout) {
        let layout = Layout::array::<u64>(words).unwrap();
        let storage = unsafe { alloc_zeroed(layout) };
        let bm = unsafe { Bitmap::new(storage, words * 8) };
        (bm, storage, layout)
    }

    #[test]
    fn cache_dequeue_and_underflow() {
        let mut cache = FreeSlotCache::new();
        cache.insert(0);
        cache.insert(2);
        assert!(!cache.is_empty());
        assert_eq!(cache.dequeue(), 0);
        assert_eq!(cache.dequeue(), 2);
        assert!(cache.is_empty());
        assert_eq!(cache.dequeue(), BAD_BIT_SLOT);
    }

    #[test]
    fn cache_drops_on_overflow() {
        let mut cache = FreeSlotCache::new();
        for i in 0..BIT_SLOT_CACHE_SZ as u64 {
            cache.insert(i * 2);
        }
        // 256th insert is silently dropped
        cache.insert(9000);
        assert_eq!(cache.index as usize, BIT_SLOT_CACHE_SZ);
        for i in 0..BIT_SLOT_CACHE_SZ as u64 {
            assert_eq!(cache.dequeue(), i * 2);
        }
        assert_eq!(cache.dequeue(), BAD_BIT_SLOT);
    }

    #[test]
    fn refill_collects_free_slots() {
        let (bm, storage, layout) = make_bitmap(4);
        let mut cache = FreeSlotCache::new();
        unsafe {
            // Mark every chunk of word 0 allocated
            bm.set_word(0, ALLOCATED_BITSLOTS);
            bm.refill_cache(&mut cache);
        }
        // 3 words of 32 free chunks each may be visible depending on the
        // random start; at minimum the scan reached the end
        assert!(cache.index as usize <= 3 * 32);
        while !cache.is_empty() {
            let slot = cache.dequeue();
            assert_eq!(slot & 1, 0, "bit slots are always even");
            assert!(slot >= 64, "word 0 is fully allocated");
        }
        unsafe { dealloc(storage, layout) };
    }

    #[test]
    fn scans_find_first_free() {
        let (bm, storage, layout) = make_bitmap(4);
        unsafe {
            bm.set_word(0, ALLOCATED_BITSLOTS);
            bm.set_word(1, 0b01); // one allocated chunk
            assert_eq!(bm.scan_first_empty_word(), 2 << BITS_PER_QWORD_SHIFT);
            // slow scan sees the free chunk next to the allocated one
            assert_eq!(bm.scan_slow(), (1 << BITS_PER_QWORD_SHIFT) + 2);
        }
        unsafe { dealloc(storage, layout) };
    }

    #[test]
    fn coords_roundtrip() {
        let (word, bit) = bit_slot_coords((3 << BITS_PER_QWORD_SHIFT) + 10);
        assert_eq!(word, 3);
        assert_eq!(bit, 10);
    }
}
