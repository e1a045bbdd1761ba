//! Build-time configuration.
//!
//! Changing these values can significantly shift the performance or the
//! security posture of a workload. Most of them feed directly into how
//! zones are sized and scanned, so read the comments before touching
//! anything.

/// Byte size of the user region of every zone. Each zone holds
/// `ZONE_USER_SIZE / chunk_size` chunks.
pub const ZONE_USER_SIZE: usize = 4 * 1024 * 1024;

/// Minimum alignment of every pointer handed out, and the alignment a
/// pointer must carry to be accepted by free.
pub const ALIGNMENT: usize = 8;

/// Smallest chunk size a zone will ever be created for. Requests below
/// this are rounded up. Never set below 16: a chunk must be able to hold
/// a leading and a trailing canary word.
pub const SMALLEST_CHUNK_SZ: usize = 16;

/// Largest request the zone engine services. Anything above this goes
/// to the big allocation path. Capped at a 32nd of the user region so
/// every zone holds at least 32 chunks and its bitmap fills whole
/// 64-bit words; a partial trailing word would read as free slots
/// beyond the user region.
pub const SMALL_SZ_MAX: usize = ZONE_USER_SIZE / 32;

/// Hard ceiling for a single big allocation.
pub const BIG_SZ_MAX: usize = 64 * 1024 * 1024 * 1024;

/// Zones are created at startup for these chunk sizes. Runtime zone
/// creation is not limited to this set.
pub const DEFAULT_ZONE_SIZES: [usize; 10] =
    [16, 32, 64, 128, 256, 512, 1024, 2048, 4096, 8192];

/// Default zones should never hold chunks above this size. The allocator
/// bases several decisions on it, e.g. which zones receive canary chunks
/// and which zones are ever retired.
pub const MAX_DEFAULT_ZONE_SZ: usize = 8192;

/// Capacity of the zone metadata array. The zone record is roughly 2 KiB,
/// so this bounds zone metadata at about 17 MiB.
pub const MAX_ZONES: usize = 8192;

/// What fraction of a zone's chunks become canary chunks: one in
/// `CANARY_COUNT_DIV`. At 100 that sets aside 1% of chunks.
pub const CANARY_COUNT_DIV: u64 = 100;

/// Canary values drop their high byte so an unbounded string read that
/// runs into a canary cannot leak all eight bytes of it.
pub const CANARY_VALIDATE_MASK: u64 = 0x00FF_FFFF_FFFF_FFFF;

/// Size of the per-zone free bit slot cache. 255 keeps the one-byte
/// cursors from ever overflowing.
pub const BIT_SLOT_CACHE_SZ: usize = 255;

/// Entries in the per-thread most-recently-used zone cache.
pub const ZONE_CACHE_SZ: usize = 8;

/// Entries in the per-thread deferred free quarantine.
pub const CHUNK_QUARANTINE_SZ: usize = 64;

/// A zone with no live chunks is destroyed and rebuilt once its lifetime
/// allocation count exceeds `chunk_count * ZONE_ALLOC_RETIRE`. This
/// breaks long-lived address reuse patterns.
pub const ZONE_ALLOC_RETIRE: u64 = 32;

/// A zone wastes too much memory for a request when its chunk size is at
/// least `size << WASTED_SZ_MULTIPLIER_SHIFT`. Only applied to requests
/// above 1024 bytes; small chunks can live with the slack.
pub const WASTED_SZ_MULTIPLIER_SHIFT: usize = 3;

/// Byte written over freed chunk bodies.
pub const POISON_BYTE: u8 = 0xDE;

/// A bit slot addresses the 2-bit state of one chunk:
/// `(word_index << 6) + bit_offset`, always even.
pub type BitSlot = u64;

/// Sentinel for "no bit slot".
pub const BAD_BIT_SLOT: BitSlot = u64::MAX;

/// A bitmap word where every chunk is in the allocated state (low bit
/// set, high bit clear, 32 times over). Words at or above this value
/// cannot contain a never-used chunk and are skipped by the slow scan.
pub const ALLOCATED_BITSLOTS: u64 = 0x5555_5555_5555_5555;

/// Bits of bitmap state per chunk.
pub const BITS_PER_CHUNK: u64 = 2;
pub const BITS_PER_CHUNK_SHIFT: u64 = 1;

pub const BITS_PER_QWORD: u64 = 64;
pub const BITS_PER_QWORD_SHIFT: u64 = 6;

/// One tag byte per chunk when memory tagging is enabled.
#[cfg(feature = "memory-tagging")]
pub const MEM_TAG_SIZE: usize = 1;

/// Bit position where a chunk's tag is folded into a tagged pointer.
#[cfg(feature = "memory-tagging")]
pub const UNTAGGED_BITS: u64 = 56;
