#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(target_os = "linux")]
pub use linux as sys;

#[cfg(target_os = "macos")]
pub mod macos;
#[cfg(target_os = "macos")]
pub use macos as sys;

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Map anonymous pages with the given protection at a randomised hint
/// address. Returns null on failure.
///
/// # Safety
/// `size` must be non-zero. The size is rounded up to a page internally.
#[inline]
pub unsafe fn map_pages(size: usize, populate: bool, prot: i32) -> *mut u8 {
    sys::map_pages(crate::util::round_up_page(size), populate, prot)
}

/// Map anonymous read-write pages. Returns null on failure.
///
/// # Safety
/// `size` must be non-zero.
#[inline]
pub unsafe fn map_rw_pages(size: usize, populate: bool) -> *mut u8 {
    map_pages(size, populate, libc::PROT_READ | libc::PROT_WRITE)
}

/// Unmap previously mapped pages.
///
/// # Safety
/// `ptr` must have been returned by `map_pages` and `size` must match.
#[inline]
pub unsafe fn unmap(ptr: *mut u8, size: usize) {
    sys::unmap(ptr, crate::util::round_up_page(size));
}

/// Make a region inaccessible (guard pages, retired mappings).
///
/// # Safety
/// The region must be mapped and page-aligned.
#[inline]
pub unsafe fn protect_none(ptr: *mut u8, size: usize) {
    sys::protect(ptr, crate::util::round_up_page(size), libc::PROT_NONE);
}

/// Make a region readable and writable again.
///
/// # Safety
/// The region must be mapped and page-aligned.
#[inline]
pub unsafe fn protect_read_write(ptr: *mut u8, size: usize) {
    sys::protect(
        ptr,
        crate::util::round_up_page(size),
        libc::PROT_READ | libc::PROT_WRITE,
    );
}

/// Tell the kernel the region's contents are disposable. On Linux the
/// pages read back as zero after this.
///
/// # Safety
/// The region must be mapped.
#[inline]
pub unsafe fn advise_free(ptr: *mut u8, size: usize) {
    sys::advise(ptr, size, libc::MADV_DONTNEED);
}

/// Tell the kernel the region is about to be accessed.
///
/// # Safety
/// The region must be mapped.
#[inline]
pub unsafe fn advise_need(ptr: *mut u8, size: usize) {
    sys::advise(ptr, size, libc::MADV_WILLNEED);
}

/// Pin a region so hot metadata never takes a soft page fault.
/// Best effort: RLIMIT_MEMLOCK may deny it.
///
/// # Safety
/// The region must be mapped.
#[inline]
pub unsafe fn lock_pages(ptr: *mut u8, size: usize) {
    sys::lock_pages(ptr, size);
}

/// Label an anonymous mapping in /proc/self/maps.
///
/// # Safety
/// The region must be mapped. `name` must be NUL terminated.
#[cfg(feature = "named-mappings")]
#[inline]
pub unsafe fn name_pages(ptr: *mut u8, size: usize, name: &'static [u8]) {
    sys::name_pages(ptr, size, name);
}

/// CPU core the calling thread is currently scheduled on.
#[cfg(feature = "cpu-pin")]
#[inline]
pub fn current_cpu() -> i32 {
    sys::current_cpu()
}

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// System page size, cached after the first query.
#[inline]
pub fn page_size() -> usize {
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let size = sys::query_page_size();
    PAGE_SIZE.store(size, Ordering::Relaxed);
    size
}

/// Fast, non-cryptographic random u64. The generator is xorshift64*
/// with per-thread state seeded from OS entropy, so the sequence is
/// secret but cheap to advance.
pub fn rand_u64() -> u64 {
    use core::cell::Cell;

    thread_local! {
        static RNG_STATE: Cell<u64> = const { Cell::new(0) };
    }

    let result = RNG_STATE.try_with(|state| {
        let mut s = state.get();
        if s == 0 {
            s = sys::os_entropy() | 1;
        }
        // xorshift64*
        s ^= s >> 12;
        s ^= s << 25;
        s ^= s >> 27;
        state.set(s);
        s.wrapping_mul(0x2545_F491_4F6C_DD1D)
    });

    match result {
        Ok(val) => val,
        Err(_) => {
            // TLS not available (early init or thread destruction)
            static COUNTER: AtomicU64 = AtomicU64::new(0);
            let count = COUNTER.fetch_add(1, Ordering::Relaxed);
            splitmix64(sys::os_entropy() ^ count)
        }
    }
}

/// splitmix64 finalizer.
#[inline(always)]
pub fn splitmix64(mut x: u64) -> u64 {
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^= x >> 31;
    x
}
