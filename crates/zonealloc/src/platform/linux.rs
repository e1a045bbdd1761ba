use core::ptr;

/// Address bits the random mapping hint may occupy. Keeps hints inside
/// the user portion of a 47-bit address space, page aligned.
const MMAP_HINT_MASK: u64 = 0x3FFF_FFFF_F000;

/// Map anonymous pages at a pseudo-random hint address.
///
/// # Safety
/// `size` must be page-aligned and non-zero.
pub unsafe fn map_pages(size: usize, populate: bool, prot: i32) -> *mut u8 {
    let hint = (crate::platform::rand_u64() & MMAP_HINT_MASK) as *mut libc::c_void;

    let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
    if populate && cfg!(feature = "pre-populate") {
        flags |= libc::MAP_POPULATE;
    }

    let result = libc::mmap(hint, size, prot, flags, -1, 0);
    if result == libc::MAP_FAILED {
        ptr::null_mut()
    } else {
        result as *mut u8
    }
}

/// Unmap memory.
///
/// # Safety
/// `ptr` must have been returned by `map_pages` with the same `size`.
pub unsafe fn unmap(ptr: *mut u8, size: usize) {
    libc::munmap(ptr as *mut libc::c_void, size);
}

/// Change the protection of a mapped region.
///
/// # Safety
/// Region must be valid and page-aligned.
pub unsafe fn protect(ptr: *mut u8, size: usize, prot: i32) {
    if libc::mprotect(ptr as *mut libc::c_void, size, prot) != 0 {
        crate::hardening::abort_with_message("zonealloc: mprotect failed\n");
    }
}

/// Pass an madvise hint for the region.
///
/// # Safety
/// Region must be valid.
pub unsafe fn advise(ptr: *mut u8, size: usize, advice: i32) {
    libc::madvise(ptr as *mut libc::c_void, size, advice);
}

/// Pin pages into memory. Failure is ignored; pinning is an optimization
/// against soft faults, not a correctness requirement.
///
/// # Safety
/// Region must be valid.
pub unsafe fn lock_pages(ptr: *mut u8, size: usize) {
    libc::mlock(ptr as *const libc::c_void, size);
}

/// Name an anonymous mapping via PR_SET_VMA. Unsupported kernels return
/// an error, which is ignored.
///
/// # Safety
/// Region must be valid. `name` must be NUL terminated.
#[cfg(feature = "named-mappings")]
pub unsafe fn name_pages(ptr: *mut u8, size: usize, name: &'static [u8]) {
    const PR_SET_VMA: libc::c_int = 0x53564d41;
    const PR_SET_VMA_ANON_NAME: libc::c_ulong = 0;
    libc::prctl(
        PR_SET_VMA,
        PR_SET_VMA_ANON_NAME,
        ptr as libc::c_ulong,
        size as libc::c_ulong,
        name.as_ptr() as libc::c_ulong,
    );
}

/// CPU core the calling thread is running on.
#[cfg(feature = "cpu-pin")]
pub fn current_cpu() -> i32 {
    unsafe { libc::sched_getcpu() }
}

pub fn query_page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size < 1 {
        4096
    } else {
        size as usize
    }
}

/// Draw 8 bytes from the OS entropy pool.
pub fn os_entropy() -> u64 {
    let mut seed = [0u8; 8];
    let read = unsafe {
        libc::getrandom(
            seed.as_mut_ptr() as *mut libc::c_void,
            seed.len(),
            0,
        )
    };
    if read == 8 {
        u64::from_ne_bytes(seed)
    } else {
        // getrandom can fail in a chroot without /dev; fall back to
        // mixing whatever address entropy the process carries.
        let stack = &seed as *const _ as u64;
        crate::platform::splitmix64(stack ^ 0x9E37_79B9_7F4A_7C15)
    }
}
