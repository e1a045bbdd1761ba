use core::ptr;

/// Address bits the random mapping hint may occupy.
const MMAP_HINT_MASK: u64 = 0x3FFF_FFFF_F000;

/// Map anonymous pages at a pseudo-random hint address.
/// macOS has no MAP_POPULATE; the populate flag is ignored.
///
/// # Safety
/// `size` must be page-aligned and non-zero.
pub unsafe fn map_pages(size: usize, populate: bool, prot: i32) -> *mut u8 {
    let _ = populate;
    let hint = (crate::platform::rand_u64() & MMAP_HINT_MASK) as *mut libc::c_void;

    let result = libc::mmap(
        hint,
        size,
        prot,
        libc::MAP_PRIVATE | libc::MAP_ANON,
        -1,
        0,
    );
    if result == libc::MAP_FAILED {
        ptr::null_mut()
    } else {
        result as *mut u8
    }
}

/// # Safety
/// `ptr` must have been returned by `map_pages` with the same `size`.
pub unsafe fn unmap(ptr: *mut u8, size: usize) {
    libc::munmap(ptr as *mut libc::c_void, size);
}

/// # Safety
/// Region must be valid and page-aligned.
pub unsafe fn protect(ptr: *mut u8, size: usize, prot: i32) {
    if libc::mprotect(ptr as *mut libc::c_void, size, prot) != 0 {
        crate::hardening::abort_with_message("zonealloc: mprotect failed\n");
    }
}

/// # Safety
/// Region must be valid.
pub unsafe fn advise(ptr: *mut u8, size: usize, advice: i32) {
    libc::madvise(ptr as *mut libc::c_void, size, advice);
}

/// # Safety
/// Region must be valid.
pub unsafe fn lock_pages(ptr: *mut u8, size: usize) {
    libc::mlock(ptr as *const libc::c_void, size);
}

/// Mapping names are a Linux feature; no-op here.
///
/// # Safety
/// Region must be valid.
#[cfg(feature = "named-mappings")]
pub unsafe fn name_pages(_ptr: *mut u8, _size: usize, _name: &'static [u8]) {}

/// macOS has no stable per-CPU query for unprivileged code.
#[cfg(feature = "cpu-pin")]
pub fn current_cpu() -> i32 {
    0
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
    let rc = unsafe { libc::getentropy(seed.as_mut_ptr() as *mut libc::c_void, seed.len()) };
    if rc == 0 {
        u64::from_ne_bytes(seed)
    } else {
        let stack = &seed as *const _ as u64;
        crate::platform::splitmix64(stack ^ 0x9E37_79B9_7F4A_7C15)
    }
}
