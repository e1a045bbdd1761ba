//! Two-phase lifecycle: a constructor-ordered eager initialisation at
//! process start, lazy initialisation on first use for early callers,
//! and an atexit-ordered audit at shutdown. The root stays usable after
//! teardown so destructors that still allocate keep working.

use crate::root;
use core::sync::atomic::{AtomicU8, Ordering};

const UNINIT: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;

pub static INIT_STATE: AtomicU8 = AtomicU8::new(UNINIT);

/// Library constructor -- runs before main().
#[used]
#[cfg_attr(target_os = "linux", link_section = ".init_array")]
#[cfg_attr(target_os = "macos", link_section = "__DATA,__mod_init_func")]
static CTOR: unsafe extern "C" fn() = {
    unsafe extern "C" fn init() {
        zonealloc_init();
    }
    init
};

extern "C" fn teardown_hook() {
    unsafe {
        root::teardown();
    }
}

/// Bring the allocator up exactly once; concurrent callers spin until
/// the winning thread finishes.
///
/// # Safety
/// Mapping failures during initialisation are fatal.
pub unsafe fn zonealloc_init() {
    match INIT_STATE.compare_exchange(UNINIT, INITIALIZING, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => {}
        Err(_) => {
            while INIT_STATE.load(Ordering::Acquire) != READY {
                core::hint::spin_loop();
            }
            return;
        }
    }

    root::initialize_global_root();
    libc::atexit(teardown_hook);

    INIT_STATE.store(READY, Ordering::Release);
}

/// Lazy entry for callers that beat the constructor.
#[inline(always)]
pub fn ensure_initialized() {
    if INIT_STATE.load(Ordering::Acquire) != READY {
        init_slow();
    }
}

#[cold]
#[inline(never)]
fn init_slow() {
    unsafe {
        zonealloc_init();
    }
}
