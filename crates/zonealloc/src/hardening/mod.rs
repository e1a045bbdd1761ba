pub mod canary;
pub mod poison;
pub mod verify;

/// Abort with a diagnostic message to stderr.
/// This is used when unrecoverable corruption is detected; nothing is
/// recovered, a detected anomaly is treated as adversarial.
#[cold]
#[inline(never)]
pub fn abort_with_message(msg: &str) -> ! {
    unsafe {
        // Write directly to stderr fd (2) -- no allocation needed
        libc::write(2, msg.as_ptr() as *const libc::c_void, msg.len());
        libc::abort();
    }
}
