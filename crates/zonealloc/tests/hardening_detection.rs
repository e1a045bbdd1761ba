//! Hardening verification tests.
//!
//! Each detection (double free, canary corruption, misaligned free, big
//! zone abuse) aborts the process, so the scenarios run as subprocesses:
//! we spawn the test binary with a scenario name in the environment and
//! check that the child dies with the expected diagnostic on stderr.

use std::ptr;

// ---------------------------------------------------------------------------
// Helper: run a subprocess that executes a specific scenario and check
// that it aborts with the expected message on stderr.
// ---------------------------------------------------------------------------

fn expect_abort_subprocess(scenario_name: &str, expected_msg: &str) {
    let exe = std::env::current_exe().expect("cannot determine test binary path");

    let output = std::process::Command::new(&exe)
        .env("ZONEALLOC_HARDENING_SCENARIO", scenario_name)
        // Run the scenario driver test; it detects the env var, runs
        // the scenario and aborts before any assertion fires.
        .arg("--exact")
        .arg("scenario_driver")
        .arg("--nocapture")
        .env("RUST_TEST_THREADS", "1")
        .output()
        .expect("failed to spawn subprocess");

    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(
        !output.status.success(),
        "subprocess for scenario '{}' should have aborted, but exited cleanly. stderr:\n{}",
        scenario_name,
        stderr
    );

    assert!(
        stderr.contains(expected_msg),
        "subprocess for scenario '{}' stderr does not contain '{}'. Full stderr:\n{}",
        scenario_name,
        expected_msg,
        stderr
    );
}

// ---------------------------------------------------------------------------
// Scenario driver: when ZONEALLOC_HARDENING_SCENARIO is set, run the
// requested scenario instead of normal test assertions.
// ---------------------------------------------------------------------------

#[test]
fn scenario_driver() {
    let scenario = match std::env::var("ZONEALLOC_HARDENING_SCENARIO") {
        Ok(s) => s,
        Err(_) => return, // Not a subprocess invocation; skip.
    };

    match scenario.as_str() {
        "double_free" => scenario_double_free(),
        "big_double_free" => scenario_big_double_free(),
        "canary_corruption" => scenario_canary_corruption(),
        "misaligned_free" => scenario_misaligned_free(),
        "off_chunk_free" => scenario_off_chunk_free(),
        "big_interior_free" => scenario_big_interior_free(),
        "wild_free" => scenario_wild_free(),
        "calloc_overflow" => scenario_calloc_overflow(),
        "free_size_mismatch" => scenario_free_size_mismatch(),
        "private_zone_misuse" => scenario_private_zone_misuse(),
        _ => panic!("unknown scenario: {}", scenario),
    }
}

/// Free the same chunk twice. `free_size` skips the quarantine, so the
/// second call hits the bitmap state check deterministically.
fn scenario_double_free() {
    unsafe {
        let p = zonealloc::alloc(32);
        assert!(!p.is_null());
        zonealloc::free_size(p, 32);
        zonealloc::free_size(p, 32);
    }
    unreachable!("double free was not detected");
}

/// Free the same big allocation twice.
fn scenario_big_double_free() {
    unsafe {
        let p = zonealloc::alloc(5 * 1024 * 1024);
        assert!(!p.is_null());
        zonealloc::free(p);
        zonealloc::free(p);
    }
    unreachable!("big zone double free was not detected");
}

/// Corrupt the canary a free writes into the chunk, then audit.
fn scenario_canary_corruption() {
    unsafe {
        let p = zonealloc::alloc(64);
        assert!(!p.is_null());
        zonealloc::free_size(p, 64);

        // The freed chunk now starts with a canary; flip one byte of it.
        // The chunk stays mapped, its zone is still live.
        p.add(2).write(0xFF);

        zonealloc::verify_all();
    }
    unreachable!("canary corruption was not detected");
}

/// Free a pointer that is not aligned to the allocator's minimum.
fn scenario_misaligned_free() {
    unsafe {
        let p = zonealloc::alloc(32);
        assert!(!p.is_null());
        zonealloc::free_permanently(p.add(1));
    }
    unreachable!("misaligned free was not detected");
}

/// Free an aligned pointer that is not a chunk base.
fn scenario_off_chunk_free() {
    unsafe {
        let p = zonealloc::alloc(32);
        assert!(!p.is_null());
        zonealloc::free_permanently(p.add(8));
    }
    unreachable!("off-chunk free was not detected");
}

/// Free an interior address of a big allocation.
fn scenario_big_interior_free() {
    unsafe {
        let p = zonealloc::alloc(5 * 1024 * 1024);
        assert!(!p.is_null());
        zonealloc::free(p.add(4096));
    }
    unreachable!("interior big zone free was not detected");
}

/// Free a stack address the allocator never handed out.
fn scenario_wild_free() {
    unsafe {
        let mut stack_var: u64 = 0xDEAD;
        zonealloc::free(&mut stack_var as *mut u64 as *mut u8);
    }
    unreachable!("wild free was not detected");
}

/// calloc with a product that overflows usize.
fn scenario_calloc_overflow() {
    unsafe {
        let p = zonealloc::calloc(usize::MAX, 2);
        assert!(p.is_null(), "overflowing calloc returned memory");
    }
    unreachable!("calloc overflow was not detected");
}

/// free_size with a size larger than the owning zone's chunks.
fn scenario_free_size_mismatch() {
    unsafe {
        let p = zonealloc::alloc(32);
        assert!(!p.is_null());
        zonealloc::free_size(p, 100_000);
    }
    unreachable!("free_size mismatch was not detected");
}

/// Ask a private zone for more than its chunk size.
fn scenario_private_zone_misuse() {
    unsafe {
        let zone = zonealloc::new_zone(64).expect("new_zone failed");
        let p = zonealloc::zone_alloc(zone, 2000);
        assert!(p.is_null());
    }
    unreachable!("private zone misuse was not detected");
}

// ---------------------------------------------------------------------------
// The actual tests, one subprocess each.
// ---------------------------------------------------------------------------

#[test]
fn double_free_detected() {
    expect_abort_subprocess("double_free", "double free of chunk detected");
}

#[test]
fn big_double_free_detected() {
    expect_abort_subprocess("big_double_free", "double free of big zone detected");
}

#[test]
fn canary_corruption_detected() {
    expect_abort_subprocess("canary_corruption", "canary at beginning of chunk");
}

#[test]
fn misaligned_free_detected() {
    expect_abort_subprocess("misaligned_free", "not correctly aligned");
}

#[test]
fn off_chunk_free_detected() {
    expect_abort_subprocess("off_chunk_free", "not a multiple of the chunk size");
}

#[test]
fn big_interior_free_detected() {
    expect_abort_subprocess("big_interior_free", "interior big zone address");
}

#[test]
fn wild_free_detected() {
    expect_abort_subprocess("wild_free", "could not find any zone for pointer");
}

#[test]
fn calloc_overflow_detected() {
    expect_abort_subprocess("calloc_overflow", "calloc request would overflow");
}

#[test]
fn free_size_mismatch_detected() {
    expect_abort_subprocess("free_size_mismatch", "invalid size for chunk");
}

#[test]
fn private_zone_misuse_detected() {
    expect_abort_subprocess(
        "private_zone_misuse",
        "private zone cannot hold chunks of this size",
    );
}

// ---------------------------------------------------------------------------
// In-process checks that do not abort.
// ---------------------------------------------------------------------------

/// A freed chunk carries a canary at both ends derived from a secret;
/// two chunks never share a canary value.
#[test]
fn freed_chunks_carry_distinct_canaries() {
    unsafe {
        let p = zonealloc::alloc(64);
        let q = zonealloc::alloc(64);
        assert!(!p.is_null() && !q.is_null());
        zonealloc::free_size(p, 64);
        zonealloc::free_size(q, 64);

        let canary_p = (p as *const u64).read();
        let canary_q = (q as *const u64).read();
        assert_ne!(canary_p, 0, "freed chunk has no leading canary");
        assert_ne!(canary_p, canary_q, "canaries must differ per chunk");

        // The high byte is sacrificed against string leaks.
        assert_eq!(canary_p >> 56, 0);
        assert_eq!(canary_q >> 56, 0);
    }
}

#[cfg(feature = "sanitize-chunks")]
#[test]
fn freed_chunk_body_is_poisoned() {
    unsafe {
        let p = zonealloc::alloc(256);
        assert!(!p.is_null());
        ptr::write_bytes(p, 0xAA, 256);
        zonealloc::free_size(p, 256);

        // Between the leading and trailing canary words the body holds
        // the poison byte.
        let body = std::slice::from_raw_parts(p.add(8), 256 - 16);
        assert!(
            body.iter().all(|&b| b == 0xDE),
            "freed chunk body not poisoned"
        );
    }
}

#[cfg(not(feature = "sanitize-chunks"))]
#[test]
fn freed_chunk_keeps_canary_words_only() {
    unsafe {
        let p = zonealloc::alloc(256);
        assert!(!p.is_null());
        ptr::write_bytes(p, 0xAA, 256);
        zonealloc::free_size(p, 256);

        // Without sanitize-chunks only the two canary words change.
        let body = std::slice::from_raw_parts(p.add(8), 256 - 16);
        assert!(
            body.iter().all(|&b| b == 0xAA),
            "free overwrote more than the canary words"
        );
    }
}
