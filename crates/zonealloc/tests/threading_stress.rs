//! Thread stress tests: heavy concurrent alloc/free traffic must not
//! corrupt the heap, deadlock, or trip any hardening check.

use std::ptr;
use std::sync::{Arc, Barrier};
use std::thread;

// ---------------------------------------------------------------------------
// N threads doing rapid alloc/free cycles
// ---------------------------------------------------------------------------

fn stress_alloc_free_n_threads(num_threads: usize) {
    const ITERATIONS: usize = 10_000;
    const ALLOC_SIZE: usize = 128;

    let barrier = Arc::new(Barrier::new(num_threads));

    let handles: Vec<_> = (0..num_threads)
        .map(|_| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                unsafe {
                    for _ in 0..ITERATIONS {
                        let p = zonealloc::alloc(ALLOC_SIZE);
                        assert!(!p.is_null(), "alloc returned null under contention");
                        ptr::write_bytes(p, 0xCC, ALLOC_SIZE);
                        zonealloc::free(p);
                    }
                    // Drain this thread's quarantine before it exits so
                    // the chunks return to their zones.
                    zonealloc::flush_caches();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("thread panicked during alloc/free stress");
    }

    unsafe {
        zonealloc::verify_all();
    }
}

#[test]
fn stress_alloc_free_4_threads() {
    stress_alloc_free_n_threads(4);
}

#[test]
fn stress_alloc_free_8_threads() {
    stress_alloc_free_n_threads(8);
}

// ---------------------------------------------------------------------------
// Mixed sizes, interleaved lifetimes
// ---------------------------------------------------------------------------

#[test]
fn stress_mixed_sizes() {
    const THREADS: usize = 4;
    const ROUNDS: usize = 500;

    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                unsafe {
                    let mut live: Vec<(*mut u8, usize)> = Vec::new();
                    for round in 0..ROUNDS {
                        let size = match (round + t) % 5 {
                            0 => 16,
                            1 => 100,
                            2 => 1024,
                            3 => 4096,
                            _ => 200_000, // big path
                        };
                        let p = zonealloc::alloc(size);
                        assert!(!p.is_null());
                        ptr::write_bytes(p, round as u8, size.min(4096));
                        live.push((p, size));

                        if live.len() >= 16 {
                            for (p, _) in live.drain(..) {
                                zonealloc::free(p);
                            }
                        }
                    }
                    for (p, _) in live.drain(..) {
                        zonealloc::free(p);
                    }
                    zonealloc::flush_caches();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("thread panicked in mixed-size stress");
    }

    unsafe {
        zonealloc::verify_all();
    }
}

// ---------------------------------------------------------------------------
// Cross-thread free: thread A allocates, thread B frees
// ---------------------------------------------------------------------------

/// Wrapper to send raw chunk pointers across threads. The allocator is
/// thread-safe; ownership moves with the pointer.
#[derive(Clone, Copy)]
struct SendPtr(*mut u8);
unsafe impl Send for SendPtr {}
unsafe impl Sync for SendPtr {}

#[test]
fn cross_thread_free() {
    const COUNT: usize = 1_000;
    const SIZE: usize = 64;

    let (tx, rx) = std::sync::mpsc::channel::<SendPtr>();

    let producer = thread::spawn(move || unsafe {
        for _ in 0..COUNT {
            let p = zonealloc::alloc(SIZE);
            assert!(!p.is_null());
            ptr::write_bytes(p, 0xDD, SIZE);
            tx.send(SendPtr(p)).expect("consumer hung up");
        }
    });

    let consumer = thread::spawn(move || unsafe {
        for received in rx {
            zonealloc::free(received.0);
        }
        zonealloc::flush_caches();
    });

    producer.join().expect("producer panicked");
    consumer.join().expect("consumer panicked");

    unsafe {
        zonealloc::verify_all();
    }
}
