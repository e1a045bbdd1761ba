#![no_main]

use libfuzzer_sys::fuzz_target;

// Fuzz target that exercises size boundaries across the small/big
// split. Interprets input as a series of u32 sizes, allocates, writes
// the full usable extent, verifies alignment and usable size, frees.

fuzz_target!(|data: &[u8]| {
    let mut i = 0;
    while i + 4 <= data.len() {
        let raw_size = u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
        i += 4;

        // Cap to 1 MiB so the fuzzer crosses SMALL_SZ_MAX without OOM.
        let size = (raw_size as usize) % (1024 * 1024);
        if size == 0 {
            continue;
        }

        unsafe {
            let ptr = zonealloc::alloc(size);
            if ptr.is_null() {
                continue; // mapping pressure is not a finding
            }

            assert_eq!(
                (ptr as usize) % zonealloc::config::ALIGNMENT,
                0,
                "alloc({}) returned unaligned pointer {:p}",
                size,
                ptr
            );

            let usable = zonealloc::chunk_size(ptr);
            assert!(
                usable >= size,
                "chunk_size({}) = {} < requested {}",
                size,
                usable,
                size
            );

            // The whole usable extent must be writable.
            std::ptr::write_bytes(ptr, 0xBB, usable);
            for j in 0..size.min(4096) {
                assert_eq!(*ptr.add(j), 0xBB);
            }

            zonealloc::free_size(ptr, size);

            if size < 65536 {
                let cptr = zonealloc::calloc(1, size);
                if !cptr.is_null() {
                    for j in 0..size.min(4096) {
                        assert_eq!(*cptr.add(j), 0, "calloc not zeroed at {}", j);
                    }
                    zonealloc::free(cptr);
                }
            }
        }
    }
});
