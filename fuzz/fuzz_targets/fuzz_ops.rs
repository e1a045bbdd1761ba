#![no_main]

use libfuzzer_sys::fuzz_target;

/// Interpret the input as a sequence of allocator operations.
///
/// Each operation is encoded as:
///   byte 0: opcode (0=alloc, 1=free, 2=realloc, 3=calloc, 4=free_size,
///           5=verify)
///   byte 1-2: size (little-endian u16)
///   byte 3: slot index (which tracked pointer to operate on)
///
/// We track up to 64 live pointers. Any abort is a finding: a legal op
/// sequence must never trip a hardening check.
const MAX_SLOTS: usize = 64;

fuzz_target!(|data: &[u8]| {
    let mut slots: [*mut u8; MAX_SLOTS] = [std::ptr::null_mut(); MAX_SLOTS];
    let mut sizes: [usize; MAX_SLOTS] = [0; MAX_SLOTS];

    let mut i = 0;
    while i + 4 <= data.len() {
        let opcode = data[i] % 6;
        let size = u16::from_le_bytes([data[i + 1], data[i + 2]]) as usize;
        let slot = (data[i + 3] as usize) % MAX_SLOTS;
        i += 4;

        unsafe {
            match opcode {
                0 => {
                    if !slots[slot].is_null() {
                        zonealloc::free(slots[slot]);
                    }
                    let p = zonealloc::alloc(size);
                    slots[slot] = p;
                    sizes[slot] = size;
                    if !p.is_null() && size > 0 {
                        std::ptr::write_bytes(p, 0xAA, size.min(256));
                    }
                }
                1 => {
                    if !slots[slot].is_null() {
                        zonealloc::free(slots[slot]);
                        slots[slot] = std::ptr::null_mut();
                        sizes[slot] = 0;
                    }
                }
                2 => {
                    let p = zonealloc::realloc(slots[slot], size);
                    if size == 0 {
                        slots[slot] = std::ptr::null_mut();
                        sizes[slot] = 0;
                    } else if !p.is_null() {
                        slots[slot] = p;
                        sizes[slot] = size;
                    }
                }
                3 => {
                    if !slots[slot].is_null() {
                        zonealloc::free(slots[slot]);
                    }
                    let nmemb = (size >> 8).max(1);
                    let elem = (size & 0xFF).max(1);
                    let p = zonealloc::calloc(nmemb, elem);
                    slots[slot] = p;
                    sizes[slot] = nmemb * elem;
                    if !p.is_null() {
                        let check = (nmemb * elem).min(256);
                        for j in 0..check {
                            assert_eq!(*p.add(j), 0, "calloc memory not zeroed at {}", j);
                        }
                    }
                }
                4 => {
                    if !slots[slot].is_null() {
                        if sizes[slot] == 0 {
                            zonealloc::free(slots[slot]);
                        } else {
                            // Stating the original request size must
                            // always be accepted.
                            zonealloc::free_size(slots[slot], sizes[slot]);
                        }
                        slots[slot] = std::ptr::null_mut();
                        sizes[slot] = 0;
                    }
                }
                5 => {
                    zonealloc::verify_all();
                }
                _ => unreachable!(),
            }
        }
    }

    // Cleanup
    unsafe {
        for slot in &mut slots {
            if !slot.is_null() {
                zonealloc::free(*slot);
                *slot = std::ptr::null_mut();
            }
        }
        zonealloc::flush_caches();
        zonealloc::verify_all();
    }
});
