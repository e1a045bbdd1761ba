//! End-to-end exercise of the `GlobalAlloc` adapter: every allocation
//! in this test binary, the harness included, goes through the zone
//! allocator.

use zonealloc::ZoneAlloc;

#[global_allocator]
static GLOBAL: ZoneAlloc = ZoneAlloc;

#[test]
fn basic_alloc_and_free() {
    let boxed = Box::new(42u64);
    assert_eq!(*boxed, 42);
    drop(boxed);

    let mut v: Vec<u32> = Vec::new();
    for i in 0..1000 {
        v.push(i);
    }
    assert_eq!(v.len(), 1000);
    assert_eq!(v[999], 999);
    drop(v);

    let s = String::from("hello, zonealloc global allocator!");
    assert_eq!(s, "hello, zonealloc global allocator!");
    drop(s);
}

#[test]
fn zero_size_alloc() {
    let mut v: Vec<()> = Vec::new();
    for _ in 0..100 {
        v.push(());
    }
    assert_eq!(v.len(), 100);
    drop(v);

    let v: Vec<u8> = Vec::new();
    assert_eq!(v.len(), 0);
    drop(v);
}

#[test]
fn realloc_through_vec_growth() {
    let mut v: Vec<u8> = Vec::with_capacity(16);
    for i in 0u8..200 {
        v.push(i);
    }
    for i in 0u8..200 {
        assert_eq!(v[i as usize], i);
    }
}

#[test]
fn aligned_alloc() {
    use std::alloc::{alloc, dealloc, Layout};

    unsafe {
        let layout = Layout::from_size_align(256, 128).unwrap();
        let ptr = alloc(layout);
        assert!(!ptr.is_null(), "128-byte aligned allocation returned null");
        assert_eq!(ptr as usize % 128, 0, "not 128-byte aligned: {:p}", ptr);

        core::ptr::write(ptr, 0xAB);
        core::ptr::write(ptr.add(255), 0xCD);
        assert_eq!(core::ptr::read(ptr), 0xAB);
        assert_eq!(core::ptr::read(ptr.add(255)), 0xCD);

        dealloc(ptr, layout);
    }
}

#[test]
fn alloc_zeroed_works() {
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    unsafe {
        let layout = Layout::from_size_align(1024, 16).unwrap();
        let ptr = alloc_zeroed(layout);
        assert!(!ptr.is_null());

        let slice = core::slice::from_raw_parts(ptr, 1024);
        assert!(
            slice.iter().all(|&b| b == 0),
            "alloc_zeroed did not return zeroed memory"
        );

        dealloc(ptr, layout);
    }
}

#[test]
fn large_collections_take_the_big_path() {
    // A megabyte-scale Vec exceeds SMALL_SZ_MAX and lands on the big
    // allocation path; growth walks it through several reallocations.
    let mut v: Vec<u64> = Vec::new();
    for i in 0..300_000u64 {
        v.push(i);
    }
    assert_eq!(v[299_999], 299_999);
    drop(v);

    unsafe {
        zonealloc::verify_all();
    }
}

#[test]
fn nested_structures() {
    use std::collections::HashMap;

    let mut map: HashMap<String, Vec<u64>> = HashMap::new();
    for i in 0..100u64 {
        map.entry(format!("bucket-{}", i % 7)).or_default().push(i);
    }
    assert_eq!(map.len(), 7);
    let total: usize = map.values().map(Vec::len).sum();
    assert_eq!(total, 100);
}
