//! Collect-before-expand behavior and page sizing.

use deferred_heap::{DeferredHeap, HeapConfig};

/// A u32 costs 5 bytes (value + sentinel) = 2 chunks of 4; the first page
/// holds 4096 / 4 = 1024 locations, so 512 of these fill it exactly.
const FILL_COUNT: usize = 512;

#[test]
fn config_defaults_to_expanding() {
    let heap = DeferredHeap::new();
    assert!(!heap.collect_before_expand());

    let heap = DeferredHeap::with_config(HeapConfig {
        collect_before_expand: true,
    });
    assert!(heap.collect_before_expand());

    heap.set_collect_before_expand(false);
    assert!(!heap.collect_before_expand());
}

#[test]
fn full_page_expands_by_default() {
    let heap = DeferredHeap::new();
    let garbage: Vec<_> = (0..FILL_COUNT).map(|i| heap.make(i as u32)).collect();
    assert_eq!(heap.stats().pages, 1);
    drop(garbage);

    let p = heap.make(99u32);
    assert_eq!(*p, 99);
    assert_eq!(heap.stats().pages, 2);
}

#[test]
fn collect_before_expand_reuses_freed_space() {
    let heap = DeferredHeap::new();
    let garbage: Vec<_> = (0..FILL_COUNT).map(|i| heap.make(i as u32)).collect();
    assert_eq!(heap.stats().pages, 1);
    assert_eq!(heap.stats().allocations, FILL_COUNT);
    drop(garbage);

    heap.set_collect_before_expand(true);
    let p = heap.make(99u32);
    assert_eq!(*p, 99);

    // The collection freed the garbage; the request fit without a new page.
    assert_eq!(heap.stats().pages, 1);
    assert_eq!(heap.stats().allocations, 1);
}

#[test]
fn collect_before_expand_still_expands_when_everything_is_rooted() {
    let heap = DeferredHeap::with_config(HeapConfig {
        collect_before_expand: true,
    });
    let rooted: Vec<_> = (0..FILL_COUNT).map(|i| heap.make(i as u32)).collect();
    assert_eq!(heap.stats().pages, 1);

    let p = heap.make(7u32);
    assert_eq!(*p, 7);
    assert_eq!(heap.stats().pages, 2);
    assert_eq!(heap.stats().allocations, FILL_COUNT + 1);
    drop(rooted);
}

#[test]
fn new_page_is_tuned_to_the_request() {
    let heap = DeferredHeap::new();
    let _small = heap.make(1u8);
    assert_eq!(heap.stats().pages, 1);

    // 16 KiB of u64s cannot fit the first page in any form.
    let big = heap.make_array::<u64>(2048);
    assert!(!big.is_null());
    assert_eq!(heap.stats().pages, 2);
    assert_eq!(big.offset(2048).offset_from(&big), 2048);
}
