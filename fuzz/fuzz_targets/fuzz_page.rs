#![no_main]

use deferred_heap::page::{Found, Page};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Limit input size to keep iterations fast.
    if data.len() > 4_096 {
        return;
    }

    let Ok(mut page) = Page::new(4_096, 8, 8) else {
        return;
    };
    let mut live: Vec<*mut u8> = Vec::new();

    let mut bytes = data.iter().copied();
    while let Some(op) = bytes.next() {
        match op % 3 {
            // Allocate 1..=32 elements of 8 bytes.
            0 => {
                let n = (bytes.next().unwrap_or(1) as usize % 32) + 1;
                if let Some(p) = page.allocate(n, 8, 8) {
                    let info = page.contains_info(p.as_ptr());
                    assert_eq!(info.found, Found::InRangeAllocatedStart);
                    live.push(p.as_ptr());
                }
            }
            // Deallocate one live allocation.
            1 => {
                if !live.is_empty() {
                    let index = bytes.next().unwrap_or(0) as usize % live.len();
                    let p = live.swap_remove(index);
                    page.deallocate(p);
                    assert_eq!(page.contains_info(p).found, Found::InRangeUnallocated);
                }
            }
            // Probe: every live start must resolve to itself, and interior
            // addresses must walk back to it.
            _ => {
                for &p in &live {
                    let info = page.contains_info(p);
                    assert_eq!(info.found, Found::InRangeAllocatedStart);
                    let interior = page.contains_info(unsafe { p.add(1) });
                    assert!(interior.found > Found::InRangeUnallocated);
                    assert_eq!(interior.start_location, info.start_location);
                }
            }
        }
    }
});
