//! Destructors that interact with the heap while a sweep is in progress.

use std::cell::RefCell;
use std::rc::Rc;

use deferred_heap::{DeferredHeap, DeferredPtr, HeapRef};

use crate::counter;

/// Allocates a fresh object from inside its own destructor and parks the
/// handle outside the heap.
struct Spawner {
    heap: HeapRef,
    stash: Rc<RefCell<Option<DeferredPtr<u32>>>>,
}

impl Drop for Spawner {
    fn drop(&mut self) {
        if let Some(heap) = self.heap.upgrade() {
            let fresh = heap.make(7u32);
            *self.stash.borrow_mut() = Some(fresh);
        }
    }
}

#[test]
fn destructor_allocation_survives_the_sweep() {
    let heap = DeferredHeap::new();
    let stash = Rc::new(RefCell::new(None));
    drop(heap.make(Spawner {
        heap: heap.downgrade(),
        stash: stash.clone(),
    }));

    heap.collect();

    {
        let held = stash.borrow();
        let fresh = held.as_ref().expect("destructor ran and stashed a handle");
        assert!(!fresh.is_null());
        assert_eq!(**fresh, 7);
    }

    // The stashed root also survives a subsequent full collection.
    heap.collect();
    assert_eq!(**stash.borrow().as_ref().unwrap(), 7);
}

#[test]
fn teardown_suppresses_destructor_allocation() {
    let stash = Rc::new(RefCell::new(None));
    {
        let heap = DeferredHeap::new();
        let _held = heap.make(Spawner {
            heap: heap.downgrade(),
            stash: stash.clone(),
        });
        // Heap drops here with the Spawner still live: its destructor runs
        // during teardown, where the weak heap reference no longer
        // upgrades.
    }
    assert!(stash.borrow().is_none());
}

/// Pins its target for as long as the containing object lives: a root
/// handle stored as a field deregisters when the object's destructor runs.
struct Holder {
    held: Option<DeferredPtr<u32>>,
}

#[test]
fn root_field_unpins_when_its_container_is_swept() {
    let heap = DeferredHeap::new();
    let target = heap.make(5u32);
    drop(heap.make(Holder {
        held: Some(target.clone()),
    }));
    drop(target);

    // The holder is unreachable, but its root field pinned the target
    // through the mark phase of this collection.
    heap.collect();
    assert_eq!(heap.stats().allocations, 1);

    // With the holder gone, nothing roots the target any more.
    heap.collect();
    assert_eq!(heap.stats().allocations, 0);
}

#[test]
fn destructor_may_drop_foreign_handles() {
    struct DropsHandle {
        _held: DeferredPtr<u32>,
        hits: Rc<std::cell::Cell<usize>>,
    }

    impl Drop for DropsHandle {
        fn drop(&mut self) {
            self.hits.set(self.hits.get() + 1);
        }
    }

    let heap = DeferredHeap::new();
    let hits = counter();
    let value = heap.make(3u32);
    drop(heap.make(DropsHandle {
        _held: value,
        hits: hits.clone(),
    }));

    heap.collect();
    assert_eq!(hits.get(), 1);

    heap.collect();
    assert_eq!(heap.stats().allocations, 0);
}
