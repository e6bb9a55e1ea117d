//! Deferred (garbage-collected) heap with cycle-safe tracked pointers.
//!
//! Objects are allocated through a [`DeferredHeap`] and referred to only
//! through tracked handles: [`DeferredPtr`] for roots held in ordinary Rust
//! variables, [`CellPtr`] for edges stored inside managed objects. A call
//! to [`DeferredHeap::collect`] traces reachability from the roots, nulls
//! every handle into unreachable objects, then runs those objects'
//! destructors and reclaims their storage. Because every handle into a
//! collected object is nulled *before* any destructor runs, cycles are
//! reclaimed safely and resurrection is impossible; the one rule destructor
//! code must follow is that any handle it inspects may be null.
//!
//! # Example
//!
//! ```
//! use deferred_heap::{CellPtr, DeferredHeap};
//!
//! struct Node {
//!     value: i32,
//!     next: CellPtr<Node>,
//! }
//!
//! let heap = DeferredHeap::new();
//! let a = heap.make(Node { value: 1, next: CellPtr::new() });
//! let b = heap.make(Node { value: 2, next: CellPtr::new() });
//!
//! // Build a cycle: a -> b -> a.
//! a.next.set(&b);
//! b.next.set(&a);
//! assert_eq!(a.next.get().unwrap().value, 2);
//!
//! // Drop both roots; the cycle is unreachable and gets reclaimed.
//! drop(a);
//! drop(b);
//! heap.collect();
//! assert_eq!(heap.stats().allocations, 0);
//! ```

pub mod bitmap;
pub(crate) mod destructors;
pub mod error;
pub mod heap;
pub mod page;
pub mod ptr;

pub use error::AllocError;
pub use heap::{DeferredHeap, HeapConfig, HeapRef, HeapStats};
pub use ptr::{CellPtr, DeferredPtr};
