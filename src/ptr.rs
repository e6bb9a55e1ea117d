//! Tracked pointer types.
//!
//! Two handle flavors share one type-erased core:
//!
//! - [`DeferredPtr<T>`] is the *root* handle held in ordinary Rust
//!   variables. Its core is heap-allocated so the address the heap tracks
//!   stays stable when the handle value moves. It enregisters with the
//!   heap's root set on creation and deregisters on drop.
//! - [`CellPtr<T>`] is the *interior* handle stored directly inside managed
//!   memory (fields of managed objects, elements of managed arrays). In-heap
//!   allocations never move, so the cell's own address identifies the
//!   allocation that contains it; the collector discovers these cells by
//!   walking per-page lists rather than scanning raw memory.
//!
//! The single rule destructors must obey: any handle to another managed
//! object may be observed as null inside a destructor. The collector nulls
//! every unreached handle before running any destructor, which is what makes
//! cycles safe and resurrection impossible.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::mem;
use std::ops::{Deref, Index};
use std::ptr::{self, NonNull};
use std::rc::{Rc, Weak};

use crate::heap::{DeferredHeap, HeapSpace};
#[cfg(debug_assertions)]
use crate::page::Found;

/// Type-erased handle core: one raw target address plus the enregistration
/// state. This is the unit the heap tracks, for roots and interior cells
/// alike.
pub(crate) struct RawCell {
    target: Cell<*mut u8>,
    registered: Cell<bool>,
}

impl RawCell {
    pub(crate) fn new(target: *mut u8) -> Self {
        Self {
            target: Cell::new(target),
            registered: Cell::new(false),
        }
    }

    pub(crate) fn target(&self) -> *mut u8 {
        self.target.get()
    }

    pub(crate) fn set_target(&self, target: *mut u8) {
        self.target.set(target);
    }

    pub(crate) fn is_registered(&self) -> bool {
        self.registered.get()
    }

    pub(crate) fn mark_registered(&self) {
        self.registered.set(true);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DeferredPtr - root handle
// ═══════════════════════════════════════════════════════════════════════════════

/// A tracked root pointer to a heap-managed object.
///
/// While a non-null `DeferredPtr` exists, its target (and everything
/// reachable from it through [`CellPtr`] fields) survives collection.
/// Dropping the handle deregisters it; the target becomes collectable once
/// nothing else reaches it.
///
/// A handle may be null: after [`Default`] construction, after
/// [`reset`](Self::reset), or because the heap it belonged to was torn
/// down. [`Deref`] panics on null; use [`get`](Self::get) to observe
/// nullness.
pub struct DeferredPtr<T> {
    core: NonNull<RawCell>,
    space: Weak<RefCell<HeapSpace>>,
    _marker: PhantomData<*const T>,
}

impl<T> DeferredPtr<T> {
    /// Create a registered handle. Must be called with the heap interior
    /// unborrowed.
    pub(crate) fn new_registered(target: *mut u8, space: &Rc<RefCell<HeapSpace>>) -> Self {
        let core = NonNull::from(Box::leak(Box::new(RawCell::new(target))));
        space.borrow_mut().enregister_root(core);
        Self {
            core,
            space: Rc::downgrade(space),
            _marker: PhantomData,
        }
    }

    /// A registered null handle on `heap`.
    pub fn null(heap: &DeferredHeap) -> Self {
        Self::new_registered(ptr::null_mut(), &heap.space)
    }

    fn core(&self) -> &RawCell {
        // SAFETY: the core box lives until our Drop.
        unsafe { self.core.as_ref() }
    }

    /// The raw target address. Null handles yield a null pointer.
    pub fn as_ptr(&self) -> *const T {
        self.core().target() as *const T
    }

    pub fn is_null(&self) -> bool {
        self.core().target().is_null()
    }

    /// Borrow the target, or `None` for a null handle.
    pub fn get(&self) -> Option<&T> {
        let p = self.as_ptr();
        if p.is_null() {
            None
        } else {
            // SAFETY: a non-null target is kept alive by this handle's
            // registration for as long as the borrow of `self` lasts.
            Some(unsafe { &*p })
        }
    }

    /// Null the handle. Enregistration is unchanged: only construction and
    /// drop move a handle in or out of the heap's tracking.
    pub fn reset(&mut self) {
        self.core().set_target(ptr::null_mut());
    }

    /// Retarget this handle at `source`'s target.
    ///
    /// A default-constructed handle attaches to `source`'s heap here; an
    /// already-tracked handle just has its target replaced.
    pub fn set(&mut self, source: &DeferredPtr<T>) {
        if !self.core().is_registered() {
            if let Some(space) = source.space.upgrade() {
                self.space = source.space.clone();
                space.borrow_mut().enregister_root(self.core);
            }
        }
        self.core().set_target(source.core().target());
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // Checked pointer arithmetic
    // ═══════════════════════════════════════════════════════════════════════════════

    /// A handle displaced by `count` elements.
    ///
    /// In debug builds the result is validated against the owning
    /// allocation: the new address must stay inside it, except that the
    /// one-past-the-end position of the allocation start is always
    /// representable (just not dereferenceable). Release builds perform the
    /// raw displacement.
    pub fn offset(&self, count: isize) -> DeferredPtr<T> {
        #[cfg(debug_assertions)]
        self.check_offset(count);
        let out = self.clone();
        let byte_count = count * mem::size_of::<T>() as isize;
        out.core()
            .set_target(self.core().target().wrapping_offset(byte_count));
        out
    }

    #[cfg(debug_assertions)]
    fn check_offset(&self, count: isize) {
        let target = self.core().target();
        assert!(
            !target.is_null(),
            "pointer arithmetic on a null deferred pointer"
        );
        let space = self
            .space
            .upgrade()
            .expect("pointer arithmetic on a handle whose heap is gone");
        let space = space.borrow();

        let (here_page, here) = space
            .find_page_info(target)
            .expect("corrupt deferred pointer: target outside managed memory");
        assert!(
            here.found > Found::InRangeUnallocated,
            "corrupt deferred pointer: target in unallocated memory"
        );

        let probe = target.wrapping_offset(count * mem::size_of::<T>() as isize);
        let there = space.find_page_info(probe);
        let (there_page, there) = match there {
            Some(found) => found,
            None => panic!("pointer arithmetic leaves the managed pages"),
        };
        assert!(
            here_page == there_page,
            "pointer arithmetic leaves the page"
        );
        // From an allocation start, forming a pointer to the next element is
        // always legal (one-past-the-end of a single-element allocation);
        // otherwise source and destination must share a start location,
        // which the sentinel byte guarantees for in-bounds array positions.
        assert!(
            (here.found == Found::InRangeAllocatedStart && (count == 0 || count == 1))
                || (there.found > Found::InRangeUnallocated
                    && there.start_location == here.start_location),
            "pointer arithmetic leaves the allocation"
        );
    }

    /// Element distance between two handles into the same allocation.
    ///
    /// Two null handles compare at distance zero. Debug builds verify both
    /// handles address one allocation.
    pub fn offset_from(&self, other: &DeferredPtr<T>) -> isize {
        let a = self.core().target();
        let b = other.core().target();
        if a == b {
            return 0;
        }

        #[cfg(debug_assertions)]
        {
            assert!(
                !a.is_null() && !b.is_null(),
                "cannot subtract deferred pointers when one is null"
            );
            let space = self
                .space
                .upgrade()
                .or_else(|| other.space.upgrade())
                .expect("pointer subtraction on handles whose heap is gone");
            let space = space.borrow();
            let (a_page, a_info) = space
                .find_page_info(a)
                .expect("corrupt deferred pointer: target outside managed memory");
            let (b_page, b_info) = space
                .find_page_info(b)
                .expect("corrupt deferred pointer: target outside managed memory");
            assert!(
                b_info.found > Found::InRangeUnallocated,
                "corrupt deferred pointer: target in unallocated memory"
            );
            assert!(a_page == b_page, "pointer subtraction across pages");
            assert!(
                (b_info.found == Found::InRangeAllocatedStart
                    && a as usize == b as usize + mem::size_of::<T>())
                    || (a_info.start_location == b_info.start_location
                        && a_info.found > Found::InRangeUnallocated),
                "pointer subtraction across allocations"
            );
        }

        (a as isize - b as isize) / mem::size_of::<T>() as isize
    }
}

impl<T> Default for DeferredPtr<T> {
    /// A null handle attached to no heap. It attaches lazily if it is ever
    /// [`set`](Self::set) from a tracked handle.
    fn default() -> Self {
        Self {
            core: NonNull::from(Box::leak(Box::new(RawCell::new(ptr::null_mut())))),
            space: Weak::new(),
            _marker: PhantomData,
        }
    }
}

impl<T> Clone for DeferredPtr<T> {
    fn clone(&self) -> Self {
        let core = NonNull::from(Box::leak(Box::new(RawCell::new(self.core().target()))));
        let space = self.space.clone();
        if let Some(strong) = space.upgrade() {
            strong.borrow_mut().enregister_root(core);
        }
        Self {
            core,
            space,
            _marker: PhantomData,
        }
    }
}

impl<T> Drop for DeferredPtr<T> {
    fn drop(&mut self) {
        if self.core().is_registered() {
            if let Some(space) = self.space.upgrade() {
                space.borrow_mut().deregister_root(self.core);
            }
        }
        // SAFETY: the core was leaked from a Box in exactly one place and
        // is owned by this handle.
        unsafe { drop(Box::from_raw(self.core.as_ptr())) };
    }
}

impl<T> Deref for DeferredPtr<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.get()
            .expect("attempt to dereference a null deferred pointer")
    }
}

impl<T> Index<usize> for DeferredPtr<T> {
    type Output = T;

    #[cfg(debug_assertions)]
    fn index(&self, index: usize) -> &T {
        // Route through the checked arithmetic path; the temporary handle
        // exercises the full registration protocol.
        let probe = self.offset(index as isize);
        let p = probe.as_ptr();
        // SAFETY: the offset check proved p stays within the allocation
        // rooted by self.
        unsafe { &*p }
    }

    #[cfg(not(debug_assertions))]
    fn index(&self, index: usize) -> &T {
        // SAFETY: as in C-style indexing, the caller keeps the index inside
        // the allocation; debug builds verify this.
        unsafe { &*self.as_ptr().add(index) }
    }
}

impl<T> PartialEq for DeferredPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.core().target() == other.core().target()
    }
}

impl<T> Eq for DeferredPtr<T> {}

impl<T> PartialOrd for DeferredPtr<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for DeferredPtr<T> {
    /// Total order by raw target address.
    fn cmp(&self, other: &Self) -> Ordering {
        (self.core().target() as usize).cmp(&(other.core().target() as usize))
    }
}

impl<T> Hash for DeferredPtr<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.core().target() as usize).hash(state);
    }
}

impl<T> fmt::Debug for DeferredPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredPtr")
            .field("target", &self.core().target())
            .field("registered", &self.core().is_registered())
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CellPtr - interior handle
// ═══════════════════════════════════════════════════════════════════════════════

/// A tracked pointer cell stored inside managed memory.
///
/// Use this type for handle fields of managed objects and for elements of
/// managed arrays; it is what lets the collector trace edges between
/// allocations. A `CellPtr` starts null and attaches to its owning page the
/// first time it receives a target — [`set`](Self::set) panics if the cell
/// does not live inside heap-managed memory.
///
/// Inside a destructor a `CellPtr` may read as null even if it was set: the
/// collector nulls every unreached handle before destructors run.
pub struct CellPtr<T> {
    raw: RawCell,
    _marker: PhantomData<*const T>,
}

impl<T> CellPtr<T> {
    /// A null cell.
    pub fn new() -> Self {
        Self {
            raw: RawCell::new(ptr::null_mut()),
            _marker: PhantomData,
        }
    }

    pub fn is_null(&self) -> bool {
        self.raw.target().is_null()
    }

    /// Point this cell at `source`'s target.
    ///
    /// Panics if this cell is not stored inside memory managed by
    /// `source`'s heap.
    pub fn set(&self, source: &DeferredPtr<T>) {
        if !self.raw.is_registered() {
            if let Some(space) = source.space.upgrade() {
                space.borrow_mut().enregister_cell(NonNull::from(&self.raw));
            }
        }
        self.raw.set_target(source.core().target());
    }

    /// Null this cell. Enregistration is unchanged.
    pub fn clear(&self) {
        self.raw.set_target(ptr::null_mut());
    }

    /// Re-root the cell's target as a fresh root handle, for traversal.
    /// The result is null if the cell is.
    pub fn load(&self, heap: &DeferredHeap) -> DeferredPtr<T> {
        DeferredPtr::new_registered(self.raw.target(), &heap.space)
    }

    /// Borrow the target, or `None` for a null cell.
    ///
    /// The borrow is tied to the cell, which lives inside an allocation the
    /// caller must be keeping alive (it reached the cell somehow).
    pub fn get(&self) -> Option<&T> {
        let p = self.raw.target() as *const T;
        if p.is_null() {
            None
        } else {
            // SAFETY: a traced non-null cell target is only freed after the
            // cell itself has been nulled.
            Some(unsafe { &*p })
        }
    }
}

impl<T> Default for CellPtr<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for CellPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CellPtr")
            .field("target", &self.raw.target())
            .field("registered", &self.raw.is_registered())
            .finish()
    }
}
