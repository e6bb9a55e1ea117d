//! The deferred heap: storage, tracking, and the mark-sweep collector.
//!
//! `HeapSpace` is the internal state (pages, root set, destructor registry);
//! [`DeferredHeap`] is the public shared wrapper over it, and [`HeapRef`] is
//! the weak variant handles and destructors hold. The split mirrors the
//! one rule the collector depends on: destructor thunks are only ever
//! invoked while the heap interior is unborrowed, so destructors may freely
//! allocate, drop handles, and query the heap they are running on.

use std::cell::RefCell;
use std::fmt;
use std::mem;
use std::ptr::{self, NonNull};
use std::rc::{Rc, Weak};

use rustc_hash::FxHashSet;

use crate::bitmap::Bitmap;
use crate::destructors::{run_records, DestructorRecord, DestructorRegistry, DropFn};
use crate::error::AllocError;
use crate::page::{ContainsInfo, Found, Page};
use crate::ptr::{DeferredPtr, RawCell};

/// Each new page holds at least 1 + φ ≈ 2.62 copies of the request that
/// triggered it.
const PAGE_GROWTH: f64 = 2.62;
const MIN_PAGE_BYTES: usize = 4096;
const MIN_CHUNK_BYTES: usize = 4;

/// Heap construction options.
#[derive(Debug, Clone, Default)]
pub struct HeapConfig {
    /// Run a collection before creating a new page when existing pages
    /// cannot satisfy an allocation.
    pub collect_before_expand: bool,
}

/// A point-in-time snapshot of heap bookkeeping, for tests and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapStats {
    /// Number of storage pages.
    pub pages: usize,
    /// Number of live allocations (start locations) across all pages.
    pub allocations: usize,
    /// Number of tracked root handles.
    pub roots: usize,
    /// Number of tracked interior cells across all pages.
    pub tracked_cells: usize,
    /// Number of registered destructor records.
    pub destructor_records: usize,
}

/// An interior handle known to live within a page, with the transient
/// mark-phase level: 0 means unreached, anything else records the BFS pass
/// that first reached it.
struct TrackedCell {
    cell: NonNull<RawCell>,
    level: usize,
}

/// A storage page coupled with its mark bitmap and the interior handles
/// that live within it.
struct PageRecord {
    page: Page,
    live_starts: Bitmap,
    cells: Vec<TrackedCell>,
}

impl PageRecord {
    /// A page tuned to hold the request that triggered it: chunk size of
    /// max(element size, element alignment, 4) bytes, total of at least
    /// max(2.62 × request, 4096) bytes.
    fn for_request(n: usize, elem_size: usize, elem_align: usize) -> Result<Self, AllocError> {
        let chunk = elem_size.max(elem_align).max(MIN_CHUNK_BYTES);
        let request = elem_size.saturating_mul(n);
        let total = ((request as f64 * PAGE_GROWTH) as usize).max(MIN_PAGE_BYTES);
        let page = Page::new(total, chunk, elem_align.max(mem::align_of::<usize>()))?;
        let locations = page.locations();
        Ok(PageRecord {
            page,
            live_starts: Bitmap::new(locations),
            cells: Vec::new(),
        })
    }

    fn mark_live(&mut self, start_ptr: *const u8) {
        let info = self.page.contains_info(start_ptr);
        debug_assert_eq!(info.found, Found::InRangeAllocatedStart);
        self.live_starts.set(info.start_location, true);
    }
}

/// One step of sweep work: an unreached allocation and its extracted
/// destructor batch. The batch runs with the heap interior unborrowed.
struct SweepStep {
    page_index: usize,
    resume_location: usize,
    start: *mut u8,
    end: *mut u8,
    batch: Vec<DestructorRecord>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// HeapSpace - internal state
// ═══════════════════════════════════════════════════════════════════════════════

pub(crate) struct HeapSpace {
    pages: Vec<PageRecord>,
    roots: FxHashSet<NonNull<RawCell>>,
    dtors: DestructorRegistry,
    collect_before_expand: bool,
}

impl HeapSpace {
    fn new(config: HeapConfig) -> Self {
        Self {
            pages: Vec::new(),
            roots: FxHashSet::default(),
            dtors: DestructorRegistry::new(),
            collect_before_expand: config.collect_before_expand,
        }
    }

    // ─── Handle tracking ───────────────────────────────────────────────────

    /// Track a root handle core. Invoked when a root handle is created.
    pub(crate) fn enregister_root(&mut self, cell: NonNull<RawCell>) {
        assert!(self.roots.insert(cell), "duplicate root registration");
        // SAFETY: the caller guarantees the core outlives its registration.
        unsafe { cell.as_ref().mark_registered() };
    }

    /// Stop tracking a root handle core. Invoked when a root handle is
    /// dropped (teardown suppresses this by failing the weak upgrade).
    pub(crate) fn deregister_root(&mut self, cell: NonNull<RawCell>) {
        assert!(
            self.roots.remove(&cell),
            "attempt to deregister an untracked root handle"
        );
    }

    /// Track an interior cell. Invoked the first time a `CellPtr` receives
    /// a target; the cell's own address must lie within a managed page.
    pub(crate) fn enregister_cell(&mut self, cell: NonNull<RawCell>) {
        let site = cell.as_ptr() as *const u8;
        let page_index = self
            .page_index_of(site)
            .expect("CellPtr stored outside managed memory");
        let record = &mut self.pages[page_index];
        debug_assert!(
            !record.cells.iter().any(|t| t.cell == cell),
            "duplicate cell registration"
        );
        record.cells.push(TrackedCell { cell, level: 0 });
        // SAFETY: the cell lives in page storage the heap owns.
        unsafe { cell.as_ref().mark_registered() };
    }

    fn page_index_of(&self, addr: *const u8) -> Option<usize> {
        self.pages.iter().position(|rec| rec.page.contains(addr))
    }

    /// Locate `addr` within the managed pages, resolving its allocation
    /// start. Used by the mark step and by debug-mode pointer arithmetic.
    pub(crate) fn find_page_info(&self, addr: *const u8) -> Option<(usize, ContainsInfo)> {
        for (index, rec) in self.pages.iter().enumerate() {
            let info = rec.page.contains_info(addr);
            if info.found != Found::NotInRange {
                return Some((index, info));
            }
        }
        None
    }

    // ─── Allocation ────────────────────────────────────────────────────────

    /// First-fit over existing pages. The fresh allocation's live bit is
    /// set immediately so an allocation made by a destructor during an
    /// in-progress sweep is not itself swept; every collection clears all
    /// bits up front, so the bit is inert otherwise.
    fn try_allocate_existing(
        &mut self,
        n: usize,
        elem_size: usize,
        elem_align: usize,
    ) -> Option<NonNull<u8>> {
        for rec in &mut self.pages {
            if let Some(p) = rec.page.allocate(n, elem_size, elem_align) {
                rec.mark_live(p.as_ptr());
                return Some(p);
            }
        }
        None
    }

    /// Create a page sized for this request and allocate from it. The new
    /// page was sized to fit, so refusal is a fatal invariant violation;
    /// only page *creation* may fail.
    fn expand_and_allocate(
        &mut self,
        n: usize,
        elem_size: usize,
        elem_align: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let mut rec = PageRecord::for_request(n, elem_size, elem_align)?;
        let p = rec
            .page
            .allocate(n, elem_size, elem_align)
            .expect("freshly created page refused the request it was sized for");
        rec.mark_live(p.as_ptr());
        self.pages.push(rec);
        Ok(p)
    }

    // ─── Collection ────────────────────────────────────────────────────────

    /// Phase 1: clear every mark bit and every cell level.
    fn collect_reset(&mut self) {
        for rec in &mut self.pages {
            rec.live_starts.set_all(false);
            for tracked in &mut rec.cells {
                tracked.level = 0;
            }
        }
    }

    /// Phases 2: breadth-first marking. Roots seed level 1; each pass
    /// traces the cells discovered by the previous one. Every cell's level
    /// is written at most once, so the loop terminates.
    fn collect_mark(&mut self) {
        let mut level = 1;
        let root_targets: Vec<*mut u8> = self
            .roots
            .iter()
            // SAFETY: registered cores are owned by live handles.
            .map(|cell| unsafe { cell.as_ref().target() })
            .collect();
        for target in root_targets {
            self.mark(target, level);
        }

        loop {
            level += 1;
            let mut progressed = false;
            for page_index in 0..self.pages.len() {
                for cell_index in 0..self.pages[page_index].cells.len() {
                    let tracked = &self.pages[page_index].cells[cell_index];
                    if tracked.level == level - 1 {
                        // SAFETY: tracked cells live in page storage we own.
                        let target = unsafe { tracked.cell.as_ref().target() };
                        self.mark(target, level);
                        progressed = true;
                    }
                }
            }
            if !progressed {
                break;
            }
        }
    }

    /// Mark the allocation containing `p` live and hand `level` to every
    /// still-unreached cell residing in that allocation.
    fn mark(&mut self, p: *const u8, level: usize) {
        if p.is_null() {
            return;
        }
        for rec in &mut self.pages {
            let info = rec.page.contains_info(p);
            if info.found == Found::NotInRange {
                continue;
            }
            assert!(
                info.found > Found::InRangeUnallocated,
                "marked a pointer into unallocated memory"
            );
            rec.live_starts.set(info.start_location, true);

            for tracked in &mut rec.cells {
                let site = tracked.cell.as_ptr() as *const u8;
                let site_info = rec.page.contains_info(site);
                debug_assert!(
                    site_info.found > Found::InRangeUnallocated,
                    "tracked cell in unallocated memory"
                );
                if site_info.start_location == info.start_location && tracked.level == 0 {
                    tracked.level = level;
                }
            }
            return;
        }
        debug_assert!(false, "marked a pointer outside every managed page");
    }

    /// Restore the steady-state invariant: outside a collection, every
    /// tracked cell's level is 0.
    fn reset_levels(&mut self) {
        for rec in &mut self.pages {
            for tracked in &mut rec.cells {
                tracked.level = 0;
            }
        }
    }

    /// Phase 3: null every unreached cell. This runs before any destructor,
    /// which is the cycle-breaking rule: a destructor can never follow a
    /// handle into a collected object, so resurrection is impossible.
    fn collect_null_unreached(&mut self) {
        for rec in &mut self.pages {
            for tracked in &rec.cells {
                if tracked.level == 0 {
                    // SAFETY: tracked cells live in page storage we own.
                    unsafe { tracked.cell.as_ref().set_target(ptr::null_mut()) };
                }
            }
        }
    }

    /// Phase 4, one step: find the next unreached allocation at or after
    /// the cursor and extract its destructor batch. The caller runs the
    /// batch unborrowed, then calls [`finish_sweep_step`].
    fn sweep_next(&mut self, cursor: (usize, usize)) -> Option<SweepStep> {
        let (mut page_index, mut location) = cursor;
        while page_index < self.pages.len() {
            let rec = &self.pages[page_index];
            let locations = rec.page.locations();
            while location < locations {
                let info = rec.page.location_info(location);
                if info.is_start && !rec.live_starts.get(location) {
                    // Bound the destructor drain and the cell removal by the
                    // allocation's own run of chunks. The free space beyond
                    // it may hold an allocation a destructor made moments
                    // ago during this same sweep.
                    let end = rec.page.run_end(location);
                    let batch = self
                        .dtors
                        .drain_range(info.ptr as *const u8, end as *const u8);
                    return Some(SweepStep {
                        page_index,
                        resume_location: location + 1,
                        start: info.ptr,
                        end,
                        batch,
                    });
                }
                location += 1;
            }
            page_index += 1;
            location = 0;
        }
        None
    }

    /// Phase 4, completion of one step: release the storage and forget the
    /// cells that lived in it.
    fn finish_sweep_step(&mut self, page_index: usize, start: *mut u8, end: *mut u8) {
        let rec = &mut self.pages[page_index];
        rec.page.deallocate(start);
        rec.cells.retain(|tracked| {
            let site = tracked.cell.as_ptr() as *const u8;
            !(start as *const u8 <= site && site < end as *const u8)
        });
    }

    fn stats(&self) -> HeapStats {
        HeapStats {
            pages: self.pages.len(),
            allocations: self
                .pages
                .iter()
                .map(|rec| {
                    (0..rec.page.locations())
                        .filter(|&i| rec.page.location_info(i).is_start)
                        .count()
                })
                .sum(),
            roots: self.roots.len(),
            tracked_cells: self.pages.iter().map(|rec| rec.cells.len()).sum(),
            destructor_records: self.dtors.len(),
        }
    }
}

impl Drop for HeapSpace {
    /// Teardown: null every handle, then run every registered destructor.
    ///
    /// Handle drops inside these destructors find the weak heap reference
    /// dead, so deregistration is suppressed; allocation is impossible for
    /// the same reason. Destructors observe every handle as null.
    fn drop(&mut self) {
        for cell in &self.roots {
            // SAFETY: registered cores are owned by live handles.
            unsafe { cell.as_ref().set_target(ptr::null_mut()) };
        }
        for rec in &self.pages {
            for tracked in &rec.cells {
                // SAFETY: tracked cells live in page storage we still own.
                unsafe { tracked.cell.as_ref().set_target(ptr::null_mut()) };
            }
        }

        let records = self.dtors.take_all();
        // SAFETY: every record describes a live allocation in our pages;
        // records were removed first, so reentrant queries see an empty
        // registry.
        unsafe { run_records(&records) };
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DeferredHeap - public wrapper
// ═══════════════════════════════════════════════════════════════════════════════

/// A deferred (garbage-collected) heap.
///
/// Allocate with [`make`](Self::make) and [`make_array`](Self::make_array),
/// reclaim with [`collect`](Self::collect). Cloning yields another handle
/// to the same heap; the heap tears down (nulling every handle and running
/// every pending destructor) when the last clone drops.
pub struct DeferredHeap {
    pub(crate) space: Rc<RefCell<HeapSpace>>,
}

/// A weak reference to a [`DeferredHeap`], for use from destructors.
///
/// Upgrading fails once the heap has begun tearing down, which is exactly
/// when allocating on it must not happen.
#[derive(Clone)]
pub struct HeapRef {
    space: Weak<RefCell<HeapSpace>>,
}

impl HeapRef {
    pub fn upgrade(&self) -> Option<DeferredHeap> {
        self.space.upgrade().map(|space| DeferredHeap { space })
    }
}

impl DeferredHeap {
    pub fn new() -> Self {
        Self::with_config(HeapConfig::default())
    }

    pub fn with_config(config: HeapConfig) -> Self {
        Self {
            space: Rc::new(RefCell::new(HeapSpace::new(config))),
        }
    }

    /// A weak reference usable inside destructors of managed objects.
    pub fn downgrade(&self) -> HeapRef {
        HeapRef {
            space: Rc::downgrade(&self.space),
        }
    }

    pub fn collect_before_expand(&self) -> bool {
        self.space.borrow().collect_before_expand
    }

    /// Enable or disable collecting before page creation when existing
    /// pages cannot satisfy an allocation.
    pub fn set_collect_before_expand(&self, enable: bool) {
        self.space.borrow_mut().collect_before_expand = enable;
    }

    /// Allocate and construct one object, returning a root handle to it.
    ///
    /// The returned handle is null only if the storage layer refused to
    /// grant a page.
    pub fn make<T: 'static>(&self, value: T) -> DeferredPtr<T> {
        let Some(p) = self.allocate(1, mem::size_of::<T>(), mem::align_of::<T>()) else {
            return DeferredPtr::null(self);
        };
        // Root the raw allocation before anything reentrant can run: a
        // leftover destructor below may allocate and even trigger a nested
        // collection, which must see this storage as reachable.
        let handle = DeferredPtr::new_registered(p.as_ptr(), &self.space);
        self.run_leftover_destructors(p.as_ptr(), mem::size_of::<T>());

        // SAFETY: p addresses size_of::<T>() + 1 fresh bytes aligned for T.
        unsafe { ptr::write(p.as_ptr() as *mut T, value) };

        if mem::needs_drop::<T>() {
            self.space
                .borrow_mut()
                .dtors
                .store(p.as_ptr(), mem::size_of::<T>(), 1, drop_thunk::<T> as DropFn);
        }
        handle
    }

    /// Allocate and default-construct `n` objects, returning a root handle
    /// to the first. Exactly one destructor record covers all `n` elements.
    pub fn make_array<T: Default + 'static>(&self, n: usize) -> DeferredPtr<T> {
        let Some(p) = self.allocate(n, mem::size_of::<T>(), mem::align_of::<T>()) else {
            return DeferredPtr::null(self);
        };
        let handle = DeferredPtr::new_registered(p.as_ptr(), &self.space);
        self.run_leftover_destructors(p.as_ptr(), n * mem::size_of::<T>());

        for i in 0..n {
            // SAFETY: p addresses n * size_of::<T>() + 1 fresh bytes
            // aligned for T.
            unsafe { ptr::write((p.as_ptr() as *mut T).add(i), T::default()) };
        }

        if mem::needs_drop::<T>() && n > 0 {
            self.space
                .borrow_mut()
                .dtors
                .store(p.as_ptr(), mem::size_of::<T>(), n, drop_thunk::<T> as DropFn);
        }
        handle
    }

    /// Raw allocation: existing pages, then an optional collection, then a
    /// new page.
    fn allocate(&self, n: usize, elem_size: usize, elem_align: usize) -> Option<NonNull<u8>> {
        if let Some(p) = self
            .space
            .borrow_mut()
            .try_allocate_existing(n, elem_size, elem_align)
        {
            return Some(p);
        }

        if self.collect_before_expand() {
            self.collect();
            if let Some(p) = self
                .space
                .borrow_mut()
                .try_allocate_existing(n, elem_size, elem_align)
            {
                return Some(p);
            }
        }

        self.space
            .borrow_mut()
            .expand_and_allocate(n, elem_size, elem_align)
            .ok()
    }

    /// Run any destructors still registered inside a freshly allocated
    /// range. Collection runs destructors before deallocating, so this is
    /// normally a no-op on reused memory.
    fn run_leftover_destructors(&self, start: *mut u8, bytes: usize) {
        if bytes == 0 {
            return;
        }
        let batch = self
            .space
            .borrow_mut()
            .dtors
            .drain_range(start as *const u8, unsafe { start.add(bytes) } as *const u8);
        if !batch.is_empty() {
            // SAFETY: the records described live elements until this very
            // moment; the registry no longer holds them.
            unsafe { run_records(&batch) };
        }
    }

    /// Run a full stop-the-world mark-and-sweep collection.
    ///
    /// Unreachable allocations have their destructors run (each exactly
    /// once, with every handle into collected objects already nulled) and
    /// their storage reclaimed. Destructors may allocate on this heap and
    /// may drop or create handles.
    pub fn collect(&self) {
        {
            let mut space = self.space.borrow_mut();
            space.collect_reset();
            space.collect_mark();
            space.collect_null_unreached();
        }

        let mut cursor = (0, 0);
        loop {
            let step = self.space.borrow_mut().sweep_next(cursor);
            let Some(step) = step else { break };
            // SAFETY: the batch's elements are initialized and not yet
            // dropped; the heap interior is unborrowed while thunks run.
            unsafe { run_records(&step.batch) };
            self.space
                .borrow_mut()
                .finish_sweep_step(step.page_index, step.start, step.end);
            cursor = (step.page_index, step.resume_location);
        }

        self.space.borrow_mut().reset_levels();
    }

    /// Snapshot the heap's bookkeeping counters.
    pub fn stats(&self) -> HeapStats {
        self.space.borrow().stats()
    }
}

impl Default for DeferredHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for DeferredHeap {
    fn clone(&self) -> Self {
        Self {
            space: Rc::clone(&self.space),
        }
    }
}

impl fmt::Debug for DeferredHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.debug_struct("DeferredHeap")
            .field("pages", &stats.pages)
            .field("allocations", &stats.allocations)
            .field("roots", &stats.roots)
            .field("tracked_cells", &stats.tracked_cells)
            .field("destructor_records", &stats.destructor_records)
            .finish()
    }
}

/// Monomorphized destructor thunk stored in the registry.
///
/// # Safety
///
/// `p` must address an initialized, not-yet-dropped `T`.
unsafe fn drop_thunk<T>(p: *mut u8) {
    ptr::drop_in_place(p as *mut T);
}
