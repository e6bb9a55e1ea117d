//! Registry of deferred destructors.
//!
//! One record per allocation with drop glue. Types without drop glue are
//! never stored; absence means there is nothing to run.

/// Type-erased destructor thunk, monomorphized at the `make` site.
pub(crate) type DropFn = unsafe fn(*mut u8);

#[derive(Clone, Copy)]
pub(crate) struct DestructorRecord {
    pub addr: *mut u8,
    pub elem_size: usize,
    pub count: usize,
    pub drop_fn: DropFn,
}

#[derive(Default)]
pub(crate) struct DestructorRegistry {
    records: Vec<DestructorRecord>,
}

impl DestructorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a destructor for the allocation at `addr`.
    ///
    /// Panics if a record for `addr` already exists: every allocation has
    /// at most one record, and `drain_range` must have removed the old one
    /// before the memory is reused.
    pub fn store(&mut self, addr: *mut u8, elem_size: usize, count: usize, drop_fn: DropFn) {
        assert!(!addr.is_null() && count > 0, "no object to register for destruction");
        assert!(
            !self.contains(addr),
            "destructor already registered at this address"
        );
        self.records.push(DestructorRecord {
            addr,
            elem_size,
            count,
            drop_fn,
        });
    }

    /// Whether a record exists for `addr`. The trivially-destructible
    /// short-circuit lives at the call site (`mem::needs_drop`).
    pub fn contains(&self, addr: *const u8) -> bool {
        self.records.iter().any(|r| r.addr as *const u8 == addr)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Move every record whose address lies in `[begin, end)` out of the
    /// live list.
    ///
    /// The extraction happens before any thunk is invoked, so destructors
    /// that reenter the registry (allocating, querying) observe a
    /// consistent list.
    pub fn drain_range(&mut self, begin: *const u8, end: *const u8) -> Vec<DestructorRecord> {
        assert!(begin < end, "begin must precede end");
        let mut batch = Vec::new();
        self.records.retain(|r| {
            let addr = r.addr as *const u8;
            if begin <= addr && addr < end {
                batch.push(*r);
                false
            } else {
                true
            }
        });
        batch
    }

    /// Empty the registry, handing every record to the caller. Used at
    /// heap teardown.
    pub fn take_all(&mut self) -> Vec<DestructorRecord> {
        std::mem::take(&mut self.records)
    }
}

/// Invoke each record's thunk on every element address.
///
/// # Safety
///
/// Every record must describe `count` live, initialized elements of
/// `elem_size` bytes starting at `addr`, none of which has been dropped.
pub(crate) unsafe fn run_records(records: &[DestructorRecord]) {
    for record in records {
        for i in 0..record.count {
            (record.drop_fn)(record.addr.add(record.elem_size * i));
        }
    }
}
