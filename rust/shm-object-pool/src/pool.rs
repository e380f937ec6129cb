//! The pool handle: per-process mapping plus the public operations.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::alloc::FreeListAllocator;
use crate::error::{PoolError, Result};
use crate::layout::{Header, Offsets, SlotRecord};
use crate::link;
use crate::mutex::LockOutcome;
use crate::segment::Segment;
use crate::slots::SlotTable;
use crate::view::View;

/// A process-local handle onto a shared-memory object pool.
///
/// Cheap to clone: internally an `Arc` over the mapping, so every clone
/// shares the same segment.
#[derive(Clone)]
pub struct Pool(pub(crate) Arc<PoolInner>);

pub(crate) struct PoolInner {
    segment: Segment,
    offsets: Offsets,
    slot_count: u32,
}

// SAFETY: PoolInner's raw pointers all derive from `segment`, which is
// itself Send + Sync; every access to header/slot-table/allocator state
// that mutates goes through the control mutex.
unsafe impl Send for PoolInner {}
unsafe impl Sync for PoolInner {}

impl PoolInner {
    #[inline]
    fn header(&self) -> &Header {
        // SAFETY: the header lives at offset 0 of a mapping sized and
        // initialized by create()/open().
        unsafe { &*(self.segment.base_addr() as *const Header) }
    }

    #[inline]
    fn slot_table(&self) -> SlotTable {
        // SAFETY: offsets.slot_table was computed from the same slot_count
        // used to size the mapping.
        unsafe {
            let ptr = self.segment.base_addr().add(self.offsets.slot_table) as *mut SlotRecord;
            SlotTable::from_raw(ptr, self.slot_count as usize)
        }
    }

    #[inline]
    fn allocator(&self) -> FreeListAllocator {
        let node_capacity = Offsets::node_capacity(self.slot_count);
        // SAFETY: offsets.free_nodes/free_next were computed from the same
        // slot_count used to size the mapping; free_list_head_index lives
        // in the header at a fixed offset.
        unsafe {
            let nodes = self.segment.base_addr().add(self.offsets.free_nodes) as *mut _;
            let next = self.segment.base_addr().add(self.offsets.free_next) as *mut u32;
            let head = &self.header().free_list_head_index as *const _;
            FreeListAllocator::from_raw(nodes, next, node_capacity, head)
        }
    }

    #[inline]
    fn data_ptr(&self) -> *mut u8 {
        // SAFETY: offsets.data_region was computed from the same slot_count
        // and data size used to size the mapping.
        unsafe { self.segment.base_addr().add(self.offsets.data_region) }
    }

    #[inline]
    pub(crate) fn data_ptr_for_view(&self) -> *mut u8 {
        self.data_ptr()
    }

    pub(crate) fn detach_by_id(&self, id: u64) -> Result<()> {
        self.with_lock(|slots, allocator| {
            if let Some((offset, length)) = slots.detach(id)? {
                allocator.free(offset, length)?;
            }
            Ok(())
        })
    }

    /// Acquire the control mutex, running recovery if the previous holder
    /// died while holding it. On success, `f` runs with exclusive access to
    /// the slot table and allocator; the mutex is always released
    /// afterward, even on error.
    fn with_lock<T>(&self, f: impl FnOnce(&SlotTable, &FreeListAllocator) -> Result<T>) -> Result<T> {
        if self.header().is_poisoned() {
            return Err(PoolError::Corrupt("segment marked poisoned by a prior recovery"));
        }

        // SAFETY: the mutex was initialized in create() and remains mapped
        // at the same address for the lifetime of this PoolInner.
        let outcome = unsafe { self.header().control_mutex.lock()? };

        if matches!(outcome, LockOutcome::RecoveredFromDeadOwner) {
            warn!("control mutex recovered from a dead holder; validating invariants");
            if let Err(e) = self.validate_invariants() {
                self.header().mark_poisoned();
                // SAFETY: we hold the lock; releasing it after marking
                // poisoned is safe, every future acquirer will see the flag.
                unsafe { self.header().control_mutex.unlock() };
                return Err(e);
            }
            // SAFETY: we hold the lock and just validated invariants hold.
            if let Err(e) = unsafe { self.header().control_mutex.mark_consistent() } {
                unsafe { self.header().control_mutex.unlock() };
                return Err(e);
            }
            info!("control mutex recovery succeeded, invariants intact");
        }

        let result = f(&self.slot_table(), &self.allocator());

        // SAFETY: this thread holds the lock from the successful lock() above.
        unsafe { self.header().control_mutex.unlock() };
        result
    }

    /// Checks the invariants the spec calls out for the recovery path: no
    /// overlapping occupied ranges, occupied+free coverage of the data
    /// region, and a free list that terminates.
    fn validate_invariants(&self) -> Result<()> {
        let mut occupied = self.slot_table().occupied_snapshot();
        occupied.sort_by_key(|&(_, offset, _, _)| offset);

        let mut cursor = 0u64;
        for &(_, offset, length, refcount) in &occupied {
            if refcount == 0 {
                return Err(PoolError::Corrupt("occupied slot with zero refcount"));
            }
            if offset < cursor {
                return Err(PoolError::Corrupt("overlapping occupied ranges"));
            }
            cursor = offset.checked_add(length).ok_or(PoolError::Corrupt("occupied range overflows"))?;
        }

        let free = self.allocator().snapshot();
        let mut ranges: Vec<(u64, u64)> = occupied
            .iter()
            .map(|&(_, offset, length, _)| (offset, length))
            .chain(free.iter().copied())
            .collect();
        ranges.sort_by_key(|&(offset, _)| offset);

        let mut expected = 0u64;
        for (offset, length) in ranges {
            if offset != expected {
                return Err(PoolError::Corrupt("gap or overlap between occupied and free ranges"));
            }
            expected += length;
        }
        if expected != self.header().data_region_length {
            return Err(PoolError::Corrupt("free+occupied ranges do not cover the data region"));
        }
        Ok(())
    }
}

impl Pool {
    /// Create a new pool segment sized for `slot_count` slots and
    /// `data_size` payload bytes, and publish its name at `link_path`.
    ///
    /// Fails with [`PoolError::AlreadyExists`] if `link_path` already
    /// resolves to a live segment.
    pub fn create(link_path: &Path, data_size: usize, slot_count: u32) -> Result<Self> {
        if link::resolves_to_live_segment(link_path) {
            return Err(PoolError::AlreadyExists);
        }

        let (offsets, total_size) = Offsets::calculate(slot_count, data_size)?;
        let segment = Segment::create(total_size)?;
        debug!(name = segment.name(), total_size, slot_count, "creating pool segment");

        // SAFETY: the segment was just created by this process and zeroed;
        // no other process has observed it yet.
        unsafe {
            let header = &mut *(segment.base_addr() as *mut Header);
            header.init(slot_count, offsets.data_region as u64, data_size as u64)?;

            let slots_ptr = segment.base_addr().add(offsets.slot_table) as *mut SlotRecord;
            SlotTable::from_raw(slots_ptr, slot_count as usize).init();

            let nodes_ptr = segment.base_addr().add(offsets.free_nodes) as *mut _;
            let next_ptr = segment.base_addr().add(offsets.free_next) as *mut u32;
            let node_capacity = Offsets::node_capacity(slot_count);
            let allocator = FreeListAllocator::from_raw(
                nodes_ptr,
                next_ptr,
                node_capacity,
                &header.free_list_head_index,
            );
            allocator.init(data_size as u64);
        }

        if let Err(e) = link::write(link_path, segment.name()) {
            let _ = Segment::unlink_by_name(segment.name());
            return Err(e);
        }

        Ok(Self(Arc::new(PoolInner {
            segment,
            offsets,
            slot_count,
        })))
    }

    /// Open the pool currently published at `link_path`.
    pub fn open(link_path: &Path) -> Result<Self> {
        let name = link::read(link_path)?;
        let segment = Segment::open(&name)?;

        // SAFETY: a correctly created segment has a valid Header at offset 0.
        let header = unsafe { &*(segment.base_addr() as *const Header) };
        header.validate()?;

        let slot_count = header.slot_count;
        let data_size = header.data_region_length as usize;
        let (offsets, _) = Offsets::calculate(slot_count, data_size)?;

        Ok(Self(Arc::new(PoolInner {
            segment,
            offsets,
            slot_count,
        })))
    }

    /// Register a fresh object of `nbytes` under `id`. Fails with
    /// [`PoolError::DuplicateId`] if `id` already has a live slot.
    pub fn add_object(&self, id: u64, nbytes: usize) -> Result<View> {
        let inner = self.0.clone();
        let aligned_len = crate::layout::align_up(nbytes) as u64;
        let (offset, length) = inner.with_lock(|slots, allocator| {
            let offset = allocator.alloc(nbytes)?;
            if let Err(e) = slots.insert(id, offset, aligned_len) {
                // No partial state: return the carved range before failing.
                let _ = allocator.free(offset, aligned_len);
                return Err(e);
            }
            Ok((offset, aligned_len))
        })?;
        Ok(View::new(inner, id, offset, length))
    }

    /// Attach to the existing object `id`, incrementing its refcount.
    pub fn attach_object(&self, id: u64) -> Result<View> {
        let inner = self.0.clone();
        let (offset, length) = inner.with_lock(|slots, _alloc| slots.attach(id))?;
        Ok(View::new(inner, id, offset, length))
    }

    /// Release one reference to `id`. When the refcount reaches zero the
    /// lease is returned to the free list and the slot cleared.
    pub fn detach_object(&self, id: u64) -> Result<()> {
        self.0.detach_by_id(id)
    }

    /// Look up `id` without changing its refcount. Returns `None` if `id`
    /// has no live slot.
    pub fn memview_of(&self, id: u64) -> Result<Option<View>> {
        let inner = self.0.clone();
        let found = inner.with_lock(|slots, _alloc| match slots.lookup(id) {
            Ok((offset, length)) => Ok(Some((offset, length))),
            Err(PoolError::UnknownId) => Ok(None),
            Err(e) => Err(e),
        })?;
        Ok(found.map(|(offset, length)| {
            // memview_of does not take a reference; the caller already
            // holds one via add_object/attach_object if it wants to keep it.
            View::borrowed(inner, id, offset, length)
        }))
    }

    /// Remove the shared-memory segment named at `link_path` and the link
    /// file itself. Idempotent: a missing link or missing segment is
    /// success.
    pub fn cleanup(link_path: &Path) -> Result<()> {
        let name = match link::read(link_path) {
            Ok(name) => Some(name),
            Err(PoolError::NotFound) => None,
            Err(e) => return Err(e),
        };
        if let Some(name) = name {
            Segment::unlink_by_name(&name)?;
        }
        link::remove(link_path)?;
        Ok(())
    }

    /// Acquire the control mutex and terminate this process without
    /// releasing it.
    ///
    /// Exists only so integration tests can exercise the robust-mutex
    /// recovery path: the next process to lock the mutex observes
    /// `EOWNERDEAD`, since the kernel's robust-futex bookkeeping unwinds
    /// the held lock when this process exits for any reason, including
    /// `abort()`.
    #[doc(hidden)]
    pub fn debug_crash_while_holding_lock(&self) -> ! {
        // SAFETY: the mutex was initialized in create()/open() and remains
        // mapped at this address.
        let _ = unsafe { self.0.header().control_mutex.lock() };
        std::process::abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn unique_link_path(label: &str) -> std::path::PathBuf {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!(
            "shm-object-pool-test-{label}-{}-{}.link",
            std::process::id(),
            n
        ))
    }

    #[test]
    fn register_then_memview_then_detach_clears_slot() {
        let link_path = unique_link_path("register-memview-detach");
        let _ = std::fs::remove_file(&link_path);

        let pool = Pool::create(&link_path, 64 * 1024 * 1024, 50).unwrap();

        let view = pool.add_object(7, 40).unwrap();
        assert_eq!(view.len(), 40);

        let again = pool.memview_of(7).unwrap();
        assert!(again.is_some());
        drop(again);

        // Releasing the view is what calls detach_object; dropping it is
        // the idiomatic equivalent of the explicit detach_object(7) call.
        drop(view);
        assert!(pool.memview_of(7).unwrap().is_none());

        Pool::cleanup(&link_path).unwrap();
    }

    #[test]
    fn second_alloc_fails_then_succeeds_after_free() {
        let link_path = unique_link_path("second-alloc-after-free");
        let _ = std::fs::remove_file(&link_path);

        let pool = Pool::create(&link_path, 1024 * 1024, 10).unwrap();
        let v1 = pool.add_object(1, 700 * 1024).unwrap();
        assert!(matches!(pool.add_object(2, 700 * 1024), Err(PoolError::OutOfMemory)));

        drop(v1);
        assert!(pool.add_object(2, 700 * 1024).is_ok());

        Pool::cleanup(&link_path).unwrap();
    }

    #[test]
    fn fourth_add_object_fails_then_succeeds_after_detach() {
        let link_path = unique_link_path("slot-exhaustion");
        let _ = std::fs::remove_file(&link_path);

        let pool = Pool::create(&link_path, 1024 * 1024, 3).unwrap();
        let v1 = pool.add_object(1, 64).unwrap();
        let v2 = pool.add_object(2, 64).unwrap();
        let v3 = pool.add_object(3, 64).unwrap();
        assert!(matches!(pool.add_object(4, 64), Err(PoolError::OutOfSlots)));

        drop(v2);
        assert!(pool.add_object(4, 64).is_ok());

        drop(v1);
        drop(v3);
        Pool::cleanup(&link_path).unwrap();
    }

    #[test]
    fn fragmented_frees_coalesce_into_one_large_alloc() {
        let link_path = unique_link_path("fragmentation-coalesce");
        let _ = std::fs::remove_file(&link_path);

        let pool = Pool::create(&link_path, 4096, 10).unwrap();
        let v1 = pool.add_object(1, 256).unwrap();
        let v2 = pool.add_object(2, 256).unwrap();
        let v3 = pool.add_object(3, 256).unwrap();

        drop(v2);
        drop(v1);
        drop(v3);

        assert!(pool.add_object(4, 768).is_ok());

        Pool::cleanup(&link_path).unwrap();
    }

    #[test]
    fn duplicate_id_leaves_no_leak() {
        let link_path = unique_link_path("dup");
        let _ = std::fs::remove_file(&link_path);

        let pool = Pool::create(&link_path, 4096, 10).unwrap();
        let _v = pool.add_object(1, 64).unwrap();
        assert!(matches!(pool.add_object(1, 64), Err(PoolError::DuplicateId)));

        // The space reserved for the rejected duplicate must have been
        // returned, not leaked.
        assert!(pool.add_object(2, 64).is_ok());

        Pool::cleanup(&link_path).unwrap();
    }

    #[test]
    fn create_twice_at_same_link_fails() {
        let link_path = unique_link_path("exists");
        let _ = std::fs::remove_file(&link_path);

        let _pool = Pool::create(&link_path, 4096, 4).unwrap();
        assert!(matches!(
            Pool::create(&link_path, 4096, 4),
            Err(PoolError::AlreadyExists)
        ));

        Pool::cleanup(&link_path).unwrap();
    }

    #[test]
    fn open_without_create_is_not_found() {
        let link_path = unique_link_path("missing");
        let _ = std::fs::remove_file(&link_path);
        assert!(matches!(Pool::open(&link_path), Err(PoolError::NotFound)));
    }

    #[test]
    fn cleanup_is_idempotent() {
        let link_path = unique_link_path("cleanup");
        let _ = std::fs::remove_file(&link_path);
        let pool = Pool::create(&link_path, 4096, 4).unwrap();
        drop(pool);
        Pool::cleanup(&link_path).unwrap();
        Pool::cleanup(&link_path).unwrap();
    }
}
