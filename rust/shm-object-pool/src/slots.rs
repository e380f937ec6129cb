//! The slot table: a flat array mapping object ids to data-region leases.
//!
//! Lookups are linear scans. The table is sized at pool-creation time and
//! never grows, so a full scan over `slot_count` entries is bounded and, for
//! the pool sizes this crate targets, cheap relative to the syscalls and
//! lock acquisition around it.

use crate::error::PoolError;
use crate::layout::{SlotRecord, EMPTY_ID};

/// A view over the slot table array.
pub struct SlotTable {
    slots: *mut SlotRecord,
    capacity: usize,
}

impl SlotTable {
    /// # Safety
    ///
    /// `slots` must point at `capacity` valid, live [`SlotRecord`] entries
    /// for the lifetime of this value.
    pub unsafe fn from_raw(slots: *mut SlotRecord, capacity: usize) -> Self {
        Self { slots, capacity }
    }

    #[inline]
    unsafe fn get(&self, idx: usize) -> &SlotRecord {
        debug_assert!(idx < self.capacity);
        unsafe { &*self.slots.add(idx) }
    }

    #[inline]
    unsafe fn get_mut(&self, idx: usize) -> &mut SlotRecord {
        debug_assert!(idx < self.capacity);
        unsafe { &mut *self.slots.add(idx) }
    }

    /// Zero every slot. Only valid before any other process observes the
    /// segment.
    ///
    /// # Safety
    ///
    /// Must only be called once, during segment creation.
    pub unsafe fn init(&self) {
        for i in 0..self.capacity {
            unsafe { *self.get_mut(i) = SlotRecord::EMPTY };
        }
    }

    fn find(&self, id: u64) -> Option<usize> {
        for i in 0..self.capacity {
            // SAFETY: i < capacity.
            let s = unsafe { self.get(i) };
            if s.occupied != 0 && s.id == id {
                return Some(i);
            }
        }
        None
    }

    fn find_empty(&self) -> Option<usize> {
        for i in 0..self.capacity {
            // SAFETY: i < capacity.
            if unsafe { self.get(i).occupied == 0 } {
                return Some(i);
            }
        }
        None
    }

    /// Insert a freshly allocated `{offset, length}` lease under `id` with
    /// refcount 1. Fails with [`PoolError::DuplicateId`] if `id` is already
    /// bound, or [`PoolError::OutOfSlots`] if the table is full.
    pub fn insert(&self, id: u64, offset: u64, length: u64) -> Result<(), PoolError> {
        if id == EMPTY_ID {
            return Err(PoolError::Corrupt("reserved id 0 cannot be registered"));
        }
        if self.find(id).is_some() {
            return Err(PoolError::DuplicateId);
        }
        let idx = self.find_empty().ok_or(PoolError::OutOfSlots)?;
        // SAFETY: idx < capacity, and was just confirmed unoccupied.
        unsafe {
            let s = self.get_mut(idx);
            s.id = id;
            s.offset = offset;
            s.length = length;
            s.refcount = 1;
            s.occupied = 1;
        }
        Ok(())
    }

    /// Look up the lease for `id`, without touching the refcount.
    pub fn lookup(&self, id: u64) -> Result<(u64, u64), PoolError> {
        let idx = self.find(id).ok_or(PoolError::UnknownId)?;
        // SAFETY: idx came from find(), which only returns occupied indices.
        let s = unsafe { self.get(idx) };
        Ok((s.offset, s.length))
    }

    /// Increment the refcount for `id` and return its lease.
    pub fn attach(&self, id: u64) -> Result<(u64, u64), PoolError> {
        let idx = self.find(id).ok_or(PoolError::UnknownId)?;
        // SAFETY: idx came from find(), which only returns occupied indices.
        unsafe {
            let s = self.get_mut(idx);
            s.refcount = s
                .refcount
                .checked_add(1)
                .ok_or(PoolError::Corrupt("slot refcount overflow"))?;
            Ok((s.offset, s.length))
        }
    }

    /// Decrement the refcount for `id`. Returns `Some((offset, length))` of
    /// the now-freed range if this was the last reference, `None` if other
    /// attachments remain.
    pub fn detach(&self, id: u64) -> Result<Option<(u64, u64)>, PoolError> {
        let idx = self.find(id).ok_or(PoolError::UnknownId)?;
        // SAFETY: idx came from find(), which only returns occupied indices.
        unsafe {
            let s = self.get_mut(idx);
            if s.refcount == 0 {
                return Err(PoolError::Corrupt("detach on a slot with zero refcount"));
            }
            s.refcount -= 1;
            if s.refcount == 0 {
                let freed = (s.offset, s.length);
                *s = SlotRecord::EMPTY;
                Ok(Some(freed))
            } else {
                Ok(None)
            }
        }
    }

    /// Iterate `(id, offset, length, refcount)` for every occupied slot, for
    /// invariant validation during recovery.
    pub fn occupied_snapshot(&self) -> Vec<(u64, u64, u64, u32)> {
        let mut out = Vec::new();
        for i in 0..self.capacity {
            // SAFETY: i < capacity.
            let s = unsafe { self.get(i) };
            if s.occupied != 0 {
                out.push((s.id, s.offset, s.length, s.refcount));
            }
        }
        out
    }
}
