//! A per-process handle onto one lease's bytes.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::pool::PoolInner;

/// A live reference to the byte range backing one object id.
///
/// Created by [`crate::Pool::add_object`] or [`crate::Pool::attach_object`],
/// both of which hold a refcount unit that `View`'s `Drop` releases by
/// calling `detach_object`. A view produced by [`crate::Pool::memview_of`]
/// borrows without taking a reference and releases nothing on drop.
pub struct View {
    pool: Arc<PoolInner>,
    id: u64,
    offset: u64,
    length: u64,
    owns_ref: bool,
}

impl View {
    pub(crate) fn new(pool: Arc<PoolInner>, id: u64, offset: u64, length: u64) -> Self {
        Self {
            pool,
            id,
            offset,
            length,
            owns_ref: true,
        }
    }

    pub(crate) fn borrowed(pool: Arc<PoolInner>, id: u64, offset: u64, length: u64) -> Self {
        Self {
            pool,
            id,
            offset,
            length,
            owns_ref: false,
        }
    }

    /// The externally chosen object id this view was created for.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Byte offset into the pool's data region.
    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Length of the lease in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.length as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    #[inline]
    fn as_ptr(&self) -> *mut u8 {
        // SAFETY: offset/length came from a slot table entry validated under
        // the control mutex at the time this view was created.
        unsafe { self.pool.data_ptr_for_view().add(self.offset as usize) }
    }
}

impl Deref for View {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the pointer is within the mapped segment for `self.length`
        // bytes, and this view holds (or borrows, for memview_of) a refcount
        // that keeps the lease alive while it exists.
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len()) }
    }
}

impl DerefMut for View {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: see Deref; payload mutation across processes is
        // unsynchronized by design, ordering is the caller's responsibility.
        unsafe { std::slice::from_raw_parts_mut(self.as_ptr(), self.len()) }
    }
}

impl Drop for View {
    fn drop(&mut self) {
        if !self.owns_ref {
            return;
        }
        if let Err(e) = self.pool.detach_by_id(self.id) {
            tracing::warn!(id = self.id, error = %e, "detach on view drop failed");
        }
    }
}
