//! First-fit, coalescing allocator over the data region.
//!
//! The free list is a singly linked, offset-ordered chain of [`FreeNode`]s
//! living in a parallel node pool inside the control region — never in the
//! payload bytes, so the allocator never touches user data. All operations
//! here assume the caller already holds the control mutex.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::PoolError;
use crate::layout::{align_up, FreeNode, FREE_LIST_END};

/// A view over the free-list node pool and its head pointer.
///
/// Holds raw pointers into the segment; safe to use only while the caller
/// holds the control mutex.
pub struct FreeListAllocator {
    /// `node_capacity` entries: `{offset, length}`.
    nodes: *mut FreeNode,
    /// `node_capacity` entries: index of the next node in the chain, or
    /// [`FREE_LIST_END`].
    next: *mut u32,
    node_capacity: usize,
    head: *const AtomicU32,
}

impl FreeListAllocator {
    /// # Safety
    ///
    /// `nodes` and `next` must each point at `node_capacity` valid, live
    /// entries for the lifetime of this value, and `head` at a live
    /// `AtomicU32` inside the same segment.
    pub unsafe fn from_raw(
        nodes: *mut FreeNode,
        next: *mut u32,
        node_capacity: usize,
        head: *const AtomicU32,
    ) -> Self {
        Self {
            nodes,
            next,
            node_capacity,
            head,
        }
    }

    /// Initialize the node pool: node 0 spans the whole data region, every
    /// other node is unused, and the head points at node 0.
    ///
    /// # Safety
    ///
    /// Must only be called once, before any other process observes the
    /// segment.
    pub unsafe fn init(&self, data_region_length: u64) {
        unsafe {
            self.node_mut(0).offset = 0;
            self.node_mut(0).length = data_region_length;
            *self.next_mut(0) = FREE_LIST_END;
            for i in 1..self.node_capacity {
                *self.node_mut(i) = FreeNode::UNUSED;
                *self.next_mut(i) = FREE_LIST_END;
            }
        }
        self.head().store(0, Ordering::Release);
    }

    #[inline]
    unsafe fn node(&self, idx: usize) -> &FreeNode {
        debug_assert!(idx < self.node_capacity);
        unsafe { &*self.nodes.add(idx) }
    }

    #[inline]
    unsafe fn node_mut(&self, idx: usize) -> &mut FreeNode {
        debug_assert!(idx < self.node_capacity);
        unsafe { &mut *self.nodes.add(idx) }
    }

    #[inline]
    unsafe fn next_mut(&self, idx: usize) -> &mut u32 {
        debug_assert!(idx < self.node_capacity);
        unsafe { &mut *self.next.add(idx) }
    }

    #[inline]
    unsafe fn next_of(&self, idx: usize) -> u32 {
        debug_assert!(idx < self.node_capacity);
        unsafe { *self.next.add(idx) }
    }

    #[inline]
    fn head(&self) -> &AtomicU32 {
        // SAFETY: head points at a live AtomicU32 in the header for the
        // lifetime of this allocator view.
        unsafe { &*self.head }
    }

    fn find_unused_node(&self) -> Option<usize> {
        for i in 0..self.node_capacity {
            // SAFETY: i < node_capacity.
            if unsafe { self.node(i).is_unused() } {
                return Some(i);
            }
        }
        None
    }

    /// Allocate `requested` bytes (rounded up to 8-byte alignment) first-fit.
    /// Returns the offset of the carved range within the data region.
    pub fn alloc(&self, requested: usize) -> Result<u64, PoolError> {
        let requested = align_up(requested) as u64;
        if requested == 0 {
            return Err(PoolError::Corrupt("zero-length allocation requested"));
        }

        let mut prev: Option<usize> = None;
        let mut cur = self.head().load(Ordering::Acquire);

        while cur != FREE_LIST_END {
            let cur_idx = cur as usize;
            // SAFETY: cur came from the chain, which only ever contains
            // valid indices < node_capacity.
            let (offset, length) = unsafe {
                let n = self.node(cur_idx);
                (n.offset, n.length)
            };

            if length >= requested {
                if length == requested {
                    // Exact fit: unlink the node entirely.
                    let next_idx = unsafe { self.next_of(cur_idx) };
                    self.relink(prev, next_idx);
                    unsafe { *self.node_mut(cur_idx) = FreeNode::UNUSED };
                } else {
                    // Split: keep the node, shrink it from the front.
                    unsafe {
                        let n = self.node_mut(cur_idx);
                        n.offset = offset + requested;
                        n.length = length - requested;
                    }
                }
                return Ok(offset);
            }

            prev = Some(cur_idx);
            cur = unsafe { self.next_of(cur_idx) };
        }

        Err(PoolError::OutOfMemory)
    }

    /// Return `[offset, offset + length)` to the free list, coalescing with
    /// an abutting predecessor and/or successor.
    pub fn free(&self, offset: u64, length: u64) -> Result<(), PoolError> {
        let mut prev: Option<usize> = None;
        let mut cur = self.head().load(Ordering::Acquire);

        // Walk to the insertion point: first node whose offset is >= ours.
        while cur != FREE_LIST_END {
            let cur_idx = cur as usize;
            let cur_offset = unsafe { self.node(cur_idx).offset };
            if cur_offset >= offset {
                break;
            }
            prev = Some(cur_idx);
            cur = unsafe { self.next_of(cur_idx) };
        }

        let abuts_prev = prev.is_some_and(|p| {
            let n = unsafe { self.node(p) };
            n.offset + n.length == offset
        });
        let abuts_next = cur != FREE_LIST_END && {
            let n = unsafe { self.node(cur as usize) };
            offset + length == n.offset
        };

        match (abuts_prev, abuts_next) {
            (true, true) => {
                // Merge into prev, then absorb cur and drop it.
                let prev_idx = prev.unwrap();
                let cur_idx = cur as usize;
                unsafe {
                    let absorbed_len = self.node(cur_idx).length;
                    let p = self.node_mut(prev_idx);
                    p.length += length + absorbed_len;
                    let after_cur = self.next_of(cur_idx);
                    *self.next_mut(prev_idx) = after_cur;
                    *self.node_mut(cur_idx) = FreeNode::UNUSED;
                }
            }
            (true, false) => {
                let prev_idx = prev.unwrap();
                unsafe { self.node_mut(prev_idx).length += length };
            }
            (false, true) => {
                let cur_idx = cur as usize;
                unsafe {
                    let n = self.node_mut(cur_idx);
                    n.offset = offset;
                    n.length += length;
                }
            }
            (false, false) => {
                let new_idx = self
                    .find_unused_node()
                    .ok_or(PoolError::Corrupt("free-list node pool exhausted"))?;
                unsafe {
                    let n = self.node_mut(new_idx);
                    n.offset = offset;
                    n.length = length;
                }
                self.relink(prev, new_idx as u32);
                unsafe { *self.next_mut(new_idx) = cur };
            }
        }

        Ok(())
    }

    /// Point `prev`'s next (or the head, if `prev` is `None`) at `target`.
    fn relink(&self, prev: Option<usize>, target: u32) {
        match prev {
            Some(p) => unsafe { *self.next_mut(p) = target },
            None => self.head().store(target, Ordering::Release),
        }
    }

    /// Collect `(offset, length)` for every free range, for invariant
    /// validation during recovery and diagnostics. Not on any hot path.
    pub fn snapshot(&self) -> Vec<(u64, u64)> {
        let mut out = Vec::new();
        let mut cur = self.head().load(Ordering::Acquire);
        let mut seen = 0usize;
        while cur != FREE_LIST_END {
            if seen > self.node_capacity {
                // Defensive: a corrupt chain must not spin forever.
                break;
            }
            let cur_idx = cur as usize;
            let n = unsafe { self.node(cur_idx) };
            out.push((n.offset, n.length));
            cur = unsafe { self.next_of(cur_idx) };
            seen += 1;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A standalone node pool + head for exercising the allocator without a
    /// real segment.
    struct Harness {
        nodes: Vec<FreeNode>,
        next: Vec<u32>,
        head: AtomicU32,
    }

    impl Harness {
        fn new(capacity: usize) -> Self {
            Self {
                nodes: vec![FreeNode::UNUSED; capacity],
                next: vec![FREE_LIST_END; capacity],
                head: AtomicU32::new(FREE_LIST_END),
            }
        }

        fn allocator(&mut self) -> FreeListAllocator {
            unsafe {
                FreeListAllocator::from_raw(
                    self.nodes.as_mut_ptr(),
                    self.next.as_mut_ptr(),
                    self.nodes.len(),
                    &self.head,
                )
            }
        }
    }

    #[test]
    fn alloc_and_free_exact_range() {
        let mut h = Harness::new(8);
        let a = h.allocator();
        unsafe { a.init(1024) };

        let off = a.alloc(256).unwrap();
        assert_eq!(off, 0);
        assert_eq!(a.snapshot(), vec![(256, 768)]);

        a.free(0, 256).unwrap();
        assert_eq!(a.snapshot(), vec![(0, 1024)]);
    }

    #[test]
    fn out_of_memory_when_no_range_fits() {
        let mut h = Harness::new(4);
        let a = h.allocator();
        unsafe { a.init(1024) };

        a.alloc(700).unwrap();
        assert!(matches!(a.alloc(700), Err(PoolError::OutOfMemory)));

        a.free(0, 700).unwrap();
        assert!(a.alloc(700).is_ok());
    }

    #[test]
    fn fragmentation_then_coalesce() {
        let mut h = Harness::new(8);
        let a = h.allocator();
        unsafe { a.init(768) };

        let o1 = a.alloc(256).unwrap();
        let o2 = a.alloc(256).unwrap();
        let o3 = a.alloc(256).unwrap();

        a.free(o2, 256).unwrap();
        a.free(o1, 256).unwrap();
        a.free(o3, 256).unwrap();

        assert_eq!(a.snapshot(), vec![(0, 768)]);
        assert!(a.alloc(768).is_ok());
    }

    #[test]
    fn coalesces_with_successor_only() {
        let mut h = Harness::new(8);
        let a = h.allocator();
        unsafe { a.init(400) };

        let o1 = a.alloc(100).unwrap();
        let o2 = a.alloc(100).unwrap();
        let o3 = a.alloc(100).unwrap();
        let _o4 = a.alloc(100).unwrap();

        a.free(o3, 100).unwrap();
        assert_eq!(a.snapshot(), vec![(200, 100)]);

        // o2 has no free predecessor yet but abuts the (200,100) node.
        a.free(o2, 100).unwrap();
        assert_eq!(a.snapshot(), vec![(100, 200)]);

        a.free(o1, 100).unwrap();
        assert_eq!(a.snapshot(), vec![(0, 300)]);
    }
}
