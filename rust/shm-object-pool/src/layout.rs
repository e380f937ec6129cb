//! `repr(C)` structures for the pool's on-segment binary layout.
//!
//! # Memory Layout
//!
//! ```text
//! +-------------------------------------------------------------------+
//! | HEADER                                                            |
//! |   magic, version, slot_count, data region bounds, free list head  |
//! |   robust process-shared control mutex                            |
//! +-------------------------------------------------------------------+
//! | SLOT TABLE (slot_count entries, 32 bytes each)                    |
//! |   {id, offset, length, refcount, occupied}                        |
//! +-------------------------------------------------------------------+
//! | FREE-LIST NODE POOL (slot_count + 1 entries)                      |
//! |   node data: {offset, length} (16 bytes)                          |
//! |   next-index array, parallel, u32 per node                        |
//! +-------------------------------------------------------------------+
//! | DATA REGION (data_size bytes)                                     |
//! +-------------------------------------------------------------------+
//! ```

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::PoolError;
use crate::mutex::RawRobustMutex;

/// Magic bytes identifying a pool segment.
pub const MAGIC: [u8; 8] = *b"PYARRPL\0";

/// Current on-segment layout version.
pub const LAYOUT_VERSION: u32 = 1;

/// Sentinel marking "no node" / "empty list" in free-list indices.
pub const FREE_LIST_END: u32 = u32::MAX;

/// Reserved id meaning "empty slot".
pub const EMPTY_ID: u64 = 0;

/// All allocations and offsets are rounded up to this many bytes.
pub const ALIGNMENT: usize = 8;

#[inline]
pub const fn align_up(n: usize) -> usize {
    (n + (ALIGNMENT - 1)) & !(ALIGNMENT - 1)
}

/// Fixed-layout prologue at segment offset 0.
///
/// Field offsets up to `control_mutex` follow the wire contract exactly;
/// everything from `control_mutex` onward is platform-defined.
#[repr(C)]
pub struct Header {
    /// `"PYARRPL\0"`.
    pub magic: [u8; 8],
    /// Layout version, checked on open.
    pub version: u32,
    /// Configured slot table capacity (`N`).
    pub slot_count: u32,
    /// Byte offset of the data region from the start of the segment.
    pub data_region_offset: u64,
    /// Byte length of the data region.
    pub data_region_length: u64,
    /// Index of the free list head in the node pool, or [`FREE_LIST_END`].
    pub free_list_head_index: AtomicU32,
    /// Reserved, must be zero.
    pub reserved: u32,
    /// Process-shared robust mutex guarding the slot table and free list.
    pub control_mutex: RawRobustMutex,
    /// Set once recovery observes an unrecoverable inconsistency; once set,
    /// every operation fails with `Corrupt` regardless of the mutex state.
    pub poisoned: AtomicU32,
}

const _: () = assert!(std::mem::offset_of!(Header, magic) == 0);
const _: () = assert!(std::mem::offset_of!(Header, version) == 8);
const _: () = assert!(std::mem::offset_of!(Header, slot_count) == 12);
const _: () = assert!(std::mem::offset_of!(Header, data_region_offset) == 16);
const _: () = assert!(std::mem::offset_of!(Header, data_region_length) == 24);
const _: () = assert!(std::mem::offset_of!(Header, free_list_head_index) == 32);
const _: () = assert!(std::mem::offset_of!(Header, reserved) == 36);
const _: () = assert!(std::mem::offset_of!(Header, control_mutex) == 40);

impl Header {
    /// Initialize a freshly-mapped, zeroed header.
    ///
    /// # Safety
    ///
    /// `self` must point at zeroed, writable memory large enough to hold
    /// the rest of the segment; no other process may observe it yet.
    pub unsafe fn init(
        &mut self,
        slot_count: u32,
        data_region_offset: u64,
        data_region_length: u64,
    ) -> std::io::Result<()> {
        self.magic = MAGIC;
        self.version = LAYOUT_VERSION;
        self.slot_count = slot_count;
        self.data_region_offset = data_region_offset;
        self.data_region_length = data_region_length;
        self.free_list_head_index = AtomicU32::new(0);
        self.reserved = 0;
        self.poisoned = AtomicU32::new(0);
        unsafe { RawRobustMutex::init_in_place(&mut self.control_mutex) }
    }

    pub fn validate(&self) -> Result<(), PoolError> {
        if self.magic != MAGIC {
            return Err(PoolError::Corrupt("invalid magic bytes"));
        }
        if self.version != LAYOUT_VERSION {
            return Err(PoolError::VersionMismatch {
                expected: LAYOUT_VERSION,
                found: self.version,
            });
        }
        if self.poisoned.load(Ordering::Acquire) != 0 {
            return Err(PoolError::Corrupt("segment marked poisoned by a prior recovery"));
        }
        Ok(())
    }

    #[inline]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire) != 0
    }

    #[inline]
    pub fn mark_poisoned(&self) {
        self.poisoned.store(1, Ordering::Release);
    }
}

/// One entry in the slot table (32 bytes).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SlotRecord {
    /// Externally chosen identifier. `0` means the slot is empty.
    pub id: u64,
    /// Byte offset into the data region.
    pub offset: u64,
    /// Byte length of the lease.
    pub length: u64,
    /// Number of live attachments across all processes.
    pub refcount: u32,
    /// Whether this slot is currently bound.
    pub occupied: u8,
    pub _pad: [u8; 3],
}

const _: () = assert!(std::mem::size_of::<SlotRecord>() == 32);

impl SlotRecord {
    pub const EMPTY: SlotRecord = SlotRecord {
        id: EMPTY_ID,
        offset: 0,
        length: 0,
        refcount: 0,
        occupied: 0,
        _pad: [0; 3],
    };
}

/// One entry in the free-list node pool (16 bytes): a disjoint byte range.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct FreeNode {
    pub offset: u64,
    pub length: u64,
}

const _: () = assert!(std::mem::size_of::<FreeNode>() == 16);

impl FreeNode {
    /// `length == 0` marks a node-pool entry as unused (not part of any chain).
    pub const UNUSED: FreeNode = FreeNode { offset: 0, length: 0 };

    #[inline]
    pub fn is_unused(&self) -> bool {
        self.length == 0
    }
}

/// Computed byte offsets of each region within the segment.
#[derive(Debug, Clone, Copy)]
pub struct Offsets {
    pub header: usize,
    pub slot_table: usize,
    pub free_nodes: usize,
    pub free_next: usize,
    pub data_region: usize,
}

impl Offsets {
    pub fn calculate(slot_count: u32, data_size: usize) -> Result<(Self, usize), PoolError> {
        let header_size = align_up(std::mem::size_of::<Header>());
        let slot_table_size = (slot_count as usize)
            .checked_mul(std::mem::size_of::<SlotRecord>())
            .ok_or(PoolError::Corrupt("slot table size overflow"))?;

        let node_capacity = slot_count as usize + 1;
        let free_nodes_size = node_capacity
            .checked_mul(std::mem::size_of::<FreeNode>())
            .ok_or(PoolError::Corrupt("free node pool size overflow"))?;
        let free_next_size = align_up(
            node_capacity
                .checked_mul(std::mem::size_of::<u32>())
                .ok_or(PoolError::Corrupt("free next array size overflow"))?,
        );

        let header = 0usize;
        let slot_table = header + header_size;
        let free_nodes = slot_table + slot_table_size;
        let free_next = free_nodes + free_nodes_size;
        let data_region = free_next + free_next_size;

        let total = data_region
            .checked_add(data_size)
            .ok_or(PoolError::Corrupt("total segment size overflow"))?;

        Ok((
            Self {
                header,
                slot_table,
                free_nodes,
                free_next,
                data_region,
            },
            total,
        ))
    }

    #[inline]
    pub fn node_capacity(slot_count: u32) -> usize {
        slot_count as usize + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_record_is_32_bytes() {
        assert_eq!(std::mem::size_of::<SlotRecord>(), 32);
    }

    #[test]
    fn free_node_is_16_bytes() {
        assert_eq!(std::mem::size_of::<FreeNode>(), 16);
    }

    #[test]
    fn offsets_are_monotonic_and_aligned() {
        let (offsets, total) = Offsets::calculate(50, 64 * 1024 * 1024).unwrap();
        assert!(offsets.header < offsets.slot_table);
        assert!(offsets.slot_table < offsets.free_nodes);
        assert!(offsets.free_nodes < offsets.free_next);
        assert!(offsets.free_next < offsets.data_region);
        assert_eq!(offsets.slot_table % ALIGNMENT, 0);
        assert_eq!(offsets.free_nodes % ALIGNMENT, 0);
        assert_eq!(offsets.data_region % ALIGNMENT, 0);
        assert!(total > offsets.data_region);
    }

    #[test]
    fn align_up_rounds_to_eight() {
        assert_eq!(align_up(0), 0);
        assert_eq!(align_up(1), 8);
        assert_eq!(align_up(8), 8);
        assert_eq!(align_up(9), 16);
    }
}
