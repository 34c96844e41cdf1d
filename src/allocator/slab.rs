//! Slab constants, identifiers, and per-slab headers
//!
//! A slab is a 4 MiB region of the backing memory. Each slab has a header in
//! a separate header array recording which pool and allocation class own it.
//! Headers are the only per-allocation metadata the allocator keeps: any
//! pointer is resolved to `(pool, class, alloc_size)` by locating its slab and
//! reading the header.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

/// Size of a slab in bytes (4 MiB)
pub const SLAB_SIZE: usize = 4 * 1024 * 1024;

/// Minimum alignment of every allocation (pointer-size)
pub const ALIGNMENT: usize = std::mem::size_of::<*const ()>();

/// Identifier of a memory pool (0..=127)
pub type PoolId = u8;

/// Identifier of an allocation class within a pool (0..=127)
pub type ClassId = u8;

/// Maximum number of memory pools
pub const MAX_POOLS: usize = 128;

/// Maximum number of allocation classes per pool
pub const MAX_CLASSES: usize = 128;

/// Largest valid pool id
pub const MAX_POOL_ID: PoolId = (MAX_POOLS - 1) as PoolId;

/// Largest valid class id
pub const MAX_CLASS_ID: ClassId = (MAX_CLASSES - 1) as ClassId;

/// Sentinel marking a slab as not owned by any pool
pub const INVALID_POOL_ID: PoolId = u8::MAX;

/// Sentinel marking a slab as not owned by any allocation class
pub const INVALID_CLASS_ID: ClassId = u8::MAX;

/// Slab memory has been returned to the OS (logically still owned)
const FLAG_ADVISED: u8 = 1 << 0;

/// Slab is mid-release; traversals must skip it
const FLAG_MARKED_FOR_RELEASE: u8 = 1 << 1;

/// Pool, class, and allocation size of a pointer handed out by the allocator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocInfo {
    pub pool_id: PoolId,
    pub class_id: ClassId,
    pub alloc_size: u32,
}

/// Per-slab ownership record, stored in the header array
///
/// All fields are atomic so that [`SlabAllocator::slab_header`] lookups are
/// lock-free. Writes happen under the slab allocator's mutex during ownership
/// transitions; a traversal that observes a stale flag re-checks under the
/// owning class's lock.
///
/// [`SlabAllocator::slab_header`]: super::slab_allocator::SlabAllocator::slab_header
#[derive(Debug)]
pub struct SlabHeader {
    pool_id: AtomicU8,
    class_id: AtomicU8,
    alloc_size: AtomicU32,
    flags: AtomicU8,
}

impl SlabHeader {
    pub(crate) fn new() -> Self {
        Self {
            pool_id: AtomicU8::new(INVALID_POOL_ID),
            class_id: AtomicU8::new(INVALID_CLASS_ID),
            alloc_size: AtomicU32::new(0),
            flags: AtomicU8::new(0),
        }
    }

    /// Pool owning this slab, [`INVALID_POOL_ID`] if unowned
    pub fn pool_id(&self) -> PoolId {
        self.pool_id.load(Ordering::Acquire)
    }

    /// Class owning this slab, [`INVALID_CLASS_ID`] if unowned
    pub fn class_id(&self) -> ClassId {
        self.class_id.load(Ordering::Acquire)
    }

    /// Allocation size carved from this slab, 0 if unowned
    pub fn alloc_size(&self) -> u32 {
        self.alloc_size.load(Ordering::Acquire)
    }

    /// True if no pool or class owns the slab
    pub fn is_unassigned(&self) -> bool {
        self.pool_id() == INVALID_POOL_ID || self.class_id() == INVALID_CLASS_ID
    }

    /// True if the slab's physical memory was returned to the OS
    pub fn is_advised(&self) -> bool {
        self.flags.load(Ordering::Acquire) & FLAG_ADVISED != 0
    }

    /// True if the slab is in the middle of a release
    pub fn is_marked_for_release(&self) -> bool {
        self.flags.load(Ordering::Acquire) & FLAG_MARKED_FOR_RELEASE != 0
    }

    /// Record that the slab's memory was advised away (or reclaimed).
    ///
    /// Traversals skip advised slabs; the slab remains logically owned by its
    /// pool and class.
    pub fn set_advised(&self, advised: bool) {
        if advised {
            self.flags.fetch_or(FLAG_ADVISED, Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!FLAG_ADVISED, Ordering::AcqRel);
        }
    }

    pub(crate) fn set_marked_for_release(&self, marked: bool) {
        if marked {
            self.flags.fetch_or(FLAG_MARKED_FOR_RELEASE, Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!FLAG_MARKED_FOR_RELEASE, Ordering::AcqRel);
        }
    }

    /// Hand the slab to `(pool, class)` and record the carve size.
    ///
    /// Clears the release mark so a slab transferred by a rebalance starts
    /// clean in its receiver class.
    pub(crate) fn assign(&self, pool: PoolId, class: ClassId, alloc_size: u32) {
        self.alloc_size.store(alloc_size, Ordering::Release);
        self.class_id.store(class, Ordering::Release);
        self.pool_id.store(pool, Ordering::Release);
        self.set_marked_for_release(false);
    }

    /// Return the header to the unowned state, clearing all flags.
    pub(crate) fn reset(&self) {
        self.pool_id.store(INVALID_POOL_ID, Ordering::Release);
        self.class_id.store(INVALID_CLASS_ID, Ordering::Release);
        self.alloc_size.store(0, Ordering::Release);
        self.flags.store(0, Ordering::Release);
    }

    /// Ownership snapshot, `None` while the slab is unowned
    pub fn alloc_info(&self) -> Option<AllocInfo> {
        let pool_id = self.pool_id();
        let class_id = self.class_id();
        if pool_id == INVALID_POOL_ID || class_id == INVALID_CLASS_ID {
            return None;
        }
        Some(AllocInfo {
            pool_id,
            class_id,
            alloc_size: self.alloc_size(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_starts_unassigned() {
        let hdr = SlabHeader::new();
        assert!(hdr.is_unassigned());
        assert!(hdr.alloc_info().is_none());
        assert!(!hdr.is_advised());
        assert!(!hdr.is_marked_for_release());
    }

    #[test]
    fn test_header_assignment_roundtrip() {
        let hdr = SlabHeader::new();
        hdr.assign(3, 7, 256);

        assert!(!hdr.is_unassigned());
        let info = hdr.alloc_info().unwrap();
        assert_eq!(info.pool_id, 3);
        assert_eq!(info.class_id, 7);
        assert_eq!(info.alloc_size, 256);

        hdr.reset();
        assert!(hdr.is_unassigned());
        assert_eq!(hdr.alloc_size(), 0);
    }

    #[test]
    fn test_header_flags_independent() {
        let hdr = SlabHeader::new();
        hdr.set_advised(true);
        hdr.set_marked_for_release(true);
        assert!(hdr.is_advised());
        assert!(hdr.is_marked_for_release());

        hdr.set_marked_for_release(false);
        assert!(hdr.is_advised());
        assert!(!hdr.is_marked_for_release());
    }

    #[test]
    fn test_assign_clears_release_mark() {
        let hdr = SlabHeader::new();
        hdr.set_marked_for_release(true);
        hdr.assign(0, 1, 128);
        assert!(!hdr.is_marked_for_release());
    }
}
