//! Slab release contexts
//!
//! Releasing a slab that still holds live allocations is a two-phase
//! protocol: `start_slab_release` marks the slab and returns a
//! [`SlabReleaseContext`] listing the allocations still held by callers; the
//! caller quiesces (frees) them and then calls `complete_slab_release` with
//! the same context, or gives up with `abort_slab_release`.

use super::slab::{ClassId, PoolId};
use serde::{Deserialize, Serialize};

/// Why a slab is being released
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlabReleaseMode {
    /// Transfer the slab to another allocation class in the same pool
    Rebalance,
    /// Return the slab to the slab allocator so the pool shrinks
    Resize,
}

/// Verdict returned by a [`MemoryAllocator::for_each_allocation`] callback
///
/// [`MemoryAllocator::for_each_allocation`]: super::memory_allocator::MemoryAllocator::for_each_allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabIterationStatus {
    /// Keep iterating this slab and the ones after it
    Continue,
    /// Stop iterating the current slab, move on to the next
    SkipCurrentSlabAndContinue,
    /// Stop the whole traversal
    AbortIteration,
}

/// Token tracking one in-flight slab release
///
/// Created by `start_slab_release`; consumed by `complete_slab_release` or
/// `abort_slab_release`. `live_allocations` is the snapshot of allocations
/// that were still held by callers when the release started; the caller must
/// free all of them (or relocate them via `process_alloc_for_release`) before
/// the release can complete.
#[derive(Debug)]
pub struct SlabReleaseContext {
    pool_id: PoolId,
    victim_class_id: ClassId,
    receiver_class_id: Option<ClassId>,
    mode: SlabReleaseMode,
    slab_idx: usize,
    live_allocations: Vec<*mut u8>,
    released: bool,
}

// SAFETY: the pointers are addresses into the allocator's slab region used
// for identity only; the context never dereferences them.
unsafe impl Send for SlabReleaseContext {}
unsafe impl Sync for SlabReleaseContext {}

impl SlabReleaseContext {
    pub(crate) fn new(
        pool_id: PoolId,
        victim_class_id: ClassId,
        receiver_class_id: Option<ClassId>,
        mode: SlabReleaseMode,
        slab_idx: usize,
        live_allocations: Vec<*mut u8>,
        released: bool,
    ) -> Self {
        Self {
            pool_id,
            victim_class_id,
            receiver_class_id,
            mode,
            slab_idx,
            live_allocations,
            released,
        }
    }

    /// Pool the slab belongs to
    pub fn pool_id(&self) -> PoolId {
        self.pool_id
    }

    /// Class the slab is being taken from
    pub fn victim_class_id(&self) -> ClassId {
        self.victim_class_id
    }

    /// Class receiving the slab (rebalance mode only)
    pub fn receiver_class_id(&self) -> Option<ClassId> {
        self.receiver_class_id
    }

    pub fn mode(&self) -> SlabReleaseMode {
        self.mode
    }

    /// Index of the slab being released
    pub fn slab_index(&self) -> usize {
        self.slab_idx
    }

    /// Allocations still held by callers when the release started
    pub fn live_allocations(&self) -> &[*mut u8] {
        &self.live_allocations
    }

    /// True if the slab had no live allocations and was released immediately;
    /// the caller needs to do nothing further with this context.
    pub fn is_released(&self) -> bool {
        self.released
    }
}
