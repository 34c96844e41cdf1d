//! Allocation class: per-size free-list manager
//!
//! An allocation class serves allocations of exactly one size within one
//! pool. Slabs assigned to the class are carved eagerly into
//! `floor(SLAB_SIZE / alloc_size)` chunks; the tail remainder is never handed
//! out. Freed chunks go back on a LIFO free list.
//!
//! The class also runs the per-slab release state machine:
//!
//! ```text
//! SERVING → MARKED   (start_slab_release)
//! MARKED  → SERVING  (abort; live allocations must remain)
//! MARKED  → RELEASED (complete; requires every live allocation freed)
//! ```
//!
//! While a slab is marked, its free chunks are out of the free list and a
//! `free` that lands in the slab retires the chunk into the release state
//! instead of recycling it.

use super::release::{SlabIterationStatus, SlabReleaseContext, SlabReleaseMode};
use super::slab::{AllocInfo, ClassId, PoolId, SLAB_SIZE};
use super::slab_allocator::SlabAllocator;
use crate::error::{Error, Result};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex};
use tracing::debug;

/// How often the abort predicate is polled while scanning a slab's chunks
const ABORT_POLL_INTERVAL: usize = 4096;

/// Release bookkeeping for one marked slab
struct ReleaseSlot {
    /// Chunk addresses still held by callers
    live: HashSet<usize>,
    /// Chunk addresses free at mark time or freed since
    freed: HashSet<usize>,
}

struct ClassState {
    /// LIFO free list of carved chunks
    free_list: Vec<*mut u8>,
    /// Slabs owned by this class
    slabs: BTreeSet<usize>,
    /// Marked slabs, keyed by slab index
    releases: HashMap<usize, ReleaseSlot>,
}

/// Serves fixed-size allocations for one `(pool, class)` pair
pub struct AllocationClass {
    class_id: ClassId,
    pool_id: PoolId,
    alloc_size: u32,
    slab_allocator: Arc<SlabAllocator>,
    state: Mutex<ClassState>,
    /// Signalled when the last live allocation of a marked slab is freed
    release_cv: Condvar,
}

// SAFETY: the raw chunk pointers in the free list are plain addresses into
// the slab region, only produced and consumed under the state mutex; the
// class never dereferences them.
unsafe impl Send for AllocationClass {}
unsafe impl Sync for AllocationClass {}

impl AllocationClass {
    pub(crate) fn new(
        class_id: ClassId,
        pool_id: PoolId,
        alloc_size: u32,
        slab_allocator: Arc<SlabAllocator>,
    ) -> Self {
        Self {
            class_id,
            pool_id,
            alloc_size,
            slab_allocator,
            state: Mutex::new(ClassState {
                free_list: Vec::new(),
                slabs: BTreeSet::new(),
                releases: HashMap::new(),
            }),
            release_cv: Condvar::new(),
        }
    }

    pub fn class_id(&self) -> ClassId {
        self.class_id
    }

    pub fn pool_id(&self) -> PoolId {
        self.pool_id
    }

    /// Size of every allocation served by this class
    pub fn alloc_size(&self) -> u32 {
        self.alloc_size
    }

    /// Number of allocations carved from each slab
    pub fn chunks_per_slab(&self) -> usize {
        SLAB_SIZE / self.alloc_size as usize
    }

    /// Number of slabs currently owned by this class
    pub fn held_slab_count(&self) -> usize {
        self.state.lock().unwrap().slabs.len()
    }

    /// Number of chunks currently on the free list
    pub fn free_alloc_count(&self) -> usize {
        self.state.lock().unwrap().free_list.len()
    }

    /// Pop a chunk off the free list, `None` when the class has no free
    /// chunk. Slab acquisition on exhaustion is the owning pool's job.
    pub(crate) fn allocate(&self) -> Option<*mut u8> {
        self.state.lock().unwrap().free_list.pop()
    }

    /// Carve a freshly assigned slab and return its first chunk.
    ///
    /// All other chunks go onto the free list; the tail remainder
    /// `SLAB_SIZE % alloc_size` is never handed out.
    pub(crate) fn add_slab(&self, idx: usize, base: *mut u8) -> *mut u8 {
        let mut st = self.state.lock().unwrap();
        st.slabs.insert(idx);
        let size = self.alloc_size as usize;
        // push in reverse so chunks pop in ascending address order
        for k in (1..self.chunks_per_slab()).rev() {
            // SAFETY: k * size stays below SLAB_SIZE inside slab idx
            st.free_list.push(unsafe { base.add(k * size) });
        }
        debug!(
            class = self.class_id,
            slab = idx,
            chunks = self.chunks_per_slab(),
            "carved slab"
        );
        base
    }

    /// Carve a slab received from a rebalance; every chunk becomes free.
    pub(crate) fn add_released_slab(&self, idx: usize, base: *mut u8) {
        let mut st = self.state.lock().unwrap();
        st.slabs.insert(idx);
        let size = self.alloc_size as usize;
        for k in (0..self.chunks_per_slab()).rev() {
            // SAFETY: k * size stays below SLAB_SIZE inside slab idx
            st.free_list.push(unsafe { base.add(k * size) });
        }
        debug!(class = self.class_id, slab = idx, "received rebalanced slab");
    }

    /// Errors unless `ptr` sits on a chunk boundary of slab `idx` and
    /// outside the unusable tail.
    fn check_alignment(&self, idx: usize, ptr: *const u8) -> Result<()> {
        let base = self.slab_allocator.slab_for_index(idx)? as usize;
        let offset = ptr as usize - base;
        let size = self.alloc_size as usize;
        if offset % size != 0 || offset / size >= self.chunks_per_slab() {
            return Err(Error::InvalidArgument(format!(
                "pointer {:p} is not a {}-byte allocation boundary",
                ptr, size
            )));
        }
        Ok(())
    }

    /// Return a chunk to the class.
    ///
    /// If the chunk's slab is marked for release the chunk retires into the
    /// release state instead of the free list, and the waiter in
    /// `complete_slab_release` is signalled once the slab has no live
    /// allocation left.
    pub(crate) fn free(&self, ptr: *mut u8) -> Result<()> {
        let idx = self.slab_allocator.index_for_slab(ptr).ok_or_else(|| {
            Error::InvalidArgument(format!("pointer {:p} does not belong to the allocator", ptr))
        })?;
        let mut st = self.state.lock().unwrap();
        if !st.slabs.contains(&idx) {
            return Err(Error::InvalidArgument(format!(
                "pointer {:p} is not in a slab owned by class {}",
                ptr, self.class_id
            )));
        }
        self.check_alignment(idx, ptr)?;

        if let Some(slot) = st.releases.get_mut(&idx) {
            let addr = ptr as usize;
            if !slot.live.remove(&addr) {
                return Err(Error::InvalidArgument(format!(
                    "pointer {:p} freed twice during slab release",
                    ptr
                )));
            }
            slot.freed.insert(addr);
            if slot.live.is_empty() {
                self.release_cv.notify_all();
            }
            return Ok(());
        }

        st.free_list.push(ptr);
        Ok(())
    }

    /// Mark one slab for release and snapshot its live allocations.
    ///
    /// The victim is the slab containing `hint` when given, otherwise the
    /// held slab with the most free chunks (least quiesce work). Free chunks
    /// of the victim leave the free list. When the victim has no live
    /// allocation the returned context is already released and the caller
    /// needs to do nothing further.
    pub(crate) fn start_slab_release(
        &self,
        mode: SlabReleaseMode,
        receiver: Option<ClassId>,
        hint: Option<*const u8>,
        should_abort: &dyn Fn() -> bool,
    ) -> Result<SlabReleaseContext> {
        if should_abort() {
            return Err(Error::ReleaseAborted(format!(
                "release from class {} aborted before start",
                self.class_id
            )));
        }

        let mut st = self.state.lock().unwrap();
        let idx = match hint {
            Some(p) => {
                let idx = self.slab_allocator.index_for_slab(p).ok_or_else(|| {
                    Error::InvalidArgument(format!(
                        "hint {:p} does not belong to the allocator",
                        p
                    ))
                })?;
                if !st.slabs.contains(&idx) {
                    return Err(Error::InvalidArgument(format!(
                        "hint {:p} is not in a slab owned by class {}",
                        p, self.class_id
                    )));
                }
                idx
            }
            None => self.pick_victim(&st)?,
        };
        if st.releases.contains_key(&idx) {
            return Err(Error::InvalidArgument(format!(
                "slab {} is already being released",
                idx
            )));
        }

        let header = self
            .slab_allocator
            .header_for_index(idx)
            .ok_or_else(|| Error::Runtime(format!("slab {} has no header", idx)))?;
        header.set_marked_for_release(true);

        // pull the victim's free chunks out of circulation
        let base = self.slab_allocator.slab_for_index(idx)? as usize;
        let mut freed = HashSet::new();
        let mut kept = Vec::with_capacity(st.free_list.len());
        for p in st.free_list.drain(..) {
            let addr = p as usize;
            if addr >= base && addr < base + SLAB_SIZE {
                freed.insert(addr);
            } else {
                kept.push(p);
            }
        }
        st.free_list = kept;

        // everything not free is still held by a caller
        let size = self.alloc_size as usize;
        let mut live = Vec::new();
        for k in 0..self.chunks_per_slab() {
            if k % ABORT_POLL_INTERVAL == 0 && should_abort() {
                // undo: unmark and put the free chunks back in rotation
                header.set_marked_for_release(false);
                st.free_list.extend(freed.iter().map(|&a| a as *mut u8));
                return Err(Error::ReleaseAborted(format!(
                    "release of slab {} from class {} aborted",
                    idx, self.class_id
                )));
            }
            let addr = base + k * size;
            if !freed.contains(&addr) {
                live.push(addr as *mut u8);
            }
        }

        if live.is_empty() {
            // no caller holds anything in the slab; it is released right away
            st.slabs.remove(&idx);
            debug!(
                class = self.class_id,
                slab = idx,
                "released slab with no live allocations"
            );
            return Ok(SlabReleaseContext::new(
                self.pool_id,
                self.class_id,
                receiver,
                mode,
                idx,
                Vec::new(),
                true,
            ));
        }

        debug!(
            class = self.class_id,
            slab = idx,
            live = live.len(),
            "marked slab for release"
        );
        st.releases.insert(
            idx,
            ReleaseSlot {
                live: live.iter().map(|&p| p as usize).collect(),
                freed,
            },
        );
        Ok(SlabReleaseContext::new(
            self.pool_id,
            self.class_id,
            receiver,
            mode,
            idx,
            live,
            false,
        ))
    }

    /// Slab with the most free chunks, to minimize quiesce work
    fn pick_victim(&self, st: &ClassState) -> Result<usize> {
        if st.slabs.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "class {} holds no slab to release",
                self.class_id
            )));
        }
        let mut free_per_slab: HashMap<usize, usize> = HashMap::new();
        for &p in &st.free_list {
            if let Some(idx) = self.slab_allocator.index_for_slab(p) {
                *free_per_slab.entry(idx).or_insert(0) += 1;
            }
        }
        st.slabs
            .iter()
            .filter(|idx| !st.releases.contains_key(idx))
            .max_by_key(|idx| free_per_slab.get(idx).copied().unwrap_or(0))
            .copied()
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "every slab of class {} is already being released",
                    self.class_id
                ))
            })
    }

    fn slot_for_context<'a>(
        &self,
        st: &'a ClassState,
        ctx: &SlabReleaseContext,
    ) -> Result<&'a ReleaseSlot> {
        st.releases.get(&ctx.slab_index()).ok_or_else(|| {
            Error::Runtime(format!(
                "slab {} has no release state for class {}",
                ctx.slab_index(),
                self.class_id
            ))
        })
    }

    fn check_in_released_slab(&self, ctx: &SlabReleaseContext, ptr: *const u8) -> Result<()> {
        let idx = self.slab_allocator.index_for_slab(ptr).ok_or_else(|| {
            Error::InvalidArgument(format!("pointer {:p} does not belong to the allocator", ptr))
        })?;
        if idx != ctx.slab_index() {
            return Err(Error::InvalidArgument(format!(
                "pointer {:p} is not inside the slab being released",
                ptr
            )));
        }
        self.check_alignment(idx, ptr)
    }

    /// True iff `ptr` lies in the released slab and is no longer live
    pub(crate) fn is_alloc_free(&self, ctx: &SlabReleaseContext, ptr: *const u8) -> Result<bool> {
        self.check_in_released_slab(ctx, ptr)?;
        let st = self.state.lock().unwrap();
        let slot = self.slot_for_context(&st, ctx)?;
        Ok(!slot.live.contains(&(ptr as usize)))
    }

    /// True once every live allocation of the context has been freed
    pub(crate) fn all_allocs_freed(&self, ctx: &SlabReleaseContext) -> Result<bool> {
        let st = self.state.lock().unwrap();
        let slot = self.slot_for_context(&st, ctx)?;
        Ok(slot.live.is_empty())
    }

    /// Run `callback` on `ptr` if it is still live, then retire it.
    ///
    /// Used by callers that relocate data out of the slab: the callback sees
    /// the allocation while it is still valid, after which the allocator
    /// treats it as freed. A pointer already retired is a no-op. The callback
    /// runs under the class lock and must not reenter the allocator.
    pub(crate) fn process_alloc_for_release(
        &self,
        ctx: &SlabReleaseContext,
        ptr: *mut u8,
        callback: &mut dyn FnMut(*mut u8),
    ) -> Result<()> {
        self.check_in_released_slab(ctx, ptr)?;
        let mut st = self.state.lock().unwrap();
        self.slot_for_context(&st, ctx)?;
        let slot = st.releases.get_mut(&ctx.slab_index()).expect("checked above");
        let addr = ptr as usize;
        if slot.live.contains(&addr) {
            callback(ptr);
            slot.live.remove(&addr);
            slot.freed.insert(addr);
            if slot.live.is_empty() {
                self.release_cv.notify_all();
            }
        }
        Ok(())
    }

    /// Block until every live allocation is freed, then retire the release
    /// state and drop the slab from this class.
    pub(crate) fn wait_and_finish_release(&self, ctx: &SlabReleaseContext) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        loop {
            let quiesced = match st.releases.get(&ctx.slab_index()) {
                None => {
                    return Err(Error::Runtime(format!(
                        "slab {} lost its release state for class {}",
                        ctx.slab_index(),
                        self.class_id
                    )))
                }
                Some(slot) => slot.live.is_empty(),
            };
            if quiesced {
                break;
            }
            st = self.release_cv.wait(st).unwrap();
        }
        st.releases.remove(&ctx.slab_index());
        st.slabs.remove(&ctx.slab_index());
        debug!(
            class = self.class_id,
            slab = ctx.slab_index(),
            "slab release complete"
        );
        Ok(())
    }

    /// Put a marked slab back into serving rotation.
    ///
    /// Requires live allocations to remain (otherwise the release should be
    /// completed instead). Chunks freed while the slab was marked stay free:
    /// they rejoin the free list rather than the live set.
    pub(crate) fn abort_release(&self, ctx: &SlabReleaseContext) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        {
            let slot = st.releases.get(&ctx.slab_index()).ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "slab {} is not being released by class {}",
                    ctx.slab_index(),
                    self.class_id
                ))
            })?;
            if slot.live.is_empty() {
                return Err(Error::InvalidArgument(format!(
                    "slab {} has no live allocation left; complete the release instead",
                    ctx.slab_index()
                )));
            }
        }
        let slot = st.releases.remove(&ctx.slab_index()).expect("checked above");
        self.slab_allocator
            .header_for_index(ctx.slab_index())
            .ok_or_else(|| Error::Runtime(format!("slab {} has no header", ctx.slab_index())))?
            .set_marked_for_release(false);
        st.free_list.extend(slot.freed.iter().map(|&a| a as *mut u8));
        debug!(
            class = self.class_id,
            slab = ctx.slab_index(),
            restored_free = slot.freed.len(),
            "aborted slab release"
        );
        Ok(())
    }

    /// Invoke `callback` on every chunk of slab `idx` (allocated or free).
    ///
    /// Re-checks under the class lock that the slab is still owned and not
    /// mid-release; a stale traversal sees the slab skipped.
    pub(crate) fn for_each_allocation(
        &self,
        idx: usize,
        callback: &mut dyn FnMut(*mut u8, AllocInfo) -> SlabIterationStatus,
    ) -> SlabIterationStatus {
        let st = self.state.lock().unwrap();
        if !st.slabs.contains(&idx) || st.releases.contains_key(&idx) {
            return SlabIterationStatus::SkipCurrentSlabAndContinue;
        }
        let base = match self.slab_allocator.slab_for_index(idx) {
            Ok(b) => b,
            Err(_) => return SlabIterationStatus::SkipCurrentSlabAndContinue,
        };
        let info = AllocInfo {
            pool_id: self.pool_id,
            class_id: self.class_id,
            alloc_size: self.alloc_size,
        };
        let size = self.alloc_size as usize;
        for k in 0..self.chunks_per_slab() {
            // SAFETY: k * size stays below SLAB_SIZE inside slab idx
            let ptr = unsafe { base.add(k * size) };
            match callback(ptr, info) {
                SlabIterationStatus::Continue => {}
                status => return status,
            }
        }
        SlabIterationStatus::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::TestRegion;
    use super::*;

    fn class_with_slab(
        region: &TestRegion,
        alloc_size: u32,
    ) -> (Arc<SlabAllocator>, AllocationClass, *mut u8) {
        let sa = region.slab_allocator();
        let class = AllocationClass::new(0, 0, alloc_size, Arc::clone(&sa));
        let (idx, base) = sa.acquire_free_slab().unwrap();
        sa.assign_slab(idx, 0, 0, alloc_size);
        let first = class.add_slab(idx, base);
        assert_eq!(first, base);
        (sa, class, base)
    }

    #[test]
    fn test_carve_and_lifo_reuse() {
        let region = TestRegion::new(1);
        let (_sa, class, base) = class_with_slab(&region, 1024 * 1024);

        // 4 MiB slab at 1 MiB chunks: first chunk returned by add_slab,
        // three more on the free list in ascending pop order
        assert_eq!(class.chunks_per_slab(), 4);
        assert_eq!(class.free_alloc_count(), 3);
        let p1 = class.allocate().unwrap();
        assert_eq!(p1 as usize, base as usize + 1024 * 1024);

        class.free(p1).unwrap();
        // LIFO: the chunk just freed comes back first
        assert_eq!(class.allocate().unwrap(), p1);
    }

    #[test]
    fn test_free_rejects_foreign_and_misaligned_pointers() {
        let region = TestRegion::new(2);
        let (sa, class, base) = class_with_slab(&region, 4096);

        // pointer inside a slab the class does not own
        let other = sa.slab_for_index(1).unwrap();
        assert!(class.free(other).is_err());

        // misaligned pointer inside the owned slab
        let crooked = unsafe { base.add(7) };
        assert!(class.free(crooked).is_err());

        // pointer outside the allocator entirely
        assert!(class.free(0x40usize as *mut u8).is_err());
    }

    #[test]
    fn test_release_with_no_live_allocations_is_immediate() {
        let region = TestRegion::new(1);
        let (_sa, class, base) = class_with_slab(&region, 1024 * 1024);

        // return the carve-time chunk so the whole slab is free
        class.free(base).unwrap();

        let ctx = class
            .start_slab_release(SlabReleaseMode::Resize, None, None, &|| false)
            .unwrap();
        assert!(ctx.is_released());
        assert!(ctx.live_allocations().is_empty());
        assert_eq!(class.held_slab_count(), 0);
        assert_eq!(class.free_alloc_count(), 0);
    }

    #[test]
    fn test_release_tracks_live_allocations() {
        let region = TestRegion::new(1);
        let (sa, class, base) = class_with_slab(&region, 1024 * 1024);
        let p1 = base;
        let p2 = class.allocate().unwrap();

        let ctx = class
            .start_slab_release(SlabReleaseMode::Resize, None, None, &|| false)
            .unwrap();
        assert!(!ctx.is_released());
        assert_eq!(ctx.live_allocations().len(), 2);
        assert!(sa.header_for_index(0).unwrap().is_marked_for_release());

        // free chunks left the free list when the slab was marked
        assert_eq!(class.free_alloc_count(), 0);
        assert!(class.allocate().is_none());

        assert!(!class.is_alloc_free(&ctx, p1).unwrap());
        class.free(p1).unwrap();
        assert!(class.is_alloc_free(&ctx, p1).unwrap());
        assert!(!class.all_allocs_freed(&ctx).unwrap());

        class.free(p2).unwrap();
        assert!(class.all_allocs_freed(&ctx).unwrap());

        class.wait_and_finish_release(&ctx).unwrap();
        assert_eq!(class.held_slab_count(), 0);
    }

    #[test]
    fn test_abort_restores_only_freed_chunks() {
        let region = TestRegion::new(1);
        let (sa, class, base) = class_with_slab(&region, 1024 * 1024);
        let p1 = base;
        let _p2 = class.allocate().unwrap();
        // two chunks free, two live

        let ctx = class
            .start_slab_release(SlabReleaseMode::Resize, None, None, &|| false)
            .unwrap();
        assert_eq!(ctx.live_allocations().len(), 2);

        // free one of the live allocations mid-release
        class.free(p1).unwrap();

        class.abort_release(&ctx).unwrap();
        assert!(!sa.header_for_index(0).unwrap().is_marked_for_release());
        // the two originally-free chunks plus the one freed during the
        // aborted release are back in rotation; p2 stays handed out
        assert_eq!(class.free_alloc_count(), 3);
        assert_eq!(class.held_slab_count(), 1);
    }

    #[test]
    fn test_abort_requires_live_allocations() {
        let region = TestRegion::new(1);
        let (_sa, class, base) = class_with_slab(&region, 1024 * 1024);
        let ctx = class
            .start_slab_release(SlabReleaseMode::Resize, None, None, &|| false)
            .unwrap();
        class.free(base).unwrap();
        for &p in ctx.live_allocations() {
            if p != base {
                class.free(p).unwrap();
            }
        }
        assert!(class.abort_release(&ctx).is_err());
    }

    #[test]
    fn test_abort_predicate_cancels_release() {
        let region = TestRegion::new(1);
        let (sa, class, _base) = class_with_slab(&region, 1024 * 1024);
        let free_before = class.free_alloc_count();

        let result = class.start_slab_release(SlabReleaseMode::Resize, None, None, &|| true);
        assert!(matches!(result, Err(Error::ReleaseAborted(_))));
        assert!(!sa.header_for_index(0).unwrap().is_marked_for_release());
        assert_eq!(class.free_alloc_count(), free_before);
    }

    #[test]
    fn test_victim_prefers_most_free_slab() {
        let region = TestRegion::new(2);
        let sa = region.slab_allocator();
        let class = AllocationClass::new(0, 0, 1024 * 1024, Arc::clone(&sa));

        // slab 0: all four chunks handed out
        let (i0, b0) = sa.acquire_free_slab().unwrap();
        sa.assign_slab(i0, 0, 0, 1024 * 1024);
        class.add_slab(i0, b0);
        for _ in 0..3 {
            class.allocate().unwrap();
        }

        // slab 1: everything free
        let (i1, b1) = sa.acquire_free_slab().unwrap();
        sa.assign_slab(i1, 0, 0, 1024 * 1024);
        let first = class.add_slab(i1, b1);
        class.free(first).unwrap();

        let ctx = class
            .start_slab_release(SlabReleaseMode::Resize, None, None, &|| false)
            .unwrap();
        assert_eq!(ctx.slab_index(), i1);
        assert!(ctx.is_released());
    }

    #[test]
    fn test_process_alloc_for_release_retires_chunk() {
        let region = TestRegion::new(1);
        let (_sa, class, base) = class_with_slab(&region, 1024 * 1024);
        let ctx = class
            .start_slab_release(SlabReleaseMode::Resize, None, None, &|| false)
            .unwrap();

        let mut seen = Vec::new();
        class
            .process_alloc_for_release(&ctx, base, &mut |p| seen.push(p as usize))
            .unwrap();
        assert_eq!(seen, vec![base as usize]);
        assert!(class.is_alloc_free(&ctx, base).unwrap());

        // second call is a no-op
        class
            .process_alloc_for_release(&ctx, base, &mut |p| seen.push(p as usize))
            .unwrap();
        assert_eq!(seen.len(), 1);
    }
}
