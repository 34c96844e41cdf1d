//! Memory allocator façade
//!
//! Public entry point of the engine. Constructs the slab allocator and the
//! pool manager from a config and dispatches allocation, free, introspection,
//! and slab-release calls to the right pool and class.

use super::pool::{MemoryPool, PoolStats};
use super::pool_manager::MemoryPoolManager;
use super::release::{SlabIterationStatus, SlabReleaseContext, SlabReleaseMode};
use super::size_class::generate_alloc_sizes;
use super::slab::{AllocInfo, ClassId, PoolId, SlabHeader, SLAB_SIZE};
use super::slab_allocator::SlabAllocator;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::alloc::{alloc, dealloc, Layout};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Configuration for the memory allocator
///
/// `alloc_sizes` is the default set of allocation-class sizes used by pools
/// that do not supply their own. When empty, pools fall back to
/// [`generate_alloc_sizes`] with its default parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllocatorConfig {
    pub alloc_sizes: BTreeSet<u32>,
}

impl AllocatorConfig {
    pub fn new(alloc_sizes: BTreeSet<u32>) -> Self {
        Self { alloc_sizes }
    }
}

/// Backing buffers owned by the allocator itself (see
/// [`MemoryAllocator::with_owned_memory`])
struct OwnedRegions {
    header_ptr: *mut u8,
    header_layout: Layout,
    slab_ptr: *mut u8,
    slab_layout: Layout,
}

// SAFETY: the pointers are only freed once, on drop.
unsafe impl Send for OwnedRegions {}
unsafe impl Sync for OwnedRegions {}

impl Drop for OwnedRegions {
    fn drop(&mut self) {
        // SAFETY: allocated with exactly these layouts in with_owned_memory
        unsafe {
            dealloc(self.header_ptr, self.header_layout);
            dealloc(self.slab_ptr, self.slab_layout);
        }
    }
}

/// Serves variable-size allocations out of named memory pools
///
/// ```no_run
/// use slabstore::allocator::{AllocatorConfig, MemoryAllocator, SLAB_SIZE};
/// use std::collections::BTreeSet;
///
/// let allocator =
///     MemoryAllocator::with_owned_memory(AllocatorConfig::default(), 16 * SLAB_SIZE).unwrap();
/// let sizes: BTreeSet<u32> = [128, 256, 1024].into_iter().collect();
/// let pool = allocator.add_pool("hot", 8 * SLAB_SIZE, &sizes, false).unwrap();
///
/// let ptr = allocator.allocate(pool, 100).unwrap().expect("out of memory");
/// assert_eq!(allocator.get_alloc_info(ptr).unwrap().alloc_size, 128);
/// allocator.free(ptr).unwrap();
/// ```
pub struct MemoryAllocator {
    config: AllocatorConfig,
    slab_allocator: Arc<SlabAllocator>,
    pool_manager: MemoryPoolManager,
    /// Present only for allocators built by `with_owned_memory`; must be
    /// dropped after everything above
    _owned: Option<OwnedRegions>,
}

impl MemoryAllocator {
    /// Create an allocator over caller-owned memory.
    ///
    /// # Safety
    ///
    /// Both regions must be valid for reads and writes for the given sizes,
    /// must not overlap, and must outlive the allocator and every pool handle
    /// obtained from it. See [`SlabAllocator::new`].
    pub unsafe fn new(
        config: AllocatorConfig,
        header_memory_start: *mut u8,
        header_memory_size: usize,
        slab_memory_start: *mut u8,
        slab_memory_size: usize,
    ) -> Result<Self> {
        // SAFETY: forwarded caller contract
        let slab_allocator = Arc::new(unsafe {
            SlabAllocator::new(
                header_memory_start,
                header_memory_size,
                slab_memory_start,
                slab_memory_size,
            )
        }?);
        info!(
            slabs = slab_allocator.usable_slab_count(),
            memory = slab_allocator.memory_size(),
            "constructed memory allocator"
        );
        Ok(Self {
            config,
            pool_manager: MemoryPoolManager::new(Arc::clone(&slab_allocator)),
            slab_allocator,
            _owned: None,
        })
    }

    /// Create an allocator that allocates and owns its backing buffers.
    ///
    /// `memory_size` rounds down to a whole number of slabs. Pool handles
    /// returned by [`Self::pool`] must not be used after the allocator is
    /// dropped.
    pub fn with_owned_memory(config: AllocatorConfig, memory_size: usize) -> Result<Self> {
        let num_slabs = memory_size / SLAB_SIZE;
        if num_slabs == 0 {
            return Err(Error::InvalidArgument(format!(
                "memory size {} holds no {}-byte slab",
                memory_size, SLAB_SIZE
            )));
        }
        let header_layout = Layout::array::<SlabHeader>(num_slabs)
            .map_err(|e| Error::InvalidArgument(format!("header layout: {}", e)))?;
        let slab_layout = Layout::from_size_align(num_slabs * SLAB_SIZE, SLAB_SIZE)
            .map_err(|e| Error::InvalidArgument(format!("slab layout: {}", e)))?;
        // SAFETY: both layouts have non-zero size
        let header_ptr = unsafe { alloc(header_layout) };
        let slab_ptr = unsafe { alloc(slab_layout) };
        if header_ptr.is_null() || slab_ptr.is_null() {
            // SAFETY: non-null pointers were allocated just above with these
            // exact layouts
            unsafe {
                if !header_ptr.is_null() {
                    dealloc(header_ptr, header_layout);
                }
                if !slab_ptr.is_null() {
                    dealloc(slab_ptr, slab_layout);
                }
            }
            return Err(Error::Runtime(format!(
                "failed to reserve {} bytes of backing memory",
                memory_size
            )));
        }
        let owned = OwnedRegions {
            header_ptr,
            header_layout,
            slab_ptr,
            slab_layout,
        };
        // SAFETY: regions freshly allocated with the sizes passed in, owned
        // by the struct being built
        let mut allocator = unsafe {
            Self::new(
                config,
                header_ptr,
                header_layout.size(),
                slab_ptr,
                slab_layout.size(),
            )
        }?;
        allocator._owned = Some(owned);
        Ok(allocator)
    }

    /// Register a memory pool of `size` bytes.
    ///
    /// `alloc_sizes` falls back to the allocator config, then to the default
    /// size-class generator. Pools cannot be removed once added.
    pub fn add_pool(
        &self,
        name: &str,
        size: usize,
        alloc_sizes: &BTreeSet<u32>,
        ensure_provisionable: bool,
    ) -> Result<PoolId> {
        let generated;
        let effective = if !alloc_sizes.is_empty() {
            alloc_sizes
        } else if !self.config.alloc_sizes.is_empty() {
            &self.config.alloc_sizes
        } else {
            generated = generate_alloc_sizes(1.25, 72, SLAB_SIZE as u32, false)?;
            &generated
        };
        self.pool_manager
            .add_pool(name, size, effective, ensure_provisionable)
    }

    /// Allocate `size` bytes from pool `id`.
    ///
    /// Returns `Ok(None)` when the pool is out of memory; errors on an
    /// unknown pool or a size above the pool's largest class.
    pub fn allocate(&self, id: PoolId, size: u32) -> Result<Option<*mut u8>> {
        self.pool_manager.pool_by_id(id)?.allocate(size)
    }

    /// Return an allocation to its owning class.
    pub fn free(&self, ptr: *mut u8) -> Result<()> {
        let info = self.get_alloc_info(ptr)?;
        self.pool_manager.pool_by_id(info.pool_id)?.free(ptr)
    }

    /// Pool, class, and allocation size of `ptr`, straight from the slab
    /// header.
    pub fn get_alloc_info(&self, ptr: *const u8) -> Result<AllocInfo> {
        self.slab_allocator
            .slab_header(ptr)
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "pointer {:p} does not belong to the allocator",
                    ptr
                ))
            })?
            .alloc_info()
            .ok_or_else(|| {
                Error::InvalidArgument(format!("pointer {:p} is in an unowned slab", ptr))
            })
    }

    /// Start releasing one slab from `(pool, victim)`.
    ///
    /// `mode` decides where the slab goes on completion: back to the slab
    /// allocator (`Resize`) or to `receiver` in the same pool (`Rebalance`);
    /// `receiver` may only be given in rebalance mode. `victim` may be
    /// omitted when `hint` identifies the slab, or to let the pool pick the
    /// class with the most free allocations. If the returned context is
    /// already released the caller needs to do nothing further; otherwise it
    /// must free (or relocate) every allocation in the context and call
    /// [`Self::complete_slab_release`].
    pub fn start_slab_release(
        &self,
        pool: PoolId,
        victim: Option<ClassId>,
        receiver: Option<ClassId>,
        mode: SlabReleaseMode,
        hint: Option<*const u8>,
    ) -> Result<SlabReleaseContext> {
        self.start_slab_release_with_abort(pool, victim, receiver, mode, hint, || false)
    }

    /// Like [`Self::start_slab_release`], with a cooperative abort predicate
    /// polled while the slab is being scanned.
    pub fn start_slab_release_with_abort(
        &self,
        pool: PoolId,
        victim: Option<ClassId>,
        receiver: Option<ClassId>,
        mode: SlabReleaseMode,
        hint: Option<*const u8>,
        should_abort: impl Fn() -> bool,
    ) -> Result<SlabReleaseContext> {
        match (mode, receiver) {
            (SlabReleaseMode::Resize, Some(_)) => {
                return Err(Error::InvalidArgument(
                    "a resize-mode release cannot name a receiver class".to_string(),
                ))
            }
            (SlabReleaseMode::Rebalance, None) => {
                return Err(Error::InvalidArgument(
                    "a rebalance-mode release needs a receiver class".to_string(),
                ))
            }
            _ => {}
        }

        let pool_ref = self.pool_manager.pool_by_id(pool)?;
        let victim_id = self.resolve_victim(&pool_ref, victim, hint)?;
        if receiver == Some(victim_id) {
            return Err(Error::InvalidArgument(format!(
                "class {} cannot receive its own slab",
                victim_id
            )));
        }
        if let Some(recv) = receiver {
            // validate early so completion cannot fail on an unknown receiver
            pool_ref.get_alloc_class(recv)?;
        }

        let ctx = pool_ref.get_alloc_class(victim_id)?.start_slab_release(
            mode,
            receiver,
            hint,
            &should_abort,
        )?;
        if ctx.is_released() {
            self.dispose_released_slab(&ctx)?;
        }
        Ok(ctx)
    }

    /// The class a release takes its slab from
    fn resolve_victim(
        &self,
        pool: &MemoryPool,
        victim: Option<ClassId>,
        hint: Option<*const u8>,
    ) -> Result<ClassId> {
        if let Some(cid) = victim {
            pool.get_alloc_class(cid)?;
            return Ok(cid);
        }
        if let Some(p) = hint {
            let info = self.get_alloc_info(p)?;
            if info.pool_id != pool.pool_id() {
                return Err(Error::InvalidArgument(format!(
                    "hint {:p} belongs to pool {}, not pool {}",
                    p,
                    info.pool_id,
                    pool.pool_id()
                )));
            }
            return Ok(info.class_id);
        }
        // no victim, no hint: prefer the class with the most free
        // allocations, which needs the least quiescing
        (0..pool.class_count() as ClassId)
            .filter_map(|cid| pool.get_alloc_class(cid).ok())
            .filter(|c| c.held_slab_count() > 0)
            .max_by_key(|c| c.free_alloc_count())
            .map(|c| c.class_id())
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "pool '{}' holds no slab to release",
                    pool.name()
                ))
            })
    }

    /// Hand a fully quiesced slab to its destination.
    fn dispose_released_slab(&self, ctx: &SlabReleaseContext) -> Result<()> {
        let pool = self.pool_manager.pool_by_id(ctx.pool_id())?;
        match ctx.mode() {
            SlabReleaseMode::Resize => {
                self.slab_allocator.release_slab(ctx.slab_index())?;
                pool.release_slab_budget();
                debug!(
                    pool = ctx.pool_id(),
                    slab = ctx.slab_index(),
                    "slab returned to the slab allocator"
                );
            }
            SlabReleaseMode::Rebalance => {
                let receiver_id = ctx.receiver_class_id().ok_or_else(|| {
                    Error::Runtime("rebalance context lost its receiver class".to_string())
                })?;
                let receiver = pool.get_alloc_class(receiver_id)?;
                self.slab_allocator.assign_slab(
                    ctx.slab_index(),
                    ctx.pool_id(),
                    receiver_id,
                    receiver.alloc_size(),
                );
                let base = self.slab_allocator.slab_for_index(ctx.slab_index())?;
                receiver.add_released_slab(ctx.slab_index(), base);
                debug!(
                    pool = ctx.pool_id(),
                    slab = ctx.slab_index(),
                    victim = ctx.victim_class_id(),
                    receiver = receiver_id,
                    "slab rebalanced"
                );
            }
        }
        Ok(())
    }

    /// Finish a slab release, blocking until every live allocation in the
    /// context has been freed. A context that is already released is a no-op.
    pub fn complete_slab_release(&self, ctx: SlabReleaseContext) -> Result<()> {
        if ctx.is_released() {
            return Ok(());
        }
        let pool = self.pool_manager.pool_by_id(ctx.pool_id())?;
        pool.get_alloc_class(ctx.victim_class_id())?
            .wait_and_finish_release(&ctx)?;
        self.dispose_released_slab(&ctx)
    }

    /// Abort a slab release that still has live allocations. Allocations
    /// freed while the release was in flight stay free.
    pub fn abort_slab_release(&self, ctx: SlabReleaseContext) -> Result<()> {
        if ctx.is_released() {
            return Err(Error::InvalidArgument(
                "cannot abort a release that already completed".to_string(),
            ));
        }
        let pool = self.pool_manager.pool_by_id(ctx.pool_id())?;
        pool.get_alloc_class(ctx.victim_class_id())?
            .abort_release(&ctx)
    }

    /// True iff `ptr` lies in the slab of `ctx` and has been freed
    pub fn is_alloc_free(&self, ctx: &SlabReleaseContext, ptr: *const u8) -> Result<bool> {
        if ctx.is_released() {
            return Ok(true);
        }
        let pool = self.pool_manager.pool_by_id(ctx.pool_id())?;
        pool.get_alloc_class(ctx.victim_class_id())?
            .is_alloc_free(ctx, ptr)
    }

    /// True once every live allocation of `ctx` has been freed
    pub fn all_allocs_freed(&self, ctx: &SlabReleaseContext) -> Result<bool> {
        if ctx.is_released() {
            return Ok(true);
        }
        let pool = self.pool_manager.pool_by_id(ctx.pool_id())?;
        pool.get_alloc_class(ctx.victim_class_id())?
            .all_allocs_freed(ctx)
    }

    /// Run `callback` on `ptr` if it is still live in `ctx`, then treat it
    /// as freed. See `AllocationClass::process_alloc_for_release`.
    pub fn process_alloc_for_release(
        &self,
        ctx: &SlabReleaseContext,
        ptr: *mut u8,
        mut callback: impl FnMut(*mut u8),
    ) -> Result<()> {
        if ctx.is_released() {
            return Ok(());
        }
        let pool = self.pool_manager.pool_by_id(ctx.pool_id())?;
        pool.get_alloc_class(ctx.victim_class_id())?
            .process_alloc_for_release(ctx, ptr, &mut callback)
    }

    /// Traverse every chunk of every serving slab.
    ///
    /// Slabs that are unassigned, advised, or marked for release are skipped;
    /// their count is returned. The callback sees every chunk of the
    /// remaining slabs, allocated or free alike, and can stop the current
    /// slab or the whole traversal through its return value.
    pub fn for_each_allocation(
        &self,
        mut callback: impl FnMut(*mut u8, AllocInfo) -> SlabIterationStatus,
    ) -> u64 {
        let mut skipped = 0u64;
        for idx in 0..self.slab_allocator.usable_slab_count() {
            let header = match self.slab_allocator.header_for_index(idx) {
                Some(h) => h,
                None => continue,
            };
            let info = match header.alloc_info() {
                Some(info) => info,
                None => {
                    skipped += 1;
                    continue;
                }
            };
            if header.is_advised() || header.is_marked_for_release() {
                skipped += 1;
                continue;
            }
            let pool = match self.pool_manager.pool_by_id(info.pool_id) {
                Ok(p) => p,
                Err(_) => {
                    skipped += 1;
                    continue;
                }
            };
            match pool.for_each_allocation(info.class_id, idx, &mut callback) {
                SlabIterationStatus::Continue => {}
                SlabIterationStatus::SkipCurrentSlabAndContinue => skipped += 1,
                SlabIterationStatus::AbortIteration => return skipped,
            }
        }
        skipped
    }

    // -- pool budget operations ------------------------------------------

    pub fn grow_pool(&self, id: PoolId, bytes: usize) -> Result<bool> {
        self.pool_manager.grow_pool(id, bytes)
    }

    pub fn shrink_pool(&self, id: PoolId, bytes: usize) -> Result<bool> {
        self.pool_manager.shrink_pool(id, bytes)
    }

    pub fn resize_pools(&self, src: PoolId, dst: PoolId, bytes: usize) -> Result<bool> {
        self.pool_manager.resize_pools(src, dst, bytes)
    }

    pub fn pools_over_limit(&self) -> Vec<PoolId> {
        self.pool_manager.get_pools_over_limit()
    }

    // -- introspection ---------------------------------------------------

    /// Pool id registered under `name`, if any
    pub fn pool_id(&self, name: &str) -> Option<PoolId> {
        self.pool_manager.pool_id_by_name(name)
    }

    pub fn pool_name(&self, id: PoolId) -> Result<String> {
        self.pool_manager.pool_name_by_id(id)
    }

    pub fn pool_ids(&self) -> Vec<PoolId> {
        self.pool_manager.pool_ids()
    }

    /// Read-only handle to a pool; must not outlive the allocator
    pub fn pool(&self, id: PoolId) -> Result<Arc<MemoryPool>> {
        self.pool_manager.pool_by_id(id)
    }

    /// Total usable bytes across all slabs
    pub fn memory_size(&self) -> usize {
        self.slab_allocator.memory_size()
    }

    pub fn unreserved_memory_size(&self) -> usize {
        self.pool_manager.bytes_unreserved()
    }

    pub fn advised_memory_size(&self) -> usize {
        self.pool_manager.advised_memory_size()
    }

    pub fn usable_slab_count(&self) -> usize {
        self.slab_allocator.usable_slab_count()
    }

    pub fn free_slab_count(&self) -> usize {
        self.slab_allocator.free_slab_count()
    }

    /// True once every slab is owned by some pool
    pub fn all_slabs_allocated(&self) -> bool {
        self.slab_allocator.all_slabs_allocated()
    }

    /// True once `id` cannot pull another slab within its target
    pub fn pool_slabs_allocated(&self, id: PoolId) -> Result<bool> {
        Ok(self.pool_manager.pool_by_id(id)?.all_slabs_allocated())
    }

    /// Allocation size served by `(pool, class)`
    pub fn alloc_size(&self, pool: PoolId, class: ClassId) -> Result<u32> {
        self.pool_manager.pool_by_id(pool)?.get_alloc_size(class)
    }

    /// Class that would serve an allocation of `size` bytes in `pool`
    pub fn allocation_class_id(&self, pool: PoolId, size: u32) -> Result<ClassId> {
        self.pool_manager.pool_by_id(pool)?.classify(size)
    }

    /// The allocator-level default allocation sizes
    pub fn alloc_sizes(&self) -> &BTreeSet<u32> {
        &self.config.alloc_sizes
    }

    /// Usage snapshot across every pool
    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            memory_size: self.memory_size(),
            unreserved: self.unreserved_memory_size(),
            advised: self.advised_memory_size(),
            free_slabs: self.free_slab_count(),
            pools: self
                .pool_ids()
                .into_iter()
                .filter_map(|id| self.pool(id).ok())
                .map(|p| p.stats())
                .collect(),
        }
    }
}

/// Usage snapshot across the whole allocator
#[derive(Debug, Clone, Serialize)]
pub struct AllocatorStats {
    pub memory_size: usize,
    pub unreserved: usize,
    pub advised: usize,
    pub free_slabs: usize,
    pub pools: Vec<PoolStats>,
}
