//! Memory pool: a budget of slabs divided across allocation classes
//!
//! A pool owns one allocation class per configured size, sorted ascending so
//! a request classifies to the smallest class that fits. The pool tracks a
//! byte budget: slabs are pulled from the slab allocator only while
//! `current + SLAB_SIZE <= target`. Shrinking only moves the target; the
//! physical slabs leave lazily through slab release.

use super::alloc_class::AllocationClass;
use super::release::SlabIterationStatus;
use super::slab::{AllocInfo, ClassId, PoolId, ALIGNMENT, MAX_CLASSES, SLAB_SIZE};
use super::slab_allocator::SlabAllocator;
use crate::error::{Error, Result};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

struct PoolBudget {
    target_size: usize,
    current_size: usize,
}

/// A named budget of slabs, divided across allocation classes
pub struct MemoryPool {
    pool_id: PoolId,
    name: String,
    /// Classes sorted by ascending alloc size; index equals class id
    classes: Vec<AllocationClass>,
    alloc_sizes: Vec<u32>,
    budget: Mutex<PoolBudget>,
    slab_allocator: Arc<SlabAllocator>,
}

impl MemoryPool {
    pub(crate) fn new(
        pool_id: PoolId,
        name: String,
        target_size: usize,
        alloc_sizes: &BTreeSet<u32>,
        slab_allocator: Arc<SlabAllocator>,
    ) -> Result<Self> {
        if alloc_sizes.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "pool '{}' needs at least one allocation size",
                name
            )));
        }
        if alloc_sizes.len() > MAX_CLASSES {
            return Err(Error::InvalidArgument(format!(
                "pool '{}' declares {} allocation sizes, maximum is {}",
                name,
                alloc_sizes.len(),
                MAX_CLASSES
            )));
        }
        for &size in alloc_sizes {
            if size as usize % ALIGNMENT != 0 || (size as usize) < ALIGNMENT {
                return Err(Error::InvalidArgument(format!(
                    "allocation size {} is not a positive multiple of {}",
                    size, ALIGNMENT
                )));
            }
            if size as usize > SLAB_SIZE {
                return Err(Error::InvalidArgument(format!(
                    "allocation size {} exceeds slab size {}",
                    size, SLAB_SIZE
                )));
            }
        }

        let classes = alloc_sizes
            .iter()
            .enumerate()
            .map(|(i, &size)| {
                AllocationClass::new(i as ClassId, pool_id, size, Arc::clone(&slab_allocator))
            })
            .collect();

        info!(
            pool = pool_id,
            name = %name,
            target_size,
            classes = alloc_sizes.len(),
            "created memory pool"
        );

        Ok(Self {
            pool_id,
            name,
            classes,
            alloc_sizes: alloc_sizes.iter().copied().collect(),
            budget: Mutex::new(PoolBudget {
                target_size,
                current_size: 0,
            }),
            slab_allocator,
        })
    }

    pub fn pool_id(&self) -> PoolId {
        self.pool_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bytes the pool is allowed to hold
    pub fn target_size(&self) -> usize {
        self.budget.lock().unwrap().target_size
    }

    /// Bytes the pool currently holds in slabs
    pub fn current_size(&self) -> usize {
        self.budget.lock().unwrap().current_size
    }

    /// Sizes served by this pool, ascending
    pub fn alloc_sizes(&self) -> &[u32] {
        &self.alloc_sizes
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    /// Smallest class whose allocation size fits `size`
    pub fn classify(&self, size: u32) -> Result<ClassId> {
        if size == 0 {
            return Err(Error::InvalidArgument(
                "cannot allocate zero bytes".to_string(),
            ));
        }
        let pos = self.alloc_sizes.partition_point(|&s| s < size);
        if pos == self.alloc_sizes.len() {
            return Err(Error::InvalidArgument(format!(
                "size {} exceeds the largest allocation class ({}) of pool '{}'",
                size,
                self.alloc_sizes.last().unwrap(),
                self.name
            )));
        }
        Ok(pos as ClassId)
    }

    pub fn get_alloc_class(&self, id: ClassId) -> Result<&AllocationClass> {
        self.classes.get(id as usize).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "pool '{}' has no allocation class {}",
                self.name, id
            ))
        })
    }

    pub fn get_alloc_size(&self, id: ClassId) -> Result<u32> {
        self.get_alloc_class(id).map(|c| c.alloc_size())
    }

    /// Serve an allocation of `size` bytes, `None` when neither the class's
    /// free list nor the pool's budget can provide one.
    pub(crate) fn allocate(&self, size: u32) -> Result<Option<*mut u8>> {
        let cid = self.classify(size)?;
        let class = &self.classes[cid as usize];
        if let Some(ptr) = class.allocate() {
            return Ok(Some(ptr));
        }

        // class exhausted: pull one slab from the slab allocator, if the
        // budget allows
        let mut budget = self.budget.lock().unwrap();
        if budget.current_size + SLAB_SIZE > budget.target_size {
            return Ok(None);
        }
        let (idx, base) = match self.slab_allocator.acquire_free_slab() {
            Some(slab) => slab,
            None => return Ok(None),
        };
        budget.current_size += SLAB_SIZE;
        self.slab_allocator
            .assign_slab(idx, self.pool_id, cid, class.alloc_size());
        drop(budget);

        debug!(pool = self.pool_id, class = cid, slab = idx, "grew class");
        Ok(Some(class.add_slab(idx, base)))
    }

    /// Return an allocation to the class owning its slab
    pub(crate) fn free(&self, ptr: *mut u8) -> Result<()> {
        let header = self.slab_allocator.slab_header(ptr).ok_or_else(|| {
            Error::InvalidArgument(format!("pointer {:p} does not belong to the allocator", ptr))
        })?;
        let info = header.alloc_info().ok_or_else(|| {
            Error::InvalidArgument(format!("pointer {:p} is in an unowned slab", ptr))
        })?;
        if info.pool_id != self.pool_id {
            return Err(Error::InvalidArgument(format!(
                "pointer {:p} belongs to pool {}, not pool {}",
                ptr, info.pool_id, self.pool_id
            )));
        }
        self.get_alloc_class(info.class_id)?.free(ptr)
    }

    /// Set a new byte target. A target below `current_size` leaves the pool
    /// over limit; reclamation happens through slab releases driven by the
    /// caller. Only the pool manager calls this, keeping the global
    /// reserved-plus-unreserved invariant intact.
    pub(crate) fn resize(&self, target_size: usize) {
        let mut budget = self.budget.lock().unwrap();
        budget.target_size = target_size;
        debug!(pool = self.pool_id, target_size, "resized pool");
    }

    /// Give back the budget of one slab after a resize-mode release
    pub(crate) fn release_slab_budget(&self) {
        let mut budget = self.budget.lock().unwrap();
        debug_assert!(budget.current_size >= SLAB_SIZE);
        budget.current_size -= SLAB_SIZE;
    }

    /// True when the pool holds more bytes than its target allows
    pub fn overlimit(&self) -> bool {
        let budget = self.budget.lock().unwrap();
        budget.current_size > budget.target_size
    }

    /// True when the pool cannot pull another slab within its target
    pub fn all_slabs_allocated(&self) -> bool {
        let budget = self.budget.lock().unwrap();
        budget.current_size + SLAB_SIZE > budget.target_size
    }

    pub(crate) fn for_each_allocation(
        &self,
        class_id: ClassId,
        slab_idx: usize,
        callback: &mut dyn FnMut(*mut u8, AllocInfo) -> SlabIterationStatus,
    ) -> SlabIterationStatus {
        match self.classes.get(class_id as usize) {
            Some(class) => class.for_each_allocation(slab_idx, callback),
            None => SlabIterationStatus::SkipCurrentSlabAndContinue,
        }
    }

    /// Budget and per-class usage snapshot
    pub fn stats(&self) -> PoolStats {
        let (target_size, current_size) = {
            let budget = self.budget.lock().unwrap();
            (budget.target_size, budget.current_size)
        };
        PoolStats {
            pool_id: self.pool_id,
            name: self.name.clone(),
            target_size,
            current_size,
            classes: self
                .classes
                .iter()
                .map(|c| ClassStats {
                    class_id: c.class_id(),
                    alloc_size: c.alloc_size(),
                    slabs_held: c.held_slab_count(),
                    free_allocs: c.free_alloc_count(),
                })
                .collect(),
        }
    }
}

/// Usage snapshot of one pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub pool_id: PoolId,
    pub name: String,
    pub target_size: usize,
    pub current_size: usize,
    pub classes: Vec<ClassStats>,
}

/// Usage snapshot of one allocation class
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ClassStats {
    pub class_id: ClassId,
    pub alloc_size: u32,
    pub slabs_held: usize,
    pub free_allocs: usize,
}
