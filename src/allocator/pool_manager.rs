//! Memory pool manager: named pool directory and global slab budget
//!
//! Enforces the one global invariant of the allocator:
//! `sum of pool targets + bytes unreserved == total usable bytes`.
//! Growing, shrinking, and transferring bytes between pools only move
//! targets; no slab moves until a release is driven against an over-limit
//! pool.

use super::pool::MemoryPool;
use super::slab::{PoolId, MAX_POOLS, SLAB_SIZE};
use super::slab_allocator::SlabAllocator;
use crate::error::{Error, Result};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{info, warn};

struct ManagerState {
    /// Bytes not reserved by any pool's target
    bytes_unreserved: usize,
    name_index: HashMap<String, PoolId>,
}

/// Named registry of memory pools sharing one slab budget
pub struct MemoryPoolManager {
    /// Append-only pool directory; index equals pool id
    pools: RwLock<Vec<Arc<MemoryPool>>>,
    state: Mutex<ManagerState>,
    slab_allocator: Arc<SlabAllocator>,
}

impl MemoryPoolManager {
    pub(crate) fn new(slab_allocator: Arc<SlabAllocator>) -> Self {
        Self {
            pools: RwLock::new(Vec::new()),
            state: Mutex::new(ManagerState {
                bytes_unreserved: slab_allocator.memory_size(),
                name_index: HashMap::new(),
            }),
            slab_allocator,
        }
    }

    /// Register a new pool and reserve `size` bytes for it.
    ///
    /// With `ensure_provisionable`, `size` must be able to give every
    /// allocation class at least one slab.
    pub fn add_pool(
        &self,
        name: &str,
        size: usize,
        alloc_sizes: &BTreeSet<u32>,
        ensure_provisionable: bool,
    ) -> Result<PoolId> {
        if name.is_empty() {
            return Err(Error::InvalidArgument(
                "pool name must not be empty".to_string(),
            ));
        }
        if ensure_provisionable && size < alloc_sizes.len() * SLAB_SIZE {
            return Err(Error::InvalidArgument(format!(
                "pool '{}' of {} bytes cannot provision one slab to each of {} classes",
                name,
                size,
                alloc_sizes.len()
            )));
        }

        let mut state = self.state.lock().unwrap();
        if state.name_index.contains_key(name) {
            return Err(Error::Logic(format!("pool '{}' already exists", name)));
        }
        if size > state.bytes_unreserved {
            return Err(Error::InvalidArgument(format!(
                "pool '{}' wants {} bytes but only {} are unreserved",
                name, size, state.bytes_unreserved
            )));
        }

        let mut pools = self.pools.write().unwrap();
        if pools.len() >= MAX_POOLS {
            return Err(Error::Logic(format!(
                "cannot add pool '{}': the maximum of {} pools is reached",
                name, MAX_POOLS
            )));
        }
        let pool_id = pools.len() as PoolId;
        let pool = Arc::new(MemoryPool::new(
            pool_id,
            name.to_string(),
            size,
            alloc_sizes,
            Arc::clone(&self.slab_allocator),
        )?);
        pools.push(pool);
        state.bytes_unreserved -= size;
        state.name_index.insert(name.to_string(), pool_id);

        info!(pool = pool_id, name, size, "added pool");
        Ok(pool_id)
    }

    pub fn pool_by_id(&self, id: PoolId) -> Result<Arc<MemoryPool>> {
        self.pools
            .read()
            .unwrap()
            .get(id as usize)
            .cloned()
            .ok_or_else(|| Error::InvalidArgument(format!("unknown pool id {}", id)))
    }

    pub fn pool_id_by_name(&self, name: &str) -> Option<PoolId> {
        self.state.lock().unwrap().name_index.get(name).copied()
    }

    pub fn pool_name_by_id(&self, id: PoolId) -> Result<String> {
        self.pool_by_id(id)
            .map_err(|_| Error::Logic(format!("unknown pool id {}", id)))
            .map(|p| p.name().to_string())
    }

    pub fn pool_ids(&self) -> Vec<PoolId> {
        (0..self.pools.read().unwrap().len() as PoolId).collect()
    }

    pub fn pool_count(&self) -> usize {
        self.pools.read().unwrap().len()
    }

    /// Grow a pool's target by `bytes` out of the unreserved budget.
    /// Returns false when not enough memory is unreserved.
    pub fn grow_pool(&self, id: PoolId, bytes: usize) -> Result<bool> {
        let pool = self.pool_by_id(id)?;
        let mut state = self.state.lock().unwrap();
        if bytes > state.bytes_unreserved {
            warn!(
                pool = id,
                bytes,
                unreserved = state.bytes_unreserved,
                "grow denied"
            );
            return Ok(false);
        }
        state.bytes_unreserved -= bytes;
        pool.resize(pool.target_size() + bytes);
        Ok(true)
    }

    /// Shrink a pool's target by `bytes`, returning them to the unreserved
    /// budget. Returns false when the pool's target is smaller than `bytes`.
    pub fn shrink_pool(&self, id: PoolId, bytes: usize) -> Result<bool> {
        let pool = self.pool_by_id(id)?;
        let mut state = self.state.lock().unwrap();
        let target = pool.target_size();
        if bytes > target {
            return Ok(false);
        }
        pool.resize(target - bytes);
        state.bytes_unreserved += bytes;
        Ok(true)
    }

    /// Move `bytes` of target from `src` to `dst` atomically.
    /// Returns false when `src` does not have `bytes` of target to give.
    pub fn resize_pools(&self, src: PoolId, dst: PoolId, bytes: usize) -> Result<bool> {
        let src_pool = self.pool_by_id(src)?;
        let dst_pool = self.pool_by_id(dst)?;
        // all target mutations happen under the manager lock, so the
        // shrink-then-grow pair is atomic with respect to other transfers
        let _state = self.state.lock().unwrap();
        let src_target = src_pool.target_size();
        if bytes > src_target {
            return Ok(false);
        }
        src_pool.resize(src_target - bytes);
        dst_pool.resize(dst_pool.target_size() + bytes);
        info!(src, dst, bytes, "moved pool budget");
        Ok(true)
    }

    /// Pools currently holding more slab bytes than their target allows
    pub fn get_pools_over_limit(&self) -> Vec<PoolId> {
        self.pools
            .read()
            .unwrap()
            .iter()
            .filter(|p| p.overlimit())
            .map(|p| p.pool_id())
            .collect()
    }

    /// Bytes not reserved by any pool
    pub fn bytes_unreserved(&self) -> usize {
        self.state.lock().unwrap().bytes_unreserved
    }

    /// Bytes of slab memory currently advised away to the OS
    pub fn advised_memory_size(&self) -> usize {
        self.slab_allocator.advised_slab_count() * SLAB_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::TestRegion;
    use super::*;

    fn sizes() -> BTreeSet<u32> {
        [128u32, 256].into_iter().collect()
    }

    fn manager(region: &TestRegion) -> MemoryPoolManager {
        MemoryPoolManager::new(region.slab_allocator())
    }

    #[test]
    fn test_add_pool_assigns_sequential_ids() -> Result<()> {
        let region = TestRegion::new(4);
        let mgr = manager(&region);

        assert_eq!(mgr.add_pool("a", SLAB_SIZE, &sizes(), false)?, 0);
        assert_eq!(mgr.add_pool("b", SLAB_SIZE, &sizes(), false)?, 1);
        assert_eq!(mgr.pool_count(), 2);
        assert_eq!(mgr.pool_ids(), vec![0, 1]);
        assert_eq!(mgr.pool_id_by_name("b"), Some(1));
        assert_eq!(mgr.pool_name_by_id(0)?, "a");
        assert!(mgr.pool_name_by_id(5).is_err());
        Ok(())
    }

    #[test]
    fn test_add_pool_rejections() {
        let region = TestRegion::new(2);
        let mgr = manager(&region);

        assert!(mgr.add_pool("", SLAB_SIZE, &sizes(), false).is_err());
        mgr.add_pool("a", SLAB_SIZE, &sizes(), false).unwrap();
        // duplicate name
        assert!(matches!(
            mgr.add_pool("a", SLAB_SIZE, &sizes(), false),
            Err(Error::Logic(_))
        ));
        // more than the remaining budget
        assert!(mgr.add_pool("b", 2 * SLAB_SIZE, &sizes(), false).is_err());
        // provisionability: 1 slab cannot cover 2 classes
        assert!(mgr.add_pool("c", SLAB_SIZE, &sizes(), true).is_err());
    }

    #[test]
    fn test_budget_invariant_across_transfers() -> Result<()> {
        let region = TestRegion::new(4);
        let mgr = manager(&region);
        let total = 4 * SLAB_SIZE;

        let a = mgr.add_pool("a", 2 * SLAB_SIZE, &sizes(), false)?;
        let b = mgr.add_pool("b", SLAB_SIZE, &sizes(), false)?;

        let check = |mgr: &MemoryPoolManager| {
            let reserved: usize = mgr
                .pool_ids()
                .iter()
                .map(|&id| mgr.pool_by_id(id).unwrap().target_size())
                .sum();
            assert_eq!(reserved + mgr.bytes_unreserved(), total);
        };
        check(&mgr);

        assert!(mgr.grow_pool(a, SLAB_SIZE)?);
        check(&mgr);
        assert!(!mgr.grow_pool(a, SLAB_SIZE)?); // nothing unreserved left
        check(&mgr);

        assert!(mgr.shrink_pool(a, 2 * SLAB_SIZE)?);
        check(&mgr);
        assert!(!mgr.shrink_pool(b, 2 * SLAB_SIZE)?); // target too small
        check(&mgr);

        assert!(mgr.resize_pools(a, b, SLAB_SIZE)?);
        check(&mgr);
        assert!(!mgr.resize_pools(b, a, 3 * SLAB_SIZE)?);
        check(&mgr);

        assert!(mgr.grow_pool(77, SLAB_SIZE).is_err());
        Ok(())
    }

    #[test]
    fn test_over_limit_tracking() -> Result<()> {
        let region = TestRegion::new(2);
        let mgr = manager(&region);
        let a = mgr.add_pool("a", 2 * SLAB_SIZE, &sizes(), false)?;
        let pool = mgr.pool_by_id(a)?;

        // fill the pool, then shrink its target underneath it
        while pool.allocate(128)?.is_some() {}
        assert_eq!(pool.current_size(), 2 * SLAB_SIZE);
        assert!(mgr.get_pools_over_limit().is_empty());

        assert!(mgr.shrink_pool(a, SLAB_SIZE)?);
        assert_eq!(mgr.get_pools_over_limit(), vec![a]);
        Ok(())
    }
}
