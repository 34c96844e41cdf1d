//! Slab Memory Allocator
//!
//! Partitions a contiguous memory region into fixed-size slabs and serves
//! variable-size allocations out of named memory pools.
//!
//! # Architecture
//!
//! ```text
//! MemoryAllocator
//!   └─→ MemoryPoolManager          (named pools, global slab budget)
//!         ├─→ MemoryPool "hot"     (target: 8 GiB)
//!         │     ├─→ AllocationClass(128B)  → Free: [0x7f..00, 0x7f..80]
//!         │     └─→ AllocationClass(256B)  → Free: [0x7f..40]
//!         └─→ MemoryPool "cold"    (target: 2 GiB)
//!
//! SlabAllocator
//!   ├─→ slab region  [slab 0 | slab 1 | slab 2 | ...]   (4 MiB each)
//!   └─→ header array [hdr 0  | hdr 1  | hdr 2  | ...]   (pool, class, size, flags)
//! ```
//!
//! Every slab in use is owned by exactly one allocation class. A pointer is
//! resolved to its pool and class in constant time from its address alone via
//! the header array. Slabs can be released from a class while allocations are
//! still outstanding; see [`SlabReleaseContext`].

pub mod alloc_class;
pub mod bench;
pub mod memory_allocator;
pub mod pool;
pub mod pool_manager;
pub mod release;
pub mod size_class;
pub mod slab;
pub mod slab_allocator;

pub use alloc_class::AllocationClass;
pub use memory_allocator::{AllocatorConfig, AllocatorStats, MemoryAllocator};
pub use pool::{ClassStats, MemoryPool, PoolStats};
pub use pool_manager::MemoryPoolManager;
pub use release::{SlabIterationStatus, SlabReleaseContext, SlabReleaseMode};
pub use size_class::generate_alloc_sizes;
pub use slab::{
    AllocInfo, ClassId, PoolId, SlabHeader, ALIGNMENT, INVALID_CLASS_ID, INVALID_POOL_ID,
    MAX_CLASSES, MAX_CLASS_ID, MAX_POOLS, MAX_POOL_ID, SLAB_SIZE,
};
pub use slab_allocator::SlabAllocator;

#[cfg(test)]
pub(crate) mod test_util {
    use super::slab_allocator::SlabAllocator;
    use super::slab::{SlabHeader, SLAB_SIZE};
    use std::alloc::{alloc, dealloc, Layout};
    use std::sync::Arc;

    /// Caller-owned backing regions for a [`SlabAllocator`] under test.
    ///
    /// Frees both regions on drop, so the allocator built from it must not
    /// outlive this struct.
    pub(crate) struct TestRegion {
        pub header_ptr: *mut u8,
        pub header_layout: Layout,
        pub slab_ptr: *mut u8,
        pub slab_layout: Layout,
    }

    unsafe impl Send for TestRegion {}

    impl TestRegion {
        pub(crate) fn new(num_slabs: usize) -> Self {
            let header_layout = Layout::array::<SlabHeader>(num_slabs).unwrap();
            let slab_layout = Layout::from_size_align(num_slabs * SLAB_SIZE, SLAB_SIZE).unwrap();
            let header_ptr = unsafe { alloc(header_layout) };
            let slab_ptr = unsafe { alloc(slab_layout) };
            assert!(!header_ptr.is_null() && !slab_ptr.is_null());
            Self {
                header_ptr,
                header_layout,
                slab_ptr,
                slab_layout,
            }
        }

        pub(crate) fn slab_allocator(&self) -> Arc<SlabAllocator> {
            let sa = unsafe {
                SlabAllocator::new(
                    self.header_ptr,
                    self.header_layout.size(),
                    self.slab_ptr,
                    self.slab_layout.size(),
                )
            }
            .unwrap();
            Arc::new(sa)
        }
    }

    impl Drop for TestRegion {
        fn drop(&mut self) {
            unsafe {
                dealloc(self.header_ptr, self.header_layout);
                dealloc(self.slab_ptr, self.slab_layout);
            }
        }
    }
}
