//! Slab allocator: contiguous-memory bookkeeping
//!
//! Divides a caller-provided memory region into 4 MiB slabs and maintains the
//! parallel header array. Higher layers use [`SlabAllocator::slab_header`] to
//! answer "which pool and class does this pointer belong to?" in constant time
//! from the pointer's address alone; no per-allocation metadata exists.

use super::slab::{ClassId, PoolId, SlabHeader, ALIGNMENT, SLAB_SIZE};
use crate::error::{Error, Result};
use std::sync::Mutex;
use tracing::debug;

/// Divides a contiguous memory region into slabs and owns their headers
///
/// Both backing regions are supplied at construction and owned by the caller
/// for the allocator's lifetime. The free-slab list and header mutations are
/// protected by a single mutex; header reads are lock-free.
pub struct SlabAllocator {
    /// Base of the slab region
    slab_region: *mut u8,
    /// Number of usable slabs
    num_slabs: usize,
    /// Header array, one entry per slab, in caller-provided memory
    headers: *mut SlabHeader,
    /// Indices of slabs not owned by any pool
    free: Mutex<Vec<usize>>,
}

// SAFETY: the raw regions are only mutated under the `free` mutex (free-list
// and header ownership transitions) or through the atomic fields of
// `SlabHeader`. Slab payload memory is handed out to callers and never
// touched by the allocator itself.
unsafe impl Send for SlabAllocator {}
unsafe impl Sync for SlabAllocator {}

impl SlabAllocator {
    /// Create a slab allocator over caller-owned memory.
    ///
    /// `slab_memory` is divided into `floor(slab_memory_size / SLAB_SIZE)`
    /// slabs; `header_memory` must fit one [`SlabHeader`] per slab.
    ///
    /// # Safety
    ///
    /// - Both regions must be valid for reads and writes for the given sizes
    ///   and must not overlap.
    /// - The caller must keep both regions alive and untouched (other than
    ///   through this allocator) for the allocator's lifetime.
    pub unsafe fn new(
        header_memory_start: *mut u8,
        header_memory_size: usize,
        slab_memory_start: *mut u8,
        slab_memory_size: usize,
    ) -> Result<Self> {
        if header_memory_start.is_null() || slab_memory_start.is_null() {
            return Err(Error::InvalidArgument(
                "memory regions must be non-null".to_string(),
            ));
        }
        if slab_memory_start as usize % ALIGNMENT != 0 {
            return Err(Error::InvalidArgument(format!(
                "slab region base {:p} is not {}-byte aligned",
                slab_memory_start, ALIGNMENT
            )));
        }
        if header_memory_start as usize % std::mem::align_of::<SlabHeader>() != 0 {
            return Err(Error::InvalidArgument(
                "header region base is misaligned for slab headers".to_string(),
            ));
        }

        let num_slabs = slab_memory_size / SLAB_SIZE;
        if num_slabs == 0 {
            return Err(Error::InvalidArgument(format!(
                "slab region of {} bytes holds no {}-byte slab",
                slab_memory_size, SLAB_SIZE
            )));
        }
        let needed = num_slabs * std::mem::size_of::<SlabHeader>();
        if header_memory_size < needed {
            return Err(Error::InvalidArgument(format!(
                "header region of {} bytes cannot hold {} headers ({} bytes needed)",
                header_memory_size, num_slabs, needed
            )));
        }

        let headers = header_memory_start as *mut SlabHeader;
        for i in 0..num_slabs {
            // SAFETY: bounds checked against header_memory_size above
            unsafe { headers.add(i).write(SlabHeader::new()) };
        }

        debug!(
            num_slabs,
            slab_size = SLAB_SIZE,
            "initialized slab allocator"
        );

        Ok(Self {
            slab_region: slab_memory_start,
            num_slabs,
            headers,
            // reversed so slab 0 is handed out first
            free: Mutex::new((0..num_slabs).rev().collect()),
        })
    }

    /// Number of usable slabs in the backing region
    pub fn usable_slab_count(&self) -> usize {
        self.num_slabs
    }

    /// Number of slabs not owned by any pool
    pub fn free_slab_count(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    /// True once every slab is owned by some pool
    pub fn all_slabs_allocated(&self) -> bool {
        self.free.lock().unwrap().is_empty()
    }

    /// Total usable memory in bytes
    pub fn memory_size(&self) -> usize {
        self.num_slabs * SLAB_SIZE
    }

    /// Base address of slab `idx`
    pub fn slab_for_index(&self, idx: usize) -> Result<*mut u8> {
        if idx >= self.num_slabs {
            return Err(Error::InvalidArgument(format!(
                "slab index {} out of range ({} slabs)",
                idx, self.num_slabs
            )));
        }
        // SAFETY: idx bounds-checked against the region size
        Ok(unsafe { self.slab_region.add(idx * SLAB_SIZE) })
    }

    /// Index of the slab containing `ptr`, `None` if outside the region
    pub fn index_for_slab(&self, ptr: *const u8) -> Option<usize> {
        let base = self.slab_region as usize;
        let addr = ptr as usize;
        if addr < base {
            return None;
        }
        let idx = (addr - base) / SLAB_SIZE;
        (idx < self.num_slabs).then_some(idx)
    }

    /// Header of slab `idx`
    pub fn header_for_index(&self, idx: usize) -> Option<&SlabHeader> {
        if idx >= self.num_slabs {
            return None;
        }
        // SAFETY: headers array holds num_slabs initialized entries; shared
        // references are sound because all header fields are atomic
        Some(unsafe { &*self.headers.add(idx) })
    }

    /// Header of the slab containing `ptr`, `None` if the pointer does not
    /// belong to this allocator. Constant time, lock-free.
    pub fn slab_header(&self, ptr: *const u8) -> Option<&SlabHeader> {
        self.index_for_slab(ptr)
            .and_then(|idx| self.header_for_index(idx))
    }

    /// Pop an unowned slab, `None` when every slab is owned
    pub fn acquire_free_slab(&self) -> Option<(usize, *mut u8)> {
        let idx = self.free.lock().unwrap().pop()?;
        let hdr = self.header_for_index(idx).expect("free index in range");
        hdr.reset();
        // SAFETY: idx came from the free list, always < num_slabs
        let base = unsafe { self.slab_region.add(idx * SLAB_SIZE) };
        debug!(slab = idx, "acquired free slab");
        Some((idx, base))
    }

    /// Return slab `idx` to the free pool, clearing its header
    pub fn release_slab(&self, idx: usize) -> Result<()> {
        if idx >= self.num_slabs {
            return Err(Error::InvalidArgument(format!(
                "slab index {} out of range ({} slabs)",
                idx, self.num_slabs
            )));
        }
        let mut free = self.free.lock().unwrap();
        self.header_for_index(idx)
            .expect("index bounds checked")
            .reset();
        free.push(idx);
        debug!(slab = idx, "released slab");
        Ok(())
    }

    /// Record ownership transition of slab `idx` to `(pool, class)`.
    pub(crate) fn assign_slab(&self, idx: usize, pool: PoolId, class: ClassId, alloc_size: u32) {
        let _guard = self.free.lock().unwrap();
        self.header_for_index(idx)
            .expect("assigned index in range")
            .assign(pool, class, alloc_size);
        debug!(slab = idx, pool, class, alloc_size, "assigned slab");
    }

    /// Number of slabs whose memory is currently advised away
    pub fn advised_slab_count(&self) -> usize {
        (0..self.num_slabs)
            .filter(|&i| self.header_for_index(i).map(|h| h.is_advised()).unwrap_or(false))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::TestRegion;
    use super::*;

    #[test]
    fn test_construction_counts_slabs() {
        let region = TestRegion::new(4);
        let sa = region.slab_allocator();
        assert_eq!(sa.usable_slab_count(), 4);
        assert_eq!(sa.free_slab_count(), 4);
        assert_eq!(sa.memory_size(), 4 * SLAB_SIZE);
        assert!(!sa.all_slabs_allocated());
    }

    #[test]
    fn test_rejects_undersized_regions() {
        let region = TestRegion::new(2);
        // slab region smaller than one slab
        let err = unsafe {
            SlabAllocator::new(
                region.header_ptr,
                region.header_layout.size(),
                region.slab_ptr,
                SLAB_SIZE - 1,
            )
        };
        assert!(err.is_err());

        // header region too small for two slabs
        let err = unsafe {
            SlabAllocator::new(
                region.header_ptr,
                std::mem::size_of::<SlabHeader>() - 1,
                region.slab_ptr,
                2 * SLAB_SIZE,
            )
        };
        assert!(err.is_err());
    }

    #[test]
    fn test_header_lookup_is_address_arithmetic() {
        let region = TestRegion::new(3);
        let sa = region.slab_allocator();

        let base1 = sa.slab_for_index(1).unwrap();
        // any pointer inside slab 1 resolves to header 1
        let inside = unsafe { base1.add(SLAB_SIZE / 2) };
        assert_eq!(sa.index_for_slab(inside), Some(1));

        // last byte of the region still resolves; one past does not
        let last = unsafe { sa.slab_for_index(2).unwrap().add(SLAB_SIZE - 1) };
        assert_eq!(sa.index_for_slab(last), Some(2));
        let past = unsafe { sa.slab_for_index(2).unwrap().add(SLAB_SIZE) };
        assert_eq!(sa.index_for_slab(past), None);

        // pointers outside the region return the not-found sentinel
        let outside = 0x10usize as *const u8;
        assert!(sa.slab_header(outside).is_none());
    }

    #[test]
    fn test_acquire_and_release_roundtrip() {
        let region = TestRegion::new(2);
        let sa = region.slab_allocator();

        let (idx0, _) = sa.acquire_free_slab().unwrap();
        assert_eq!(idx0, 0);
        let (idx1, _) = sa.acquire_free_slab().unwrap();
        assert_eq!(idx1, 1);
        assert!(sa.all_slabs_allocated());
        assert!(sa.acquire_free_slab().is_none());

        sa.assign_slab(idx0, 2, 5, 512);
        let hdr = sa.header_for_index(idx0).unwrap();
        assert_eq!(hdr.pool_id(), 2);
        assert_eq!(hdr.class_id(), 5);

        sa.release_slab(idx0).unwrap();
        assert!(sa.header_for_index(idx0).unwrap().is_unassigned());
        assert_eq!(sa.free_slab_count(), 1);
    }

    #[test]
    fn test_slab_for_index_out_of_range() {
        let region = TestRegion::new(1);
        let sa = region.slab_allocator();
        assert!(sa.slab_for_index(1).is_err());
        assert!(sa.release_slab(9).is_err());
    }
}
