//! Allocation-size generator
//!
//! Produces the default set of allocation-class sizes for a pool: geometric
//! growth from `min_size` by `factor`, every size rounded up to the pointer
//! alignment. With `reduce_fragmentation` each size is additionally snapped
//! up to the largest value that keeps the same number of chunks per slab, so
//! the unusable tail of each slab shrinks.

use super::slab::{ALIGNMENT, SLAB_SIZE};
use crate::error::{Error, Result};
use std::collections::BTreeSet;

fn align_up(size: u32) -> u32 {
    let align = ALIGNMENT as u32;
    size.div_ceil(align) * align
}

fn align_down(size: u32) -> u32 {
    let align = ALIGNMENT as u32;
    size / align * align
}

/// Largest aligned size with the same chunks-per-slab count as `size`
fn snap_to_chunk_boundary(size: u32) -> u32 {
    let chunks = SLAB_SIZE / size as usize;
    let snapped = align_down((SLAB_SIZE / chunks) as u32);
    snapped.max(size)
}

/// Generate a default set of allocation sizes.
///
/// Starts at `min_size` and repeatedly multiplies by `factor` until the size
/// exceeds `max_size`. Every produced size is a multiple of [`ALIGNMENT`].
///
/// Fails if `factor <= 1.0`, if `max_size` exceeds the slab size, if
/// `min_size` is out of range, or if `reduce_fragmentation` and `factor`
/// combine such that no growth occurs between consecutive sizes.
pub fn generate_alloc_sizes(
    factor: f64,
    min_size: u32,
    max_size: u32,
    reduce_fragmentation: bool,
) -> Result<BTreeSet<u32>> {
    if factor <= 1.0 {
        return Err(Error::InvalidArgument(format!(
            "alloc size factor {} must be greater than 1.0",
            factor
        )));
    }
    if max_size as usize > SLAB_SIZE {
        return Err(Error::InvalidArgument(format!(
            "max alloc size {} exceeds slab size {}",
            max_size, SLAB_SIZE
        )));
    }
    if min_size < ALIGNMENT as u32 || min_size > max_size {
        return Err(Error::InvalidArgument(format!(
            "min alloc size {} must lie in [{}, {}]",
            min_size, ALIGNMENT, max_size
        )));
    }

    let mut sizes = BTreeSet::new();
    let mut size = align_up(min_size);
    let mut last_inserted = 0u32;
    while size <= max_size {
        let inserted = if reduce_fragmentation {
            snap_to_chunk_boundary(size)
        } else {
            size
        };
        if inserted <= last_inserted {
            return Err(Error::InvalidArgument(format!(
                "factor {} yields no growth between alloc sizes {} and {}",
                factor, last_inserted, inserted
            )));
        }
        sizes.insert(inserted);
        last_inserted = inserted;

        let next = align_up((size as f64 * factor).ceil() as u32);
        if next <= size {
            return Err(Error::InvalidArgument(format!(
                "factor {} yields no growth from alloc size {}",
                factor, size
            )));
        }
        size = next;
    }
    Ok(sizes)
}
