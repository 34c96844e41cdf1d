//! Throughput checks for the allocation hot path

#[cfg(test)]
mod bench {
    use crate::allocator::{AllocatorConfig, MemoryAllocator, SLAB_SIZE};
    use std::time::Instant;

    /// Benchmark allocate/free throughput on a single class
    #[test]
    fn bench_allocate_free_cycle() {
        let ma =
            MemoryAllocator::with_owned_memory(AllocatorConfig::default(), 16 * SLAB_SIZE).unwrap();
        let pool = ma
            .add_pool("bench", 16 * SLAB_SIZE, &[128u32].into_iter().collect(), false)
            .unwrap();

        // warm up: carve every slab
        let mut held = Vec::new();
        while let Some(p) = ma.allocate(pool, 128).unwrap() {
            held.push(p);
        }
        println!("carved {} allocations of 128B", held.len());

        let start = Instant::now();
        for &p in &held {
            ma.free(p).unwrap();
        }
        let elapsed = start.elapsed();
        println!("freed {} allocations in {:?}", held.len(), elapsed);

        let start = Instant::now();
        for _ in 0..held.len() {
            ma.allocate(pool, 128).unwrap().unwrap();
        }
        let elapsed = start.elapsed();
        println!(
            "re-allocated {} chunks from the free list in {:?}",
            held.len(),
            elapsed
        );
    }

    /// Benchmark pointer introspection, the constant-time header lookup
    #[test]
    fn bench_get_alloc_info() {
        let ma =
            MemoryAllocator::with_owned_memory(AllocatorConfig::default(), 4 * SLAB_SIZE).unwrap();
        let pool = ma
            .add_pool("bench", 4 * SLAB_SIZE, &[4096u32].into_iter().collect(), false)
            .unwrap();
        let p = ma.allocate(pool, 4096).unwrap().unwrap();

        let start = Instant::now();
        let rounds = 1_000_000;
        for _ in 0..rounds {
            let info = ma.get_alloc_info(p).unwrap();
            assert_eq!(info.alloc_size, 4096);
        }
        let elapsed = start.elapsed();
        println!("{} header lookups in {:?}", rounds, elapsed);
    }
}
