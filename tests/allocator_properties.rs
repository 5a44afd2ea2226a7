// this_file: tests/allocator_properties.rs
//! Allocator behaviour over longer operation sequences

use std::sync::Arc;
use std::thread;
use surfpool::{AllocatorConfig, BlockAllocator, BlockHandle, HeapProvider};

fn allocator(chunk: usize, page: usize) -> (Arc<HeapProvider>, Arc<BlockAllocator>) {
    let provider = Arc::new(HeapProvider::new());
    let config = AllocatorConfig {
        default_chunk_size: chunk,
        page_size: page,
        panic_on_invariant_violation: false,
    };
    let alloc = BlockAllocator::new(provider.clone(), config).unwrap();
    (provider, alloc)
}

/// Small deterministic generator so sequences are reproducible.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 33
    }
}

#[test]
fn free_bytes_are_conserved() {
    let (provider, alloc) = allocator(64 * 1024, 4096);
    // Pin the first chunk so its free byte count is observable afterwards.
    let pin = alloc.allocate(16).unwrap();
    let baseline = alloc.stats();

    let mut rng = Lcg(7);
    let mut live: Vec<BlockHandle> = Vec::new();
    for _ in 0..2000 {
        if live.is_empty() || rng.next() % 3 != 0 {
            let size = 1 + (rng.next() % 20_000) as usize;
            live.push(alloc.allocate(size).unwrap());
        } else {
            let idx = (rng.next() as usize) % live.len();
            alloc.free(live.swap_remove(idx)).unwrap();
        }
    }
    alloc.check_consistency().unwrap();

    while let Some(handle) = live.pop() {
        alloc.free(handle).unwrap();
    }
    alloc.check_consistency().unwrap();

    let after = alloc.stats();
    assert_eq!(after.free_bytes, baseline.free_bytes);
    assert_eq!(after.chunks, 1);
    assert_eq!(after.free_blocks, 1);

    alloc.free(pin).unwrap();
    assert_eq!(provider.live_regions(), 0);
}

#[test]
fn coalescing_is_order_independent() {
    for reversed in [false, true] {
        let (_provider, alloc) = allocator(4096, 4096);
        let a = alloc.allocate(100).unwrap();
        let b = alloc.allocate(200).unwrap();
        let _tail = alloc.allocate(4096 - 300).unwrap();

        if reversed {
            alloc.free(b).unwrap();
            alloc.free(a).unwrap();
        } else {
            alloc.free(a).unwrap();
            alloc.free(b).unwrap();
        }

        let free = alloc.free_blocks();
        assert_eq!(free.len(), 1, "reversed = {}", reversed);
        assert_eq!((free[0].offset, free[0].size), (0, 300));
    }
}

#[test]
fn best_fit_never_takes_the_largest_block() {
    let (_provider, alloc) = allocator(300, 1);
    let a = alloc.allocate(100).unwrap();
    let _gap1 = alloc.allocate(10).unwrap();
    let b = alloc.allocate(50).unwrap();
    let _gap2 = alloc.allocate(10).unwrap();
    let c = alloc.allocate(30).unwrap();
    let _tail = alloc.allocate(100).unwrap();
    for h in [a, b, c] {
        alloc.free(h).unwrap();
    }

    let chosen = alloc.allocate(40).unwrap();
    assert_eq!(chosen.offset(), 110);
    let free: Vec<(usize, usize)> = alloc
        .free_blocks()
        .iter()
        .map(|f| (f.offset, f.size))
        .collect();
    assert_eq!(free, vec![(0, 100), (150, 10), (170, 30)]);
}

#[test]
fn last_free_releases_chunk_exactly_once() {
    let (provider, alloc) = allocator(8192, 4096);
    let blocks: Vec<_> = (0..8).map(|_| alloc.allocate(1000).unwrap()).collect();
    assert_eq!(alloc.stats().chunks, 1);

    for handle in blocks {
        alloc.free(handle).unwrap();
    }
    assert_eq!(provider.stats().regions_released, 1);
    assert_eq!(alloc.stats().chunks, 0);

    // A fresh allocation starts a new chunk.
    let again = alloc.allocate(10).unwrap();
    assert_eq!(provider.stats().regions_allocated, 2);
    alloc.free(again).unwrap();
    assert_eq!(provider.stats().regions_released, 2);
}

#[test]
fn concurrent_allocate_and_free_stay_consistent() {
    let (provider, alloc) = allocator(256 * 1024, 4096);
    let workers: Vec<_> = (0..8u64)
        .map(|seed| {
            let alloc = Arc::clone(&alloc);
            thread::spawn(move || {
                let mut rng = Lcg(seed + 1);
                let mut live = Vec::new();
                for _ in 0..500 {
                    if live.len() < 16 && rng.next() % 2 == 0 {
                        let size = 64 + (rng.next() % 8192) as usize;
                        live.push(alloc.allocate(size).unwrap());
                    } else if let Some(handle) = live.pop() {
                        alloc.free(handle).unwrap();
                    }
                }
                for handle in live {
                    alloc.free(handle).unwrap();
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }

    alloc.check_consistency().unwrap();
    assert_eq!(alloc.stats().chunks, 0);
    assert_eq!(provider.live_regions(), 0);
    let stats = provider.stats();
    assert_eq!(stats.regions_allocated, stats.regions_released);
}
